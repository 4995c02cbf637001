//! Brand identification stage: `vectorized → brand_identified`.
//!
//! Scoring blends a vector component (nearest line per alias, cosine
//! similarity) with a lexical confirmation bonus (case-insensitive
//! whole-word hits in the document text). Score ties between aliases break
//! deterministically by brand name, then alias, ascending.

use std::time::Instant;

use pgvector::Vector;
use regex::RegexBuilder;
use tracing::debug;

use kvitto_core::{
    AliasEmbedding, BrandMatch, BrandRepository, DocState, DocumentRepository, DocumentScope,
    EventRepository, Line, NewEvent, Result, Step,
};

use crate::coordinator::JobContext;

/// Bonus for a whole-word hit of the winning alias.
const ALIAS_BONUS: f64 = 0.2;

/// Bonus for a whole-word hit of the canonical brand name.
const NAME_BONUS: f64 = 0.1;

/// Lexical bonus cap.
const BONUS_CAP: f64 = 0.3;

/// Weight of the vector component in the final score.
const VEC_WEIGHT: f64 = 0.8;

/// Weight of the lexical bonus in the final score.
const BONUS_WEIGHT: f64 = 0.2;

/// Batch metrics of one brand identification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrandMetrics {
    pub processed: i64,
    pub matched: i64,
    pub unmatched: i64,
    pub errors: i64,
}

/// Round half away from zero to `dp` decimal places.
fn round_to(value: f64, dp: u32) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Cosine similarity of two equal-length vectors; 0.0 when either norm
/// vanishes.
pub fn cosine_similarity(a: &Vector, b: &Vector) -> f64 {
    let a = a.as_slice();
    let b = b.as_slice();
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Case-insensitive whole-word containment test.
fn contains_word(text: &str, word: &str) -> bool {
    if word.trim().is_empty() {
        return false;
    }
    RegexBuilder::new(&format!(r"\b{}\b", regex::escape(word)))
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Lexical confirmation bonus for a winning alias, capped.
pub fn lexical_bonus(text: &str, alias: &str, brand_name: &str) -> f64 {
    let mut bonus = 0.0;
    if contains_word(text, alias) {
        bonus += ALIAS_BONUS;
    }
    if contains_word(text, brand_name) {
        bonus += NAME_BONUS;
    }
    round_to(bonus.min(BONUS_CAP), 3)
}

/// Score all aliases against a document's embedded lines and pick the best.
///
/// Per alias the nearest line by cosine distance defines the vector score;
/// the global maximum wins, with exact ties broken by (brand name, alias)
/// ascending. Returns `None` when there is nothing to score.
pub fn score_brands(
    lines: &[Line],
    aliases: &[AliasEmbedding],
    document_text: &str,
) -> Option<BrandMatch> {
    let mut best: Option<(f64, &AliasEmbedding)> = None;

    for alias in aliases {
        let mut alias_best = f64::NEG_INFINITY;
        for line in lines {
            let Some(embedding) = &line.embedding else {
                continue;
            };
            // distance d = 1 - cos; similarity = clamp(1 - d) = clamp(cos).
            let sim = clamp01(cosine_similarity(embedding, &alias.embedding));
            if sim > alias_best {
                alias_best = sim;
            }
        }
        if alias_best == f64::NEG_INFINITY {
            continue;
        }

        let replace = match &best {
            None => true,
            Some((score, current)) => {
                alias_best > *score
                    || (alias_best == *score
                        && (alias.brand_name.as_str(), alias.alias.as_str())
                            < (current.brand_name.as_str(), current.alias.as_str()))
            }
        };
        if replace {
            best = Some((alias_best, alias));
        }
    }

    let (score_vec, winner) = best?;
    let bonus = lexical_bonus(document_text, &winner.alias, &winner.brand_name);
    let score = round_to(clamp01(VEC_WEIGHT * score_vec + BONUS_WEIGHT * bonus), 4);

    Some(BrandMatch {
        brand_id: winner.brand_id,
        name: winner.brand_name.clone(),
        score_vec: round_to(score_vec, 4),
        regex_bonus: bonus,
        score,
        alias: winner.alias.clone(),
    })
}

/// Brand identification over documents in `vectorized`.
pub struct IdentifyBrandStage;

impl IdentifyBrandStage {
    pub async fn run(
        &self,
        ctx: &mut JobContext,
        registry: &dyn DocumentRepository,
        brands: &dyn BrandRepository,
        events: &dyn EventRepository,
        scope: &DocumentScope,
        dry_run: bool,
    ) -> Result<BrandMetrics> {
        let mut metrics = BrandMetrics::default();

        let docs = registry.list_in_state(DocState::Vectorized, scope).await?;
        let aliases = brands.alias_embeddings().await?;
        ctx.log_info(&format!(
            "identifying brands for {} documents against {} aliases",
            docs.len(),
            aliases.len()
        ));

        for doc in docs {
            metrics.processed += 1;
            ctx.inc_metric("processed", 1).await?;
            let started = Instant::now();

            let lines = registry.embedded_lines(doc.id).await?;
            let text = doc.raw_text.clone().unwrap_or_default();

            let Some(brand_match) = score_brands(&lines, &aliases, &text) else {
                // Nothing to score: document untouched, batch continues.
                metrics.unmatched += 1;
                ctx.inc_metric("unmatched", 1).await?;
                events
                    .record(NewEvent::error(
                        doc.id,
                        Step::IdentifyBrand,
                        "no-brand-found".to_string(),
                    ))
                    .await?;
                continue;
            };

            if dry_run {
                metrics.matched += 1;
                ctx.inc_metric("matched", 1).await?;
                continue;
            }

            match registry
                .set_brand(doc.id, &brand_match, started.elapsed().as_millis() as i64)
                .await
            {
                Ok(()) => {
                    metrics.matched += 1;
                    ctx.inc_metric("matched", 1).await?;
                    debug!(
                        subsystem = "pipeline",
                        component = "identify_brand",
                        document_id = %doc.id,
                        brand = %brand_match.name,
                        score = brand_match.score,
                        "brand identified"
                    );
                }
                Err(e) => {
                    metrics.errors += 1;
                    ctx.inc_metric("errors", 1).await?;
                    events
                        .record(NewEvent::error(doc.id, Step::IdentifyBrand, e.to_string()))
                        .await?;
                    ctx.log_error(&format!(
                        "brand persistence failed for {}: {}",
                        doc.id, e
                    ));
                }
            }
        }

        ctx.log_info(&format!(
            "brand identification finished: processed={} matched={} unmatched={} errors={}",
            metrics.processed, metrics.matched, metrics.unmatched, metrics.errors
        ));
        Ok(metrics)
    }
}
