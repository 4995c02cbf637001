//! Relocation finalizer for documents still living outside the dated bucket.

use chrono::NaiveDate;

use kvitto_core::{DocState, DocumentRepository, Result};
use kvitto_store::ContentStore;

use crate::extract::document_rel_path;

/// Move a collected document's file into the dated bucket and record the
/// new location.
///
/// Returns whether a move happened. `false` covers every already-handled
/// case: the document is past `collected`, the file is already under the
/// bucket, or it is gone (a prior partial run moved it).
pub async fn finalize_collected_move(
    registry: &dyn DocumentRepository,
    store: &ContentStore,
    id: uuid::Uuid,
    date: NaiveDate,
) -> Result<bool> {
    let doc = registry.get(id).await?;
    if doc.state != DocState::Collected {
        return Ok(false);
    }

    let src_rel = document_rel_path(&doc.source_path, &doc.stored_filename)?;
    let result = store
        .move_into_bucket(&src_rel, date, &doc.content_hash, false)
        .await?;

    if result.moved {
        registry
            .update_location(id, result.dst_rel.parent(), result.dst_rel.file_name())
            .await?;
    }
    Ok(result.moved)
}
