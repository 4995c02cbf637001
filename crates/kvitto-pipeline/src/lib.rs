//! # kvitto-pipeline
//!
//! The processing stages of the kvitto receipt pipeline: intake (directory
//! scan and mailbox collection), text extraction, line vectorization, and
//! brand identification, plus the job coordination layer that wraps every
//! invocation in a lock, a durable JobRun row, and a per-day log file.

pub mod brand;
pub mod coordinator;
pub mod embedder;
pub mod extract;
pub mod mailbox;
pub mod relocate;
pub mod runs;
pub mod scan;
pub mod testing;
pub mod vectorize;

// Re-export commonly used types at crate root
pub use brand::{cosine_similarity, lexical_bonus, score_brands, BrandMetrics, IdentifyBrandStage};
pub use coordinator::{BeginOutcome, JobContext, JobCoordinator};
pub use embedder::HttpEmbedder;
pub use extract::{ExtractMetrics, ExtractStage};
pub use mailbox::{classify, sender_blacklisted, Decision, MailboxCollector, MailboxMetrics};
pub use relocate::finalize_collected_move;
pub use runs::{
    run_dir_scan, run_extract_text, run_identify_brand, run_mailbox_collect, run_vectorize,
    JOB_COLLECT_MAILBOX, JOB_EXTRACT_TEXT, JOB_IDENTIFY_BRAND, JOB_SCAN_RECEIPTS, JOB_VECTORIZE,
};
pub use scan::{DirScanner, ScanMetrics};
pub use vectorize::{VectorizeMetrics, VectorizeStage};
