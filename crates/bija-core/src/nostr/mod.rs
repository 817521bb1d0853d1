pub mod ingest;
pub mod worker;

pub use ingest::{ingest_event, IngestOutcome};
pub use worker::{Completion, NostrCommand, NostrWorker};
