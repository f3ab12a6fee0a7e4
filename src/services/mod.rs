//! Ingestion services: deadline dispatch, idempotent processing, topic
//! handlers and missed-feed recovery.

pub mod dispatcher;
pub mod ingest;
pub mod markers;
pub mod processor;
pub mod recovery;

pub use dispatcher::{DeadlineDispatcher, Dispatched};
pub use ingest::{IngestOutcome, IngestPipeline};
pub use markers::{MarkerStatus, ProcessedMarker, ProcessedMarkerStore};
pub use processor::{ProcessOutcome, ResourceRef, TopicProcessor, entity_key};
pub use recovery::{RecoverySettings, RecoveryService};
