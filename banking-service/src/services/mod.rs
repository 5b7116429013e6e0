pub mod callback;
pub mod connections;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod sync;

pub use callback::{CallbackParams, OAuthCallbackHandler, VerifiedLink};
pub use connections::{ConnectionManager, LinkStart};
pub use database::PgBankingStore;
pub use memory::InMemoryBankingStore;
pub use metrics::{BankingEvent, EventSink, NoopEventSink, PrometheusEventSink, RecordingEventSink};
pub use store::{BankingStore, LinkCompletion, StatusUpdate, SyncBatchOutcome};
pub use sync::{SyncEngine, SyncReport, SyncSettings};
