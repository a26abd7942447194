//! Reminder reconciliation engine.
//!
//! ```text
//! ReminderScheduler (tokio interval, single flight)
//!   └── DispatchCoordinator::run_pass
//!         ├── CandidateSelector   progress ⋈ preferences ⋈ ledger
//!         ├── route_channels      inbox, plus push when enabled
//!         ├── DeliveryClient(s)   InboxNotifier / ExternalPushSender
//!         └── LedgerStore         record_attempt gate → mark_outcome
//! ```

pub mod coordinator;
pub mod ledger;
pub mod router;
pub mod scheduler;
pub mod selector;
pub mod storage;

pub use coordinator::{DispatchCoordinator, DispatchSettings, PassReport};
pub use ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use scheduler::{PassRunner, ReminderScheduler};
pub use selector::{CandidateSelector, DueCandidates};
pub use storage::{MemoryStorage, PgStorage, StorageQuery, StorageReader};
