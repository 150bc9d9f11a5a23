pub mod config;
pub mod value;
pub mod condition;
pub mod catalog;
pub mod compare;
pub mod reconcile;
pub mod router;
pub mod storage;
pub mod watcher;
pub mod sync;
pub mod error;

pub use catalog::{Catalog, Relation, SyncTable};
pub use condition::Condition;
pub use config::{ConfigFile, Engine};
pub use error::{Result, SyncError};
pub use reconcile::OperationGroup;
pub use storage::{adapter, Storage};
pub use sync::{Orchestrator, PassReport, ShutdownSignal, SyncOutcome};
pub use value::{Row, Value};
