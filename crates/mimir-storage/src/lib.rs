mod apply;
pub mod codec;
pub mod fjall;
pub mod keys;
pub mod mem;
pub mod retention;
pub mod traits;
pub mod types;

pub use retention::{PinGuard, PinRegistry, RetentionTask};
pub use traits::{LogStorage, StateMachineStore};
pub use types::{
    ApplyOutcome, LogEntry, LogId, LogState, RetentionPolicy, Snapshot, SnapshotMeta, VersionRef,
    Vote,
};
