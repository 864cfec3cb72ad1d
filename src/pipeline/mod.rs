//! Pipeline core: stage/state enums, the session record, the scheduler
//! interpreter loop and the session store.

pub mod patch;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;

pub use patch::{PatchOp, SessionPatch};
pub use scheduler::{snapshot_capacity, Scheduler, SharedSession};
pub use session::{
    Progress, RetryBudget, Session, SessionMetadata, StageResult, StageResultMetadata,
    TokenCounts, WorkflowError, WorkflowErrorKind, DEFAULT_MAX_RETRIES,
};
pub use state::{Stage, WorkflowState};
pub use store::SessionStore;
pub use stream::SessionStream;
