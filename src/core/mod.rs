pub mod propagator;
pub mod reconciler;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod walker;

pub use propagator::{ActionOutcome, ActionResult, PropagateConfig, PropagateOutcome, Propagator};
pub use reconciler::{Action, ActionKind, PlanSummary, Reconciler};
pub use session::{PlannedAction, ProgressEvent, RunStatus, SyncReport, SyncSession};
pub use snapshot::{Baseline, BaselineEntry, Snapshot};
pub use state::{BaselineStore, RunLock};
pub use walker::{hash_bytes, quick_hash, sampled_hash, TreeWalker, WalkConfig, WalkOutcome};
