//! Result reconciliation: merging agent output into moving session state.

mod mutation;
mod reconciler;

pub use mutation::SessionMutation;
pub use reconciler::{ReconcileOutcome, Reconciler};
