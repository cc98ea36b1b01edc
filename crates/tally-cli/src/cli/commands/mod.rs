//! Command implementations.

pub mod helpers;
pub mod init;
pub mod reconcile;
pub mod recompute;
pub mod show;
pub mod vote;
pub mod worker;

pub use init::run_init;
pub use reconcile::{run_reconcile, ReconcileTarget};
pub use recompute::run_recompute;
pub use show::run_show;
pub use vote::run_vote;
pub use worker::run_worker;
