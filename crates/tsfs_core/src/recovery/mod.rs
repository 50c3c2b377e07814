//! Crash recovery and offline consistency checking.

mod check;
mod startup;

pub use check::{check_store, CheckReport, Problem};
pub use startup::{recover_store, RecoveryReport};
