//! Coordinator side of the commit/abort protocol
//!
//! This crate provides:
//! - Per-transaction records with an acknowledgement ledger per replica
//! - The kernel driving commit, complete and abort through their phases
//! - Bounded retry with exponential backoff for establishing transactions
//! - A runtime attaching the kernel to the network

mod config;
mod coordinator;
mod error;
pub mod kernel;
pub mod retry;
pub mod transaction;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, Result};
pub use kernel::{TcKernel, TcOutbound, TcOutput};
pub use retry::RetryPolicy;
pub use transaction::{
    AbortReason, OperationPlan, Phase, SlotStatus, TransactionOutcome, TransactionPlan,
    TransactionRecord,
};
