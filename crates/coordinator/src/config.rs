//! Coordinator configuration

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a coordinator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Transaction records available at once
    pub transaction_pool_capacity: usize,

    /// Send COMMIT/COMPLETE packed when the participant's record word is known.
    ///
    /// REMOVE_MARKER only exists as a packed sub-signal and is sent packed
    /// whatever this is set to.
    pub use_packed_signals: bool,

    /// Backoff for establishing a transaction
    pub retry: RetryPolicy,

    /// How long a caller waits for the outcome before reporting it unknown
    pub ack_timeout: Duration,

    /// Finished transactions remembered for absorbing late acknowledgements
    pub finished_history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            transaction_pool_capacity: 1024,
            use_packed_signals: true,
            retry: RetryPolicy::default(),
            ack_timeout: Duration::from_secs(30),
            finished_history: 1024,
        }
    }
}

impl CoordinatorConfig {
    pub fn for_testing() -> Self {
        Self {
            transaction_pool_capacity: 16,
            use_packed_signals: true,
            retry: RetryPolicy::for_testing(),
            ack_timeout: Duration::from_secs(2),
            finished_history: 64,
        }
    }
}
