//! Participant node configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a participant node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Operation records per receive thread
    pub operation_pool_capacity: usize,

    /// Receive threads that own operations
    pub receive_threads: u32,

    /// Query-only threads; numbered after the receive threads
    pub query_threads: u32,

    /// Finished operations remembered per thread for answering late duplicates
    pub finished_history: usize,

    /// How long the routing agent keeps an unaccounted push-abort record
    pub push_abort_timeout: Duration,

    /// How often the routing agent sweeps expired push-abort records
    pub sweep_interval: Duration,

    /// Acknowledge packed requests with packed frames
    pub use_packed_signals: bool,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            operation_pool_capacity: 4096,
            receive_threads: 4,
            query_threads: 0,
            finished_history: 1024,
            push_abort_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            use_packed_signals: true,
        }
    }
}

impl ParticipantConfig {
    /// Small pools and short timeouts
    pub fn for_testing() -> Self {
        Self {
            operation_pool_capacity: 64,
            receive_threads: 2,
            query_threads: 1,
            finished_history: 64,
            push_abort_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
            use_packed_signals: true,
        }
    }

    /// Total number of thread kernels on the node
    pub fn total_threads(&self) -> u32 {
        self.receive_threads + self.query_threads
    }
}
