// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::sync::atomic::{AtomicU64, Ordering};

/// Rate limiter for diagnostics a guest can trigger at will.
///
/// Occurrences are counted per instance; a message is let through for the 1st, 10th,
/// 100th, ... occurrence. Sharing one throttle between queues of a device (through an
/// `Arc`) keeps the limit device wide while independent devices stay independent.
#[derive(Debug)]
pub struct LogThrottle {
    count: AtomicU64,
    threshold: AtomicU64,
}

impl Default for LogThrottle {
    fn default() -> Self {
        LogThrottle {
            count: AtomicU64::new(0),
            threshold: AtomicU64::new(1),
        }
    }
}

impl LogThrottle {
    /// Create a throttle that lets the first occurrence through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence and return whether it should be logged.
    pub fn should_log(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        let threshold = self.threshold.load(Ordering::Relaxed);
        if count < threshold {
            return false;
        }
        // Losing this race only means one extra or one missing message.
        self.threshold
            .compare_exchange(
                threshold,
                threshold.saturating_mul(10),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Number of occurrences recorded so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
