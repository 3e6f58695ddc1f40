// Copyright 2022 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use crate::defs::VIRTQ_NAME_LEN;

/// Representation of the `Virtq` state.
///
/// The `QueueState` consists solely of POD (Plain Old Data), so it can be persisted and
/// restored without tracking implementation details of the queue.
///
/// As this structure has all the fields public it is considered to be untrusted. A validated
/// queue can be created from the state by calling the associated `try_from` function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueState {
    /// The maximum size in elements offered by the device.
    pub max_size: u16,
    /// The queue size in elements the driver selected.
    pub size: u16,
    /// Indicates if the driver enabled the queue.
    pub ready: bool,
    /// Guest physical address of the descriptor table.
    pub desc_table: u64,
    /// Guest physical address of the available ring.
    pub avail_ring: u64,
    /// Guest physical address of the used ring.
    pub used_ring: u64,
    /// Doorbell offset, in notify multiplier units.
    pub notify_off: u16,
    /// MSI-X vector of the queue.
    pub msix_vector: u16,
    /// Next available ring slot to consume.
    pub next_avail: u16,
    /// Next used ring slot to fill.
    pub next_used: u16,
    /// VIRTIO_F_RING_EVENT_IDX negotiated.
    pub event_idx_enabled: bool,
    /// NUL padded queue name.
    pub name: [u8; VIRTQ_NAME_LEN],
}
