// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtio split ring layout constants.

use virtio_bindings::bindings::virtio_ring::{
    VIRTIO_RING_F_EVENT_IDX, VRING_AVAIL_F_NO_INTERRUPT, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE,
    VRING_USED_F_NO_NOTIFY,
};

/// Marks a buffer as continuing via the next field.
pub const VIRTQ_DESC_F_NEXT: u16 = VRING_DESC_F_NEXT as u16;
/// Marks a buffer as device write-only.
pub const VIRTQ_DESC_F_WRITE: u16 = VRING_DESC_F_WRITE as u16;

/// Set by the driver in the available ring flags to ask for no used-buffer notifications.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = VRING_AVAIL_F_NO_INTERRUPT as u16;
/// Set by the device in the used ring flags to ask for no available-buffer notifications.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = VRING_USED_F_NO_NOTIFY as u16;

/// Feature bit for the `used_event`/`avail_event` notification suppression scheme.
pub const VIRTIO_F_RING_EVENT_IDX: u32 = VIRTIO_RING_F_EVENT_IDX;

/// Size of one element in the descriptor table.
pub const VIRTQ_DESCRIPTOR_SIZE: u64 = 16;

/// Size of the `flags` and `idx` fields that start both rings.
pub const VIRTQ_RING_HEADER_SIZE: u64 = 4;
/// Size of the trailing event field of both rings.
pub const VIRTQ_RING_EVENT_SIZE: u64 = 2;
/// Offset of the `idx` field in both rings.
pub const VIRTQ_RING_IDX_OFFSET: u64 = 2;

/// Size of one element in the available ring.
pub const VIRTQ_AVAIL_ELEMENT_SIZE: u64 = 2;
/// Size of one element in the used ring.
pub const VIRTQ_USED_ELEMENT_SIZE: u64 = 8;

/// Largest queue size a device built on this crate offers by default. It also bounds the
/// number of segments collected from a single descriptor chain.
pub const VIRTQ_MAX_SIZE: u16 = 1024;

/// Largest queue size allowed by the split ring layout.
pub const VIRTQ_SIZE_LIMIT: u16 = 32768;

/// Length of the fixed size, NUL padded queue name kept in saved state.
pub const VIRTQ_NAME_LEN: usize = 32;
