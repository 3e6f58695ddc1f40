// Copyright 2022 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use virtio_queue::defs::VIRTQ_NAME_LEN;

/// Saved state of one queue of a [`VirtioPciTransport`](crate::VirtioPciTransport).
///
/// All fields are public and the structure is considered untrusted; it is validated when
/// restored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtioPciQueueState {
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
    /// Value of the `queue_enable` register.
    pub enable: u16,
    /// Queue size selected by the driver.
    pub size: u16,
    /// Next available ring slot the device consumes.
    pub next_avail: u16,
    /// Next used ring slot the device fills.
    pub next_used: u16,
    /// NUL padded queue name.
    pub name: [u8; VIRTQ_NAME_LEN],
}

/// Saved state of a [`VirtioPciTransport`](crate::VirtioPciTransport).
///
/// The MSI-X configuration vector is not part of the state; it reads as unassigned after a
/// restore until the driver programs it again.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtioPciState {
    /// The device configuration changed since the driver last read it.
    pub gen_update_pending: bool,
    /// Device status byte.
    pub device_status: u8,
    /// Configuration generation counter.
    pub config_generation: u8,
    /// Offset of the PCI configuration access window data.
    pub pci_cfg_data_off: u8,
    /// ISR status byte.
    pub isr: u8,
    /// Queue selected by the driver.
    pub queue_select: u16,
    /// Device feature page selected by the driver.
    pub device_features_select: u32,
    /// Driver feature page selected by the driver.
    pub driver_features_select: u32,
    /// Features acknowledged by the driver.
    pub driver_features: u64,
    /// Every queue of the device, in index order.
    pub queues: Vec<VirtioPciQueueState>,
}
