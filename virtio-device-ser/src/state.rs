// Copyright 2022 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use serde::{Deserialize, Serialize};
use virtio_device::{VirtioPciQueueState, VirtioPciState};
use virtio_queue::defs::VIRTQ_NAME_LEN;

/// Wrapper over a `VirtioPciQueueState` that has serialization capabilities.
///
/// This structure is not designed to be used directly; convert it to and from
/// `VirtioPciQueueState` at the serialization boundary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtioPciQueueStateSer {
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

/// Wrapper over a `VirtioPciState` that has serialization capabilities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtioPciStateSer {
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
    pub queues: Vec<VirtioPciQueueStateSer>,
}

// The following `From` implementations can be used to convert from a `VirtioPciStateSer` to
// a `VirtioPciState` and vice versa. The restored state still goes through the checks of
// `VirtioPciTransport::restore_state`.

impl From<&VirtioPciQueueStateSer> for VirtioPciQueueState {
    fn from(state: &VirtioPciQueueStateSer) -> Self {
        VirtioPciQueueState {
            desc_table: state.desc_table,
            avail_ring: state.avail_ring,
            used_ring: state.used_ring,
            notify_off: state.notify_off,
            msix_vector: state.msix_vector,
            enable: state.enable,
            size: state.size,
            next_avail: state.next_avail,
            next_used: state.next_used,
            name: state.name,
        }
    }
}

impl From<&VirtioPciQueueState> for VirtioPciQueueStateSer {
    fn from(state: &VirtioPciQueueState) -> Self {
        VirtioPciQueueStateSer {
            desc_table: state.desc_table,
            avail_ring: state.avail_ring,
            used_ring: state.used_ring,
            notify_off: state.notify_off,
            msix_vector: state.msix_vector,
            enable: state.enable,
            size: state.size,
            next_avail: state.next_avail,
            next_used: state.next_used,
            name: state.name,
        }
    }
}

impl From<&VirtioPciStateSer> for VirtioPciState {
    fn from(state: &VirtioPciStateSer) -> Self {
        VirtioPciState {
            gen_update_pending: state.gen_update_pending,
            device_status: state.device_status,
            config_generation: state.config_generation,
            pci_cfg_data_off: state.pci_cfg_data_off,
            isr: state.isr,
            queue_select: state.queue_select,
            device_features_select: state.device_features_select,
            driver_features_select: state.driver_features_select,
            driver_features: state.driver_features,
            queues: state.queues.iter().map(VirtioPciQueueState::from).collect(),
        }
    }
}

impl From<&VirtioPciState> for VirtioPciStateSer {
    fn from(state: &VirtioPciState) -> Self {
        VirtioPciStateSer {
            gen_update_pending: state.gen_update_pending,
            device_status: state.device_status,
            config_generation: state.config_generation,
            pci_cfg_data_off: state.pci_cfg_data_off,
            isr: state.isr,
            queue_select: state.queue_select,
            device_features_select: state.device_features_select,
            driver_features_select: state.driver_features_select,
            driver_features: state.driver_features,
            queues: state
                .queues
                .iter()
                .map(VirtioPciQueueStateSer::from)
                .collect(),
        }
    }
}
