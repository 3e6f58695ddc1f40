// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use virtio_bindings::bindings::virtio_config::VIRTIO_F_VERSION_1;
use virtio_queue::defs::{VIRTQ_MAX_SIZE, VIRTQ_SIZE_LIMIT};

use crate::{CapabilityLayout, Error, Result};

// Largest number of queues a transport can expose.
const MAX_QUEUES: u16 = 64;
// The MSI-X table can't hold more entries than this.
const MAX_MSIX_VECTORS: u16 = 2048;

/// How a driver write to the device status register is completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusMode {
    /// The status is committed and the client notified while handling the write.
    #[default]
    Inline,
    /// Status changes that must reach the client are parked by the write handler and
    /// committed later by
    /// [`complete_pending_status`](crate::VirtioPciTransport::complete_pending_status).
    Deferred,
}

/// Static description of a virtio PCI function, fixed when the transport is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtioPciConfig {
    /// PCI device id.
    pub device_id: u16,
    /// PCI base class code.
    pub class_base: u8,
    /// PCI sub class code.
    pub class_sub: u8,
    /// PCI programming interface.
    pub class_prog: u8,
    /// PCI subsystem id, the virtio device type.
    pub subsystem_id: u16,
    /// Legacy interrupt line.
    pub interrupt_line: u8,
    /// Legacy interrupt pin (1 = INTA#).
    pub interrupt_pin: u8,
    /// Device specific feature bits offered to the driver.
    pub device_features: u64,
    /// Number of queues exposed in the common configuration.
    pub num_queues: u16,
    /// Maximum (and default) size of every queue. Also bounds the length of a descriptor
    /// chain.
    pub queue_max_size: u16,
    /// Size of the device-specific configuration; 0 leaves out the device capability.
    pub device_config_len: u32,
    /// Doorbell stride of the notify capability.
    pub notify_off_multiplier: u32,
    /// Number of MSI-X vectors; 0 signals through the legacy INTx line.
    pub msix_vectors: u16,
    /// Completion mode of device status writes.
    pub status_mode: StatusMode,
}

impl Default for VirtioPciConfig {
    fn default() -> Self {
        VirtioPciConfig {
            device_id: 0,
            class_base: 0,
            class_sub: 0,
            class_prog: 0,
            subsystem_id: 0,
            interrupt_line: 0,
            interrupt_pin: 1,
            device_features: 0,
            num_queues: 24,
            queue_max_size: VIRTQ_MAX_SIZE,
            device_config_len: 0,
            notify_off_multiplier: 2,
            msix_vectors: 0,
            status_mode: StatusMode::Inline,
        }
    }
}

impl VirtioPciConfig {
    /// Configuration for a device with the given PCI device id and virtio device type.
    pub fn new(device_id: u16, subsystem_id: u16) -> Self {
        VirtioPciConfig {
            device_id,
            subsystem_id,
            ..Default::default()
        }
    }

    /// Set the PCI class triple.
    pub fn with_class(mut self, base: u8, sub: u8, prog: u8) -> Self {
        self.class_base = base;
        self.class_sub = sub;
        self.class_prog = prog;
        self
    }

    /// Set the legacy interrupt line and pin.
    pub fn with_interrupt(mut self, line: u8, pin: u8) -> Self {
        self.interrupt_line = line;
        self.interrupt_pin = pin;
        self
    }

    /// Set the device specific feature bits.
    pub fn with_device_features(mut self, features: u64) -> Self {
        self.device_features = features;
        self
    }

    /// Set the number of queues.
    pub fn with_num_queues(mut self, num_queues: u16) -> Self {
        self.num_queues = num_queues;
        self
    }

    /// Set the maximum queue size.
    pub fn with_queue_max_size(mut self, size: u16) -> Self {
        self.queue_max_size = size;
        self
    }

    /// Set the size of the device-specific configuration.
    pub fn with_device_config_len(mut self, len: u32) -> Self {
        self.device_config_len = len;
        self
    }

    /// Set the notify offset multiplier.
    pub fn with_notify_off_multiplier(mut self, multiplier: u32) -> Self {
        self.notify_off_multiplier = multiplier;
        self
    }

    /// Set the number of MSI-X vectors.
    pub fn with_msix_vectors(mut self, vectors: u16) -> Self {
        self.msix_vectors = vectors;
        self
    }

    /// Set the completion mode of status writes.
    pub fn with_status_mode(mut self, mode: StatusMode) -> Self {
        self.status_mode = mode;
        self
    }

    /// Features offered to the driver: the device specific ones plus `VIRTIO_F_VERSION_1`.
    pub fn offered_features(&self) -> u64 {
        self.device_features | (1u64 << VIRTIO_F_VERSION_1)
    }

    /// Whether interrupts go through MSI-X.
    pub fn msix_enabled(&self) -> bool {
        self.msix_vectors > 0
    }

    /// Check the configuration can be laid out in PCI configuration space and the
    /// capability BAR.
    pub fn validate(&self) -> Result<()> {
        if self.num_queues == 0 || self.num_queues > MAX_QUEUES {
            return Err(Error::InvalidConfig("number of queues must be in 1..=64"));
        }
        let size = self.queue_max_size;
        if size == 0 || size > VIRTQ_SIZE_LIMIT || size & (size - 1) != 0 {
            return Err(Error::InvalidConfig(
                "queue max size must be a power of two no larger than 32768",
            ));
        }
        // A doorbell is a 16-bit register, so consecutive doorbells must not overlap.
        if self.notify_off_multiplier < 2 || self.notify_off_multiplier % 2 != 0 {
            return Err(Error::InvalidConfig(
                "notify offset multiplier must be an even number of at least 2",
            ));
        }
        if self.device_config_len > u32::from(u16::MAX) {
            return Err(Error::InvalidConfig("device configuration is too large"));
        }
        if self.msix_vectors > MAX_MSIX_VECTORS {
            return Err(Error::InvalidConfig("too many MSI-X vectors"));
        }
        CapabilityLayout::new(self).map(|_| ())
    }
}
