// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Device side of the virtio 1.0 PCI transport.
//!
//! [`VirtioPciTransport`] owns the queues of one device and everything the driver reaches
//! through the vendor capabilities: the common configuration structure, the notify doorbells,
//! the ISR byte, the device-specific configuration window and the PCI configuration access
//! window. Device emulation plugs in through [`VirtioClient`], interrupt delivery through
//! [`VirtioInterrupt`].

#![deny(missing_docs)]

mod cap;
mod common_cfg;
mod config;
mod generation;
mod interrupt;
mod notify;
mod state;
mod transport;

use std::fmt::{self, Display};
use std::io;

pub use cap::{CapLocation, CapabilityLayout, PCI_CAP_LIST_START, VIRTIO_PCI_CAP_BAR};
pub use config::{StatusMode, VirtioPciConfig};
pub use interrupt::{EventFdInterrupt, IrqVector, VirtioInterrupt, NO_VECTOR};
pub use state::{VirtioPciQueueState, VirtioPciState};
pub use transport::{VirtioPciTransport, VmState, WriteOutcome};

/// When the driver initializes the device, it lets the device know about the completed stages
/// using the Device Status field.
///
/// These following consts are defined in the order in which the bits would typically be set by
/// the driver. `RESET` -> `ACKNOWLEDGE` -> `DRIVER` and so on. This module is a 1:1 mapping for
/// the Device Status field in the virtio 1.0 specification, section 2.1 (except for the `RESET`
/// value, which is not explicitly named there as such).
pub mod status {
    /// The initial status of the device.
    pub const RESET: u8 = 0;
    /// Indicates that the guest OS has found the device and recognized it as a valid
    /// virtio device.
    pub const ACKNOWLEDGE: u8 = 1;
    /// Indicates that the guest OS knows how to drive the device.
    pub const DRIVER: u8 = 2;
    /// Indicates that the driver is set up and ready to drive the device.
    pub const DRIVER_OK: u8 = 4;
    /// Indicates that the driver has acknowledged all the features it understands, and feature
    /// negotiation is complete.
    pub const FEATURES_OK: u8 = 8;
    /// Indicates that the device has experienced an error from which it can't recover.
    pub const DEVICE_NEEDS_RESET: u8 = 64;
    /// Indicates that something went wrong in the guest, and it has given up on the device.
    pub const FAILED: u8 = 128;
}

/// Virtio PCI transport errors.
#[derive(Debug)]
pub enum Error {
    /// Error reported by the queue engine.
    Queue(virtio_queue::Error),
    /// The queue index is beyond the number of queues of the device.
    InvalidQueueIndex(u16),
    /// The device or the queue is not in a state that allows the operation.
    InvalidState,
    /// The transport configuration was rejected.
    InvalidConfig(&'static str),
    /// Failed to signal the guest.
    Interrupt(io::Error),
    /// A queue of a saved state could not be restored.
    QueueState(u16, virtio_queue::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            Queue(e) => write!(f, "virtio queue error: {}", e),
            InvalidQueueIndex(idx) => write!(f, "invalid virtio queue index {}", idx),
            InvalidState => write!(f, "device is not ready for this operation"),
            InvalidConfig(what) => write!(f, "invalid transport configuration: {}", what),
            Interrupt(e) => write!(f, "failed to signal the guest: {}", e),
            QueueState(idx, e) => write!(f, "invalid saved state for queue {}: {}", idx, e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Queue(e) | Error::QueueState(_, e) => Some(e),
            Error::Interrupt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<virtio_queue::Error> for Error {
    fn from(e: virtio_queue::Error) -> Self {
        match e {
            virtio_queue::Error::InvalidState => Error::InvalidState,
            e => Error::Queue(e),
        }
    }
}

/// Type alias for `Result` with the transport error.
pub type Result<T> = std::result::Result<T, Error>;

/// Callbacks into the device emulation sitting on top of the transport.
///
/// The transport never calls back while it holds its internal lock, so implementations are
/// free to call into the transport again (for example to fetch work from a queue).
pub trait VirtioClient: Send + Sync {
    /// The DRIVER_OK status bit changed, or the driver reset the device (`false`).
    fn on_status_changed(&self, driver_ok: bool);

    /// The driver rang the doorbell of queue `index`.
    fn on_queue_notified(&self, index: u16);

    /// Fill `data` with the device-specific configuration bytes starting at `offset`.
    fn read_config(&self, offset: u32, data: &mut [u8]);

    /// The driver wrote `data` at `offset` in the device-specific configuration.
    fn write_config(&self, offset: u32, data: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        assert!(matches!(
            Error::from(virtio_queue::Error::InvalidState),
            Error::InvalidState
        ));
        assert!(matches!(
            Error::from(virtio_queue::Error::NotAvailable),
            Error::Queue(virtio_queue::Error::NotAvailable)
        ));

        let e = Error::QueueState(3, virtio_queue::Error::InvalidSize);
        assert_eq!(
            format!("{}", e),
            "invalid saved state for queue 3: invalid queue size"
        );
        assert!(std::error::Error::source(&e).is_some());
        assert!(std::error::Error::source(&Error::InvalidState).is_none());
    }
}
