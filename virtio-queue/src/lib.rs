// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Split virtqueue engine for the device side of a virtio 1.0 transport.
//!
//! The crate covers the ring protocol only: reading descriptor chains published by the
//! driver in the available ring, copying responses into device-writable buffers, and
//! writing completions back into the used ring. Transport concerns (device status,
//! configuration space, interrupts) live in the `virtio-device` crate.

#![deny(missing_docs)]

pub mod defs;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

mod chain;
mod descriptor;
mod queue;
mod sg;
mod state;
mod throttle;

use std::fmt::{self, Debug, Display};

use vm_memory::GuestMemoryError;

pub use self::chain::DescriptorChain;
pub use self::descriptor::{Descriptor, VirtqUsedElem};
pub use self::queue::Virtq;
pub use self::sg::{SgCursor, SgSegment};
pub use self::state::QueueState;
pub use self::throttle::LogThrottle;

/// Virtio Queue related errors.
#[derive(Debug)]
pub enum Error {
    /// The available ring holds no new entries.
    NotAvailable,
    /// The operation is not allowed in the current device or queue state.
    InvalidState,
    /// The driver published ring contents that break the split ring protocol.
    ProtocolViolation,
    /// Failed to allocate the scatter-gather lists of a descriptor chain.
    NoMemory,
    /// Failed to access guest memory.
    GuestMemory(GuestMemoryError),
    /// Address computation overflowed.
    AddressOverflow,
    /// Invalid queue size.
    InvalidSize,
    /// Invalid maximum queue size.
    InvalidMaxSize,
    /// Descriptor table address is not aligned to 16 bytes.
    InvalidDescTableAlign,
    /// Available ring address is not aligned to 2 bytes.
    InvalidAvailRingAlign,
    /// Used ring address is not aligned to 4 bytes.
    InvalidUsedRingAlign,
    /// Descriptor head index is out of the bounds of the queue.
    InvalidDescriptorIndex,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            NotAvailable => write!(f, "no descriptor chain available"),
            InvalidState => write!(f, "queue is not ready for this operation"),
            ProtocolViolation => write!(f, "driver violated the split ring protocol"),
            NoMemory => write!(f, "failed to allocate scatter-gather segments"),
            GuestMemory(_) => write!(f, "error accessing guest memory"),
            AddressOverflow => write!(f, "address overflow"),
            InvalidSize => write!(f, "invalid queue size"),
            InvalidMaxSize => write!(f, "invalid max queue size"),
            InvalidDescTableAlign => write!(
                f,
                "virtio queue descriptor table breaks alignment constraints"
            ),
            InvalidAvailRingAlign => {
                write!(f, "virtio queue available ring breaks alignment constraints")
            }
            InvalidUsedRingAlign => {
                write!(f, "virtio queue used ring breaks alignment constraints")
            }
            InvalidDescriptorIndex => write!(f, "invalid descriptor index"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::GuestMemory(e) => Some(e),
            _ => None,
        }
    }
}
