// Copyright 2022 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Adds serialization capabilities to the state objects from `virtio-device`.
//!
//! Provides wrappers over the state objects from `virtio-device` crate that
//! implement the `Serialize` and `Deserialize` traits, and the versioned binary
//! layout used to persist a transport across save and restore.

#![deny(missing_docs)]

mod codec;
mod state;

use std::fmt::{self, Display};
use std::io;

pub use codec::{load, restore_transport, save, save_transport, MARKER, VERSION};
pub use state::{VirtioPciQueueStateSer, VirtioPciStateSer};

/// Errors of the save/restore layer.
#[derive(Debug)]
pub enum Error {
    /// The stream was not produced by this format, or by another version of it.
    ConfigMismatch {
        /// Field that didn't match.
        what: &'static str,
        /// Value this build understands.
        expected: u64,
        /// Value found in the stream.
        found: u64,
    },
    /// Reading or writing the stream failed.
    Io(io::Error),
    /// The transport refused the loaded state.
    InvalidState(virtio_device::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            ConfigMismatch {
                what,
                expected,
                found,
            } => write!(
                f,
                "saved state format changed: {} is {:#x}, expected {:#x}",
                what, found, expected
            ),
            Io(e) => write!(f, "failed to access saved state: {}", e),
            InvalidState(e) => write!(f, "saved state rejected: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConfigMismatch { .. } => None,
            Error::Io(e) => Some(e),
            Error::InvalidState(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result of the save/restore operations.
pub type Result<T> = std::result::Result<T, Error>;
