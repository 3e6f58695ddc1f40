// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

/// MSI-X vector value meaning "no vector assigned".
pub const NO_VECTOR: u16 = 0xffff;

/// An interrupt source of a virtio PCI function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqVector {
    /// The legacy INTx line.
    Legacy,
    /// An MSI-X table entry.
    Msix(u16),
}

/// Interrupt delivery to the guest.
///
/// The transport decides when and which source to signal; implementations only move the
/// signal to the hypervisor.
pub trait VirtioInterrupt: Send + Sync {
    /// Assert `vector`. Level triggered sources stay asserted until lowered.
    fn raise(&self, vector: IrqVector) -> io::Result<()>;

    /// Deassert `vector`.
    fn lower(&self, vector: IrqVector) -> io::Result<()>;
}

/// [`VirtioInterrupt`] backed by eventfds, the way irqfds are wired to KVM.
///
/// The INTx line gets one eventfd plus a level flag the embedder consults when the
/// interrupt controller asks for a resample; every MSI-X vector gets its own eventfd.
#[derive(Debug)]
pub struct EventFdInterrupt {
    legacy: EventFd,
    legacy_level: AtomicBool,
    msix: Vec<EventFd>,
}

impl EventFdInterrupt {
    /// Create the eventfds for the INTx line and `msix_vectors` MSI-X vectors.
    pub fn new(msix_vectors: u16) -> io::Result<Self> {
        let msix = (0..msix_vectors)
            .map(|_| EventFd::new(EFD_NONBLOCK))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(EventFdInterrupt {
            legacy: EventFd::new(EFD_NONBLOCK)?,
            legacy_level: AtomicBool::new(false),
            msix,
        })
    }

    /// Eventfd signaled when the INTx line is asserted.
    pub fn legacy_eventfd(&self) -> &EventFd {
        &self.legacy
    }

    /// Whether the INTx line is currently asserted.
    pub fn legacy_asserted(&self) -> bool {
        self.legacy_level.load(Ordering::Acquire)
    }

    /// Eventfd of MSI-X vector `vector`.
    pub fn msix_eventfd(&self, vector: u16) -> Option<&EventFd> {
        self.msix.get(usize::from(vector))
    }

    fn msix_fd(&self, vector: u16) -> io::Result<&EventFd> {
        self.msix_eventfd(vector).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("MSI-X vector {} out of range", vector),
            )
        })
    }
}

impl VirtioInterrupt for EventFdInterrupt {
    fn raise(&self, vector: IrqVector) -> io::Result<()> {
        match vector {
            IrqVector::Legacy => {
                self.legacy_level.store(true, Ordering::Release);
                self.legacy.write(1)
            }
            IrqVector::Msix(v) => self.msix_fd(v)?.write(1),
        }
    }

    fn lower(&self, vector: IrqVector) -> io::Result<()> {
        match vector {
            IrqVector::Legacy => {
                self.legacy_level.store(false, Ordering::Release);
                Ok(())
            }
            // Message signaled interrupts are edge triggered, there is nothing to deassert.
            IrqVector::Msix(v) => self.msix_fd(v).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_line() {
        let irq = EventFdInterrupt::new(0).unwrap();
        assert!(!irq.legacy_asserted());

        irq.raise(IrqVector::Legacy).unwrap();
        irq.raise(IrqVector::Legacy).unwrap();
        assert!(irq.legacy_asserted());
        assert_eq!(irq.legacy_eventfd().read().unwrap(), 2);

        irq.lower(IrqVector::Legacy).unwrap();
        assert!(!irq.legacy_asserted());
        // Nothing new was signaled.
        assert!(irq.legacy_eventfd().read().is_err());
    }

    #[test]
    fn test_msix_vectors() {
        let irq = EventFdInterrupt::new(2).unwrap();

        irq.raise(IrqVector::Msix(1)).unwrap();
        assert_eq!(irq.msix_eventfd(1).unwrap().read().unwrap(), 1);
        assert!(irq.msix_eventfd(0).unwrap().read().is_err());
        assert!(irq.lower(IrqVector::Msix(1)).is_ok());

        assert!(irq.msix_eventfd(2).is_none());
        assert_eq!(
            irq.raise(IrqVector::Msix(2)).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
        assert!(irq.raise(IrqVector::Msix(NO_VECTOR)).is_err());
        // MSI-X signals don't touch the INTx line.
        assert!(!irq.legacy_asserted());
    }
}
