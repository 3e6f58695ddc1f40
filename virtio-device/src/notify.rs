// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use log::trace;
use virtio_queue::Virtq;
use vm_memory::GuestMemory;

use crate::{Error, IrqVector, Result, VirtioInterrupt, NO_VECTOR};

/// ISR bit: a queue has new used buffers.
pub(crate) const VIRTIO_ISR_QUEUE: u8 = 0x1;
/// ISR bit: the device-specific configuration changed.
pub(crate) const VIRTIO_ISR_DEVICE_CONFIG: u8 = 0x2;

/// Decides whether the guest is signaled and through which source.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NotificationController {
    msix: bool,
}

impl NotificationController {
    pub fn new(msix: bool) -> Self {
        NotificationController { msix }
    }

    /// Signal `cause`. With INTx the cause is latched in `isr` and the line raised, with
    /// MSI-X `vector` fires unless the driver left it unassigned.
    pub fn kick<I: VirtioInterrupt>(
        &self,
        irq: &I,
        isr: &mut u8,
        cause: u8,
        vector: u16,
    ) -> Result<()> {
        if !self.msix {
            *isr |= cause;
            trace!("virtio: raising INTx, isr {:#x}", *isr);
            irq.raise(IrqVector::Legacy).map_err(Error::Interrupt)
        } else if vector != NO_VECTOR {
            trace!("virtio: firing MSI-X vector {}", vector);
            irq.raise(IrqVector::Msix(vector)).map_err(Error::Interrupt)
        } else {
            Ok(())
        }
    }

    /// Deassert the source `kick` would have used for `vector`.
    pub fn lower<I: VirtioInterrupt>(&self, irq: &I, vector: u16) -> Result<()> {
        if !self.msix {
            irq.lower(IrqVector::Legacy).map_err(Error::Interrupt)
        } else if vector != NO_VECTOR {
            irq.lower(IrqVector::Msix(vector)).map_err(Error::Interrupt)
        } else {
            Ok(())
        }
    }

    /// Signal the used buffers of `queue` if the driver asked for it, or unconditionally
    /// when `force` is set. Returns whether the guest was signaled.
    pub fn notify_queue<M: GuestMemory, I: VirtioInterrupt>(
        &self,
        irq: &I,
        isr: &mut u8,
        queue: &mut Virtq,
        mem: &M,
        force: bool,
    ) -> Result<bool> {
        if !queue.needs_notification(mem, force)? {
            trace!("virtio queue {}: notification suppressed", queue.name());
            return Ok(false);
        }
        self.kick(irq, isr, VIRTIO_ISR_QUEUE, queue.msix_vector())?;
        Ok(true)
    }
}
