// Copyright 2022 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// Copyright (C) 2020-2021 Alibaba Cloud. All rights reserved.
// Copyright © 2019 Intel Corporation.
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::cmp;
use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use log::{debug, error};
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory};

use crate::defs::{
    VIRTQ_AVAIL_ELEMENT_SIZE, VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_DESCRIPTOR_SIZE,
    VIRTQ_NAME_LEN, VIRTQ_RING_EVENT_SIZE, VIRTQ_RING_HEADER_SIZE, VIRTQ_RING_IDX_OFFSET,
    VIRTQ_SIZE_LIMIT, VIRTQ_USED_ELEMENT_SIZE,
};
use crate::{DescriptorChain, Error, LogThrottle, QueueState, VirtqUsedElem};

/// Device side state of one split virtqueue.
///
/// Besides the configuration written by the driver (size, ring addresses, enable flag), the
/// queue tracks two private cursors: `next_avail`, the next available ring slot the device
/// will consume, and `next_used`, the next used ring slot the device will fill. Both wrap
/// modulo 2^16. Completions are written ahead of the guest visible used index, which only
/// moves on [`publish_used`](Virtq::publish_used), so several completions can be batched
/// behind one notification.
///
/// # Example
///
/// ```rust
/// use virtio_queue::{LogThrottle, Virtq};
/// use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};
///
/// let m = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
/// let mut queue = Virtq::new(256).unwrap();
/// let throttle = LogThrottle::new();
///
/// // The driver configures the queue through the transport.
/// queue.set_size(8);
/// queue.set_desc_table_address(Some(0x1000), None);
/// queue.set_avail_ring_address(Some(0x2000), None);
/// queue.set_used_ring_address(Some(0x3000), None);
/// queue.set_ready(true);
/// assert!(queue.is_valid(&m));
///
/// // Nothing was published in the available ring yet.
/// assert!(queue.is_empty(&m).unwrap());
/// assert!(queue.get(&m, true, 256, &throttle).is_err());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Virtq {
    /// The maximum size in elements offered by the device.
    max_size: u16,

    /// The queue size in elements the driver selected.
    size: u16,

    /// Indicates if the driver enabled the queue.
    ready: bool,

    /// Guest physical address of the descriptor table.
    desc_table: GuestAddress,

    /// Guest physical address of the available ring.
    avail_ring: GuestAddress,

    /// Guest physical address of the used ring.
    used_ring: GuestAddress,

    /// Offset of this queue's doorbell, in notify multiplier units.
    notify_off: u16,

    /// MSI-X vector used to signal this queue.
    msix_vector: u16,

    /// Next available ring slot to consume.
    next_avail: Wrapping<u16>,

    /// Next used ring slot to fill.
    next_used: Wrapping<u16>,

    /// VIRTIO_F_RING_EVENT_IDX negotiated.
    event_idx_enabled: bool,

    /// A completion was written at the index the driver asked to be notified at.
    event_threshold_reached: bool,

    /// Name used in diagnostics.
    name: String,
}

impl Virtq {
    /// Create a disabled queue offering `max_size` elements.
    pub fn new(max_size: u16) -> Result<Self, Error> {
        // The max size is also the size reported before the driver negotiates one, and
        // valid sizes are powers of two.
        if max_size == 0 || max_size > VIRTQ_SIZE_LIMIT || (max_size & (max_size - 1)) != 0 {
            return Err(Error::InvalidMaxSize);
        }
        Ok(Virtq {
            max_size,
            size: max_size,
            ..Default::default()
        })
    }

    /// Return the queue to its post-construction state. The name, notify offset and vector
    /// are left to the transport.
    pub fn reset(&mut self) {
        self.ready = false;
        self.size = self.max_size;
        self.desc_table = GuestAddress(0);
        self.avail_ring = GuestAddress(0);
        self.used_ring = GuestAddress(0);
        self.next_avail = Wrapping(0);
        self.next_used = Wrapping(0);
        self.event_threshold_reached = false;
    }

    /// Check that the rings described by the queue configuration fit in guest memory.
    pub fn is_valid<M: GuestMemory>(&self, mem: &M) -> bool {
        let queue_size = u64::from(self.size);
        // None of these can overflow: an u16 times a small constant.
        let desc_table_size = VIRTQ_DESCRIPTOR_SIZE * queue_size;
        let avail_ring_size = VIRTQ_RING_HEADER_SIZE
            + VIRTQ_AVAIL_ELEMENT_SIZE * queue_size
            + VIRTQ_RING_EVENT_SIZE;
        let used_ring_size =
            VIRTQ_RING_HEADER_SIZE + VIRTQ_USED_ELEMENT_SIZE * queue_size + VIRTQ_RING_EVENT_SIZE;

        let fits = |start: GuestAddress, len: u64| {
            start
                .checked_add(len - 1)
                .is_some_and(|end| mem.address_in_range(start) && mem.address_in_range(end))
        };

        if !self.ready {
            error!("attempt to use virtio queue that is not marked ready");
            false
        } else if !fits(self.desc_table, desc_table_size) {
            error!(
                "virtio queue descriptor table goes out of bounds: start:0x{:08x} size:0x{:08x}",
                self.desc_table.raw_value(),
                desc_table_size
            );
            false
        } else if !fits(self.avail_ring, avail_ring_size) {
            error!(
                "virtio queue available ring goes out of bounds: start:0x{:08x} size:0x{:08x}",
                self.avail_ring.raw_value(),
                avail_ring_size
            );
            false
        } else if !fits(self.used_ring, used_ring_size) {
            error!(
                "virtio queue used ring goes out of bounds: start:0x{:08x} size:0x{:08x}",
                self.used_ring.raw_value(),
                used_ring_size
            );
            false
        } else {
            true
        }
    }

    /// Return the maximum size offered by the device.
    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Return the size negotiated with the driver.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Set the queue size, returning an error for sizes that are zero, larger than the
    /// maximum size or not a power of two.
    pub fn try_set_size(&mut self, size: u16) -> Result<(), Error> {
        if size > self.max_size || size == 0 || (size & (size - 1)) != 0 {
            return Err(Error::InvalidSize);
        }
        self.size = size;
        Ok(())
    }

    /// Set the queue size as requested by the driver; invalid values are ignored.
    pub fn set_size(&mut self, size: u16) {
        if self.try_set_size(size).is_err() {
            error!("virtio queue {} with invalid size: {}", self.name, size);
        }
    }

    /// Whether the driver enabled the queue.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Enable or disable the queue.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Tries to set the descriptor table address. In case of an invalid value, the address is
    /// not updated.
    pub fn try_set_desc_table_address(&mut self, desc_table: GuestAddress) -> Result<(), Error> {
        if desc_table.mask(0xf) != 0 {
            return Err(Error::InvalidDescTableAlign);
        }
        self.desc_table = desc_table;
        Ok(())
    }

    /// Tries to update the available ring address. In case of an invalid value, the address is
    /// not updated.
    pub fn try_set_avail_ring_address(&mut self, avail_ring: GuestAddress) -> Result<(), Error> {
        if avail_ring.mask(0x1) != 0 {
            return Err(Error::InvalidAvailRingAlign);
        }
        self.avail_ring = avail_ring;
        Ok(())
    }

    /// Tries to update the used ring address. In case of an invalid value, the address is not
    /// updated.
    pub fn try_set_used_ring_address(&mut self, used_ring: GuestAddress) -> Result<(), Error> {
        if used_ring.mask(0x3) != 0 {
            return Err(Error::InvalidUsedRingAlign);
        }
        self.used_ring = used_ring;
        Ok(())
    }

    /// Update the low and/or high half of the descriptor table address.
    pub fn set_desc_table_address(&mut self, low: Option<u32>, high: Option<u32>) {
        let addr = combine(self.desc_table, low, high);
        if self.try_set_desc_table_address(addr).is_err() {
            error!("virtio queue descriptor table breaks alignment constraints");
        }
    }

    /// Update the low and/or high half of the available ring address.
    pub fn set_avail_ring_address(&mut self, low: Option<u32>, high: Option<u32>) {
        let addr = combine(self.avail_ring, low, high);
        if self.try_set_avail_ring_address(addr).is_err() {
            error!("virtio queue available ring breaks alignment constraints");
        }
    }

    /// Update the low and/or high half of the used ring address.
    pub fn set_used_ring_address(&mut self, low: Option<u32>, high: Option<u32>) {
        let addr = combine(self.used_ring, low, high);
        if self.try_set_used_ring_address(addr).is_err() {
            error!("virtio queue used ring breaks alignment constraints");
        }
    }

    /// Guest physical address of the descriptor table.
    pub fn desc_table(&self) -> u64 {
        self.desc_table.0
    }

    /// Guest physical address of the available ring.
    pub fn avail_ring(&self) -> u64 {
        self.avail_ring.0
    }

    /// Guest physical address of the used ring.
    pub fn used_ring(&self) -> u64 {
        self.used_ring.0
    }

    /// Doorbell offset of the queue, in notify multiplier units.
    pub fn notify_off(&self) -> u16 {
        self.notify_off
    }

    /// Set the doorbell offset of the queue.
    pub fn set_notify_off(&mut self, notify_off: u16) {
        self.notify_off = notify_off;
    }

    /// MSI-X vector assigned to the queue.
    pub fn msix_vector(&self) -> u16 {
        self.msix_vector
    }

    /// Assign the MSI-X vector of the queue.
    pub fn set_msix_vector(&mut self, vector: u16) {
        self.msix_vector = vector;
    }

    /// Whether VIRTIO_F_RING_EVENT_IDX is in effect.
    pub fn event_idx_enabled(&self) -> bool {
        self.event_idx_enabled
    }

    /// Enable/disable the VIRTIO_F_RING_EVENT_IDX feature for interrupt coalescing.
    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx_enabled = enabled;
    }

    /// Whether a completion reached the driver's `used_event` since the last notification.
    pub fn event_threshold_reached(&self) -> bool {
        self.event_threshold_reached
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the name of the queue, truncated to fit the saved state field.
    pub fn set_name(&mut self, name: &str) {
        let mut end = cmp::min(name.len(), VIRTQ_NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name = name[..end].to_string();
    }

    /// Next available ring slot the device will consume.
    pub fn next_avail(&self) -> u16 {
        self.next_avail.0
    }

    /// Set the next available ring slot, e.g. on restore.
    pub fn set_next_avail(&mut self, next_avail: u16) {
        self.next_avail = Wrapping(next_avail);
    }

    /// Next used ring slot the device will fill.
    pub fn next_used(&self) -> u16 {
        self.next_used.0
    }

    /// Set the next used ring slot, e.g. on restore.
    pub fn set_next_used(&mut self, next_used: u16) {
        self.next_used = Wrapping(next_used);
    }

    // Slot selection always uses the current size, clamped so that a queue that was never
    // negotiated does not divide by zero.
    fn slot(&self, index: Wrapping<u16>) -> u64 {
        u64::from(index.0 % cmp::max(self.size, 1))
    }

    fn avail_field(&self, offset: u64) -> Result<GuestAddress, Error> {
        self.avail_ring
            .checked_add(offset)
            .ok_or(Error::AddressOverflow)
    }

    fn used_field(&self, offset: u64) -> Result<GuestAddress, Error> {
        self.used_ring
            .checked_add(offset)
            .ok_or(Error::AddressOverflow)
    }

    /// Read the `flags` field of the available ring.
    pub fn avail_flags<M: GuestMemory>(&self, mem: &M) -> Result<u16, Error> {
        mem.load(self.avail_ring, Ordering::Relaxed)
            .map(u16::from_le)
            .map_err(Error::GuestMemory)
    }

    /// Read the `idx` field of the available ring.
    pub fn avail_idx<M: GuestMemory>(
        &self,
        mem: &M,
        order: Ordering,
    ) -> Result<Wrapping<u16>, Error> {
        let addr = self.avail_field(VIRTQ_RING_IDX_OFFSET)?;
        mem.load(addr, order)
            .map(u16::from_le)
            .map(Wrapping)
            .map_err(Error::GuestMemory)
    }

    /// Read the guest visible `idx` field of the used ring.
    pub fn used_idx<M: GuestMemory>(
        &self,
        mem: &M,
        order: Ordering,
    ) -> Result<Wrapping<u16>, Error> {
        let addr = self.used_field(VIRTQ_RING_IDX_OFFSET)?;
        mem.load(addr, order)
            .map(u16::from_le)
            .map(Wrapping)
            .map_err(Error::GuestMemory)
    }

    // Return the value present in the used_event field of the avail ring.
    //
    // The driver only uses it as a hint, so the access is atomic but not ordered against
    // other ring accesses.
    fn used_event<M: GuestMemory>(&self, mem: &M) -> Result<Wrapping<u16>, Error> {
        // Cannot overflow an u64: header plus an u16 number of two byte slots.
        let offset = VIRTQ_RING_HEADER_SIZE + u64::from(self.size) * VIRTQ_AVAIL_ELEMENT_SIZE;
        let addr = self.avail_field(offset)?;
        mem.load(addr, Ordering::Relaxed)
            .map(u16::from_le)
            .map(Wrapping)
            .map_err(Error::GuestMemory)
    }

    /// Whether the driver published no entries beyond the ones already consumed.
    pub fn is_empty<M: GuestMemory>(&self, mem: &M) -> Result<bool, Error> {
        Ok(self.avail_idx(mem, Ordering::Acquire)? == self.next_avail)
    }

    /// Take the next descriptor chain from the available ring.
    ///
    /// With `remove` false the chain is only peeked at and the next call returns it again.
    /// The chain walk is bounded by `max_segments` descriptors.
    pub fn get<M: GuestMemory>(
        &mut self,
        mem: &M,
        remove: bool,
        max_segments: usize,
        throttle: &LogThrottle,
    ) -> Result<DescriptorChain, Error> {
        if !self.ready {
            return Err(Error::InvalidState);
        }

        let avail_idx = self.avail_idx(mem, Ordering::Acquire)?;
        if avail_idx == self.next_avail {
            return Err(Error::NotAvailable);
        }
        if (avail_idx - self.next_avail).0 > self.size {
            error!(
                "virtio queue {}: driver is {} entries ahead, more than the queue size {}",
                self.name,
                (avail_idx - self.next_avail).0,
                self.size
            );
            return Err(Error::ProtocolViolation);
        }

        // Cannot overflow an u64: header plus an u16 number of two byte slots.
        let offset =
            VIRTQ_RING_HEADER_SIZE + self.slot(self.next_avail) * VIRTQ_AVAIL_ELEMENT_SIZE;
        let head_index = mem
            .load(self.avail_field(offset)?, Ordering::Acquire)
            .map(u16::from_le)
            .map_err(Error::GuestMemory)?;

        let chain = DescriptorChain::read(
            mem,
            self.desc_table,
            self.size,
            head_index,
            max_segments,
            throttle,
        )?;

        if remove {
            self.next_avail += Wrapping(1);
        }
        Ok(chain)
    }

    /// Consume one available ring entry without producing a used entry.
    pub fn skip<M: GuestMemory>(&mut self, mem: &M) -> Result<(), Error> {
        if !self.ready {
            return Err(Error::InvalidState);
        }
        if self.is_empty(mem)? {
            return Err(Error::NotAvailable);
        }
        self.next_avail += Wrapping(1);
        Ok(())
    }

    /// Copy `response` into the device-writable buffers of `chain` and write the completion
    /// into the used ring, ahead of the guest visible used index.
    ///
    /// Returns the number of bytes written to the chain.
    pub fn put<M: GuestMemory>(
        &mut self,
        mem: &M,
        chain: DescriptorChain,
        response: &[u8],
        fence_requested: bool,
    ) -> Result<u32, Error> {
        self.put_vectored(mem, chain, &[response], fence_requested)
    }

    /// Same as [`put`](Virtq::put), with the response gathered from several host buffers.
    pub fn put_vectored<M: GuestMemory>(
        &mut self,
        mem: &M,
        mut chain: DescriptorChain,
        response: &[&[u8]],
        fence_requested: bool,
    ) -> Result<u32, Error> {
        if !self.ready {
            return Err(Error::InvalidState);
        }

        let dst = chain.writable_mut();
        dst.reset();
        let mut written: u64 = 0;
        for buf in response {
            if dst.is_exhausted() {
                break;
            }
            written += dst.write_from(mem, buf)? as u64;
        }
        // IN buffers add up to at most `max_segments` u32 lengths; clamp to the used ring field.
        let written = u32::try_from(written).unwrap_or(u32::MAX);

        if fence_requested {
            fence(Ordering::Release);
        }

        if self.event_idx_enabled && self.used_event(mem)? == self.next_used {
            self.event_threshold_reached = true;
        }

        let offset =
            VIRTQ_RING_HEADER_SIZE + self.slot(self.next_used) * VIRTQ_USED_ELEMENT_SIZE;
        let elem = VirtqUsedElem::new(u32::from(chain.head_index()), written);
        mem.write_obj(elem, self.used_field(offset)?)
            .map_err(Error::GuestMemory)?;

        self.next_used += Wrapping(1);
        debug!(
            "virtio queue {}: head {} completed with {} bytes",
            self.name,
            chain.head_index(),
            written
        );
        Ok(written)
    }

    /// Publish every completion written so far by storing `next_used` into the guest
    /// visible used index.
    pub fn publish_used<M: GuestMemory>(&self, mem: &M) -> Result<(), Error> {
        if !self.ready {
            return Err(Error::InvalidState);
        }
        let addr = self.used_field(VIRTQ_RING_IDX_OFFSET)?;
        mem.store(u16::to_le(self.next_used.0), addr, Ordering::Release)
            .map_err(Error::GuestMemory)
    }

    /// Decide whether the driver wants to hear about the completions published so far.
    ///
    /// With event index negotiated, this is true once per crossing of the driver's
    /// `used_event`. Otherwise it is true unless the driver set the no-interrupt flag in the
    /// available ring. `force` bypasses both checks.
    ///
    /// The flag is read from the available ring flags, where virtio 1.0 places it. The used
    /// ring flags belong to the device and are never consulted here.
    pub fn needs_notification<M: GuestMemory>(
        &mut self,
        mem: &M,
        force: bool,
    ) -> Result<bool, Error> {
        if self.event_idx_enabled {
            let fire = force || self.event_threshold_reached;
            if fire {
                self.event_threshold_reached = false;
            }
            return Ok(fire);
        }
        if force {
            return Ok(true);
        }
        Ok(self.avail_flags(mem)? & VIRTQ_AVAIL_F_NO_INTERRUPT == 0)
    }

    /// Returns the state of the queue, for save/restore.
    pub fn state(&self) -> QueueState {
        let mut name = [0u8; VIRTQ_NAME_LEN];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        QueueState {
            max_size: self.max_size,
            size: self.size,
            ready: self.ready,
            desc_table: self.desc_table.0,
            avail_ring: self.avail_ring.0,
            used_ring: self.used_ring.0,
            notify_off: self.notify_off,
            msix_vector: self.msix_vector,
            next_avail: self.next_avail.0,
            next_used: self.next_used.0,
            event_idx_enabled: self.event_idx_enabled,
            name,
        }
    }
}

fn combine(current: GuestAddress, low: Option<u32>, high: Option<u32>) -> GuestAddress {
    let low = u64::from(low.unwrap_or(current.0 as u32));
    let high = u64::from(high.unwrap_or((current.0 >> 32) as u32));
    GuestAddress((high << 32) | low)
}

impl TryFrom<QueueState> for Virtq {
    type Error = Error;

    fn try_from(q_state: QueueState) -> Result<Self, Self::Error> {
        let mut q = Virtq::new(q_state.max_size)?;

        q.try_set_size(q_state.size)?;
        q.set_ready(q_state.ready);
        q.try_set_desc_table_address(GuestAddress(q_state.desc_table))?;
        q.try_set_avail_ring_address(GuestAddress(q_state.avail_ring))?;
        q.try_set_used_ring_address(GuestAddress(q_state.used_ring))?;
        q.set_notify_off(q_state.notify_off);
        q.set_msix_vector(q_state.msix_vector);
        q.set_next_avail(q_state.next_avail);
        q.set_next_used(q_state.next_used);
        q.set_event_idx(q_state.event_idx_enabled);
        let len = q_state
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VIRTQ_NAME_LEN);
        q.set_name(&String::from_utf8_lossy(&q_state.name[..len]));

        Ok(q)
    }
}
