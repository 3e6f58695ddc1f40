// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, trace, warn};
use virtio_queue::defs::VIRTIO_F_RING_EVENT_IDX;
use virtio_queue::{DescriptorChain, LogThrottle, QueueState, Virtq};
use vm_memory::{GuestAddress, GuestMemory};

use crate::cap::{
    CapabilityLayout, PCI_CFG_CAP_BAR, PCI_CFG_CAP_DATA, PCI_CFG_CAP_LENGTH, PCI_CFG_CAP_OFFSET,
    PCI_CONFIG_SPACE_SIZE, VIRTIO_PCI_CAP_BAR,
};
use crate::common_cfg::{lookup, CommonField, Part, QueueField};
use crate::generation::ConfigGeneration;
use crate::notify::{NotificationController, VIRTIO_ISR_DEVICE_CONFIG};
use crate::status::{DEVICE_NEEDS_RESET, DRIVER, DRIVER_OK, FAILED, FEATURES_OK};
use crate::{
    Error, IrqVector, Result, StatusMode, VirtioClient, VirtioInterrupt, VirtioPciConfig,
    VirtioPciQueueState, VirtioPciState, NO_VECTOR,
};

/// Result of a driver write to the capability region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write took effect.
    Done,
    /// A device status change was parked; it takes effect once
    /// [`complete_pending_status`](VirtioPciTransport::complete_pending_status) runs.
    StatusChangePending,
}

/// Virtual machine state transitions forwarded to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    /// The machine is being reset.
    Reset,
    /// The machine is being suspended.
    Suspend,
    /// The machine is being powered off.
    PowerOff,
    /// The machine resumed after a suspend or a restore.
    Resume,
}

// Deferred status writes kept before the latest one is overwritten.
const MAX_PENDING_STATUS: usize = 16;

// Registers and queues shared between the driver facing register handlers and the device
// side queue operations.
struct TransportState {
    device_features_select: u32,
    driver_features_select: u32,
    driver_features: u64,
    device_status: u8,
    // Status the client was last told about.
    prev_status: u8,
    // Status writes parked in deferred mode, oldest first.
    pending_status: VecDeque<u8>,
    generation: ConfigGeneration,
    isr: u8,
    queue_select: u16,
    msix_config: u16,
    queues: Vec<Virtq>,
    // Bytes 0..16 of the PCI configuration access capability, as programmed by the driver.
    pci_cfg_window: [u8; PCI_CFG_CAP_DATA as usize],
}

impl TransportState {
    fn driver_ok(&self) -> bool {
        self.device_status & DRIVER_OK != 0
    }
}

// Put `queue` back in its post-reset state. The doorbell of a queue is its index.
fn reset_queue(queue: &mut Virtq, index: u16, msix_vectors: u16) {
    queue.reset();
    queue.set_event_idx(false);
    queue.set_notify_off(index);
    let vector = index
        .checked_add(2)
        .filter(|v| *v < msix_vectors)
        .unwrap_or(NO_VECTOR);
    queue.set_msix_vector(vector);
}

fn read_le32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Virtio 1.0 PCI transport of one device.
///
/// The embedder maps [`region_size`](CapabilityLayout::region_size) bytes of BAR 2 to
/// [`mmio_read`](Self::mmio_read)/[`mmio_write`](Self::mmio_write), forwards configuration
/// space accesses to [`pci_config_read`](Self::pci_config_read) and
/// [`pci_config_write`](Self::pci_config_write), and initializes configuration space with
/// [`write_pci_header`](Self::write_pci_header). The device emulation consumes its queues
/// through the `queue_*` methods, typically from a worker thread; all of them take `&self`.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use virtio_device::{EventFdInterrupt, VirtioClient, VirtioPciConfig, VirtioPciTransport};
///
/// struct Rng;
///
/// impl VirtioClient for Rng {
///     fn on_status_changed(&self, _driver_ok: bool) {}
///     fn on_queue_notified(&self, _index: u16) {}
///     fn read_config(&self, _offset: u32, _data: &mut [u8]) {}
///     fn write_config(&self, _offset: u32, _data: &[u8]) {}
/// }
///
/// let config = VirtioPciConfig::new(0x1044, 4).with_num_queues(1);
/// let irq = EventFdInterrupt::new(0).unwrap();
/// let transport = VirtioPciTransport::new(config, Arc::new(Rng), irq).unwrap();
///
/// // The driver reads `num_queues` from the common configuration.
/// let mut data = [0u8; 2];
/// transport.mmio_read(18, &mut data);
/// assert_eq!(u16::from_le_bytes(data), 1);
/// ```
pub struct VirtioPciTransport<C: VirtioClient, I: VirtioInterrupt> {
    config: VirtioPciConfig,
    layout: CapabilityLayout,
    client: Arc<C>,
    interrupt: I,
    notifier: NotificationController,
    state: Mutex<TransportState>,
    chain_throttle: LogThrottle,
    invalid_state_logged: AtomicBool,
}

impl<C: VirtioClient, I: VirtioInterrupt> VirtioPciTransport<C, I> {
    /// Build the transport for `config`, with every queue disabled and the device in reset.
    pub fn new(config: VirtioPciConfig, client: Arc<C>, interrupt: I) -> Result<Self> {
        config.validate()?;
        let layout = CapabilityLayout::new(&config)?;
        let queues = (0..config.num_queues)
            .map(|_| Virtq::new(config.queue_max_size))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let config_len = layout.device().map_or(0, |d| d.mmio_len as usize);
        let mut state = TransportState {
            device_features_select: 0,
            driver_features_select: 0,
            driver_features: 0,
            device_status: 0,
            prev_status: 0,
            pending_status: VecDeque::new(),
            generation: ConfigGeneration::new(config_len),
            isr: 0,
            queue_select: 0,
            msix_config: NO_VECTOR,
            queues,
            pci_cfg_window: [0; PCI_CFG_CAP_DATA as usize],
        };
        for (index, queue) in (0u16..).zip(state.queues.iter_mut()) {
            reset_queue(queue, index, config.msix_vectors);
        }

        let transport = VirtioPciTransport {
            notifier: NotificationController::new(config.msix_enabled()),
            config,
            layout,
            client,
            interrupt,
            state: Mutex::new(state),
            chain_throttle: LogThrottle::new(),
            invalid_state_logged: AtomicBool::new(false),
        };
        let current = transport.fetch_device_config();
        transport.lock().generation.refresh_shadow(&current);
        Ok(transport)
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The transport configuration.
    pub fn config(&self) -> &VirtioPciConfig {
        &self.config
    }

    /// Placement of the capabilities.
    pub fn layout(&self) -> &CapabilityLayout {
        &self.layout
    }

    /// The device emulation.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// The interrupt sink.
    pub fn interrupt(&self) -> &I {
        &self.interrupt
    }

    /// Current device status byte.
    pub fn device_status(&self) -> u8 {
        self.lock().device_status
    }

    /// Features acknowledged by the driver.
    pub fn driver_features(&self) -> u64 {
        self.lock().driver_features
    }

    /// Current configuration generation.
    pub fn config_generation(&self) -> u8 {
        self.lock().generation.generation()
    }

    /// Snapshot of queue `index`.
    pub fn queue(&self, index: u16) -> Option<Virtq> {
        self.lock().queues.get(usize::from(index)).cloned()
    }

    /// Initialize the PCI configuration header and the vendor capabilities in `space`.
    pub fn write_pci_header(&self, space: &mut [u8; PCI_CONFIG_SPACE_SIZE]) {
        self.layout.write_pci_header(&self.config, space);
    }

    fn fetch_device_config(&self) -> Vec<u8> {
        let mut current = vec![0u8; self.layout.device().map_or(0, |d| d.mmio_len as usize)];
        let len = self.config.device_config_len as usize;
        if len > 0 {
            self.client.read_config(0, &mut current[..len]);
        }
        current
    }

    /// Handle a driver read of `data.len()` bytes at `offset` in the capability BAR.
    ///
    /// Accesses that don't match a register read as zero.
    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) {
        let len = data.len();
        if let Some(intra) = self
            .layout
            .device()
            .and_then(|d| d.intra_offset(offset, len))
        {
            self.read_device_config(intra, data);
        } else if let Some(intra) = self.layout.common().intra_offset(offset, len) {
            self.read_common(intra, data);
        } else if self.layout.isr().intra_offset(offset, len) == Some(0) && len == 1 {
            let mut st = self.lock();
            data[0] = st.isr;
            st.isr = 0;
            if !self.config.msix_enabled() {
                if let Err(e) = self.interrupt.lower(IrqVector::Legacy) {
                    warn!("virtio: failed to lower the interrupt line: {}", e);
                }
            }
        } else {
            debug!("virtio: unmapped read at {:#x}, {} bytes", offset, len);
            data.fill(0);
        }
    }

    /// Handle a driver write of `data` at `offset` in the capability BAR.
    ///
    /// Accesses that don't match a register are ignored.
    pub fn mmio_write(&self, offset: u64, data: &[u8]) -> WriteOutcome {
        let len = data.len();
        if let Some(intra) = self
            .layout
            .device()
            .and_then(|d| d.intra_offset(offset, len))
        {
            self.client.write_config(intra, data);
        } else if let Some(intra) = self.layout.common().intra_offset(offset, len) {
            return self.write_common(intra, data);
        } else if self.layout.isr().intra_offset(offset, len) == Some(0) && len == 1 {
            self.lock().isr = data[0];
        } else if let Some(intra) = self.layout.notify().intra_offset(offset, len) {
            self.ring_doorbell(intra, len);
        } else {
            debug!("virtio: unmapped write at {:#x}, {} bytes", offset, len);
        }
        WriteOutcome::Done
    }

    fn read_device_config(&self, intra: u32, data: &mut [u8]) {
        let current = self.fetch_device_config();
        let start = intra as usize;
        self.lock().generation.on_read(&current, start, data.len());
        data.copy_from_slice(&current[start..start + data.len()]);
    }

    fn ring_doorbell(&self, intra: u32, len: usize) {
        if len != 2 {
            debug!("virtio: {} byte doorbell write ignored", len);
            return;
        }
        let index = intra / self.layout.notify_off_multiplier();
        if index >= u32::from(self.config.num_queues) {
            debug!("virtio: doorbell of unknown queue {} ignored", index);
            return;
        }
        trace!("virtio: queue {} notified", index);
        // `index` is below `num_queues`.
        self.client.on_queue_notified(index as u16);
    }

    fn read_common(&self, intra: u32, data: &mut [u8]) {
        let access = match lookup(intra, data.len()) {
            Some(access) => access,
            None => {
                debug!(
                    "virtio: bad common config read at {:#x}, {} bytes",
                    intra,
                    data.len()
                );
                data.fill(0);
                return;
            }
        };

        let st = self.lock();
        let value = self.common_value(&st, access.field);
        let value = match access.part {
            Part::Full => value,
            Part::Low => value & 0xffff_ffff,
            Part::High => value >> 32,
        };
        trace!("virtio: read {:?} = {:#x}", access.field, value);
        let len = data.len();
        data.copy_from_slice(&value.to_le_bytes()[..len]);
    }

    fn common_value(&self, st: &TransportState, field: CommonField) -> u64 {
        match field {
            CommonField::DeviceFeatureSelect => u64::from(st.device_features_select),
            CommonField::DeviceFeature => {
                let features = self.config.offered_features();
                match st.device_features_select {
                    0 => features & 0xffff_ffff,
                    1 => features >> 32,
                    page => {
                        debug!("virtio: device features page {} is unmapped", page);
                        0
                    }
                }
            }
            CommonField::DriverFeatureSelect => u64::from(st.driver_features_select),
            CommonField::DriverFeature => match st.driver_features_select {
                0 => st.driver_features & 0xffff_ffff,
                1 => st.driver_features >> 32,
                page => {
                    debug!("virtio: driver features page {} is unmapped", page);
                    0
                }
            },
            CommonField::ConfigMsixVector => u64::from(st.msix_config),
            CommonField::NumQueues => u64::from(self.config.num_queues),
            CommonField::DeviceStatus => u64::from(st.device_status),
            CommonField::ConfigGeneration => u64::from(st.generation.generation()),
            CommonField::QueueSelect => u64::from(st.queue_select),
            CommonField::Queue(field) => match st.queues.get(usize::from(st.queue_select)) {
                Some(q) => match field {
                    QueueField::Size => u64::from(q.size()),
                    QueueField::MsixVector => u64::from(q.msix_vector()),
                    QueueField::Enable => u64::from(q.ready()),
                    QueueField::NotifyOff => u64::from(q.notify_off()),
                    QueueField::Desc => q.desc_table(),
                    QueueField::Avail => q.avail_ring(),
                    QueueField::Used => q.used_ring(),
                },
                None => {
                    debug!("virtio: read of unknown queue {}", st.queue_select);
                    0
                }
            },
        }
    }

    fn write_common(&self, intra: u32, data: &[u8]) -> WriteOutcome {
        let access = match lookup(intra, data.len()) {
            Some(access) => access,
            None => {
                debug!(
                    "virtio: bad common config write at {:#x}, {} bytes",
                    intra,
                    data.len()
                );
                return WriteOutcome::Done;
            }
        };
        if access.read_only {
            debug!("virtio: write to read-only {:?} ignored", access.field);
            return WriteOutcome::Done;
        }

        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(buf);
        trace!("virtio: write {:?} = {:#x}", access.field, value);

        // All registers are at most 32 bits wide, so the `as` conversions below only drop
        // bytes that were never written.
        let mut st = self.lock();
        match access.field {
            CommonField::DeviceFeatureSelect => st.device_features_select = value as u32,
            CommonField::DriverFeatureSelect => st.driver_features_select = value as u32,
            CommonField::DriverFeature => Self::write_driver_features(&mut st, value as u32),
            CommonField::ConfigMsixVector => st.msix_config = self.checked_vector(value as u16),
            CommonField::DeviceStatus => {
                drop(st);
                return self.write_status(value as u8);
            }
            CommonField::QueueSelect => st.queue_select = value as u16,
            CommonField::Queue(field) => self.write_queue_field(&mut st, field, access.part, value),
            // Filtered out above.
            CommonField::DeviceFeature | CommonField::NumQueues | CommonField::ConfigGeneration => {
            }
        }
        WriteOutcome::Done
    }

    fn write_driver_features(st: &mut TransportState, value: u32) {
        if st.device_status & (DRIVER | FEATURES_OK | FAILED) != DRIVER {
            warn!(
                "virtio: driver features written in invalid state {:#x}",
                st.device_status
            );
            return;
        }
        let value = u64::from(value);
        st.driver_features = match st.driver_features_select {
            0 => (st.driver_features & !0xffff_ffff) | value,
            1 => (st.driver_features & 0xffff_ffff) | (value << 32),
            page => {
                debug!("virtio: driver features page {} is unmapped", page);
                st.driver_features
            }
        };
    }

    // A vector the device can't deliver reads back as NO_VECTOR, which is how the driver
    // learns the assignment failed.
    fn checked_vector(&self, vector: u16) -> u16 {
        if vector == NO_VECTOR || vector < self.config.msix_vectors {
            vector
        } else {
            debug!("virtio: MSI-X vector {} not available", vector);
            NO_VECTOR
        }
    }

    fn write_queue_field(&self, st: &mut TransportState, field: QueueField, part: Part, value: u64) {
        let driver_ok = st.driver_ok();
        let index = st.queue_select;
        let queue = match st.queues.get_mut(usize::from(index)) {
            Some(queue) => queue,
            None => {
                debug!("virtio: write to unknown queue {} ignored", index);
                return;
            }
        };
        let (low, high) = match part {
            Part::Full | Part::Low => (Some(value as u32), None),
            Part::High => (None, Some(value as u32)),
        };

        match field {
            QueueField::Size => queue.set_size(value as u16),
            QueueField::MsixVector => queue.set_msix_vector(self.checked_vector(value as u16)),
            QueueField::Enable => queue.set_ready(value == 1),
            QueueField::Desc | QueueField::Avail | QueueField::Used if driver_ok => {
                warn!(
                    "virtio queue {}: ring address write while the device is live",
                    queue.name()
                );
            }
            QueueField::Desc => queue.set_desc_table_address(low, high),
            QueueField::Avail => queue.set_avail_ring_address(low, high),
            QueueField::Used => queue.set_used_ring_address(low, high),
            // Read-only, filtered out by the caller.
            QueueField::NotifyOff => {}
        }
    }

    fn write_status(&self, new: u8) -> WriteOutcome {
        let mut st = self.lock();
        let driver_ok_changed = (new ^ st.prev_status) & DRIVER_OK != 0;
        // Once a write is parked, later ones queue behind it.
        if self.config.status_mode == StatusMode::Deferred
            && (driver_ok_changed || new == 0 || !st.pending_status.is_empty())
        {
            if new == 0 {
                // Nothing parked before a reset survives it.
                st.pending_status.clear();
            } else if st.pending_status.len() >= MAX_PENDING_STATUS {
                warn!("virtio: too many pending status writes, replacing the latest");
                st.pending_status.pop_back();
            }
            st.pending_status.push_back(new);
            return WriteOutcome::StatusChangePending;
        }

        let report = self.commit_status(&mut st, new);
        drop(st);
        if let Some(driver_ok) = report {
            self.client.on_status_changed(driver_ok);
        }
        WriteOutcome::Done
    }

    /// Commit the status changes parked by writes that returned
    /// [`WriteOutcome::StatusChangePending`], in the order the driver made them, and notify
    /// the client.
    ///
    /// Must be called from a context where the client may run. Returns `false` if nothing
    /// was pending.
    pub fn complete_pending_status(&self) -> bool {
        let mut st = self.lock();
        if st.pending_status.is_empty() {
            return false;
        }
        let pending = std::mem::take(&mut st.pending_status);
        let reports: Vec<bool> = pending
            .into_iter()
            .filter_map(|new| self.commit_status(&mut st, new))
            .collect();
        drop(st);
        for driver_ok in reports {
            self.client.on_status_changed(driver_ok);
        }
        true
    }

    // Store `new` and return the DRIVER_OK value to report to the client, if the change
    // must be reported.
    fn commit_status(&self, st: &mut TransportState, mut new: u8) -> Option<bool> {
        let old = st.device_status;
        if new & FEATURES_OK != 0 && old & FEATURES_OK == 0 {
            // The device must not accept FEATURES_OK if the driver acked a feature that
            // wasn't offered.
            let unknown = st.driver_features & !self.config.offered_features();
            if unknown != 0 {
                warn!("virtio: driver accepted invalid feature bits {:#x}", unknown);
                new &= !FEATURES_OK;
            } else if st.driver_features & (1u64 << VIRTIO_F_RING_EVENT_IDX) != 0 {
                for queue in st.queues.iter_mut() {
                    queue.set_event_idx(true);
                }
            }
        }
        if new & FAILED != 0 && old & FAILED == 0 {
            warn!("virtio: driver gave up on the device");
        }

        debug!("virtio: device status {:#x} -> {:#x}", old, new);
        let driver_ok_changed = (new ^ st.prev_status) & DRIVER_OK != 0;
        st.device_status = new;
        if new == 0 {
            self.reset_device(st);
        }
        st.prev_status = st.device_status;

        if new == 0 || driver_ok_changed {
            Some(new & DRIVER_OK != 0)
        } else {
            None
        }
    }

    fn reset_device(&self, st: &mut TransportState) {
        debug!("virtio: device reset");
        st.device_features_select = 0;
        st.driver_features_select = 0;
        st.driver_features = 0;
        st.device_status = 0;
        st.isr = 0;
        st.queue_select = 0;
        st.pending_status.clear();
        st.generation.reset();

        // Lower exactly the sources that may have been raised.
        let mut vectors = vec![st.msix_config];
        vectors.extend(st.queues.iter().map(Virtq::msix_vector));
        if !self.config.msix_enabled() {
            vectors.truncate(1);
        }
        for vector in vectors {
            if let Err(e) = self.notifier.lower(&self.interrupt, vector) {
                warn!("virtio: failed to lower interrupt: {}", e);
            }
        }

        st.msix_config = NO_VECTOR;
        for (index, queue) in (0u16..).zip(st.queues.iter_mut()) {
            reset_queue(queue, index, self.config.msix_vectors);
        }
    }

    /// Handle a driver read of configuration space at `offset`.
    ///
    /// Only the data field of the PCI configuration access capability is handled here; it
    /// reads `data.len()` bytes of the capability BAR at the location the driver programmed
    /// into the capability. Returns `false` for every other offset, which the embedder
    /// serves from its copy of configuration space.
    pub fn pci_config_read(&self, offset: u32, data: &mut [u8]) -> bool {
        if offset != u32::from(self.layout.pci_cfg_data_off()) {
            return false;
        }
        match self.window_target(data.len()) {
            Some(target) => self.mmio_read(u64::from(target), data),
            None => {
                debug!("virtio: PCI config window not set up for this access");
                data.fill(0xff);
            }
        }
        true
    }

    /// Handle a driver write to configuration space at `offset`.
    ///
    /// A write to the data field of the PCI configuration access capability is forwarded to
    /// the capability BAR and its outcome returned. Every other write returns `None` and must
    /// be applied by the embedder; the transport only takes note of the BAR, offset and length
    /// fields of the access capability.
    pub fn pci_config_write(&self, offset: u32, data: &[u8]) -> Option<WriteOutcome> {
        if offset == u32::from(self.layout.pci_cfg_data_off()) {
            return Some(match self.window_target(data.len()) {
                Some(target) => self.mmio_write(u64::from(target), data),
                None => {
                    debug!("virtio: PCI config window not set up for this access");
                    WriteOutcome::Done
                }
            });
        }

        let cap = u32::from(self.layout.pci_cfg().pci_offset);
        let mut st = self.lock();
        for (pos, byte) in (offset..).zip(data.iter()) {
            let field = match pos.checked_sub(cap) {
                Some(field) => field,
                None => continue,
            };
            let writable = field == u32::from(PCI_CFG_CAP_BAR)
                || (u32::from(PCI_CFG_CAP_OFFSET)..u32::from(PCI_CFG_CAP_DATA)).contains(&field);
            if writable {
                st.pci_cfg_window[field as usize] = *byte;
            }
        }
        None
    }

    fn window_target(&self, len: usize) -> Option<u32> {
        let st = self.lock();
        let window = &st.pci_cfg_window;
        let bar = window[usize::from(PCI_CFG_CAP_BAR)];
        let offset = read_le32(&window[usize::from(PCI_CFG_CAP_OFFSET)..]);
        let length = read_le32(&window[usize::from(PCI_CFG_CAP_LENGTH)..]);
        if matches!(len, 1 | 2 | 4) && length as usize == len && bar == VIRTIO_PCI_CAP_BAR {
            Some(offset)
        } else {
            None
        }
    }

    /// Give queue `index` a name, used in diagnostics and kept across save/restore.
    pub fn attach_queue(&self, index: u16, name: &str) -> Result<()> {
        let mut st = self.lock();
        let queue = st
            .queues
            .get_mut(usize::from(index))
            .ok_or(Error::InvalidQueueIndex(index))?;
        queue.set_name(name);
        Ok(())
    }

    // Check queue `index` can be used by the device.
    fn active_queue<'a>(&self, st: &'a mut TransportState, index: u16) -> Result<&'a mut Virtq> {
        let driver_ok = st.driver_ok();
        let queue = st
            .queues
            .get_mut(usize::from(index))
            .ok_or(Error::InvalidQueueIndex(index))?;
        if !driver_ok || !queue.ready() {
            if !self.invalid_state_logged.swap(true, Ordering::Relaxed) {
                error!(
                    "virtio queue {} ({}) used while the device or queue is not ready",
                    index,
                    queue.name()
                );
            }
            return Err(Error::InvalidState);
        }
        Ok(queue)
    }

    /// Whether the driver published no new buffers on queue `index`. A queue that can't be
    /// used yet is empty.
    pub fn queue_is_empty<M: GuestMemory>(&self, mem: &M, index: u16) -> Result<bool> {
        let st = self.lock();
        let queue = st
            .queues
            .get(usize::from(index))
            .ok_or(Error::InvalidQueueIndex(index))?;
        if !st.driver_ok() || !queue.ready() {
            return Ok(true);
        }
        Ok(queue.is_empty(mem)?)
    }

    /// Take the next descriptor chain of queue `index`; with `remove` false the chain stays
    /// on the ring.
    pub fn queue_get<M: GuestMemory>(
        &self,
        mem: &M,
        index: u16,
        remove: bool,
    ) -> Result<DescriptorChain> {
        let mut st = self.lock();
        let max_segments = usize::from(self.config.queue_max_size);
        let queue = self.active_queue(&mut st, index)?;
        Ok(queue.get(mem, remove, max_segments, &self.chain_throttle)?)
    }

    /// Walk the chain of queue `index` starting at descriptor `head`, without touching the
    /// available ring.
    pub fn desc_chain_get<M: GuestMemory>(
        &self,
        mem: &M,
        index: u16,
        head: u16,
    ) -> Result<DescriptorChain> {
        let mut st = self.lock();
        let max_segments = usize::from(self.config.queue_max_size);
        let queue = self.active_queue(&mut st, index)?;
        if head >= queue.size() {
            return Err(Error::Queue(virtio_queue::Error::InvalidDescriptorIndex));
        }
        Ok(DescriptorChain::read(
            mem,
            GuestAddress(queue.desc_table()),
            queue.size(),
            head,
            max_segments,
            &self.chain_throttle,
        )?)
    }

    /// Drop the next available entry of queue `index` without completing it.
    pub fn queue_skip<M: GuestMemory>(&self, mem: &M, index: u16) -> Result<()> {
        let mut st = self.lock();
        let queue = self.active_queue(&mut st, index)?;
        Ok(queue.skip(mem)?)
    }

    /// Complete `chain` on queue `index` with `response`. The driver sees the completion
    /// after the next [`queue_sync`](Self::queue_sync).
    pub fn queue_put<M: GuestMemory>(
        &self,
        mem: &M,
        index: u16,
        chain: DescriptorChain,
        response: &[u8],
        fence: bool,
    ) -> Result<u32> {
        self.queue_put_vectored(mem, index, chain, &[response], fence)
    }

    /// Same as [`queue_put`](Self::queue_put), with the response gathered from several
    /// buffers.
    pub fn queue_put_vectored<M: GuestMemory>(
        &self,
        mem: &M,
        index: u16,
        chain: DescriptorChain,
        response: &[&[u8]],
        fence: bool,
    ) -> Result<u32> {
        let mut st = self.lock();
        let queue = self.active_queue(&mut st, index)?;
        Ok(queue.put_vectored(mem, chain, response, fence)?)
    }

    /// Publish the completions of queue `index` and signal the guest if it asked for it.
    /// Returns whether the guest was signaled.
    pub fn queue_sync<M: GuestMemory>(&self, mem: &M, index: u16) -> Result<bool> {
        self.sync_queue(mem, index, false)
    }

    fn sync_queue<M: GuestMemory>(&self, mem: &M, index: u16, force: bool) -> Result<bool> {
        let mut guard = self.lock();
        let st = &mut *guard;
        self.active_queue(st, index)?;
        let queue = &mut st.queues[usize::from(index)];
        queue.publish_used(mem)?;
        self.notifier
            .notify_queue(&self.interrupt, &mut st.isr, queue, mem, force)
    }

    /// Ask the driver to reset the device: DEVICE_NEEDS_RESET is set and, if the driver
    /// is live, a configuration change interrupt is raised.
    pub fn reset_all(&self) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.device_status |= DEVICE_NEEDS_RESET;
        if st.driver_ok() {
            st.generation.set_pending();
            self.notifier.kick(
                &self.interrupt,
                &mut st.isr,
                VIRTIO_ISR_DEVICE_CONFIG,
                st.msix_config,
            )?;
        }
        Ok(())
    }

    /// The device changed its device-specific configuration.
    pub fn notify_config_changed(&self) -> Result<()> {
        let mut guard = self.lock();
        let st = &mut *guard;
        st.generation.set_pending();
        if st.driver_ok() {
            self.notifier.kick(
                &self.interrupt,
                &mut st.isr,
                VIRTIO_ISR_DEVICE_CONFIG,
                st.msix_config,
            )?;
        }
        Ok(())
    }

    /// React to a virtual machine state transition.
    pub fn vm_state_changed<M: GuestMemory>(&self, mem: &M, state: VmState) -> Result<()> {
        debug!("virtio: vm state {:?}", state);
        match state {
            VmState::Reset => self.reset_all(),
            VmState::Resume => {
                // Notifications may have been lost while the machine was stopped.
                let live = {
                    let st = self.lock();
                    st.driver_ok() && st.queues.first().map_or(false, Virtq::ready)
                };
                if live {
                    self.sync_queue(mem, 0, true)?;
                }
                Ok(())
            }
            VmState::Suspend | VmState::PowerOff => Ok(()),
        }
    }

    /// Capture the transport state.
    ///
    /// A status change still pending completion is not part of the state.
    pub fn save_state(&self) -> VirtioPciState {
        let st = self.lock();
        VirtioPciState {
            gen_update_pending: st.generation.update_pending(),
            device_status: st.device_status,
            config_generation: st.generation.generation(),
            pci_cfg_data_off: self.layout.pci_cfg_data_off(),
            isr: st.isr,
            queue_select: st.queue_select,
            device_features_select: st.device_features_select,
            driver_features_select: st.driver_features_select,
            driver_features: st.driver_features,
            queues: st
                .queues
                .iter()
                .map(|queue| {
                    let q = queue.state();
                    VirtioPciQueueState {
                        desc_table: q.desc_table,
                        avail_ring: q.avail_ring,
                        used_ring: q.used_ring,
                        notify_off: q.notify_off,
                        msix_vector: q.msix_vector,
                        enable: u16::from(q.ready),
                        size: q.size,
                        next_avail: q.next_avail,
                        next_used: q.next_used,
                        name: q.name,
                    }
                })
                .collect(),
        }
    }

    /// Replace the transport state with `state`.
    ///
    /// The state is validated first; on error the transport is left untouched.
    ///
    /// The MSI-X configuration vector isn't part of the state and reads [`NO_VECTOR`]
    /// afterwards. Under MSI-X, configuration change interrupts are not delivered until the
    /// driver programs the vector again.
    pub fn restore_state(&self, state: &VirtioPciState) -> Result<()> {
        if state.queues.len() != usize::from(self.config.num_queues) {
            return Err(Error::InvalidConfig("saved queue count does not match"));
        }
        if state.pci_cfg_data_off != self.layout.pci_cfg_data_off() {
            return Err(Error::InvalidConfig(
                "saved PCI config window offset does not match",
            ));
        }
        if state.driver_features & !self.config.offered_features() != 0 {
            return Err(Error::InvalidConfig("saved driver features were not offered"));
        }

        let event_idx = state.device_status & FEATURES_OK != 0
            && state.driver_features & (1u64 << VIRTIO_F_RING_EVENT_IDX) != 0;
        let queues = (0u16..)
            .zip(state.queues.iter())
            .map(|(index, q)| {
                Virtq::try_from(QueueState {
                    max_size: self.config.queue_max_size,
                    size: q.size,
                    ready: q.enable == 1,
                    desc_table: q.desc_table,
                    avail_ring: q.avail_ring,
                    used_ring: q.used_ring,
                    notify_off: q.notify_off,
                    msix_vector: q.msix_vector,
                    next_avail: q.next_avail,
                    next_used: q.next_used,
                    event_idx_enabled: event_idx,
                    name: q.name,
                })
                .map_err(|e| Error::QueueState(index, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let current = self.fetch_device_config();
        let mut st = self.lock();
        st.device_features_select = state.device_features_select;
        st.driver_features_select = state.driver_features_select;
        st.driver_features = state.driver_features;
        st.device_status = state.device_status;
        st.prev_status = state.device_status;
        st.pending_status.clear();
        st.generation
            .restore(state.config_generation, state.gen_update_pending);
        st.generation.refresh_shadow(&current);
        st.isr = state.isr;
        st.queue_select = state.queue_select;
        st.msix_config = NO_VECTOR;
        st.queues = queues;
        debug!("virtio: state restored, status {:#x}", state.device_status);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::status::ACKNOWLEDGE;
    use std::io;
    use virtio_queue::defs::{
        VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
    };
    use virtio_queue::mock::MockSplitQueue;
    use virtio_queue::Descriptor;
    use vm_memory::{Bytes, GuestMemoryMmap};

    // Common configuration offsets.
    const DEVICE_FEATURE_SELECT: u64 = 0;
    const DEVICE_FEATURE: u64 = 4;
    const DRIVER_FEATURE_SELECT: u64 = 8;
    const DRIVER_FEATURE: u64 = 12;
    const CONFIG_MSIX_VECTOR: u64 = 16;
    const NUM_QUEUES: u64 = 18;
    const DEVICE_STATUS: u64 = 20;
    const CONFIG_GENERATION: u64 = 21;
    const QUEUE_SELECT: u64 = 22;
    const QUEUE_SIZE: u64 = 24;
    const QUEUE_MSIX_VECTOR: u64 = 26;
    const QUEUE_ENABLE: u64 = 28;
    const QUEUE_NOTIFY_OFF: u64 = 30;
    const QUEUE_DESC: u64 = 32;
    const QUEUE_AVAIL: u64 = 40;
    const QUEUE_USED: u64 = 48;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        Status(bool),
        Notified(u16),
        ConfigWrite(u32, Vec<u8>),
    }

    #[derive(Default)]
    pub struct RecordingClient {
        pub events: Mutex<Vec<Event>>,
        pub config: Mutex<Vec<u8>>,
    }

    impl RecordingClient {
        pub fn with_config(config: Vec<u8>) -> Self {
            RecordingClient {
                events: Mutex::new(Vec::new()),
                config: Mutex::new(config),
            }
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl VirtioClient for RecordingClient {
        fn on_status_changed(&self, driver_ok: bool) {
            self.events.lock().unwrap().push(Event::Status(driver_ok));
        }

        fn on_queue_notified(&self, index: u16) {
            self.events.lock().unwrap().push(Event::Notified(index));
        }

        fn read_config(&self, offset: u32, data: &mut [u8]) {
            let config = self.config.lock().unwrap();
            let start = offset as usize;
            data.copy_from_slice(&config[start..start + data.len()]);
        }

        fn write_config(&self, offset: u32, data: &[u8]) {
            self.events
                .lock()
                .unwrap()
                .push(Event::ConfigWrite(offset, data.to_vec()));
        }
    }

    #[derive(Default)]
    pub struct RecordingInterrupt {
        raised: Mutex<Vec<IrqVector>>,
        lowered: Mutex<Vec<IrqVector>>,
    }

    impl RecordingInterrupt {
        pub fn raised(&self) -> Vec<IrqVector> {
            self.raised.lock().unwrap().clone()
        }

        pub fn lowered(&self) -> Vec<IrqVector> {
            self.lowered.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.raised.lock().unwrap().clear();
            self.lowered.lock().unwrap().clear();
        }
    }

    impl VirtioInterrupt for RecordingInterrupt {
        fn raise(&self, vector: IrqVector) -> io::Result<()> {
            self.raised.lock().unwrap().push(vector);
            Ok(())
        }

        fn lower(&self, vector: IrqVector) -> io::Result<()> {
            self.lowered.lock().unwrap().push(vector);
            Ok(())
        }
    }

    type TestTransport = VirtioPciTransport<RecordingClient, RecordingInterrupt>;

    fn test_config() -> VirtioPciConfig {
        VirtioPciConfig::new(0x1041, 1)
            .with_num_queues(4)
            .with_queue_max_size(256)
            .with_device_features(1u64 << VIRTIO_F_RING_EVENT_IDX)
    }

    fn transport(config: VirtioPciConfig) -> TestTransport {
        let len = config.device_config_len as usize;
        let client = Arc::new(RecordingClient::with_config(vec![0; len]));
        VirtioPciTransport::new(config, client, RecordingInterrupt::default()).unwrap()
    }

    fn memory() -> GuestMemoryMmap<()> {
        GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    fn read(t: &TestTransport, offset: u64, len: usize) -> u64 {
        let mut data = [0u8; 8];
        t.mmio_read(offset, &mut data[..len]);
        u64::from_le_bytes(data)
    }

    fn write(t: &TestTransport, offset: u64, len: usize, value: u64) -> WriteOutcome {
        t.mmio_write(offset, &value.to_le_bytes()[..len])
    }

    fn set_status(t: &TestTransport, status: u8) -> WriteOutcome {
        write(t, DEVICE_STATUS, 1, u64::from(status))
    }

    fn negotiate(t: &TestTransport, features: u64) {
        set_status(t, ACKNOWLEDGE);
        set_status(t, ACKNOWLEDGE | DRIVER);
        write(t, DRIVER_FEATURE_SELECT, 4, 0);
        write(t, DRIVER_FEATURE, 4, features & 0xffff_ffff);
        write(t, DRIVER_FEATURE_SELECT, 4, 1);
        write(t, DRIVER_FEATURE, 4, features >> 32);
        set_status(t, ACKNOWLEDGE | DRIVER | FEATURES_OK);
    }

    fn setup_queue(t: &TestTransport, index: u16, vq: &MockSplitQueue<GuestMemoryMmap<()>>) {
        write(t, QUEUE_SELECT, 2, u64::from(index));
        write(t, QUEUE_SIZE, 2, 16);
        for (offset, addr) in [
            (QUEUE_DESC, vq.desc_table_addr().0),
            (QUEUE_AVAIL, vq.avail_addr().0),
            (QUEUE_USED, vq.used_addr().0),
        ] {
            write(t, offset, 4, addr & 0xffff_ffff);
            write(t, offset + 4, 4, addr >> 32);
        }
        write(t, QUEUE_ENABLE, 2, 1);
    }

    // Bring the device to DRIVER_OK with queue 0 backed by `vq`.
    fn activate(t: &TestTransport, vq: &MockSplitQueue<GuestMemoryMmap<()>>) {
        negotiate(t, 1u64 << 32);
        setup_queue(t, 0, vq);
        set_status(t, ACKNOWLEDGE | DRIVER | FEATURES_OK | DRIVER_OK);
        assert_eq!(t.device_status() & DRIVER_OK, DRIVER_OK);
    }

    #[test]
    fn test_common_config_registers() {
        let t = transport(test_config());

        assert_eq!(read(&t, NUM_QUEUES, 2), 4);
        assert_eq!(read(&t, DEVICE_FEATURE, 4), 1 << 29);
        write(&t, DEVICE_FEATURE_SELECT, 4, 1);
        assert_eq!(read(&t, DEVICE_FEATURE_SELECT, 4), 1);
        assert_eq!(read(&t, DEVICE_FEATURE, 4), 1);
        write(&t, DEVICE_FEATURE_SELECT, 4, 2);
        assert_eq!(read(&t, DEVICE_FEATURE, 4), 0);

        // Read-only registers ignore writes.
        write(&t, NUM_QUEUES, 2, 9);
        assert_eq!(read(&t, NUM_QUEUES, 2), 4);
        write(&t, CONFIG_GENERATION, 1, 9);
        assert_eq!(read(&t, CONFIG_GENERATION, 1), 0);

        // Per queue defaults.
        for index in 0..4 {
            write(&t, QUEUE_SELECT, 2, index);
            assert_eq!(read(&t, QUEUE_SIZE, 2), 256);
            assert_eq!(read(&t, QUEUE_ENABLE, 2), 0);
            assert_eq!(read(&t, QUEUE_NOTIFY_OFF, 2), index);
            assert_eq!(read(&t, QUEUE_MSIX_VECTOR, 2), u64::from(NO_VECTOR));
            write(&t, QUEUE_NOTIFY_OFF, 2, 7);
            assert_eq!(read(&t, QUEUE_NOTIFY_OFF, 2), index);
        }
        assert_eq!(read(&t, CONFIG_MSIX_VECTOR, 2), u64::from(NO_VECTOR));

        // Queue sizes must be powers of two no larger than the maximum.
        write(&t, QUEUE_SELECT, 2, 1);
        write(&t, QUEUE_SIZE, 2, 64);
        assert_eq!(read(&t, QUEUE_SIZE, 2), 64);
        write(&t, QUEUE_SIZE, 2, 48);
        write(&t, QUEUE_SIZE, 2, 512);
        assert_eq!(read(&t, QUEUE_SIZE, 2), 64);

        // 64-bit registers are accessed in halves.
        write(&t, QUEUE_DESC, 4, 0x1000);
        write(&t, QUEUE_DESC + 4, 4, 0x2);
        assert_eq!(read(&t, QUEUE_DESC, 4), 0x1000);
        assert_eq!(read(&t, QUEUE_DESC + 4, 4), 0x2);
        assert_eq!(t.queue(1).unwrap().desc_table(), 0x2_0000_1000);
        assert_eq!(read(&t, QUEUE_DESC, 8), 0);

        // A queue selector past the last queue reads zero and swallows writes.
        write(&t, QUEUE_SELECT, 2, 4);
        assert_eq!(read(&t, QUEUE_SELECT, 2), 4);
        write(&t, QUEUE_SIZE, 2, 16);
        assert_eq!(read(&t, QUEUE_SIZE, 2), 0);
    }

    #[test]
    fn test_bad_widths_are_unmapped() {
        let t = transport(test_config());

        // No register of the common configuration is 3 bytes wide.
        assert_eq!(write(&t, DEVICE_STATUS, 3, 0x7), WriteOutcome::Done);
        assert_eq!(t.device_status(), 0);
        write(&t, DEVICE_FEATURE_SELECT, 3, 0x1);
        assert_eq!(read(&t, DEVICE_FEATURE_SELECT, 4), 0);
        assert!(t.client().events().is_empty());

        // Reads of a wrong width return zero.
        assert_eq!(read(&t, NUM_QUEUES, 4), 0);
        assert_eq!(read(&t, NUM_QUEUES, 1), 0);
        // So do reads outside every structure.
        assert_eq!(read(&t, 0x1000, 4), 0);
    }

    #[test]
    fn test_driver_reset() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());

        negotiate(&t, 1u64 << 32);
        setup_queue(&t, 0, &vq);
        assert_eq!(t.device_status(), ACKNOWLEDGE | DRIVER | FEATURES_OK);
        assert!(t.client().events().is_empty());
        assert!(t.queue(0).unwrap().ready());

        set_status(&t, 0);
        assert_eq!(t.device_status(), 0);
        assert_eq!(t.client().events(), vec![Event::Status(false)]);
        assert_eq!(t.driver_features(), 0);
        for index in 0..4 {
            let q = t.queue(index).unwrap();
            assert!(!q.ready());
            assert_eq!(q.next_avail(), 0);
            assert_eq!(q.next_used(), 0);
            assert_eq!(q.size(), 256);
            assert_eq!(q.desc_table(), 0);
        }
        assert_eq!(t.interrupt().lowered(), vec![IrqVector::Legacy]);
    }

    #[test]
    fn test_driver_ok_reported_on_change_only() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());

        activate(&t, &vq);
        assert_eq!(t.client().events(), vec![Event::Status(true)]);

        // Same DRIVER_OK value, nothing to report.
        set_status(&t, ACKNOWLEDGE | DRIVER | FEATURES_OK | DRIVER_OK);
        set_status(&t, ACKNOWLEDGE | DRIVER | FEATURES_OK | DRIVER_OK | FAILED);
        assert_eq!(t.client().events(), vec![Event::Status(true)]);

        set_status(&t, ACKNOWLEDGE | DRIVER | FEATURES_OK);
        assert_eq!(
            t.client().events(),
            vec![Event::Status(true), Event::Status(false)]
        );
    }

    #[test]
    fn test_feature_negotiation() {
        let t = transport(test_config());

        // Bit 0 is not offered, FEATURES_OK is refused.
        negotiate(&t, (1u64 << 32) | 1);
        assert_eq!(t.device_status(), ACKNOWLEDGE | DRIVER);
        assert!(!t.queue(0).unwrap().event_idx_enabled());

        set_status(&t, 0);
        negotiate(&t, (1u64 << 32) | (1u64 << VIRTIO_F_RING_EVENT_IDX));
        assert_eq!(t.device_status(), ACKNOWLEDGE | DRIVER | FEATURES_OK);
        assert_eq!(
            t.driver_features(),
            (1u64 << 32) | (1u64 << VIRTIO_F_RING_EVENT_IDX)
        );
        assert_eq!(read(&t, DRIVER_FEATURE, 4), 1);
        for index in 0..4 {
            assert!(t.queue(index).unwrap().event_idx_enabled());
        }

        // Features can't change after FEATURES_OK.
        write(&t, DRIVER_FEATURE, 4, 0);
        assert_eq!(read(&t, DRIVER_FEATURE, 4), 1);
    }

    #[test]
    fn test_deferred_status_order() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config().with_status_mode(StatusMode::Deferred));
        let features_ok = ACKNOWLEDGE | DRIVER | FEATURES_OK;

        // A write that would complete inline queues behind a parked reset.
        negotiate(&t, 1u64 << 32);
        setup_queue(&t, 0, &vq);
        assert_eq!(set_status(&t, 0), WriteOutcome::StatusChangePending);
        assert_eq!(set_status(&t, features_ok), WriteOutcome::StatusChangePending);
        assert_eq!(t.device_status(), features_ok);
        assert!(t.queue(0).unwrap().ready());
        assert!(t.complete_pending_status());
        assert_eq!(t.device_status(), features_ok);
        assert!(!t.queue(0).unwrap().ready());
        assert_eq!(t.client().events(), vec![Event::Status(false)]);

        setup_queue(&t, 0, &vq);
        assert_eq!(
            set_status(&t, features_ok | DRIVER_OK),
            WriteOutcome::StatusChangePending
        );
        assert!(t.complete_pending_status());

        // The driver resets and starts over before the reset was completed.
        assert_eq!(set_status(&t, 0), WriteOutcome::StatusChangePending);
        assert_eq!(set_status(&t, ACKNOWLEDGE), WriteOutcome::StatusChangePending);
        assert_eq!(
            set_status(&t, ACKNOWLEDGE | DRIVER),
            WriteOutcome::StatusChangePending
        );
        assert!(t.complete_pending_status());
        assert!(!t.complete_pending_status());
        assert_eq!(t.device_status(), ACKNOWLEDGE | DRIVER);
        assert!(!t.queue(0).unwrap().ready());
        assert_eq!(t.queue(0).unwrap().next_avail(), 0);
        assert_eq!(
            t.client().events(),
            vec![Event::Status(false), Event::Status(true), Event::Status(false)]
        );
    }

    #[test]
    fn test_deferred_status() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config().with_status_mode(StatusMode::Deferred));

        // Changes that don't reach the client complete inline.
        negotiate(&t, 1u64 << 32);
        setup_queue(&t, 0, &vq);
        assert_eq!(t.device_status(), ACKNOWLEDGE | DRIVER | FEATURES_OK);
        assert!(!t.complete_pending_status());

        let live = ACKNOWLEDGE | DRIVER | FEATURES_OK | DRIVER_OK;
        assert_eq!(set_status(&t, live), WriteOutcome::StatusChangePending);
        assert_eq!(t.device_status(), ACKNOWLEDGE | DRIVER | FEATURES_OK);
        assert!(t.client().events().is_empty());

        // Parked writes are applied in order.
        assert_eq!(set_status(&t, live | FAILED), WriteOutcome::StatusChangePending);
        assert!(t.complete_pending_status());
        assert_eq!(t.device_status(), live | FAILED);
        assert_eq!(t.client().events(), vec![Event::Status(true)]);
        assert!(!t.complete_pending_status());

        // A reset is deferred too.
        assert_eq!(set_status(&t, 0), WriteOutcome::StatusChangePending);
        assert!(t.queue(0).unwrap().ready());
        assert!(t.complete_pending_status());
        assert!(!t.queue(0).unwrap().ready());
        assert_eq!(
            t.client().events(),
            vec![Event::Status(true), Event::Status(false)]
        );
    }

    #[test]
    fn test_queue_addresses_locked_while_live() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());
        activate(&t, &vq);

        write(&t, QUEUE_SELECT, 2, 0);
        write(&t, QUEUE_DESC, 4, 0x8000);
        write(&t, QUEUE_AVAIL, 4, 0x9000);
        write(&t, QUEUE_USED + 4, 4, 0x1);
        let q = t.queue(0).unwrap();
        assert_eq!(q.desc_table(), vq.desc_table_addr().0);
        assert_eq!(q.avail_ring(), vq.avail_addr().0);
        assert_eq!(q.used_ring(), vq.used_addr().0);

        // The queue can still be disabled.
        write(&t, QUEUE_ENABLE, 2, 0);
        assert!(!t.queue(0).unwrap().ready());
    }

    #[test]
    fn test_queue_operations() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());
        t.attach_queue(0, "requestq").unwrap();
        assert!(matches!(
            t.attach_queue(4, "nope"),
            Err(Error::InvalidQueueIndex(4))
        ));

        // Nothing can be done before the driver is ready.
        assert!(t.queue_is_empty(&m, 0).unwrap());
        assert!(matches!(t.queue_get(&m, 0, true), Err(Error::InvalidState)));
        assert!(matches!(
            t.queue_is_empty(&m, 9),
            Err(Error::InvalidQueueIndex(9))
        ));

        activate(&t, &vq);
        assert_eq!(t.queue(0).unwrap().name(), "requestq");
        assert!(t.queue_is_empty(&m, 0).unwrap());
        assert!(matches!(
            t.queue_get(&m, 0, true),
            Err(Error::Queue(virtio_queue::Error::NotAvailable))
        ));
        // Queue 1 was never enabled.
        assert!(t.queue_is_empty(&m, 1).unwrap());
        assert!(matches!(t.queue_get(&m, 1, true), Err(Error::InvalidState)));

        vq.build_desc_chain(&[
            Descriptor::new(0x2000, 8, VIRTQ_DESC_F_NEXT, 1),
            Descriptor::new(0x3000, 4, VIRTQ_DESC_F_WRITE, 0),
        ]);
        assert!(!t.queue_is_empty(&m, 0).unwrap());

        // Peeking leaves the chain on the ring.
        let peeked = t.queue_get(&m, 0, false).unwrap();
        assert_eq!(peeked.out_len(), 8);
        assert!(!t.queue_is_empty(&m, 0).unwrap());

        let walked = t.desc_chain_get(&m, 0, 0).unwrap();
        assert_eq!(walked, peeked);
        assert!(matches!(
            t.desc_chain_get(&m, 0, 16),
            Err(Error::Queue(virtio_queue::Error::InvalidDescriptorIndex))
        ));

        let chain = t.queue_get(&m, 0, true).unwrap();
        assert_eq!(chain.head_index(), 0);
        assert_eq!(chain.out_len(), 8);
        assert_eq!(chain.in_len(), 4);
        assert!(t.queue_is_empty(&m, 0).unwrap());

        assert_eq!(t.queue_put(&m, 0, chain, &[1, 2, 3, 4], true).unwrap(), 4);
        assert_eq!(m.read_obj::<u32>(GuestAddress(0x3000)).unwrap(), 0x0403_0201);
        // Written ahead of the used index.
        assert_eq!(vq.used().idx().load(), 0);
        assert_eq!(vq.used().ring().ref_at(0).load().len(), 4);

        assert!(t.queue_sync(&m, 0).unwrap());
        assert_eq!(vq.used().idx().load(), 1);
        assert_eq!(t.interrupt().raised(), vec![IrqVector::Legacy]);

        // Reading the ISR returns the cause, clears it and lowers the line.
        assert_eq!(read(&t, u64::from(t.layout().isr().mmio_offset), 1), 1);
        assert_eq!(read(&t, u64::from(t.layout().isr().mmio_offset), 1), 0);
        assert_eq!(t.interrupt().lowered().last(), Some(&IrqVector::Legacy));

        // A second sync publishes nothing new.
        assert!(t.queue_sync(&m, 0).unwrap());
        assert_eq!(vq.used().idx().load(), 1);

        // The driver asks for no interrupts.
        vq.avail().flags().store(VIRTQ_AVAIL_F_NO_INTERRUPT);
        assert!(!t.queue_sync(&m, 0).unwrap());

        // Skip consumes without completing.
        vq.publish(0);
        t.queue_skip(&m, 0).unwrap();
        assert!(t.queue_is_empty(&m, 0).unwrap());
        assert_eq!(t.queue(0).unwrap().next_used(), 1);
    }

    #[test]
    fn test_invalid_state_after_reset() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());
        activate(&t, &vq);

        vq.build_desc_chain(&[Descriptor::new(0x2000, 4, VIRTQ_DESC_F_WRITE, 0)]);
        let chain = t.queue_get(&m, 0, true).unwrap();

        // The driver resets the device while the chain is in flight.
        set_status(&t, 0);
        assert!(matches!(
            t.queue_put(&m, 0, chain, &[0; 4], false),
            Err(Error::InvalidState)
        ));
        assert!(matches!(t.queue_sync(&m, 0), Err(Error::InvalidState)));
        assert!(matches!(t.queue_skip(&m, 0), Err(Error::InvalidState)));
    }

    #[test]
    fn test_doorbell() {
        let t = transport(test_config().with_notify_off_multiplier(4));
        let notify = u64::from(t.layout().notify().mmio_offset);

        write(&t, notify, 2, 0);
        write(&t, notify + 12, 2, 3);
        // Wrong width, past the last queue, past the structure.
        write(&t, notify + 4, 4, 1);
        write(&t, notify + 16, 2, 4);
        write(&t, notify + 18, 2, 0);
        assert_eq!(
            t.client().events(),
            vec![Event::Notified(0), Event::Notified(3)]
        );
    }

    #[test]
    fn test_isr_register() {
        let t = transport(test_config());
        let isr = u64::from(t.layout().isr().mmio_offset);

        write(&t, isr, 1, 0x3);
        assert_eq!(read(&t, isr, 2), 0);
        assert_eq!(read(&t, isr + 1, 1), 0);
        assert_eq!(read(&t, isr, 1), 0x3);
        assert_eq!(read(&t, isr, 1), 0);
    }

    #[test]
    fn test_device_config_and_generation() {
        let t = transport(test_config().with_device_config_len(6));
        let base = u64::from(t.layout().device().unwrap().mmio_offset);

        *t.client().config.lock().unwrap() = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(read(&t, base, 4), 0x0403_0201);
        assert_eq!(read(&t, CONFIG_GENERATION, 1), 1);
        assert_eq!(read(&t, base + 4, 2), 0x0605);
        assert_eq!(read(&t, CONFIG_GENERATION, 1), 1);
        // Padding up to the dword boundary reads as zero.
        assert_eq!(read(&t, base + 6, 2), 0);
        assert_eq!(read(&t, CONFIG_GENERATION, 1), 1);
        // Past the padding.
        assert_eq!(read(&t, base + 8, 1), 0);

        write(&t, base + 2, 2, 0xbeef);
        assert_eq!(
            t.client().events(),
            vec![Event::ConfigWrite(2, vec![0xef, 0xbe])]
        );
        // Writes don't move the generation.
        assert_eq!(read(&t, CONFIG_GENERATION, 1), 1);

        // Device side changes are announced.
        t.notify_config_changed().unwrap();
        assert!(t.interrupt().raised().is_empty());
        read(&t, base, 1);
        assert_eq!(read(&t, CONFIG_GENERATION, 1), 2);
    }

    #[test]
    fn test_config_change_interrupt() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config().with_device_config_len(4));
        activate(&t, &vq);

        t.notify_config_changed().unwrap();
        assert_eq!(t.interrupt().raised(), vec![IrqVector::Legacy]);
        assert_eq!(read(&t, u64::from(t.layout().isr().mmio_offset), 1), 0x2);
    }

    #[test]
    fn test_reset_all() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());

        t.reset_all().unwrap();
        assert_eq!(t.device_status(), DEVICE_NEEDS_RESET);
        assert!(t.interrupt().raised().is_empty());
        set_status(&t, 0);

        activate(&t, &vq);
        t.vm_state_changed(&m, VmState::Reset).unwrap();
        assert_ne!(t.device_status() & DEVICE_NEEDS_RESET, 0);
        assert_ne!(t.device_status() & DRIVER_OK, 0);
        assert_eq!(t.interrupt().raised(), vec![IrqVector::Legacy]);
        assert_eq!(read(&t, u64::from(t.layout().isr().mmio_offset), 1), 0x2);
        // Queues keep running until the driver resets the device.
        assert!(t.queue(0).unwrap().ready());
    }

    #[test]
    fn test_msix_vectors() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config().with_msix_vectors(4));

        // Queue defaults point past the configuration vector.
        write(&t, QUEUE_SELECT, 2, 0);
        assert_eq!(read(&t, QUEUE_MSIX_VECTOR, 2), 2);
        write(&t, QUEUE_SELECT, 2, 2);
        assert_eq!(read(&t, QUEUE_MSIX_VECTOR, 2), u64::from(NO_VECTOR));

        activate(&t, &vq);
        write(&t, CONFIG_MSIX_VECTOR, 2, 0);
        assert_eq!(read(&t, CONFIG_MSIX_VECTOR, 2), 0);
        write(&t, QUEUE_SELECT, 2, 0);
        write(&t, QUEUE_MSIX_VECTOR, 2, 1);
        assert_eq!(read(&t, QUEUE_MSIX_VECTOR, 2), 1);
        // Vectors the device doesn't have are refused.
        write(&t, QUEUE_MSIX_VECTOR, 2, 9);
        assert_eq!(read(&t, QUEUE_MSIX_VECTOR, 2), u64::from(NO_VECTOR));
        write(&t, QUEUE_MSIX_VECTOR, 2, 1);

        vq.build_desc_chain(&[Descriptor::new(0x2000, 4, VIRTQ_DESC_F_WRITE, 0)]);
        let chain = t.queue_get(&m, 0, true).unwrap();
        t.queue_put(&m, 0, chain, &[0; 4], false).unwrap();
        assert!(t.queue_sync(&m, 0).unwrap());
        t.notify_config_changed().unwrap();
        assert_eq!(
            t.interrupt().raised(),
            vec![IrqVector::Msix(1), IrqVector::Msix(0)]
        );
        // The ISR byte isn't used with MSI-X.
        assert_eq!(read(&t, u64::from(t.layout().isr().mmio_offset), 1), 0);

        // A reset lowers the vectors that were in use, queue vector included.
        t.interrupt().clear();
        set_status(&t, 0);
        let lowered = t.interrupt().lowered();
        assert_eq!(lowered[0], IrqVector::Msix(0));
        assert!(lowered.contains(&IrqVector::Msix(1)));
        assert!(!lowered.contains(&IrqVector::Legacy));
        assert_eq!(read(&t, CONFIG_MSIX_VECTOR, 2), u64::from(NO_VECTOR));
    }

    #[test]
    fn test_pci_config_window() {
        let t = transport(test_config());
        let cap = u32::from(t.layout().pci_cfg().pci_offset);
        let data_off = u32::from(t.layout().pci_cfg_data_off());
        assert_eq!(data_off, cap + 16);

        let mut space = [0u8; PCI_CONFIG_SPACE_SIZE];
        t.write_pci_header(&mut space);
        assert_eq!(space[0x34], 0x40);

        // Not set up yet.
        let mut data = [0u8; 2];
        assert!(t.pci_config_read(data_off, &mut data));
        assert_eq!(data, [0xff, 0xff]);

        // Point the window at `num_queues`.
        assert!(t.pci_config_write(cap + 4, &[VIRTIO_PCI_CAP_BAR]).is_none());
        assert!(t.pci_config_write(cap + 8, &18u32.to_le_bytes()).is_none());
        assert!(t.pci_config_write(cap + 12, &2u32.to_le_bytes()).is_none());
        assert!(t.pci_config_read(data_off, &mut data));
        assert_eq!(u16::from_le_bytes(data), 4);

        // The access width must match the programmed length.
        let mut wide = [0u8; 4];
        assert!(t.pci_config_read(data_off, &mut wide));
        assert_eq!(wide, [0xff; 4]);

        // Writes go through to the status register.
        t.pci_config_write(cap + 8, &20u32.to_le_bytes());
        t.pci_config_write(cap + 12, &1u32.to_le_bytes());
        assert_eq!(
            t.pci_config_write(data_off, &[ACKNOWLEDGE]),
            Some(WriteOutcome::Done)
        );
        assert_eq!(t.device_status(), ACKNOWLEDGE);

        // Only the capability BAR can be reached.
        t.pci_config_write(cap + 4, &[0]);
        assert_eq!(
            t.pci_config_write(data_off, &[ACKNOWLEDGE | DRIVER]),
            Some(WriteOutcome::Done)
        );
        assert_eq!(t.device_status(), ACKNOWLEDGE);

        // Everything else belongs to the embedder.
        let mut other = [0u8; 4];
        assert!(!t.pci_config_read(0, &mut other));
        assert!(t.pci_config_write(0x10, &[0; 4]).is_none());
    }

    #[test]
    fn test_resume_forces_notification() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());

        // Nothing to resync before DRIVER_OK.
        t.vm_state_changed(&m, VmState::Resume).unwrap();
        assert!(t.interrupt().raised().is_empty());

        activate(&t, &vq);
        vq.avail().flags().store(VIRTQ_AVAIL_F_NO_INTERRUPT);
        t.vm_state_changed(&m, VmState::Suspend).unwrap();
        t.vm_state_changed(&m, VmState::PowerOff).unwrap();
        assert!(t.interrupt().raised().is_empty());

        t.vm_state_changed(&m, VmState::Resume).unwrap();
        assert_eq!(t.interrupt().raised(), vec![IrqVector::Legacy]);
    }

    #[test]
    fn test_save_restore() {
        let m = memory();
        let vq = MockSplitQueue::new(&m, 16);
        let t = transport(test_config());
        t.attach_queue(0, "rx").unwrap();
        activate(&t, &vq);

        vq.build_desc_chain(&[Descriptor::new(0x2000, 4, VIRTQ_DESC_F_WRITE, 0)]);
        let chain = t.queue_get(&m, 0, true).unwrap();
        t.queue_put(&m, 0, chain, &[0; 4], false).unwrap();
        t.notify_config_changed().unwrap();
        write(&t, QUEUE_SELECT, 2, 2);

        let state = t.save_state();
        assert_eq!(state.queues.len(), 4);
        assert_eq!(state.queues[0].next_avail, 1);
        assert_eq!(state.queues[0].next_used, 1);
        assert_eq!(state.queues[0].enable, 1);
        assert_eq!(&state.queues[0].name[..3], b"rx\0");
        assert!(state.gen_update_pending);
        assert_eq!(state.isr, 0x2);

        let restored = transport(test_config());
        restored.restore_state(&state).unwrap();
        assert_eq!(restored.save_state(), state);
        assert_eq!(restored.queue(0).unwrap().name(), "rx");
        assert_eq!(read(&restored, QUEUE_SELECT, 2), 2);
        assert_eq!(read(&restored, CONFIG_MSIX_VECTOR, 2), u64::from(NO_VECTOR));
        // Restoring doesn't talk to the client.
        assert!(restored.client().events().is_empty());

        // The restored device picks up where the saved one stopped.
        vq.publish(0);
        let chain = restored.queue_get(&m, 0, true).unwrap();
        restored.queue_put(&m, 0, chain, &[0; 4], false).unwrap();
        restored.queue_sync(&m, 0).unwrap();
        assert_eq!(vq.used().idx().load(), 2);
    }

    #[test]
    fn test_restore_rejects_bad_state() {
        let t = transport(test_config());
        set_status(&t, ACKNOWLEDGE);
        let good = t.save_state();

        let mut bad = good.clone();
        bad.queues.pop();
        assert!(matches!(
            t.restore_state(&bad),
            Err(Error::InvalidConfig(_))
        ));

        let mut bad = good.clone();
        bad.pci_cfg_data_off += 1;
        assert!(matches!(
            t.restore_state(&bad),
            Err(Error::InvalidConfig(_))
        ));

        let mut bad = good.clone();
        bad.driver_features = 1;
        assert!(matches!(
            t.restore_state(&bad),
            Err(Error::InvalidConfig(_))
        ));

        let mut bad = good.clone();
        bad.device_status = 0x0f;
        bad.queues[3].size = 3;
        assert!(matches!(
            t.restore_state(&bad),
            Err(Error::QueueState(3, virtio_queue::Error::InvalidSize))
        ));
        // Nothing was applied.
        assert_eq!(t.save_state(), good);
    }
}
