// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::mem::size_of;

use vm_memory::{ByteValued, Le32};

use crate::{Error, Result, VirtioPciConfig};

/// Offset of the first capability in PCI configuration space.
pub const PCI_CAP_LIST_START: u8 = 0x40;
/// BAR holding the common, notify, ISR and device capability structures.
pub const VIRTIO_PCI_CAP_BAR: u8 = 2;

/// Size of the PCI configuration space handled by the transport.
pub(crate) const PCI_CONFIG_SPACE_SIZE: usize = 256;

const VIRTIO_PCI_VENDOR_ID: u16 = 0x1af4;
const VIRTIO_PCI_REVISION_ID: u8 = 1;

const PCI_VENDOR_ID: usize = 0x00;
const PCI_DEVICE_ID: usize = 0x02;
const PCI_STATUS: usize = 0x06;
const PCI_REVISION_ID: usize = 0x08;
const PCI_CLASS_PROG: usize = 0x09;
const PCI_CLASS_SUB: usize = 0x0a;
const PCI_CLASS_BASE: usize = 0x0b;
const PCI_SUBSYSTEM_VENDOR_ID: usize = 0x2c;
const PCI_SUBSYSTEM_ID: usize = 0x2e;
const PCI_CAPABILITY_LIST: usize = 0x34;
const PCI_INTERRUPT_LINE: usize = 0x3c;
const PCI_INTERRUPT_PIN: usize = 0x3d;

const PCI_STATUS_CAP_LIST: u16 = 0x10;
const PCI_CAP_ID_VNDR: u8 = 0x09;

// Size of the common configuration structure.
pub(crate) const COMMON_CFG_LEN: u32 = 56;

// An extra page is appended to the region: some drivers map a whole page for the device
// capability regardless of its length.
const REGION_PAD: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum PciCapabilityType {
    Common = 1,
    Notify = 2,
    Isr = 3,
    Device = 4,
    Pci = 5,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct VirtioPciCap {
    cap_vndr: u8,
    cap_next: u8,
    cap_len: u8,
    cfg_type: u8,
    bar: u8,
    id: u8,
    padding: [u8; 2],
    offset: Le32,
    length: Le32,
}

// SAFETY: All members are simple numbers and any value is valid.
unsafe impl ByteValued for VirtioPciCap {}

impl VirtioPciCap {
    fn new(cfg_type: PciCapabilityType, cap_len: usize, cap_next: u8, loc: &CapLocation) -> Self {
        let bar = if cfg_type == PciCapabilityType::Pci {
            0
        } else {
            VIRTIO_PCI_CAP_BAR
        };
        VirtioPciCap {
            cap_vndr: PCI_CAP_ID_VNDR,
            cap_next,
            // Capability structures are at most 20 bytes long.
            cap_len: cap_len as u8,
            cfg_type: cfg_type as u8,
            bar,
            id: 0,
            padding: [0; 2],
            offset: Le32::from(loc.cap_offset),
            length: Le32::from(loc.cap_len),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct VirtioPciNotifyCap {
    cap: VirtioPciCap,
    notify_off_multiplier: Le32,
}

// SAFETY: All members are simple numbers and any value is valid.
unsafe impl ByteValued for VirtioPciNotifyCap {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct VirtioPciCfgCap {
    cap: VirtioPciCap,
    pci_cfg_data: [u8; 4],
}

// SAFETY: All members are simple numbers and any value is valid.
unsafe impl ByteValued for VirtioPciCfgCap {}

// Offsets of the guest programmable fields of the PCI configuration access capability.
pub(crate) const PCI_CFG_CAP_BAR: u8 = 4;
pub(crate) const PCI_CFG_CAP_OFFSET: u8 = 8;
pub(crate) const PCI_CFG_CAP_LENGTH: u8 = 12;
pub(crate) const PCI_CFG_CAP_DATA: u8 = 16;

/// Where one capability structure lives, both in the capability BAR and in PCI configuration
/// space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapLocation {
    /// Offset of the structure in the capability BAR.
    pub mmio_offset: u32,
    /// Length of the structure in the BAR, rounded up to the access granularity.
    pub mmio_len: u32,
    /// Offset of the capability in PCI configuration space.
    pub pci_offset: u8,
    /// Length of the capability in PCI configuration space.
    pub pci_len: u8,
    // Values advertised in the capability itself.
    cap_offset: u32,
    cap_len: u32,
}

impl CapLocation {
    /// Translate an access of `len` bytes at BAR offset `offset` into an offset inside the
    /// structure. Only 1, 2 and 4 byte accesses falling entirely inside the structure match.
    pub fn intra_offset(&self, offset: u64, len: usize) -> Option<u32> {
        if !matches!(len, 1 | 2 | 4) {
            return None;
        }
        let intra = offset.checked_sub(u64::from(self.mmio_offset))?;
        let end = intra.checked_add(len as u64)?;
        if intra < u64::from(self.mmio_len) && end <= u64::from(self.mmio_len) {
            // Bounded by `mmio_len`.
            Some(intra as u32)
        } else {
            None
        }
    }
}

fn align_up(value: u32, align: u32) -> Option<u32> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Placement of the virtio vendor capabilities, computed once from the transport
/// configuration.
///
/// The chain starts at [`PCI_CAP_LIST_START`] with the common configuration capability,
/// followed by the notify, ISR and PCI configuration access capabilities, then the
/// device-specific configuration capability when the device has one. When MSI-X is enabled
/// the last vendor capability links to the MSI-X capability, which the embedder places at
/// [`msix_cap_offset`](CapabilityLayout::msix_cap_offset).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityLayout {
    common: CapLocation,
    notify: CapLocation,
    isr: CapLocation,
    pci_cfg: CapLocation,
    device: Option<CapLocation>,
    notify_off_multiplier: u32,
    msix_cap_offset: Option<u8>,
    region_size: u32,
}

impl CapabilityLayout {
    /// Lay out the capabilities for a device described by `config`.
    ///
    /// Fails with [`Error::InvalidConfig`] if the structures don't fit a 32-bit BAR.
    pub fn new(config: &VirtioPciConfig) -> Result<Self> {
        const OVERFLOW: Error = Error::InvalidConfig("capabilities do not fit the BAR");

        let cap = size_of::<VirtioPciCap>() as u8;
        let notify_cap = size_of::<VirtioPciNotifyCap>() as u8;
        let cfg_cap = size_of::<VirtioPciCfgCap>() as u8;

        let common = CapLocation {
            mmio_offset: 0,
            mmio_len: COMMON_CFG_LEN,
            pci_offset: PCI_CAP_LIST_START,
            pci_len: cap,
            cap_offset: 0,
            cap_len: COMMON_CFG_LEN,
        };

        // Every queue has its own doorbell, `notify_off` is the queue index.
        let notify_len = u32::from(config.num_queues)
            .checked_mul(config.notify_off_multiplier)
            .and_then(|len| len.checked_add(2))
            .ok_or(OVERFLOW)?;
        let notify_off = align_up(common.cap_offset + common.cap_len, 4).ok_or(OVERFLOW)?;
        let notify = CapLocation {
            mmio_offset: notify_off,
            mmio_len: notify_len,
            pci_offset: common.pci_offset + common.pci_len,
            pci_len: notify_cap,
            cap_offset: notify_off,
            cap_len: notify_len,
        };

        let isr_off = notify_off
            .checked_add(notify_len)
            .and_then(|end| align_up(end, 4))
            .ok_or(OVERFLOW)?;
        let isr = CapLocation {
            mmio_offset: isr_off,
            mmio_len: 4,
            pci_offset: notify.pci_offset + notify.pci_len,
            pci_len: cap,
            cap_offset: isr_off,
            cap_len: 1,
        };

        // Accessed through configuration space only, nothing of it lives in the BAR.
        let pci_cfg = CapLocation {
            mmio_offset: 0,
            mmio_len: 0,
            pci_offset: isr.pci_offset + isr.pci_len,
            pci_len: cfg_cap,
            cap_offset: 0,
            cap_len: 0,
        };

        let mut next_free = pci_cfg.pci_offset + pci_cfg.pci_len;
        let device = if config.device_config_len > 0 {
            let dev_off = isr_off
                .checked_add(isr.cap_len)
                .and_then(|end| align_up(end, 4))
                .ok_or(OVERFLOW)?;
            let mmio_len = align_up(config.device_config_len, 4).ok_or(OVERFLOW)?;
            dev_off.checked_add(mmio_len).ok_or(OVERFLOW)?;
            let loc = CapLocation {
                mmio_offset: dev_off,
                mmio_len,
                pci_offset: next_free,
                pci_len: cap,
                cap_offset: dev_off,
                cap_len: config.device_config_len,
            };
            next_free += cap;
            Some(loc)
        } else {
            None
        };

        let msix_cap_offset = if config.msix_enabled() {
            Some(next_free)
        } else {
            None
        };

        let region_size = [notify.cap_len, isr.cap_len, device.map_or(0, |d| d.cap_len)]
            .iter()
            .try_fold(common.cap_len, |total, len| total.checked_add(*len))
            .and_then(|total| total.checked_add(REGION_PAD))
            .and_then(|total| align_up(total, REGION_PAD))
            .ok_or(OVERFLOW)?;

        Ok(CapabilityLayout {
            common,
            notify,
            isr,
            pci_cfg,
            device,
            notify_off_multiplier: config.notify_off_multiplier,
            msix_cap_offset,
            region_size,
        })
    }

    /// Location of the common configuration structure.
    pub fn common(&self) -> &CapLocation {
        &self.common
    }

    /// Location of the notify doorbells.
    pub fn notify(&self) -> &CapLocation {
        &self.notify
    }

    /// Location of the ISR status byte.
    pub fn isr(&self) -> &CapLocation {
        &self.isr
    }

    /// Location of the PCI configuration access capability.
    pub fn pci_cfg(&self) -> &CapLocation {
        &self.pci_cfg
    }

    /// Location of the device-specific configuration, if the device has one.
    pub fn device(&self) -> Option<&CapLocation> {
        self.device.as_ref()
    }

    /// Doorbell stride.
    pub fn notify_off_multiplier(&self) -> u32 {
        self.notify_off_multiplier
    }

    /// Offset in configuration space of the data field of the PCI configuration access
    /// capability.
    pub fn pci_cfg_data_off(&self) -> u8 {
        self.pci_cfg.pci_offset + PCI_CFG_CAP_DATA
    }

    /// Offset in configuration space where the MSI-X capability must be placed.
    pub fn msix_cap_offset(&self) -> Option<u8> {
        self.msix_cap_offset
    }

    /// Size of the capability BAR.
    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    /// Fill the PCI configuration header for `config` and write the vendor capability chain.
    pub fn write_pci_header(
        &self,
        config: &VirtioPciConfig,
        space: &mut [u8; PCI_CONFIG_SPACE_SIZE],
    ) {
        fn put_u16(space: &mut [u8], offset: usize, value: u16) {
            space[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        }

        put_u16(space, PCI_VENDOR_ID, VIRTIO_PCI_VENDOR_ID);
        put_u16(space, PCI_DEVICE_ID, config.device_id);
        let status = u16::from_le_bytes([space[PCI_STATUS], space[PCI_STATUS + 1]]);
        put_u16(space, PCI_STATUS, status | PCI_STATUS_CAP_LIST);
        space[PCI_REVISION_ID] = VIRTIO_PCI_REVISION_ID;
        space[PCI_CLASS_PROG] = config.class_prog;
        space[PCI_CLASS_SUB] = config.class_sub;
        space[PCI_CLASS_BASE] = config.class_base;
        put_u16(space, PCI_SUBSYSTEM_VENDOR_ID, VIRTIO_PCI_VENDOR_ID);
        put_u16(space, PCI_SUBSYSTEM_ID, config.subsystem_id);
        space[PCI_CAPABILITY_LIST] = PCI_CAP_LIST_START;
        space[PCI_INTERRUPT_LINE] = config.interrupt_line;
        space[PCI_INTERRUPT_PIN] = config.interrupt_pin;

        let common = VirtioPciCap::new(
            PciCapabilityType::Common,
            size_of::<VirtioPciCap>(),
            self.notify.pci_offset,
            &self.common,
        );
        write_cap(space, self.common.pci_offset, common.as_slice());

        let notify = VirtioPciNotifyCap {
            cap: VirtioPciCap::new(
                PciCapabilityType::Notify,
                size_of::<VirtioPciNotifyCap>(),
                self.isr.pci_offset,
                &self.notify,
            ),
            notify_off_multiplier: Le32::from(self.notify_off_multiplier),
        };
        write_cap(space, self.notify.pci_offset, notify.as_slice());

        let isr = VirtioPciCap::new(
            PciCapabilityType::Isr,
            size_of::<VirtioPciCap>(),
            self.pci_cfg.pci_offset,
            &self.isr,
        );
        write_cap(space, self.isr.pci_offset, isr.as_slice());

        let after_pci_cfg = match self.device {
            Some(device) => device.pci_offset,
            None => self.msix_cap_offset.unwrap_or(0),
        };
        let pci_cfg = VirtioPciCfgCap {
            cap: VirtioPciCap::new(
                PciCapabilityType::Pci,
                size_of::<VirtioPciCfgCap>(),
                after_pci_cfg,
                &self.pci_cfg,
            ),
            pci_cfg_data: [0; 4],
        };
        write_cap(space, self.pci_cfg.pci_offset, pci_cfg.as_slice());

        if let Some(loc) = self.device {
            let device = VirtioPciCap::new(
                PciCapabilityType::Device,
                size_of::<VirtioPciCap>(),
                self.msix_cap_offset.unwrap_or(0),
                &loc,
            );
            write_cap(space, loc.pci_offset, device.as_slice());
        }
    }
}

fn write_cap(space: &mut [u8; PCI_CONFIG_SPACE_SIZE], offset: u8, bytes: &[u8]) {
    let start = usize::from(offset);
    space[start..start + bytes.len()].copy_from_slice(bytes);
}
