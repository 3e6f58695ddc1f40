// Copyright 2022 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Binary layout of a saved transport.
//!
//! All integers are little-endian. The stream starts with [`MARKER`] (8 bytes) and
//! [`VERSION`] (4 bytes), followed by the transport registers and one fixed size record per
//! queue, in index order:
//!
//! | field | size |
//! |---|---|
//! | generation update pending | 1 |
//! | device status | 1 |
//! | config generation | 1 |
//! | PCI config window data offset | 1 |
//! | ISR | 1 |
//! | queue select | 2 |
//! | device features select | 4 |
//! | driver features select | 4 |
//! | driver features | 8 |
//!
//! Each queue record holds the descriptor table, available ring and used ring addresses
//! (8 bytes each), the notify offset, MSI-X vector, enable flag, size, next available and
//! next used indices (2 bytes each) and the NUL padded name.

use std::io::{Read, Write};

use log::debug;
use virtio_device::{
    VirtioClient, VirtioInterrupt, VirtioPciQueueState, VirtioPciState, VirtioPciTransport,
};
use virtio_queue::defs::VIRTQ_NAME_LEN;

use crate::{Error, Result};

/// First eight bytes of a saved transport.
pub const MARKER: u64 = 0x1133_5577_99bb_ddff;
/// Version of the layout written by [`save`].
pub const VERSION: u32 = 1;

struct Writer<W> {
    inner: W,
}

impl<W: Write> Writer<W> {
    fn u8(&mut self, v: u8) -> Result<()> {
        Ok(self.inner.write_all(&[v])?)
    }

    fn u16(&mut self, v: u16) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    fn u32(&mut self, v: u32) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    fn u64(&mut self, v: u64) -> Result<()> {
        Ok(self.inner.write_all(&v.to_le_bytes())?)
    }

    fn bytes(&mut self, v: &[u8]) -> Result<()> {
        Ok(self.inner.write_all(v)?)
    }
}

struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Write `state` to `out`.
pub fn save<W: Write>(state: &VirtioPciState, out: W) -> Result<()> {
    let mut w = Writer { inner: out };
    w.u64(MARKER)?;
    w.u32(VERSION)?;
    w.u8(u8::from(state.gen_update_pending))?;
    w.u8(state.device_status)?;
    w.u8(state.config_generation)?;
    w.u8(state.pci_cfg_data_off)?;
    w.u8(state.isr)?;
    w.u16(state.queue_select)?;
    w.u32(state.device_features_select)?;
    w.u32(state.driver_features_select)?;
    w.u64(state.driver_features)?;
    for q in &state.queues {
        w.u64(q.desc_table)?;
        w.u64(q.avail_ring)?;
        w.u64(q.used_ring)?;
        w.u16(q.notify_off)?;
        w.u16(q.msix_vector)?;
        w.u16(q.enable)?;
        w.u16(q.size)?;
        w.u16(q.next_avail)?;
        w.u16(q.next_used)?;
        w.bytes(&q.name)?;
    }
    Ok(())
}

/// Read a state holding `num_queues` queues from `input`.
///
/// A stream that doesn't start with [`MARKER`] and [`VERSION`] is refused with
/// [`Error::ConfigMismatch`] before anything else is read.
pub fn load<R: Read>(input: R, num_queues: u16) -> Result<VirtioPciState> {
    let mut r = Reader { inner: input };
    let marker = r.u64()?;
    if marker != MARKER {
        return Err(Error::ConfigMismatch {
            what: "marker",
            expected: MARKER,
            found: marker,
        });
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(Error::ConfigMismatch {
            what: "version",
            expected: u64::from(VERSION),
            found: u64::from(version),
        });
    }

    let mut state = VirtioPciState {
        gen_update_pending: r.u8()? != 0,
        device_status: r.u8()?,
        config_generation: r.u8()?,
        pci_cfg_data_off: r.u8()?,
        isr: r.u8()?,
        queue_select: r.u16()?,
        device_features_select: r.u32()?,
        driver_features_select: r.u32()?,
        driver_features: r.u64()?,
        queues: Vec::with_capacity(usize::from(num_queues)),
    };
    for _ in 0..num_queues {
        state.queues.push(VirtioPciQueueState {
            desc_table: r.u64()?,
            avail_ring: r.u64()?,
            used_ring: r.u64()?,
            notify_off: r.u16()?,
            msix_vector: r.u16()?,
            enable: r.u16()?,
            size: r.u16()?,
            next_avail: r.u16()?,
            next_used: r.u16()?,
            name: r.array::<VIRTQ_NAME_LEN>()?,
        });
    }
    Ok(state)
}

/// Save the state of `transport` to `out`.
pub fn save_transport<C, I, W>(transport: &VirtioPciTransport<C, I>, out: W) -> Result<()>
where
    C: VirtioClient,
    I: VirtioInterrupt,
    W: Write,
{
    save(&transport.save_state(), out)
}

/// Load a state from `input` and restore `transport` with it.
///
/// The transport is only modified once the whole state was read and validated.
pub fn restore_transport<C, I, R>(transport: &VirtioPciTransport<C, I>, input: R) -> Result<()>
where
    C: VirtioClient,
    I: VirtioInterrupt,
    R: Read,
{
    let state = load(input, transport.config().num_queues)?;
    transport
        .restore_state(&state)
        .map_err(Error::InvalidState)?;
    debug!("virtio: transport restored from saved state");
    Ok(())
}
