// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::cmp;

use log::warn;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory};

use crate::defs::VIRTQ_DESCRIPTOR_SIZE;
use crate::{Descriptor, Error, LogThrottle, SgCursor, SgSegment};

// Segments reserved up front for a chain; most requests carry a header, a payload and a
// status byte.
const INITIAL_SEGMENTS: usize = 4;

/// One descriptor chain pulled from the available ring.
///
/// The chain is walked once, in a single forward pass, when it is taken off the ring. The
/// device-readable buffers end up in the OUT list and the device-writable buffers in the IN
/// list, each in discovery order. The caller owns the chain until it hands it back through
/// [`Virtq::put`](crate::Virtq::put).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorChain {
    head_index: u16,
    out: SgCursor,
    in_: SgCursor,
    truncated: bool,
}

fn push_segment(list: &mut Vec<SgSegment>, seg: SgSegment) -> Result<(), Error> {
    list.try_reserve(1).map_err(|_| Error::NoMemory)?;
    list.push(seg);
    Ok(())
}

impl DescriptorChain {
    /// Walk the chain rooted at `head_index` in the descriptor table at `desc_table`.
    ///
    /// Indices are reduced modulo `queue_size` (taken as at least 1). The walk stops after
    /// `max_segments` descriptors even if the last one still has the next flag set, so a
    /// chain that loops back on itself yields a truncated chain instead of an endless walk.
    pub fn read<M: GuestMemory>(
        mem: &M,
        desc_table: GuestAddress,
        queue_size: u16,
        head_index: u16,
        max_segments: usize,
        throttle: &LogThrottle,
    ) -> Result<Self, Error> {
        let size = cmp::max(queue_size, 1);
        let mut out = Vec::new();
        let mut in_ = Vec::new();
        out.try_reserve(cmp::min(INITIAL_SEGMENTS, max_segments))
            .map_err(|_| Error::NoMemory)?;
        in_.try_reserve(cmp::min(INITIAL_SEGMENTS, max_segments))
            .map_err(|_| Error::NoMemory)?;

        let mut index = head_index;
        let mut truncated = false;
        loop {
            if out.len() + in_.len() >= max_segments {
                truncated = true;
                if throttle.should_log() {
                    warn!(
                        "virtio descriptor chain at head {} exceeds {} segments, possible loop \
                         ({} occurrences)",
                        head_index,
                        max_segments,
                        throttle.count()
                    );
                }
                break;
            }

            // The offset fits easily in an u64: an u16 index times the descriptor size.
            let offset = u64::from(index % size) * VIRTQ_DESCRIPTOR_SIZE;
            let addr = desc_table
                .checked_add(offset)
                .ok_or(Error::AddressOverflow)?;
            let desc: Descriptor = mem.read_obj(addr).map_err(Error::GuestMemory)?;

            let seg = SgSegment::new(desc.addr(), desc.len());
            if desc.is_write_only() {
                push_segment(&mut in_, seg)?;
            } else {
                push_segment(&mut out, seg)?;
            }

            if !desc.has_next() {
                break;
            }
            index = desc.next();
        }

        Ok(DescriptorChain {
            head_index,
            out: SgCursor::new(out),
            in_: SgCursor::new(in_),
            truncated,
        })
    }

    /// Index of the head descriptor, reported back to the driver in the used ring.
    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    /// Whether the walk was cut short by the segment bound.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Device-readable (OUT) buffers.
    pub fn readable(&self) -> &SgCursor {
        &self.out
    }

    /// Mutable access to the device-readable (OUT) cursor.
    pub fn readable_mut(&mut self) -> &mut SgCursor {
        &mut self.out
    }

    /// Device-writable (IN) buffers.
    pub fn writable(&self) -> &SgCursor {
        &self.in_
    }

    /// Mutable access to the device-writable (IN) cursor.
    pub fn writable_mut(&mut self) -> &mut SgCursor {
        &mut self.in_
    }

    /// Total length of the device-readable buffers.
    pub fn out_len(&self) -> u64 {
        self.out.total_len()
    }

    /// Total length of the device-writable buffers.
    pub fn in_len(&self) -> u64 {
        self.in_.total_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
    use crate::mock::{DescriptorTable, MockSplitQueue};
    use vm_memory::GuestMemoryMmap;

    #[test]
    fn test_chain_classification_keeps_order() {
        let m = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
        let vq = MockSplitQueue::new(&m, 16);
        let v = vec![
            Descriptor::new(0x1000, 8, VIRTQ_DESC_F_NEXT, 1),
            Descriptor::new(0x2000, 4, VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE, 2),
            Descriptor::new(0x3000, 2, VIRTQ_DESC_F_NEXT, 3),
            Descriptor::new(0x4000, 16, VIRTQ_DESC_F_WRITE, 0),
        ];
        vq.desc_table().store_all(&v);

        let t = LogThrottle::new();
        let chain = DescriptorChain::read(&m, vq.desc_table_addr(), 16, 0, 16, &t).unwrap();
        assert_eq!(chain.head_index(), 0);
        assert!(!chain.is_truncated());
        assert_eq!(chain.out_len(), 10);
        assert_eq!(chain.in_len(), 20);
        assert_eq!(
            chain.readable().segments(),
            &[
                SgSegment::new(GuestAddress(0x1000), 8),
                SgSegment::new(GuestAddress(0x3000), 2)
            ]
        );
        assert_eq!(
            chain.writable().segments(),
            &[
                SgSegment::new(GuestAddress(0x2000), 4),
                SgSegment::new(GuestAddress(0x4000), 16)
            ]
        );
    }

    #[test]
    fn test_chain_cycle_is_bounded() {
        let m = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
        let table = DescriptorTable::new(&m, GuestAddress(0x0), 8);
        // 0 -> 1 -> 2 -> 0 -> ...
        table.store(0, Descriptor::new(0x1000, 1, VIRTQ_DESC_F_NEXT, 1));
        table.store(1, Descriptor::new(0x2000, 1, VIRTQ_DESC_F_NEXT, 2));
        table.store(2, Descriptor::new(0x3000, 1, VIRTQ_DESC_F_NEXT, 0));

        let t = LogThrottle::new();
        let chain = DescriptorChain::read(&m, GuestAddress(0), 8, 0, 8, &t).unwrap();
        assert!(chain.is_truncated());
        assert_eq!(chain.readable().segments().len(), 8);
        assert_eq!(chain.out_len(), 8);
        assert_eq!(t.count(), 1);

        // A second walk of the same loop is counted by the same throttle.
        DescriptorChain::read(&m, GuestAddress(0), 8, 1, 8, &t).unwrap();
        assert_eq!(t.count(), 2);
    }

    #[test]
    fn test_chain_next_index_wraps_by_queue_size() {
        let m = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
        let table = DescriptorTable::new(&m, GuestAddress(0x0), 4);
        // `next` = 5 is reduced to slot 1 for a queue of size 4.
        table.store(0, Descriptor::new(0x1000, 8, VIRTQ_DESC_F_NEXT, 5));
        table.store(1, Descriptor::new(0x2000, 4, VIRTQ_DESC_F_WRITE, 0));

        let t = LogThrottle::new();
        let chain = DescriptorChain::read(&m, GuestAddress(0), 4, 0, 4, &t).unwrap();
        assert_eq!(chain.out_len(), 8);
        assert_eq!(chain.in_len(), 4);

        // A zero queue size is treated as one slot instead of dividing by zero.
        let chain = DescriptorChain::read(&m, GuestAddress(0), 0, 3, 4, &t).unwrap();
        assert_eq!(chain.head_index(), 3);
        assert_eq!(chain.readable().segments()[0].addr, GuestAddress(0x1000));
    }

    #[test]
    fn test_chain_out_of_range_table() {
        let m = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap();
        let t = LogThrottle::new();
        assert!(matches!(
            DescriptorChain::read(&m, GuestAddress(0x10_0000), 4, 0, 4, &t),
            Err(Error::GuestMemory(_))
        ));
        assert!(matches!(
            DescriptorChain::read(&m, GuestAddress(u64::MAX - 8), 4, 1, 4, &t),
            Err(Error::AddressOverflow)
        ));
    }
}
