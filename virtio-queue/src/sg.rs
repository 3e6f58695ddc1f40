// Copyright (C) 2024 Red Hat, Inc. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::cmp;

use vm_memory::{Address, Bytes, GuestAddress, GuestMemory};

use crate::Error;

/// One contiguous guest physical buffer of a scatter-gather list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SgSegment {
    /// Guest physical start address.
    pub addr: GuestAddress,
    /// Length of the buffer in bytes.
    pub len: u32,
}

impl SgSegment {
    /// Create a new segment.
    pub fn new(addr: GuestAddress, len: u32) -> Self {
        SgSegment { addr, len }
    }
}

/// Sequential, resettable cursor over an ordered list of guest buffers.
///
/// The cursor never hands out a range that crosses a segment boundary, and the number of
/// bytes it can consume before [`reset`](SgCursor::reset) is exactly the sum of the segment
/// lengths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SgCursor {
    segments: Vec<SgSegment>,
    total: u64,
    // Index of the segment holding the next unconsumed byte.
    seg: usize,
    // Bytes already consumed from `segments[seg]`.
    seg_off: u32,
    consumed: u64,
}

impl SgCursor {
    /// Build a cursor over `segments`, positioned at the first byte.
    pub fn new(segments: Vec<SgSegment>) -> Self {
        let total = segments.iter().map(|s| u64::from(s.len)).sum();
        let mut cursor = SgCursor {
            segments,
            total,
            seg: 0,
            seg_off: 0,
            consumed: 0,
        };
        cursor.skip_empty();
        cursor
    }

    /// Rewind to the first byte of the first segment.
    pub fn reset(&mut self) {
        self.seg = 0;
        self.seg_off = 0;
        self.consumed = 0;
        self.skip_empty();
    }

    /// The segments backing this cursor, in discovery order.
    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    /// Sum of all segment lengths.
    pub fn total_len(&self) -> u64 {
        self.total
    }

    /// Bytes consumed since construction or the last reset.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes still available to consume.
    pub fn remaining(&self) -> u64 {
        self.total - self.consumed
    }

    /// Whether every byte has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    // Moves past zero length segments and segments that were fully consumed.
    fn skip_empty(&mut self) {
        while let Some(s) = self.segments.get(self.seg) {
            if self.seg_off < s.len {
                break;
            }
            self.seg += 1;
            self.seg_off = 0;
        }
    }

    /// Consume `count` bytes across segment boundaries.
    ///
    /// Returns how many bytes were actually consumed, which is less than `count` only when
    /// the end of the list was reached.
    pub fn advance(&mut self, count: usize) -> usize {
        let mut left = count as u64;
        while left > 0 {
            let Some(s) = self.segments.get(self.seg) else {
                break;
            };
            let step = cmp::min(left, u64::from(s.len - self.seg_off));
            // `step` is bounded by a segment length, so it fits in an u32.
            self.seg_off += step as u32;
            self.consumed += step;
            left -= step;
            self.skip_empty();
        }
        count - left as usize
    }

    /// Consume up to `max_len` contiguous bytes of the current segment.
    ///
    /// Returns the guest address of the range together with its length, or `None` once the
    /// list is exhausted. A segment longer than `max_len` is handed out in several pieces.
    pub fn next_segment(&mut self, max_len: usize) -> Option<(GuestAddress, usize)> {
        if max_len == 0 {
            return None;
        }
        let s = *self.segments.get(self.seg)?;
        let addr = s.addr.checked_add(u64::from(self.seg_off))?;
        let len = cmp::min(max_len as u64, u64::from(s.len - self.seg_off)) as usize;
        self.advance(len);
        Some((addr, len))
    }

    /// Copy `src` into the guest buffers starting at the cursor position.
    ///
    /// Copying stops when either `src` or the cursor runs out; the number of bytes written is
    /// returned.
    pub fn write_from<M: GuestMemory>(&mut self, mem: &M, src: &[u8]) -> Result<usize, Error> {
        let mut done = 0;
        while done < src.len() {
            let Some((addr, len)) = self.next_segment(src.len() - done) else {
                break;
            };
            mem.write_slice(&src[done..done + len], addr)
                .map_err(Error::GuestMemory)?;
            done += len;
        }
        Ok(done)
    }

    /// Copy guest bytes at the cursor position into `dst`.
    ///
    /// Copying stops when either `dst` is full or the cursor runs out; the number of bytes
    /// read is returned.
    pub fn read_into<M: GuestMemory>(&mut self, mem: &M, dst: &mut [u8]) -> Result<usize, Error> {
        let mut done = 0;
        while done < dst.len() {
            let want = dst.len() - done;
            let Some((addr, len)) = self.next_segment(want) else {
                break;
            };
            mem.read_slice(&mut dst[done..done + len], addr)
                .map_err(Error::GuestMemory)?;
            done += len;
        }
        Ok(done)
    }
}
