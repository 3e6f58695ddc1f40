// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use log::debug;

/// The `config_generation` counter of the common configuration.
///
/// A driver reading a multi-field device configuration compares the counter before and after
/// the reads and retries if it moved. The counter moves when bytes the driver reads differ
/// from the previous read, or when the device announced a change since the last read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ConfigGeneration {
    generation: u8,
    update_pending: bool,
    shadow: Vec<u8>,
}

impl ConfigGeneration {
    pub fn new(config_len: usize) -> Self {
        ConfigGeneration {
            shadow: vec![0; config_len],
            ..Default::default()
        }
    }

    pub fn generation(&self) -> u8 {
        self.generation
    }

    pub fn update_pending(&self) -> bool {
        self.update_pending
    }

    /// The device changed its configuration.
    pub fn set_pending(&mut self) {
        self.update_pending = true;
    }

    /// Account for a driver read of `len` bytes at `offset`, given the current contents of
    /// the whole configuration.
    pub fn on_read(&mut self, current: &[u8], offset: usize, len: usize) {
        let range = offset..offset + len;
        let changed = match (self.shadow.get(range.clone()), current.get(range)) {
            (Some(old), Some(new)) => old != new,
            _ => true,
        };
        self.shadow.clear();
        self.shadow.extend_from_slice(current);

        if changed || self.update_pending {
            self.generation = self.generation.wrapping_add(1);
            self.update_pending = false;
            debug!(
                "virtio: device config generation bumped to {}",
                self.generation
            );
        }
    }

    /// Replace the last seen configuration without bumping the counter.
    pub fn refresh_shadow(&mut self, current: &[u8]) {
        self.shadow.clear();
        self.shadow.extend_from_slice(current);
    }

    pub fn reset(&mut self) {
        self.generation = 0;
        self.update_pending = false;
    }

    pub fn restore(&mut self, generation: u8, update_pending: bool) {
        self.generation = generation;
        self.update_pending = update_pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unchanged_reads_keep_generation() {
        let mut gen = ConfigGeneration::new(4);
        let cfg = [0u8; 4];
        gen.on_read(&cfg, 0, 4);
        gen.on_read(&cfg, 1, 2);
        assert_eq!(gen.generation(), 0);
    }

    #[test]
    fn test_changed_bytes_bump_generation() {
        let mut gen = ConfigGeneration::new(4);
        gen.on_read(&[0, 0, 1, 0], 2, 1);
        assert_eq!(gen.generation(), 1);
        gen.on_read(&[0, 0, 1, 0], 2, 1);
        assert_eq!(gen.generation(), 1);

        // Only the bytes read are compared, but the whole shadow is refreshed.
        gen.on_read(&[9, 0, 1, 0], 2, 2);
        assert_eq!(gen.generation(), 1);
        gen.on_read(&[9, 0, 1, 0], 0, 1);
        assert_eq!(gen.generation(), 1);
    }

    #[test]
    fn test_pending_update() {
        let mut gen = ConfigGeneration::new(2);
        gen.set_pending();
        assert!(gen.update_pending());
        gen.on_read(&[0, 0], 0, 2);
        assert_eq!(gen.generation(), 1);
        assert!(!gen.update_pending());

        gen.restore(0xff, true);
        gen.on_read(&[0, 0], 0, 1);
        assert_eq!(gen.generation(), 0);

        gen.set_pending();
        gen.reset();
        assert_eq!(gen.generation(), 0);
        assert!(!gen.update_pending());
    }
}
