// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Register map of the virtio 1.0 common configuration structure.

/// Registers of the common configuration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CommonField {
    DeviceFeatureSelect,
    DeviceFeature,
    DriverFeatureSelect,
    DriverFeature,
    ConfigMsixVector,
    NumQueues,
    DeviceStatus,
    ConfigGeneration,
    QueueSelect,
    /// A register of the queue picked by `queue_select`.
    Queue(QueueField),
}

/// Registers indexed by `queue_select`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueField {
    Size,
    MsixVector,
    Enable,
    NotifyOff,
    Desc,
    Avail,
    Used,
}

/// Which part of a register an access covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Part {
    /// The whole register.
    Full,
    /// Low 32 bits of a 64-bit register.
    Low,
    /// High 32 bits of a 64-bit register.
    High,
}

struct Register {
    offset: u32,
    len: usize,
    field: CommonField,
    read_only: bool,
}

const fn reg(offset: u32, len: usize, field: CommonField, read_only: bool) -> Register {
    Register {
        offset,
        len,
        field,
        read_only,
    }
}

const REGISTERS: [Register; 16] = [
    reg(0, 4, CommonField::DeviceFeatureSelect, false),
    reg(4, 4, CommonField::DeviceFeature, true),
    reg(8, 4, CommonField::DriverFeatureSelect, false),
    reg(12, 4, CommonField::DriverFeature, false),
    reg(16, 2, CommonField::ConfigMsixVector, false),
    reg(18, 2, CommonField::NumQueues, true),
    reg(20, 1, CommonField::DeviceStatus, false),
    reg(21, 1, CommonField::ConfigGeneration, true),
    reg(22, 2, CommonField::QueueSelect, false),
    reg(24, 2, CommonField::Queue(QueueField::Size), false),
    reg(26, 2, CommonField::Queue(QueueField::MsixVector), false),
    reg(28, 2, CommonField::Queue(QueueField::Enable), false),
    reg(30, 2, CommonField::Queue(QueueField::NotifyOff), true),
    reg(32, 8, CommonField::Queue(QueueField::Desc), false),
    reg(40, 8, CommonField::Queue(QueueField::Avail), false),
    reg(48, 8, CommonField::Queue(QueueField::Used), false),
];

/// A decoded access to the common configuration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CommonAccess {
    pub field: CommonField,
    pub part: Part,
    pub read_only: bool,
}

/// Decode an access of `len` bytes at `offset` in the structure.
///
/// An access must hit a register at its exact offset with its exact width. The 64-bit
/// registers are reached as two 32-bit halves, at the register offset and 4 bytes above it.
pub(crate) fn lookup(offset: u32, len: usize) -> Option<CommonAccess> {
    REGISTERS.iter().find_map(|r| {
        let part = if offset == r.offset && len == r.len && r.len <= 4 {
            Part::Full
        } else if r.len == 8 && len == 4 && offset == r.offset {
            Part::Low
        } else if r.len == 8 && len == 4 && offset == r.offset + 4 {
            Part::High
        } else {
            return None;
        };
        Some(CommonAccess {
            field: r.field,
            part,
            read_only: r.read_only,
        })
    })
}
