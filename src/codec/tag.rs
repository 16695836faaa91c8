// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The wire tag space: one byte per value constructor. Kept deliberately
//! sparse (0x00..=0x13) rather than folding magnitude into the tag range —
//! see DESIGN.md for why the short forms instead spend one payload byte.

pub const NULL: u8 = 0x00;
pub const BOOL_TRUE: u8 = 0x01;
pub const BOOL_FALSE: u8 = 0x02;
pub const INT64_SHORT: u8 = 0x03;
pub const INT64_MEDIUM: u8 = 0x04;
pub const INT64_WIDE: u8 = 0x05;
pub const INT64_FULL: u8 = 0x06;
pub const UINT64_SHORT: u8 = 0x07;
pub const UINT64_MEDIUM: u8 = 0x08;
pub const UINT64_WIDE: u8 = 0x09;
pub const UINT64_FULL: u8 = 0x0A;
pub const FLOAT64: u8 = 0x0B;
pub const STRING_SHORT: u8 = 0x0C;
pub const STRING_LONG: u8 = 0x0D;
pub const BYTES_SHORT: u8 = 0x0E;
pub const BYTES_LONG: u8 = 0x0F;
pub const ARRAY_SHORT: u8 = 0x10;
pub const ARRAY_LONG: u8 = 0x11;
pub const MAP_SHORT: u8 = 0x12;
pub const MAP_LONG: u8 = 0x13;

/// Inclusive bound below which signed values take the one-byte short form.
pub const INT64_SHORT_MIN: i64 = i8::MIN as i64;
pub const INT64_SHORT_MAX: i64 = i8::MAX as i64;
/// Values above this still fit the medium (i16) form.
pub const INT64_MEDIUM_MAX: i64 = i16::MAX as i64;
pub const INT64_MEDIUM_MIN: i64 = i16::MIN as i64;
pub const INT64_WIDE_MAX: i64 = i32::MAX as i64;
pub const INT64_WIDE_MIN: i64 = i32::MIN as i64;

pub const UINT64_SHORT_MAX: u64 = u8::MAX as u64;
pub const UINT64_MEDIUM_MAX: u64 = u16::MAX as u64;
pub const UINT64_WIDE_MAX: u64 = u32::MAX as u64;

/// Strings/bytes at or under this length use the inline one-byte-length
/// short form; above it they fall back to the 4-byte-length long form.
pub const SHORT_LEN_MAX: usize = 62;

/// Arrays/maps at or under this element count use a one-byte count field.
pub const SHORT_COUNT_MAX: usize = 30;

pub fn is_known(tag: u8) -> bool {
    tag <= MAP_LONG
}
