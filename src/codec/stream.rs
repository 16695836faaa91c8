// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The self-describing wire stream (C1): a fixed-width header followed by a
//! tagged, variable-width body. Read and write cursors advance
//! independently, which is what lets a session echo a cached response body
//! (re-reading from the start) while a handler is still appending a fresh
//! one to a different stream pulled from the same pool.

use std::sync::atomic::{AtomicU64, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U64 as ZU64};

use super::tag;
use super::value::Value;
use crate::error::{ErrorLevel, RpcError};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Wire layout of the fixed header: `kind(1) + callback_id(8) + depth(2) +
/// session_id(8) + sequence(8)`, all little-endian. A zero-copy view over
/// the first [`HEADER_LEN`] bytes of a frame, mirroring the teacher's BHS
/// structs. `sequence` is the per-connection monotonic counter the
/// handshake and control-stream path use to detect stale/replayed streams
/// (spec §4.7's "sequence > 0" handshake check and ctrl_sequence/
/// data_sequence ordering).
#[repr(C)]
#[derive(Debug, Default, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    kind: u8,
    callback_id: ZU64<LittleEndian>,
    depth: U16<LittleEndian>,
    session_id: ZU64<LittleEndian>,
    sequence: ZU64<LittleEndian>,
}

/// The control/data classification carried in the header's `kind` byte.
/// Values fixed at 1..=6 and 10..=12 to match the wire contract; everything
/// else is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Init,
    InitBack,
    RequestIds,
    RequestIdsBack,
    Ping,
    Pong,
    RpcRequest,
    RpcResponseOk,
    RpcResponseError,
    Unknown(u8),
}

impl StreamKind {
    pub fn to_byte(self) -> u8 {
        match self {
            StreamKind::Init => 1,
            StreamKind::InitBack => 2,
            StreamKind::RequestIds => 3,
            StreamKind::RequestIdsBack => 4,
            StreamKind::Ping => 5,
            StreamKind::Pong => 6,
            StreamKind::RpcRequest => 10,
            StreamKind::RpcResponseOk => 11,
            StreamKind::RpcResponseError => 12,
            StreamKind::Unknown(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => StreamKind::Init,
            2 => StreamKind::InitBack,
            3 => StreamKind::RequestIds,
            4 => StreamKind::RequestIdsBack,
            5 => StreamKind::Ping,
            6 => StreamKind::Pong,
            10 => StreamKind::RpcRequest,
            11 => StreamKind::RpcResponseOk,
            12 => StreamKind::RpcResponseError,
            other => StreamKind::Unknown(other),
        }
    }
}

/// `kind(1) + callback_id(8) + depth(2) + session_id(8) + sequence(8)`, all
/// little-endian, at fixed offsets.
pub const HEADER_LEN: usize = 1 + 8 + 2 + 8 + 8;

/// A reusable stream buffer: fixed header fields plus a tagged body with
/// independent read/write cursors.
#[derive(Debug, Clone)]
pub struct Stream {
    id: u64,
    kind: StreamKind,
    callback_id: u64,
    depth: u16,
    session_id: u64,
    sequence: u64,
    body: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub fn new() -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            kind: StreamKind::Unknown(0),
            callback_id: 0,
            depth: 0,
            session_id: 0,
            sequence: 0,
            body: Vec::new(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: StreamKind) {
        self.kind = kind;
    }

    pub fn callback_id(&self) -> u64 {
        self.callback_id
    }

    pub fn set_callback_id(&mut self, id: u64) {
        self.callback_id = id;
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn set_depth(&mut self, depth: u16) {
        self.depth = depth;
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn set_session_id(&mut self, id: u64) {
        self.session_id = id;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Resets the read cursor to the start of the body, for retransmission
    /// or re-reading a cached response.
    pub fn set_read_pos_to_body_start(&mut self) {
        self.read_pos = 0;
    }

    /// Resets the write cursor to the start of the body, discarding
    /// whatever had been written, so a pooled stream can be rebuilt from
    /// scratch.
    pub fn set_write_pos_to_body_start(&mut self) {
        self.write_pos = 0;
        self.body.truncate(0);
    }

    pub fn finished_read(&self) -> bool {
        self.read_pos >= self.body.len()
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Clears header fields and body, leaving the stream ready for reuse
    /// via the pool (C2).
    pub fn reset(&mut self) {
        self.kind = StreamKind::Unknown(0);
        self.callback_id = 0;
        self.depth = 0;
        self.session_id = 0;
        self.sequence = 0;
        self.body.truncate(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn write_raw(&mut self, data: &[u8]) {
        self.body.truncate(self.write_pos);
        self.body.extend_from_slice(data);
        self.write_pos = self.body.len();
    }

    fn peek_tag(&self) -> Option<u8> {
        self.body.get(self.read_pos).copied()
    }

    fn read_raw(&mut self, len: usize) -> Option<&[u8]> {
        if self.read_pos + len > self.body.len() {
            return None;
        }
        let slice = &self.body[self.read_pos..self.read_pos + len];
        self.read_pos += len;
        Some(slice)
    }

    // ---- header (de)serialization -------------------------------------

    pub fn encode_header(&self, out: &mut Vec<u8>) {
        let header = RawHeader {
            kind: self.kind.to_byte(),
            callback_id: ZU64::new(self.callback_id),
            depth: U16::new(self.depth),
            session_id: ZU64::new(self.session_id),
            sequence: ZU64::new(self.sequence),
        };
        out.extend_from_slice(header.as_bytes());
    }

    pub fn decode_header(bytes: &[u8]) -> Result<(StreamKind, u64, u16, u64, u64), RpcError> {
        if bytes.len() < HEADER_LEN {
            return Err(RpcError::protocol(
                10,
                ErrorLevel::Warn,
                format!("short header: {} < {HEADER_LEN}", bytes.len()),
            ));
        }
        let header = RawHeader::ref_from_bytes(&bytes[..HEADER_LEN]).map_err(|_| {
            RpcError::protocol(11, ErrorLevel::Warn, "malformed header layout")
        })?;
        Ok((
            StreamKind::from_byte(header.kind),
            header.callback_id.get(),
            header.depth.get(),
            header.session_id.get(),
            header.sequence.get(),
        ))
    }

    /// Serializes header + body into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        self.encode_header(&mut out);
        out.extend_from_slice(&self.body);
        out
    }

    /// Reconstructs a `Stream` from a previously-framed header+body buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RpcError> {
        let (kind, callback_id, depth, session_id, sequence) = Self::decode_header(bytes)?;
        let body = bytes[HEADER_LEN..].to_vec();
        let write_pos = body.len();
        Ok(Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            callback_id,
            depth,
            session_id,
            sequence,
            body,
            read_pos: 0,
            write_pos,
        })
    }

    // ---- scalar writers --------------------------------------------------

    pub fn write_null(&mut self) {
        self.write_raw(&[tag::NULL]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_raw(&[if v { tag::BOOL_TRUE } else { tag::BOOL_FALSE }]);
    }

    pub fn write_i64(&mut self, v: i64) {
        if (tag::INT64_SHORT_MIN..=tag::INT64_SHORT_MAX).contains(&v) {
            self.write_raw(&[tag::INT64_SHORT, v as i8 as u8]);
        } else if (tag::INT64_MEDIUM_MIN..=tag::INT64_MEDIUM_MAX).contains(&v) {
            let mut buf = [0u8; 3];
            buf[0] = tag::INT64_MEDIUM;
            buf[1..].copy_from_slice(&(v as i16).to_le_bytes());
            self.write_raw(&buf);
        } else if (tag::INT64_WIDE_MIN..=tag::INT64_WIDE_MAX).contains(&v) {
            let mut buf = [0u8; 5];
            buf[0] = tag::INT64_WIDE;
            buf[1..].copy_from_slice(&(v as i32).to_le_bytes());
            self.write_raw(&buf);
        } else {
            let mut buf = [0u8; 9];
            buf[0] = tag::INT64_FULL;
            buf[1..].copy_from_slice(&v.to_le_bytes());
            self.write_raw(&buf);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        if v <= tag::UINT64_SHORT_MAX {
            self.write_raw(&[tag::UINT64_SHORT, v as u8]);
        } else if v <= tag::UINT64_MEDIUM_MAX {
            let mut buf = [0u8; 3];
            buf[0] = tag::UINT64_MEDIUM;
            buf[1..].copy_from_slice(&(v as u16).to_le_bytes());
            self.write_raw(&buf);
        } else if v <= tag::UINT64_WIDE_MAX {
            let mut buf = [0u8; 5];
            buf[0] = tag::UINT64_WIDE;
            buf[1..].copy_from_slice(&(v as u32).to_le_bytes());
            self.write_raw(&buf);
        } else {
            let mut buf = [0u8; 9];
            buf[0] = tag::UINT64_FULL;
            buf[1..].copy_from_slice(&v.to_le_bytes());
            self.write_raw(&buf);
        }
    }

    pub fn write_f64(&mut self, v: f64) {
        let mut buf = [0u8; 9];
        buf[0] = tag::FLOAT64;
        buf[1..].copy_from_slice(&v.to_le_bytes());
        self.write_raw(&buf);
    }

    pub fn write_string(&mut self, v: &str) {
        let bytes = v.as_bytes();
        if bytes.len() <= tag::SHORT_LEN_MAX {
            let mut buf = Vec::with_capacity(2 + bytes.len());
            buf.push(tag::STRING_SHORT);
            buf.push(bytes.len() as u8);
            buf.extend_from_slice(bytes);
            self.write_raw(&buf);
        } else {
            let mut buf = Vec::with_capacity(6 + bytes.len() + 1);
            buf.push(tag::STRING_LONG);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
            buf.push(0x00);
            self.write_raw(&buf);
        }
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        if v.len() <= tag::SHORT_LEN_MAX {
            let mut buf = Vec::with_capacity(2 + v.len());
            buf.push(tag::BYTES_SHORT);
            buf.push(v.len() as u8);
            buf.extend_from_slice(v);
            self.write_raw(&buf);
        } else {
            let mut buf = Vec::with_capacity(5 + v.len());
            buf.push(tag::BYTES_LONG);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
            self.write_raw(&buf);
        }
    }

    pub fn write_value(&mut self, v: &Value) {
        match v {
            Value::Null => self.write_null(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Int64(i) => self.write_i64(*i),
            Value::Uint64(u) => self.write_u64(*u),
            Value::Float64(f) => self.write_f64(*f),
            Value::String(s) => self.write_string(s),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Array(items) => self.write_array(items),
            Value::Map(map) => self.write_map(map),
        }
    }

    /// Array/map bodies are `[tag][total-byte-length][count][items...]`;
    /// `total-byte-length` counts everything after itself (the count field
    /// plus the encoded items), so it differs between the short (1-byte
    /// count) and long (4-byte count) forms. A reader that doesn't care
    /// about the contents can skip `total-byte-length` bytes straight past
    /// the whole value — see [`Stream::skip_value`].
    pub fn write_array(&mut self, items: &[Value]) {
        let mut encoded = Vec::new();
        for item in items {
            let mut tmp = Stream::new();
            tmp.write_value(item);
            encoded.extend_from_slice(&tmp.body);
        }
        let mut buf = Vec::with_capacity(1 + 4 + 4 + encoded.len());
        if items.len() <= tag::SHORT_COUNT_MAX {
            let total_len = (1 + encoded.len()) as u32;
            buf.push(tag::ARRAY_SHORT);
            buf.extend_from_slice(&total_len.to_le_bytes());
            buf.push(items.len() as u8);
        } else {
            let total_len = (4 + encoded.len()) as u32;
            buf.push(tag::ARRAY_LONG);
            buf.extend_from_slice(&total_len.to_le_bytes());
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
        }
        buf.extend_from_slice(&encoded);
        self.write_raw(&buf);
    }

    pub fn write_map(&mut self, map: &std::collections::HashMap<String, Value>) {
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        let mut encoded = Vec::new();
        for key in &keys {
            let mut tmp = Stream::new();
            tmp.write_string(key);
            tmp.write_value(&map[*key]);
            encoded.extend_from_slice(&tmp.body);
        }
        let mut buf = Vec::with_capacity(1 + 4 + 4 + encoded.len());
        if keys.len() <= tag::SHORT_COUNT_MAX {
            let total_len = (1 + encoded.len()) as u32;
            buf.push(tag::MAP_SHORT);
            buf.extend_from_slice(&total_len.to_le_bytes());
            buf.push(keys.len() as u8);
        } else {
            let total_len = (4 + encoded.len()) as u32;
            buf.push(tag::MAP_LONG);
            buf.extend_from_slice(&total_len.to_le_bytes());
            buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
        }
        buf.extend_from_slice(&encoded);
        self.write_raw(&buf);
    }

    // ---- scalar readers ----------------------------------------------

    fn expect_tag(&mut self, want: u8) -> Result<(), RpcError> {
        match self.peek_tag() {
            Some(t) if t == want => {
                self.read_pos += 1;
                Ok(())
            }
            Some(t) => Err(RpcError::protocol(
                11,
                ErrorLevel::Warn,
                format!("unexpected tag 0x{t:02x}, wanted 0x{want:02x}"),
            )),
            None => Err(RpcError::broken_stream()),
        }
    }

    pub fn read_null(&mut self) -> Result<(), RpcError> {
        self.expect_tag(tag::NULL)
    }

    pub fn read_bool(&mut self) -> Result<bool, RpcError> {
        match self.peek_tag() {
            Some(tag::BOOL_TRUE) => {
                self.read_pos += 1;
                Ok(true)
            }
            Some(tag::BOOL_FALSE) => {
                self.read_pos += 1;
                Ok(false)
            }
            Some(t) => {
                Err(RpcError::protocol(12, ErrorLevel::Warn, format!("not a bool tag: 0x{t:02x}")))
            }
            None => Err(RpcError::broken_stream()),
        }
    }

    pub fn read_i64(&mut self) -> Result<i64, RpcError> {
        match self.peek_tag() {
            Some(tag::INT64_SHORT) => {
                self.read_pos += 1;
                let b = self.read_raw(1).ok_or_else(RpcError::broken_stream)?;
                Ok(b[0] as i8 as i64)
            }
            Some(tag::INT64_MEDIUM) => {
                self.read_pos += 1;
                let b = self.read_raw(2).ok_or_else(RpcError::broken_stream)?;
                Ok(i16::from_le_bytes(b.try_into().expect("2 bytes")) as i64)
            }
            Some(tag::INT64_WIDE) => {
                self.read_pos += 1;
                let b = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                Ok(i32::from_le_bytes(b.try_into().expect("4 bytes")) as i64)
            }
            Some(tag::INT64_FULL) => {
                self.read_pos += 1;
                let b = self.read_raw(8).ok_or_else(RpcError::broken_stream)?;
                Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
            }
            Some(t) => {
                Err(RpcError::protocol(13, ErrorLevel::Warn, format!("not an int64 tag: 0x{t:02x}")))
            }
            None => Err(RpcError::broken_stream()),
        }
    }

    pub fn read_u64(&mut self) -> Result<u64, RpcError> {
        match self.peek_tag() {
            Some(tag::UINT64_SHORT) => {
                self.read_pos += 1;
                let b = self.read_raw(1).ok_or_else(RpcError::broken_stream)?;
                Ok(b[0] as u64)
            }
            Some(tag::UINT64_MEDIUM) => {
                self.read_pos += 1;
                let b = self.read_raw(2).ok_or_else(RpcError::broken_stream)?;
                Ok(u16::from_le_bytes(b.try_into().expect("2 bytes")) as u64)
            }
            Some(tag::UINT64_WIDE) => {
                self.read_pos += 1;
                let b = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")) as u64)
            }
            Some(tag::UINT64_FULL) => {
                self.read_pos += 1;
                let b = self.read_raw(8).ok_or_else(RpcError::broken_stream)?;
                Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
            }
            Some(t) => Err(RpcError::protocol(
                14,
                ErrorLevel::Warn,
                format!("not a uint64 tag: 0x{t:02x}"),
            )),
            None => Err(RpcError::broken_stream()),
        }
    }

    pub fn read_f64(&mut self) -> Result<f64, RpcError> {
        self.expect_tag(tag::FLOAT64)?;
        let b = self.read_raw(8).ok_or_else(RpcError::broken_stream)?;
        Ok(f64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn read_string(&mut self) -> Result<String, RpcError> {
        match self.peek_tag() {
            Some(tag::STRING_SHORT) => {
                self.read_pos += 1;
                let len = self.read_raw(1).ok_or_else(RpcError::broken_stream)?[0] as usize;
                let bytes = self.read_raw(len).ok_or_else(RpcError::broken_stream)?;
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| RpcError::protocol(15, ErrorLevel::Warn, e.to_string()))
            }
            Some(tag::STRING_LONG) => {
                self.read_pos += 1;
                let len_bytes = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                let len = u32::from_le_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
                let bytes = self.read_raw(len).ok_or_else(RpcError::broken_stream)?.to_vec();
                let terminator = self.read_raw(1).ok_or_else(RpcError::broken_stream)?[0];
                if terminator != 0x00 {
                    return Err(RpcError::protocol(
                        16,
                        ErrorLevel::Warn,
                        "missing string terminator sentinel",
                    ));
                }
                String::from_utf8(bytes)
                    .map_err(|e| RpcError::protocol(15, ErrorLevel::Warn, e.to_string()))
            }
            Some(t) => {
                Err(RpcError::protocol(17, ErrorLevel::Warn, format!("not a string tag: 0x{t:02x}")))
            }
            None => Err(RpcError::broken_stream()),
        }
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, RpcError> {
        match self.peek_tag() {
            Some(tag::BYTES_SHORT) => {
                self.read_pos += 1;
                let len = self.read_raw(1).ok_or_else(RpcError::broken_stream)?[0] as usize;
                Ok(self.read_raw(len).ok_or_else(RpcError::broken_stream)?.to_vec())
            }
            Some(tag::BYTES_LONG) => {
                self.read_pos += 1;
                let len_bytes = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                let len = u32::from_le_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
                Ok(self.read_raw(len).ok_or_else(RpcError::broken_stream)?.to_vec())
            }
            Some(t) => {
                Err(RpcError::protocol(18, ErrorLevel::Warn, format!("not a bytes tag: 0x{t:02x}")))
            }
            None => Err(RpcError::broken_stream()),
        }
    }

    /// Reads the `[total-byte-length][count]` prefix for the array/map tag
    /// just consumed, returning `(total_len, count_width, count)`.
    /// `count_width` is the number of bytes the count field itself took (1
    /// for the short form, 4 for the long form), needed to check
    /// `total_len` against what's actually consumed.
    fn read_container_prefix(&mut self, short: u8, long: u8) -> Result<(u32, usize, usize), RpcError> {
        match self.peek_tag() {
            Some(t) if t == short => {
                self.read_pos += 1;
                let total_len_bytes = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                let total_len = u32::from_le_bytes(total_len_bytes.try_into().expect("4 bytes"));
                let count = self.read_raw(1).ok_or_else(RpcError::broken_stream)?[0] as usize;
                Ok((total_len, 1, count))
            }
            Some(t) if t == long => {
                self.read_pos += 1;
                let total_len_bytes = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                let total_len = u32::from_le_bytes(total_len_bytes.try_into().expect("4 bytes"));
                let count_bytes = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
                let count = u32::from_le_bytes(count_bytes.try_into().expect("4 bytes")) as usize;
                Ok((total_len, 4, count))
            }
            Some(t) => Err(RpcError::protocol(19, ErrorLevel::Warn, format!("not a container tag: 0x{t:02x}"))),
            None => Err(RpcError::broken_stream()),
        }
    }

    fn check_container_total_len(&self, total_len: u32, count_width: usize, items_start: usize) -> Result<(), RpcError> {
        let consumed = (self.read_pos - items_start) + count_width;
        if consumed as u32 != total_len {
            return Err(RpcError::protocol(
                22,
                ErrorLevel::Warn,
                format!("container total-byte-length mismatch: declared {total_len}, consumed {consumed}"),
            ));
        }
        Ok(())
    }

    pub fn read_array(&mut self) -> Result<Vec<Value>, RpcError> {
        let (total_len, count_width, count) = self.read_container_prefix(tag::ARRAY_SHORT, tag::ARRAY_LONG)?;
        let items_start = self.read_pos;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(self.read_value()?);
        }
        self.check_container_total_len(total_len, count_width, items_start)?;
        Ok(items)
    }

    pub fn read_map(&mut self) -> Result<std::collections::HashMap<String, Value>, RpcError> {
        let (total_len, count_width, count) = self.read_container_prefix(tag::MAP_SHORT, tag::MAP_LONG)?;
        let items_start = self.read_pos;
        let mut map = std::collections::HashMap::with_capacity(count.min(4096));
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_value()?;
            // duplicate keys: last one wins, matching insertion overwrite.
            map.insert(key, value);
        }
        self.check_container_total_len(total_len, count_width, items_start)?;
        Ok(map)
    }

    /// Skips the next value without fully decoding it. For arrays and maps
    /// this jumps straight over `total-byte-length` bytes rather than
    /// walking each item; scalars are cheap enough that skipping is just a
    /// decode-and-discard.
    pub fn skip_value(&mut self) -> Result<(), RpcError> {
        match self.peek_tag() {
            Some(tag::ARRAY_SHORT) | Some(tag::ARRAY_LONG) | Some(tag::MAP_SHORT) | Some(tag::MAP_LONG) => {
                self.skip_container()
            }
            _ => self.read_value().map(|_| ()),
        }
    }

    fn skip_container(&mut self) -> Result<(), RpcError> {
        let is_short = matches!(self.peek_tag(), Some(tag::ARRAY_SHORT) | Some(tag::MAP_SHORT));
        self.read_pos += 1;
        let total_len_bytes = self.read_raw(4).ok_or_else(RpcError::broken_stream)?;
        let total_len = u32::from_le_bytes(total_len_bytes.try_into().expect("4 bytes")) as usize;
        let count_width = if is_short { 1 } else { 4 };
        let remaining = total_len.checked_sub(count_width).ok_or_else(RpcError::broken_stream)?;
        self.read_raw(count_width + remaining).ok_or_else(RpcError::broken_stream)?;
        Ok(())
    }

    /// Dynamically decodes the next value by peeking its tag.
    pub fn read_value(&mut self) -> Result<Value, RpcError> {
        match self.peek_tag() {
            Some(tag::NULL) => {
                self.read_null()?;
                Ok(Value::Null)
            }
            Some(tag::BOOL_TRUE) | Some(tag::BOOL_FALSE) => Ok(Value::Bool(self.read_bool()?)),
            Some(tag::INT64_SHORT)
            | Some(tag::INT64_MEDIUM)
            | Some(tag::INT64_WIDE)
            | Some(tag::INT64_FULL) => Ok(Value::Int64(self.read_i64()?)),
            Some(tag::UINT64_SHORT)
            | Some(tag::UINT64_MEDIUM)
            | Some(tag::UINT64_WIDE)
            | Some(tag::UINT64_FULL) => Ok(Value::Uint64(self.read_u64()?)),
            Some(tag::FLOAT64) => Ok(Value::Float64(self.read_f64()?)),
            Some(tag::STRING_SHORT) | Some(tag::STRING_LONG) => Ok(Value::String(self.read_string()?)),
            Some(tag::BYTES_SHORT) | Some(tag::BYTES_LONG) => Ok(Value::Bytes(self.read_bytes()?)),
            Some(tag::ARRAY_SHORT) | Some(tag::ARRAY_LONG) => Ok(Value::Array(self.read_array()?)),
            Some(tag::MAP_SHORT) | Some(tag::MAP_LONG) => Ok(Value::Map(self.read_map()?)),
            Some(t) => Err(RpcError::protocol(21, ErrorLevel::Warn, format!("unknown tag: 0x{t:02x}"))),
            None => Err(RpcError::broken_stream()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) -> Value {
        let mut s = Stream::new();
        s.write_value(&v);
        s.set_read_pos_to_body_start();
        let out = s.read_value().expect("decode");
        assert!(s.finished_read());
        out
    }

    #[test]
    fn scalar_roundtrips() {
        assert_eq!(roundtrip(Value::Null), Value::Null);
        assert_eq!(roundtrip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(Value::Int64(-8)), Value::Int64(-8));
        assert_eq!(roundtrip(Value::Int64(32)), Value::Int64(32));
        assert_eq!(roundtrip(Value::Int64(i64::MIN)), Value::Int64(i64::MIN));
        assert_eq!(roundtrip(Value::Uint64(u64::MAX)), Value::Uint64(u64::MAX));
        assert_eq!(roundtrip(Value::Float64(1.5)), Value::Float64(1.5));
        assert_eq!(roundtrip(Value::String("hi".into())), Value::String("hi".into()));
        assert_eq!(roundtrip(Value::String("x".repeat(300))), Value::String("x".repeat(300)));
        assert_eq!(roundtrip(Value::Bytes(vec![1, 2, 3])), Value::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn array_and_map_roundtrip() {
        let arr = Value::Array(vec![Value::Int64(1), Value::String("a".into())]);
        assert_eq!(roundtrip(arr.clone()), arr);

        let many: Vec<Value> = (0..40).map(Value::Int64).collect();
        let long_arr = Value::Array(many);
        assert_eq!(roundtrip(long_arr.clone()), long_arr);

        let mut map = std::collections::HashMap::new();
        map.insert("a".to_string(), Value::Int64(1));
        map.insert("b".to_string(), Value::Bool(false));
        assert_eq!(roundtrip(Value::Map(map.clone())), Value::Map(map));
    }

    #[test]
    fn header_roundtrips() {
        let mut s = Stream::new();
        s.set_kind(StreamKind::RpcRequest);
        s.set_callback_id(42);
        s.set_depth(3);
        s.set_session_id(99);
        s.set_sequence(7);
        s.write_string("hello");
        let bytes = s.to_bytes();
        let mut decoded = Stream::from_bytes(&bytes).expect("decode header");
        assert_eq!(decoded.kind(), StreamKind::RpcRequest);
        assert_eq!(decoded.callback_id(), 42);
        assert_eq!(decoded.depth(), 3);
        assert_eq!(decoded.session_id(), 99);
        assert_eq!(decoded.sequence(), 7);
        assert_eq!(decoded.read_string().expect("read"), "hello");
    }

    #[test]
    fn skip_value_jumps_past_array_without_decoding() {
        let many: Vec<Value> = (0..40).map(Value::Int64).collect();
        let arr = Value::Array(many);
        let mut s = Stream::new();
        s.write_value(&arr);
        s.write_i64(99);
        s.set_read_pos_to_body_start();
        s.skip_value().expect("skip array");
        assert_eq!(s.read_i64().expect("read trailing"), 99);
        assert!(s.finished_read());
    }

    #[test]
    fn skip_value_jumps_past_short_array() {
        let arr = Value::Array(vec![Value::Int64(1), Value::Bool(true)]);
        let mut s = Stream::new();
        s.write_value(&arr);
        s.write_string("after");
        s.set_read_pos_to_body_start();
        s.skip_value().expect("skip array");
        assert_eq!(s.read_string().expect("read trailing"), "after");
    }

    #[test]
    fn write_pos_reset_discards_body() {
        let mut s = Stream::new();
        s.write_string("first");
        s.set_write_pos_to_body_start();
        s.write_i64(7);
        s.set_read_pos_to_body_start();
        assert_eq!(s.read_i64().expect("read"), 7);
        assert!(s.finished_read());
    }

    #[test]
    fn short_read_does_not_panic() {
        let mut s = Stream::new();
        s.write_raw(&[tag::INT64_FULL, 1, 2]);
        assert!(s.read_i64().is_err());
    }
}
