/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Byte codec for parameter tables.
//!
//! The encoding is recursive and self-describing: each table level is
//! a `u32` count of scalar entries followed by `(key, value)` pairs,
//! then a `u32` count of sub-tables followed by `(key, table)` pairs.
//! Values are one tag byte plus payload; strings are length-prefixed;
//! numbers are 8-byte little-endian. Managed pointers serialise as
//! their textual address (`0x…`), so a round-tripped pointer re-binds
//! to the live managed buffer when one exists.
//!
//! Because the format is self-terminating it can also be decoded from
//! a bare pointer, which is how `table` return values cross the native
//! call boundary.

use crate::bridge::managed::ManagedPtr;
use crate::common::error::AgentError;
use crate::message::table::{ParamTable, Value};

const TAG_INT: u8 = 0;
const TAG_NUM: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_PTR: u8 = 4;

/// Serialises a table into its byte representation.
pub fn serialize(table: &ParamTable) -> Vec<u8> {
    let mut out = Vec::new();
    write_table(table, &mut out);
    out
}

/// Reconstructs a table from bytes produced by [`serialize`].
pub fn deserialize(bytes: &[u8]) -> Result<ParamTable, AgentError> {
    let mut source = SliceSource { bytes, offset: 0 };
    read_table(&mut source)
}

/// Reconstructs a table from a raw blob address.
///
/// # Safety
///
/// `addr` must point at a complete encoding produced by [`serialize`];
/// the decoder reads exactly the bytes the format describes.
pub unsafe fn deserialize_raw(addr: *const u8) -> Result<ParamTable, AgentError> {
    let mut source = RawSource { addr, offset: 0 };
    read_table(&mut source)
}

fn write_table(table: &ParamTable, out: &mut Vec<u8>) {
    out.extend_from_slice(&(table.data.len() as u32).to_le_bytes());
    for (key, value) in &table.data {
        write_value(key, out);
        write_value(value, out);
    }
    out.extend_from_slice(&(table.sub_tables.len() as u32).to_le_bytes());
    for (key, sub) in &table.sub_tables {
        write_value(key, out);
        write_table(sub, out);
    }
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(number) => {
            out.push(TAG_INT);
            out.extend_from_slice(&number.to_le_bytes());
        }
        Value::Num(number) => {
            out.push(TAG_NUM);
            out.extend_from_slice(&number.to_le_bytes());
        }
        Value::Bool(flag) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*flag));
        }
        Value::Str(text) => {
            out.push(TAG_STR);
            write_bytes(text.as_bytes(), out);
        }
        Value::Ptr(pointer) => {
            out.push(TAG_PTR);
            write_bytes(pointer.to_string().as_bytes(), out);
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

trait ByteSource {
    fn take(&mut self, count: usize) -> Result<Vec<u8>, AgentError>;
}

struct SliceSource<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl ByteSource for SliceSource<'_> {
    fn take(&mut self, count: usize) -> Result<Vec<u8>, AgentError> {
        let end = self.offset.checked_add(count).filter(|end| *end <= self.bytes.len());
        let Some(end) = end else {
            return Err(AgentError::Script("truncated parameter table encoding".to_string()));
        };
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice.to_vec())
    }
}

struct RawSource {
    addr: *const u8,
    offset: usize,
}

impl ByteSource for RawSource {
    fn take(&mut self, count: usize) -> Result<Vec<u8>, AgentError> {
        // The caller vouches for the blob being a complete encoding.
        let slice = unsafe { std::slice::from_raw_parts(self.addr.add(self.offset), count) };
        self.offset += count;
        Ok(slice.to_vec())
    }
}

fn read_u8(source: &mut impl ByteSource) -> Result<u8, AgentError> {
    Ok(source.take(1)?[0])
}

fn read_u32(source: &mut impl ByteSource) -> Result<u32, AgentError> {
    let bytes = source.take(4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("four bytes requested")))
}

fn read_block(source: &mut impl ByteSource) -> Result<Vec<u8>, AgentError> {
    let length = read_u32(source)? as usize;
    source.take(length)
}

fn read_value(source: &mut impl ByteSource) -> Result<Value, AgentError> {
    match read_u8(source)? {
        TAG_INT => {
            let bytes = source.take(8)?;
            Ok(Value::Int(i64::from_le_bytes(bytes.try_into().expect("eight bytes requested"))))
        }
        TAG_NUM => {
            let bytes = source.take(8)?;
            Ok(Value::Num(f64::from_le_bytes(bytes.try_into().expect("eight bytes requested"))))
        }
        TAG_BOOL => Ok(Value::Bool(read_u8(source)? != 0)),
        TAG_STR => {
            let bytes = read_block(source)?;
            String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|_| AgentError::Script("invalid string in parameter table encoding".to_string()))
        }
        TAG_PTR => {
            let bytes = read_block(source)?;
            let text = String::from_utf8(bytes)
                .map_err(|_| AgentError::Script("invalid pointer text in parameter table encoding".to_string()))?;
            let digits = text.trim_start_matches("0x");
            let addr = usize::from_str_radix(digits, 16)
                .map_err(|_| AgentError::Script(format!("invalid pointer address '{text}'")))?;
            Ok(Value::Ptr(ManagedPtr::from_addr(addr)))
        }
        tag => Err(AgentError::Script(format!("unknown value tag {tag} in parameter table encoding"))),
    }
}

fn read_table(source: &mut impl ByteSource) -> Result<ParamTable, AgentError> {
    let mut table = ParamTable::new();
    let data_count = read_u32(source)?;
    for _ in 0..data_count {
        let key = read_value(source)?;
        let value = read_value(source)?;
        table.data.insert(key, value);
    }
    let sub_count = read_u32(source)?;
    for _ in 0..sub_count {
        let key = read_value(source)?;
        let sub = read_table(source)?;
        table.sub_tables.insert(key, sub);
    }
    Ok(table)
}
