//! Tuple representation and serialization.
//!
//! Payload format:
//! ```text
//! +--------------------------------+------------------------------+
//! | fixed region (one slot/column) | variable region              |
//! |   value bytes, or u32 offset --+--> u32 len | payload bytes   |
//! +--------------------------------+------------------------------+
//! ```

use crate::schema::Schema;
use crate::value::Value;
use bytes::{BufMut, BytesMut};
use kestrel_common::Rid;

/// A tuple: either an owned payload produced from typed values, or a
/// shell holding only an RID into the table heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    rid: Rid,
    data: Vec<u8>,
}

impl Tuple {
    /// Builds an owned tuple from `values` laid out per `schema`.
    pub fn from_values(values: &[Value], schema: &Schema) -> Self {
        assert_eq!(
            values.len(),
            schema.column_count(),
            "value count must match schema"
        );

        let var_len: usize = values
            .iter()
            .filter_map(|v| match v {
                Value::Varchar(s) => Some(4 + s.len()),
                _ => None,
            })
            .sum();

        let mut buf = BytesMut::zeroed(schema.fixed_length());
        buf.reserve(var_len);

        let mut var_offset = schema.fixed_length();
        for (i, value) in values.iter().enumerate() {
            let offset = schema.offset_of(i);
            match value {
                Value::Varchar(s) => {
                    buf[offset..offset + 4].copy_from_slice(&(var_offset as u32).to_le_bytes());
                    var_offset += 4 + s.len();
                }
                other => {
                    let size = other.type_id().fixed_size();
                    other.encode_fixed(&mut buf[offset..offset + size]);
                }
            }
        }
        for value in values {
            if let Value::Varchar(s) = value {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
        }

        Self {
            rid: Rid::INVALID,
            data: buf.to_vec(),
        }
    }

    /// A shell tuple referring into the heap; no payload owned yet.
    pub fn with_rid(rid: Rid) -> Self {
        Self {
            rid,
            data: Vec::new(),
        }
    }

    /// An owned tuple from raw payload bytes.
    pub fn from_bytes(rid: Rid, data: Vec<u8>) -> Self {
        Self { rid, data }
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Rid) {
        self.rid = rid;
    }

    /// The payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Reads the value of column `index` per `schema`.
    pub fn value(&self, schema: &Schema, index: usize) -> Value {
        let type_id = schema.type_of(index);
        let offset = schema.offset_of(index);
        if type_id.is_variable() {
            let var_offset = u32::from_le_bytes([
                self.data[offset],
                self.data[offset + 1],
                self.data[offset + 2],
                self.data[offset + 3],
            ]) as usize;
            let len = u32::from_le_bytes([
                self.data[var_offset],
                self.data[var_offset + 1],
                self.data[var_offset + 2],
                self.data[var_offset + 3],
            ]) as usize;
            let bytes = &self.data[var_offset + 4..var_offset + 4 + len];
            Value::Varchar(String::from_utf8_lossy(bytes).into_owned())
        } else {
            Value::decode_fixed(type_id, &self.data[offset..])
        }
    }
}
