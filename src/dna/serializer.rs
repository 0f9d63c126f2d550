//! String serializers
//!
//! Class names, field names and string literals go through an
//! [`ObjectStringSerializer`]. The interning variant replaces every string
//! with a small integer id and ships the id table once per batch; the null
//! variant writes strings inline.

use bytes::BufMut;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::encoding::Input;
use crate::error::{Error, Result};

/// Serializer shared by every lazily decoded DNA of one batch
pub type SharedSerializer = Arc<dyn ObjectStringSerializer>;

/// Writes and reads string bytes, optionally through an interning table
pub trait ObjectStringSerializer: fmt::Debug + Send + Sync {
    /// Write a string (as UTF-8 bytes) to `out`
    fn write_string_bytes(&mut self, out: &mut Vec<u8>, bytes: &[u8]);

    /// Read a string previously written by `write_string_bytes`
    fn read_string_bytes(&self, input: &mut Input<'_>) -> Result<Vec<u8>>;

    /// Serialize the table (if any) so a reader can resolve ids
    fn write_table(&self, out: &mut Vec<u8>);

    /// Load a table written by `write_table`
    fn read_table(&mut self, input: &mut Input<'_>) -> Result<()>;

    /// Whether this serializer substitutes strings with ids
    fn is_interning(&self) -> bool;
}

/// Write a `&str` through a serializer
pub fn write_string(serializer: &mut dyn ObjectStringSerializer, out: &mut Vec<u8>, value: &str) {
    serializer.write_string_bytes(out, value.as_bytes());
}

/// Read a UTF-8 string through a serializer
pub fn read_string(serializer: &dyn ObjectStringSerializer, input: &mut Input<'_>) -> Result<String> {
    let bytes = serializer.read_string_bytes(input)?;
    String::from_utf8(bytes).map_err(|e| Error::decode(format!("invalid UTF-8 string: {}", e)))
}

/// Interning serializer: each distinct string is written once in the table
#[derive(Debug, Default, Clone)]
pub struct InterningStringSerializer {
    ids: HashMap<Vec<u8>, i32>,
    strings: Vec<Vec<u8>>,
}

impl InterningStringSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct strings in the table
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    fn intern(&mut self, bytes: &[u8]) -> i32 {
        if let Some(id) = self.ids.get(bytes) {
            return *id;
        }
        let id = self.strings.len() as i32;
        self.strings.push(bytes.to_vec());
        self.ids.insert(bytes.to_vec(), id);
        id
    }
}

impl ObjectStringSerializer for InterningStringSerializer {
    fn write_string_bytes(&mut self, out: &mut Vec<u8>, bytes: &[u8]) {
        let id = self.intern(bytes);
        out.put_i32(id);
    }

    fn read_string_bytes(&self, input: &mut Input<'_>) -> Result<Vec<u8>> {
        let id = input.read_i32()?;
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.strings.get(idx))
            .cloned()
            .ok_or_else(|| Error::decode(format!("unknown interned string id {}", id)))
    }

    fn write_table(&self, out: &mut Vec<u8>) {
        out.put_i32(self.strings.len() as i32);
        for s in &self.strings {
            out.put_i32(s.len() as i32);
            out.put_slice(s);
        }
    }

    fn read_table(&mut self, input: &mut Input<'_>) -> Result<()> {
        let count = input.read_len()?;
        self.ids.clear();
        self.strings.clear();
        for _ in 0..count {
            let len = input.read_len()?;
            let bytes = input.read_bytes(len)?;
            self.intern(bytes);
        }
        Ok(())
    }

    fn is_interning(&self) -> bool {
        true
    }
}

/// Serializer that writes strings inline
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObjectStringSerializer;

impl ObjectStringSerializer for NullObjectStringSerializer {
    fn write_string_bytes(&mut self, out: &mut Vec<u8>, bytes: &[u8]) {
        out.put_i32(bytes.len() as i32);
        out.put_slice(bytes);
    }

    fn read_string_bytes(&self, input: &mut Input<'_>) -> Result<Vec<u8>> {
        let len = input.read_len()?;
        Ok(input.read_bytes(len)?.to_vec())
    }

    fn write_table(&self, _out: &mut Vec<u8>) {}

    fn read_table(&mut self, _input: &mut Input<'_>) -> Result<()> {
        Ok(())
    }

    fn is_interning(&self) -> bool {
        false
    }
}
