//! DNA reader
//!
//! Record layout:
//!
//! ```text
//! [body length: i32]
//! [flags: u8][object id: i64][parent id: i64][version: i64][array size: i32]
//! [type name][loader description][action count: i32]
//! [actions...][section end marker: u8]
//! ```
//!
//! The body length lets a reader skip a record without parsing it. Only the
//! header is decoded here; actions stay encoded until the cursor asks.

use bytes::Bytes;

use super::encoding::{decode_action, Input, SECTION_END_MARKER};
use super::serializer::{read_string, SharedSerializer};
use super::{Dna, DnaAction, DnaHeader};
use crate::error::{Error, Result};
use crate::id::ObjectID;

pub(crate) const FLAG_DELTA: u8 = 0x01;

/// Lazy cursor over the encoded actions of one DNA
#[derive(Debug, Clone)]
pub(crate) struct ActionCursor {
    bytes: Bytes,
    serializer: SharedSerializer,
    offset: usize,
    count: u32,
    consumed: u32,
    replayable: bool,
}

impl ActionCursor {
    pub(crate) fn is_replayable(&self) -> bool {
        self.replayable
    }

    pub(crate) fn set_replayable(&mut self, value: bool) {
        self.replayable = value;
    }

    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
        self.consumed = 0;
    }

    pub(crate) fn next_action(&mut self) -> Result<Option<DnaAction>> {
        if self.consumed == self.count {
            if self.offset != self.bytes.len() {
                return Err(Error::decode(format!(
                    "{} trailing bytes after last action",
                    self.bytes.len() - self.offset
                )));
            }
            return Ok(None);
        }
        let mut input = Input::new(&self.bytes[self.offset..]);
        let action = decode_action(&mut input, self.serializer.as_ref())?;
        self.offset += input.position();
        self.consumed += 1;
        Ok(Some(action))
    }

    pub(crate) fn decode_all(&self) -> Result<Vec<DnaAction>> {
        let mut fresh = self.clone();
        fresh.rewind();
        let mut actions = Vec::with_capacity(self.count as usize);
        while let Some(action) = fresh.next_action()? {
            actions.push(action);
        }
        Ok(actions)
    }
}

/// Reads DNA records that share one string serializer
#[derive(Debug, Clone)]
pub struct DnaReader {
    serializer: SharedSerializer,
    replayable: bool,
}

impl DnaReader {
    pub fn new(serializer: SharedSerializer) -> Self {
        Self {
            serializer,
            replayable: false,
        }
    }

    /// Produce DNA whose cursor may be rewound (object sync)
    pub fn replayable(mut self) -> Self {
        self.replayable = true;
        self
    }

    /// Read one record, leaving `input` positioned after it
    pub fn read(&self, input: &mut Input<'_>) -> Result<Dna> {
        let body_len = input.read_len()?;
        let body = input.read_bytes(body_len)?;

        let (marker, body) = body
            .split_last()
            .ok_or_else(|| Error::decode("empty DNA record"))?;
        if *marker != SECTION_END_MARKER {
            return Err(Error::decode(format!(
                "missing section end marker (found 0x{:02x})",
                marker
            )));
        }

        let mut header_input = Input::new(body);
        let serializer = self.serializer.as_ref();
        let flags = header_input.read_u8()?;
        let object_id = ObjectID(header_input.read_i64()?);
        let parent_object_id = ObjectID(header_input.read_i64()?);
        let version = header_input.read_i64()?;
        let array_size = header_input.read_i32()?;
        let type_name = read_string(serializer, &mut header_input)?;
        let loader_description = read_string(serializer, &mut header_input)?;
        let action_count = header_input.read_i32()?;
        let action_count = u32::try_from(action_count)
            .map_err(|_| Error::decode(format!("negative action count {}", action_count)))?;

        let header = DnaHeader {
            object_id,
            parent_object_id,
            type_name,
            loader_description,
            array_size,
            version,
            is_delta: flags & FLAG_DELTA != 0,
        };

        let cursor = ActionCursor {
            bytes: Bytes::copy_from_slice(&body[header_input.position()..]),
            serializer: self.serializer.clone(),
            offset: 0,
            count: action_count,
            consumed: 0,
            replayable: self.replayable,
        };
        Ok(Dna::from_cursor(header, action_count, cursor))
    }
}
