//! DNA writer
//!
//! Accumulates actions for one object and emits a self-delimited record (see
//! [`super::reader`] for the layout).

use bytes::BufMut;

use super::encoding::{DnaEncoding, SECTION_END_MARKER};
use super::reader::FLAG_DELTA;
use super::serializer::{write_string, ObjectStringSerializer};
use super::{Dna, DnaAction, DnaHeader, LogicalAction, LogicalOperation, PhysicalAction, Value};
use crate::error::Result;

/// Builds one DNA record
pub struct DnaWriter<'a> {
    header: DnaHeader,
    encoding: DnaEncoding,
    serializer: &'a mut dyn ObjectStringSerializer,
    actions: Vec<u8>,
    action_count: u32,
}

impl<'a> DnaWriter<'a> {
    pub fn new(
        header: DnaHeader,
        encoding: DnaEncoding,
        serializer: &'a mut dyn ObjectStringSerializer,
    ) -> Self {
        Self {
            header,
            encoding,
            serializer,
            actions: Vec::new(),
            action_count: 0,
        }
    }

    /// Writer pre-loaded with every action of an existing DNA
    pub fn from_dna(
        dna: &Dna,
        encoding: DnaEncoding,
        serializer: &'a mut dyn ObjectStringSerializer,
    ) -> Result<Self> {
        let mut writer = Self::new(dna.header().clone(), encoding, serializer);
        for action in dna.actions()? {
            writer.add_action(&action);
        }
        Ok(writer)
    }

    pub fn action_count(&self) -> u32 {
        self.action_count
    }

    pub fn add_action(&mut self, action: &DnaAction) {
        self.encoding
            .encode_action(action, &mut self.actions, &mut *self.serializer);
        self.action_count += 1;
    }

    pub fn add_physical_action(&mut self, field: &str, value: Value, is_reference: bool) {
        self.add_action(&DnaAction::Physical(PhysicalAction::TruePhysical {
            field: field.to_string(),
            value,
            is_reference,
        }));
    }

    pub fn add_array_element_action(&mut self, index: i32, value: Value, is_reference: bool) {
        self.add_action(&DnaAction::Physical(PhysicalAction::ArrayElement {
            index,
            value,
            is_reference,
        }));
    }

    pub fn add_entire_array(&mut self, value: Value) {
        self.add_action(&DnaAction::Physical(PhysicalAction::EntireArray { value }));
    }

    pub fn add_sub_array_action(&mut self, start_index: i32, value: Value, length: i32) {
        self.add_action(&DnaAction::Physical(PhysicalAction::SubArray {
            start_index,
            value,
            length,
        }));
    }

    pub fn add_logical_action(&mut self, operation: LogicalOperation, parameters: Vec<Value>) {
        self.add_action(&DnaAction::Logical(LogicalAction::new(operation, parameters)));
    }

    pub fn add_literal_value(&mut self, value: Value) {
        self.add_action(&DnaAction::Literal(value));
    }

    /// Append the finished record to `out`
    pub fn finish(mut self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(self.actions.len() + 64);
        let header = &self.header;

        body.put_u8(if header.is_delta { FLAG_DELTA } else { 0 });
        body.put_i64(header.object_id.as_i64());
        body.put_i64(header.parent_object_id.as_i64());
        body.put_i64(header.version);
        body.put_i32(header.array_size);
        write_string(&mut *self.serializer, &mut body, &header.type_name);
        write_string(&mut *self.serializer, &mut body, &header.loader_description);
        body.put_i32(self.action_count as i32);
        body.put_slice(&self.actions);
        body.put_u8(SECTION_END_MARKER);

        out.put_i32(body.len() as i32);
        out.put_slice(&body);
    }
}
