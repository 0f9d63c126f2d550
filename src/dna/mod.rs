//! DNA: Delta / New-object Actions
//!
//! A DNA describes either the full state of a shared object or a delta to
//! it, as an ordered list of actions. DNA decoded from the wire is lazy: the
//! header is parsed up front and actions are produced by a one-shot cursor.

pub mod encoding;
pub mod reader;
pub mod serializer;
pub mod writer;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::id::ObjectID;

pub use encoding::{DnaEncoding, Input, PrimitiveArray, Value};
pub use reader::DnaReader;
pub use serializer::{
    InterningStringSerializer, NullObjectStringSerializer, ObjectStringSerializer,
    SharedSerializer,
};
pub use writer::DnaWriter;

/// Array size of a DNA that does not describe an array
pub const NULL_ARRAY_SIZE: i32 = -1;

/// Eagerly decoded part of a DNA record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnaHeader {
    pub object_id: ObjectID,
    pub parent_object_id: ObjectID,
    pub type_name: String,
    pub loader_description: String,
    pub array_size: i32,
    pub version: i64,
    pub is_delta: bool,
}

impl DnaHeader {
    /// Header for the full state of a new object
    pub fn new_object(object_id: ObjectID, type_name: impl Into<String>) -> Self {
        Self {
            object_id,
            parent_object_id: ObjectID::NULL_ID,
            type_name: type_name.into(),
            loader_description: String::new(),
            array_size: NULL_ARRAY_SIZE,
            version: -1,
            is_delta: false,
        }
    }

    /// Header for a delta to an existing object
    pub fn delta(object_id: ObjectID, type_name: impl Into<String>) -> Self {
        Self {
            is_delta: true,
            ..Self::new_object(object_id, type_name)
        }
    }

    pub fn with_parent(mut self, parent: ObjectID) -> Self {
        self.parent_object_id = parent;
        self
    }

    pub fn with_array_size(mut self, size: i32) -> Self {
        self.array_size = size;
        self
    }

    pub fn with_loader(mut self, loader: impl Into<String>) -> Self {
        self.loader_description = loader.into();
        self
    }
}

/// A physical write. Exactly one shape is active per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalAction {
    TruePhysical {
        field: String,
        value: Value,
        is_reference: bool,
    },
    ArrayElement {
        index: i32,
        value: Value,
        is_reference: bool,
    },
    EntireArray {
        value: Value,
    },
    SubArray {
        start_index: i32,
        value: Value,
        length: i32,
    },
}

impl PhysicalAction {
    pub fn is_true_physical(&self) -> bool {
        matches!(self, PhysicalAction::TruePhysical { .. })
    }

    pub fn is_array_element(&self) -> bool {
        matches!(self, PhysicalAction::ArrayElement { .. })
    }

    pub fn is_entire_array(&self) -> bool {
        matches!(self, PhysicalAction::EntireArray { .. })
    }

    pub fn is_sub_array(&self) -> bool {
        matches!(self, PhysicalAction::SubArray { .. })
    }

    /// The written value, whatever the shape
    pub fn value(&self) -> &Value {
        match self {
            PhysicalAction::TruePhysical { value, .. }
            | PhysicalAction::ArrayElement { value, .. }
            | PhysicalAction::EntireArray { value }
            | PhysicalAction::SubArray { value, .. } => value,
        }
    }

    pub fn is_reference(&self) -> bool {
        match self {
            PhysicalAction::TruePhysical { is_reference, .. }
            | PhysicalAction::ArrayElement { is_reference, .. } => *is_reference,
            _ => false,
        }
    }

    pub fn field_name(&self) -> Result<&str> {
        match self {
            PhysicalAction::TruePhysical { field, .. } => Ok(field),
            other => Err(Error::IllegalState(format!(
                "field name requested from {}",
                other.shape()
            ))),
        }
    }

    pub fn array_index(&self) -> Result<i32> {
        match self {
            PhysicalAction::ArrayElement { index, .. } => Ok(*index),
            other => Err(Error::IllegalState(format!(
                "array index requested from {}",
                other.shape()
            ))),
        }
    }

    pub fn start_index(&self) -> Result<i32> {
        match self {
            PhysicalAction::SubArray { start_index, .. } => Ok(*start_index),
            other => Err(Error::IllegalState(format!(
                "start index requested from {}",
                other.shape()
            ))),
        }
    }

    pub fn length(&self) -> Result<i32> {
        match self {
            PhysicalAction::SubArray { length, .. } => Ok(*length),
            other => Err(Error::IllegalState(format!(
                "sub-array length requested from {}",
                other.shape()
            ))),
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            PhysicalAction::TruePhysical { .. } => "true physical action",
            PhysicalAction::ArrayElement { .. } => "array element action",
            PhysicalAction::EntireArray { .. } => "entire array action",
            PhysicalAction::SubArray { .. } => "sub-array action",
        }
    }
}

/// Logical mutation replayed against a managed collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOperation {
    Add,
    AddAt,
    AddAll,
    AddAllAt,
    AddFirst,
    AddLast,
    Clear,
    Put,
    PutAll,
    Remove,
    RemoveAt,
    RemoveRange,
    RemoveFirst,
    RemoveLast,
    Set,
    SetSize,
    Destroy,
    ClearLocalCache,
    SetLastAccessedTime,
}

impl LogicalOperation {
    const ALL: [LogicalOperation; 19] = [
        LogicalOperation::Add,
        LogicalOperation::AddAt,
        LogicalOperation::AddAll,
        LogicalOperation::AddAllAt,
        LogicalOperation::AddFirst,
        LogicalOperation::AddLast,
        LogicalOperation::Clear,
        LogicalOperation::Put,
        LogicalOperation::PutAll,
        LogicalOperation::Remove,
        LogicalOperation::RemoveAt,
        LogicalOperation::RemoveRange,
        LogicalOperation::RemoveFirst,
        LogicalOperation::RemoveLast,
        LogicalOperation::Set,
        LogicalOperation::SetSize,
        LogicalOperation::Destroy,
        LogicalOperation::ClearLocalCache,
        LogicalOperation::SetLastAccessedTime,
    ];

    /// Wire code
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| Error::decode(format!("unknown logical operation {}", code)))
    }
}

/// A logical action: operation plus parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalAction {
    pub operation: LogicalOperation,
    pub parameters: Vec<Value>,
}

impl LogicalAction {
    pub fn new(operation: LogicalOperation, parameters: Vec<Value>) -> Self {
        Self {
            operation,
            parameters,
        }
    }
}

/// One entry of a DNA's action list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DnaAction {
    Physical(PhysicalAction),
    Logical(LogicalAction),
    Literal(Value),
}

#[derive(Debug, Clone)]
enum ActionSource {
    Encoded(reader::ActionCursor),
    Materialized {
        actions: Arc<[DnaAction]>,
        next: usize,
        replayable: bool,
    },
}

/// A decoded (or locally built) DNA
#[derive(Debug, Clone)]
pub struct Dna {
    header: DnaHeader,
    action_count: u32,
    source: ActionSource,
    versionized: bool,
}

impl Dna {
    /// Build a DNA in memory from its actions
    pub fn new(header: DnaHeader, actions: Vec<DnaAction>) -> Self {
        Self {
            header,
            action_count: actions.len() as u32,
            source: ActionSource::Materialized {
                actions: actions.into(),
                next: 0,
                replayable: false,
            },
            versionized: false,
        }
    }

    pub(crate) fn from_cursor(header: DnaHeader, action_count: u32, cursor: reader::ActionCursor) -> Self {
        Self {
            header,
            action_count,
            source: ActionSource::Encoded(cursor),
            versionized: false,
        }
    }

    /// Encode as a standalone record (strings inline)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut serializer = NullObjectStringSerializer;
        let mut out = Vec::new();
        DnaWriter::from_dna(self, DnaEncoding::default(), &mut serializer)?.finish(&mut out);
        Ok(out)
    }

    /// Decode a standalone record written by [`Dna::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let reader = DnaReader::new(Arc::new(NullObjectStringSerializer));
        reader.read(&mut Input::new(bytes))
    }

    pub fn header(&self) -> &DnaHeader {
        &self.header
    }

    pub fn object_id(&self) -> ObjectID {
        self.header.object_id
    }

    pub fn parent_object_id(&self) -> ObjectID {
        self.header.parent_object_id
    }

    pub fn type_name(&self) -> &str {
        &self.header.type_name
    }

    pub fn loader_description(&self) -> &str {
        &self.header.loader_description
    }

    pub fn array_size(&self) -> i32 {
        self.header.array_size
    }

    pub fn has_array_size(&self) -> bool {
        self.header.array_size != NULL_ARRAY_SIZE
    }

    pub fn version(&self) -> i64 {
        self.header.version
    }

    pub fn is_delta(&self) -> bool {
        self.header.is_delta
    }

    pub fn action_count(&self) -> u32 {
        self.action_count
    }

    /// Whether the cursor may be rewound
    pub fn is_replayable(&self) -> bool {
        match &self.source {
            ActionSource::Encoded(cursor) => cursor.is_replayable(),
            ActionSource::Materialized { replayable, .. } => *replayable,
        }
    }

    /// Allow (or forbid) rewinding the cursor
    pub fn set_replayable(&mut self, value: bool) {
        match &mut self.source {
            ActionSource::Encoded(cursor) => cursor.set_replayable(value),
            ActionSource::Materialized { replayable, .. } => *replayable = value,
        }
    }

    /// Next action from the cursor, `None` when exhausted
    pub fn next_action(&mut self) -> Result<Option<DnaAction>> {
        match &mut self.source {
            ActionSource::Encoded(cursor) => cursor.next_action(),
            ActionSource::Materialized { actions, next, .. } => {
                let action = actions.get(*next).cloned();
                if action.is_some() {
                    *next += 1;
                }
                Ok(action)
            }
        }
    }

    /// Rewind the cursor to the first action
    pub fn reset(&mut self) -> Result<()> {
        if !self.is_replayable() {
            return Err(Error::Unsupported(format!(
                "reset on a one-shot cursor for {}",
                self.header.object_id
            )));
        }
        match &mut self.source {
            ActionSource::Encoded(cursor) => cursor.rewind(),
            ActionSource::Materialized { next, .. } => *next = 0,
        }
        Ok(())
    }

    /// Every action, decoded independently of the cursor position
    pub fn actions(&self) -> Result<Vec<DnaAction>> {
        match &self.source {
            ActionSource::Encoded(cursor) => cursor.decode_all(),
            ActionSource::Materialized { actions, .. } => Ok(actions.to_vec()),
        }
    }

    /// Re-stamp the version without touching the encoded actions
    pub fn versionized(mut self, version: i64) -> Self {
        self.header.version = version;
        self.versionized = true;
        self
    }

    pub fn is_versionized(&self) -> bool {
        self.versionized
    }
}

impl PartialEq for Dna {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.versionized == other.versionized
            && matches!((self.actions(), other.actions()), (Ok(a), Ok(b)) if a == b)
    }
}

#[derive(Serialize, Deserialize)]
struct DnaSnapshot {
    header: DnaHeader,
    actions: Vec<DnaAction>,
    replayable: bool,
    versionized: bool,
}

impl Serialize for Dna {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let snapshot = DnaSnapshot {
            header: self.header.clone(),
            actions: self.actions().map_err(serde::ser::Error::custom)?,
            replayable: self.is_replayable(),
            versionized: self.versionized,
        };
        snapshot.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Dna {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let snapshot = DnaSnapshot::deserialize(deserializer)?;
        let mut dna = Dna::new(snapshot.header, snapshot.actions);
        dna.set_replayable(snapshot.replayable);
        dna.versionized = snapshot.versionized;
        Ok(dna)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Malformed DNA for tests

    use super::*;

    /// A delta for `object_id` whose header reads fine but whose one action
    /// carries an unknown action type
    pub fn undecodable(object_id: ObjectID) -> Dna {
        let header = DnaHeader::delta(object_id, "com.acme.Counter");
        let empty = Dna::new(header.clone(), vec![]).encode().unwrap();
        let mut bytes = Dna::new(header, vec![DnaAction::Literal(Value::Int(1))])
            .encode()
            .unwrap();
        // Actions start where the empty record's end marker sits
        bytes[empty.len() - 1] = 0xEE;
        Dna::decode(&bytes).unwrap()
    }
}
