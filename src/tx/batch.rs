//! Commit transaction batch codec
//!
//! Wire layout of a client commit:
//!
//! ```text
//! [batch id: i64][txn count: i32][contains sync write: bool]
//! [interned: bool][string table]
//! per transaction:
//!   [txn id: i64][type: u8][folded txn count: i32][sequence id: i64][eviction: bool]
//!   [lock count: i32][lock ids...]
//!   [root count: i32][(name, object id: i64)...]
//!   [notify count: i32][(lock id, thread id: i64, all: bool)...]
//!   [dmi count: i32][(receiver: i64, dmi call: i64, fault receiver: bool)...]
//!   [change count: i32][DNA records...]
//! ```
//!
//! The string table precedes the transactions, so the body is assembled
//! first and the table is written once every string has been interned.

use bytes::BufMut;
use std::sync::Arc;

use super::record::{DmiDescriptor, Notify, ServerTransaction, TxnOrigin, TxnType};
use crate::dna::serializer::{read_string, write_string};
use crate::dna::{
    DnaEncoding, DnaReader, DnaWriter, Input, InterningStringSerializer,
    NullObjectStringSerializer, ObjectStringSerializer, SharedSerializer,
};
use crate::error::{Error, Result};
use crate::id::{
    GlobalTransactionID, LockID, NodeID, ObjectID, SequenceID, TransactionID, TxnBatchID,
};

/// A batch of committed transactions from one client
#[derive(Debug, Clone, PartialEq)]
pub struct CommitBatch {
    pub batch_id: TxnBatchID,
    pub transactions: Vec<ServerTransaction>,
}

impl CommitBatch {
    pub fn new(batch_id: TxnBatchID, transactions: Vec<ServerTransaction>) -> Self {
        Self {
            batch_id,
            transactions,
        }
    }

    pub fn contains_sync_write(&self) -> bool {
        self.transactions
            .iter()
            .any(|t| t.txn_type == TxnType::SyncWrite)
    }

    /// Encode for the wire, interning strings when `intern` is set
    pub fn encode(&self, encoding: DnaEncoding, intern: bool) -> Result<Vec<u8>> {
        if intern {
            let mut serializer = InterningStringSerializer::new();
            self.encode_with(encoding, &mut serializer)
        } else {
            self.encode_with(encoding, &mut NullObjectStringSerializer)
        }
    }

    fn encode_with(
        &self,
        encoding: DnaEncoding,
        serializer: &mut dyn ObjectStringSerializer,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for txn in &self.transactions {
            if txn.transaction_id.is_null() {
                return Err(Error::IllegalState(format!(
                    "writing transaction with null id in batch {}",
                    self.batch_id
                )));
            }
            encode_transaction(txn, encoding, serializer, &mut body)?;
        }

        let mut out = Vec::with_capacity(body.len() + 64);
        out.put_i64(self.batch_id.as_i64());
        out.put_i32(self.transactions.len() as i32);
        out.put_u8(self.contains_sync_write() as u8);
        out.put_u8(serializer.is_interning() as u8);
        serializer.write_table(&mut out);
        out.put_slice(&body);
        Ok(out)
    }

    /// Decode a batch committed by `source`. DNA stays lazily encoded.
    pub fn decode(source: &NodeID, bytes: &[u8]) -> Result<Self> {
        let mut input = Input::new(bytes);
        let batch_id = TxnBatchID(input.read_i64()?);
        let count = input.read_len()?;
        let contains_sync_write = input.read_bool()?;
        let interned = input.read_bool()?;

        let serializer: SharedSerializer = if interned {
            let mut table = InterningStringSerializer::new();
            table.read_table(&mut input)?;
            Arc::new(table)
        } else {
            Arc::new(NullObjectStringSerializer)
        };
        let reader = DnaReader::new(serializer.clone());

        let mut transactions = Vec::with_capacity(count.min(input.remaining()));
        for _ in 0..count {
            transactions.push(decode_transaction(
                source,
                batch_id,
                &mut input,
                serializer.as_ref(),
                &reader,
            )?);
        }

        if input.remaining() != 0 {
            return Err(Error::decode(format!(
                "{} trailing bytes after batch {}",
                input.remaining(),
                batch_id
            )));
        }

        let batch = Self {
            batch_id,
            transactions,
        };
        if batch.contains_sync_write() != contains_sync_write {
            return Err(Error::decode(format!(
                "sync write flag mismatch in batch {}",
                batch_id
            )));
        }
        Ok(batch)
    }
}

fn encode_transaction(
    txn: &ServerTransaction,
    encoding: DnaEncoding,
    serializer: &mut dyn ObjectStringSerializer,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.put_i64(txn.transaction_id.as_i64());
    out.put_u8(txn.txn_type.code());
    out.put_i32(txn.num_application_txn);
    out.put_i64(txn.sequence_id.as_i64());
    out.put_u8(txn.is_eviction as u8);

    out.put_i32(txn.lock_ids.len() as i32);
    for lock in &txn.lock_ids {
        write_string(serializer, out, lock.as_str());
    }

    out.put_i32(txn.new_roots.len() as i32);
    for (name, oid) in &txn.new_roots {
        write_string(serializer, out, name);
        out.put_i64(oid.as_i64());
    }

    out.put_i32(txn.notifies.len() as i32);
    for notify in &txn.notifies {
        write_string(serializer, out, notify.lock_id.as_str());
        out.put_i64(notify.thread_id);
        out.put_u8(notify.all as u8);
    }

    out.put_i32(txn.dmis.len() as i32);
    for dmi in &txn.dmis {
        out.put_i64(dmi.receiver.as_i64());
        out.put_i64(dmi.dmi_call.as_i64());
        out.put_u8(dmi.fault_receiver as u8);
    }

    out.put_i32(txn.changes.len() as i32);
    for dna in &txn.changes {
        DnaWriter::from_dna(dna, encoding, &mut *serializer)?.finish(out);
    }
    Ok(())
}

fn decode_transaction(
    source: &NodeID,
    batch_id: TxnBatchID,
    input: &mut Input<'_>,
    serializer: &dyn ObjectStringSerializer,
    reader: &DnaReader,
) -> Result<ServerTransaction> {
    let transaction_id = TransactionID(input.read_i64()?);
    let txn_type = TxnType::from_code(input.read_u8()?)?;
    let num_application_txn = input.read_i32()?;
    let sequence_id = SequenceID(input.read_i64()?);
    let is_eviction = input.read_bool()?;

    let lock_count = input.read_len()?;
    let mut lock_ids = Vec::with_capacity(lock_count.min(input.remaining()));
    for _ in 0..lock_count {
        lock_ids.push(LockID(read_string(serializer, input)?));
    }

    let root_count = input.read_len()?;
    let mut new_roots = std::collections::BTreeMap::new();
    for _ in 0..root_count {
        let name = read_string(serializer, input)?;
        new_roots.insert(name, ObjectID(input.read_i64()?));
    }

    let notify_count = input.read_len()?;
    let mut notifies = Vec::with_capacity(notify_count.min(input.remaining()));
    for _ in 0..notify_count {
        notifies.push(Notify {
            lock_id: LockID(read_string(serializer, input)?),
            thread_id: input.read_i64()?,
            all: input.read_bool()?,
        });
    }

    let dmi_count = input.read_len()?;
    let mut dmis = Vec::with_capacity(dmi_count.min(input.remaining()));
    for _ in 0..dmi_count {
        dmis.push(DmiDescriptor {
            receiver: ObjectID(input.read_i64()?),
            dmi_call: ObjectID(input.read_i64()?),
            fault_receiver: input.read_bool()?,
        });
    }

    let change_count = input.read_len()?;
    let mut changes = Vec::with_capacity(change_count.min(input.remaining()));
    for _ in 0..change_count {
        changes.push(reader.read(input)?);
    }

    Ok(ServerTransaction {
        batch_id,
        transaction_id,
        sequence_id,
        source: source.clone(),
        lock_ids,
        changes,
        new_roots,
        notifies,
        dmis,
        txn_type,
        num_application_txn,
        is_eviction,
        is_resent: false,
        global_txn_id: GlobalTransactionID::NULL_ID,
        origin: TxnOrigin::Committed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{Dna, DnaAction, DnaHeader, LogicalAction, LogicalOperation, PhysicalAction, Value};
    use crate::id::ClientID;

    fn sample_txn(txn: i64, seq: i64) -> ServerTransaction {
        let changes = vec![
            Dna::new(
                DnaHeader::new_object(ObjectID(100 + txn), "com.acme.Cart"),
                vec![DnaAction::Physical(PhysicalAction::TruePhysical {
                    field: "com.acme.Cart.owner".into(),
                    value: Value::String("alice".into()),
                    is_reference: false,
                })],
            ),
            Dna::new(
                DnaHeader::delta(ObjectID(5), "java.util.HashMap"),
                vec![DnaAction::Logical(LogicalAction::new(
                    LogicalOperation::Put,
                    vec!["cart".into(), Value::reference(ObjectID(100 + txn))],
                ))],
            ),
        ];
        let mut t = ServerTransaction::new(
            ClientID(9),
            TxnBatchID(1),
            TransactionID(txn),
            SequenceID(seq),
            changes,
        )
        .with_locks(vec![LockID::new("@cart"), LockID::new("@users")]);
        t.new_roots.insert("carts".into(), ObjectID(5));
        t.notifies.push(Notify {
            lock_id: LockID::new("@cart"),
            thread_id: 12,
            all: true,
        });
        t
    }

    #[test]
    fn test_batch_roundtrip_interned() {
        let batch = CommitBatch::new(TxnBatchID(1), vec![sample_txn(1, 1), sample_txn(2, 2)]);
        let bytes = batch.encode(DnaEncoding::default(), true).unwrap();
        let decoded = CommitBatch::decode(&NodeID::Client(ClientID(9)), &bytes).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_interning_shrinks_batch() {
        let txns: Vec<_> = (1..=20).map(|i| sample_txn(i, i)).collect();
        let batch = CommitBatch::new(TxnBatchID(1), txns);
        let interned = batch.encode(DnaEncoding::default(), true).unwrap();
        let inline = batch.encode(DnaEncoding::default(), false).unwrap();
        assert!(interned.len() < inline.len());
    }

    #[test]
    fn test_sync_write_flag() {
        let mut txn = sample_txn(1, 1);
        txn.txn_type = TxnType::SyncWrite;
        let batch = CommitBatch::new(TxnBatchID(2), vec![txn]);
        let bytes = batch.encode(DnaEncoding::default(), false).unwrap();
        assert_eq!(bytes[12], 1);
        let decoded = CommitBatch::decode(&NodeID::Client(ClientID(9)), &bytes).unwrap();
        assert!(decoded.contains_sync_write());
    }

    #[test]
    fn test_truncated_batch() {
        let batch = CommitBatch::new(TxnBatchID(1), vec![sample_txn(1, 1)]);
        let bytes = batch.encode(DnaEncoding::default(), true).unwrap();
        let err = CommitBatch::decode(&NodeID::Client(ClientID(9)), &bytes[..bytes.len() - 3])
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
