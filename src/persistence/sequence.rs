//! Block-reserving persistent sequence
//!
//! Values are handed out from an in-memory block; a new block is reserved
//! from the [`SequencePersistor`] when the current one runs out, so values
//! never repeat across restarts.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::SequencePersistor;
use crate::error::Result;

#[derive(Debug)]
struct Block {
    next: i64,
    end: i64,
}

/// Named sequence backed by a persistor
pub struct PersistentSequence {
    name: String,
    persistor: Arc<dyn SequencePersistor>,
    block_size: i64,
    block: Mutex<Block>,
}

impl PersistentSequence {
    pub fn new(name: impl Into<String>, persistor: Arc<dyn SequencePersistor>, block_size: i64) -> Self {
        Self {
            name: name.into(),
            persistor,
            block_size: block_size.max(1),
            block: Mutex::new(Block { next: 0, end: 0 }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next single value
    pub async fn next(&self) -> Result<i64> {
        let (start, _) = self.next_batch(1).await?;
        Ok(start)
    }

    /// Reserve `count` consecutive values, returning `[start, end)`
    pub async fn next_batch(&self, count: i64) -> Result<(i64, i64)> {
        let count = count.max(1);
        let mut block = self.block.lock().await;
        if block.end - block.next < count {
            let (start, end) = self
                .persistor
                .reserve(&self.name, count.max(self.block_size))
                .await?;
            tracing::debug!(sequence = %self.name, start, end, "Reserved sequence block");
            *block = Block { next: start, end };
        }
        let start = block.next;
        block.next += count;
        Ok((start, block.next))
    }

    /// Never hand out a value below `value` from now on
    pub async fn advance_to(&self, value: i64) -> Result<()> {
        let mut block = self.block.lock().await;
        self.persistor.set_min_next(&self.name, value).await?;
        if block.next < value {
            // Drop the in-memory block; the next call reserves above `value`
            *block = Block { next: 0, end: 0 };
        }
        Ok(())
    }
}

impl std::fmt::Debug for PersistentSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentSequence")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .finish()
    }
}
