//! Per-client wire ordering
//!
//! Every client numbers its commit messages with a strictly increasing
//! [`SequenceID`]. The validator rejects gaps and reordering before any
//! transaction reaches the sequencer.

use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::id::{ClientID, NodeID, SequenceID};

#[derive(Debug)]
pub struct SequenceValidator {
    /// First sequence id of a client with no outstanding transactions
    start: i64,
    expected: Mutex<HashMap<ClientID, SequenceID>>,
}

impl SequenceValidator {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            expected: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a client from its handshake; the lowest outstanding id is next
    pub async fn initialize(&self, client: ClientID, outstanding: &[SequenceID]) {
        let next = outstanding
            .iter()
            .min()
            .copied()
            .unwrap_or(SequenceID(self.start + 1));
        self.expected.lock().await.insert(client, next);
    }

    pub async fn is_next(&self, client: ClientID, sequence: SequenceID) -> bool {
        self.expected.lock().await.get(&client) == Some(&sequence)
    }

    /// Check that `run` continues `client`'s sequence without gaps.
    ///
    /// Nothing is consumed; returns the id the run starts at and the id
    /// expected after it, for [`SequenceValidator::advance_to`].
    pub async fn check_run(&self, client: ClientID, run: &[SequenceID]) -> Result<(SequenceID, SequenceID)> {
        let expected = self.expected.lock().await;
        let start = *expected.get(&client).ok_or_else(|| {
            Error::Protocol(format!("{} committed before its handshake", client))
        })?;
        let mut next = start;
        for sequence in run {
            if *sequence != next {
                return Err(Error::SequenceGap {
                    node: NodeID::Client(client),
                    expected: next.as_i64(),
                    received: sequence.as_i64(),
                });
            }
            next = next.next();
        }
        Ok((start, next))
    }

    /// Consume a run checked by [`SequenceValidator::check_run`]. A no-op if
    /// the client was re-seeded in between.
    pub async fn advance_to(&self, client: ClientID, start: SequenceID, next: SequenceID) -> bool {
        let mut expected = self.expected.lock().await;
        match expected.get_mut(&client) {
            Some(current) if *current == start => {
                *current = next;
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, client: ClientID) {
        self.expected.lock().await.remove(&client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_from_lowest_outstanding() {
        let validator = SequenceValidator::new(0);
        let client = ClientID(1);
        assert!(!validator.is_next(client, SequenceID(10)).await);

        validator
            .initialize(client, &[SequenceID(12), SequenceID(10)])
            .await;
        assert!(validator.is_next(client, SequenceID(10)).await);

        let (start, next) = validator.check_run(client, &[SequenceID(10)]).await.unwrap();
        assert!(validator.advance_to(client, start, next).await);
        let err = validator.check_run(client, &[SequenceID(12)]).await.unwrap_err();
        assert!(matches!(err, Error::SequenceGap { expected: 11, received: 12, .. }));
    }

    #[tokio::test]
    async fn test_fresh_client_starts_after_start() {
        let validator = SequenceValidator::new(0);
        validator.initialize(ClientID(2), &[]).await;
        let (start, next) = validator
            .check_run(ClientID(2), &[SequenceID(1), SequenceID(2)])
            .await
            .unwrap();
        assert_eq!((start, next), (SequenceID(1), SequenceID(3)));
        validator.advance_to(ClientID(2), start, next).await;

        validator.remove(ClientID(2)).await;
        assert!(matches!(
            validator.check_run(ClientID(2), &[SequenceID(3)]).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_gap_inside_run_consumes_nothing() {
        let validator = SequenceValidator::new(0);
        let client = ClientID(3);
        validator.initialize(client, &[SequenceID(5)]).await;

        let err = validator
            .check_run(client, &[SequenceID(5), SequenceID(6), SequenceID(8)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SequenceGap { expected: 7, received: 8, .. }));
        assert!(validator.is_next(client, SequenceID(5)).await);

        // A handshake in between re-seeds the client; the stale run is dropped
        let (start, next) = validator.check_run(client, &[SequenceID(5)]).await.unwrap();
        validator.initialize(client, &[SequenceID(9)]).await;
        assert!(!validator.advance_to(client, start, next).await);
        assert!(validator.is_next(client, SequenceID(9)).await);
    }
}
