//! Tracks the live operations of one connection by client-chosen ID.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::protocol::types::OperationId;

/// A live operation: the cancellation handle of its producer task. The token
/// is a child of the session token, so session shutdown reaches every
/// producer without touching the registry.
#[derive(Debug)]
pub(crate) struct Operation {
    cancel: CancellationToken,
}

impl Operation {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signals the producer to stop. Returns once the token is cancelled, not
    /// once the producer has drained.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The set of operations currently live on a connection, keyed by the
/// client-chosen operation ID. All mutations are serialized under a single
/// lock; IDs are unique at any point in time.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    operations: RwLock<HashMap<OperationId, Operation>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            operations: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new operation. Fails without inserting when the ID is
    /// already live; the caller applies the collision policy.
    pub(crate) async fn add(
        &self,
        id: OperationId,
        operation: Operation,
    ) -> Result<(), Collision> {
        let mut map = self.operations.write().await;
        if map.contains_key(&id) {
            return Err(Collision);
        }
        map.insert(id, operation);
        Ok(())
    }

    /// Removes and returns the operation for `id`, if it is live.
    pub(crate) async fn remove(&self, id: &OperationId) -> Option<Operation> {
        self.operations.write().await.remove(id)
    }

    /// Cancels every live operation and empties the registry. Returns after
    /// the cancellation handles have been signalled; producer drain is
    /// awaited by the connection.
    pub(crate) async fn cancel_all(&self) {
        let mut map = self.operations.write().await;
        for (_, operation) in map.drain() {
            operation.stop();
        }
    }

    /// The IDs of all live operations.
    pub(crate) async fn active_ids(&self) -> Vec<OperationId> {
        self.operations.read().await.keys().cloned().collect()
    }
}

/// Marker for an `add` with an already-live ID.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Collision;

#[cfg(test)]
mod tests {
    use super::*;

    fn operation() -> (Operation, CancellationToken) {
        let token = CancellationToken::new();
        (Operation::new(token.clone()), token)
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = Registry::new();
        let id = OperationId("op-1".to_string());
        let (op, _token) = operation();
        registry.add(id.clone(), op).await.unwrap();
        assert_eq!(registry.active_ids().await.len(), 1);
        assert!(registry.remove(&id).await.is_some());
        assert!(registry.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_add_rejects_live_id() {
        let registry = Registry::new();
        let id = OperationId("op-1".to_string());
        let (first, _t1) = operation();
        let (second, _t2) = operation();
        registry.add(id.clone(), first).await.unwrap();
        assert_eq!(registry.add(id.clone(), second).await, Err(Collision));
        // The original registration is untouched.
        assert_eq!(registry.active_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_signals_every_operation() {
        let registry = Registry::new();
        let (op_a, token_a) = operation();
        let (op_b, token_b) = operation();
        registry.add(OperationId("a".to_string()), op_a).await.unwrap();
        registry.add(OperationId("b".to_string()), op_b).await.unwrap();
        registry.cancel_all().await;
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
        assert!(registry.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_does_not_cancel() {
        let registry = Registry::new();
        let id = OperationId("op-1".to_string());
        let (op, token) = operation();
        registry.add(id.clone(), op).await.unwrap();
        let removed = registry.remove(&id).await.unwrap();
        assert!(!token.is_cancelled());
        removed.stop();
        assert!(token.is_cancelled());
    }
}
