//! Ports the projection executor depends on: the search index it writes to
//! and the primary store it reads aggregate state from.
//!
//! Concrete search-engine adapters live outside this crate; the in-memory
//! adapters here back tests and local development.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use dataracy_core::AggregateRef;

/// Search index write side.
///
/// Both operations must be idempotent: repeating a call with the same input
/// leaves the index in the same state.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Full-document upsert.
    async fn index(&self, aggregate: AggregateRef, document: &JsonValue) -> Result<(), IndexError>;

    /// Merge `partial` into an existing document.
    async fn update(&self, aggregate: AggregateRef, partial: &JsonValue) -> Result<(), IndexError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("search index transport error: {0}")]
    Transport(String),
    #[error("search index call timed out after {0:?}")]
    Timeout(Duration),
    #[error("document rejected: {0}")]
    Rejected(String),
    #[error("document not found: {0}")]
    DocumentMissing(AggregateRef),
}

/// Current state of an aggregate as the search document should reflect it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateState {
    pub document: JsonValue,
    /// Soft-deleted aggregates are hidden in the index rather than removed.
    pub deleted: bool,
}

impl AggregateState {
    pub fn live(document: JsonValue) -> Self {
        Self {
            document,
            deleted: false,
        }
    }

    pub fn deleted(document: JsonValue) -> Self {
        Self {
            document,
            deleted: true,
        }
    }
}

/// Read access to the primary store.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    /// `None` when the aggregate no longer exists.
    async fn load(&self, aggregate: AggregateRef) -> Result<Option<AggregateState>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("aggregate source unavailable: {0}")]
    Unavailable(String),
    #[error("aggregate {aggregate} could not be decoded: {reason}")]
    Corrupt { aggregate: AggregateRef, reason: String },
}

/// In-memory search index keyed by aggregate.
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    documents: Mutex<HashMap<AggregateRef, JsonValue>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, aggregate: AggregateRef) -> Option<JsonValue> {
        self.documents().ok()?.get(&aggregate).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn documents(&self) -> Result<MutexGuard<'_, HashMap<AggregateRef, JsonValue>>, IndexError> {
        self.documents
            .lock()
            .map_err(|_| IndexError::Transport("index mutex poisoned".to_string()))
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index(&self, aggregate: AggregateRef, document: &JsonValue) -> Result<(), IndexError> {
        if !document.is_object() {
            return Err(IndexError::Rejected(format!(
                "{aggregate}: document must be a JSON object"
            )));
        }
        self.documents()?.insert(aggregate, document.clone());
        Ok(())
    }

    async fn update(&self, aggregate: AggregateRef, partial: &JsonValue) -> Result<(), IndexError> {
        let JsonValue::Object(fields) = partial else {
            return Err(IndexError::Rejected(format!(
                "{aggregate}: partial update must be a JSON object"
            )));
        };
        let mut documents = self.documents()?;
        let existing = documents
            .get_mut(&aggregate)
            .ok_or(IndexError::DocumentMissing(aggregate))?;
        if let JsonValue::Object(target) = existing {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// In-memory aggregate source.
#[derive(Debug, Default)]
pub struct InMemoryAggregateSource {
    states: Mutex<HashMap<AggregateRef, AggregateState>>,
}

impl InMemoryAggregateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, aggregate: AggregateRef, state: AggregateState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(aggregate, state);
        }
    }

    pub fn remove(&self, aggregate: AggregateRef) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(&aggregate);
        }
    }
}

#[async_trait]
impl AggregateSource for InMemoryAggregateSource {
    async fn load(&self, aggregate: AggregateRef) -> Result<Option<AggregateState>, SourceError> {
        let states = self
            .states
            .lock()
            .map_err(|_| SourceError::Unavailable("source mutex poisoned".to_string()))?;
        Ok(states.get(&aggregate).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn index_upsert_is_idempotent() {
        let index = InMemorySearchIndex::new();
        let doc = json!({"title": "Rainfall 2024", "deleted": false});

        index.index(AggregateRef::project(1), &doc).await.unwrap();
        let first = index.document(AggregateRef::project(1));
        index.index(AggregateRef::project(1), &doc).await.unwrap();

        assert_eq!(index.document(AggregateRef::project(1)), first);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn update_merges_and_requires_an_existing_document() {
        let index = InMemorySearchIndex::new();
        let err = index
            .update(AggregateRef::dataset(2), &json!({"deleted": true}))
            .await
            .unwrap_err();
        assert_eq!(err, IndexError::DocumentMissing(AggregateRef::dataset(2)));

        index
            .index(AggregateRef::dataset(2), &json!({"title": "t", "deleted": false}))
            .await
            .unwrap();
        index
            .update(AggregateRef::dataset(2), &json!({"deleted": true}))
            .await
            .unwrap();
        assert_eq!(
            index.document(AggregateRef::dataset(2)),
            Some(json!({"title": "t", "deleted": true}))
        );
    }

    #[tokio::test]
    async fn non_object_documents_are_rejected() {
        let index = InMemorySearchIndex::new();
        let err = index.index(AggregateRef::project(1), &json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, IndexError::Rejected(_)));
        assert!(index.is_empty());
    }
}
