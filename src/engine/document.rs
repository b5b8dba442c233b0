//! Reference merge engine over the SQLite store.
//!
//! Fragments are applied in ingestion order; later fragments win per
//! top-level key. Non-object fragments land under their component name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::store::{EntityRef, SqliteStitchStore, StitchTicket};

use super::{MergeEngine, MergeError, MergeOutput};

/// Merges an entity's JSON component fragments into one document.
pub struct DocumentMerger {
    store: Arc<SqliteStitchStore>,
}

impl DocumentMerger {
    pub fn new(store: Arc<SqliteStitchStore>) -> Self {
        Self { store }
    }

    fn merge_fragments(fragments: &[(String, Value)]) -> Value {
        let mut doc = serde_json::Map::new();
        for (component, payload) in fragments {
            match payload {
                Value::Object(map) => {
                    for (key, value) in map {
                        doc.insert(key.clone(), value.clone());
                    }
                }
                other => {
                    doc.insert(component.clone(), other.clone());
                }
            }
        }
        Value::Object(doc)
    }
}

#[async_trait]
impl MergeEngine for DocumentMerger {
    fn name(&self) -> &str {
        "document"
    }

    async fn perform_stitching(
        &self,
        entity_ref: &EntityRef,
        ticket: Option<&StitchTicket>,
    ) -> Result<MergeOutput, MergeError> {
        if let Some(ticket) = ticket {
            let current = self.store.current_ticket(entity_ref).await?;
            if current.as_deref() != Some(ticket.as_str()) {
                return Err(MergeError::StaleTicket {
                    entity_ref: entity_ref.clone(),
                    ticket: ticket.to_string(),
                });
            }
        }

        let fragments = self.store.components(entity_ref).await?;
        if fragments.is_empty() {
            return Err(MergeError::EntityNotFound(entity_ref.clone()));
        }

        let document = Self::merge_fragments(&fragments);
        self.store
            .commit_document(entity_ref, &document, ticket)
            .await?;

        debug!(
            entity_ref = %entity_ref,
            components = fragments.len(),
            "Merged entity document"
        );

        Ok(MergeOutput {
            entity_ref: entity_ref.clone(),
            components_merged: fragments.len(),
            document,
        })
    }
}
