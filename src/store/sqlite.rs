//! SQLite-backed marker and entity store.
//!
//! Tables:
//! - `entities`: ingestion id to entity ref mapping
//! - `stitch_markers`: pending stitch requests with ticket and lease
//! - `entity_components`: raw ingestion fragments per entity
//! - `entity_documents`: materialized output of a stitch
//!
//! Concurrency control is optimistic: marking refreshes the ticket, and a
//! merge only commits while its ticket still matches the marker row.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use super::{DeferredStitchItem, EntityId, EntityRef, StitchStore, StitchTicket, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    entity_id   TEXT PRIMARY KEY,
    entity_ref  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_ref ON entities (entity_ref);

CREATE TABLE IF NOT EXISTS stitch_markers (
    entity_ref    TEXT PRIMARY KEY,
    stitch_ticket TEXT NOT NULL,
    requested_at  TEXT NOT NULL,
    leased_at     TEXT
);

CREATE TABLE IF NOT EXISTS entity_components (
    entity_ref   TEXT NOT NULL,
    component    TEXT NOT NULL,
    payload      TEXT NOT NULL,
    ingested_at  TEXT NOT NULL,
    PRIMARY KEY (entity_ref, component)
);

CREATE TABLE IF NOT EXISTS entity_documents (
    entity_ref   TEXT PRIMARY KEY,
    document     TEXT NOT NULL,
    stitched_at  TEXT NOT NULL
);
";

/// Marker backlog counts, for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogSummary {
    /// Markers waiting to be picked up.
    pub pending: usize,

    /// Markers currently leased to an in-flight attempt.
    pub leased: usize,

    /// Materialized documents written so far.
    pub documents: usize,
}

/// SQLite-backed implementation of [`StitchStore`].
pub struct SqliteStitchStore {
    conn: Mutex<Connection>,
}

impl SqliteStitchStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests and demos.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Register an entity so its ingestion id can be resolved later.
    pub async fn register_entity(
        &self,
        entity_id: &EntityId,
        entity_ref: &EntityRef,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO entities (entity_id, entity_ref) VALUES (?1, ?2)",
            params![entity_id, entity_ref],
        )?;
        Ok(())
    }

    /// Record a raw ingestion fragment for an entity, replacing any
    /// earlier fragment from the same component.
    pub async fn put_component(
        &self,
        entity_ref: &EntityRef,
        component: &str,
        payload: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO entity_components (entity_ref, component, payload, ingested_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entity_ref,
                component,
                serde_json::to_string(payload)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// All fragments for an entity, in ingestion order.
    pub async fn components(
        &self,
        entity_ref: &EntityRef,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT component, payload FROM entity_components
             WHERE entity_ref = ?1 ORDER BY ingested_at, component",
        )?;
        let rows = stmt.query_map(params![entity_ref], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut fragments = Vec::new();
        for row in rows {
            let (component, payload) = row?;
            fragments.push((component, serde_json::from_str(&payload)?));
        }
        Ok(fragments)
    }

    /// The ticket currently attached to an entity's marker, if any.
    pub async fn current_ticket(&self, entity_ref: &EntityRef) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        let ticket = conn
            .query_row(
                "SELECT stitch_ticket FROM stitch_markers WHERE entity_ref = ?1",
                params![entity_ref],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ticket)
    }

    /// Write the materialized document and clear the entity's marker.
    ///
    /// With a ticket, the marker is only cleared while the ticket still
    /// matches; a re-marked entity keeps its marker and will be stitched
    /// again. Without a ticket (inline stitching) any marker is cleared.
    pub async fn commit_document(
        &self,
        entity_ref: &EntityRef,
        document: &serde_json::Value,
        ticket: Option<&StitchTicket>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO entity_documents (entity_ref, document, stitched_at)
             VALUES (?1, ?2, ?3)",
            params![
                entity_ref,
                serde_json::to_string(document)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        match ticket {
            Some(ticket) => {
                conn.execute(
                    "DELETE FROM stitch_markers WHERE entity_ref = ?1 AND stitch_ticket = ?2",
                    params![entity_ref, ticket.as_str()],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM stitch_markers WHERE entity_ref = ?1",
                    params![entity_ref],
                )?;
            }
        }
        Ok(())
    }

    /// The materialized document for an entity, if one has been stitched.
    pub async fn document(&self, entity_ref: &EntityRef) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.conn.lock().await;
        let raw: Option<String> = conn
            .query_row(
                "SELECT document FROM entity_documents WHERE entity_ref = ?1",
                params![entity_ref],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Marker backlog counts.
    pub async fn backlog(&self) -> Result<BacklogSummary, StoreError> {
        let conn = self.conn.lock().await;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stitch_markers WHERE leased_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        let leased: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stitch_markers WHERE leased_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let documents: i64 =
            conn.query_row("SELECT COUNT(*) FROM entity_documents", [], |row| row.get(0))?;
        Ok(BacklogSummary {
            pending: pending as usize,
            leased: leased as usize,
            documents: documents as usize,
        })
    }

    fn upsert_marker(conn: &Connection, entity_ref: &str, now: &str) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO stitch_markers (entity_ref, stitch_ticket, requested_at, leased_at)
             VALUES (?1, ?2, ?3, NULL)
             ON CONFLICT(entity_ref) DO UPDATE SET
                 stitch_ticket = excluded.stitch_ticket,
                 leased_at = NULL",
            params![entity_ref, StitchTicket::new().as_str(), now],
        )?;
        Ok(())
    }
}

#[async_trait]
impl StitchStore for SqliteStitchStore {
    async fn mark_for_stitching(
        &self,
        entity_refs: &[EntityRef],
        entity_ids: &[EntityId],
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();

        for entity_ref in entity_refs {
            Self::upsert_marker(&conn, entity_ref, &now)?;
        }

        for entity_id in entity_ids {
            let resolved: Option<String> = conn
                .query_row(
                    "SELECT entity_ref FROM entities WHERE entity_id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .optional()?;
            match resolved {
                Some(entity_ref) => Self::upsert_marker(&conn, &entity_ref, &now)?,
                None => debug!(entity_id = %entity_id, "Skipping mark for unknown entity id"),
            }
        }

        Ok(())
    }

    async fn stitchable_entities(
        &self,
        batch_size: usize,
        stitch_timeout: Duration,
    ) -> Result<Vec<DeferredStitchItem>, StoreError> {
        let conn = self.conn.lock().await;
        let now = Utc::now();
        let lease_cutoff = (now
            - chrono::Duration::from_std(stitch_timeout).unwrap_or_else(|_| chrono::Duration::zero()))
        .to_rfc3339();

        let mut stmt = conn.prepare(
            "SELECT entity_ref, stitch_ticket, requested_at FROM stitch_markers
             WHERE leased_at IS NULL OR leased_at < ?1
             ORDER BY requested_at
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![lease_cutoff, batch_size as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (entity_ref, ticket, requested_at) = row?;
            let requested_at = DateTime::parse_from_rfc3339(&requested_at)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            items.push(DeferredStitchItem {
                entity_ref,
                stitch_ticket: Some(StitchTicket::from(ticket)),
                stitch_requested_at: requested_at,
            });
        }

        let leased_at = now.to_rfc3339();
        for item in &items {
            conn.execute(
                "UPDATE stitch_markers SET leased_at = ?1 WHERE entity_ref = ?2",
                params![leased_at, item.entity_ref],
            )?;
        }

        Ok(items)
    }

    async fn resolve_entity_ids(&self, entity_ids: &[EntityId]) -> Result<Vec<EntityRef>, StoreError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;
        let placeholders = vec!["?"; entity_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT entity_ref FROM entities WHERE entity_id IN ({placeholders})"
        ))?;
        let rows = stmt.query_map(params_from_iter(entity_ids.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut refs = Vec::new();
        for row in rows {
            refs.push(row?);
        }
        Ok(refs)
    }
}
