//! Identity mapping store
//!
//! Maps `(group, original_handle)` to a registered identity. A mapping row is
//! written only after the identity is confirmed by an [`IdentitySource`],
//! and the write itself is a single `INSERT .. ON CONFLICT` statement, so
//! concurrent upserts for the same key resolve to the last committed write
//! and a rejected upsert never touches the prior row.

use crate::error::{CollabError, Result};
use crate::storage::Database;
use crate::types::{HandleRef, IdentityMapping};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{params, Connection};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lookup of registered identities owned by the authentication layer
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn identity_exists(&self, identity: &str) -> Result<bool>;
}

/// Fixed identity set, for callers whose registry lives elsewhere
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities(HashSet<String>);

impl StaticIdentities {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(identities.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl IdentitySource for StaticIdentities {
    async fn identity_exists(&self, identity: &str) -> Result<bool> {
        Ok(self.0.contains(identity))
    }
}

/// `registered_users` table
pub struct RegisteredUsers {
    conn: Connection,
}

impl RegisteredUsers {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Register an identity; returns false when it already existed
    pub async fn register(&self, identity: &str) -> Result<bool> {
        let identity = required("identity", identity)?;

        let inserted = self
            .conn
            .execute(
                "INSERT INTO registered_users (username, created_at) VALUES (?, ?)
                 ON CONFLICT(username) DO NOTHING",
                params![identity, Utc::now().to_rfc3339()],
            )
            .await?;

        if inserted > 0 {
            info!("Registered identity {}", identity);
        }
        Ok(inserted > 0)
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT username FROM registered_users ORDER BY username", params![])
            .await?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await? {
            users.push(row.get::<String>(0)?);
        }
        Ok(users)
    }
}

#[async_trait]
impl IdentitySource for RegisteredUsers {
    async fn identity_exists(&self, identity: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM registered_users WHERE username = ? LIMIT 1",
                params![identity],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }
}

/// Outcome of a bulk legacy import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Rows refused, with the reason
    pub rejected: Vec<(IdentityMapping, String)>,
}

/// Group-scoped handle -> identity mappings
pub struct IdentityMappingStore {
    conn: Connection,
    identities: Arc<dyn IdentitySource>,
}

impl IdentityMappingStore {
    pub fn new(db: &Database, identities: Arc<dyn IdentitySource>) -> Self {
        Self {
            conn: db.connection(),
            identities,
        }
    }

    /// Create or replace the mapping for `(group, original_handle)`
    ///
    /// Inputs are trimmed. An unregistered identity is rejected with
    /// `ReferentialIntegrity` and any existing mapping is left unchanged.
    ///
    /// The identity check and the write are separate steps, not one
    /// transaction: an identity removed from the source between them can
    /// still end up mapped. Callers deregistering identities must drop their
    /// mappings with [`Self::delete`] afterwards.
    pub async fn upsert(&self, group: &str, original_handle: &str, identity: &str) -> Result<()> {
        let group = required("group", group)?;
        let handle = required("original_handle", original_handle)?;
        let identity = required("registered_identity", identity)?;

        if !self.identities.identity_exists(identity).await? {
            warn!(
                group,
                handle, identity, "Rejected mapping to unregistered identity"
            );
            return Err(CollabError::ReferentialIntegrity {
                identity: identity.to_string(),
            });
        }

        self.conn
            .execute(
                "INSERT INTO id_mappings (group_name, original_handle, registered_identity, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(group_name, original_handle) DO UPDATE SET
                     registered_identity = excluded.registered_identity,
                     updated_at = excluded.updated_at",
                params![group, handle, identity, Utc::now().to_rfc3339()],
            )
            .await?;

        debug!("Mapped {}/{} -> {}", group, handle, identity);
        Ok(())
    }

    /// Registered identity for a handle in a group
    pub async fn lookup(&self, group: &str, original_handle: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT registered_identity FROM id_mappings
                 WHERE group_name = ? AND original_handle = ?",
                params![group.trim(), original_handle.trim()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    /// Every `(group, handle)` pair mapped to an identity
    pub async fn lookup_all_for_identity(&self, identity: &str) -> Result<BTreeSet<HandleRef>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_name, original_handle FROM id_mappings
                 WHERE registered_identity = ?",
                params![identity.trim()],
            )
            .await?;

        let mut refs = BTreeSet::new();
        while let Some(row) = rows.next().await? {
            refs.insert(HandleRef {
                group: row.get::<String>(0)?,
                original_handle: row.get::<String>(1)?,
            });
        }
        Ok(refs)
    }

    /// Remove a mapping; returns whether one existed
    pub async fn delete(&self, group: &str, original_handle: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM id_mappings WHERE group_name = ? AND original_handle = ?",
                params![group.trim(), original_handle.trim()],
            )
            .await?;
        Ok(removed > 0)
    }

    /// All mappings of one group, ordered by handle
    pub async fn list_group(&self, group: &str) -> Result<Vec<IdentityMapping>> {
        let mut rows = self
            .conn
            .query(
                "SELECT group_name, original_handle, registered_identity FROM id_mappings
                 WHERE group_name = ? ORDER BY original_handle",
                params![group.trim()],
            )
            .await?;

        let mut mappings = Vec::new();
        while let Some(row) = rows.next().await? {
            mappings.push(IdentityMapping {
                group: row.get::<String>(0)?,
                original_handle: row.get::<String>(1)?,
                registered_identity: row.get::<String>(2)?,
            });
        }
        Ok(mappings)
    }

    /// Handle -> identity map of one group
    pub async fn mapping_for_group(&self, group: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .list_group(group)
            .await?
            .into_iter()
            .map(|m| (m.original_handle, m.registered_identity))
            .collect())
    }

    /// Import mappings carried over from an earlier store
    ///
    /// Each row goes through [`upsert`](Self::upsert); rows failing
    /// validation or referential integrity are reported, storage errors
    /// abort the import.
    pub async fn import_legacy<I>(&self, rows: I) -> Result<ImportReport>
    where
        I: IntoIterator<Item = IdentityMapping>,
    {
        let mut report = ImportReport::default();

        for row in rows {
            match self
                .upsert(&row.group, &row.original_handle, &row.registered_identity)
                .await
            {
                Ok(()) => report.imported += 1,
                Err(e @ (CollabError::ReferentialIntegrity { .. } | CollabError::Validation(_))) => {
                    warn!(
                        "Rejected legacy mapping {}/{}: {}",
                        row.group, row.original_handle, e
                    );
                    report.rejected.push((row, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Imported {} legacy mappings, rejected {}",
            report.imported,
            report.rejected.len()
        );
        Ok(report)
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CollabError::Validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup(identities: &[&str]) -> (TempDir, IdentityMappingStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_local(dir.path().join("ids.db")).await.unwrap();
        let users = RegisteredUsers::new(&db);
        for identity in identities {
            users.register(identity).await.unwrap();
        }
        let store = IdentityMappingStore::new(&db, Arc::new(users));
        (dir, store)
    }

    #[tokio::test]
    async fn test_rejected_upsert_keeps_prior_mapping() {
        let (_dir, store) = setup(&["alice"]).await;

        store.upsert("g1", "wx_1", "alice").await.unwrap();
        let err = store.upsert("g1", "wx_1", "bob").await.unwrap_err();

        assert!(matches!(err, CollabError::ReferentialIntegrity { ref identity } if identity == "bob"));
        assert_eq!(store.lookup("g1", "wx_1").await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_is_idempotent() {
        let (_dir, store) = setup(&["alice", "carol"]).await;

        store.upsert("g1", "wx_1", "alice").await.unwrap();
        store.upsert("g1", "wx_1", "carol").await.unwrap();
        store.upsert("g1", "wx_1", "carol").await.unwrap();

        assert_eq!(store.lookup("g1", "wx_1").await.unwrap().as_deref(), Some("carol"));
        assert_eq!(store.list_group("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inputs_are_trimmed_and_validated() {
        let (_dir, store) = setup(&["alice"]).await;

        store.upsert("  g1 ", " wx_1", "alice ").await.unwrap();
        assert_eq!(store.lookup("g1", "wx_1").await.unwrap().as_deref(), Some("alice"));

        let err = store.upsert("g1", "   ", "alice").await.unwrap_err();
        assert!(matches!(err, CollabError::Validation(_)));
    }

    #[tokio::test]
    async fn test_same_handle_in_different_groups() {
        let (_dir, store) = setup(&["alice", "dave"]).await;

        store.upsert("g1", "wx_1", "alice").await.unwrap();
        store.upsert("g2", "wx_1", "dave").await.unwrap();
        store.upsert("g2", "wx_9", "alice").await.unwrap();

        let refs = store.lookup_all_for_identity("alice").await.unwrap();
        let expected: BTreeSet<HandleRef> = [("g1", "wx_1"), ("g2", "wx_9")]
            .into_iter()
            .map(|(g, h)| HandleRef {
                group: g.to_string(),
                original_handle: h.to_string(),
            })
            .collect();
        assert_eq!(refs, expected);
        assert!(store.lookup_all_for_identity("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (_dir, store) = setup(&["alice"]).await;

        store.upsert("g1", "wx_1", "alice").await.unwrap();
        assert!(store.delete("g1", "wx_1").await.unwrap());
        assert!(!store.delete("g1", "wx_1").await.unwrap());
        assert!(store.lookup("g1", "wx_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_leave_one_committed_value() {
        let (_dir, store) = setup(&["alice", "carol"]).await;

        let (a, b) = tokio::join!(
            store.upsert("g1", "wx_1", "alice"),
            store.upsert("g1", "wx_1", "carol")
        );
        a.unwrap();
        b.unwrap();

        let value = store.lookup("g1", "wx_1").await.unwrap().unwrap();
        assert!(value == "alice" || value == "carol");
        assert_eq!(store.list_group("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_import_legacy_reports_rejections() {
        let (_dir, store) = setup(&["alice"]).await;

        let rows = vec![
            IdentityMapping {
                group: "g1".to_string(),
                original_handle: "wx_1".to_string(),
                registered_identity: "alice".to_string(),
            },
            IdentityMapping {
                group: "g1".to_string(),
                original_handle: "wx_2".to_string(),
                registered_identity: "ghost".to_string(),
            },
            IdentityMapping {
                group: "".to_string(),
                original_handle: "wx_3".to_string(),
                registered_identity: "alice".to_string(),
            },
        ];

        let report = store.import_legacy(rows).await.unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(
            store.mapping_for_group("g1").await.unwrap(),
            BTreeMap::from([("wx_1".to_string(), "alice".to_string())])
        );
    }

    #[tokio::test]
    async fn test_static_identities_source() {
        let source = StaticIdentities::new(["alice"]);
        assert!(source.identity_exists("alice").await.unwrap());
        assert!(!source.identity_exists("bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let users = RegisteredUsers::new(&db);

        assert!(users.register("alice").await.unwrap());
        assert!(!users.register("alice").await.unwrap());
        assert_eq!(users.list().await.unwrap(), vec!["alice".to_string()]);
    }
}
