//! PostgreSQL-backed permission store
//!
//! Four tables hold the principal directory, the group directory, `memberOf`
//! edges and object-scoped `hasPerm` edges. Node references are stored as a
//! `(kind, id)` pair where kind is `user` or `group`.
//!
//! Frontier expansion and the batched group grant lookup bind two parallel
//! `text[]` arrays and join against `unnest`, so each costs one round trip no
//! matter how many nodes are involved.
//!
//! Edges only land while their endpoint records exist. Inserts take a
//! `FOR KEY SHARE` lock on the referenced record, and record removal deletes
//! the record before the edges touching it inside one transaction, so an edge
//! written concurrently with a deletion is either refused or swept.

use crate::{
    admin::AdminError,
    error::PermsError,
    models::*,
    repository::{DirectoryRepository, GrantRepository, MembershipRepository, StoreCounts},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgQueryResult, PgRow},
    PgPool, Row,
};
use std::collections::BTreeSet;
use tracing::{debug, info};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS perm_principals (
        id           TEXT PRIMARY KEY,
        global_perms TEXT[] NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS perm_groups (
        id           TEXT PRIMARY KEY,
        global_perms TEXT[] NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS perm_memberships (
        member_kind TEXT NOT NULL CHECK (member_kind IN ('user', 'group')),
        member_id   TEXT NOT NULL,
        group_id    TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (member_kind, member_id, group_id),
        CONSTRAINT perm_memberships_group_fk
            FOREIGN KEY (group_id) REFERENCES perm_groups (id) ON DELETE CASCADE
    )
    "#,
    // Tables created before the group foreign key existed
    r#"
    DO $$
    BEGIN
        IF NOT EXISTS (
            SELECT 1 FROM pg_constraint WHERE conname = 'perm_memberships_group_fk'
        ) THEN
            DELETE FROM perm_memberships m
            WHERE NOT EXISTS (SELECT 1 FROM perm_groups g WHERE g.id = m.group_id);
            ALTER TABLE perm_memberships
                ADD CONSTRAINT perm_memberships_group_fk
                FOREIGN KEY (group_id) REFERENCES perm_groups (id) ON DELETE CASCADE;
        END IF;
    END
    $$
    "#,
    "CREATE INDEX IF NOT EXISTS idx_perm_memberships_group ON perm_memberships (group_id)",
    r#"
    CREATE TABLE IF NOT EXISTS perm_object_grants (
        source_kind TEXT NOT NULL CHECK (source_kind IN ('user', 'group')),
        source_id   TEXT NOT NULL,
        object_id   TEXT NOT NULL,
        name        TEXT NOT NULL,
        attributes  JSONB NOT NULL DEFAULT '{}',
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (source_kind, source_id, object_id, name)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_perm_object_grants_object ON perm_object_grants (object_id, name)",
];

/// True when the `(kind, id)` node bound at `$1, $2` has a record. Locks the
/// record so a concurrent removal waits for the surrounding insert.
const NODE_EXISTS: &str = r#"
    EXISTS (SELECT 1 FROM perm_principals WHERE $1 = 'user' AND id = $2 FOR KEY SHARE)
    OR EXISTS (SELECT 1 FROM perm_groups WHERE $1 = 'group' AND id = $2 FOR KEY SHARE)
"#;

/// PostgreSQL repository implementing the directory, membership and grant seams
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn from_connection_string(connection_string: &str) -> Result<Self, PermsError> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| PermsError::store(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables and indexes if they are missing. Safe to run on every start.
    pub async fn ensure_schema(&self) -> Result<(), PermsError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Permission schema ready");
        Ok(())
    }

    pub async fn counts(&self) -> Result<StoreCounts, PermsError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM perm_principals)    AS principal_count,
                (SELECT COUNT(*) FROM perm_groups)        AS group_count,
                (SELECT COUNT(*) FROM perm_memberships)   AS membership_count,
                (SELECT COUNT(*) FROM perm_object_grants) AS grant_count
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<usize, PermsError> {
            let value: i64 = row.try_get(column)?;
            usize::try_from(value).map_err(|_| PermsError::corrupt(format!("negative {} count", column)))
        };

        Ok(StoreCounts {
            principals: count("principal_count")?,
            groups: count("group_count")?,
            memberships: count("membership_count")?,
            grants: count("grant_count")?,
        })
    }
}

fn has_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(code),
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, UNIQUE_VIOLATION)
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_sqlstate(err, FOREIGN_KEY_VIOLATION)
}

fn affected(result: &PgQueryResult) -> Result<usize, PermsError> {
    usize::try_from(result.rows_affected())
        .map_err(|_| PermsError::corrupt(format!("row count {} out of range", result.rows_affected())))
}

/// Splits nodes into the parallel `kind[]` / `id[]` arrays bound to `unnest`.
fn node_arrays(nodes: &[NodeRef]) -> (Vec<String>, Vec<String>) {
    nodes
        .iter()
        .map(|node| (node.kind().to_string(), node.id().to_string()))
        .unzip()
}

fn perms_vec(perms: BTreeSet<String>) -> Vec<String> {
    perms.into_iter().collect()
}

fn read_perms(row: &PgRow) -> Result<BTreeSet<String>, PermsError> {
    let perms: Option<Vec<String>> = row.try_get("global_perms")?;
    Ok(perms.unwrap_or_default().into_iter().collect())
}

fn read_group(row: &PgRow) -> Result<Group, PermsError> {
    Ok(Group {
        id: GroupId::new(row.try_get::<String, _>("id")?),
        global_perms: read_perms(row)?,
    })
}

fn read_grant(row: &PgRow) -> Result<GrantEdge, PermsError> {
    let kind: String = row.try_get("source_kind")?;
    let id: String = row.try_get("source_id")?;
    let source = NodeRef::from_parts(&kind, &id)
        .map_err(|e| PermsError::corrupt(format!("perm_object_grants: {}", e)))?;

    let attributes = match row.try_get::<serde_json::Value, _>("attributes")? {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(PermsError::corrupt(format!(
                "perm_object_grants: attributes must be an object, got {}",
                other
            )))
        }
    };

    Ok(GrantEdge {
        source,
        object: ObjectId::new(row.try_get::<String, _>("object_id")?),
        name: row.try_get("name")?,
        attributes,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl DirectoryRepository for PostgresRepository {
    async fn principal(&self, id: &PrincipalId) -> Result<Option<Principal>, PermsError> {
        let row = sqlx::query("SELECT id, global_perms FROM perm_principals WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Principal, PermsError> {
            Ok(Principal {
                id: id.clone(),
                global_perms: read_perms(&row)?,
            })
        })
        .transpose()
    }

    async fn group(&self, id: &GroupId) -> Result<Option<Group>, PermsError> {
        let row = sqlx::query("SELECT id, global_perms FROM perm_groups WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(read_group).transpose()
    }

    async fn insert_principal(&self, principal: Principal) -> Result<(), AdminError> {
        sqlx::query("INSERT INTO perm_principals (id, global_perms) VALUES ($1, $2)")
            .bind(principal.id.as_str())
            .bind(perms_vec(principal.global_perms.clone()))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AdminError::AlreadyExists(principal.node().to_string())
                } else {
                    AdminError::Store(e.into())
                }
            })?;
        Ok(())
    }

    async fn insert_group(&self, group: Group) -> Result<(), AdminError> {
        sqlx::query("INSERT INTO perm_groups (id, global_perms) VALUES ($1, $2)")
            .bind(group.id.as_str())
            .bind(perms_vec(group.global_perms.clone()))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AdminError::AlreadyExists(group.node().to_string())
                } else {
                    AdminError::Store(e.into())
                }
            })?;
        Ok(())
    }

    async fn set_principal_perms(
        &self,
        id: &PrincipalId,
        perms: BTreeSet<String>,
    ) -> Result<bool, PermsError> {
        let result = sqlx::query("UPDATE perm_principals SET global_perms = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(perms_vec(perms))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_group_perms(&self, id: &GroupId, perms: BTreeSet<String>) -> Result<bool, PermsError> {
        let result = sqlx::query("UPDATE perm_groups SET global_perms = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(perms_vec(perms))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_principal(&self, id: &PrincipalId) -> Result<bool, PermsError> {
        self.remove_node(&NodeRef::Principal(id.clone())).await
    }

    async fn remove_group(&self, id: &GroupId) -> Result<bool, PermsError> {
        self.remove_node(&NodeRef::Group(id.clone())).await
    }
}

impl PostgresRepository {
    /// Deletes the record, then every membership and grant edge touching it,
    /// in one transaction.
    async fn remove_node(&self, node: &NodeRef) -> Result<bool, PermsError> {
        let delete_record = match node {
            NodeRef::Principal(_) => "DELETE FROM perm_principals WHERE id = $1",
            NodeRef::Group(_) => "DELETE FROM perm_groups WHERE id = $1",
        };

        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(delete_record)
            .bind(node.id())
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        let memberships = sqlx::query(
            r#"
            DELETE FROM perm_memberships
            WHERE (member_kind = $1 AND member_id = $2)
               OR ($1 = 'group' AND group_id = $2)
            "#,
        )
        .bind(node.kind())
        .bind(node.id())
        .execute(&mut *tx)
        .await?;

        let grants = sqlx::query("DELETE FROM perm_object_grants WHERE source_kind = $1 AND source_id = $2")
            .bind(node.kind())
            .bind(node.id())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            node = %node,
            removed,
            memberships = memberships.rows_affected(),
            grants = grants.rows_affected(),
            "Removed node record"
        );
        Ok(removed)
    }
}

#[async_trait]
impl MembershipRepository for PostgresRepository {
    async fn parent_groups(&self, members: &[NodeRef]) -> Result<Vec<Group>, PermsError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let (kinds, ids) = node_arrays(members);

        // Inner join on perm_groups drops edges whose group record is gone
        let rows = sqlx::query(
            r#"
            SELECT g.id, g.global_perms
            FROM unnest($1::text[], $2::text[]) AS f(kind, id)
            JOIN perm_memberships m ON m.member_kind = f.kind AND m.member_id = f.id
            JOIN perm_groups g ON g.id = m.group_id
            "#,
        )
        .bind(&kinds)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        debug!(frontier = members.len(), parents = rows.len(), "Expanded membership frontier");
        rows.iter().map(read_group).collect()
    }

    async fn insert_membership(&self, edge: MembershipEdge) -> Result<(), AdminError> {
        // The group side is held by perm_memberships_group_fk
        let query = format!(
            r#"
            INSERT INTO perm_memberships (member_kind, member_id, group_id, created_at)
            SELECT $1, $2, $3, $4
            WHERE {}
            "#,
            NODE_EXISTS
        );

        let result = sqlx::query(&query)
            .bind(edge.member.kind())
            .bind(edge.member.id())
            .bind(edge.group.as_str())
            .bind(edge.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AdminError::DuplicateMembership {
                        member: edge.member.clone(),
                        group: edge.group.clone(),
                    }
                } else if is_foreign_key_violation(&e) {
                    AdminError::ReferentialDangling(format!("group:{}", edge.group))
                } else {
                    AdminError::Store(e.into())
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(AdminError::ReferentialDangling(edge.member.to_string()));
        }
        Ok(())
    }

    async fn remove_membership(&self, member: &NodeRef, group: &GroupId) -> Result<bool, PermsError> {
        let result = sqlx::query(
            "DELETE FROM perm_memberships WHERE member_kind = $1 AND member_id = $2 AND group_id = $3",
        )
        .bind(member.kind())
        .bind(member.id())
        .bind(group.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_memberships_touching(&self, node: &NodeRef) -> Result<usize, PermsError> {
        let result = sqlx::query(
            r#"
            DELETE FROM perm_memberships
            WHERE (member_kind = $1 AND member_id = $2)
               OR ($1 = 'group' AND group_id = $2)
            "#,
        )
        .bind(node.kind())
        .bind(node.id())
        .execute(&self.pool)
        .await?;
        affected(&result)
    }
}

#[async_trait]
impl GrantRepository for PostgresRepository {
    async fn object_grant_exists(
        &self,
        sources: &[NodeRef],
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        if sources.is_empty() {
            return Ok(false);
        }
        let (kinds, ids) = node_arrays(sources);

        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM unnest($1::text[], $2::text[]) AS s(kind, id)
                JOIN perm_object_grants g ON g.source_kind = s.kind AND g.source_id = s.id
                WHERE g.object_id = $3 AND g.name = $4
            )
            "#,
        )
        .bind(&kinds)
        .bind(&ids)
        .bind(object.as_str())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_object_grant(&self, grant: GrantEdge) -> Result<(), AdminError> {
        let query = format!(
            r#"
            INSERT INTO perm_object_grants (source_kind, source_id, object_id, name, attributes, created_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE {}
            "#,
            NODE_EXISTS
        );

        let result = sqlx::query(&query)
            .bind(grant.source.kind())
            .bind(grant.source.id())
            .bind(grant.object.as_str())
            .bind(&grant.name)
            .bind(serde_json::Value::Object(grant.attributes.clone()))
            .bind(grant.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AdminError::DuplicateGrant {
                        holder: grant.source.clone(),
                        object: grant.object.clone(),
                        name: grant.name.clone(),
                    }
                } else {
                    AdminError::Store(e.into())
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(AdminError::ReferentialDangling(grant.source.to_string()));
        }
        Ok(())
    }

    async fn remove_object_grant(
        &self,
        source: &NodeRef,
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        let result = sqlx::query(
            r#"
            DELETE FROM perm_object_grants
            WHERE source_kind = $1 AND source_id = $2 AND object_id = $3 AND name = $4
            "#,
        )
        .bind(source.kind())
        .bind(source.id())
        .bind(object.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_object_grants_for_object(&self, object: &ObjectId) -> Result<usize, PermsError> {
        let result = sqlx::query("DELETE FROM perm_object_grants WHERE object_id = $1")
            .bind(object.as_str())
            .execute(&self.pool)
            .await?;
        affected(&result)
    }

    async fn remove_object_grants_from(&self, source: &NodeRef) -> Result<usize, PermsError> {
        let result = sqlx::query("DELETE FROM perm_object_grants WHERE source_kind = $1 AND source_id = $2")
            .bind(source.kind())
            .bind(source.id())
            .execute(&self.pool)
            .await?;
        affected(&result)
    }

    async fn object_grants_for(&self, object: &ObjectId) -> Result<Vec<GrantEdge>, PermsError> {
        let rows = sqlx::query(
            r#"
            SELECT source_kind, source_id, object_id, name, attributes, created_at
            FROM perm_object_grants
            WHERE object_id = $1
            ORDER BY created_at, source_kind, source_id, name
            "#,
        )
        .bind(object.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(read_grant).collect()
    }
}
