//! Entity directory: resolves a tenant's organizational hierarchy.
//!
//! The ledger validates every mutation target against this directory,
//! and the consistency auditor uses it to detect orphaned credit rows.

use std::collections::{HashMap, HashSet};

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tally_shared::EntityKind;

use crate::error::LedgerResult;

/// Hierarchy walks stop here even if the parent graph is corrupted
/// into a cycle. Real tenant trees are at most a handful of levels.
pub const MAX_HIERARCHY_DEPTH: usize = 20;

/// A node in a tenant's organizational hierarchy.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Entity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub kind: String,
    pub parent_id: Option<Uuid>,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl Entity {
    pub fn kind(&self) -> Option<EntityKind> {
        EntityKind::from_str(&self.kind)
    }
}

/// Read-only directory over the `entities` table.
#[derive(Clone)]
pub struct EntityDirectory {
    pool: PgPool,
}

impl EntityDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve an entity for a tenant. Inactive entities do not
    /// resolve: a credit row pointing at one is an orphan.
    pub async fn resolve(&self, tenant_id: Uuid, entity_id: Uuid) -> LedgerResult<Option<Entity>> {
        let entity: Option<Entity> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, name, kind, parent_id, is_default, is_active, created_at
            FROM entities
            WHERE id = $1 AND tenant_id = $2 AND is_active = true
            "#,
        )
        .bind(entity_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entity)
    }

    /// Find the tenant's primary organization.
    ///
    /// Deterministic tie-break: the entity flagged default wins, else
    /// the earliest created organization.
    pub async fn find_primary_organization(
        &self,
        tenant_id: Uuid,
    ) -> LedgerResult<Option<Entity>> {
        let entity: Option<Entity> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, name, kind, parent_id, is_default, is_active, created_at
            FROM entities
            WHERE tenant_id = $1 AND kind = 'organization' AND is_active = true
            ORDER BY is_default DESC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entity)
    }

    /// Collect all descendant entity ids of `entity_id`, breadth-first.
    ///
    /// Bounded at [`MAX_HIERARCHY_DEPTH`] levels and deduplicated per
    /// visit, so traversal terminates even under a cyclic parent graph.
    pub async fn descendants(
        &self,
        tenant_id: Uuid,
        entity_id: Uuid,
    ) -> LedgerResult<HashSet<Uuid>> {
        let edges: Vec<(Uuid, Option<Uuid>)> = sqlx::query_as(
            r#"
            SELECT id, parent_id FROM entities
            WHERE tenant_id = $1 AND is_active = true
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let (seen, truncated) = collect_descendants(entity_id, &edges);

        if truncated {
            tracing::warn!(
                tenant_id = %tenant_id,
                entity_id = %entity_id,
                depth = MAX_HIERARCHY_DEPTH,
                "Hierarchy traversal hit depth bound - possible cycle in parent graph"
            );
        }

        Ok(seen)
    }
}

/// Walk (id, parent_id) edges breadth-first from `root`, collecting
/// every reachable descendant.
///
/// Bounded at [`MAX_HIERARCHY_DEPTH`] levels; the returned flag is
/// true when the bound cut the walk short, which only happens under a
/// cyclic or corrupted parent graph.
fn collect_descendants(root: Uuid, edges: &[(Uuid, Option<Uuid>)]) -> (HashSet<Uuid>, bool) {
    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (id, parent) in edges {
        if let Some(parent) = parent {
            children.entry(*parent).or_default().push(*id);
        }
    }

    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut frontier: Vec<Uuid> = vec![root];

    for _depth in 0..MAX_HIERARCHY_DEPTH {
        if frontier.is_empty() {
            break;
        }

        frontier = frontier
            .iter()
            .filter_map(|id| children.get(id))
            .flatten()
            .copied()
            .filter(|id| *id != root && seen.insert(*id))
            .collect();
    }

    let truncated = !frontier.is_empty();
    (seen, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn collects_a_simple_tree() {
        // org -> (location, department), location -> team
        let e = ids(4);
        let edges = vec![
            (e[0], None),
            (e[1], Some(e[0])),
            (e[2], Some(e[0])),
            (e[3], Some(e[1])),
        ];
        let (seen, truncated) = collect_descendants(e[0], &edges);
        assert_eq!(seen, [e[1], e[2], e[3]].into_iter().collect());
        assert!(!truncated);

        // A leaf has no descendants.
        let (seen, truncated) = collect_descendants(e[3], &edges);
        assert!(seen.is_empty());
        assert!(!truncated);
    }

    #[test]
    fn cyclic_parent_graph_terminates() {
        // a -> b -> c -> a: corrupted, but the walk must still finish.
        let e = ids(3);
        let edges = vec![(e[1], Some(e[0])), (e[2], Some(e[1])), (e[0], Some(e[2]))];
        let (seen, truncated) = collect_descendants(e[0], &edges);
        assert_eq!(seen, [e[1], e[2]].into_iter().collect());
        assert!(!truncated);
    }

    #[test]
    fn depth_bound_truncates_pathological_chains() {
        // A parent chain deeper than the bound: the walk stops at the
        // bound and reports truncation instead of running away.
        let e = ids(MAX_HIERARCHY_DEPTH + 5);
        let edges: Vec<(Uuid, Option<Uuid>)> = e
            .windows(2)
            .map(|pair| (pair[1], Some(pair[0])))
            .collect();
        let (seen, truncated) = collect_descendants(e[0], &edges);
        assert_eq!(seen.len(), MAX_HIERARCHY_DEPTH);
        assert!(truncated);
    }
}
