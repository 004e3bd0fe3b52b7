use crate::{
    error::PermsError,
    models::{Group, GroupId, NodeRef},
    repository::MembershipRepository,
};
use ahash::AHashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Safety bound on membership hops; guarantees termination on cyclic graphs.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Bounded reachability over `memberOf` edges.
///
/// Traversal is breadth-first, one repository round trip per level. The
/// start node is excluded from results: only actual group ancestors at depth
/// `1..=max_depth` count.
#[derive(Clone)]
pub struct MembershipGraph {
    repository: Arc<dyn MembershipRepository>,
}

impl MembershipGraph {
    pub fn new(repository: Arc<dyn MembershipRepository>) -> Self {
        Self { repository }
    }

    /// True as soon as a reachable group satisfies `predicate`.
    ///
    /// The predicate runs at most once per distinct group.
    pub async fn reaches_any<F>(
        &self,
        start: &NodeRef,
        max_depth: usize,
        mut predicate: F,
    ) -> Result<bool, PermsError>
    where
        F: FnMut(&Group) -> bool + Send,
    {
        self.walk(start, max_depth, |group| predicate(group)).await
    }

    /// Every distinct group reachable from `start` within `max_depth` hops.
    pub async fn reachable_group_ids(
        &self,
        start: &NodeRef,
        max_depth: usize,
    ) -> Result<AHashSet<GroupId>, PermsError> {
        let mut reached = AHashSet::new();
        self.walk(start, max_depth, |group| {
            reached.insert(group.id.clone());
            false
        })
        .await?;
        Ok(reached)
    }

    /// Level-by-level walk; `visit` returning true stops the walk early.
    async fn walk<F>(&self, start: &NodeRef, max_depth: usize, mut visit: F) -> Result<bool, PermsError>
    where
        F: FnMut(&Group) -> bool + Send,
    {
        let mut visited: AHashSet<NodeRef> = AHashSet::new();
        visited.insert(start.clone());
        let mut frontier = vec![start.clone()];

        for depth in 1..=max_depth {
            let parents = self.repository.parent_groups(&frontier).await?;
            let mut next = Vec::new();

            for group in parents {
                let node = group.node();
                if !visited.insert(node.clone()) {
                    continue;
                }
                if visit(&group) {
                    debug!(start = %start, depth, group = %group.id, "membership walk matched");
                    return Ok(true);
                }
                next.push(node);
            }

            if next.is_empty() {
                debug!(start = %start, depth, visited = visited.len(), "membership walk exhausted");
                return Ok(false);
            }
            frontier = next;
        }

        warn!(
            start = %start,
            max_depth,
            frontier = frontier.len(),
            "membership walk truncated at depth bound"
        );
        Ok(false)
    }
}
