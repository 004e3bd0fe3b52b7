use crate::{
    error::PermsError,
    grants::GrantStore,
    graph::{MembershipGraph, DEFAULT_MAX_DEPTH},
    models::*,
    repository::{DirectoryRepository, GrantRepository, MembershipRepository},
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// The single authorization decision point.
///
/// A principal is authorized for a permission when any of four additive
/// sources grants it:
/// - the principal's own global permissions
/// - an object-scoped grant held by the principal
/// - the global permissions of any group reached over `memberOf` edges
/// - an object-scoped grant held by any such group
///
/// Sources are tried cheapest first and evaluation stops at the first match.
/// The resolver keeps no state between queries and is safe to share across
/// tasks.
#[derive(Clone)]
pub struct PermissionResolver {
    directory: Arc<dyn DirectoryRepository>,
    graph: MembershipGraph,
    grants: GrantStore,
    max_depth: usize,
}

impl PermissionResolver {
    pub fn new(
        directory: Arc<dyn DirectoryRepository>,
        memberships: Arc<dyn MembershipRepository>,
        grants: Arc<dyn GrantRepository>,
    ) -> Self {
        Self {
            directory,
            graph: MembershipGraph::new(memberships),
            grants: GrantStore::new(grants),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn graph(&self) -> &MembershipGraph {
        &self.graph
    }

    /// Can `principal` exercise `permission`, optionally on `object`?
    ///
    /// `Ok(false)` is a denial. `Err` means the stores could not answer.
    pub async fn authorize(
        &self,
        principal: Option<&Principal>,
        permission: &str,
        object: Option<&ObjectId>,
    ) -> Result<bool, PermsError> {
        Ok(self.explain(principal, permission, object).await?.is_some())
    }

    /// Same decision as [`authorize`](Self::authorize), reporting which
    /// source granted it.
    #[instrument(
        level = "debug",
        skip(self, principal),
        fields(principal = principal.map(|p| p.id.as_str()).unwrap_or("<anonymous>"))
    )]
    pub async fn explain(
        &self,
        principal: Option<&Principal>,
        permission: &str,
        object: Option<&ObjectId>,
    ) -> Result<Option<GrantSource>, PermsError> {
        let Some(principal) = principal else {
            debug!("no principal, denied");
            return Ok(None);
        };

        if self.grants.has_global_grant(principal, permission) {
            return Ok(self.allowed(GrantSource::PrincipalGlobal));
        }

        let start = principal.node();

        if let Some(object) = object {
            if self.grants.has_object_grant(&start, permission, object).await? {
                return Ok(self.allowed(GrantSource::PrincipalObject));
            }
        }

        let group_has_perm = self
            .graph
            .reaches_any(&start, self.max_depth, |group| {
                self.grants.has_global_grant(group, permission)
            })
            .await?;
        if group_has_perm {
            return Ok(self.allowed(GrantSource::GroupGlobal));
        }

        // Object grants never satisfy a global-only query
        let Some(object) = object else {
            debug!("denied");
            return Ok(None);
        };

        let groups = self.graph.reachable_group_ids(&start, self.max_depth).await?;
        if self.grants.any_object_grant(&groups, permission, object).await? {
            return Ok(self.allowed(GrantSource::GroupObject));
        }

        debug!(groups = groups.len(), "denied");
        Ok(None)
    }

    /// Dereferences `principal_id` first. A stale id (for example a session
    /// pointing at a deleted user) is denied, not an error.
    pub async fn authorize_id(
        &self,
        principal_id: Option<&PrincipalId>,
        permission: &str,
        object: Option<&ObjectId>,
    ) -> Result<bool, PermsError> {
        Ok(self.explain_id(principal_id, permission, object).await?.is_some())
    }

    pub async fn explain_id(
        &self,
        principal_id: Option<&PrincipalId>,
        permission: &str,
        object: Option<&ObjectId>,
    ) -> Result<Option<GrantSource>, PermsError> {
        let principal = match principal_id {
            Some(id) => {
                let principal = self.directory.principal(id).await?;
                if principal.is_none() {
                    warn!(principal = %id, "principal unresolved, denying");
                }
                principal
            }
            None => None,
        };
        self.explain(principal.as_ref(), permission, object).await
    }

    fn allowed(&self, source: GrantSource) -> Option<GrantSource> {
        debug!(%source, "allowed");
        Some(source)
    }
}
