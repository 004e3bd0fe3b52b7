use crate::{
    config::PermsConfig,
    error::PermsError,
    grants::GrantStore,
    models::*,
    repository::{DirectoryRepository, GrantRepository, MembershipRepository},
};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Failures of administrative writes. Never returned by an authorization query.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Grant already exists: {holder} hasPerm {name} on {object}")]
    DuplicateGrant {
        holder: NodeRef,
        object: ObjectId,
        name: String,
    },

    #[error("Membership already exists: {member} memberOf group:{group}")]
    DuplicateMembership { member: NodeRef, group: GroupId },

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Dangling reference: {0}")]
    ReferentialDangling(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] PermsError),
}

impl AdminError {
    /// Conflicts map to HTTP 409 at the API boundary
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AdminError::DuplicateGrant { .. }
                | AdminError::DuplicateMembership { .. }
                | AdminError::AlreadyExists(_)
        )
    }
}

/// Every write path for principals, groups, memberships and object grants.
///
/// Deleting a principal, group or object cascades to the edges touching it,
/// so no deletion path leaves dangling memberships or grants behind.
#[derive(Clone)]
pub struct PermissionAdmin {
    directory: Arc<dyn DirectoryRepository>,
    memberships: Arc<dyn MembershipRepository>,
    grants: GrantStore,
    config: PermsConfig,
}

impl PermissionAdmin {
    pub fn new(
        directory: Arc<dyn DirectoryRepository>,
        memberships: Arc<dyn MembershipRepository>,
        grants: Arc<dyn GrantRepository>,
        config: PermsConfig,
    ) -> Self {
        Self {
            directory,
            memberships,
            grants: GrantStore::new(grants),
            config,
        }
    }

    // =============================================================================
    // Principals and groups
    // =============================================================================

    /// Signup: a new principal starts with the configured starter permissions.
    pub async fn create_principal(&self, id: impl Into<String>) -> Result<Principal, AdminError> {
        let principal = Principal::new(id).with_perms(self.config.signup_perms.iter().cloned());
        self.create_principal_with(principal.clone()).await?;
        Ok(principal)
    }

    pub async fn create_principal_with(&self, principal: Principal) -> Result<(), AdminError> {
        info!("Creating principal: {}", principal.id);
        self.directory.insert_principal(principal).await
    }

    pub async fn create_group(&self, group: Group) -> Result<(), AdminError> {
        info!("Creating group: {}", group.id);
        self.directory.insert_group(group).await
    }

    pub async fn set_global_perms(
        &self,
        node: &NodeRef,
        perms: BTreeSet<String>,
    ) -> Result<(), AdminError> {
        let updated = match node {
            NodeRef::Principal(id) => self.directory.set_principal_perms(id, perms).await?,
            NodeRef::Group(id) => self.directory.set_group_perms(id, perms).await?,
        };
        if !updated {
            return Err(AdminError::NotFound(node.to_string()));
        }
        info!(node = %node, "Updated global permissions");
        Ok(())
    }

    pub async fn grant_global(&self, node: &NodeRef, permission: &str) -> Result<(), AdminError> {
        let mut perms = self.global_perms_of(node).await?;
        if perms.insert(permission.to_string()) {
            self.set_global_perms(node, perms).await?;
        }
        Ok(())
    }

    pub async fn revoke_global(&self, node: &NodeRef, permission: &str) -> Result<(), AdminError> {
        let mut perms = self.global_perms_of(node).await?;
        if perms.remove(permission) {
            self.set_global_perms(node, perms).await?;
        }
        Ok(())
    }

    /// Removes the principal with every membership and object grant it holds.
    pub async fn delete_principal(&self, id: &PrincipalId) -> Result<(), AdminError> {
        self.delete_node(NodeRef::Principal(id.clone())).await
    }

    /// Removes the group, its incoming and outgoing memberships and its grants.
    pub async fn delete_group(&self, id: &GroupId) -> Result<(), AdminError> {
        self.delete_node(NodeRef::Group(id.clone())).await
    }

    /// Edges go before the record, so a failed cascade leaves the record in
    /// place and a retry can finish it.
    async fn delete_node(&self, node: NodeRef) -> Result<(), AdminError> {
        let memberships = self.memberships.remove_memberships_touching(&node).await?;
        let grants = self.grants.remove_object_grants_from(&node).await?;

        let removed = match &node {
            NodeRef::Principal(id) => self.directory.remove_principal(id).await?,
            NodeRef::Group(id) => self.directory.remove_group(id).await?,
        };
        if !removed {
            return Err(AdminError::NotFound(node.to_string()));
        }
        info!(node = %node, memberships, grants, "Deleted {}", node.kind());
        Ok(())
    }

    // =============================================================================
    // Memberships
    // =============================================================================

    pub async fn add_member(&self, member: NodeRef, group: GroupId) -> Result<(), AdminError> {
        self.ensure_exists(&member).await?;
        self.ensure_exists(&NodeRef::Group(group.clone())).await?;
        let edge = MembershipEdge::new(member, group);
        info!("Adding membership: {}", edge);
        self.memberships.insert_membership(edge).await
    }

    pub async fn remove_member(&self, member: &NodeRef, group: &GroupId) -> Result<(), AdminError> {
        if !self.memberships.remove_membership(member, group).await? {
            return Err(AdminError::NotFound(format!(
                "{} memberOf group:{}",
                member, group
            )));
        }
        info!(member = %member, group = %group, "Removed membership");
        Ok(())
    }

    // =============================================================================
    // Object grants
    // =============================================================================

    pub async fn grant_on_object(
        &self,
        source: NodeRef,
        object: ObjectId,
        permission: &str,
    ) -> Result<(), AdminError> {
        self.grant_on_object_with(GrantEdge::new(source, object, permission))
            .await
    }

    /// Stores a prepared grant edge, attributes included.
    pub async fn grant_on_object_with(&self, grant: GrantEdge) -> Result<(), AdminError> {
        self.ensure_exists(&grant.source).await?;
        self.grants.create_object_grant_with(grant).await
    }

    pub async fn revoke_on_object(
        &self,
        source: &NodeRef,
        object: &ObjectId,
        permission: &str,
    ) -> Result<(), AdminError> {
        if !self.grants.revoke_object_grant(source, permission, object).await? {
            return Err(AdminError::NotFound(format!(
                "{} hasPerm {} on {}",
                source, permission, object
            )));
        }
        Ok(())
    }

    /// Grants the creator of a new object the configured creator permissions on it.
    pub async fn register_object(
        &self,
        creator: &PrincipalId,
        object: &ObjectId,
    ) -> Result<(), AdminError> {
        let source = NodeRef::Principal(creator.clone());
        self.ensure_exists(&source).await?;
        for permission in &self.config.creator_perms {
            self.grants
                .create_object_grant(source.clone(), object.clone(), permission)
                .await?;
        }
        Ok(())
    }

    /// Object deletion: every grant targeting the object goes with it.
    pub async fn delete_object(&self, object: &ObjectId) -> Result<usize, AdminError> {
        Ok(self.grants.remove_object_grants_for_object(object).await?)
    }

    async fn global_perms_of(&self, node: &NodeRef) -> Result<BTreeSet<String>, AdminError> {
        let perms = match node {
            NodeRef::Principal(id) => self.directory.principal(id).await?.map(|p| p.global_perms),
            NodeRef::Group(id) => self.directory.group(id).await?.map(|g| g.global_perms),
        };
        perms.ok_or_else(|| AdminError::NotFound(node.to_string()))
    }

    async fn ensure_exists(&self, node: &NodeRef) -> Result<(), AdminError> {
        let exists = match node {
            NodeRef::Principal(id) => self.directory.principal(id).await?.is_some(),
            NodeRef::Group(id) => self.directory.group(id).await?.is_some(),
        };
        if exists {
            Ok(())
        } else {
            Err(AdminError::ReferentialDangling(node.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::resolver::PermissionResolver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Membership store whose first cascade call fails
    struct FailingCascade {
        inner: Arc<InMemoryRepository>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl MembershipRepository for FailingCascade {
        async fn parent_groups(&self, members: &[NodeRef]) -> Result<Vec<Group>, PermsError> {
            self.inner.parent_groups(members).await
        }

        async fn insert_membership(&self, edge: MembershipEdge) -> Result<(), AdminError> {
            self.inner.insert_membership(edge).await
        }

        async fn remove_membership(&self, member: &NodeRef, group: &GroupId) -> Result<bool, PermsError> {
            self.inner.remove_membership(member, group).await
        }

        async fn remove_memberships_touching(&self, node: &NodeRef) -> Result<usize, PermsError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(PermsError::store("connection reset"));
            }
            self.inner.remove_memberships_touching(node).await
        }
    }

    fn admin_with(config: PermsConfig) -> (PermissionAdmin, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let admin = PermissionAdmin::new(repo.clone(), repo.clone(), repo.clone(), config);
        (admin, repo)
    }

    #[tokio::test]
    async fn test_signup_seeds_starter_perms() {
        let config = PermsConfig {
            signup_perms: vec!["view_patients".to_string()],
            ..PermsConfig::default()
        };
        let (admin, repo) = admin_with(config);

        let principal = admin.create_principal("u1").await.unwrap();
        assert!(principal.has_global_perm("view_patients"));

        let stored = repo.principal(&PrincipalId::new("u1")).await.unwrap().unwrap();
        assert_eq!(stored, principal);

        let again = admin.create_principal("u1").await;
        assert!(matches!(again, Err(AdminError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_membership_requires_both_endpoints() {
        let (admin, _) = admin_with(PermsConfig::default());
        admin.create_principal("u1").await.unwrap();

        let dangling = admin
            .add_member(NodeRef::principal("u1"), GroupId::new("missing"))
            .await;
        assert!(matches!(dangling, Err(AdminError::ReferentialDangling(_))));

        admin.create_group(Group::new("g1")).await.unwrap();
        admin
            .add_member(NodeRef::principal("u1"), GroupId::new("g1"))
            .await
            .unwrap();

        let duplicate = admin
            .add_member(NodeRef::principal("u1"), GroupId::new("g1"))
            .await
            .unwrap_err();
        assert!(duplicate.is_conflict());
    }

    #[tokio::test]
    async fn test_register_object_grants_creator_perms() {
        let config = PermsConfig {
            creator_perms: vec!["change_patients".to_string(), "remove_patients".to_string()],
            ..PermsConfig::default()
        };
        let (admin, repo) = admin_with(config);
        admin.create_principal("u2").await.unwrap();

        let p1 = ObjectId::new("p1");
        admin.register_object(&PrincipalId::new("u2"), &p1).await.unwrap();
        assert_eq!(repo.object_grants_for(&p1).await.unwrap().len(), 2);

        assert_eq!(admin.delete_object(&p1).await.unwrap(), 2);
        assert_eq!(repo.grant_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_group_cascades() {
        let (admin, repo) = admin_with(PermsConfig::default());
        admin.create_principal("u1").await.unwrap();
        admin.create_group(Group::new("g1")).await.unwrap();
        admin.create_group(Group::new("g2")).await.unwrap();
        admin
            .add_member(NodeRef::principal("u1"), GroupId::new("g1"))
            .await
            .unwrap();
        admin
            .add_member(NodeRef::group("g1"), GroupId::new("g2"))
            .await
            .unwrap();
        admin
            .grant_on_object(NodeRef::group("g1"), ObjectId::new("p1"), "view_patients")
            .await
            .unwrap();

        admin.delete_group(&GroupId::new("g1")).await.unwrap();

        assert_eq!(repo.membership_count(), 0);
        assert_eq!(repo.grant_count(), 0);
        assert!(matches!(
            admin.delete_group(&GroupId::new("g1")).await,
            Err(AdminError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_grant_and_revoke_global() {
        let (admin, repo) = admin_with(PermsConfig::default());
        admin.create_group(Group::new("g1")).await.unwrap();
        let g1 = NodeRef::group("g1");

        admin.grant_global(&g1, "view_patients").await.unwrap();
        let group = repo.group(&GroupId::new("g1")).await.unwrap().unwrap();
        assert!(group.has_global_perm("view_patients"));

        admin.revoke_global(&g1, "view_patients").await.unwrap();
        let group = repo.group(&GroupId::new("g1")).await.unwrap().unwrap();
        assert!(group.global_perms.is_empty());

        let missing = admin.grant_global(&NodeRef::principal("ghost"), "x").await;
        assert!(matches!(missing, Err(AdminError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_cascade_can_be_retried() {
        let repo = Arc::new(InMemoryRepository::new());
        let memberships = Arc::new(FailingCascade {
            inner: repo.clone(),
            failed: AtomicBool::new(false),
        });
        let admin = PermissionAdmin::new(repo.clone(), memberships, repo.clone(), PermsConfig::default());
        let resolver = PermissionResolver::new(repo.clone(), repo.clone(), repo.clone());

        admin.create_principal("u1").await.unwrap();
        admin.create_group(Group::new("g1")).await.unwrap();
        admin
            .add_member(NodeRef::principal("u1"), GroupId::new("g1"))
            .await
            .unwrap();

        let g1 = GroupId::new("g1");
        let first = admin.delete_group(&g1).await;
        assert!(matches!(first, Err(AdminError::Store(_))));
        // The record survives a failed cascade, so the retry is not NotFound
        assert!(repo.group(&g1).await.unwrap().is_some());

        admin.delete_group(&g1).await.unwrap();
        assert_eq!(repo.membership_count(), 0);

        admin
            .create_group(Group::new("g1").with_perms(["remove_patients"]))
            .await
            .unwrap();
        let allowed = resolver
            .authorize_id(Some(&PrincipalId::new("u1")), "remove_patients", None)
            .await
            .unwrap();
        assert!(!allowed);
    }
}
