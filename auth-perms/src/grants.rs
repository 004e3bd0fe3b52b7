use crate::{
    admin::AdminError,
    error::PermsError,
    models::*,
    repository::GrantRepository,
};
use ahash::AHashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Global grants (permission sets on principal and group records) and
/// object-scoped grants (`hasPerm` edges). Holds no authorization logic.
#[derive(Clone)]
pub struct GrantStore {
    repository: Arc<dyn GrantRepository>,
}

impl GrantStore {
    pub fn new(repository: Arc<dyn GrantRepository>) -> Self {
        Self { repository }
    }

    pub fn has_global_grant(&self, holder: &impl GlobalPerms, name: &str) -> bool {
        holder.has_global_perm(name)
    }

    pub async fn has_object_grant(
        &self,
        source: &NodeRef,
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        self.repository
            .object_grant_exists(std::slice::from_ref(source), name, object)
            .await
    }

    /// Single batched lookup across every group in `groups`.
    pub async fn any_object_grant(
        &self,
        groups: &AHashSet<GroupId>,
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        if groups.is_empty() {
            return Ok(false);
        }
        let sources: Vec<NodeRef> = groups.iter().cloned().map(NodeRef::Group).collect();
        debug!(sources = sources.len(), name, object = %object, "batched group grant lookup");
        self.repository.object_grant_exists(&sources, name, object).await
    }

    pub async fn create_object_grant(
        &self,
        source: NodeRef,
        object: ObjectId,
        name: &str,
    ) -> Result<(), AdminError> {
        self.create_object_grant_with(GrantEdge::new(source, object, name))
            .await
    }

    pub async fn create_object_grant_with(&self, grant: GrantEdge) -> Result<(), AdminError> {
        info!("Creating object grant: {}", grant);
        self.repository.insert_object_grant(grant).await
    }

    pub async fn revoke_object_grant(
        &self,
        source: &NodeRef,
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        self.repository.remove_object_grant(source, name, object).await
    }

    /// Drops every grant edge targeting `object`; used on object deletion.
    pub async fn remove_object_grants_for_object(&self, object: &ObjectId) -> Result<usize, PermsError> {
        let removed = self.repository.remove_object_grants_for_object(object).await?;
        info!(object = %object, removed, "Removed object grants");
        Ok(removed)
    }

    pub async fn remove_object_grants_from(&self, source: &NodeRef) -> Result<usize, PermsError> {
        self.repository.remove_object_grants_from(source).await
    }

    pub async fn object_grants_for(&self, object: &ObjectId) -> Result<Vec<GrantEdge>, PermsError> {
        self.repository.object_grants_for(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{DirectoryRepository, InMemoryRepository, MockGrantRepository};

    #[tokio::test]
    async fn test_object_grant_point_query() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert_principal(Principal::new("u2")).await.unwrap();
        let store = GrantStore::new(repo);
        let u2 = NodeRef::principal("u2");
        let p1 = ObjectId::new("p1");

        store
            .create_object_grant(u2.clone(), p1.clone(), "change_patients")
            .await
            .unwrap();

        assert!(store.has_object_grant(&u2, "change_patients", &p1).await.unwrap());
        assert!(!store
            .has_object_grant(&u2, "change_patients", &ObjectId::new("p2"))
            .await
            .unwrap());
        assert!(!store
            .has_object_grant(&NodeRef::principal("u3"), "change_patients", &p1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_empty_group_set_skips_repository() {
        let mut repo = MockGrantRepository::new();
        repo.expect_object_grant_exists().never();
        let store = GrantStore::new(Arc::new(repo));

        let found = store
            .any_object_grant(&AHashSet::new(), "change_patients", &ObjectId::new("p1"))
            .await
            .unwrap();
        assert!(!found);
    }

    #[test]
    fn test_global_grant_is_set_membership() {
        let store = GrantStore::new(Arc::new(InMemoryRepository::new()));
        let group = Group::new("g1").with_perms(["view_patients"]);

        assert!(store.has_global_grant(&group, "view_patients"));
        assert!(!store.has_global_grant(&group, "add_patients"));
        assert!(!store.has_global_grant(&Principal::new("u1"), "view_patients"));
    }
}
