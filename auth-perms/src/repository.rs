use crate::{admin::AdminError, error::PermsError, models::*};
use ahash::AHashSet;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;

pub mod postgres;

/// Record and edge totals of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub principals: usize,
    pub groups: usize,
    pub memberships: usize,
    pub grants: usize,
}

impl fmt::Display for StoreCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} principals, {} groups, {} memberships, {} object grants",
            self.principals, self.groups, self.memberships, self.grants
        )
    }
}

/// Principal and group records
#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn principal(&self, id: &PrincipalId) -> Result<Option<Principal>, PermsError>;

    async fn group(&self, id: &GroupId) -> Result<Option<Group>, PermsError>;

    async fn insert_principal(&self, principal: Principal) -> Result<(), AdminError>;

    async fn insert_group(&self, group: Group) -> Result<(), AdminError>;

    /// Returns `false` when no such principal exists
    async fn set_principal_perms(
        &self,
        id: &PrincipalId,
        perms: BTreeSet<String>,
    ) -> Result<bool, PermsError>;

    /// Returns `false` when no such group exists
    async fn set_group_perms(&self, id: &GroupId, perms: BTreeSet<String>) -> Result<bool, PermsError>;

    /// Stores that also hold edges remove the edges touching the record in
    /// the same step, so an edge written during the removal cannot outlive it.
    async fn remove_principal(&self, id: &PrincipalId) -> Result<bool, PermsError>;

    /// See [`DirectoryRepository::remove_principal`].
    async fn remove_group(&self, id: &GroupId) -> Result<bool, PermsError>;
}

/// Directed `memberOf` edges
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    /// Group records one membership hop away from any node in `members`.
    ///
    /// Edges whose target group record no longer exists are skipped. The
    /// result may contain the same group more than once.
    async fn parent_groups(&self, members: &[NodeRef]) -> Result<Vec<Group>, PermsError>;

    /// Fails `ReferentialDangling` when the store holds records and either
    /// endpoint has none.
    async fn insert_membership(&self, edge: MembershipEdge) -> Result<(), AdminError>;

    async fn remove_membership(&self, member: &NodeRef, group: &GroupId) -> Result<bool, PermsError>;

    /// Removes every edge starting or ending at `node`, returning how many went.
    async fn remove_memberships_touching(&self, node: &NodeRef) -> Result<usize, PermsError>;
}

/// Object-scoped `hasPerm` edges
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GrantRepository: Send + Sync {
    /// Point query: does any of `sources` hold `name` on `object`?
    async fn object_grant_exists(
        &self,
        sources: &[NodeRef],
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError>;

    /// Fails `ReferentialDangling` when the store holds records and the
    /// source has none.
    async fn insert_object_grant(&self, grant: GrantEdge) -> Result<(), AdminError>;

    async fn remove_object_grant(
        &self,
        source: &NodeRef,
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError>;

    async fn remove_object_grants_for_object(&self, object: &ObjectId) -> Result<usize, PermsError>;

    async fn remove_object_grants_from(&self, source: &NodeRef) -> Result<usize, PermsError>;

    async fn object_grants_for(&self, object: &ObjectId) -> Result<Vec<GrantEdge>, PermsError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GrantKey {
    source: NodeRef,
    object: ObjectId,
    name: String,
}

impl GrantKey {
    fn new(source: &NodeRef, name: &str, object: &ObjectId) -> Self {
        Self {
            source: source.clone(),
            object: object.clone(),
            name: name.to_string(),
        }
    }

    fn of(grant: &GrantEdge) -> Self {
        Self::new(&grant.source, &grant.name, &grant.object)
    }
}

/// In-memory repository for tests, fixtures and development.
///
/// Implements all three repository traits so that membership traversal can
/// read group records directly. Every map is sharded, so readers never wait
/// on each other and each edge write locks a single shard.
///
/// Edge inserts write first and then check their endpoints, undoing the write
/// when a record is missing. Record removal deletes the record first and then
/// sweeps its edges. Either the sweep sees a racing edge or the edge's check
/// sees the missing record, so no edge outlives its endpoints.
pub struct InMemoryRepository {
    principals: DashMap<PrincipalId, Principal>,
    groups: DashMap<GroupId, Group>,
    parents: DashMap<NodeRef, AHashSet<GroupId>>,
    members: DashMap<GroupId, AHashSet<NodeRef>>,
    grants: DashMap<GrantKey, GrantEdge>,
    grants_by_object: DashMap<ObjectId, AHashSet<GrantKey>>,
    grants_by_source: DashMap<NodeRef, AHashSet<GrantKey>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            principals: DashMap::new(),
            groups: DashMap::new(),
            parents: DashMap::new(),
            members: DashMap::new(),
            grants: DashMap::new(),
            grants_by_object: DashMap::new(),
            grants_by_source: DashMap::new(),
        }
    }

    pub fn principal_count(&self) -> usize {
        self.principals.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn membership_count(&self) -> usize {
        self.parents.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            principals: self.principal_count(),
            groups: self.group_count(),
            memberships: self.membership_count(),
            grants: self.grant_count(),
        }
    }

    fn node_exists(&self, node: &NodeRef) -> bool {
        match node {
            NodeRef::Principal(id) => self.principals.contains_key(id),
            NodeRef::Group(id) => self.groups.contains_key(id),
        }
    }

    fn unlink(&self, member: &NodeRef, group: &GroupId) -> bool {
        let removed = self
            .parents
            .get_mut(member)
            .map(|mut parents| parents.remove(group))
            .unwrap_or(false);
        if let Some(mut members) = self.members.get_mut(group) {
            members.remove(member);
        }
        removed
    }

    fn unlink_all(&self, node: &NodeRef) -> usize {
        let mut removed = 0;

        if let Some((_, parents)) = self.parents.remove(node) {
            removed += parents.len();
            for group in &parents {
                if let Some(mut members) = self.members.get_mut(group) {
                    members.remove(node);
                }
            }
        }

        if let NodeRef::Group(group) = node {
            if let Some((_, members)) = self.members.remove(group) {
                for member in &members {
                    if let Some(mut parents) = self.parents.get_mut(member) {
                        if parents.remove(group) {
                            removed += 1;
                        }
                    }
                }
            }
        }

        removed
    }

    fn drop_grants_from(&self, source: &NodeRef) -> usize {
        let Some((_, keys)) = self.grants_by_source.remove(source) else {
            return 0;
        };
        let mut removed = 0;
        for key in &keys {
            if self.grants.remove(key).is_some() {
                removed += 1;
            }
            if let Some(mut by_object) = self.grants_by_object.get_mut(&key.object) {
                by_object.remove(key);
            }
        }
        removed
    }

    /// Record first, edges after.
    fn remove_node(&self, node: &NodeRef) -> bool {
        let removed = match node {
            NodeRef::Principal(id) => self.principals.remove(id).is_some(),
            NodeRef::Group(id) => self.groups.remove(id).is_some(),
        };
        self.unlink_all(node);
        self.drop_grants_from(node);
        removed
    }

    fn drop_grant(&self, key: &GrantKey) -> bool {
        let removed = self.grants.remove(key).is_some();
        if let Some(mut keys) = self.grants_by_object.get_mut(&key.object) {
            keys.remove(key);
        }
        if let Some(mut keys) = self.grants_by_source.get_mut(&key.source) {
            keys.remove(key);
        }
        removed
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryRepository for InMemoryRepository {
    async fn principal(&self, id: &PrincipalId) -> Result<Option<Principal>, PermsError> {
        Ok(self.principals.get(id).map(|entry| entry.value().clone()))
    }

    async fn group(&self, id: &GroupId) -> Result<Option<Group>, PermsError> {
        Ok(self.groups.get(id).map(|entry| entry.value().clone()))
    }

    async fn insert_principal(&self, principal: Principal) -> Result<(), AdminError> {
        match self.principals.entry(principal.id.clone()) {
            Entry::Occupied(_) => Err(AdminError::AlreadyExists(principal.node().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(principal);
                Ok(())
            }
        }
    }

    async fn insert_group(&self, group: Group) -> Result<(), AdminError> {
        match self.groups.entry(group.id.clone()) {
            Entry::Occupied(_) => Err(AdminError::AlreadyExists(group.node().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(group);
                Ok(())
            }
        }
    }

    async fn set_principal_perms(
        &self,
        id: &PrincipalId,
        perms: BTreeSet<String>,
    ) -> Result<bool, PermsError> {
        Ok(match self.principals.get_mut(id) {
            Some(mut principal) => {
                principal.global_perms = perms;
                true
            }
            None => false,
        })
    }

    async fn set_group_perms(&self, id: &GroupId, perms: BTreeSet<String>) -> Result<bool, PermsError> {
        Ok(match self.groups.get_mut(id) {
            Some(mut group) => {
                group.global_perms = perms;
                true
            }
            None => false,
        })
    }

    async fn remove_principal(&self, id: &PrincipalId) -> Result<bool, PermsError> {
        Ok(self.remove_node(&NodeRef::Principal(id.clone())))
    }

    async fn remove_group(&self, id: &GroupId) -> Result<bool, PermsError> {
        Ok(self.remove_node(&NodeRef::Group(id.clone())))
    }
}

#[async_trait]
impl MembershipRepository for InMemoryRepository {
    async fn parent_groups(&self, members: &[NodeRef]) -> Result<Vec<Group>, PermsError> {
        let mut group_ids = Vec::new();
        for member in members {
            if let Some(parents) = self.parents.get(member) {
                group_ids.extend(parents.iter().cloned());
            }
        }

        Ok(group_ids
            .iter()
            .filter_map(|id| self.groups.get(id).map(|entry| entry.value().clone()))
            .collect())
    }

    async fn insert_membership(&self, edge: MembershipEdge) -> Result<(), AdminError> {
        let inserted = self
            .parents
            .entry(edge.member.clone())
            .or_default()
            .insert(edge.group.clone());
        if !inserted {
            return Err(AdminError::DuplicateMembership {
                member: edge.member,
                group: edge.group,
            });
        }
        self.members
            .entry(edge.group.clone())
            .or_default()
            .insert(edge.member.clone());

        let group = NodeRef::Group(edge.group.clone());
        for endpoint in [&edge.member, &group] {
            if !self.node_exists(endpoint) {
                self.unlink(&edge.member, &edge.group);
                return Err(AdminError::ReferentialDangling(endpoint.to_string()));
            }
        }
        Ok(())
    }

    async fn remove_membership(&self, member: &NodeRef, group: &GroupId) -> Result<bool, PermsError> {
        Ok(self.unlink(member, group))
    }

    async fn remove_memberships_touching(&self, node: &NodeRef) -> Result<usize, PermsError> {
        Ok(self.unlink_all(node))
    }
}

#[async_trait]
impl GrantRepository for InMemoryRepository {
    async fn object_grant_exists(
        &self,
        sources: &[NodeRef],
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        Ok(sources
            .iter()
            .any(|source| self.grants.contains_key(&GrantKey::new(source, name, object))))
    }

    async fn insert_object_grant(&self, grant: GrantEdge) -> Result<(), AdminError> {
        let key = GrantKey::of(&grant);
        match self.grants.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(AdminError::DuplicateGrant {
                    holder: grant.source,
                    object: grant.object,
                    name: grant.name,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(grant);
            }
        }
        self.grants_by_object
            .entry(key.object.clone())
            .or_default()
            .insert(key.clone());
        self.grants_by_source
            .entry(key.source.clone())
            .or_default()
            .insert(key.clone());

        if !self.node_exists(&key.source) {
            self.drop_grant(&key);
            return Err(AdminError::ReferentialDangling(key.source.to_string()));
        }
        Ok(())
    }

    async fn remove_object_grant(
        &self,
        source: &NodeRef,
        name: &str,
        object: &ObjectId,
    ) -> Result<bool, PermsError> {
        Ok(self.drop_grant(&GrantKey::new(source, name, object)))
    }

    async fn remove_object_grants_for_object(&self, object: &ObjectId) -> Result<usize, PermsError> {
        let Some((_, keys)) = self.grants_by_object.remove(object) else {
            return Ok(0);
        };
        let mut removed = 0;
        for key in &keys {
            if self.grants.remove(key).is_some() {
                removed += 1;
            }
            if let Some(mut by_source) = self.grants_by_source.get_mut(&key.source) {
                by_source.remove(key);
            }
        }
        Ok(removed)
    }

    async fn remove_object_grants_from(&self, source: &NodeRef) -> Result<usize, PermsError> {
        Ok(self.drop_grants_from(source))
    }

    async fn object_grants_for(&self, object: &ObjectId) -> Result<Vec<GrantEdge>, PermsError> {
        let keys: Vec<GrantKey> = match self.grants_by_object.get(object) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        Ok(keys
            .iter()
            .filter_map(|key| self.grants.get(key).map(|entry| entry.value().clone()))
            .collect())
    }
}
