use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Stable identifier of an authenticated user
    PrincipalId
);
string_id!(
    /// Identifier of a group
    GroupId
);
string_id!(
    /// Identifier of a protected object (patient record, document, ...)
    ObjectId
);

/// Source node of a membership or grant edge.
///
/// Text form is `user:<id>` or `group:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeRef {
    Principal(PrincipalId),
    Group(GroupId),
}

impl NodeRef {
    pub fn principal(id: impl Into<String>) -> Self {
        Self::Principal(PrincipalId::new(id))
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::Group(GroupId::new(id))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeRef::Principal(_) => "user",
            NodeRef::Group(_) => "group",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            NodeRef::Principal(id) => id.as_str(),
            NodeRef::Group(id) => id.as_str(),
        }
    }

    /// Rebuild a node from its stored `(kind, id)` pair.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, ParseNodeError> {
        if id.is_empty() {
            return Err(ParseNodeError(format!("{}:", kind)));
        }
        match kind {
            "user" => Ok(Self::principal(id)),
            "group" => Ok(Self::group(id)),
            _ => Err(ParseNodeError(format!("{}:{}", kind, id))),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node reference '{0}', expected user:<id> or group:<id>")]
pub struct ParseNodeError(String);

impl FromStr for NodeRef {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseNodeError(s.to_string()))?;
        Self::from_parts(kind, id)
    }
}

impl TryFrom<String> for NodeRef {
    type Error = ParseNodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeRef> for String {
    fn from(node: NodeRef) -> Self {
        node.to_string()
    }
}

impl From<PrincipalId> for NodeRef {
    fn from(id: PrincipalId) -> Self {
        NodeRef::Principal(id)
    }
}

impl From<GroupId> for NodeRef {
    fn from(id: GroupId) -> Self {
        NodeRef::Group(id)
    }
}

/// Anything carrying a set of unconditional permissions.
pub trait GlobalPerms {
    fn global_perms(&self) -> &BTreeSet<String>;

    fn has_global_perm(&self, name: &str) -> bool {
        self.global_perms().contains(name)
    }
}

/// An authenticated user as resolved by the session layer.
///
/// Records without a permission set deserialize with an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    #[serde(default, alias = "perms")]
    pub global_perms: BTreeSet<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::new(id),
            global_perms: BTreeSet::new(),
        }
    }

    pub fn with_perms<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_perms.extend(perms.into_iter().map(Into::into));
        self
    }

    pub fn node(&self) -> NodeRef {
        NodeRef::Principal(self.id.clone())
    }
}

impl GlobalPerms for Principal {
    fn global_perms(&self) -> &BTreeSet<String> {
        &self.global_perms
    }
}

/// A named collection of principals and groups sharing permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    #[serde(default, alias = "perms")]
    pub global_perms: BTreeSet<String>,
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: GroupId::new(id),
            global_perms: BTreeSet::new(),
        }
    }

    pub fn with_perms<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_perms.extend(perms.into_iter().map(Into::into));
        self
    }

    pub fn node(&self) -> NodeRef {
        NodeRef::Group(self.id.clone())
    }
}

impl GlobalPerms for Group {
    fn global_perms(&self) -> &BTreeSet<String> {
        &self.global_perms
    }
}

/// `member` belongs to `group`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEdge {
    pub member: NodeRef,
    pub group: GroupId,
    pub created_at: DateTime<Utc>,
}

impl MembershipEdge {
    pub fn new(member: NodeRef, group: GroupId) -> Self {
        Self {
            member,
            group,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for MembershipEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} memberOf group:{}", self.member, self.group)
    }
}

/// Object-scoped grant: `source` holds permission `name` on `object` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantEdge {
    pub source: NodeRef,
    pub object: ObjectId,
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl GrantEdge {
    pub fn new(source: NodeRef, object: ObjectId, name: impl Into<String>) -> Self {
        Self {
            source,
            object,
            name: name.into(),
            attributes: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

impl fmt::Display for GrantEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hasPerm {} on {}", self.source, self.name, self.object)
    }
}

/// Which of the four additive sources produced an allow decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    PrincipalGlobal,
    PrincipalObject,
    GroupGlobal,
    GroupObject,
}

impl fmt::Display for GrantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GrantSource::PrincipalGlobal => "principal_global",
            GrantSource::PrincipalObject => "principal_object",
            GrantSource::GroupGlobal => "group_global",
            GrantSource::GroupObject => "group_object",
        };
        f.write_str(label)
    }
}
