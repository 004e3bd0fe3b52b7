//! Fixture files: a whole permission world in one YAML or JSON document.
//!
//! ```yaml
//! principals:
//!   - id: u1
//!   - id: root
//!     global_perms: [remove_patients]
//! groups:
//!   - id: g1
//!     global_perms: [view_patients]
//! memberships:
//!   - member: user:u1
//!     group: g1
//! grants:
//!   - source: user:u2
//!     object: p1
//!     name: change_patients
//! ```

use anyhow::{Context, Result};
use auth_perms::{AdminError, GrantEdge, Group, GroupId, NodeRef, ObjectId, PermissionAdmin, Principal};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub principals: Vec<Principal>,
    pub groups: Vec<Group>,
    pub memberships: Vec<FixtureMembership>,
    pub grants: Vec<FixtureGrant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureMembership {
    pub member: NodeRef,
    pub group: GroupId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureGrant {
    pub source: NodeRef,
    pub object: ObjectId,
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Fixture {
    /// `.json` files parse as JSON, anything else as YAML.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            serde_json::from_str(&text).with_context(|| format!("Invalid JSON fixture {}", path.display()))
        } else {
            Self::from_yaml(&text).with_context(|| format!("Invalid YAML fixture {}", path.display()))
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Replays the fixture through the administrative API, so dangling
    /// references and duplicate edges fail the load.
    pub async fn load_into(&self, admin: &PermissionAdmin) -> Result<(), AdminError> {
        for principal in &self.principals {
            admin.create_principal_with(principal.clone()).await?;
        }
        for group in &self.groups {
            admin.create_group(group.clone()).await?;
        }
        for membership in &self.memberships {
            admin
                .add_member(membership.member.clone(), membership.group.clone())
                .await?;
        }
        for grant in &self.grants {
            let mut edge = GrantEdge::new(grant.source.clone(), grant.object.clone(), grant.name.as_str());
            edge.attributes = grant.attributes.clone();
            admin.grant_on_object_with(edge).await?;
        }

        info!(
            principals = self.principals.len(),
            groups = self.groups.len(),
            memberships = self.memberships.len(),
            grants = self.grants.len(),
            "Fixture loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_fixture() {
        let fixture = Fixture::from_yaml(
            r#"
principals:
  - id: u1
  - id: root
    perms: [remove_patients]
memberships:
  - member: user:u1
    group: g1
grants:
  - source: group:g1
    object: p1
    name: change_patients
    attributes:
      reason: ward assignment
"#,
        )
        .unwrap();

        assert_eq!(fixture.principals.len(), 2);
        assert!(fixture.principals[0].global_perms.is_empty());
        assert!(fixture.principals[1].global_perms.contains("remove_patients"));
        assert!(fixture.groups.is_empty());
        assert_eq!(fixture.memberships[0].member, NodeRef::principal("u1"));
        assert_eq!(fixture.grants[0].source, NodeRef::group("g1"));
        assert_eq!(fixture.grants[0].attributes.len(), 1);
    }

    #[test]
    fn test_bundled_clinic_fixture_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/clinic.yaml");
        let fixture = Fixture::from_path(&path).unwrap();

        assert_eq!(fixture.principals.len(), 3);
        assert_eq!(fixture.groups.len(), 3);
        assert_eq!(fixture.memberships.len(), 4);
        assert_eq!(fixture.grants.len(), 2);
    }

    #[test]
    fn test_bad_node_reference_is_rejected() {
        let result = Fixture::from_yaml(
            r#"
memberships:
  - member: patient:p1
    group: g1
"#,
        );
        assert!(result.is_err());
    }
}
