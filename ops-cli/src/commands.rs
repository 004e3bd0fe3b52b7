use crate::store::Store;
use anyhow::Result;
use auth_perms::repository::StoreCounts;
use auth_perms::{GrantSource, GroupId, NodeRef, ObjectId, PermissionResolver, PrincipalId};

/// Exit status when the decision could not be determined
pub const EXIT_ERROR: u8 = 2;

/// Result of `permsctl check`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed(Option<GrantSource>),
    Denied,
}

impl Verdict {
    /// 0 allowed, 1 denied; errors exit with [`EXIT_ERROR`]
    pub fn exit_code(&self) -> u8 {
        match self {
            Verdict::Allowed(_) => 0,
            Verdict::Denied => 1,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Verdict::Allowed(Some(source)) => format!("allowed ({})", source),
            Verdict::Allowed(None) => "allowed".to_string(),
            Verdict::Denied => "denied".to_string(),
        }
    }
}

pub async fn check(
    resolver: &PermissionResolver,
    principal: &str,
    permission: &str,
    object: Option<&str>,
    explain: bool,
) -> Result<Verdict> {
    let principal = PrincipalId::new(principal);
    let object = object.map(ObjectId::new);

    let source = resolver
        .explain_id(Some(&principal), permission, object.as_ref())
        .await?;

    Ok(match source {
        Some(source) if explain => Verdict::Allowed(Some(source)),
        Some(_) => Verdict::Allowed(None),
        None => Verdict::Denied,
    })
}

/// Reachable groups, sorted for stable output.
pub async fn groups(resolver: &PermissionResolver, node: &NodeRef) -> Result<Vec<GroupId>> {
    let reached = resolver
        .graph()
        .reachable_group_ids(node, resolver.max_depth())
        .await?;
    let mut groups: Vec<GroupId> = reached.into_iter().collect();
    groups.sort();
    Ok(groups)
}

pub async fn validate(store: &Store) -> Result<StoreCounts> {
    store.counts().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth_perms::PermsConfig;
    use std::io::Write;

    const CLINIC: &str = r#"
principals:
  - id: u1
  - id: u2
groups:
  - id: g1
    global_perms: [view_patients]
  - id: g2
memberships:
  - member: user:u1
    group: g1
  - member: group:g1
    group: g2
  - member: group:g2
    group: g1
grants:
  - source: user:u2
    object: p1
    name: change_patients
"#;

    async fn clinic() -> (Store, PermissionResolver) {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(CLINIC.as_bytes()).unwrap();

        let config = PermsConfig::default();
        let store = Store::open(Some(file.path()), &config).await.unwrap();
        let resolver = store.resolver(&config);
        (store, resolver)
    }

    #[tokio::test]
    async fn test_check_verdicts() {
        let (_, resolver) = clinic().await;

        let verdict = check(&resolver, "u1", "view_patients", None, true).await.unwrap();
        assert_eq!(verdict, Verdict::Allowed(Some(GrantSource::GroupGlobal)));
        assert_eq!(verdict.render(), "allowed (group_global)");

        let verdict = check(&resolver, "u2", "change_patients", Some("p1"), false).await.unwrap();
        assert_eq!(verdict, Verdict::Allowed(None));

        let verdict = check(&resolver, "u2", "change_patients", None, false).await.unwrap();
        assert_eq!(verdict, Verdict::Denied);
        assert_eq!(verdict.exit_code(), 1);

        // Unknown principals are denied, not errors
        let verdict = check(&resolver, "ghost", "view_patients", None, false).await.unwrap();
        assert_eq!(verdict, Verdict::Denied);
    }

    #[tokio::test]
    async fn test_groups_through_cycle() {
        let (_, resolver) = clinic().await;

        let reached = groups(&resolver, &NodeRef::principal("u1")).await.unwrap();
        assert_eq!(reached, vec![GroupId::new("g1"), GroupId::new("g2")]);

        let reached = groups(&resolver, &NodeRef::group("g1")).await.unwrap();
        assert_eq!(reached, vec![GroupId::new("g2")]);
    }

    #[tokio::test]
    async fn test_validate_counts() {
        let (store, _) = clinic().await;
        let counts = validate(&store).await.unwrap();
        assert_eq!(
            counts,
            StoreCounts {
                principals: 2,
                groups: 2,
                memberships: 3,
                grants: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_dangling_fixture_fails_to_open() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(b"memberships:\n  - member: user:u1\n    group: g1\n").unwrap();

        let result = Store::open(Some(file.path()), &PermsConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_data_source_is_an_error() {
        let result = Store::open(None, &PermsConfig::default()).await;
        assert!(result.is_err());
    }
}
