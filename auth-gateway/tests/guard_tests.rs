use async_trait::async_trait;
use auth_gateway::*;
use auth_perms::repository::{DirectoryRepository, GrantRepository, InMemoryRepository, MembershipRepository};
use auth_perms::*;
use axum::{
    body::Body,
    extract::Path,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Extension, Router,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower::ServiceExt;

/// Every call fails as if the database were down.
struct UnreachableStore;

fn down() -> PermsError {
    PermsError::store("connection refused")
}

#[async_trait]
impl DirectoryRepository for UnreachableStore {
    async fn principal(&self, _: &PrincipalId) -> Result<Option<Principal>, PermsError> {
        Err(down())
    }
    async fn group(&self, _: &GroupId) -> Result<Option<Group>, PermsError> {
        Err(down())
    }
    async fn insert_principal(&self, _: Principal) -> Result<(), AdminError> {
        Err(down().into())
    }
    async fn insert_group(&self, _: Group) -> Result<(), AdminError> {
        Err(down().into())
    }
    async fn set_principal_perms(&self, _: &PrincipalId, _: BTreeSet<String>) -> Result<bool, PermsError> {
        Err(down())
    }
    async fn set_group_perms(&self, _: &GroupId, _: BTreeSet<String>) -> Result<bool, PermsError> {
        Err(down())
    }
    async fn remove_principal(&self, _: &PrincipalId) -> Result<bool, PermsError> {
        Err(down())
    }
    async fn remove_group(&self, _: &GroupId) -> Result<bool, PermsError> {
        Err(down())
    }
}

#[async_trait]
impl MembershipRepository for UnreachableStore {
    async fn parent_groups(&self, _: &[NodeRef]) -> Result<Vec<Group>, PermsError> {
        Err(down())
    }
    async fn insert_membership(&self, _: MembershipEdge) -> Result<(), AdminError> {
        Err(down().into())
    }
    async fn remove_membership(&self, _: &NodeRef, _: &GroupId) -> Result<bool, PermsError> {
        Err(down())
    }
    async fn remove_memberships_touching(&self, _: &NodeRef) -> Result<usize, PermsError> {
        Err(down())
    }
}

#[async_trait]
impl GrantRepository for UnreachableStore {
    async fn object_grant_exists(&self, _: &[NodeRef], _: &str, _: &ObjectId) -> Result<bool, PermsError> {
        Err(down())
    }
    async fn insert_object_grant(&self, _: GrantEdge) -> Result<(), AdminError> {
        Err(down().into())
    }
    async fn remove_object_grant(&self, _: &NodeRef, _: &str, _: &ObjectId) -> Result<bool, PermsError> {
        Err(down())
    }
    async fn remove_object_grants_for_object(&self, _: &ObjectId) -> Result<usize, PermsError> {
        Err(down())
    }
    async fn remove_object_grants_from(&self, _: &NodeRef) -> Result<usize, PermsError> {
        Err(down())
    }
    async fn object_grants_for(&self, _: &ObjectId) -> Result<Vec<GrantEdge>, PermsError> {
        Err(down())
    }
}

async fn clinic() -> PermissionResolver {
    let repo = Arc::new(InMemoryRepository::new());
    let admin = PermissionAdmin::new(repo.clone(), repo.clone(), repo.clone(), PermsConfig::default());

    admin.create_principal("u1").await.unwrap();
    admin.create_principal("u2").await.unwrap();
    admin
        .create_group(Group::new("g1").with_perms(["view_patients"]))
        .await
        .unwrap();
    admin
        .add_member(NodeRef::principal("u1"), GroupId::new("g1"))
        .await
        .unwrap();
    admin
        .grant_on_object(NodeRef::principal("u2"), ObjectId::new("p1"), "change_patients")
        .await
        .unwrap();

    PermissionResolver::new(repo.clone(), repo.clone(), repo)
}

async fn list_patients() -> &'static str {
    "patients"
}

async fn update_patient(
    Extension(resolver): Extension<PermissionResolver>,
    CurrentPrincipal(principal): CurrentPrincipal,
    Path(id): Path<String>,
) -> Response {
    let object = ObjectId::new(id);
    match require_permission(&resolver, principal.as_ref(), "change_patients", Some(&object)).await {
        Ok(()) => "updated".into_response(),
        Err(err) => err.into_response(),
    }
}

fn app(resolver: PermissionResolver) -> Router {
    Router::new()
        .route("/patients", get(list_patients))
        .route_layer(guard(resolver.clone(), "view_patients"))
        .route("/patients/:id", put(update_patient))
        .layer(Extension(resolver))
}

fn request(method: &str, uri: &str, principal: Option<Principal>) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    if let Some(principal) = principal {
        req.extensions_mut().insert(CurrentPrincipal::authenticated(principal));
    }
    req
}

async fn error_body(response: Response) -> GatewayErrorResponse {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_guard_passes_inherited_permission() {
    let app = app(clinic().await);
    let response = app
        .oneshot(request("GET", "/patients", Some(Principal::new("u1"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_guard_rejects_with_403() {
    let app = app(clinic().await);
    let response = app
        .oneshot(request("GET", "/patients", Some(Principal::new("u2"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = error_body(response).await;
    assert_eq!(body.code, "AUTHZ_3001");
    assert_eq!(body.error_type, "authorization_error");
}

#[tokio::test]
async fn test_anonymous_request_is_denied() {
    let app = app(clinic().await);
    let response = app.oneshot(request("GET", "/patients", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_store_failure_is_503_not_403() {
    let store = Arc::new(UnreachableStore);
    let resolver = PermissionResolver::new(store.clone(), store.clone(), store);
    let app = app(resolver);

    let response = app
        .oneshot(request("GET", "/patients", Some(Principal::new("u1"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = error_body(response).await;
    assert_eq!(body.code, "STORE_5001");
    assert!(!body.message.contains("connection refused"));
}

#[tokio::test]
async fn test_guard_never_sees_object_scoped_grants() {
    // u2 holds change_patients on p1 only; a global guard must not pass it
    let resolver = clinic().await;
    let app = Router::new()
        .route("/patients", get(list_patients))
        .route_layer(guard(resolver, "change_patients"));

    let response = app
        .oneshot(request("GET", "/patients", Some(Principal::new("u2"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_inline_object_check() {
    let resolver = clinic().await;

    let allowed = app(resolver.clone())
        .oneshot(request("PUT", "/patients/p1", Some(Principal::new("u2"))))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let other_object = app(resolver.clone())
        .oneshot(request("PUT", "/patients/p2", Some(Principal::new("u2"))))
        .await
        .unwrap();
    assert_eq!(other_object.status(), StatusCode::FORBIDDEN);

    let anonymous = app(resolver)
        .oneshot(request("PUT", "/patients/p1", None))
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);
}
