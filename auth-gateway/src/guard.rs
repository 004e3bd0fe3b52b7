//! Route-level permission guard.
//!
//! Route guards only ever ask the global form of the question: the object id
//! is not known until the handler has parsed its path. Handlers that operate
//! on one object call [`require_permission`] inline instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use auth_gateway::guard;
//! use axum::{routing::post, Router};
//!
//! let app = Router::new()
//!     .route("/patients", post(create_patient))
//!     .route_layer(guard(resolver.clone(), "add_patients"));
//! ```

use crate::error::GatewayError;
use crate::principal::CurrentPrincipal;
use auth_perms::{ObjectId, PermissionResolver, Principal};
use axum::{
    body::Body,
    http::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

/// Builds the guard layer for `permission`.
pub fn guard(resolver: PermissionResolver, permission: impl Into<String>) -> RequirePermission {
    RequirePermission::new(resolver, permission)
}

/// Inline object-scoped check for handlers.
///
/// `Ok(())` lets the handler proceed. Denial and store failure come back as
/// the matching [`GatewayError`], ready to return from the handler.
pub async fn require_permission(
    resolver: &PermissionResolver,
    principal: Option<&Principal>,
    permission: &str,
    object: Option<&ObjectId>,
) -> Result<(), GatewayError> {
    if resolver.authorize(principal, permission, object).await? {
        Ok(())
    } else {
        Err(GatewayError::denied(permission))
    }
}

/// Layer that lets a request through only when the current principal holds
/// a permission.
#[derive(Clone)]
pub struct RequirePermission {
    resolver: PermissionResolver,
    permission: Arc<str>,
}

impl RequirePermission {
    pub fn new(resolver: PermissionResolver, permission: impl Into<String>) -> Self {
        Self {
            resolver,
            permission: Arc::from(permission.into()),
        }
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }
}

impl<S> Layer<S> for RequirePermission {
    type Service = RequirePermissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequirePermissionService {
            inner,
            resolver: self.resolver.clone(),
            permission: self.permission.clone(),
        }
    }
}

/// Service wrapper for [`RequirePermission`] layer.
#[derive(Clone)]
pub struct RequirePermissionService<S> {
    inner: S,
    resolver: PermissionResolver,
    permission: Arc<str>,
}

impl<S> Service<Request<Body>> for RequirePermissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // The clone taken here has not been polled ready; keep the ready one
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let resolver = self.resolver.clone();
        let permission = self.permission.clone();

        Box::pin(async move {
            let current = CurrentPrincipal::from_extensions(req.extensions());
            match resolver.authorize(current.principal(), &permission, None).await {
                Ok(true) => {
                    debug!(permission = %permission, path = %req.uri().path(), "Guard passed");
                    inner.call(req).await
                }
                Ok(false) => Ok(GatewayError::denied(&*permission).into_response()),
                Err(err) => Ok(GatewayError::from(err).into_response()),
            }
        })
    }
}
