//! Authorization gateway for Perms Engine
//!
//! Adapts [`auth_perms::PermissionResolver`] to axum request pipelines:
//! - [`guard`] builds a tower layer for route-level, global-only checks
//! - [`require_permission`] is the inline, object-scoped check for handlers
//! - [`CurrentPrincipal`] carries the session's principal through the request
//! - [`GatewayError`] renders denial as 403 and store failure as 503

pub mod error;
pub mod guard;
pub mod principal;

pub use error::{GatewayError, GatewayErrorResponse};
pub use guard::{guard, require_permission, RequirePermission, RequirePermissionService};
pub use principal::CurrentPrincipal;
