use async_trait::async_trait;
use auth_perms::Principal;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, Extensions};
use std::convert::Infallible;

/// The authenticated principal for the current request.
///
/// Inserted as a request extension by the session layer, which runs ahead of
/// any guard. A request without the extension is anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentPrincipal(pub Option<Principal>);

impl CurrentPrincipal {
    pub fn authenticated(principal: Principal) -> Self {
        Self(Some(principal))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.0.as_ref()
    }

    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<CurrentPrincipal>().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentPrincipal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_extensions(&parts.extensions))
    }
}
