//! Group-aware permission resolution for Perms Engine
//!
//! Answers one question: can principal P exercise permission A, optionally on
//! object O? Four additive sources can grant it:
//! - global permissions on the principal record
//! - object-scoped grants held by the principal
//! - global permissions on any group reached over `memberOf` edges
//! - object-scoped grants held by any such group
//!
//! Group membership is a directed graph that may be deep or cyclic. The
//! resolver walks it breadth-first with a visited set and a hop bound
//! (default 100), so every query terminates.
//!
//! # Example
//!
//! ```rust
//! use auth_perms::{repository::InMemoryRepository, *};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let repo = Arc::new(InMemoryRepository::new());
//!     let admin = PermissionAdmin::new(repo.clone(), repo.clone(), repo.clone(), PermsConfig::default());
//!     let resolver = PermissionResolver::new(repo.clone(), repo.clone(), repo);
//!
//!     admin.create_principal("u1").await?;
//!     admin.create_group(Group::new("g1").with_perms(["view_patients"])).await?;
//!     admin.add_member(NodeRef::principal("u1"), GroupId::new("g1")).await?;
//!
//!     let allowed = resolver
//!         .authorize_id(Some(&PrincipalId::new("u1")), "view_patients", None)
//!         .await?;
//!     assert!(allowed);
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod config;
pub mod error;
pub mod grants;
pub mod graph;
pub mod models;
pub mod repository;
pub mod resolver;

pub use admin::{AdminError, PermissionAdmin};
pub use config::{ConfigError, PermsConfig};
pub use error::PermsError;
pub use grants::GrantStore;
pub use graph::{MembershipGraph, DEFAULT_MAX_DEPTH};
pub use models::*;
pub use resolver::PermissionResolver;
