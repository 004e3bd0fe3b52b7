use crate::fixture::Fixture;
use anyhow::{bail, Context, Result};
use auth_perms::repository::{postgres::PostgresRepository, InMemoryRepository, StoreCounts};
use auth_perms::{PermissionAdmin, PermissionResolver, PermsConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Backing store selected from the command line and configuration
#[derive(Clone)]
pub enum Store {
    Memory(Arc<InMemoryRepository>),
    Postgres(Arc<PostgresRepository>),
}

impl Store {
    /// A fixture wins over a configured database.
    pub async fn open(fixture: Option<&Path>, config: &PermsConfig) -> Result<Self> {
        if let Some(path) = fixture {
            let fixture = Fixture::from_path(path)?;
            let store = Store::Memory(Arc::new(InMemoryRepository::new()));
            fixture
                .load_into(&store.admin(config))
                .await
                .with_context(|| format!("Fixture {} is inconsistent", path.display()))?;
            return Ok(store);
        }

        let Some(url) = config.database_url.as_deref() else {
            bail!("No data source: pass --fixture or set database_url (PERMS_DATABASE_URL)");
        };
        let repo = PostgresRepository::from_connection_string(url).await?;
        repo.ensure_schema().await?;
        info!("Connected to PostgreSQL permission store");
        Ok(Store::Postgres(Arc::new(repo)))
    }

    pub fn resolver(&self, config: &PermsConfig) -> PermissionResolver {
        let resolver = match self {
            Store::Memory(repo) => PermissionResolver::new(repo.clone(), repo.clone(), repo.clone()),
            Store::Postgres(repo) => PermissionResolver::new(repo.clone(), repo.clone(), repo.clone()),
        };
        resolver.with_max_depth(config.max_depth)
    }

    pub fn admin(&self, config: &PermsConfig) -> PermissionAdmin {
        match self {
            Store::Memory(repo) => PermissionAdmin::new(repo.clone(), repo.clone(), repo.clone(), config.clone()),
            Store::Postgres(repo) => PermissionAdmin::new(repo.clone(), repo.clone(), repo.clone(), config.clone()),
        }
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        Ok(match self {
            Store::Memory(repo) => repo.counts(),
            Store::Postgres(repo) => repo.counts().await?,
        })
    }
}
