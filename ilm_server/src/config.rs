//! Lifecycle manager configuration, loaded from environment variables.

#[derive(Clone, Debug)]
pub struct IlmConfig {
    /// PostgreSQL URL for the document store. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Maximum pooled connections to the document store.
    pub db_pool_size: usize,
    /// Audit events held before the oldest is dropped.
    pub audit_queue_capacity: usize,
    /// Stamped into `author` on new projects.
    pub author: String,
    /// Stamped into `updatedBy` on project updates.
    pub updater: String,
}

impl IlmConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        let db_pool_size = std::env::var("ILM_DB_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);
        let audit_queue_capacity = std::env::var("ILM_AUDIT_QUEUE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024);
        let author = std::env::var("ILM_AUTHOR").unwrap_or_else(|_| "author".to_string());
        let updater = std::env::var("ILM_UPDATER").unwrap_or_else(|_| "updater".to_string());

        if database_url.is_none() {
            tracing::warn!("DATABASE_URL not set -- using in-memory store, nothing is persisted");
        }

        Self {
            database_url,
            db_pool_size,
            audit_queue_capacity,
            author,
            updater,
        }
    }

    /// Override the store location, e.g. from a command-line flag.
    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.database_url = url;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_environment_only_when_given() {
        let config = IlmConfig {
            database_url: Some("postgres://env".into()),
            db_pool_size: 8,
            audit_queue_capacity: 1024,
            author: "author".into(),
            updater: "updater".into(),
        };
        let kept = config.clone().with_database_url(None);
        assert_eq!(kept.database_url.as_deref(), Some("postgres://env"));
        let replaced = config.with_database_url(Some("postgres://flag".into()));
        assert_eq!(replaced.database_url.as_deref(), Some("postgres://flag"));
    }
}
