//! SurrealDB connection shared by the stream store.
//!
//! Every endpoint (`mem://`, `surrealkv://path`, `ws://`/`wss://` hosts) goes
//! through [`SurrealHandle::open`]; credentials are optional and only sent
//! when present. Cloning the handle shares the underlying client.

use crate::error::StateError;
use crate::migrations;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info};

pub const DEFAULT_URL: &str = "mem://";
pub const DEFAULT_NAMESPACE: &str = "swarm";
pub const DEFAULT_DATABASE: &str = "main";

/// Which SurrealDB user the credentials belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    Root,
    Database,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub level: AuthLevel,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("level", &self.level)
            .finish()
    }
}

/// Where and how to open the stream database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub credentials: Option<Credentials>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new(DEFAULT_URL)
    }
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            credentials: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        level: AuthLevel,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            level,
        });
        self
    }

    /// Options from `SURREALDB_*` environment variables.
    ///
    /// - `SURREALDB_ENDPOINT`, else `SURREALDB_URL`, else `mem://`
    /// - `SURREALDB_NAMESPACE` / `SURREALDB_DATABASE`
    /// - `SURREALDB_USERNAME` + `SURREALDB_PASSWORD` enable sign-in;
    ///   `SURREALDB_ROOT=true` signs in as root
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ConnectOptions::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("SURREALDB_ENDPOINT")
            .or_else(|| lookup("SURREALDB_URL"))
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let mut options = Self::new(url);
        if let Some(ns) = lookup("SURREALDB_NAMESPACE") {
            options.namespace = ns;
        }
        if let Some(db) = lookup("SURREALDB_DATABASE") {
            options.database = db;
        }
        if let (Some(username), Some(password)) =
            (lookup("SURREALDB_USERNAME"), lookup("SURREALDB_PASSWORD"))
        {
            let root = lookup("SURREALDB_ROOT").is_some_and(|v| v.eq_ignore_ascii_case("true"));
            let level = if root { AuthLevel::Root } else { AuthLevel::Database };
            options = options.with_credentials(username, password, level);
        }
        options
    }
}

/// Shared SurrealDB connection handle
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to an in-memory database (for tests and ephemeral runs).
    pub async fn in_memory() -> Result<Self> {
        Self::open(&ConnectOptions::default()).await
    }

    /// Connect to an endpoint URL with the default namespace and database.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::open(&ConnectOptions::new(url)).await
    }

    /// Connect, sign in when credentials are set, select the namespace and
    /// database, then apply the stream schema.
    pub async fn open(options: &ConnectOptions) -> Result<Self> {
        let url = &options.url;
        let db = surrealdb::engine::any::connect(url.as_str())
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        match &options.credentials {
            Some(creds) if creds.level == AuthLevel::Root => {
                db.signin(Root {
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
            }
            Some(creds) => {
                db.signin(Database {
                    namespace: &options.namespace,
                    database: &options.database,
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
            }
            None => debug!(url = %url, "connecting without credentials"),
        }

        db.use_ns(&options.namespace)
            .use_db(&options.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(
            url = %url,
            namespace = %options.namespace,
            database = %options.database,
            "stream database connected"
        );
        Ok(Self { db })
    }

    /// Connect using [`ConnectOptions::from_env`].
    pub async fn from_env() -> Result<Self> {
        Self::open(&ConnectOptions::from_env()).await
    }

    /// Borrow the underlying client.
    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_means_memory() {
        let options = ConnectOptions::from_lookup(lookup(&[]));
        assert_eq!(options, ConnectOptions::default());
        assert_eq!(options.url, "mem://");
        assert!(options.credentials.is_none());
    }

    #[test]
    fn endpoint_wins_over_url_and_credentials_need_both_parts() {
        let options = ConnectOptions::from_lookup(lookup(&[
            ("SURREALDB_ENDPOINT", "wss://db.example"),
            ("SURREALDB_URL", "surrealkv://ignored"),
            ("SURREALDB_USERNAME", "swarm"),
            ("SURREALDB_NAMESPACE", "prod"),
        ]));
        assert_eq!(options.url, "wss://db.example");
        assert_eq!(options.namespace, "prod");
        assert_eq!(options.database, DEFAULT_DATABASE);
        assert!(options.credentials.is_none());
    }

    #[test]
    fn root_flag_selects_root_sign_in() {
        let options = ConnectOptions::from_lookup(lookup(&[
            ("SURREALDB_USERNAME", "admin"),
            ("SURREALDB_PASSWORD", "s3cret"),
            ("SURREALDB_ROOT", "TRUE"),
        ]));
        let creds = options.credentials.clone().unwrap();
        assert_eq!(creds.level, AuthLevel::Root);
        assert!(!format!("{creds:?}").contains("s3cret"));

        let overridden = options
            .with_url("ws://localhost:8000")
            .with_namespace("staging")
            .with_database("streams");
        assert_eq!(overridden.url, "ws://localhost:8000");
        assert_eq!(overridden.namespace, "staging");
        assert_eq!(overridden.database, "streams");
        assert!(overridden.credentials.is_some());
    }

    #[tokio::test]
    async fn open_uses_requested_namespace() {
        let options = ConnectOptions::default()
            .with_namespace("tests")
            .with_database("handle");
        let handle = SurrealHandle::open(&options).await.unwrap();
        #[derive(serde::Deserialize)]
        struct Row {
            #[allow(dead_code)]
            seq: u64,
        }
        let mut response = handle
            .db()
            .query("SELECT seq FROM stream_entries LIMIT 1")
            .await
            .unwrap();
        let rows: Vec<Row> = response.take(0).unwrap();
        assert!(rows.is_empty());
    }
}
