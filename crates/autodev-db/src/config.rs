use std::env;

/// Database configuration.
///
/// The database doubles as the job-queue and event-broker transport, so this
/// is the single endpoint the whole core connects to.
///
/// Resolution order: `AUTODEV_DATABASE_URL` as a full URL, then the
/// individual `DB_HOST` / `DB_PORT` / `DB_USER` / `DB_PASSWORD` / `DB_NAME`
/// variables, then the compile-time default.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/autodev";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        if let Ok(url) = env::var("AUTODEV_DATABASE_URL") {
            return Self { database_url: url };
        }

        // Compose from DB_* parts when any of them is present.
        let host = env::var("DB_HOST").ok();
        let port = env::var("DB_PORT").ok();
        let user = env::var("DB_USER").ok();
        let password = env::var("DB_PASSWORD").ok();
        let name = env::var("DB_NAME").ok();

        if host.is_none() && port.is_none() && user.is_none() && name.is_none() {
            return Self {
                database_url: Self::DEFAULT_URL.to_owned(),
            };
        }

        let host = host.unwrap_or_else(|| "localhost".to_owned());
        let port = port.unwrap_or_else(|| "5432".to_owned());
        let name = name.unwrap_or_else(|| "autodev".to_owned());

        let auth = match (user, password) {
            (Some(u), Some(p)) => format!("{u}:{p}@"),
            (Some(u), None) => format!("{u}@"),
            _ => String::new(),
        };

        Self {
            database_url: format!("postgresql://{auth}{host}:{port}/{name}"),
        }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Extract the database name from the URL.
    ///
    /// Returns `None` if the URL cannot be parsed or has no path component.
    pub fn database_name(&self) -> Option<&str> {
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does
    /// not yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
