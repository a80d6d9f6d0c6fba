use super::error::{CouchResult, CouchStoreError};

/// Runtime configuration describing how to connect to CouchDB.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server base URL, without a trailing slash.
    pub base_url: String,
    /// Database holding the document tree.
    pub database: String,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

impl CouchConfig {
    /// Construct a configuration from explicit base URL and database name.
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: database.into(),
            username: None,
            password: None,
        }
    }

    /// Attach basic-auth credentials to the configuration.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Build a configuration by reading the expected environment variables.
    pub fn from_env() -> CouchResult<Self> {
        let base_url =
            std::env::var("TALLY_COUCH_BASE_URL").map_err(|_| CouchStoreError::MissingEnvVar {
                var: "TALLY_COUCH_BASE_URL",
            })?;
        let database = std::env::var("TALLY_COUCH_DB").map_err(|_| {
            CouchStoreError::MissingEnvVar {
                var: "TALLY_COUCH_DB",
            }
        })?;

        let mut config = Self::new(base_url, database);

        if let (Some(username), Some(password)) = (
            std::env::var("TALLY_COUCH_USERNAME").ok(),
            std::env::var("TALLY_COUCH_PASSWORD").ok(),
        ) {
            config = config.with_credentials(username, password);
        }

        Ok(config)
    }
}
