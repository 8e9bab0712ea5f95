use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

/// Error for configuration validation failures.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A field contains an invalid value.
    #[error("invalid value for field `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}

/// Kind of database the import engine writes to.
///
/// One variant is selected at startup by configuration and drives which target
/// adapter the engine constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetDbType {
    Yugabytedb,
    Oracle,
}

impl TargetDbType {
    /// Returns the lowercase name used in logs and discovery files.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetDbType::Yugabytedb => "yugabytedb",
            TargetDbType::Oracle => "oracle",
        }
    }
}

/// Connection settings for the target database.
///
/// This intentionally does not implement [`serde::Serialize`] to avoid
/// accidentally leaking the password into serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConnectionConfig {
    /// Hostname or IP address of the target database.
    pub host: String,
    /// Port the target database listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name of the database (YugabyteDB) or service (Oracle) to connect to.
    pub database: String,
    /// User to authenticate as.
    pub username: String,
    /// Password to authenticate with.
    pub password: SecretString,
    /// Schema objects are imported into when the source does not qualify names.
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl TargetConnectionConfig {
    /// Default target schema.
    pub const DEFAULT_SCHEMA: &'static str = "public";

    /// Validates connection configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "target.connection.host".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        if self.database.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "target.connection.database".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Returns the password in clear text.
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns an `ez-connect` style address usable by the Oracle command line
    /// clients.
    pub fn oracle_connect_string(&self) -> String {
        format!(
            "{}/{}@{}:{}/{}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.database
        )
    }
}

fn default_port() -> u16 {
    5433
}

fn default_schema() -> String {
    TargetConnectionConfig::DEFAULT_SCHEMA.to_string()
}
