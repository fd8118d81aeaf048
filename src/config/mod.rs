pub mod bootstrap_plan;
#[cfg(feature = "cli")]
pub mod cli;

use crate::utils::error::{Result, StallbookError};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "stallbook.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    Sqlite,
    Mysql,
    Postgres,
}

impl DatabaseEngine {
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DatabaseEngine::Sqlite => None,
            DatabaseEngine::Mysql => Some(3306),
            DatabaseEngine::Postgres => Some(5432),
        }
    }

    pub fn is_server(&self) -> bool {
        !matches!(self, DatabaseEngine::Sqlite)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    /// SQLite store file
    pub path: String,
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    /// Environment variable holding the password, preferred over `password`.
    pub password_env: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: DatabaseEngine::Sqlite,
            path: ".stallbook/stallbook.db".to_string(),
            host: "127.0.0.1".to_string(),
            port: None,
            name: "stallbook".to_string(),
            user: "stallbook".to_string(),
            password: None,
            password_env: Some("STALLBOOK_DB_PASSWORD".to_string()),
        }
    }
}

impl DatabaseConfig {
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.engine.default_port())
    }

    /// 解析密碼：設定檔的 `password` 優先，其次才是 `password_env` 指定的環境變數
    pub fn resolve_password(&self) -> Result<String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        self.password_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .ok_or_else(|| StallbookError::MissingConfigError {
                field: match &self.password_env {
                    Some(var) => format!("database.password (or ${})", var),
                    None => "database.password".to_string(),
                },
            })
    }
}

impl Validate for DatabaseConfig {
    fn validate(&self) -> Result<()> {
        if self.engine.is_server() {
            validation::validate_non_empty_string("database.host", &self.host)?;
            validation::validate_non_empty_string("database.name", &self.name)?;
            validation::validate_non_empty_string("database.user", &self.user)?;
            if let Some(port) = self.port {
                validation::validate_range("database.port", port, 1, u16::MAX)?;
            }
        } else {
            validation::validate_path("database.path", &self.path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_str(&content)
    }

    /// Reads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(
                "No config at {}, using defaults",
                path.as_ref().display()
            );
            Ok(Self::default())
        }
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content)?;
        let config: AppConfig = toml::from_str(&processed)?;
        Ok(config)
    }
}

impl Validate for AppConfig {
    fn validate(&self) -> Result<()> {
        self.database.validate()?;
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(StallbookError::InvalidConfigValueError {
                field: "logging.level".to_string(),
                value: other.to_string(),
                reason: "Expected one of trace, debug, info, warn, error".to_string(),
            }),
        }
    }
}

/// 替換 `${VAR}` 形式的環境變數；未設定的變數保持原樣
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| StallbookError::config(format!("env pattern: {}", e)))?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.database.engine, DatabaseEngine::Sqlite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_engine_parsing() {
        let config = AppConfig::from_str(
            r#"
[database]
engine = "mysql"
host = "db.internal"
name = "lpu_food"
user = "root"
password = "secret"
password_env = "STALLBOOK_TEST_UNSET_VAR"
"#,
        )
        .unwrap();

        assert_eq!(config.database.engine, DatabaseEngine::Mysql);
        assert_eq!(config.database.effective_port(), Some(3306));
        assert_eq!(config.database.resolve_password().unwrap(), "secret");
    }

    #[test]
    fn test_password_field_wins_over_env() {
        std::env::set_var("STALLBOOK_TEST_DB_PASSWORD", "from-env");
        let mut db = DatabaseConfig {
            engine: DatabaseEngine::Postgres,
            password: Some("from-file".to_string()),
            password_env: Some("STALLBOOK_TEST_DB_PASSWORD".to_string()),
            ..DatabaseConfig::default()
        };
        assert_eq!(db.resolve_password().unwrap(), "from-file");

        db.password = None;
        assert_eq!(db.resolve_password().unwrap(), "from-env");
    }

    #[test]
    fn test_missing_password_is_reported() {
        let db = DatabaseConfig {
            engine: DatabaseEngine::Postgres,
            password: None,
            password_env: Some("STALLBOOK_TEST_NEVER_SET".to_string()),
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            db.resolve_password(),
            Err(StallbookError::MissingConfigError { .. })
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let config = AppConfig::from_str("[logging]\nlevel = \"loud\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unset_env_var_left_in_place() {
        let out = substitute_env_vars("path = \"${STALLBOOK_TEST_NOT_DEFINED}\"").unwrap();
        assert_eq!(out, "path = \"${STALLBOOK_TEST_NOT_DEFINED}\"");
    }
}
