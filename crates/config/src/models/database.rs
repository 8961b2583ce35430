use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 任务存储配置
///
/// `url` 取值: `memory`（进程内存储）、`sqlite::memory:` 或 `sqlite://path/to/db`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url == "memory"
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://zimfarm.db".to_string(),
            max_connections: 5,
        }
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;

        if !self.is_in_memory() && !self.url.starts_with("sqlite:") {
            return Err(crate::ConfigError::Validation(
                "database.url must be `memory` or start with sqlite:".to_string(),
            ));
        }

        ValidationUtils::validate_count(
            self.max_connections as usize,
            "database.max_connections",
            100,
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_validation() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());

        let mut memory = config.clone();
        memory.url = "memory".to_string();
        assert!(memory.validate().is_ok());
        assert!(memory.is_in_memory());

        let mut invalid_config = config.clone();
        invalid_config.url = "postgresql://localhost/zimfarm".to_string();
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config;
        invalid_config.max_connections = 0;
        assert!(invalid_config.validate().is_err());
    }
}
