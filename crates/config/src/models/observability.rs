use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// `json` 或 `pretty`
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9100".to_string(),
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(crate::ConfigError::Validation(format!(
                "Invalid log level: {}. Valid options: {:?}",
                self.log_level, valid_levels
            )));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(crate::ConfigError::Validation(format!(
                "Invalid log format: {}. Valid options: {:?}",
                self.log_format, valid_formats
            )));
        }

        if self.metrics_enabled {
            ValidationUtils::validate_not_empty(
                &self.metrics_bind_address,
                "observability.metrics_bind_address",
            )?;
        }

        Ok(())
    }
}
