use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate an interval expressed in seconds
    pub fn validate_interval_seconds(value: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if value > 86400 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 86400"
            )));
        }
        Ok(())
    }

    /// Validate that a count lies in `1..=max`
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate a ratio in the open-closed interval (0, 1]
    pub fn validate_ratio(value: f64, field_name: &str) -> ConfigResult<()> {
        if !(value > 0.0 && value <= 1.0) {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be in (0, 1]"
            )));
        }
        Ok(())
    }

    /// Validate that a URL has a valid format
    pub fn validate_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;

        if !url.contains("://") {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        }

        Ok(())
    }
}
