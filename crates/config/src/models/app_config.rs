use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    dispatcher_worker::{DispatcherConfig, WorkerConfig},
    executor::ExecutorConfig,
    notification::NotificationConfig,
    observability::ObservabilityConfig,
};
use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：内置默认值 → TOML文件 → `ZIMFARM__SECTION__KEY` 环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = toml::to_string(&AppConfig::default()).context("序列化默认配置失败")?;
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/zimfarm.toml", "zimfarm.toml", "/etc/zimfarm/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ZIMFARM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("worker.backends")
                .with_list_parse_key("worker.offliners"),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.database.validate()?;
        self.dispatcher.validate()?;
        if self.worker.enabled {
            self.worker.validate()?;
        }
        self.executor.validate()?;
        self.notifications.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
