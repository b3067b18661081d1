//! Extender 配置
//!
//! 配置来源按优先级从低到高：内置默认值、配置文件、环境变量（`EXTENDER__*`）

use crate::errors::ConfigError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// 默认环境变量前缀
pub const ENV_PREFIX: &str = "EXTENDER";

/// Extender 框架配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtenderConfig {
    /// 附加的可见性过滤器，与监听器的基础过滤器取交集
    pub visibility_filter: Option<String>,
    /// 关闭时发现未注销的注册是否返回错误（否则只记录日志）
    pub fail_on_leak: bool,
    /// 未显式指定时写入注册属性的排名
    pub default_ranking: i64,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Default for ExtenderConfig {
    fn default() -> Self {
        Self {
            visibility_filter: None,
            fail_on_leak: true,
            default_ranking: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl ExtenderConfig {
    /// 从可选的配置文件和 `EXTENDER__*` 环境变量加载配置
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// 使用指定的环境变量前缀加载配置
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!("加载 Extender 配置文件: {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(filter) = &self.visibility_filter {
            if filter.trim().is_empty() {
                return Err(ConfigError::ValidationError {
                    message: "visibility_filter 不能为空字符串".to_string(),
                });
            }
        }
        self.logging.validate()
    }

    /// 设置可见性过滤器
    pub fn with_visibility_filter(mut self, filter: impl Into<String>) -> Self {
        self.visibility_filter = Some(filter.into());
        self
    }

    /// 设置泄漏时是否报错
    pub fn with_fail_on_leak(mut self, fail_on_leak: bool) -> Self {
        self.fail_on_leak = fail_on_leak;
        self
    }
}
