//! Extender 框架构建器

use crate::extender::RegistrationPolicy;
use crate::framework::ExtenderFramework;
use crate::listeners::{ExtenderModuleListener, ExtenderServiceListener, RemovalHook};
use crate::service_map::ExtenderServiceMap;
use extender_abstractions::{Filter, HostRuntime, TrackingHook};
use extender_common::{
    init_logging, ConfigError, ExtenderConfig, ExtenderResult, LoggingConfig, EXTENDER_OWNER,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Extender 框架构建器
pub struct ExtenderFrameworkBuilder {
    /// 宿主运行时
    host: Option<Arc<dyn HostRuntime>>,
    /// 显式提供的配置
    config: Option<ExtenderConfig>,
    /// 配置文件路径
    config_path: Option<PathBuf>,
    /// 是否从环境变量加载配置
    env_config: bool,
    /// 日志配置，设置后在构建时初始化日志
    logging: Option<LoggingConfig>,
    /// 注册表移除回调
    removal_hook: Option<Arc<dyn RemovalHook>>,
    /// 跟踪生命周期钩子
    tracking_hook: Option<Arc<dyn TrackingHook>>,
}

impl ExtenderFrameworkBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            host: None,
            config: None,
            config_path: None,
            env_config: false,
            logging: None,
            removal_hook: None,
            tracking_hook: None,
        }
    }

    /// 设置宿主运行时
    pub fn with_host(mut self, host: Arc<dyn HostRuntime>) -> Self {
        self.host = Some(host);
        self
    }

    /// 使用指定配置
    pub fn with_config(mut self, config: ExtenderConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 从配置文件加载配置（同时读取 `EXTENDER__*` 环境变量）
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        info!("添加配置文件: {}", path.as_ref().display());
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// 仅从 `EXTENDER__*` 环境变量加载配置
    pub fn with_env_config(mut self) -> Self {
        self.env_config = true;
        self
    }

    /// 配置日志
    pub fn with_logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    /// 设置注册表移除回调
    pub fn with_removal_hook(mut self, hook: Arc<dyn RemovalHook>) -> Self {
        self.removal_hook = Some(hook);
        self
    }

    /// 设置跟踪生命周期钩子
    pub fn with_tracking_hook(mut self, hook: Arc<dyn TrackingHook>) -> Self {
        self.tracking_hook = Some(hook);
        self
    }

    /// 构建框架并向宿主安装监听器
    pub fn build(self) -> ExtenderResult<ExtenderFramework> {
        let config = self.resolve_config()?;

        // 只有在明确配置了日志时才初始化，避免测试中重复初始化
        if let Some(logging) = &self.logging {
            init_logging(logging)?;
        }

        info!("开始构建 Extender 框架");
        let host = self.host.ok_or_else(|| ConfigError::ValidationError {
            message: "未设置宿主运行时".to_string(),
        })?;

        let visibility = config
            .visibility_filter
            .as_deref()
            .map(Filter::parse)
            .transpose()?;
        let mut clauses = vec![Filter::present(EXTENDER_OWNER)];
        clauses.extend(visibility.clone());
        let listener_filter = Filter::all(clauses);
        debug!("服务监听器过滤器: {}", listener_filter);

        let map = Arc::new(ExtenderServiceMap::new());
        let mut service_listener = ExtenderServiceListener::new(map.clone());
        if let Some(hook) = self.removal_hook {
            service_listener = service_listener.with_hook(hook);
        }

        let system = host.system_context();
        let listeners = vec![
            system.add_service_listener(Arc::new(service_listener), Some(listener_filter))?,
            system.add_module_listener(Arc::new(ExtenderModuleListener::new(map.clone())))?,
        ];

        let policy = RegistrationPolicy {
            default_ranking: config.default_ranking,
            visibility,
        };

        info!("Extender 框架构建完成");
        Ok(ExtenderFramework::new(
            host,
            map,
            config,
            policy,
            self.tracking_hook,
            listeners,
        ))
    }

    fn resolve_config(&self) -> ExtenderResult<ExtenderConfig> {
        let config = if let Some(path) = &self.config_path {
            ExtenderConfig::load(Some(path.as_path()))?
        } else if self.env_config {
            ExtenderConfig::load(None)?
        } else {
            self.config.clone().unwrap_or_default()
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for ExtenderFrameworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use extender_common::ExtenderError;
    use std::io::Write;

    #[test]
    fn test_invalid_visibility_filter_rejected() {
        let result = ExtenderFrameworkBuilder::new()
            .with_host(Arc::new(LocalHost::new()))
            .with_config(ExtenderConfig::default().with_visibility_filter("(broken"))
            .build();
        assert!(matches!(result, Err(ExtenderError::Filter { .. })));
    }

    #[test]
    fn test_config_file_is_loaded() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "default_ranking = 9\nfail_on_leak = false").unwrap();

        let framework = ExtenderFrameworkBuilder::new()
            .with_host(Arc::new(LocalHost::new()))
            .with_config_file(file.path())
            .build()
            .unwrap();
        assert_eq!(framework.config().default_ranking, 9);
        assert!(!framework.config().fail_on_leak);
    }

    #[test]
    fn test_missing_config_file_fails() {
        let result = ExtenderFrameworkBuilder::new()
            .with_host(Arc::new(LocalHost::new()))
            .with_config_file("/nonexistent/extender.toml")
            .build();
        assert!(matches!(result, Err(ExtenderError::Config { .. })));
    }
}
