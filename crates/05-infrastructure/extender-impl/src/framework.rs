//! Extender 框架主入口

use crate::builder::ExtenderFrameworkBuilder;
use crate::extender::{Extender, ExtenderRegistration, RegistrationPolicy};
use crate::extension::Extension;
use crate::service_map::ExtenderServiceMap;
use extender_abstractions::{HostRuntime, ListenerId, TrackingHook};
use extender_common::{ExtenderConfig, ExtenderError, ExtenderResult, ModuleId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Extender 框架
///
/// 持有一个注册表，向宿主安装服务监听器与模块监听器，提供注册与消费入口，
/// 关闭时执行泄漏检查
pub struct ExtenderFramework {
    /// 宿主运行时
    host: Arc<dyn HostRuntime>,
    /// 注册表
    map: Arc<ExtenderServiceMap>,
    /// 框架配置
    config: ExtenderConfig,
    /// 注册策略
    policy: RegistrationPolicy,
    /// 跟踪生命周期钩子
    tracking_hook: Option<Arc<dyn TrackingHook>>,
    /// 安装在系统上下文中的监听器
    listeners: Mutex<Vec<ListenerId>>,
    /// 运行状态
    status: RwLock<FrameworkStatus>,
}

impl std::fmt::Debug for ExtenderFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtenderFramework")
            .field("map", &self.map)
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

impl ExtenderFramework {
    /// 创建框架构建器
    pub fn builder() -> ExtenderFrameworkBuilder {
        ExtenderFrameworkBuilder::new()
    }

    /// 内部构造函数
    pub(crate) fn new(
        host: Arc<dyn HostRuntime>,
        map: Arc<ExtenderServiceMap>,
        config: ExtenderConfig,
        policy: RegistrationPolicy,
        tracking_hook: Option<Arc<dyn TrackingHook>>,
        listeners: Vec<ListenerId>,
    ) -> Self {
        Self {
            host,
            map,
            config,
            policy,
            tracking_hook,
            listeners: Mutex::new(listeners),
            status: RwLock::new(FrameworkStatus::Running),
        }
    }

    /// 注册服务
    ///
    /// 框架开始关闭后拒绝新的注册；注册期间关闭会等待注册完成
    pub fn register(&self, request: ExtenderRegistration) -> ExtenderResult<Arc<Extender>> {
        let status = self.status.read_recursive();
        if *status != FrameworkStatus::Running {
            let contract = request.contract_names().first().cloned().unwrap_or_default();
            warn!("框架处于 {:?} 状态，拒绝注册 {}", *status, contract);
            return Err(ExtenderError::rejected(contract, "Extender 框架已关闭"));
        }
        Extender::register(self.host.clone(), &self.map, request, &self.policy)
    }

    /// 为消费模块创建契约的 Extension
    pub fn extension(&self, contract: impl Into<String>, consumer: ModuleId) -> Extension {
        let extension = Extension::new(contract, consumer, self.host.clone(), self.map.clone());
        match &self.tracking_hook {
            Some(hook) => extension.with_hook(hook.clone()),
            None => extension,
        }
    }

    /// 注册表
    pub fn map(&self) -> &Arc<ExtenderServiceMap> {
        &self.map
    }

    /// 宿主运行时
    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    /// 框架配置
    pub fn config(&self) -> &ExtenderConfig {
        &self.config
    }

    /// 运行状态
    pub fn status(&self) -> FrameworkStatus {
        *self.status.read_recursive()
    }

    /// 关闭框架
    ///
    /// 移除监听器后检查注册表；仍有未注销的注册时按 `fail_on_leak` 返回错误或只记录日志
    pub fn shutdown(&self) -> ExtenderResult<()> {
        {
            let mut status = self.status.write();
            if *status == FrameworkStatus::ShutDown {
                return Ok(());
            }
            *status = FrameworkStatus::ShuttingDown;
        }
        info!("关闭 Extender 框架");

        let system = self.host.system_context();
        for id in self.listeners.lock().drain(..) {
            if let Err(e) = system.remove_listener(id) {
                warn!("移除监听器 {} 失败: {}", id, e);
            }
        }

        let result = self.map.validate_unregister();
        *self.status.write() = FrameworkStatus::ShutDown;

        match result {
            Ok(()) => {
                info!("Extender 框架已关闭");
                Ok(())
            }
            Err(e @ ExtenderError::LeakedRegistrations { .. }) if self.config.fail_on_leak => {
                error!("关闭时发现未注销的注册: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("关闭时发现未注销的注册（已忽略）: {}", e);
                Ok(())
            }
        }
    }
}

/// 框架运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameworkStatus {
    /// 运行中
    Running,
    /// 关闭中
    ShuttingDown,
    /// 已关闭
    ShutDown,
}
