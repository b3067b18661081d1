//! 宿主生命周期事件定义

use crate::host::ServiceReference;
use extender_common::ModuleId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 监听器标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// 模块事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleEventKind {
    /// 模块安装
    Installed,
    /// 模块启动中
    Starting,
    /// 模块已启动
    Started,
    /// 模块停止中（执行上下文仍然有效）
    Stopping,
    /// 模块已停止
    Stopped,
    /// 模块卸载
    Uninstalled,
}

/// 模块生命周期事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEvent {
    /// 事件类型
    pub kind: ModuleEventKind,
    /// 模块标识
    pub module: ModuleId,
    /// 模块名称
    pub module_name: String,
    /// 事件时间
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ModuleEvent {
    /// 创建模块事件
    pub fn new(kind: ModuleEventKind, module: ModuleId, module_name: impl Into<String>) -> Self {
        Self {
            kind,
            module,
            module_name: module_name.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// 是否为停止相关事件
    pub fn is_stop(&self) -> bool {
        matches!(self.kind, ModuleEventKind::Stopping | ModuleEventKind::Stopped)
    }
}

/// 服务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceEventKind {
    /// 服务已注册
    Registered,
    /// 服务属性变更且仍匹配监听器过滤器
    Modified,
    /// 服务属性变更后不再匹配监听器过滤器
    ModifiedEndMatch,
    /// 服务正在注销
    Unregistering,
}

/// 服务生命周期事件
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// 事件类型
    pub kind: ServiceEventKind,
    /// 服务引用（事件发生时的属性快照）
    pub reference: ServiceReference,
    /// 事件时间
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ServiceEvent {
    /// 创建服务事件
    pub fn new(kind: ServiceEventKind, reference: ServiceReference) -> Self {
        Self {
            kind,
            reference,
            timestamp: chrono::Utc::now(),
        }
    }

    /// 服务是否对该监听器不再可见
    pub fn is_removal(&self) -> bool {
        matches!(
            self.kind,
            ServiceEventKind::Unregistering | ServiceEventKind::ModifiedEndMatch
        )
    }
}

/// 模块事件监听器 trait
///
/// 宿主在触发事件的线程上同步调用
pub trait ModuleListener: Send + Sync {
    /// 处理模块事件
    fn module_changed(&self, event: &ModuleEvent);

    /// 获取监听器名称
    fn name(&self) -> &str;
}

/// 服务事件监听器 trait
///
/// 宿主在触发事件的线程上同步调用
pub trait ServiceListener: Send + Sync {
    /// 处理服务事件
    fn service_changed(&self, event: &ServiceEvent);

    /// 获取监听器名称
    fn name(&self) -> &str;
}
