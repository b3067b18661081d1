//! 生命周期与作用域定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 服务作用域
///
/// 注册时确定，之后不再改变
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceScope {
    /// 单例模式 - 所有消费者共享同一实例，生命周期等同于注册
    Singleton,
    /// 模块作用域 - 每个消费模块一个实例，直到该模块释放或停止
    #[serde(rename = "module")]
    ModuleScoped,
    /// 原型模式 - 模块首次获取后，每次获取都创建新实例
    Prototype,
}

impl ServiceScope {
    /// 属性中使用的名称
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Singleton => "singleton",
            Self::ModuleScoped => "module",
            Self::Prototype => "prototype",
        }
    }
}

impl Default for ServiceScope {
    fn default() -> Self {
        Self::Singleton
    }
}

impl fmt::Display for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "singleton" => Ok(Self::Singleton),
            "module" => Ok(Self::ModuleScoped),
            "prototype" => Ok(Self::Prototype),
            other => Err(format!("未知的服务作用域: {}", other)),
        }
    }
}

/// 模块生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    /// 已安装
    Installed,
    /// 启动中
    Starting,
    /// 运行中
    Active,
    /// 停止中
    Stopping,
    /// 已停止（可再次启动）
    Resolved,
    /// 已卸载
    Uninstalled,
}

impl ModuleState {
    /// 此状态下模块的执行上下文是否有效
    pub fn has_valid_context(self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Stopping)
    }

    /// 是否可以启动
    pub fn can_start(self) -> bool {
        matches!(self, Self::Installed | Self::Resolved)
    }

    /// 是否可以停止
    pub fn can_stop(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl Default for ModuleState {
    fn default() -> Self {
        Self::Installed
    }
}

/// 注册的注销状态
///
/// `Live -> Unregistering -> Unregistered`，只能前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnregisterState {
    /// 注册有效
    Live = 0,
    /// 注销进行中
    Unregistering = 1,
    /// 已注销
    Unregistered = 2,
}

impl UnregisterState {
    /// 从原子存储的数值还原
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::Unregistering,
            _ => Self::Unregistered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trips_through_property_name() {
        for scope in [
            ServiceScope::Singleton,
            ServiceScope::ModuleScoped,
            ServiceScope::Prototype,
        ] {
            assert_eq!(scope.as_str().parse::<ServiceScope>(), Ok(scope));
        }
        assert!("session".parse::<ServiceScope>().is_err());
    }

    #[test]
    fn test_module_state_context_validity() {
        assert!(ModuleState::Active.has_valid_context());
        assert!(ModuleState::Stopping.has_valid_context());
        assert!(!ModuleState::Resolved.has_valid_context());
        assert!(!ModuleState::Installed.has_valid_context());
        assert!(ModuleState::Resolved.can_start());
        assert!(!ModuleState::Uninstalled.can_start());
    }

    #[test]
    fn test_unregister_state_from_u8() {
        assert_eq!(UnregisterState::from_u8(0), UnregisterState::Live);
        assert_eq!(UnregisterState::from_u8(1), UnregisterState::Unregistering);
        assert_eq!(UnregisterState::from_u8(2), UnregisterState::Unregistered);
    }
}
