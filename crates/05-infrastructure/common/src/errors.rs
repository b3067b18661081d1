//! 错误类型定义

use crate::metadata::{ModuleId, ServiceId};
use std::fmt;
use thiserror::Error;

/// 注册参数缺失错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("缺少拥有者模块")]
    MissingOwner,

    #[error("缺少注册者模块")]
    MissingRegistrar,

    #[error("缺少契约名称")]
    MissingContract,

    #[error("缺少服务对象: {contract}")]
    MissingService { contract: String },
}

/// 反射操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReflectiveOperation {
    /// 加载类
    LoadClass,
    /// 创建对象
    CreateObject,
    /// 调用已声明的方法
    Invoke,
    /// 查询接口
    GetInterface,
    /// 直接调用对象方法
    Call,
}

impl fmt::Display for ReflectiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoadClass => "load_class",
            Self::CreateObject => "create_object",
            Self::Invoke => "invoke",
            Self::GetInterface => "get_interface",
            Self::Call => "call",
        };
        f.write_str(name)
    }
}

/// 反射失败的原始原因
#[derive(Error, Debug)]
pub enum ReflectionCause {
    #[error("类不存在")]
    ClassNotFound,

    #[error("方法不存在: {method}")]
    NoSuchMethod { method: String },

    #[error("接口未实现: {interface}")]
    NoSuchInterface { interface: String },

    #[error("非法访问: {message}")]
    IllegalAccess { message: String },

    #[error("参数不匹配: {message}")]
    IllegalArgument { message: String },

    #[error("实例化失败: {source}")]
    Instantiation {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("调用目标返回错误: {source}")]
    InvocationTarget {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("安全检查失败: {message}")]
    Security { message: String },
}

/// 反射错误
///
/// 内省器的所有失败都归一为此类型，携带失败的操作、类或方法名以及原始原因
#[derive(Error, Debug)]
#[error("反射操作 {operation} 失败 ({target}): {cause}")]
pub struct ReflectionError {
    /// 失败的操作
    pub operation: ReflectiveOperation,
    /// 类名或 `类名::方法名`
    pub target: String,
    /// 原始原因
    #[source]
    pub cause: ReflectionCause,
}

impl ReflectionError {
    /// 创建反射错误
    pub fn new(
        operation: ReflectiveOperation,
        target: impl Into<String>,
        cause: ReflectionCause,
    ) -> Self {
        Self {
            operation,
            target: target.into(),
            cause,
        }
    }

    /// 类不存在
    pub fn class_not_found(operation: ReflectiveOperation, class_name: impl Into<String>) -> Self {
        Self::new(operation, class_name, ReflectionCause::ClassNotFound)
    }

    /// 方法不存在
    pub fn no_such_method(
        operation: ReflectiveOperation,
        class_name: &str,
        method: impl Into<String>,
    ) -> Self {
        let method = method.into();
        Self::new(
            operation,
            format!("{}::{}", class_name, method),
            ReflectionCause::NoSuchMethod { method },
        )
    }
}

/// 过滤器错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("过滤器语法错误: 位置 {position}, {message}")]
    Syntax { position: usize, message: String },

    #[error("过滤器为空")]
    Empty,
}

impl FilterError {
    /// 创建语法错误
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }
}

/// 宿主运行时错误
#[derive(Error, Debug)]
pub enum HostError {
    #[error("模块不存在: {module}")]
    UnknownModule { module: ModuleId },

    #[error("模块执行上下文已失效: {module}")]
    InvalidContext { module: ModuleId },

    #[error("模块 {module} 处于 {state} 状态，无法执行 {operation}")]
    IllegalModuleState {
        module: ModuleId,
        state: String,
        operation: String,
    },

    #[error("服务注册已注销: {service_id}")]
    ServiceUnregistered { service_id: ServiceId },

    #[error("服务对象未实现契约: {contract}")]
    NotCompatible { contract: String },

    #[error("服务工厂失败: {service_id}, 原因: {message}")]
    FactoryFailed {
        service_id: ServiceId,
        message: String,
    },

    #[error("监听器过滤器无效: {source}")]
    InvalidFilter {
        #[from]
        source: FilterError,
    },
}

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置加载失败: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("配置验证失败: {message}")]
    ValidationError { message: String },
}

/// Extender 错误类型
#[derive(Error, Debug)]
pub enum ExtenderError {
    #[error("注册参数错误: {source}")]
    Configuration {
        #[from]
        source: ConfigurationError,
    },

    #[error("注册被拒绝: {contract}, 原因: {message}")]
    RegistrationRejected { contract: String, message: String },

    #[error("模块执行上下文无效: {module}")]
    InvalidContext { module: ModuleId },

    #[error("服务实现与契约不兼容: {contract}, 实现: {implementation}")]
    IncompatibleType {
        contract: String,
        implementation: String,
    },

    #[error("注册已注销: {service_id}")]
    AlreadyUnregistered { service_id: ServiceId },

    #[error("契约当前没有可用服务: {contract}")]
    ServiceUnavailable { contract: String },

    #[error("关闭时发现 {count} 个未注销的注册: {service_ids:?}")]
    LeakedRegistrations {
        count: usize,
        service_ids: Vec<ServiceId>,
    },

    #[error("反射错误: {source}")]
    Reflection {
        #[from]
        source: ReflectionError,
    },

    #[error("过滤器错误: {source}")]
    Filter {
        #[from]
        source: FilterError,
    },

    #[error("宿主运行时错误: {source}")]
    Host { source: HostError },

    #[error("配置错误: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },
}

impl From<HostError> for ExtenderError {
    fn from(error: HostError) -> Self {
        match error {
            HostError::InvalidContext { module } => Self::InvalidContext { module },
            HostError::ServiceUnregistered { service_id } => {
                Self::AlreadyUnregistered { service_id }
            }
            HostError::InvalidFilter { source } => Self::Filter { source },
            other => Self::Host { source: other },
        }
    }
}

impl ExtenderError {
    /// 创建注册拒绝错误
    pub fn rejected(contract: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RegistrationRejected {
            contract: contract.into(),
            message: message.into(),
        }
    }

    /// 是否表示“暂时不可用”，调用方可以稍后重试
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::InvalidContext { .. }
                | Self::ServiceUnavailable { .. }
                | Self::AlreadyUnregistered { .. }
        )
    }
}

/// 结果类型别名
pub type ExtenderResult<T> = Result<T, ExtenderError>;
pub type HostResult<T> = Result<T, HostError>;
pub type ReflectionResult<T> = Result<T, ReflectionError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
