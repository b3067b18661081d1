//! # Extender Abstractions
//!
//! 宿主模块运行时与 Extender 注册表之间的抽象层。
//!
//! ## 核心接口
//!
//! - [`HostRuntime`] / [`ModuleContext`] - 宿主运行时与模块执行上下文
//! - [`ServiceRegistration`] / [`ServiceReference`] - 宿主级服务注册
//! - [`ServiceFactory`] - 按消费模块创建服务实例的工厂
//! - [`ModuleListener`] / [`ServiceListener`] - 生命周期事件订阅
//! - [`Invokable`] / [`ClassDescriptor`] - 按名称调用的能力接口
//! - [`Filter`] - LDAP 风格的属性过滤表达式
//! - [`TrackingHook`] / [`TrackerCustomizer`] - 服务跟踪回调

pub mod events;
pub mod filter;
pub mod host;
pub mod invokable;
pub mod tracking;

pub use events::*;
pub use filter::*;
pub use host::*;
pub use invokable::*;
pub use tracking::*;
