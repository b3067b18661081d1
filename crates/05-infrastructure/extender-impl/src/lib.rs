//! # Extender Impl
//!
//! 生命周期绑定的服务注册表实现，以及用于嵌入和测试的进程内宿主运行时。
//!
//! ## 组成
//!
//! - [`Extender`] - 一次服务注册，按作用域策略提供服务
//! - [`ExtenderServiceMap`] - 按注册标识、契约名称与拥有者模块索引的注册表
//! - [`ExtenderServiceListener`] / [`ExtenderModuleListener`] - 响应宿主事件的清理
//! - [`Extension`] - 消费者侧句柄，可开启服务跟踪
//! - [`Introspector`] - 按名称加载、实例化与调用
//! - [`LocalHost`] - 进程内宿主运行时
//! - [`ExtenderFramework`] - 组装以上组件的入口
//!
//! ## 示例
//!
//! ```rust,ignore
//! use extender_impl::{ExtenderFramework, ExtenderRegistration, LocalHost, ModuleDefinition};
//! use std::sync::Arc;
//!
//! let host = LocalHost::new();
//! let framework = ExtenderFramework::builder()
//!     .with_host(Arc::new(host.clone()))
//!     .build()?;
//!
//! let m1 = host.install_module(ModuleDefinition::new("m1"));
//! host.start_module(m1)?;
//! framework.register(
//!     ExtenderRegistration::new().module(m1).contract("Greeter").object(greeter),
//! )?;
//!
//! let greeting = framework.extension("Greeter", m2).get_service()?.call("greet", &[])?;
//! ```

pub mod builder;
pub mod extender;
pub mod extension;
pub mod framework;
pub mod host;
pub mod introspector;
pub mod listeners;
pub mod scope;
pub mod service_map;
pub mod tracker;

pub use builder::ExtenderFrameworkBuilder;
pub use extender::{Extender, ExtenderRegistration, RegistrationPolicy, ServiceSource};
pub use extension::Extension;
pub use framework::{ExtenderFramework, FrameworkStatus};
pub use host::{
    LocalHost, LocalModuleContext, LocalServiceRegistration, ModuleDefinition, SYSTEM_MODULE,
};
pub use introspector::Introspector;
pub use listeners::{ExtenderModuleListener, ExtenderServiceListener, RemovalHook};
pub use scope::{strategy_for, ModuleScoped, PrototypeEmulated, ServiceScopeStrategy, Singleton};
pub use service_map::ExtenderServiceMap;
pub use tracker::ServiceTracker;

// 重新导出抽象层与公共类型
pub use extender_abstractions::*;
pub use extender_common::*;
