//! # Extender Common
//!
//! Extender 注册表各层共享的基础类型、错误定义、配置与日志工具。
//!
//! ## 核心内容
//!
//! - [`ModuleId`] / [`ServiceId`] - 宿主运行时分配的模块与注册标识
//! - [`Properties`] - 服务注册属性及保留键
//! - [`ServiceScope`] / [`ModuleState`] / [`UnregisterState`] - 生命周期状态
//! - [`ExtenderError`] - 统一的错误分类
//! - [`ExtenderConfig`] - 基于 `config` crate 的配置加载
//! - [`init_logging`] - 基于 `tracing-subscriber` 的日志初始化
//!
//! ## 设计原则
//!
//! - 注册表是显式注入的对象，不存在全局单例
//! - 同步调用，调用方线程直接执行
//! - 所有失败都通过 `Result` 传播

pub mod configuration;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod metadata;

pub use configuration::*;
pub use errors::*;
pub use lifecycle::*;
pub use logging::*;
pub use metadata::*;
