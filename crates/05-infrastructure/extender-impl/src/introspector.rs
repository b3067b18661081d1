//! 反射网关
//!
//! 加载、实例化与按名称调用的唯一入口。所有失败统一转换为 [`ReflectionError`]，
//! 携带操作、目标（类名或 `类名::方法名`）与原因。

use extender_abstractions::{ClassDescriptor, ModuleContext, ParamType, ServiceObject, Visibility};
use extender_common::{ReflectionCause, ReflectionError, ReflectionResult, ReflectiveOperation};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// 反射网关，无状态
#[derive(Debug, Clone, Copy, Default)]
pub struct Introspector;

impl Introspector {
    /// 在模块的类空间中加载类
    pub fn load_class(
        context: &dyn ModuleContext,
        class_name: &str,
    ) -> ReflectionResult<Arc<ClassDescriptor>> {
        if !context.is_valid() {
            return Err(ReflectionError::new(
                ReflectiveOperation::LoadClass,
                class_name,
                ReflectionCause::Security {
                    message: format!("模块 {} 的执行上下文已失效", context.module()),
                },
            ));
        }

        match context.load_class(class_name) {
            Ok(Some(class)) => {
                debug!("加载类: {} (模块 {})", class_name, context.module());
                Ok(class)
            }
            Ok(None) => Err(ReflectionError::class_not_found(
                ReflectiveOperation::LoadClass,
                class_name,
            )),
            Err(e) => Err(ReflectionError::new(
                ReflectiveOperation::LoadClass,
                class_name,
                ReflectionCause::Security {
                    message: e.to_string(),
                },
            )),
        }
    }

    /// 通过构造函数创建对象
    pub fn create_object(
        class: &ClassDescriptor,
        ctor_arg: Option<&Value>,
    ) -> ReflectionResult<ServiceObject> {
        let constructor = class.constructor_fn().ok_or_else(|| {
            ReflectionError::new(
                ReflectiveOperation::CreateObject,
                class.name(),
                ReflectionCause::Instantiation {
                    source: format!("类 {} 没有可用的构造函数", class.name()).into(),
                },
            )
        })?;

        constructor(ctor_arg).map_err(|source| {
            ReflectionError::new(
                ReflectiveOperation::CreateObject,
                class.name(),
                ReflectionCause::Instantiation { source },
            )
        })
    }

    /// 按类描述调用方法
    ///
    /// 方法必须在类中声明为公开、参数签名一致且实参符合参数类型
    pub fn invoke(
        method: &str,
        class: &ClassDescriptor,
        param_types: &[ParamType],
        target: &ServiceObject,
        args: &[Value],
    ) -> ReflectionResult<Value> {
        let descriptor = class
            .find_method(method)
            .filter(|m| m.has_signature(param_types))
            .ok_or_else(|| {
                ReflectionError::no_such_method(ReflectiveOperation::Invoke, class.name(), method)
            })?;

        let target_name = format!("{}::{}", class.name(), method);
        if descriptor.visibility == Visibility::Private {
            return Err(ReflectionError::new(
                ReflectiveOperation::Invoke,
                target_name,
                ReflectionCause::IllegalAccess {
                    message: "方法不是公开的".to_string(),
                },
            ));
        }

        if args.len() != param_types.len() {
            return Err(ReflectionError::new(
                ReflectiveOperation::Invoke,
                target_name,
                ReflectionCause::IllegalArgument {
                    message: format!("需要 {} 个参数，实际 {} 个", param_types.len(), args.len()),
                },
            ));
        }
        if let Some(index) = param_types
            .iter()
            .zip(args)
            .position(|(param, arg)| !param.accepts(arg))
        {
            return Err(ReflectionError::new(
                ReflectiveOperation::Invoke,
                target_name,
                ReflectionCause::IllegalArgument {
                    message: format!("第 {} 个参数类型不符，期望 {:?}", index + 1, param_types[index]),
                },
            ));
        }

        target.call(method, args).map_err(|source| {
            ReflectionError::new(
                ReflectiveOperation::Invoke,
                target_name,
                ReflectionCause::InvocationTarget { source },
            )
        })
    }

    /// 检查类是否实现接口，返回接口名称
    pub fn get_interface(class: &ClassDescriptor, interface: &str) -> ReflectionResult<String> {
        class
            .interfaces()
            .iter()
            .find(|i| i.as_str() == interface)
            .cloned()
            .ok_or_else(|| {
                ReflectionError::new(
                    ReflectiveOperation::GetInterface,
                    class.name(),
                    ReflectionCause::NoSuchInterface {
                        interface: interface.to_string(),
                    },
                )
            })
    }

    /// 对没有类描述的对象按名称调用
    pub fn call(target: &ServiceObject, method: &str, args: &[Value]) -> ReflectionResult<Value> {
        target.call(method, args).map_err(|source| {
            ReflectionError::new(
                ReflectiveOperation::Call,
                format!("{}::{}", target.type_name(), method),
                ReflectionCause::InvocationTarget { source },
            )
        })
    }
}
