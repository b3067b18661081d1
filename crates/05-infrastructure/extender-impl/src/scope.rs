//! 服务作用域策略
//!
//! 决定 `get_service` 返回共享实例、按消费模块绑定的实例，还是每次新建的实例。

use dashmap::{DashMap, DashSet};
use extender_abstractions::{ModuleContext, ServiceFactory, ServiceObject, ServiceReference};
use extender_common::{ExtenderError, ExtenderResult, HostError, ModuleId, ServiceId, ServiceScope};
use std::sync::Arc;
use tracing::{debug, warn};

/// 作用域策略 trait
pub trait ServiceScopeStrategy: Send + Sync {
    /// 策略对应的作用域
    fn scope(&self) -> ServiceScope;

    /// 为消费模块获取服务；注册已消失时返回 `None`
    fn get_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<Option<ServiceObject>>;

    /// 释放消费模块借用的服务，返回是否确有释放
    fn unget_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<bool>;

    /// 注册结束时释放策略自行持有的实例
    fn close(&self, _registration: ServiceId) {}

    /// 消费模块停止时丢弃它的记录并释放为它持有的实例
    fn release_consumer(&self, _consumer: ModuleId, _registration: ServiceId) {}
}

/// 根据作用域创建策略
pub fn strategy_for(
    scope: ServiceScope,
    factory: Option<Arc<dyn ServiceFactory>>,
) -> Box<dyn ServiceScopeStrategy> {
    match (scope, factory) {
        (ServiceScope::Prototype, Some(factory)) => Box::new(PrototypeEmulated::new(factory)),
        (ServiceScope::ModuleScoped, _) => Box::new(ModuleScoped),
        _ => Box::new(Singleton),
    }
}

fn borrow_from_host(
    consumer: &dyn ModuleContext,
    reference: &ServiceReference,
) -> ExtenderResult<Option<ServiceObject>> {
    consumer.get_service(reference).map_err(|e| match e {
        HostError::NotCompatible { contract } => ExtenderError::IncompatibleType {
            contract,
            implementation: format!("{} 的工厂实例", reference.id()),
        },
        other => other.into(),
    })
}

/// 单例：所有消费者共享同一个对象，由宿主计数
#[derive(Debug, Clone, Copy, Default)]
pub struct Singleton;

impl ServiceScopeStrategy for Singleton {
    fn scope(&self) -> ServiceScope {
        ServiceScope::Singleton
    }

    fn get_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<Option<ServiceObject>> {
        borrow_from_host(consumer, reference)
    }

    fn unget_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<bool> {
        Ok(consumer.unget_service(reference)?)
    }
}

/// 模块作用域：宿主为每个消费模块缓存工厂创建的实例
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleScoped;

impl ServiceScopeStrategy for ModuleScoped {
    fn scope(&self) -> ServiceScope {
        ServiceScope::ModuleScoped
    }

    fn get_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<Option<ServiceObject>> {
        borrow_from_host(consumer, reference)
    }

    fn unget_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<bool> {
        Ok(consumer.unget_service(reference)?)
    }
}

/// 原型作用域的模拟
///
/// 宿主只提供按模块缓存的实例，因此记录已经获取过服务的消费模块：
/// 模块第一次获取得到宿主分配的实例，此后每次获取都由工厂直接创建新实例。
/// 已经通过其他途径（例如服务跟踪）持有宿主实例的模块视为已获取过。
/// 模块停止后记录被清除，重新启动的模块再次从宿主实例开始。
pub struct PrototypeEmulated {
    factory: Arc<dyn ServiceFactory>,
    consumers: DashSet<ModuleId>,
    minted: DashMap<ModuleId, Vec<ServiceObject>>,
}

impl PrototypeEmulated {
    /// 创建原型策略
    pub fn new(factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            factory,
            consumers: DashSet::new(),
            minted: DashMap::new(),
        }
    }

    /// 模块是否已获取过服务
    pub fn has_consumer(&self, module: ModuleId) -> bool {
        self.consumers.contains(&module)
    }

    /// 模块持有的直接创建实例数量
    pub fn minted_count(&self, module: ModuleId) -> usize {
        self.minted.get(&module).map_or(0, |instances| instances.len())
    }
}

impl std::fmt::Debug for PrototypeEmulated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrototypeEmulated")
            .field("consumers", &self.consumers.len())
            .field("minted", &self.minted.len())
            .finish()
    }
}

impl ServiceScopeStrategy for PrototypeEmulated {
    fn scope(&self) -> ServiceScope {
        ServiceScope::Prototype
    }

    fn get_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<Option<ServiceObject>> {
        let module = consumer.module();
        let holds_host_instance = consumer.use_count(reference)? > 0;
        if self.consumers.insert(module) && !holds_host_instance {
            debug!("原型服务 {} 首次被 {} 获取，使用宿主实例", reference.id(), module);
            return borrow_from_host(consumer, reference);
        }

        let instance = self
            .factory
            .get_service(module, reference.id())
            .map_err(|e| HostError::FactoryFailed {
                service_id: reference.id(),
                message: e.to_string(),
            })?;

        if let Some(contract) = reference
            .contracts()
            .into_iter()
            .find(|c| !instance.implements(c))
        {
            self.factory.unget_service(module, reference.id(), &instance);
            return Err(ExtenderError::IncompatibleType {
                contract,
                implementation: instance.type_name().to_string(),
            });
        }

        self.minted.entry(module).or_default().push(instance.clone());
        debug!("原型服务 {} 为 {} 创建新实例", reference.id(), module);
        Ok(Some(instance))
    }

    fn unget_service(
        &self,
        consumer: &dyn ModuleContext,
        reference: &ServiceReference,
    ) -> ExtenderResult<bool> {
        let module = consumer.module();
        let minted = self
            .minted
            .get_mut(&module)
            .and_then(|mut instances| instances.pop());
        if let Some(instance) = minted {
            self.factory.unget_service(module, reference.id(), &instance);
            return Ok(true);
        }
        Ok(consumer.unget_service(reference)?)
    }

    fn release_consumer(&self, consumer: ModuleId, registration: ServiceId) {
        self.consumers.remove(&consumer);
        if let Some((_, instances)) = self.minted.remove(&consumer) {
            debug!(
                "消费模块 {} 停止，释放原型服务 {} 的 {} 个实例",
                consumer,
                registration,
                instances.len()
            );
            for instance in instances {
                self.factory.unget_service(consumer, registration, &instance);
            }
        }
    }

    fn close(&self, registration: ServiceId) {
        let modules: Vec<ModuleId> = self.minted.iter().map(|entry| *entry.key()).collect();
        for module in modules {
            if let Some((_, instances)) = self.minted.remove(&module) {
                if !instances.is_empty() {
                    warn!("原型服务关闭时 {} 仍持有 {} 个实例", module, instances.len());
                }
                for instance in instances {
                    self.factory.unget_service(module, registration, &instance);
                }
            }
        }
    }
}
