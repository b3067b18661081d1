//! Extender：一次服务注册的所有者
//!
//! 持有契约名称、拥有者模块、注册者模块、服务来源与作用域策略。
//! 注销状态只能前进：`Live -> Unregistering -> Unregistered`，通过原子比较交换完成，
//! 显式注销与模块停止清扫并发时恰好一方成功。

use crate::introspector::Introspector;
use crate::scope::{strategy_for, ServiceScopeStrategy};
use crate::service_map::ExtenderServiceMap;
use extender_abstractions::{
    ClassDescriptor, Filter, HostRuntime, HostService, ServiceFactory, ServiceObject,
    ServiceReference, ServiceRegistration,
};
use extender_common::{
    dedup_contracts, is_reserved_key, ranking_of, ConfigurationError, ExtenderError,
    ExtenderResult, HostError, ModuleId, ModuleState, Properties, ServiceId, ServiceScope,
    UnregisterState, EXTENDER_OWNER, EXTENDER_REGISTRAR, EXTENDER_SCOPE, SERVICE_RANKING,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 服务来源
#[derive(Clone)]
pub enum ServiceSource {
    /// 共享对象，单例作用域
    Object(ServiceObject),
    /// 工厂，模块作用域
    Factory(Arc<dyn ServiceFactory>),
    /// 工厂，原型作用域
    Prototype(Arc<dyn ServiceFactory>),
    /// 拥有者模块类空间中的类名，实例化后按单例发布
    ClassName {
        class_name: String,
        ctor_arg: Option<Value>,
    },
}

impl ServiceSource {
    /// 来源决定的作用域
    pub fn scope(&self) -> ServiceScope {
        match self {
            Self::Object(_) | Self::ClassName { .. } => ServiceScope::Singleton,
            Self::Factory(_) => ServiceScope::ModuleScoped,
            Self::Prototype(_) => ServiceScope::Prototype,
        }
    }
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => write!(f, "Object({})", object.type_name()),
            Self::Factory(_) => f.write_str("Factory(<function>)"),
            Self::Prototype(_) => f.write_str("Prototype(<function>)"),
            Self::ClassName { class_name, .. } => write!(f, "ClassName({})", class_name),
        }
    }
}

/// 注册请求构建器
///
/// 必填项缺失时由 [`Extender::register`] 返回对应的 [`ConfigurationError`]
#[derive(Debug, Clone, Default)]
pub struct ExtenderRegistration {
    owner: Option<ModuleId>,
    registrar: Option<ModuleId>,
    contracts: Vec<String>,
    source: Option<ServiceSource>,
    properties: Properties,
}

impl ExtenderRegistration {
    /// 创建空的注册请求
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置拥有者模块
    pub fn owner(mut self, owner: ModuleId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// 设置注册者模块
    pub fn registrar(mut self, registrar: ModuleId) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// 同时设置拥有者与注册者
    pub fn module(self, module: ModuleId) -> Self {
        self.owner(module).registrar(module)
    }

    /// 添加契约名称
    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contracts.push(contract.into());
        self
    }

    /// 添加多个契约名称
    pub fn contracts<I, S>(mut self, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contracts.extend(contracts.into_iter().map(Into::into));
        self
    }

    /// 以共享对象发布
    pub fn object(mut self, object: ServiceObject) -> Self {
        self.source = Some(ServiceSource::Object(object));
        self
    }

    /// 以模块作用域工厂发布
    pub fn factory(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.source = Some(ServiceSource::Factory(factory));
        self
    }

    /// 以原型作用域工厂发布
    pub fn prototype(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.source = Some(ServiceSource::Prototype(factory));
        self
    }

    /// 以拥有者模块中的类发布
    pub fn class_name(mut self, class_name: impl Into<String>, ctor_arg: Option<Value>) -> Self {
        self.source = Some(ServiceSource::ClassName {
            class_name: class_name.into(),
            ctor_arg,
        });
        self
    }

    /// 设置服务来源
    pub fn source(mut self, source: ServiceSource) -> Self {
        self.source = Some(source);
        self
    }

    /// 设置属性
    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// 合并属性
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    /// 已添加的契约名称
    pub fn contract_names(&self) -> &[String] {
        &self.contracts
    }
}

/// 注册策略
#[derive(Debug, Clone, Default)]
pub struct RegistrationPolicy {
    /// 未显式指定时的排名
    pub default_ranking: i64,
    /// 注册必须满足的可见性过滤器
    pub visibility: Option<Filter>,
}

/// 一次服务注册
pub struct Extender {
    id: ServiceId,
    owner: ModuleId,
    registrar: ModuleId,
    contracts: Vec<String>,
    primary: String,
    scope: ServiceScope,
    class: Option<Arc<ClassDescriptor>>,
    host: Arc<dyn HostRuntime>,
    registration: Arc<dyn ServiceRegistration>,
    strategy: Box<dyn ServiceScopeStrategy>,
    state: AtomicU8,
    properties: RwLock<Properties>,
    registered_at: DateTime<Utc>,
}

impl fmt::Debug for Extender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extender")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("registrar", &self.registrar)
            .field("contracts", &self.contracts)
            .field("scope", &self.scope)
            .field("state", &self.state())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

impl Extender {
    /// 校验请求、向宿主发布并放入注册表
    pub fn register(
        host: Arc<dyn HostRuntime>,
        map: &ExtenderServiceMap,
        request: ExtenderRegistration,
        policy: &RegistrationPolicy,
    ) -> ExtenderResult<Arc<Self>> {
        let owner = request.owner.ok_or(ConfigurationError::MissingOwner)?;
        let registrar = request.registrar.ok_or(ConfigurationError::MissingRegistrar)?;
        let contracts = dedup_contracts(request.contracts);
        let primary = contracts
            .first()
            .cloned()
            .ok_or(ConfigurationError::MissingContract)?;
        let source = request
            .source
            .ok_or_else(|| ConfigurationError::MissingService {
                contract: primary.clone(),
            })?;

        let owner_context = host.context(owner)?;
        let registrar_context = host.context(registrar)?;
        let scope = source.scope();

        let (host_service, factory, class) = match source {
            ServiceSource::Object(object) => {
                check_compatible(&contracts, &object, object.type_name())?;
                (HostService::Object(object), None, None)
            }
            ServiceSource::Factory(factory) => (HostService::Factory(factory), None, None),
            ServiceSource::Prototype(factory) => {
                (HostService::Factory(factory.clone()), Some(factory), None)
            }
            ServiceSource::ClassName {
                class_name,
                ctor_arg,
            } => {
                let class = Introspector::load_class(owner_context.as_ref(), &class_name)?;
                let object = Introspector::create_object(&class, ctor_arg.as_ref())?;
                check_compatible(&contracts, &object, class.name())?;
                (HostService::Object(object), None, Some(class))
            }
        };

        let mut properties: Properties = request
            .properties
            .into_iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .collect();
        properties
            .entry(SERVICE_RANKING.to_string())
            .or_insert_with(|| json!(policy.default_ranking));
        apply_reserved(&mut properties, scope, owner, registrar);

        let registration = registrar_context
            .register_service(&contracts, host_service, properties)
            .map_err(|e| match e {
                HostError::NotCompatible { contract } => ExtenderError::IncompatibleType {
                    contract,
                    implementation: scope.to_string(),
                },
                HostError::InvalidContext { module } => ExtenderError::InvalidContext { module },
                other => ExtenderError::rejected(primary.clone(), other.to_string()),
            })?;

        let reference = match registration.reference() {
            Ok(reference) => reference,
            Err(_) => {
                return Err(ExtenderError::rejected(primary, "宿主注册在放入注册表前已消失"));
            }
        };

        if let Some(visibility) = &policy.visibility {
            if !visibility.matches(reference.properties()) {
                if let Err(e) = registration.unregister() {
                    warn!("撤回不可见的注册 {} 失败: {}", registration.id(), e);
                }
                return Err(ExtenderError::rejected(
                    primary,
                    format!("注册属性不满足可见性过滤器 {}", visibility),
                ));
            }
        }

        let extender = Arc::new(Self {
            id: registration.id(),
            owner,
            registrar,
            contracts,
            primary: primary.clone(),
            scope,
            class,
            host,
            strategy: strategy_for(scope, factory),
            registration,
            state: AtomicU8::new(UnregisterState::Live as u8),
            properties: RwLock::new(reference.properties().clone()),
            registered_at: Utc::now(),
        });

        map.put(extender.id, extender.clone());

        // 拥有者在放入注册表之前开始停止时，清扫已经错过这条注册
        let owner_running = matches!(
            extender.host.module_state(owner),
            Ok(ModuleState::Starting | ModuleState::Active)
        );
        if !owner_running || !owner_context.is_valid() || !extender.registration.is_registered() {
            map.remove_extender(&extender);
            if extender.unregister().is_ok() {
                debug!("回滚注册 {}", extender.id);
            }
            return Err(ExtenderError::rejected(
                primary,
                "拥有者模块在注册完成前停止",
            ));
        }

        info!(
            "注册服务: {} {:?} (作用域 {}, 拥有者 {}, 注册者 {})",
            extender.id, extender.contracts, scope, owner, registrar
        );
        Ok(extender)
    }

    /// 注册标识
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// 拥有者模块
    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    /// 注册者模块
    pub fn registrar(&self) -> ModuleId {
        self.registrar
    }

    /// 契约名称
    pub fn contracts(&self) -> &[String] {
        &self.contracts
    }

    /// 主契约名称
    pub fn primary_contract(&self) -> &str {
        &self.primary
    }

    /// 是否以指定契约发布
    pub fn has_contract(&self, contract: &str) -> bool {
        self.contracts.iter().any(|c| c == contract)
    }

    /// 作用域
    pub fn scope(&self) -> ServiceScope {
        self.scope
    }

    /// 服务排名
    pub fn ranking(&self) -> i64 {
        ranking_of(&self.properties.read())
    }

    /// 属性快照
    pub fn properties(&self) -> Properties {
        self.properties.read().clone()
    }

    /// 由类名创建时的类描述
    pub fn class(&self) -> Option<&Arc<ClassDescriptor>> {
        self.class.as_ref()
    }

    /// 注册完成的时间
    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// 注销状态
    pub fn state(&self) -> UnregisterState {
        UnregisterState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 注册是否有效；宿主侧被外部注销时同样返回 `false`
    pub fn is_registered(&self) -> bool {
        self.state() == UnregisterState::Live && self.registration.is_registered()
    }

    /// 代表拥有者模块获取服务
    pub fn get_service(&self) -> ExtenderResult<ServiceObject> {
        self.get_service_for(self.owner)
    }

    /// 代表消费模块获取服务
    pub fn get_service_for(&self, consumer: ModuleId) -> ExtenderResult<ServiceObject> {
        if self.state() != UnregisterState::Live {
            return Err(ExtenderError::AlreadyUnregistered { service_id: self.id });
        }
        let context = self.host.context(consumer)?;
        let reference = self.registration.reference()?;
        self.strategy
            .get_service(context.as_ref(), &reference)?
            .ok_or(ExtenderError::AlreadyUnregistered { service_id: self.id })
    }

    /// 代表拥有者模块释放服务
    pub fn unget_service(&self) -> ExtenderResult<bool> {
        self.unget_service_for(self.owner)
    }

    /// 代表消费模块释放服务，注册本身不受影响
    pub fn unget_service_for(&self, consumer: ModuleId) -> ExtenderResult<bool> {
        let context = self.host.context(consumer)?;
        self.strategy
            .unget_service(context.as_ref(), &self.reference_snapshot())
    }

    /// 注销
    ///
    /// 只撤回宿主注册；注册表的移除由服务监听器响应宿主事件完成
    pub fn unregister(&self) -> ExtenderResult<()> {
        self.state
            .compare_exchange(
                UnregisterState::Live as u8,
                UnregisterState::Unregistering as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| ExtenderError::AlreadyUnregistered { service_id: self.id })?;

        let result = self.registration.unregister();
        self.strategy.close(self.id);
        self.state
            .store(UnregisterState::Unregistered as u8, Ordering::Release);

        match result {
            Ok(()) => {
                info!("注销服务: {} {:?}", self.id, self.contracts);
                Ok(())
            }
            Err(HostError::ServiceUnregistered { .. }) => {
                debug!("服务 {} 的宿主注册已不存在", self.id);
                Ok(())
            }
            Err(e) => {
                warn!("注销服务 {} 时宿主返回错误: {}", self.id, e);
                Err(e.into())
            }
        }
    }

    /// 宿主注册已在外部消失时标记为已注销，返回是否由本次调用完成标记
    pub fn retire(&self) -> bool {
        let retired = self
            .state
            .compare_exchange(
                UnregisterState::Live as u8,
                UnregisterState::Unregistered as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if retired {
            self.strategy.close(self.id);
        }
        retired
    }

    /// 丢弃作用域策略为已停止的消费模块保留的状态
    pub fn release_consumer(&self, consumer: ModuleId) {
        self.strategy.release_consumer(consumer, self.id);
    }

    /// 替换用户属性，保留键重新写入，宿主分发 `Modified` 事件
    pub fn set_properties(&self, properties: Properties) -> ExtenderResult<()> {
        if self.state() != UnregisterState::Live {
            return Err(ExtenderError::AlreadyUnregistered { service_id: self.id });
        }

        let mut properties: Properties = properties
            .into_iter()
            .filter(|(key, _)| !is_reserved_key(key))
            .collect();
        apply_reserved(&mut properties, self.scope, self.owner, self.registrar);

        // 先更新本地快照，事件回调中读到的即为新属性
        let previous = std::mem::replace(&mut *self.properties.write(), properties.clone());
        if let Err(e) = self.registration.set_properties(properties) {
            *self.properties.write() = previous;
            return Err(e.into());
        }
        if let Ok(reference) = self.registration.reference() {
            *self.properties.write() = reference.properties().clone();
        }
        debug!("更新服务属性: {}", self.id);
        Ok(())
    }

    /// 获取服务并按名称调用方法，调用后释放服务
    pub fn invoke(&self, consumer: ModuleId, method: &str, args: &[Value]) -> ExtenderResult<Value> {
        let service = self.get_service_for(consumer)?;
        let result = match &self.class {
            Some(class) => {
                let param_types = class
                    .find_method(method)
                    .map(|m| m.param_types.clone())
                    .unwrap_or_default();
                Introspector::invoke(method, class, &param_types, &service, args)
            }
            None => Introspector::call(&service, method, args),
        };
        if let Err(e) = self.unget_service_for(consumer) {
            debug!("调用后释放服务 {} 失败: {}", self.id, e);
        }
        Ok(result?)
    }

    fn reference_snapshot(&self) -> ServiceReference {
        ServiceReference::new(self.id, self.registrar, self.properties())
    }
}

fn check_compatible(
    contracts: &[String],
    object: &ServiceObject,
    implementation: &str,
) -> ExtenderResult<()> {
    match contracts.iter().find(|c| !object.implements(c)) {
        Some(contract) => Err(ExtenderError::IncompatibleType {
            contract: contract.clone(),
            implementation: implementation.to_string(),
        }),
        None => Ok(()),
    }
}

fn apply_reserved(
    properties: &mut Properties,
    scope: ServiceScope,
    owner: ModuleId,
    registrar: ModuleId,
) {
    properties.insert(EXTENDER_SCOPE.to_string(), json!(scope.as_str()));
    properties.insert(EXTENDER_OWNER.to_string(), json!(owner.value()));
    properties.insert(EXTENDER_REGISTRAR.to_string(), json!(registrar.value()));
}
