//! 宿主模块运行时抽象接口

use crate::events::{ListenerId, ModuleListener, ServiceListener};
use crate::filter::Filter;
use crate::invokable::{ClassDescriptor, ServiceObject};
use extender_common::{
    contracts_of, ranking_of, HostResult, ModuleId, ModuleState, Properties, ServiceId,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// 服务工厂 trait
///
/// 宿主为每个消费模块调用一次 `get_service`，并缓存返回的实例直到该模块释放
pub trait ServiceFactory: Send + Sync {
    /// 为消费模块创建服务实例
    fn get_service(
        &self,
        consumer: ModuleId,
        registration: ServiceId,
    ) -> Result<ServiceObject, Box<dyn std::error::Error + Send + Sync>>;

    /// 消费模块释放服务实例
    fn unget_service(&self, _consumer: ModuleId, _registration: ServiceId, _service: &ServiceObject) {
    }
}

/// 宿主级服务来源
#[derive(Clone)]
pub enum HostService {
    /// 共享对象
    Object(ServiceObject),
    /// 按消费模块创建实例的工厂
    Factory(Arc<dyn ServiceFactory>),
}

impl fmt::Debug for HostService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => write!(f, "Object({})", object.type_name()),
            Self::Factory(_) => f.write_str("Factory(<function>)"),
        }
    }
}

/// 服务引用
///
/// 某一时刻的注册快照：标识、注册者模块与属性
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReference {
    id: ServiceId,
    registrar: ModuleId,
    properties: Properties,
}

impl ServiceReference {
    /// 创建服务引用
    pub fn new(id: ServiceId, registrar: ModuleId, properties: Properties) -> Self {
        Self {
            id,
            registrar,
            properties,
        }
    }

    /// 注册标识
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// 注册者模块
    pub fn registrar(&self) -> ModuleId {
        self.registrar
    }

    /// 契约名称列表
    pub fn contracts(&self) -> Vec<String> {
        contracts_of(&self.properties)
    }

    /// 服务排名
    pub fn ranking(&self) -> i64 {
        ranking_of(&self.properties)
    }

    /// 获取属性
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// 全部属性
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// 是否以指定契约名称发布
    pub fn has_contract(&self, contract: &str) -> bool {
        self.contracts().iter().any(|c| c == contract)
    }

    /// 按优先顺序比较：排名高者在前，排名相同时标识小者在前
    pub fn precedence(&self, other: &Self) -> Ordering {
        other
            .ranking()
            .cmp(&self.ranking())
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// 宿主级服务注册句柄
pub trait ServiceRegistration: Send + Sync {
    /// 注册标识
    fn id(&self) -> ServiceId;

    /// 当前引用，已注销时失败
    fn reference(&self) -> HostResult<ServiceReference>;

    /// 替换属性（宿主保留键由宿主维护），触发 `Modified` 事件
    fn set_properties(&self, properties: Properties) -> HostResult<()>;

    /// 注销，触发 `Unregistering` 事件
    fn unregister(&self) -> HostResult<()>;

    /// 注册是否仍然有效
    fn is_registered(&self) -> bool;
}

/// 模块执行上下文
///
/// 仅在模块处于启动中、运行中或停止中时有效
pub trait ModuleContext: Send + Sync {
    /// 所属模块
    fn module(&self) -> ModuleId;

    /// 上下文是否有效
    fn is_valid(&self) -> bool;

    /// 以一组契约名称注册服务
    fn register_service(
        &self,
        contracts: &[String],
        service: HostService,
        properties: Properties,
    ) -> HostResult<Arc<dyn ServiceRegistration>>;

    /// 查询服务引用，按优先顺序排序
    fn service_references(
        &self,
        contract: Option<&str>,
        filter: Option<&Filter>,
    ) -> HostResult<Vec<ServiceReference>>;

    /// 获取服务实例并增加使用计数；注册已消失时返回 `None`
    fn get_service(&self, reference: &ServiceReference) -> HostResult<Option<ServiceObject>>;

    /// 减少使用计数；计数归零时释放模块绑定的实例
    fn unget_service(&self, reference: &ServiceReference) -> HostResult<bool>;

    /// 本模块对服务的当前使用计数
    fn use_count(&self, reference: &ServiceReference) -> HostResult<usize>;

    /// 在模块的类空间中按名称查找类
    fn load_class(&self, class_name: &str) -> HostResult<Option<Arc<ClassDescriptor>>>;

    /// 添加服务监听器，模块停止时自动移除
    fn add_service_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        filter: Option<Filter>,
    ) -> HostResult<ListenerId>;

    /// 添加模块监听器，模块停止时自动移除
    fn add_module_listener(&self, listener: Arc<dyn ModuleListener>) -> HostResult<ListenerId>;

    /// 移除监听器
    fn remove_listener(&self, listener: ListenerId) -> HostResult<bool>;
}

/// 宿主模块运行时
pub trait HostRuntime: Send + Sync {
    /// 获取模块的执行上下文
    fn context(&self, module: ModuleId) -> HostResult<Arc<dyn ModuleContext>>;

    /// 获取模块状态
    fn module_state(&self, module: ModuleId) -> HostResult<ModuleState>;

    /// 宿主自身的上下文，始终有效
    fn system_context(&self) -> Arc<dyn ModuleContext>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use extender_common::{OBJECT_CLASS, SERVICE_RANKING};
    use serde_json::json;

    fn reference(id: u64, ranking: i64) -> ServiceReference {
        let mut properties = Properties::new();
        properties.insert(OBJECT_CLASS.to_string(), json!(["Greeter"]));
        properties.insert(SERVICE_RANKING.to_string(), json!(ranking));
        ServiceReference::new(ServiceId(id), ModuleId(1), properties)
    }

    #[test]
    fn test_precedence_prefers_ranking_then_lower_id() {
        let mut references = vec![reference(3, 0), reference(1, 0), reference(2, 5)];
        references.sort_by(ServiceReference::precedence);
        let ids: Vec<u64> = references.iter().map(|r| r.id().value()).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_reference_contracts() {
        let reference = reference(1, 0);
        assert!(reference.has_contract("Greeter"));
        assert!(!reference.has_contract("Logger"));
        assert_eq!(reference.registrar(), ModuleId(1));
    }
}
