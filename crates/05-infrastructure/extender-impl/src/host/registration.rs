//! 宿主服务注册表

use super::{HostInner, ServiceRecord, UseRecord};
use extender_abstractions::{
    Filter, HostService, ServiceEventKind, ServiceObject, ServiceReference, ServiceRegistration,
};
use extender_common::{
    HostError, HostResult, ModuleId, Properties, ServiceId, OBJECT_CLASS, SERVICE_ID,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

impl HostInner {
    pub(crate) fn register_service(
        &self,
        registrar: ModuleId,
        contracts: &[String],
        service: HostService,
        mut properties: Properties,
    ) -> HostResult<ServiceId> {
        if let HostService::Object(object) = &service {
            if let Some(contract) = contracts.iter().find(|c| !object.implements(c)) {
                return Err(HostError::NotCompatible {
                    contract: contract.clone(),
                });
            }
        }

        let id = ServiceId(self.next_service.fetch_add(1, Ordering::SeqCst));
        properties.insert(OBJECT_CLASS.to_string(), json!(contracts));
        properties.insert(SERVICE_ID.to_string(), json!(id.value()));
        let reference = ServiceReference::new(id, registrar, properties.clone());

        self.state.write().services.insert(
            id,
            ServiceRecord {
                registrar,
                contracts: contracts.to_vec(),
                properties,
                service,
                usages: HashMap::new(),
                unregistering: false,
            },
        );

        debug!("宿主注册服务: {} {:?} (注册者 {})", id, contracts, registrar);
        self.dispatch_service_event(ServiceEventKind::Registered, &reference, None);
        Ok(id)
    }

    /// 注销：先标记并分发 `Unregistering`，监听器返回后再移除记录
    pub(crate) fn unregister_service(&self, id: ServiceId) -> HostResult<()> {
        let reference = {
            let mut state = self.state.write();
            let record = state
                .services
                .get_mut(&id)
                .filter(|record| !record.unregistering)
                .ok_or(HostError::ServiceUnregistered { service_id: id })?;
            record.unregistering = true;
            record.reference(id)
        };

        self.dispatch_service_event(ServiceEventKind::Unregistering, &reference, None);

        let removed = self.state.write().services.remove(&id);
        if let Some(record) = removed {
            if let HostService::Factory(factory) = &record.service {
                for (consumer, usage) in record.usages {
                    factory.unget_service(consumer, id, &usage.instance);
                }
            }
        }
        debug!("宿主注销服务: {}", id);
        Ok(())
    }

    pub(crate) fn set_service_properties(
        &self,
        id: ServiceId,
        mut properties: Properties,
    ) -> HostResult<()> {
        let (reference, previous) = {
            let mut state = self.state.write();
            let record = state
                .services
                .get_mut(&id)
                .filter(|record| !record.unregistering)
                .ok_or(HostError::ServiceUnregistered { service_id: id })?;
            properties.insert(OBJECT_CLASS.to_string(), json!(record.contracts));
            properties.insert(SERVICE_ID.to_string(), json!(id.value()));
            let previous = std::mem::replace(&mut record.properties, properties);
            (record.reference(id), previous)
        };

        self.dispatch_service_event(ServiceEventKind::Modified, &reference, Some(&previous));
        Ok(())
    }

    pub(crate) fn service_reference(&self, id: ServiceId) -> HostResult<ServiceReference> {
        self.state
            .read()
            .services
            .get(&id)
            .filter(|record| !record.unregistering)
            .map(|record| record.reference(id))
            .ok_or(HostError::ServiceUnregistered { service_id: id })
    }

    pub(crate) fn is_service_registered(&self, id: ServiceId) -> bool {
        self.state
            .read()
            .services
            .get(&id)
            .map_or(false, |record| !record.unregistering)
    }

    pub(crate) fn find_references(
        &self,
        contract: Option<&str>,
        filter: Option<&Filter>,
    ) -> Vec<ServiceReference> {
        let mut references: Vec<ServiceReference> = self
            .state
            .read()
            .services
            .iter()
            .filter(|(_, record)| !record.unregistering)
            .filter(|(_, record)| {
                contract.map_or(true, |c| record.contracts.iter().any(|x| x == c))
            })
            .filter(|(_, record)| filter.map_or(true, |f| f.matches(&record.properties)))
            .map(|(id, record)| record.reference(*id))
            .collect();
        references.sort_by(ServiceReference::precedence);
        references
    }

    /// 获取服务并增加使用计数
    ///
    /// 工厂在锁外调用；并发首次获取时保留先写入的实例，多余的实例立即归还工厂
    pub(crate) fn get_service(
        &self,
        consumer: ModuleId,
        reference: &ServiceReference,
    ) -> HostResult<Option<ServiceObject>> {
        let id = reference.id();
        let factory = {
            let mut state = self.state.write();
            let Some(record) = state.services.get_mut(&id) else {
                return Ok(None);
            };
            if let Some(usage) = record.usages.get_mut(&consumer) {
                usage.count += 1;
                return Ok(Some(usage.instance.clone()));
            }
            match &record.service {
                HostService::Object(object) => {
                    let instance = object.clone();
                    record.usages.insert(
                        consumer,
                        UseRecord {
                            count: 1,
                            instance: instance.clone(),
                        },
                    );
                    return Ok(Some(instance));
                }
                HostService::Factory(factory) => factory.clone(),
            }
        };

        let instance = factory
            .get_service(consumer, id)
            .map_err(|e| HostError::FactoryFailed {
                service_id: id,
                message: e.to_string(),
            })?;

        if let Some(contract) = reference
            .contracts()
            .into_iter()
            .find(|c| !instance.implements(c))
        {
            factory.unget_service(consumer, id, &instance);
            return Err(HostError::NotCompatible { contract });
        }

        let mut surplus = None;
        let result = {
            let mut state = self.state.write();
            match state.services.get_mut(&id) {
                None => {
                    surplus = Some(instance);
                    None
                }
                Some(record) => match record.usages.get_mut(&consumer) {
                    Some(usage) => {
                        usage.count += 1;
                        let existing = usage.instance.clone();
                        surplus = Some(instance);
                        Some(existing)
                    }
                    None => {
                        record.usages.insert(
                            consumer,
                            UseRecord {
                                count: 1,
                                instance: instance.clone(),
                            },
                        );
                        Some(instance)
                    }
                },
            }
        };

        if let Some(extra) = surplus {
            factory.unget_service(consumer, id, &extra);
        }
        Ok(result)
    }

    /// 减少使用计数，返回调用前是否持有该服务
    pub(crate) fn unget_service(&self, consumer: ModuleId, id: ServiceId) -> bool {
        let released = {
            let mut state = self.state.write();
            let Some(record) = state.services.get_mut(&id) else {
                return false;
            };
            let Some(usage) = record.usages.get_mut(&consumer) else {
                return false;
            };
            usage.count -= 1;
            if usage.count > 0 {
                return true;
            }
            let usage = record.usages.remove(&consumer);
            match (&record.service, usage) {
                (HostService::Factory(factory), Some(usage)) => {
                    Some((factory.clone(), usage.instance))
                }
                _ => None,
            }
        };

        if let Some((factory, instance)) = released {
            factory.unget_service(consumer, id, &instance);
        }
        true
    }

    /// 消费模块对服务的当前使用计数
    pub(crate) fn use_count(&self, id: ServiceId, consumer: ModuleId) -> usize {
        self.state
            .read()
            .services
            .get(&id)
            .and_then(|record| record.usages.get(&consumer))
            .map_or(0, |usage| usage.count)
    }

    /// 释放消费模块持有的全部服务，返回释放的注册数量
    pub(crate) fn release_usages(&self, consumer: ModuleId) -> usize {
        let mut count = 0;
        let released: Vec<_> = {
            let mut state = self.state.write();
            state
                .services
                .iter_mut()
                .filter_map(|(id, record)| {
                    let usage = record.usages.remove(&consumer)?;
                    count += 1;
                    match &record.service {
                        HostService::Factory(factory) => {
                            Some((*id, factory.clone(), usage.instance))
                        }
                        HostService::Object(_) => None,
                    }
                })
                .collect()
        };

        for (id, factory, instance) in released {
            factory.unget_service(consumer, id, &instance);
        }
        count
    }
}

/// 进程内宿主的服务注册句柄
pub struct LocalServiceRegistration {
    inner: Arc<HostInner>,
    id: ServiceId,
}

impl LocalServiceRegistration {
    pub(crate) fn new(inner: Arc<HostInner>, id: ServiceId) -> Self {
        Self { inner, id }
    }
}

impl std::fmt::Debug for LocalServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServiceRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl ServiceRegistration for LocalServiceRegistration {
    fn id(&self) -> ServiceId {
        self.id
    }

    fn reference(&self) -> HostResult<ServiceReference> {
        self.inner.service_reference(self.id)
    }

    fn set_properties(&self, properties: Properties) -> HostResult<()> {
        self.inner.set_service_properties(self.id, properties)
    }

    fn unregister(&self) -> HostResult<()> {
        self.inner.unregister_service(self.id)
    }

    fn is_registered(&self) -> bool {
        self.inner.is_service_registered(self.id)
    }
}
