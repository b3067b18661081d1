//! 模块执行上下文

use super::{HostInner, ListenerKind, LocalServiceRegistration};
use extender_abstractions::{
    ClassDescriptor, Filter, HostService, ListenerId, ModuleContext, ModuleListener,
    ServiceListener, ServiceObject, ServiceReference, ServiceRegistration,
};
use extender_common::{HostResult, ModuleId, Properties};
use std::sync::Arc;

/// 进程内宿主的模块执行上下文
///
/// 绑定到模块的某一次启动；模块停止或重新启动后失效
pub struct LocalModuleContext {
    inner: Arc<HostInner>,
    module: ModuleId,
    activation: u64,
}

impl LocalModuleContext {
    pub(crate) fn new(inner: Arc<HostInner>, module: ModuleId, activation: u64) -> Self {
        Self {
            inner,
            module,
            activation,
        }
    }

    fn check(&self) -> HostResult<()> {
        self.inner.check_context(self.module, self.activation)
    }
}

impl std::fmt::Debug for LocalModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalModuleContext")
            .field("module", &self.module)
            .field("activation", &self.activation)
            .finish()
    }
}

impl ModuleContext for LocalModuleContext {
    fn module(&self) -> ModuleId {
        self.module
    }

    fn is_valid(&self) -> bool {
        self.inner.context_valid(self.module, self.activation)
    }

    fn register_service(
        &self,
        contracts: &[String],
        service: HostService,
        properties: Properties,
    ) -> HostResult<Arc<dyn ServiceRegistration>> {
        self.check()?;
        let id = self
            .inner
            .register_service(self.module, contracts, service, properties)?;
        Ok(Arc::new(LocalServiceRegistration::new(self.inner.clone(), id)))
    }

    fn service_references(
        &self,
        contract: Option<&str>,
        filter: Option<&Filter>,
    ) -> HostResult<Vec<ServiceReference>> {
        self.check()?;
        Ok(self.inner.find_references(contract, filter))
    }

    fn get_service(&self, reference: &ServiceReference) -> HostResult<Option<ServiceObject>> {
        self.check()?;
        self.inner.get_service(self.module, reference)
    }

    fn unget_service(&self, reference: &ServiceReference) -> HostResult<bool> {
        self.check()?;
        Ok(self.inner.unget_service(self.module, reference.id()))
    }

    fn use_count(&self, reference: &ServiceReference) -> HostResult<usize> {
        self.check()?;
        Ok(self.inner.use_count(reference.id(), self.module))
    }

    fn load_class(&self, class_name: &str) -> HostResult<Option<Arc<ClassDescriptor>>> {
        self.check()?;
        Ok(self.inner.find_class(self.module, class_name))
    }

    fn add_service_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        filter: Option<Filter>,
    ) -> HostResult<ListenerId> {
        self.check()?;
        Ok(self
            .inner
            .add_listener(self.module, ListenerKind::Service { listener, filter }))
    }

    fn add_module_listener(&self, listener: Arc<dyn ModuleListener>) -> HostResult<ListenerId> {
        self.check()?;
        Ok(self
            .inner
            .add_listener(self.module, ListenerKind::Module(listener)))
    }

    // 上下文失效后仍允许移除，停止时的清理路径依赖这一点
    fn remove_listener(&self, listener: ListenerId) -> HostResult<bool> {
        Ok(self.inner.remove_listener(listener))
    }
}
