//! 进程内宿主运行时
//!
//! 提供注册表依赖的宿主语义：模块状态与执行上下文有效性、单调分配的注册标识、
//! 服务排名、按消费模块缓存的工厂实例及使用计数、带过滤器的同步事件分发。
//! 事件和工厂回调都在不持有宿主锁的情况下执行，监听器可以重入宿主。

mod context;
mod registration;

pub use context::LocalModuleContext;
pub use registration::LocalServiceRegistration;

use extender_abstractions::{
    ClassDescriptor, Filter, HostRuntime, HostService, ListenerId, ModuleContext, ModuleEvent,
    ModuleEventKind, ModuleListener, ServiceEvent, ServiceEventKind, ServiceListener,
    ServiceObject, ServiceReference,
};
use extender_common::{HostError, HostResult, ModuleId, ModuleState, Properties, ServiceId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 宿主自身模块
pub const SYSTEM_MODULE: ModuleId = ModuleId(0);

/// 模块定义
///
/// 安装模块时提供名称及其类空间
#[derive(Debug, Clone)]
pub struct ModuleDefinition {
    name: String,
    classes: Vec<ClassDescriptor>,
}

impl ModuleDefinition {
    /// 创建模块定义
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: Vec::new(),
        }
    }

    /// 向类空间添加类
    pub fn class(mut self, class: ClassDescriptor) -> Self {
        self.classes.push(class);
        self
    }

    /// 模块名称
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub(crate) struct ModuleRecord {
    pub(crate) name: String,
    pub(crate) state: ModuleState,
    /// 每次启动递增，旧的执行上下文随之失效
    pub(crate) activation: u64,
    pub(crate) classes: HashMap<String, Arc<ClassDescriptor>>,
}

pub(crate) struct UseRecord {
    pub(crate) count: usize,
    pub(crate) instance: ServiceObject,
}

pub(crate) struct ServiceRecord {
    pub(crate) registrar: ModuleId,
    pub(crate) contracts: Vec<String>,
    pub(crate) properties: Properties,
    pub(crate) service: HostService,
    pub(crate) usages: HashMap<ModuleId, UseRecord>,
    pub(crate) unregistering: bool,
}

impl ServiceRecord {
    pub(crate) fn reference(&self, id: ServiceId) -> ServiceReference {
        ServiceReference::new(id, self.registrar, self.properties.clone())
    }
}

#[derive(Clone)]
pub(crate) enum ListenerKind {
    Service {
        listener: Arc<dyn ServiceListener>,
        filter: Option<Filter>,
    },
    Module(Arc<dyn ModuleListener>),
}

pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) owner: ModuleId,
    pub(crate) kind: ListenerKind,
}

#[derive(Default)]
pub(crate) struct HostState {
    pub(crate) modules: HashMap<ModuleId, ModuleRecord>,
    pub(crate) services: HashMap<ServiceId, ServiceRecord>,
    pub(crate) listeners: Vec<ListenerEntry>,
}

pub(crate) struct HostInner {
    pub(crate) state: RwLock<HostState>,
    next_module: AtomicU64,
    pub(crate) next_service: AtomicU64,
    next_listener: AtomicU64,
}

impl HostInner {
    fn new() -> Self {
        let mut state = HostState::default();
        state.modules.insert(
            SYSTEM_MODULE,
            ModuleRecord {
                name: "system".to_string(),
                state: ModuleState::Active,
                activation: 1,
                classes: HashMap::new(),
            },
        );
        Self {
            state: RwLock::new(state),
            next_module: AtomicU64::new(1),
            next_service: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    pub(crate) fn context_valid(&self, module: ModuleId, activation: u64) -> bool {
        self.state.read().modules.get(&module).map_or(false, |record| {
            record.state.has_valid_context() && record.activation == activation
        })
    }

    pub(crate) fn check_context(&self, module: ModuleId, activation: u64) -> HostResult<()> {
        if self.context_valid(module, activation) {
            Ok(())
        } else {
            Err(HostError::InvalidContext { module })
        }
    }

    pub(crate) fn find_class(&self, module: ModuleId, class_name: &str) -> Option<Arc<ClassDescriptor>> {
        self.state
            .read()
            .modules
            .get(&module)
            .and_then(|record| record.classes.get(class_name).cloned())
    }

    pub(crate) fn add_listener(&self, owner: ModuleId, kind: ListenerKind) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.state.write().listeners.push(ListenerEntry { id, owner, kind });
        debug!("添加监听器: {} (所属 {})", id, owner);
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.write();
        let before = state.listeners.len();
        state.listeners.retain(|entry| entry.id != id);
        before != state.listeners.len()
    }

    fn remove_listeners_of(&self, owner: ModuleId) -> usize {
        let mut state = self.state.write();
        let before = state.listeners.len();
        state.listeners.retain(|entry| entry.owner != owner);
        before - state.listeners.len()
    }

    fn dispatch_module_event(&self, event: &ModuleEvent) {
        let listeners: Vec<Arc<dyn ModuleListener>> = self
            .state
            .read()
            .listeners
            .iter()
            .filter_map(|entry| match &entry.kind {
                ListenerKind::Module(listener) => Some(listener.clone()),
                ListenerKind::Service { .. } => None,
            })
            .collect();

        for listener in listeners {
            debug!(
                "向监听器 {} 分发模块事件: {:?} {}",
                listener.name(),
                event.kind,
                event.module
            );
            listener.module_changed(event);
        }
    }

    /// 分发服务事件；`previous` 为属性变更前的快照，用于判定 `ModifiedEndMatch`
    pub(crate) fn dispatch_service_event(
        &self,
        kind: ServiceEventKind,
        reference: &ServiceReference,
        previous: Option<&Properties>,
    ) {
        let listeners: Vec<(Arc<dyn ServiceListener>, Option<Filter>)> = self
            .state
            .read()
            .listeners
            .iter()
            .filter_map(|entry| match &entry.kind {
                ListenerKind::Service { listener, filter } => {
                    Some((listener.clone(), filter.clone()))
                }
                ListenerKind::Module(_) => None,
            })
            .collect();

        for (listener, filter) in listeners {
            let matches_now = filter
                .as_ref()
                .map_or(true, |f| f.matches(reference.properties()));
            let delivered = match kind {
                ServiceEventKind::Modified => {
                    let matched_before = previous.map_or(false, |props| {
                        filter.as_ref().map_or(true, |f| f.matches(props))
                    });
                    if matches_now {
                        Some(ServiceEventKind::Modified)
                    } else if matched_before {
                        Some(ServiceEventKind::ModifiedEndMatch)
                    } else {
                        None
                    }
                }
                other => matches_now.then_some(other),
            };

            if let Some(kind) = delivered {
                debug!(
                    "向监听器 {} 分发服务事件: {:?} {}",
                    listener.name(),
                    kind,
                    reference.id()
                );
                listener.service_changed(&ServiceEvent::new(kind, reference.clone()));
            }
        }
    }

    fn module_name(&self, module: ModuleId) -> String {
        self.state
            .read()
            .modules
            .get(&module)
            .map_or_else(|| module.to_string(), |record| record.name.clone())
    }
}

/// 进程内宿主运行时
#[derive(Clone)]
pub struct LocalHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for LocalHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("LocalHost")
            .field("modules", &state.modules.len())
            .field("services", &state.services.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl LocalHost {
    /// 创建宿主，只包含始终运行的系统模块
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HostInner::new()),
        }
    }

    /// 安装模块
    pub fn install_module(&self, definition: ModuleDefinition) -> ModuleId {
        let module = ModuleId(self.inner.next_module.fetch_add(1, Ordering::SeqCst));
        let classes = definition
            .classes
            .into_iter()
            .map(|class| (class.name().to_string(), Arc::new(class)))
            .collect();

        self.inner.state.write().modules.insert(
            module,
            ModuleRecord {
                name: definition.name.clone(),
                state: ModuleState::Installed,
                activation: 0,
                classes,
            },
        );

        info!("安装模块: {} ({})", definition.name, module);
        self.inner.dispatch_module_event(&ModuleEvent::new(
            ModuleEventKind::Installed,
            module,
            definition.name,
        ));
        module
    }

    /// 启动模块，产生新的执行上下文
    pub fn start_module(&self, module: ModuleId) -> HostResult<()> {
        let name = {
            let mut state = self.inner.state.write();
            let record = state
                .modules
                .get_mut(&module)
                .ok_or(HostError::UnknownModule { module })?;
            if !record.state.can_start() {
                return Err(illegal_state(module, record.state, "start"));
            }
            record.activation += 1;
            record.state = ModuleState::Starting;
            record.name.clone()
        };

        self.inner
            .dispatch_module_event(&ModuleEvent::new(ModuleEventKind::Starting, module, &name));
        self.set_state(module, ModuleState::Active);
        info!("模块已启动: {} ({})", name, module);
        self.inner
            .dispatch_module_event(&ModuleEvent::new(ModuleEventKind::Started, module, name));
        Ok(())
    }

    /// 停止模块
    ///
    /// 顺序：分发 `Stopping`（监听器同步完成清理）→ 注销模块仍持有的注册 →
    /// 释放模块使用的服务 → 移除模块的监听器 → 上下文失效 → 分发 `Stopped`
    pub fn stop_module(&self, module: ModuleId) -> HostResult<()> {
        if module == SYSTEM_MODULE {
            return Err(illegal_state(module, ModuleState::Active, "stop"));
        }

        let name = {
            let mut state = self.inner.state.write();
            let record = state
                .modules
                .get_mut(&module)
                .ok_or(HostError::UnknownModule { module })?;
            if !record.state.can_stop() {
                return Err(illegal_state(module, record.state, "stop"));
            }
            record.state = ModuleState::Stopping;
            record.name.clone()
        };

        info!("停止模块: {} ({})", name, module);
        self.inner
            .dispatch_module_event(&ModuleEvent::new(ModuleEventKind::Stopping, module, &name));

        let mut owned: Vec<ServiceId> = self
            .inner
            .state
            .read()
            .services
            .iter()
            .filter(|(_, record)| record.registrar == module && !record.unregistering)
            .map(|(id, _)| *id)
            .collect();
        owned.sort();
        for id in owned {
            if let Err(e) = self.inner.unregister_service(id) {
                debug!("停止模块时注销 {} 跳过: {}", id, e);
            }
        }

        let released = self.inner.release_usages(module);
        let removed = self.inner.remove_listeners_of(module);
        debug!(
            "模块 {} 释放 {} 个服务引用，移除 {} 个监听器",
            module, released, removed
        );

        self.set_state(module, ModuleState::Resolved);
        info!("模块已停止: {} ({})", name, module);
        self.inner
            .dispatch_module_event(&ModuleEvent::new(ModuleEventKind::Stopped, module, name));
        Ok(())
    }

    /// 卸载模块，运行中的模块先停止
    pub fn uninstall_module(&self, module: ModuleId) -> HostResult<()> {
        if self.module_state(module)? == ModuleState::Active {
            self.stop_module(module)?;
        }

        let name = {
            let mut state = self.inner.state.write();
            let record = state
                .modules
                .get_mut(&module)
                .ok_or(HostError::UnknownModule { module })?;
            if record.state == ModuleState::Uninstalled || module == SYSTEM_MODULE {
                return Err(illegal_state(module, record.state, "uninstall"));
            }
            record.state = ModuleState::Uninstalled;
            record.classes.clear();
            record.name.clone()
        };

        info!("卸载模块: {} ({})", name, module);
        self.inner
            .dispatch_module_event(&ModuleEvent::new(ModuleEventKind::Uninstalled, module, name));
        Ok(())
    }

    /// 按标识逆序停止所有运行中的模块
    pub fn shutdown(&self) {
        let mut active: Vec<ModuleId> = self
            .inner
            .state
            .read()
            .modules
            .iter()
            .filter(|(id, record)| **id != SYSTEM_MODULE && record.state == ModuleState::Active)
            .map(|(id, _)| *id)
            .collect();
        active.sort_by(|a, b| b.cmp(a));

        info!("关闭宿主，停止 {} 个模块", active.len());
        for module in active {
            if let Err(e) = self.stop_module(module) {
                warn!("关闭宿主时停止模块 {} 失败: {}", module, e);
            }
        }
    }

    /// 模块名称
    pub fn module_name(&self, module: ModuleId) -> String {
        self.inner.module_name(module)
    }

    /// 当前有效的注册数量
    pub fn service_count(&self) -> usize {
        self.inner
            .state
            .read()
            .services
            .values()
            .filter(|record| !record.unregistering)
            .count()
    }

    /// 消费模块对某注册的使用计数
    pub fn use_count(&self, service_id: ServiceId, consumer: ModuleId) -> usize {
        self.inner.use_count(service_id, consumer)
    }

    /// 已注册的监听器数量
    pub fn listener_count(&self) -> usize {
        self.inner.state.read().listeners.len()
    }

    fn set_state(&self, module: ModuleId, new_state: ModuleState) {
        if let Some(record) = self.inner.state.write().modules.get_mut(&module) {
            record.state = new_state;
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime for LocalHost {
    fn context(&self, module: ModuleId) -> HostResult<Arc<dyn ModuleContext>> {
        let state = self.inner.state.read();
        let record = state
            .modules
            .get(&module)
            .ok_or(HostError::UnknownModule { module })?;
        if !record.state.has_valid_context() {
            return Err(HostError::InvalidContext { module });
        }
        Ok(Arc::new(LocalModuleContext::new(
            self.inner.clone(),
            module,
            record.activation,
        )))
    }

    fn module_state(&self, module: ModuleId) -> HostResult<ModuleState> {
        self.inner
            .state
            .read()
            .modules
            .get(&module)
            .map(|record| record.state)
            .ok_or(HostError::UnknownModule { module })
    }

    fn system_context(&self) -> Arc<dyn ModuleContext> {
        Arc::new(LocalModuleContext::new(self.inner.clone(), SYSTEM_MODULE, 1))
    }
}

fn illegal_state(module: ModuleId, state: ModuleState, operation: &str) -> HostError {
    HostError::IllegalModuleState {
        module,
        state: format!("{:?}", state),
        operation: operation.to_string(),
    }
}
