//! 服务跟踪
//!
//! 以过滤器订阅宿主服务事件，维护当前匹配的服务集合，并通过
//! [`TrackerCustomizer`] 通知服务的加入、变更与离开。

use extender_abstractions::{
    Filter, ListenerId, ModuleContext, ServiceEvent, ServiceEventKind, ServiceListener,
    ServiceObject, ServiceReference, TrackerCustomizer,
};
use extender_common::{HostResult, ServiceId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct Tracked {
    reference: ServiceReference,
    service: ServiceObject,
}

#[derive(Default)]
struct TrackedState {
    entries: BTreeMap<ServiceId, Tracked>,
    /// 定制器回调尚未返回的注册；移除事件在此期间到达时从这里删掉
    pending: HashSet<ServiceId>,
}

struct TrackedServices {
    customizer: Arc<dyn TrackerCustomizer>,
    state: Mutex<TrackedState>,
    closed: AtomicBool,
}

impl TrackedServices {
    fn add(&self, reference: &ServiceReference) {
        let id = reference.id();
        {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire)
                || state.entries.contains_key(&id)
                || !state.pending.insert(id)
            {
                return;
            }
        }

        // 定制器在锁外回调
        let Some(service) = self.customizer.adding_service(reference) else {
            self.state.lock().pending.remove(&id);
            return;
        };

        let rejected = {
            let mut state = self.state.lock();
            let still_pending = state.pending.remove(&id);
            if !still_pending
                || self.closed.load(Ordering::Acquire)
                || state.entries.contains_key(&id)
            {
                true
            } else {
                state.entries.insert(
                    id,
                    Tracked {
                        reference: reference.clone(),
                        service: service.clone(),
                    },
                );
                false
            }
        };
        if rejected {
            debug!("服务 {} 在加入跟踪期间离开", id);
            self.customizer.removed_service(reference, &service);
        }
    }

    fn modify(&self, reference: &ServiceReference) {
        let service = {
            let mut state = self.state.lock();
            state.entries.get_mut(&reference.id()).map(|tracked| {
                tracked.reference = reference.clone();
                tracked.service.clone()
            })
        };
        match service {
            Some(service) => self.customizer.modified_service(reference, &service),
            None => self.add(reference),
        }
    }

    fn remove(&self, id: ServiceId) {
        let removed = {
            let mut state = self.state.lock();
            state.pending.remove(&id);
            state.entries.remove(&id)
        };
        if let Some(tracked) = removed {
            self.customizer
                .removed_service(&tracked.reference, &tracked.service);
        }
    }
}

impl ServiceListener for TrackedServices {
    fn service_changed(&self, event: &ServiceEvent) {
        match event.kind {
            ServiceEventKind::Registered => self.add(&event.reference),
            ServiceEventKind::Modified => self.modify(&event.reference),
            ServiceEventKind::ModifiedEndMatch | ServiceEventKind::Unregistering => {
                self.remove(event.reference.id())
            }
        }
    }

    fn name(&self) -> &str {
        "ServiceTracker"
    }
}

/// 服务跟踪器
pub struct ServiceTracker {
    context: Arc<dyn ModuleContext>,
    contract: String,
    filter: Filter,
    tracked: Arc<TrackedServices>,
    listener: Mutex<Option<ListenerId>>,
}

impl std::fmt::Debug for ServiceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTracker")
            .field("module", &self.context.module())
            .field("contract", &self.contract)
            .field("filter", &self.filter.to_string())
            .field("size", &self.size())
            .finish()
    }
}

impl ServiceTracker {
    /// 创建跟踪器；`filter` 与 `objectClass` 条件取交集
    pub fn new(
        context: Arc<dyn ModuleContext>,
        contract: impl Into<String>,
        filter: Option<Filter>,
        customizer: Arc<dyn TrackerCustomizer>,
    ) -> Self {
        let contract = contract.into();
        let mut clauses = vec![Filter::equal(extender_common::OBJECT_CLASS, contract.clone())];
        clauses.extend(filter);
        Self {
            context,
            contract,
            filter: Filter::all(clauses),
            tracked: Arc::new(TrackedServices {
                customizer,
                state: Mutex::new(TrackedState::default()),
                closed: AtomicBool::new(false),
            }),
            listener: Mutex::new(None),
        }
    }

    /// 开始跟踪：先订阅事件，再加入已存在的匹配服务
    pub fn open(&self) -> HostResult<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }

        let id = self
            .context
            .add_service_listener(self.tracked.clone(), Some(self.filter.clone()))?;
        *listener = Some(id);
        drop(listener);

        let existing = self
            .context
            .service_references(Some(&self.contract), Some(&self.filter))?;
        info!(
            "开始跟踪 {} (模块 {}, 现有 {} 个)",
            self.contract,
            self.context.module(),
            existing.len()
        );
        for reference in existing {
            self.tracked.add(&reference);
        }
        Ok(())
    }

    /// 停止跟踪并释放所有被跟踪的服务
    pub fn close(&self) {
        let Some(id) = self.listener.lock().take() else {
            return;
        };
        self.tracked.closed.store(true, Ordering::Release);
        if let Err(e) = self.context.remove_listener(id) {
            debug!("移除跟踪监听器 {} 失败: {}", id, e);
        }

        let ids: Vec<ServiceId> = self.tracked.state.lock().entries.keys().copied().collect();
        for id in ids {
            self.tracked.remove(id);
        }
        info!("停止跟踪 {} (模块 {})", self.contract, self.context.module());
    }

    /// 是否正在跟踪
    pub fn is_open(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// 优先级最高的被跟踪服务
    pub fn service(&self) -> Option<ServiceObject> {
        self.tracked
            .state
            .lock()
            .entries
            .values()
            .min_by(|a, b| a.reference.precedence(&b.reference))
            .map(|tracked| tracked.service.clone())
    }

    /// 优先级最高的被跟踪服务引用
    pub fn service_reference(&self) -> Option<ServiceReference> {
        self.tracked
            .state
            .lock()
            .entries
            .values()
            .map(|tracked| tracked.reference.clone())
            .min_by(ServiceReference::precedence)
    }

    /// 全部被跟踪的服务
    pub fn services(&self) -> Vec<ServiceObject> {
        let state = self.tracked.state.lock();
        let mut tracked: Vec<&Tracked> = state.entries.values().collect();
        tracked.sort_by(|a, b| a.reference.precedence(&b.reference));
        tracked.into_iter().map(|t| t.service.clone()).collect()
    }

    /// 被跟踪的服务数量
    pub fn size(&self) -> usize {
        self.tracked.state.lock().entries.len()
    }

    /// 跟踪的契约名称
    pub fn contract(&self) -> &str {
        &self.contract
    }
}

impl Drop for ServiceTracker {
    fn drop(&mut self) {
        self.close();
    }
}
