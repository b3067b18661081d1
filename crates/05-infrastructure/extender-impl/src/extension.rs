//! Extension：消费者侧的服务句柄
//!
//! 每次获取都按契约名称从注册表重新解析 Extender，并经由其作用域策略取得服务。
//! 可选地开启服务跟踪，把跟踪的开始与结束报告给外部生命周期钩子。

use crate::extender::Extender;
use crate::service_map::ExtenderServiceMap;
use crate::tracker::ServiceTracker;
use extender_abstractions::{
    ExtensionCustomizer, Filter, HostRuntime, ModuleContext, ServiceObject, ServiceReference,
    TrackerCustomizer, TrackingEvent, TrackingHook,
};
use extender_common::{ExtenderError, ExtenderResult, ModuleId, ServiceId, EXTENDER_OWNER};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 消费者侧服务句柄
pub struct Extension {
    contract: String,
    consumer: ModuleId,
    host: Arc<dyn HostRuntime>,
    map: Arc<ExtenderServiceMap>,
    hook: Option<Arc<dyn TrackingHook>>,
    last_resolved: Mutex<Option<Arc<Extender>>>,
    tracker: Mutex<Option<ServiceTracker>>,
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("contract", &self.contract)
            .field("consumer", &self.consumer)
            .field("tracking", &self.is_tracking())
            .finish()
    }
}

impl Extension {
    /// 创建 Extension
    pub fn new(
        contract: impl Into<String>,
        consumer: ModuleId,
        host: Arc<dyn HostRuntime>,
        map: Arc<ExtenderServiceMap>,
    ) -> Self {
        Self {
            contract: contract.into(),
            consumer,
            host,
            map,
            hook: None,
            last_resolved: Mutex::new(None),
            tracker: Mutex::new(None),
        }
    }

    /// 设置跟踪生命周期钩子
    pub fn with_hook(mut self, hook: Arc<dyn TrackingHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// 目标契约名称
    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// 消费模块
    pub fn consumer(&self) -> ModuleId {
        self.consumer
    }

    /// 代表消费模块获取服务
    pub fn get_service(&self) -> ExtenderResult<ServiceObject> {
        self.get_service_for(self.consumer)
    }

    /// 代表指定模块获取服务
    ///
    /// 没有可解析的注册时：若上次解析到的 Extender 的拥有者上下文已失效，返回
    /// `InvalidContext`；若从未解析到任何注册，返回 `ServiceUnavailable`
    pub fn get_service_for(&self, consumer: ModuleId) -> ExtenderResult<ServiceObject> {
        self.host.context(consumer)?;

        if let Some(extender) = self.map.get_by_contract(&self.contract) {
            *self.last_resolved.lock() = Some(extender.clone());
            return extender.get_service_for(consumer);
        }

        let last = self.last_resolved.lock().clone();
        match last {
            Some(extender) if self.host.context(extender.owner()).is_err() => {
                Err(ExtenderError::InvalidContext {
                    module: extender.owner(),
                })
            }
            _ => Err(ExtenderError::ServiceUnavailable {
                contract: self.contract.clone(),
            }),
        }
    }

    /// 通过上次解析到的 Extender 释放服务
    pub fn unget_service(&self) -> ExtenderResult<bool> {
        self.unget_service_for(self.consumer)
    }

    /// 通过上次解析到的 Extender 代表指定模块释放服务
    pub fn unget_service_for(&self, consumer: ModuleId) -> ExtenderResult<bool> {
        let last = self.last_resolved.lock().clone();
        match last {
            Some(extender) => extender.unget_service_for(consumer),
            None => Ok(false),
        }
    }

    /// 上次解析到的 Extender
    pub fn last_resolved(&self) -> Option<Arc<Extender>> {
        self.last_resolved.lock().clone()
    }

    /// 开启服务跟踪
    ///
    /// 已在跟踪时直接返回
    pub fn open_service_tracker(
        &self,
        customizer: Option<Arc<dyn ExtensionCustomizer>>,
    ) -> ExtenderResult<()> {
        let mut slot = self.tracker.lock();
        if slot.is_some() {
            debug!("{} 已在跟踪 {}", self.consumer, self.contract);
            return Ok(());
        }

        let context = self.host.context(self.consumer)?;
        let adapter = Arc::new(TrackingAdapter {
            contract: self.contract.clone(),
            consumer: self.consumer,
            session: uuid::Uuid::new_v4(),
            context: context.clone(),
            map: self.map.clone(),
            customizer,
            hook: self.hook.clone(),
            borrowed: Mutex::new(HashMap::new()),
        });
        let tracker = ServiceTracker::new(
            context,
            self.contract.clone(),
            Some(Filter::present(EXTENDER_OWNER)),
            adapter,
        );
        tracker.open()?;
        info!(
            "{} 开启跟踪 {}，当前 {} 个服务",
            self.consumer,
            self.contract,
            tracker.size()
        );
        *slot = Some(tracker);
        Ok(())
    }

    /// 关闭服务跟踪并释放所有被跟踪的服务
    pub fn close_tracked_service(&self) {
        let tracker = self.tracker.lock().take();
        if let Some(tracker) = tracker {
            tracker.close();
            info!("{} 关闭跟踪 {}", self.consumer, self.contract);
        }
    }

    /// 优先级最高的被跟踪服务
    pub fn tracked_service(&self) -> Option<ServiceObject> {
        self.tracker.lock().as_ref().and_then(ServiceTracker::service)
    }

    /// 被跟踪的服务数量
    pub fn tracking_count(&self) -> usize {
        self.tracker.lock().as_ref().map_or(0, ServiceTracker::size)
    }

    /// 是否正在跟踪
    pub fn is_tracking(&self) -> bool {
        self.tracker
            .lock()
            .as_ref()
            .map_or(false, ServiceTracker::is_open)
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        self.close_tracked_service();
    }
}

/// 被跟踪服务的借用来源
enum Borrowed {
    /// 经由 Extender 的作用域策略
    Extender(Arc<Extender>),
    /// 注册事件先于 Extender 放入注册表到达，直接向宿主借用
    Host,
}

/// 把宿主跟踪回调转接到 Extender 与扩展点定制器
struct TrackingAdapter {
    contract: String,
    consumer: ModuleId,
    session: uuid::Uuid,
    context: Arc<dyn ModuleContext>,
    map: Arc<ExtenderServiceMap>,
    customizer: Option<Arc<dyn ExtensionCustomizer>>,
    hook: Option<Arc<dyn TrackingHook>>,
    /// 服务离开时注册表中可能已没有对应条目，自行保留
    borrowed: Mutex<HashMap<ServiceId, Borrowed>>,
}

impl TrackingAdapter {
    fn event(&self, service_id: ServiceId) -> TrackingEvent {
        TrackingEvent::new(self.session, self.contract.clone(), self.consumer, service_id)
    }

    fn borrow(&self, reference: &ServiceReference) -> Option<(ServiceObject, Borrowed)> {
        let result = match self.map.get(reference.id()) {
            Some(extender) => extender
                .get_service_for(self.consumer)
                .map(|service| (service, Borrowed::Extender(extender))),
            None => match self.context.get_service(reference) {
                Ok(Some(service)) => Ok((service, Borrowed::Host)),
                Ok(None) => Err(ExtenderError::AlreadyUnregistered {
                    service_id: reference.id(),
                }),
                Err(e) => Err(e.into()),
            },
        };
        match result {
            Ok(borrowed) => Some(borrowed),
            Err(e) => {
                debug!("跟踪 {} 时获取服务失败: {}", reference.id(), e);
                None
            }
        }
    }

    fn release(&self, reference: &ServiceReference, borrowed: Borrowed) {
        let result = match borrowed {
            Borrowed::Extender(extender) => extender.unget_service_for(self.consumer),
            Borrowed::Host => self.context.unget_service(reference).map_err(Into::into),
        };
        if let Err(e) = result {
            debug!("释放被跟踪的服务 {} 失败: {}", reference.id(), e);
        }
    }
}

impl TrackerCustomizer for TrackingAdapter {
    fn adding_service(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        let (service, borrowed) = self.borrow(reference)?;

        if let Some(customizer) = &self.customizer {
            if !customizer.adding(reference, &service) {
                self.release(reference, borrowed);
                return None;
            }
        }

        self.borrowed.lock().insert(reference.id(), borrowed);
        if let Some(hook) = &self.hook {
            hook.tracking_started(&self.event(reference.id()));
        }
        debug!("{} 开始跟踪 {}", self.consumer, reference.id());
        Some(service)
    }

    fn modified_service(&self, reference: &ServiceReference, service: &ServiceObject) {
        if let Some(customizer) = &self.customizer {
            customizer.modified(reference, service);
        }
    }

    fn removed_service(&self, reference: &ServiceReference, service: &ServiceObject) {
        if let Some(customizer) = &self.customizer {
            customizer.removed(reference, service);
        }

        let borrowed = self.borrowed.lock().remove(&reference.id());
        if let Some(borrowed) = borrowed {
            self.release(reference, borrowed);
        }

        if let Some(hook) = &self.hook {
            hook.tracking_ended(&self.event(reference.id()));
        }
        debug!("{} 结束跟踪 {}", self.consumer, reference.id());
    }
}
