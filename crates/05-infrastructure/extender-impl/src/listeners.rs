//! 宿主事件监听器
//!
//! - [`ExtenderServiceListener`]：注册消失或不再可见时从注册表移除 Extender
//! - [`ExtenderModuleListener`]：模块停止时注销其拥有的全部 Extender，
//!   并清除各 Extender 为该模块保留的消费状态

use crate::extender::Extender;
use crate::service_map::ExtenderServiceMap;
use extender_abstractions::{
    ModuleEvent, ModuleEventKind, ModuleListener, ServiceEvent, ServiceEventKind, ServiceListener,
};
use extender_common::{ExtenderError, ModuleId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 移除回调
///
/// Extender 从注册表移除之前调用
pub trait RemovalHook: Send + Sync {
    /// 即将移除
    fn removing(&self, extender: &Arc<Extender>, event: &ServiceEvent);
}

/// Extender 服务监听器
pub struct ExtenderServiceListener {
    map: Arc<ExtenderServiceMap>,
    hook: Option<Arc<dyn RemovalHook>>,
}

impl ExtenderServiceListener {
    /// 创建服务监听器
    pub fn new(map: Arc<ExtenderServiceMap>) -> Self {
        Self { map, hook: None }
    }

    /// 设置移除回调
    pub fn with_hook(mut self, hook: Arc<dyn RemovalHook>) -> Self {
        self.hook = Some(hook);
        self
    }
}

impl ServiceListener for ExtenderServiceListener {
    fn service_changed(&self, event: &ServiceEvent) {
        if !event.is_removal() {
            return;
        }

        let id = event.reference.id();
        let Some(extender) = self.map.get(id) else {
            return;
        };

        if let Some(hook) = &self.hook {
            hook.removing(&extender, event);
        }

        match event.kind {
            ServiceEventKind::ModifiedEndMatch => {
                // 不再可见的注册同时撤回宿主注册
                debug!("服务 {} 不再匹配可见性过滤器", id);
                if let Err(e) = extender.unregister() {
                    debug!("撤回不可见的服务 {} 跳过: {}", id, e);
                }
            }
            _ => {
                if extender.retire() {
                    info!("服务 {} 已在外部注销", id);
                }
            }
        }

        if self.map.remove_extender(&extender) {
            debug!("服务监听器移除 {} {:?}", id, extender.contracts());
        }
    }

    fn name(&self) -> &str {
        "ExtenderServiceListener"
    }
}

/// Extender 模块监听器
pub struct ExtenderModuleListener {
    map: Arc<ExtenderServiceMap>,
}

impl ExtenderModuleListener {
    /// 创建模块监听器
    pub fn new(map: Arc<ExtenderServiceMap>) -> Self {
        Self { map }
    }

    /// 注销模块拥有的全部 Extender，返回本次成功注销的数量
    ///
    /// 失败只记录日志，不会传播给停止模块的线程
    pub fn sweep(&self, module: ModuleId) -> usize {
        let extenders = self.map.get_extenders(module);
        if extenders.is_empty() {
            return 0;
        }

        info!("清扫模块 {} 的 {} 个注册", module, extenders.len());
        let mut unregistered = 0;
        for extender in extenders {
            match extender.unregister() {
                Ok(()) => unregistered += 1,
                Err(ExtenderError::AlreadyUnregistered { service_id }) => {
                    debug!("清扫时 {} 已注销", service_id);
                }
                Err(e) => {
                    warn!("清扫时注销 {} 失败: {}", extender.id(), e);
                }
            }
        }
        info!("模块 {} 清扫完成，注销 {} 个注册", module, unregistered);
        unregistered
    }

    /// 让每个 Extender 忘记已停止的消费模块
    pub fn release_consumer(&self, module: ModuleId) {
        for extender in self.map.extenders() {
            extender.release_consumer(module);
        }
    }
}

impl ModuleListener for ExtenderModuleListener {
    fn module_changed(&self, event: &ModuleEvent) {
        if event.is_stop() {
            self.sweep(event.module);
        }
        if event.kind == ModuleEventKind::Stopped {
            self.release_consumer(event.module);
        }
    }

    fn name(&self) -> &str {
        "ExtenderModuleListener"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extender::{ExtenderRegistration, RegistrationPolicy};
    use crate::host::{LocalHost, ModuleDefinition};
    use extender_abstractions::{
        Filter, HostRuntime, Invokable, InvocationResult, ServiceObject,
    };
    use extender_common::{Properties, EXTENDER_OWNER};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::any::Any;

    #[derive(Debug)]
    struct Beacon;

    impl Invokable for Beacon {
        fn contracts(&self) -> Vec<String> {
            vec!["Beacon".to_string()]
        }

        fn call(&self, _method: &str, _args: &[Value]) -> InvocationResult {
            Ok(Value::Null)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        removed: Mutex<Vec<(ServiceEventKind, u64)>>,
    }

    impl RemovalHook for RecordingHook {
        fn removing(&self, extender: &Arc<Extender>, event: &ServiceEvent) {
            self.removed.lock().push((event.kind, extender.id().value()));
        }
    }

    struct Fixture {
        host: LocalHost,
        runtime: Arc<dyn HostRuntime>,
        map: Arc<ExtenderServiceMap>,
        hook: Arc<RecordingHook>,
        m1: ModuleId,
    }

    fn fixture(visibility: &str) -> Fixture {
        let host = LocalHost::new();
        let map = Arc::new(ExtenderServiceMap::new());
        let hook = Arc::new(RecordingHook::default());
        let system = host.system_context();
        system
            .add_service_listener(
                Arc::new(ExtenderServiceListener::new(map.clone()).with_hook(hook.clone())),
                Some(Filter::parse(visibility).unwrap()),
            )
            .unwrap();
        system
            .add_module_listener(Arc::new(ExtenderModuleListener::new(map.clone())))
            .unwrap();

        let m1 = host.install_module(ModuleDefinition::new("m1"));
        host.start_module(m1).unwrap();
        Fixture {
            runtime: Arc::new(host.clone()),
            host,
            map,
            hook,
            m1,
        }
    }

    fn register(fx: &Fixture) -> Arc<Extender> {
        Extender::register(
            fx.runtime.clone(),
            &fx.map,
            ExtenderRegistration::new()
                .module(fx.m1)
                .contract("Beacon")
                .object(Arc::new(Beacon) as ServiceObject),
            &RegistrationPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_unregister_removes_from_map() {
        let fx = fixture("(extender.owner=*)");
        let extender = register(&fx);
        assert_eq!(fx.map.len(), 1);

        extender.unregister().unwrap();
        assert!(fx.map.is_empty());
        assert_eq!(
            *fx.hook.removed.lock(),
            vec![(ServiceEventKind::Unregistering, extender.id().value())]
        );
    }

    #[test]
    fn test_module_stop_sweeps_owned_extenders() {
        let fx = fixture("(extender.owner=*)");
        let a = register(&fx);
        let b = register(&fx);

        fx.host.stop_module(fx.m1).unwrap();
        assert!(fx.map.is_empty());
        assert!(fx.map.get_extenders(fx.m1).is_empty());
        assert!(fx.map.get_by_contract("Beacon").is_none());
        assert!(!a.is_registered());
        assert!(!b.is_registered());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let fx = fixture("(extender.owner=*)");
        let extender = register(&fx);
        let listener = ExtenderModuleListener::new(fx.map.clone());

        // 注销后监听器已移除，再次清扫找不到任何注册
        extender.unregister().unwrap();
        assert_eq!(listener.sweep(fx.m1), 0);
    }

    #[test]
    fn test_end_match_removes_and_unregisters() {
        let fx = fixture("(&(extender.owner=*)(!(hidden=true)))");
        let extender = register(&fx);

        let mut properties = Properties::new();
        properties.insert("hidden".to_string(), json!(true));
        extender.set_properties(properties).unwrap();

        assert!(fx.map.is_empty());
        assert!(!extender.is_registered());
        assert_eq!(fx.host.service_count(), 0);
        assert_eq!(fx.hook.removed.lock()[0].0, ServiceEventKind::ModifiedEndMatch);
    }

    #[test]
    fn test_foreign_registrations_are_ignored() {
        let fx = fixture("(extender.owner=*)");
        let context = fx.host.context(fx.m1).unwrap();
        let registration = context
            .register_service(
                &["Beacon".to_string()],
                extender_abstractions::HostService::Object(Arc::new(Beacon)),
                Properties::new(),
            )
            .unwrap();
        registration.unregister().unwrap();
        assert!(fx.hook.removed.lock().is_empty());

        let extender = register(&fx);
        assert!(extender.properties().contains_key(EXTENDER_OWNER));
    }
}
