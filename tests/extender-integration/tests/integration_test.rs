//! Extender 注册表集中集成测试
use anyhow::Result;
use extender_abstractions::{
    same_instance, InvocationResult, Invokable, ServiceEvent, ServiceEventKind, ServiceFactory,
    ServiceObject, TrackingEvent, TrackingHook,
};
use extender_common::{ExtenderError, ModuleId, ServiceId, ServiceScope, UnregisterState};
use extender_impl::{
    Extender, ExtenderFramework, ExtenderModuleListener, ExtenderRegistration, LocalHost,
    ModuleDefinition, RemovalHook,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// 测试服务
#[derive(Debug)]
struct Greeter {
    greeting: String,
}

impl Greeter {
    fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}

impl Invokable for Greeter {
    fn contracts(&self) -> Vec<String> {
        vec!["Greeter".to_string()]
    }

    fn call(&self, method: &str, _args: &[Value]) -> InvocationResult {
        match method {
            "greet" => Ok(json!(self.greeting)),
            other => Err(format!("未知方法 {}", other).into()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 每次调用都创建新实例的工厂
#[derive(Default)]
struct CountingFactory {
    created: AtomicUsize,
    released: AtomicUsize,
}

impl ServiceFactory for CountingFactory {
    fn get_service(
        &self,
        consumer: ModuleId,
        _registration: ServiceId,
    ) -> Result<ServiceObject, Box<dyn std::error::Error + Send + Sync>> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Greeter::new(format!("hi #{} for {}", n, consumer))))
    }

    fn unget_service(&self, _consumer: ModuleId, _registration: ServiceId, _service: &ServiceObject) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// 记录跟踪事件的钩子
#[derive(Default)]
struct RecordingHook {
    started: Mutex<Vec<TrackingEvent>>,
    ended: Mutex<Vec<TrackingEvent>>,
}

impl TrackingHook for RecordingHook {
    fn tracking_started(&self, event: &TrackingEvent) {
        self.started.lock().push(event.clone());
    }

    fn tracking_ended(&self, event: &TrackingEvent) {
        self.ended.lock().push(event.clone());
    }
}

/// 记录移除事件的回调
#[derive(Default)]
struct RecordingRemoval {
    events: Mutex<Vec<(ServiceId, ServiceEventKind)>>,
}

impl RemovalHook for RecordingRemoval {
    fn removing(&self, extender: &Arc<Extender>, event: &ServiceEvent) {
        self.events.lock().push((extender.id(), event.kind));
    }
}

fn start(host: &LocalHost, name: &str) -> Result<ModuleId> {
    let module = host.install_module(ModuleDefinition::new(name));
    host.start_module(module)?;
    Ok(module)
}

fn framework(host: &LocalHost) -> Result<ExtenderFramework> {
    Ok(ExtenderFramework::builder()
        .with_host(Arc::new(host.clone()))
        .build()?)
}

#[tokio::test]
async fn test_service_available_until_owner_stops() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer")?;

    framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .object(Arc::new(Greeter::new("hi"))),
    )?;

    let extension = framework.extension("Greeter", m2);
    let greeter = extension.get_service()?;
    assert_eq!(greeter.call("greet", &[]).map_err(|e| anyhow::anyhow!(e))?, json!("hi"));

    host.stop_module(m1)?;
    assert!(framework.map().is_empty());
    assert!(matches!(
        extension.get_service(),
        Err(ExtenderError::InvalidContext { module }) if module == m1
    ));

    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_prototype_returns_distinct_instances() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer-a")?;
    let m3 = start(&host, "consumer-b")?;
    let factory = Arc::new(CountingFactory::default());

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .prototype(factory.clone()),
    )?;
    assert_eq!(extender.scope(), ServiceScope::Prototype);

    let first = extender.get_service_for(m2)?;
    let second = extender.get_service_for(m2)?;
    assert!(!same_instance(&first, &second));

    // 其他模块首次获取得到宿主为其分配的实例
    let third = extender.get_service_for(m3)?;
    assert!(!same_instance(&first, &third));
    assert!(!same_instance(&second, &third));
    assert_eq!(host.use_count(extender.id(), m3), 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 3);

    assert!(extender.unget_service_for(m2)?);
    assert_eq!(factory.released.load(Ordering::SeqCst), 1);

    extender.unregister()?;
    assert_eq!(extender.state(), UnregisterState::Unregistered);
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_prototype_forgets_consumer_after_restart() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer")?;
    let factory = Arc::new(CountingFactory::default());

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .prototype(factory.clone()),
    )?;
    extender.get_service_for(m2)?;
    let minted = extender.get_service_for(m2)?;
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    // 停止时宿主实例与直接创建的实例都归还工厂
    host.stop_module(m2)?;
    assert_eq!(factory.released.load(Ordering::SeqCst), 2);
    assert_eq!(host.use_count(extender.id(), m2), 0);

    host.start_module(m2)?;
    let again = extender.get_service_for(m2)?;
    assert!(!same_instance(&again, &minted));
    assert_eq!(host.use_count(extender.id(), m2), 1);
    assert_eq!(factory.created.load(Ordering::SeqCst), 3);

    extender.unregister()?;
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_tracked_prototype_then_explicit_get_is_fresh() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer")?;
    let factory = Arc::new(CountingFactory::default());

    let extension = framework.extension("Greeter", m2);
    extension.open_service_tracker(None)?;
    framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .prototype(factory.clone()),
    )?;

    let tracked = extension.tracked_service().expect("服务应被跟踪");
    let explicit = extension.get_service()?;
    assert!(!same_instance(&tracked, &explicit));
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);

    assert!(extension.unget_service()?);
    extension.close_tracked_service();
    host.stop_module(m1)?;
    assert_eq!(factory.released.load(Ordering::SeqCst), 2);
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_module_scoped_instance_cached_per_consumer() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer-a")?;
    let m3 = start(&host, "consumer-b")?;
    let factory = Arc::new(CountingFactory::default());

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .factory(factory.clone()),
    )?;
    assert_eq!(extender.scope(), ServiceScope::ModuleScoped);

    let a1 = extender.get_service_for(m2)?;
    let a2 = extender.get_service_for(m2)?;
    let b = extender.get_service_for(m3)?;
    assert!(same_instance(&a1, &a2));
    assert!(!same_instance(&a1, &b));
    assert_eq!(host.use_count(extender.id(), m2), 2);

    assert!(extender.unget_service_for(m2)?);
    assert!(extender.unget_service_for(m2)?);
    assert_eq!(host.use_count(extender.id(), m2), 0);
    assert_eq!(factory.released.load(Ordering::SeqCst), 1);

    let a3 = extender.get_service_for(m2)?;
    assert!(!same_instance(&a1, &a3));

    host.stop_module(m1)?;
    framework.shutdown()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_singleton_access() -> Result<()> {
    let host = LocalHost::new();
    let framework = Arc::new(framework(&host)?);
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer")?;

    let shared: ServiceObject = Arc::new(Greeter::new("shared"));
    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .object(shared.clone()),
    )?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let framework = framework.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            framework.extension("Greeter", m2).get_service()
        }));
    }

    for handle in handles {
        let service = handle.await??;
        assert!(same_instance(&service, &shared));
    }
    assert_eq!(host.use_count(extender.id(), m2), 8);

    host.stop_module(m2)?;
    assert_eq!(host.use_count(extender.id(), m2), 0);
    extender.unregister()?;
    framework.shutdown()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregister_races_owner_stop() -> Result<()> {
    for _ in 0..32 {
        let host = LocalHost::new();
        let framework = framework(&host)?;
        let owner = start(&host, "provider")?;
        let extender = framework.register(
            ExtenderRegistration::new()
                .module(owner)
                .contract("Greeter")
                .object(Arc::new(Greeter::new("hi"))),
        )?;

        let racer = extender.clone();
        let explicit = tokio::task::spawn_blocking(move || racer.unregister());
        let stopping_host = host.clone();
        let stop = tokio::task::spawn_blocking(move || stopping_host.stop_module(owner));

        match explicit.await? {
            Ok(()) => {}
            Err(ExtenderError::AlreadyUnregistered { service_id }) => {
                assert_eq!(service_id, extender.id());
            }
            Err(e) => panic!("注销返回意外错误 {:?}", e),
        }
        stop.await??;

        assert_eq!(extender.state(), UnregisterState::Unregistered);
        assert!(framework.map().is_empty());
        assert!(framework.map().get_extenders(owner).is_empty());
        assert!(framework.map().get_by_contract("Greeter").is_none());
        assert_eq!(host.service_count(), 0);
        framework.shutdown()?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregister_and_sweep_exactly_one_wins() -> Result<()> {
    for _ in 0..32 {
        let host = LocalHost::new();
        let framework = framework(&host)?;
        let owner = start(&host, "provider")?;
        let extender = framework.register(
            ExtenderRegistration::new()
                .module(owner)
                .contract("Greeter")
                .object(Arc::new(Greeter::new("hi"))),
        )?;

        let racer = extender.clone();
        let explicit = tokio::task::spawn_blocking(move || racer.unregister());
        let sweeper = ExtenderModuleListener::new(framework.map().clone());
        let swept = tokio::task::spawn_blocking(move || sweeper.sweep(owner));

        let explicit_won = usize::from(explicit.await?.is_ok());
        assert_eq!(explicit_won + swept.await?, 1);
        assert!(framework.map().is_empty());
        assert!(framework.map().get_extenders(owner).is_empty());
        framework.shutdown()?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_keep_indices_consistent() -> Result<()> {
    let host = LocalHost::new();
    let framework = Arc::new(framework(&host)?);
    let done = Arc::new(AtomicBool::new(false));
    let mut owners = Vec::new();
    for i in 0..4 {
        owners.push(start(&host, &format!("provider-{}", i))?);
    }

    let mut readers = Vec::new();
    for _ in 0..2 {
        let framework = framework.clone();
        let done = done.clone();
        let owners = owners.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            while !done.load(Ordering::Acquire) {
                if let Some(extender) = framework.map().get_by_contract("Greeter") {
                    assert!(extender.has_contract("Greeter"));
                }
                for owner in &owners {
                    let owned = framework.map().get_extenders(*owner);
                    assert!(owned.iter().all(|e| e.owner() == *owner));
                }
            }
        }));
    }

    let mut writers = Vec::new();
    for owner in owners.clone() {
        let framework = framework.clone();
        writers.push(tokio::task::spawn_blocking(move || -> Result<()> {
            for n in 0..50 {
                let extender = framework.register(
                    ExtenderRegistration::new()
                        .module(owner)
                        .contract("Greeter")
                        .object(Arc::new(Greeter::new(format!("hi {}", n)))),
                )?;
                assert!(framework.map().get(extender.id()).is_some());
                extender.unregister()?;
                assert!(framework.map().get(extender.id()).is_none());
            }
            Ok(())
        }));
    }

    for writer in writers {
        writer.await??;
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.await?;
    }

    assert!(framework.map().is_empty());
    assert!(framework.map().contracts().is_empty());
    assert_eq!(host.service_count(), 0);
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_unregister_twice_fails() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .object(Arc::new(Greeter::new("hi"))),
    )?;

    extender.unregister()?;
    assert!(matches!(
        extender.unregister(),
        Err(ExtenderError::AlreadyUnregistered { service_id }) if service_id == extender.id()
    ));
    assert!(framework.map().is_empty());
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_stop_sweeps_owned_registrations() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let registrar = start(&host, "registrar")?;
    let owner = start(&host, "owner")?;

    // 注册者代替拥有者发布，清扫以拥有者为准
    for greeting in ["hi", "hello"] {
        framework.register(
            ExtenderRegistration::new()
                .owner(owner)
                .registrar(registrar)
                .contract("Greeter")
                .object(Arc::new(Greeter::new(greeting))),
        )?;
    }
    assert_eq!(framework.map().get_extenders(owner).len(), 2);
    assert_eq!(host.service_count(), 2);

    host.stop_module(owner)?;
    assert!(framework.map().is_empty());
    assert_eq!(host.service_count(), 0);
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_visibility_end_match_removes_extender() -> Result<()> {
    let host = LocalHost::new();
    let removal = Arc::new(RecordingRemoval::default());
    let framework = ExtenderFramework::builder()
        .with_host(Arc::new(host.clone()))
        .with_config(
            extender_common::ExtenderConfig::default().with_visibility_filter("(region=cn)"),
        )
        .with_removal_hook(removal.clone())
        .build()?;
    let m1 = start(&host, "provider")?;

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .object(Arc::new(Greeter::new("ni hao")))
            .property("region", json!("cn")),
    )?;

    extender.set_properties([("region".to_string(), json!("us"))].into_iter().collect())?;
    assert!(framework.map().is_empty());
    assert!(!extender.is_registered());
    assert_eq!(
        removal.events.lock().as_slice(),
        &[(extender.id(), ServiceEventKind::ModifiedEndMatch)]
    );

    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_tracking_hook_reports_lifecycle() -> Result<()> {
    let host = LocalHost::new();
    let hook = Arc::new(RecordingHook::default());
    let framework = ExtenderFramework::builder()
        .with_host(Arc::new(host.clone()))
        .with_tracking_hook(hook.clone())
        .build()?;
    let m1 = start(&host, "provider")?;
    let m2 = start(&host, "consumer")?;

    let extension = framework.extension("Greeter", m2);
    extension.open_service_tracker(None)?;
    assert!(extension.is_tracking());
    assert_eq!(extension.tracking_count(), 0);

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .object(Arc::new(Greeter::new("hi"))),
    )?;
    assert_eq!(extension.tracking_count(), 1);
    let tracked = extension.tracked_service().expect("服务应被跟踪");
    assert_eq!(tracked.call("greet", &[]).map_err(|e| anyhow::anyhow!(e))?, json!("hi"));

    {
        let started = hook.started.lock();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].contract, "Greeter");
        assert_eq!(started[0].consumer, m2);
        assert_eq!(started[0].service_id, extender.id());
    }

    host.stop_module(m1)?;
    assert_eq!(extension.tracking_count(), 0);
    {
        let ended = hook.ended.lock();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].service_id, extender.id());
        assert_eq!(ended[0].session, hook.started.lock()[0].session);
    }

    extension.close_tracked_service();
    assert!(!extension.is_tracking());
    framework.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_detects_leaks() -> Result<()> {
    let host = LocalHost::new();
    let framework = framework(&host)?;
    let m1 = start(&host, "provider")?;

    let extender = framework.register(
        ExtenderRegistration::new()
            .module(m1)
            .contract("Greeter")
            .object(Arc::new(Greeter::new("hi"))),
    )?;

    match framework.shutdown() {
        Err(ExtenderError::LeakedRegistrations { count, service_ids }) => {
            assert_eq!(count, 1);
            assert_eq!(service_ids, vec![extender.id()]);
        }
        other => panic!("应当报告泄漏，实际 {:?}", other),
    }
    Ok(())
}
