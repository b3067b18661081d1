//! 服务跟踪回调

use crate::host::ServiceReference;
use crate::invokable::ServiceObject;
use extender_common::{ModuleId, ServiceId};
use serde::{Deserialize, Serialize};

/// 跟踪事件
///
/// 报告给外部生命周期钩子，告知消费者其依赖的服务开始或结束被跟踪
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    /// 跟踪会话标识
    pub session: uuid::Uuid,
    /// 契约名称
    pub contract: String,
    /// 消费模块
    pub consumer: ModuleId,
    /// 被跟踪的注册
    pub service_id: ServiceId,
    /// 事件时间
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TrackingEvent {
    /// 创建跟踪事件
    pub fn new(
        session: uuid::Uuid,
        contract: impl Into<String>,
        consumer: ModuleId,
        service_id: ServiceId,
    ) -> Self {
        Self {
            session,
            contract: contract.into(),
            consumer,
            service_id,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// 外部生命周期钩子
pub trait TrackingHook: Send + Sync {
    /// 服务开始被跟踪
    fn tracking_started(&self, event: &TrackingEvent);

    /// 服务结束跟踪（注销、不再可见或跟踪关闭）
    fn tracking_ended(&self, event: &TrackingEvent);
}

/// 服务跟踪定制器
///
/// `adding_service` 返回 `None` 表示不跟踪该服务
pub trait TrackerCustomizer: Send + Sync {
    /// 新服务进入跟踪范围
    fn adding_service(&self, reference: &ServiceReference) -> Option<ServiceObject>;

    /// 被跟踪服务的属性变更
    fn modified_service(&self, _reference: &ServiceReference, _service: &ServiceObject) {}

    /// 被跟踪服务离开跟踪范围
    fn removed_service(&self, reference: &ServiceReference, service: &ServiceObject);
}

/// 扩展点定制器
///
/// 由 `Extension` 的跟踪在获取服务之后回调，可以拒绝跟踪某个服务
pub trait ExtensionCustomizer: Send + Sync {
    /// 服务已获取，返回 `false` 时放弃跟踪并释放服务
    fn adding(&self, _reference: &ServiceReference, _service: &ServiceObject) -> bool {
        true
    }

    /// 被跟踪服务的属性变更
    fn modified(&self, _reference: &ServiceReference, _service: &ServiceObject) {}

    /// 服务离开跟踪范围
    fn removed(&self, _reference: &ServiceReference, _service: &ServiceObject) {}
}
