//! 元数据定义
//!
//! 提供模块标识、注册标识以及服务属性的保留键

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 服务注册属性
pub type Properties = BTreeMap<String, Value>;

/// 契约名称列表（宿主维护）
pub const OBJECT_CLASS: &str = "objectClass";
/// 注册标识（宿主维护）
pub const SERVICE_ID: &str = "service.id";
/// 服务排名
pub const SERVICE_RANKING: &str = "service.ranking";
/// 服务作用域
pub const EXTENDER_SCOPE: &str = "extender.scope";
/// 拥有者模块
pub const EXTENDER_OWNER: &str = "extender.owner";
/// 注册者模块
pub const EXTENDER_REGISTRAR: &str = "extender.registrar";

/// 模块标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

impl ModuleId {
    /// 获取原始值
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// 注册标识
///
/// 由宿主运行时单调分配，不透明且唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl ServiceId {
    /// 获取原始值
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service#{}", self.0)
    }
}

/// 读取服务排名，缺省或非整数时为 0
pub fn ranking_of(properties: &Properties) -> i64 {
    properties
        .get(SERVICE_RANKING)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// 读取契约名称列表
pub fn contracts_of(properties: &Properties) -> Vec<String> {
    match properties.get(OBJECT_CLASS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    }
}

/// 契约名称去重，保留首次出现的顺序
pub fn dedup_contracts<I, S>(contracts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut result: Vec<String> = Vec::new();
    for contract in contracts {
        let contract = contract.into();
        let trimmed = contract.trim();
        if trimmed.is_empty() || result.iter().any(|c| c == trimmed) {
            continue;
        }
        result.push(trimmed.to_string());
    }
    result
}

/// 是否为宿主或注册表保留的属性键
pub fn is_reserved_key(key: &str) -> bool {
    matches!(
        key,
        OBJECT_CLASS | SERVICE_ID | EXTENDER_SCOPE | EXTENDER_OWNER | EXTENDER_REGISTRAR
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedup_contracts_keeps_first_order() {
        let contracts = dedup_contracts(["Greeter", "Logger", "Greeter", " ", "Logger "]);
        assert_eq!(contracts, vec!["Greeter".to_string(), "Logger".to_string()]);
    }

    #[test]
    fn test_ranking_defaults_to_zero() {
        let mut properties = Properties::new();
        assert_eq!(ranking_of(&properties), 0);

        properties.insert(SERVICE_RANKING.to_string(), json!("high"));
        assert_eq!(ranking_of(&properties), 0);

        properties.insert(SERVICE_RANKING.to_string(), json!(10));
        assert_eq!(ranking_of(&properties), 10);
    }

    #[test]
    fn test_contracts_of_accepts_array_and_string() {
        let mut properties = Properties::new();
        properties.insert(OBJECT_CLASS.to_string(), json!(["A", "B"]));
        assert_eq!(contracts_of(&properties), vec!["A", "B"]);

        properties.insert(OBJECT_CLASS.to_string(), json!("C"));
        assert_eq!(contracts_of(&properties), vec!["C"]);
    }

    #[test]
    fn test_display_ids() {
        assert_eq!(ModuleId(3).to_string(), "module#3");
        assert_eq!(ServiceId(7).to_string(), "service#7");
        assert!(is_reserved_key(SERVICE_ID));
        assert!(!is_reserved_key(SERVICE_RANKING));
    }
}
