//! Extender 注册表
//!
//! 主索引按注册标识，辅助索引按契约名称与拥有者模块。三个视图在同一把锁下更新。

use crate::extender::Extender;
use extender_abstractions::Filter;
use extender_common::{ExtenderError, ExtenderResult, ModuleId, ServiceId};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Default)]
struct MapState {
    by_id: HashMap<ServiceId, Arc<Extender>>,
    by_contract: HashMap<String, BTreeSet<ServiceId>>,
    by_owner: HashMap<ModuleId, BTreeSet<ServiceId>>,
}

impl MapState {
    fn index(&mut self, id: ServiceId, extender: &Extender) {
        for contract in extender.contracts() {
            self.by_contract.entry(contract.clone()).or_default().insert(id);
        }
        self.by_owner.entry(extender.owner()).or_default().insert(id);
    }

    fn unindex(&mut self, id: ServiceId, extender: &Extender) {
        for contract in extender.contracts() {
            if let Some(ids) = self.by_contract.get_mut(contract) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_contract.remove(contract);
                }
            }
        }
        if let Some(ids) = self.by_owner.get_mut(&extender.owner()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_owner.remove(&extender.owner());
            }
        }
    }

    fn with_contract(&self, contract: &str) -> Vec<Arc<Extender>> {
        self.by_contract
            .get(contract)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// 排名高者在前，排名相同时标识小者在前
fn precedence(a: &Arc<Extender>, b: &Arc<Extender>) -> Ordering {
    b.ranking()
        .cmp(&a.ranking())
        .then_with(|| a.id().cmp(&b.id()))
}

/// Extender 注册表
#[derive(Default)]
pub struct ExtenderServiceMap {
    state: RwLock<MapState>,
}

impl std::fmt::Debug for ExtenderServiceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("ExtenderServiceMap")
            .field("extenders", &state.by_id.len())
            .field("contracts", &state.by_contract.len())
            .field("owners", &state.by_owner.len())
            .finish()
    }
}

impl ExtenderServiceMap {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 按注册标识查找
    pub fn get(&self, id: ServiceId) -> Option<Arc<Extender>> {
        self.state.read().by_id.get(&id).cloned()
    }

    /// 按契约名称查找排名最高者
    pub fn get_by_contract(&self, contract: &str) -> Option<Arc<Extender>> {
        self.state
            .read()
            .with_contract(contract)
            .into_iter()
            .min_by(precedence)
    }

    /// 按契约名称与过滤器查找全部匹配者，按排名排序
    pub fn get_filtered(&self, contract: &str, filter: Option<&Filter>) -> Vec<Arc<Extender>> {
        let mut matches: Vec<Arc<Extender>> = self
            .state
            .read()
            .with_contract(contract)
            .into_iter()
            .filter(|extender| filter.map_or(true, |f| f.matches(&extender.properties())))
            .collect();
        matches.sort_by(precedence);
        matches
    }

    /// 拥有者模块的全部 Extender
    pub fn get_extenders(&self, owner: ModuleId) -> Vec<Arc<Extender>> {
        let state = self.state.read();
        state
            .by_owner
            .get(&owner)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// 放入注册表，返回被替换的旧值
    pub fn put(&self, id: ServiceId, extender: Arc<Extender>) -> Option<Arc<Extender>> {
        let mut state = self.state.write();
        let previous = state.by_id.insert(id, extender.clone());
        if let Some(previous) = &previous {
            state.unindex(id, previous);
        }
        state.index(id, &extender);
        debug!("注册表加入: {} {:?}", id, extender.contracts());
        previous
    }

    /// 按注册标识移除
    pub fn remove(&self, id: ServiceId) -> Option<Arc<Extender>> {
        let mut state = self.state.write();
        let removed = state.by_id.remove(&id);
        if let Some(extender) = &removed {
            state.unindex(id, extender);
            debug!("注册表移除: {} {:?}", id, extender.contracts());
        }
        removed
    }

    /// 移除指定 Extender，仅当注册表中保存的正是该实例
    pub fn remove_extender(&self, extender: &Arc<Extender>) -> bool {
        let mut state = self.state.write();
        let id = extender.id();
        let matches = state
            .by_id
            .get(&id)
            .map_or(false, |stored| Arc::ptr_eq(stored, extender));
        if matches {
            state.by_id.remove(&id);
            state.unindex(id, extender);
            debug!("注册表移除: {} {:?}", id, extender.contracts());
        }
        matches
    }

    /// 关闭时检查是否仍有未注销的注册
    pub fn validate_unregister(&self) -> ExtenderResult<()> {
        let state = self.state.read();
        if state.by_id.is_empty() {
            return Ok(());
        }

        let mut service_ids: Vec<ServiceId> = state.by_id.keys().copied().collect();
        service_ids.sort();
        for id in &service_ids {
            if let Some(extender) = state.by_id.get(id) {
                error!(
                    "未注销的注册: {} {:?} (拥有者 {}, 注册于 {})",
                    id,
                    extender.contracts(),
                    extender.owner(),
                    extender.registered_at().to_rfc3339()
                );
            }
        }
        Err(ExtenderError::LeakedRegistrations {
            count: service_ids.len(),
            service_ids,
        })
    }

    /// 注册数量
    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.state.read().by_id.is_empty()
    }

    /// 全部 Extender 的快照，按注册标识排序
    pub fn extenders(&self) -> Vec<Arc<Extender>> {
        let mut extenders: Vec<Arc<Extender>> = self.state.read().by_id.values().cloned().collect();
        extenders.sort_by_key(|extender| extender.id());
        extenders
    }

    /// 当前有注册的契约名称
    pub fn contracts(&self) -> Vec<String> {
        let mut contracts: Vec<String> = self.state.read().by_contract.keys().cloned().collect();
        contracts.sort();
        contracts
    }
}
