//! 进程内名称租约与源虚拟机锁
//!
//! 管理服务器本身不提供名称互斥。同一进程内并发运行的流水线通过租约
//! 登记正在使用的目标名称，通过源锁串行化针对同一源虚拟机的克隆。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type LeaseSet = Arc<Mutex<HashSet<String>>>;

fn lock_set(set: &LeaseSet) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 名称租约登记表
#[derive(Debug, Clone, Default)]
pub struct NameLeases {
    leased: LeaseSet,
}

impl NameLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取名称租约，名称已被租用时返回 `None`
    pub fn try_acquire(&self, name: &str) -> Option<NameLease> {
        let mut leased = lock_set(&self.leased);
        if !leased.insert(name.to_string()) {
            return None;
        }
        debug!("获取名称租约: {}", name);
        Some(NameLease {
            name: name.to_string(),
            registry: Arc::clone(&self.leased),
        })
    }

    pub fn is_leased(&self, name: &str) -> bool {
        lock_set(&self.leased).contains(name)
    }

    /// 当前租用中的名称数量
    pub fn len(&self) -> usize {
        lock_set(&self.leased).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 名称租约，释放时自动归还
#[derive(Debug)]
pub struct NameLease {
    name: String,
    registry: LeaseSet,
}

impl NameLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameLease {
    fn drop(&mut self) {
        lock_set(&self.registry).remove(&self.name);
        debug!("释放名称租约: {}", self.name);
    }
}

/// 源虚拟机锁
///
/// 每个源名称一把异步互斥锁，持有期间覆盖整条克隆流水线。
#[derive(Debug, Clone, Default)]
pub struct SourceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 等待并获取源虚拟机锁
    pub async fn lock(&self, source: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(source.to_string()).or_default())
        };
        debug!("等待源虚拟机锁: {}", source);
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lease_released_on_drop() {
        let leases = NameLeases::new();
        let lease = leases.try_acquire("clone-01").unwrap();
        assert_eq!(lease.name(), "clone-01");
        assert!(leases.is_leased("clone-01"));
        assert!(leases.try_acquire("clone-01").is_none());

        drop(lease);
        assert!(!leases.is_leased("clone-01"));
        assert!(leases.is_empty());
    }

    #[test]
    fn test_leases_shared_between_clones() {
        let leases = NameLeases::new();
        let shared = leases.clone();
        let _lease = leases.try_acquire("a").unwrap();
        assert!(shared.is_leased("a"));
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn test_source_lock_serializes() {
        let locks = SourceLocks::new();
        let guard = locks.lock("master").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock("master").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // 不同源互不影响
        let _agent = locks.lock("agent1").await;

        drop(guard);
        waiter.await.unwrap();
    }
}
