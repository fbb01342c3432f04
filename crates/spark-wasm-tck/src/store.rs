//! # SharedStore：进程级共享数据的内存实现
//!
//! ## 核心意图（Why）
//! - 模拟宿主托管、所有工作线程可见的键值存储，并忠实复现其 CAS 语义，
//!   让计数器协议在真实的多线程竞争下接受检验。
//!
//! ## 行为契约（What）
//! - 每次成功写入都签发新的版本戳（从 1 开始单调递增，`0` 保留不用）；
//! - 携带版本戳写入已存在的键时，戳不匹配返回 [`HostStatus::CasMismatch`]；
//! - 写入不存在的键时忽略版本戳直接插入，与 Envoy 的行为一致；
//! - 检查与写入在 `DashMap` 同一分片的写锁内完成，因此对同一键是原子的。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` 分片锁只保护单键，本存储不提供跨键事务，宿主 ABI 本身也不提供。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use spark_wasm_core::{CasStamp, HostStatus, SharedDataAbi, SharedValue};

#[derive(Debug)]
struct Cell {
    value: Bytes,
    stamp: CasStamp,
}

/// 进程级共享存储。
#[derive(Debug)]
pub struct SharedStore {
    cells: DashMap<String, Cell>,
    next_stamp: AtomicU32,
    commits: AtomicU64,
    mismatches: AtomicU64,
    write_fault: Mutex<Option<HostStatus>>,
    read_fault: Mutex<Option<HostStatus>>,
    interference: AtomicU32,
}

impl Default for SharedStore {
    fn default() -> Self {
        Self {
            cells: DashMap::new(),
            next_stamp: AtomicU32::new(1),
            commits: AtomicU64::new(0),
            mismatches: AtomicU64::new(0),
            write_fault: Mutex::new(None),
            read_fault: Mutex::new(None),
            interference: AtomicU32::new(0),
        }
    }
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取键的原始文本，供断言使用。
    pub fn raw(&self, key: &str) -> Option<String> {
        self.cells
            .get(key)
            .map(|cell| String::from_utf8_lossy(&cell.value).into_owned())
    }

    /// 成功提交的写入次数。
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// 被拒绝的 CAS 写入次数。
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Acquire)
    }

    /// 注入持续性的写入故障；`None` 解除。
    pub fn set_write_fault(&self, fault: Option<HostStatus>) {
        *self.write_fault.lock() = fault;
    }

    /// 注入持续性的读取故障；`None` 解除。
    pub fn set_read_fault(&self, fault: Option<HostStatus>) {
        *self.read_fault.lock() = fault;
    }

    /// 令接下来 `count` 次带版本戳的写入之前，先有一个“其他写者”以相同值提交。
    ///
    /// 用于在单线程测试中确定性地制造版本戳冲突。
    pub fn interfere(&self, count: u32) {
        self.interference.store(count, Ordering::Release);
    }

    fn take_interference(&self) -> bool {
        self.interference
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }

    fn issue_stamp(&self) -> CasStamp {
        CasStamp::new(self.next_stamp.fetch_add(1, Ordering::AcqRel))
    }
}

impl SharedDataAbi for SharedStore {
    fn get_shared_data(&self, key: &str) -> Result<Option<SharedValue>, HostStatus> {
        if let Some(status) = *self.read_fault.lock() {
            return Err(status);
        }
        Ok(self
            .cells
            .get(key)
            .map(|cell| SharedValue::new(cell.value.clone(), cell.stamp)))
    }

    fn set_shared_data(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<CasStamp>,
    ) -> Result<(), HostStatus> {
        if let Some(status) = *self.write_fault.lock() {
            return Err(status);
        }
        match self.cells.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if expected.is_some() && self.take_interference() {
                    occupied.get_mut().stamp = self.issue_stamp();
                    self.commits.fetch_add(1, Ordering::AcqRel);
                }
                if let Some(expected) = expected {
                    if occupied.get().stamp != expected {
                        self.mismatches.fetch_add(1, Ordering::AcqRel);
                        return Err(HostStatus::CasMismatch);
                    }
                }
                occupied.insert(Cell {
                    value: Bytes::copy_from_slice(value),
                    stamp: self.issue_stamp(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Cell {
                    value: Bytes::copy_from_slice(value),
                    stamp: self.issue_stamp(),
                });
            }
        }
        self.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_stamp_is_rejected() {
        let store = SharedStore::new();
        store.set_shared_data("k", b"1", None).unwrap();
        let first = store.get_shared_data("k").unwrap().unwrap();

        store
            .set_shared_data("k", b"2", Some(first.stamp))
            .expect("fresh stamp commits");
        assert_eq!(
            store.set_shared_data("k", b"3", Some(first.stamp)),
            Err(HostStatus::CasMismatch)
        );
        assert_eq!(store.raw("k").as_deref(), Some("2"));
        assert_eq!(store.mismatches(), 1);
        assert_eq!(store.commits(), 2);
    }

    #[test]
    fn every_commit_issues_a_new_stamp() {
        let store = SharedStore::new();
        store.set_shared_data("k", b"1", None).unwrap();
        let a = store.get_shared_data("k").unwrap().unwrap().stamp;
        store.set_shared_data("k", b"1", None).unwrap();
        let b = store.get_shared_data("k").unwrap().unwrap().stamp;
        assert_ne!(a, b);
        assert_ne!(a.get(), 0);
    }

    #[test]
    fn interference_forces_one_mismatch_per_unit() {
        let store = SharedStore::new();
        store.set_shared_data("k", b"1", None).unwrap();
        store.interfere(1);

        let snapshot = store.get_shared_data("k").unwrap().unwrap();
        assert_eq!(
            store.set_shared_data("k", b"2", Some(snapshot.stamp)),
            Err(HostStatus::CasMismatch)
        );
        let retry = store.get_shared_data("k").unwrap().unwrap();
        assert_eq!(retry.value, Bytes::from_static(b"1"));
        store
            .set_shared_data("k", b"2", Some(retry.stamp))
            .expect("interference exhausted");
    }

    #[test]
    fn faults_are_reported_verbatim() {
        let store = SharedStore::new();
        store.set_write_fault(Some(HostStatus::InternalFailure));
        assert_eq!(
            store.set_shared_data("k", b"1", None),
            Err(HostStatus::InternalFailure)
        );
        store.set_write_fault(None);
        store.set_read_fault(Some(HostStatus::SerializationFailure));
        assert_eq!(
            store.get_shared_data("k"),
            Err(HostStatus::SerializationFailure)
        );
    }
}
