//! # SharedCounter：跨工作线程的单调序列号
//!
//! ## 核心意图（Why）
//! - 宿主为每个工作线程创建独立的扩展实例，实例之间唯一共享的可变资源是宿主托管的共享存储；
//! - 序列号必须全局唯一且严格递增，因此所有修改都经由“快照 → 计算 → 带版本戳提交”的乐观 CAS 协议，
//!   禁止不带版本戳的读改写（那正是并发丢失更新的根源）。
//!
//! ## 协议（How）
//! 1. 原子读取值与版本戳；
//! 2. 将十进制文本解析为整数并加一；
//! 3. 携带快照版本戳提交，宿主仅在期间无其他写者时接受，并签发新版本戳；
//! 4. 版本戳冲突属于常态竞争，静默重试（仅 `trace` 级日志）；
//! 5. 其他失败立即中止并返回 [`CounterError`]。
//!
//! ## 契约（What）
//! - 成功返回的值序列在全进程范围内严格递增 1 且互不重复；
//! - 重试次数受 [`RetryPolicy`] 约束，默认上限 [`RetryPolicy::DEFAULT_MAX_ATTEMPTS`]，
//!   耗尽时返回 [`CounterError::Contention`]，不会无限活锁；
//! - 存储编码沿用十进制文本，便于与其他读取同一键的扩展互通。
//!
//! ## 风险提示（Trade-offs）
//! - [`InitPolicy::IfAbsent`] 的“读-判空-写”不是原子操作：两个工作线程在冷启动时同时判空，
//!   随后一方已完成递增而另一方才写入初值，会把计数器拨回 0。窗口仅存在于首个请求之前，
//!   宿主 ABI 不提供“仅当不存在时写入”的原语，故无法彻底消除。

use core::num::NonZeroU32;

use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::abi::{HostStatus, SharedDataAbi, SharedValue};
use crate::error::CounterError;

/// 计数器初始化策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// 仅当共享键不存在时写入 `0`；已被其他工作线程推进的计数保持不变。
    #[default]
    IfAbsent,
    /// 每次工作线程启动都无条件写入 `0`。
    ///
    /// 宿主会为每个工作线程（甚至每种钩子）各触发一次启动事件，若启动事件与首批流量交错，
    /// 该策略会清零已推进的计数，仅在需要复现旧行为时使用。
    Reset,
}

/// 初始化结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    /// 本次调用写入了初值。
    Initialized,
    /// 键已存在，保留当前值。
    AlreadyInitialized { current: u64 },
    /// 原值无法解析为计数，已按快照版本戳改写为 `0`。
    Repaired { raw: String },
}

/// CAS 重试预算。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<NonZeroU32>,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 1024;

    /// 最多尝试 `max_attempts` 次（含首次）；传入 `0` 视为不设上限。
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: NonZeroU32::new(max_attempts),
        }
    }

    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts.map(NonZeroU32::get)
    }

    fn permits_retry_after(&self, attempts: u32) -> bool {
        self.max_attempts
            .is_none_or(|limit| attempts < limit.get())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(Self::DEFAULT_MAX_ATTEMPTS)
    }
}

/// 一次成功递增的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Increment {
    /// 本次提交的新值。
    pub value: u64,
    /// 完成提交所用的尝试次数；大于 1 表示期间遭遇过版本戳冲突。
    pub attempts: u32,
}

impl Increment {
    pub fn contended(&self) -> bool {
        self.attempts > 1
    }
}

/// 以共享存储中某个键为后端的 CAS 计数器。
///
/// # 教案式说明
/// - **意图 (Why)**：把“带版本戳的单元格”封装成唯一的修改入口，所有递增都汇入
///   [`increment`](Self::increment) 这一个重试循环；
/// - **契约 (What)**：本结构只保存键名与重试策略，不缓存任何值，可被每个工作线程各持一份；
/// - **风险 (Trade-offs)**：循环内不做退避：工作线程是单线程事件循环，睡眠会阻塞其他请求。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedCounter {
    key: String,
    retry: RetryPolicy,
}

impl SharedCounter {
    /// 原始扩展使用的共享键名。
    pub const DEFAULT_KEY: &'static str = "counter";

    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// 在工作线程启动时初始化计数器。
    ///
    /// 宿主可能对同一工作线程多次触发启动事件，本方法对重复调用是安全的：
    /// `IfAbsent` 下只有首个观察到空键的调用会写入。已有值无法解析时，
    /// 以快照版本戳改写为 `0`，否则后续每次递增都会失败；改写遭遇版本戳冲突说明
    /// 其他工作线程已先行写入，此时按新快照重新判定。
    pub fn initialize<S>(&self, store: &S, policy: InitPolicy) -> Result<InitOutcome, CounterError>
    where
        S: SharedDataAbi + ?Sized,
    {
        if policy == InitPolicy::IfAbsent {
            if let Some(snapshot) = store
                .get_shared_data(&self.key)
                .map_err(|status| self.storage(status))?
            {
                return match self.decode(&snapshot.value) {
                    Ok(current) => {
                        debug!(key = %self.key, current, "shared counter already initialized");
                        Ok(InitOutcome::AlreadyInitialized { current })
                    }
                    Err(_) => self.repair(store, &snapshot),
                };
            }
        }

        store
            .set_shared_data(&self.key, b"0", None)
            .map_err(|status| self.storage(status))?;
        debug!(key = %self.key, ?policy, "shared counter initialized to 0");
        Ok(InitOutcome::Initialized)
    }

    fn repair<S>(&self, store: &S, snapshot: &SharedValue) -> Result<InitOutcome, CounterError>
    where
        S: SharedDataAbi + ?Sized,
    {
        let raw = String::from_utf8_lossy(&snapshot.value).into_owned();
        match store.set_shared_data(&self.key, b"0", Some(snapshot.stamp)) {
            Ok(()) => {
                warn!(key = %self.key, raw = %raw, "corrupt shared counter reset to 0");
                Ok(InitOutcome::Repaired { raw })
            }
            Err(HostStatus::CasMismatch) => {
                debug!(key = %self.key, "corrupt shared counter rewritten concurrently");
                match self.current(store)? {
                    Some(current) => Ok(InitOutcome::AlreadyInitialized { current }),
                    None => self.initialize(store, InitPolicy::IfAbsent),
                }
            }
            Err(status) => Err(self.storage(status)),
        }
    }

    /// 读取当前值；键不存在时返回 `Ok(None)`。
    pub fn current<S>(&self, store: &S) -> Result<Option<u64>, CounterError>
    where
        S: SharedDataAbi + ?Sized,
    {
        match store
            .get_shared_data(&self.key)
            .map_err(|status| self.storage(status))?
        {
            Some(snapshot) => self.decode(&snapshot.value).map(Some),
            None => Ok(None),
        }
    }

    /// 递增并返回新值。
    pub fn increment_and_get<S>(&self, store: &S) -> Result<u64, CounterError>
    where
        S: SharedDataAbi + ?Sized,
    {
        self.increment(store).map(|increment| increment.value)
    }

    /// CAS 重试循环本体，返回新值与尝试次数。
    pub fn increment<S>(&self, store: &S) -> Result<Increment, CounterError>
    where
        S: SharedDataAbi + ?Sized,
    {
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);

            let snapshot = store
                .get_shared_data(&self.key)
                .map_err(|status| self.storage(status))?
                .ok_or_else(|| self.storage(HostStatus::NotFound))?;
            let next = self
                .decode(&snapshot.value)?
                .checked_add(1)
                .ok_or_else(|| CounterError::Overflow {
                    key: self.key.clone(),
                })?;

            match store.set_shared_data(&self.key, next.to_string().as_bytes(), Some(snapshot.stamp))
            {
                Ok(()) => {
                    trace!(key = %self.key, value = next, attempts, "shared counter committed");
                    return Ok(Increment {
                        value: next,
                        attempts,
                    });
                }
                Err(HostStatus::CasMismatch) => {
                    trace!(key = %self.key, attempts, stamp = %snapshot.stamp, "cas stamp mismatch, retrying");
                    if !self.retry.permits_retry_after(attempts) {
                        return Err(CounterError::Contention {
                            key: self.key.clone(),
                            attempts,
                        });
                    }
                }
                Err(status) => return Err(self.storage(status)),
            }
        }
    }

    fn decode(&self, raw: &[u8]) -> Result<u64, CounterError> {
        core::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| CounterError::Corrupt {
                key: self.key.clone(),
                raw: String::from_utf8_lossy(raw).into_owned(),
            })
    }

    fn storage(&self, status: HostStatus) -> CounterError {
        CounterError::Storage {
            key: self.key.clone(),
            status,
        }
    }
}

impl Default for SharedCounter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_KEY)
    }
}
