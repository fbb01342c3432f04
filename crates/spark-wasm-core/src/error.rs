//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义扩展在配置、出站调用、响应合成、上下文重绑定与共享存储上的失败语义；
//! - 区分“可本地恢复”（合成诊断响应）与“需上报”（实例不可用、计数失败）两类路径，
//!   避免误导调用方的重试策略。
//!
//! ## 设计要求（What）
//! - 所有错误派生 `thiserror::Error`，消息为稳定的小写英文短语，便于宿主日志检索；
//! - [`ExtensionError::code`] 提供点分稳定错误码，供观测与告警聚合；
//! - CAS 版本戳冲突不是错误：它在 [`SharedCounter`](crate::counter::SharedCounter) 内部被消化为重试，
//!   只有重试预算耗尽时才以 [`CounterError::Contention`] 浮出。

use thiserror::Error;

use crate::abi::HostStatus;
use crate::ids::{CallToken, ContextId};

/// 配置解析失败。实例随即进入拒绝态，宿主不应再向其派发请求。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 配置缓冲区为空，而扩展要求显式配置。
    #[error("configuration buffer is empty")]
    Empty,

    /// 无法从宿主读取配置缓冲区。
    #[error("configuration buffer unreadable: {status}")]
    Unreadable { status: HostStatus },

    /// 缓冲区不是合法的结构化配置（编码或语法错误、未知字段、类型不符）。
    #[error("malformed configuration: {detail}")]
    Malformed { detail: String },

    /// 结构合法但字段取值违反约束。
    #[error("invalid configuration field `{field}`: {detail}")]
    Invalid { field: &'static str, detail: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, detail: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            detail: detail.into(),
        }
    }
}

/// 出站调用未被受理。
///
/// # 教案式说明
/// - **意图 (Why)**：宿主拒绝调用（资源耗尽、上游不存在）时，请求上下文需要立即合成 500 响应，
///   而不是让原始响应悬挂；
/// - **契约 (What)**：任一变体出现时，上下文都不会进入等待出站响应的状态；
/// - **风险 (Trade-offs)**：`AlreadyOutstanding` 代表扩展自身违反“每上下文至多一个在途调用”的约束，
///   出现即说明状态机实现有缺陷。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CallDispatchError {
    #[error("host rejected outbound call to `{upstream}`: {status}")]
    Rejected { upstream: String, status: HostStatus },

    #[error("context {context} already awaits outbound call {token}")]
    AlreadyOutstanding { context: ContextId, token: CallToken },

    /// 根实例当前没有可用的出站目标，调用从未交给宿主。
    #[error("no outbound target configured for context {context}")]
    Unconfigured { context: ContextId },
}

impl CallDispatchError {
    /// 宿主给出的原始状态；扩展自身约束触发的拒绝返回 `None`。
    pub fn host_status(&self) -> Option<HostStatus> {
        match self {
            CallDispatchError::Rejected { status, .. } => Some(*status),
            CallDispatchError::AlreadyOutstanding { .. }
            | CallDispatchError::Unconfigured { .. } => None,
        }
    }
}

/// 本地响应发送失败。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResponseError {
    /// 同一上下文已经发出过最终响应。
    #[error("context {context} already emitted its final response")]
    AlreadySent { context: ContextId },

    #[error("host rejected local response: {status}")]
    Host { status: HostStatus },
}

/// 挂起恢复后重新绑定生效上下文失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("failed to rebind context {context} as effective context: {status}")]
pub struct RebindError {
    pub context: ContextId,
    pub status: HostStatus,
}

/// 共享计数器操作失败。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CounterError {
    /// 读写共享存储时出现非 CAS 冲突的失败。
    #[error("shared storage failure on `{key}`: {status}")]
    Storage { key: String, status: HostStatus },

    /// 共享值不是十进制非负整数，或键尚未初始化。
    #[error("shared value of `{key}` is not a decimal counter: {raw:?}")]
    Corrupt { key: String, raw: String },

    /// 重试预算耗尽。
    #[error("counter `{key}` gave up after {attempts} contended attempts")]
    Contention { key: String, attempts: u32 },

    #[error("counter `{key}` overflowed")]
    Overflow { key: String },
}

/// 扩展注册表错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("extension `{name}` already registered")]
    Duplicate { name: String },

    #[error("extension `{name}` is not registered")]
    Unknown { name: String },
}

/// 错误类别，对应失败处理策略的分组。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// 配置拒绝：实例不可用，需要运维修正配置。
    Configuration,
    /// 出站调用未受理：本地合成诊断响应即可恢复。
    Dispatch,
    /// 响应发送失败。
    Response,
    /// 生效上下文重绑定失败：尽力而为继续发送响应。
    Rebind,
    /// 共享存储异常：计数失败上报调用方，不无限重试。
    SharedStorage,
    /// 装配期错误。
    Registry,
}

/// 扩展错误总汇，便于跨模块以 `?` 传播。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] CallDispatchError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error(transparent)]
    Rebind(#[from] RebindError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ExtensionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExtensionError::Config(_) => ErrorCategory::Configuration,
            ExtensionError::Dispatch(_) => ErrorCategory::Dispatch,
            ExtensionError::Response(_) => ErrorCategory::Response,
            ExtensionError::Rebind(_) => ErrorCategory::Rebind,
            ExtensionError::Counter(_) => ErrorCategory::SharedStorage,
            ExtensionError::Registry(_) => ErrorCategory::Registry,
        }
    }

    /// 稳定错误码，格式为 `<域>.<原因>`。
    pub fn code(&self) -> &'static str {
        match self {
            ExtensionError::Config(err) => match err {
                ConfigError::Empty => "config.empty",
                ConfigError::Unreadable { .. } => "config.unreadable",
                ConfigError::Malformed { .. } => "config.malformed",
                ConfigError::Invalid { .. } => "config.invalid",
            },
            ExtensionError::Dispatch(err) => match err {
                CallDispatchError::Rejected { .. } => "dispatch.rejected",
                CallDispatchError::AlreadyOutstanding { .. } => "dispatch.outstanding",
                CallDispatchError::Unconfigured { .. } => "dispatch.unconfigured",
            },
            ExtensionError::Response(err) => match err {
                ResponseError::AlreadySent { .. } => "response.already_sent",
                ResponseError::Host { .. } => "response.host",
            },
            ExtensionError::Rebind(_) => "rebind.failed",
            ExtensionError::Counter(err) => match err {
                CounterError::Storage { .. } => "storage.failure",
                CounterError::Corrupt { .. } => "storage.corrupt",
                CounterError::Contention { .. } => "storage.contention",
                CounterError::Overflow { .. } => "storage.overflow",
            },
            ExtensionError::Registry(err) => match err {
                RegistryError::Duplicate { .. } => "registry.duplicate",
                RegistryError::Unknown { .. } => "registry.unknown",
            },
        }
    }
}
