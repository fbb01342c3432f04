//! # 宿主 ABI 契约
//!
//! ## 核心意图（Why）
//! - 扩展运行在代理宿主的沙箱中，所有 I/O（配置读取、头部访问、出站调用、共享数据）都经由宿主原语完成；
//! - 将这些原语抽象为 trait，使核心协议（续体、CAS 计数器）与真实宿主解耦：
//!   生产环境由 `spark-wasm-proxy` 绑定 Proxy-Wasm ABI，测试环境由 `spark-wasm-tck` 的内存宿主实现。
//!
//! ## 架构定位（Where）
//! - [`SharedDataAbi`] 是最小的共享存储契约，仅被 [`SharedCounter`](crate::counter::SharedCounter) 依赖；
//! - [`HostAbi`] 在其之上补齐请求级原语，由 [`FilterCx`](crate::context::FilterCx) 借出给请求上下文。
//!
//! ## 契约要点（What）
//! - 所有方法都以 `&self` 调用：宿主原语本身是“环境能力”，不由扩展独占；
//! - 失败统一返回 [`HostStatus`]，其中 [`HostStatus::CasMismatch`] 是可预期的乐观并发冲突，而非故障；
//! - 影响响应的原语（`set_header`/`send_response` 等）作用于宿主当前的“生效上下文”，
//!   跨越挂起边界后必须先调用 [`HostAbi::set_effective_context`] 重新绑定。

use core::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::ids::{CallToken, CasStamp, ContextId};

/// 状态伪头部名称。
pub const STATUS_HEADER: &str = ":status";

/// 宿主原语的失败状态。
///
/// 变体与 Proxy-Wasm ABI 的 `WasmResult` 一一对应（`Ok` 除外）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum HostStatus {
    #[error("not found")]
    NotFound,
    #[error("bad argument")]
    BadArgument,
    #[error("serialization failure")]
    SerializationFailure,
    #[error("parse failure")]
    ParseFailure,
    #[error("empty")]
    Empty,
    /// 写入时携带的版本戳已过期：其他写者在快照之后提交过。
    #[error("cas mismatch")]
    CasMismatch,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("internal failure")]
    InternalFailure,
    #[error("unimplemented")]
    Unimplemented,
}

/// 可通过 [`HostAbi::get_buffer`] 读取的宿主缓冲区。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// 插件（扩展）配置，`on_configure` 期间可读。
    PluginConfiguration,
    /// VM 配置，`on_vm_start` 期间可读。
    VmConfiguration,
    /// 出站调用的响应体，仅在完成回调期间可读。
    CallResponseBody,
}

/// 头部映射类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeaderMapKind {
    ResponseHeaders,
    /// 出站调用的响应头，仅在完成回调期间可读。
    CallResponseHeaders,
}

/// 共享数据快照：值与其 CAS 版本戳必须原子地一并读取。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedValue {
    pub value: Bytes,
    pub stamp: CasStamp,
}

impl SharedValue {
    pub fn new(value: impl Into<Bytes>, stamp: CasStamp) -> Self {
        Self {
            value: value.into(),
            stamp,
        }
    }
}

/// 头部键值对列表，保持插入顺序。
pub type HeaderPairs = Vec<(String, String)>;

/// 出站调用描述。
///
/// # 教案式说明
/// - **意图 (Why)**：将 `issueCall(target, headers, body, trailers, timeout)` 的参数收拢为值类型，
///   便于测试宿主记录与断言；
/// - **契约 (What)**：`upstream` 为宿主侧的上游集群名而非 URL；`headers` 至少应包含
///   `:method`、`:path`、`:authority` 三个伪头部；
/// - **风险 (Trade-offs)**：字段按值持有，构造时会复制一次路径与集群名，调用频率为每请求一次，可接受。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundCall {
    pub upstream: String,
    pub headers: HeaderPairs,
    pub body: Bytes,
    pub trailers: HeaderPairs,
    pub timeout: Duration,
}

impl OutboundCall {
    /// 构造无请求体、无尾部的 `GET` 调用。
    pub fn get(
        upstream: impl Into<String>,
        path: impl Into<String>,
        authority: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            upstream: upstream.into(),
            headers: vec![
                (":method".to_owned(), "GET".to_owned()),
                (":path".to_owned(), path.into()),
                (":authority".to_owned(), authority.into()),
            ],
            body: Bytes::new(),
            trailers: Vec::new(),
            timeout,
        }
    }

    /// 查找请求头（大小写敏感，伪头部均为小写）。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// 由扩展合成、直接回给下游的本地响应。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: u32,
    /// 宿主侧的响应细节标记，仅用于访问日志，不会出现在响应体中。
    pub details: String,
    pub body: Bytes,
    pub headers: HeaderPairs,
}

impl LocalResponse {
    pub fn new(status: u32, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            details: String::new(),
            body: body.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// 进程级共享存储契约。
///
/// # 教案式说明
/// - **意图 (Why)**：共享存储是唯一跨工作线程可见的可变资源，必须以“带版本戳的单元格”建模，
///   禁止裸读改写；
/// - **契约 (What)**：
///   - `get_shared_data`：原子返回值与版本戳；键不存在时返回 `Ok(None)`；
///   - `set_shared_data`：`expected` 为 `Some` 时仅在版本戳仍匹配时提交，否则返回
///     [`HostStatus::CasMismatch`]；为 `None` 时无条件写入；成功提交后宿主签发新的版本戳；
/// - **风险 (Trade-offs)**：无条件写入绕过了乐观并发检查，仅允许用于初始化路径。
pub trait SharedDataAbi {
    fn get_shared_data(&self, key: &str) -> Result<Option<SharedValue>, HostStatus>;

    fn set_shared_data(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<CasStamp>,
    ) -> Result<(), HostStatus>;
}

/// 请求级宿主原语。
///
/// 头部与响应相关的原语作用于宿主的“生效上下文”；宿主在投递请求回调前会自动设置，
/// 但出站调用的完成回调以根上下文身份投递，扩展必须先调用
/// [`set_effective_context`](HostAbi::set_effective_context) 才能修改原请求的响应。
pub trait HostAbi: SharedDataAbi {
    fn get_buffer(
        &self,
        kind: BufferKind,
        offset: usize,
        max_size: usize,
    ) -> Result<Option<Bytes>, HostStatus>;

    fn get_header(&self, map: HeaderMapKind, name: &str) -> Result<Option<String>, HostStatus>;

    /// 覆盖头部；`value` 为 `None` 时删除该头部。
    fn set_header(
        &self,
        map: HeaderMapKind,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), HostStatus>;

    fn add_header(&self, map: HeaderMapKind, name: &str, value: &str) -> Result<(), HostStatus>;

    /// 发起出站调用；受理后返回令牌，完成时宿主以该令牌投递恰好一次完成回调。
    fn dispatch_call(&self, call: &OutboundCall) -> Result<CallToken, HostStatus>;

    fn send_response(&self, response: &LocalResponse) -> Result<(), HostStatus>;

    fn set_effective_context(&self, context: ContextId) -> Result<(), HostStatus>;

    /// 读取 `:status` 伪头部并解析为数值状态码。
    ///
    /// 头部缺失返回 `Ok(None)`；非十进制数值返回 [`HostStatus::ParseFailure`]。
    fn status_code(&self, map: HeaderMapKind) -> Result<Option<u32>, HostStatus> {
        match self.get_header(map, STATUS_HEADER)? {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|_| HostStatus::ParseFailure),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_call_carries_minimal_pseudo_headers() {
        let call = OutboundCall::get("cluster_a", "/", "example.com", Duration::from_secs(5));
        assert_eq!(call.header(":method"), Some("GET"));
        assert_eq!(call.header(":path"), Some("/"));
        assert_eq!(call.header(":authority"), Some("example.com"));
        assert!(call.body.is_empty());
        assert!(call.trailers.is_empty());
    }

    #[test]
    fn local_response_builder_keeps_header_order() {
        let response = LocalResponse::new(500, "boom")
            .with_details("Failed/WASM")
            .with_header("a", "1")
            .with_header("b", "2");
        assert_eq!(response.details, "Failed/WASM");
        assert_eq!(response.headers[0].0, "a");
        assert_eq!(response.headers[1].0, "b");
    }
}
