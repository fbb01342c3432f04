//! # SimHost：单工作线程的内存宿主
//!
//! ## 核心意图（Why）
//! - 以可观测、可注入故障的方式复现代理宿主对扩展可见的行为，尤其是“生效上下文”语义：
//!   响应类原语只作用于当前生效的请求上下文；出站调用完成回调以根上下文身份投递。
//!
//! ## 行为契约（What）
//! - 生效上下文为根或未知上下文时，头部与响应原语返回 [`HostStatus::BadArgument`]，
//!   并计入 [`SimHost::misdirected_mutations`]；
//! - 出站调用受理后记录为 [`PendingCall`]，由测试显式完成；
//! - 调用响应头与响应体仅在完成投递窗口内可读，窗口外读取返回 [`HostStatus::NotFound`]。
//!
//! ## 风险提示（Trade-offs）
//! - 所有状态收拢在一把 `parking_lot::Mutex` 中；扩展回调期间不会持锁，宿主原语之间无重入。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_wasm_core::{
    BufferKind, CallToken, CasStamp, ContextId, HeaderMapKind, HeaderPairs, HostAbi, HostStatus,
    LocalResponse, OutboundCall, SharedDataAbi, SharedValue,
};

use crate::store::SharedStore;

/// 已受理、尚未完成的出站调用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCall {
    pub token: CallToken,
    /// 发起调用时的生效上下文。
    pub issued_by: Option<ContextId>,
    pub call: OutboundCall,
}

/// 上游对出站调用的应答。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallResponse {
    pub headers: HeaderPairs,
    pub body: Bytes,
    pub trailers: HeaderPairs,
}

impl CallResponse {
    /// 带 `:status` 头部与响应体的应答。
    pub fn with_status(status: u32, body: impl Into<Bytes>) -> Self {
        Self {
            headers: vec![(":status".to_owned(), status.to_string())],
            body: body.into(),
            trailers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// 单个请求流在宿主侧的可观测状态。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamState {
    pub response_headers: HeaderPairs,
    pub local_responses: Vec<LocalResponse>,
}

#[derive(Debug, Default)]
struct HostState {
    plugin_configuration: Bytes,
    vm_configuration: Bytes,
    effective: Option<ContextId>,
    streams: HashMap<ContextId, StreamState>,
    completion: Option<CallResponse>,
    next_token: u32,
    pending: BTreeMap<CallToken, PendingCall>,
    dispatched: Vec<PendingCall>,
    dispatch_fault: Option<HostStatus>,
    rebind_fault: Option<HostStatus>,
    response_fault: Option<HostStatus>,
    misdirected: usize,
}

/// 内存宿主。
#[derive(Debug)]
pub struct SimHost {
    store: Arc<SharedStore>,
    state: Mutex<HostState>,
}

impl SimHost {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self {
            store,
            state: Mutex::new(HostState {
                next_token: 1,
                ..HostState::default()
            }),
        }
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn set_plugin_configuration(&self, raw: impl Into<Bytes>) {
        self.state.lock().plugin_configuration = raw.into();
    }

    pub fn set_vm_configuration(&self, raw: impl Into<Bytes>) {
        self.state.lock().vm_configuration = raw.into();
    }

    /// 令下一次及以后的出站调用被拒绝；`None` 解除。
    pub fn set_dispatch_fault(&self, fault: Option<HostStatus>) {
        self.state.lock().dispatch_fault = fault;
    }

    /// 令重新绑定生效上下文失败；`None` 解除。
    pub fn set_rebind_fault(&self, fault: Option<HostStatus>) {
        self.state.lock().rebind_fault = fault;
    }

    /// 令本地响应发送失败；`None` 解除。
    pub fn set_response_fault(&self, fault: Option<HostStatus>) {
        self.state.lock().response_fault = fault;
    }

    pub fn open_stream(&self, context: ContextId) {
        self.state
            .lock()
            .streams
            .insert(context, StreamState::default());
    }

    pub fn close_stream(&self, context: ContextId) -> Option<StreamState> {
        let mut state = self.state.lock();
        if state.effective == Some(context) {
            state.effective = None;
        }
        state.streams.remove(&context)
    }

    pub fn stream(&self, context: ContextId) -> Option<StreamState> {
        self.state.lock().streams.get(&context).cloned()
    }

    pub fn set_response_headers(&self, context: ContextId, headers: HeaderPairs) {
        if let Some(stream) = self.state.lock().streams.get_mut(&context) {
            stream.response_headers = headers;
        }
    }

    /// 宿主投递请求回调前设置生效上下文。
    pub fn enter(&self, context: Option<ContextId>) {
        self.state.lock().effective = context;
    }

    pub fn effective(&self) -> Option<ContextId> {
        self.state.lock().effective
    }

    /// 开启完成投递窗口：生效上下文切回根，调用响应可读。
    pub fn begin_completion(
        &self,
        token: CallToken,
        response: Option<CallResponse>,
    ) -> Option<PendingCall> {
        let mut state = self.state.lock();
        state.effective = None;
        state.completion = response;
        state.pending.remove(&token)
    }

    pub fn end_completion(&self) {
        let mut state = self.state.lock();
        state.completion = None;
        state.effective = None;
    }

    pub fn pending_calls(&self) -> Vec<PendingCall> {
        self.state.lock().pending.values().cloned().collect()
    }

    /// 全部已受理的出站调用，含已完成的。
    pub fn dispatched_calls(&self) -> Vec<PendingCall> {
        self.state.lock().dispatched.clone()
    }

    /// 在错误的生效上下文下尝试修改响应的次数。
    pub fn misdirected_mutations(&self) -> usize {
        self.state.lock().misdirected
    }

    fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut StreamState) -> Result<T, HostStatus>,
    ) -> Result<T, HostStatus> {
        let mut state = self.state.lock();
        let HostState {
            effective,
            streams,
            misdirected,
            ..
        } = &mut *state;
        let current = *effective;
        match current.and_then(|context| streams.get_mut(&context)) {
            Some(stream) => f(stream),
            None => {
                *misdirected += 1;
                Err(HostStatus::BadArgument)
            }
        }
    }
}

fn slice(buffer: &Bytes, offset: usize, max_size: usize) -> Option<Bytes> {
    if buffer.is_empty() || offset >= buffer.len() {
        return None;
    }
    let end = offset.saturating_add(max_size).min(buffer.len());
    Some(buffer.slice(offset..end))
}

fn find(headers: &HeaderPairs, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

fn pick(stream: &mut StreamState, map: HeaderMapKind) -> Result<&mut HeaderPairs, HostStatus> {
    match map {
        HeaderMapKind::ResponseHeaders => Ok(&mut stream.response_headers),
        HeaderMapKind::CallResponseHeaders => Err(HostStatus::BadArgument),
    }
}

impl SharedDataAbi for SimHost {
    fn get_shared_data(&self, key: &str) -> Result<Option<SharedValue>, HostStatus> {
        self.store.get_shared_data(key)
    }

    fn set_shared_data(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<CasStamp>,
    ) -> Result<(), HostStatus> {
        self.store.set_shared_data(key, value, expected)
    }
}

impl HostAbi for SimHost {
    fn get_buffer(
        &self,
        kind: BufferKind,
        offset: usize,
        max_size: usize,
    ) -> Result<Option<Bytes>, HostStatus> {
        let state = self.state.lock();
        match kind {
            BufferKind::PluginConfiguration => {
                Ok(slice(&state.plugin_configuration, offset, max_size))
            }
            BufferKind::VmConfiguration => Ok(slice(&state.vm_configuration, offset, max_size)),
            BufferKind::CallResponseBody => state
                .completion
                .as_ref()
                .map(|response| slice(&response.body, offset, max_size))
                .ok_or(HostStatus::NotFound),
        }
    }

    fn get_header(&self, map: HeaderMapKind, name: &str) -> Result<Option<String>, HostStatus> {
        if map == HeaderMapKind::CallResponseHeaders {
            let state = self.state.lock();
            return state
                .completion
                .as_ref()
                .map(|response| find(&response.headers, name))
                .ok_or(HostStatus::NotFound);
        }
        self.with_stream(|stream| Ok(find(pick(stream, map)?, name)))
    }

    fn set_header(
        &self,
        map: HeaderMapKind,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), HostStatus> {
        self.with_stream(|stream| {
            let headers = pick(stream, map)?;
            headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
            if let Some(value) = value {
                headers.push((name.to_owned(), value.to_owned()));
            }
            Ok(())
        })
    }

    fn add_header(&self, map: HeaderMapKind, name: &str, value: &str) -> Result<(), HostStatus> {
        self.with_stream(|stream| {
            pick(stream, map)?.push((name.to_owned(), value.to_owned()));
            Ok(())
        })
    }

    fn dispatch_call(&self, call: &OutboundCall) -> Result<CallToken, HostStatus> {
        let mut state = self.state.lock();
        if let Some(status) = state.dispatch_fault {
            return Err(status);
        }
        if call.upstream.is_empty() || call.timeout.is_zero() {
            return Err(HostStatus::BadArgument);
        }
        let token = CallToken::new(state.next_token);
        state.next_token = state.next_token.wrapping_add(1).max(1);
        let pending = PendingCall {
            token,
            issued_by: state.effective,
            call: call.clone(),
        };
        state.dispatched.push(pending.clone());
        state.pending.insert(token, pending);
        Ok(token)
    }

    fn send_response(&self, response: &LocalResponse) -> Result<(), HostStatus> {
        let fault = self.state.lock().response_fault;
        self.with_stream(|stream| {
            if let Some(status) = fault {
                return Err(status);
            }
            stream.local_responses.push(response.clone());
            Ok(())
        })
    }

    fn set_effective_context(&self, context: ContextId) -> Result<(), HostStatus> {
        let mut state = self.state.lock();
        if let Some(status) = state.rebind_fault {
            return Err(status);
        }
        if !state.streams.contains_key(&context) {
            return Err(HostStatus::BadArgument);
        }
        state.effective = Some(context);
        Ok(())
    }
}
