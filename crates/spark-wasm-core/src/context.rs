//! # 扩展实例（根）与请求上下文契约
//!
//! ## 核心意图（Why）
//! - 宿主按工作线程创建一个“根”扩展实例，再为每个在途请求创建一个请求上下文；
//! - 请求上下文需要读取根的派生配置与计数器，但并不拥有根：分发器在每次回调时以
//!   [`FilterCx`] 借出 `&Root`，请求上下文不持有指向根的引用。
//!
//! ## 架构定位（Where）
//! - [`RootExtension`] 与 [`RequestFilter`] 由具体扩展（`spark-wasm-filters`）实现；
//! - [`WorkerDispatcher`](crate::worker::WorkerDispatcher) 持有二者并驱动回调；
//! - [`FilterCx`] 是请求上下文唯一的宿主入口：出站调用必须经由它登记到
//!   [`CallBroker`]，响应发送经由它保证“至多一次”。
//!
//! ## 契约（What）
//! - 单个工作线程内所有回调串行执行，因此 trait 方法直接取得 `&mut self`，无需任何锁；
//! - 挂起恢复后，请求上下文必须先调用 [`FilterCx::rebind_active`] 再修改响应。

use bytes::Bytes;

use crate::abi::{BufferKind, HeaderMapKind, HostAbi, HostStatus, LocalResponse, OutboundCall};
use crate::broker::{CallBroker, CallCompletion};
use crate::error::{CallDispatchError, ConfigError, RebindError, ResponseError};
use crate::ids::{CallToken, ContextId, WorkerId};

/// 头部回调的返回值。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterStatus {
    /// 继续把头部交给后续过滤器。
    Continue,
    /// 暂停迭代，宿主需缓冲原响应直到扩展恢复或直接发送本地响应。
    StopIteration,
}

/// 根回调上下文。
pub struct RootCx<'a> {
    host: &'a dyn HostAbi,
    worker: WorkerId,
}

impl<'a> RootCx<'a> {
    pub fn new(host: &'a dyn HostAbi, worker: WorkerId) -> Self {
        Self { host, worker }
    }

    pub fn host(&self) -> &'a dyn HostAbi {
        self.host
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// 读取整块宿主缓冲区；宿主报告缓冲区缺失时返回空字节串。
    pub fn read_buffer(&self, kind: BufferKind, size: usize) -> Result<Bytes, HostStatus> {
        if size == 0 {
            return Ok(Bytes::new());
        }
        match self.host.get_buffer(kind, 0, size) {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) | Err(HostStatus::NotFound) => Ok(Bytes::new()),
            Err(status) => Err(status),
        }
    }

    /// 读取插件配置，读取失败映射为 [`ConfigError::Unreadable`]。
    pub fn configuration(&self, size: usize) -> Result<Bytes, ConfigError> {
        self.read_buffer(BufferKind::PluginConfiguration, size)
            .map_err(|status| ConfigError::Unreadable { status })
    }
}

/// 每个工作线程一份的根扩展实例。
///
/// # 教案式说明
/// - **意图 (Why)**：独占派生配置与共享资源访问方式，并作为请求上下文的工厂；
/// - **生命周期 (How)**：`on_vm_start` → `on_configure`（可多次，整体替换）→ 服务请求 →
///   `on_teardown_begin` → `on_teardown_complete`，之后不再有任何调用；
/// - **契约 (What)**：`on_configure` 返回错误即拒绝配置，实例随后不可用；
///   重复调用必须完整替换此前的派生状态，不做局部合并。
pub trait RootExtension: 'static {
    type Filter: RequestFilter<Self>;

    /// 工作线程启动；宿主可能对同一工作线程多次触发。返回 `false` 表示启动失败。
    fn on_vm_start(&mut self, cx: &RootCx<'_>, vm_configuration_size: usize) -> bool {
        let _ = (cx, vm_configuration_size);
        true
    }

    fn on_configure(
        &mut self,
        cx: &RootCx<'_>,
        configuration_size: usize,
    ) -> Result<(), ConfigError>;

    fn create_filter(&self, context: ContextId) -> Self::Filter;

    /// 宿主开始拆除；返回 `true` 表示已可立即完成拆除。
    fn on_teardown_begin(&mut self, cx: &RootCx<'_>) -> bool {
        let _ = cx;
        true
    }

    /// 宿主确认不会再有任何调用到达。
    fn on_teardown_complete(&mut self) {}
}

/// 请求上下文：驱动单个请求的拦截状态机。
pub trait RequestFilter<R: ?Sized>: 'static {
    fn on_response_headers(
        &mut self,
        cx: &mut FilterCx<'_, R>,
        header_count: usize,
        end_of_stream: bool,
    ) -> FilterStatus {
        let _ = (cx, header_count, end_of_stream);
        FilterStatus::Continue
    }

    /// 出站调用完成；每个在途调用恰好投递一次，且必在发起调用的回调返回之后。
    fn on_call_completed(&mut self, cx: &mut FilterCx<'_, R>, completion: CallCompletion) {
        let _ = (cx, completion);
    }
}

/// 请求回调上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：把宿主原语、根引用与续体表捆成一个短生命周期借用，
///   让请求上下文无需也无法持有任何全局状态；
/// - **契约 (What)**：
///   - [`dispatch_call`](Self::dispatch_call) 受理成功后令牌已登记，完成回调会路由回本上下文；
///   - [`send_response`](Self::send_response) 对同一上下文至多成功一次；
///   - [`rebind_active`](Self::rebind_active) 在完成回调中必须先于任何响应修改调用。
pub struct FilterCx<'a, R: ?Sized> {
    host: &'a dyn HostAbi,
    root: &'a R,
    worker: WorkerId,
    context: ContextId,
    broker: &'a mut CallBroker,
    response_sent: &'a mut bool,
}

impl<'a, R: ?Sized> FilterCx<'a, R> {
    pub fn new(
        host: &'a dyn HostAbi,
        root: &'a R,
        worker: WorkerId,
        context: ContextId,
        broker: &'a mut CallBroker,
        response_sent: &'a mut bool,
    ) -> Self {
        Self {
            host,
            root,
            worker,
            context,
            broker,
            response_sent,
        }
    }

    pub fn root(&self) -> &'a R {
        self.root
    }

    pub fn host(&self) -> &'a dyn HostAbi {
        self.host
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// 原始响应的 `:status`。
    pub fn response_status(&self) -> Result<Option<u32>, HostStatus> {
        self.host.status_code(HeaderMapKind::ResponseHeaders)
    }

    /// 出站调用响应的 `:status` 原文，仅在完成回调中可用。
    pub fn call_response_status(&self) -> Result<Option<String>, HostStatus> {
        self.host
            .get_header(HeaderMapKind::CallResponseHeaders, crate::abi::STATUS_HEADER)
    }

    pub fn add_response_header(&self, name: &str, value: &str) -> Result<(), HostStatus> {
        self.host
            .add_header(HeaderMapKind::ResponseHeaders, name, value)
    }

    /// 经宿主发起出站调用并登记续体。
    pub fn dispatch_call(&mut self, call: &OutboundCall) -> Result<CallToken, CallDispatchError> {
        self.broker.ensure_idle(self.context)?;
        let token = self
            .host
            .dispatch_call(call)
            .map_err(|status| CallDispatchError::Rejected {
                upstream: call.upstream.clone(),
                status,
            })?;
        self.broker.register(self.context, token)?;
        Ok(token)
    }

    /// 当前上下文在途的调用令牌。
    pub fn outstanding_call(&self) -> Option<CallToken> {
        self.broker.outstanding(self.context)
    }

    /// 将本上下文重新设为宿主的生效上下文。
    pub fn rebind_active(&self) -> Result<(), RebindError> {
        self.host
            .set_effective_context(self.context)
            .map_err(|status| RebindError {
                context: self.context,
                status,
            })
    }

    /// 发送最终的本地响应。
    pub fn send_response(&mut self, response: &LocalResponse) -> Result<(), ResponseError> {
        if *self.response_sent {
            return Err(ResponseError::AlreadySent {
                context: self.context,
            });
        }
        self.host
            .send_response(response)
            .map_err(|status| ResponseError::Host { status })?;
        *self.response_sent = true;
        Ok(())
    }
}
