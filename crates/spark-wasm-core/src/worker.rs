//! # WorkerDispatcher：单工作线程的回调分发器
//!
//! ## 核心意图（Why）
//! - 宿主只认识数值 ID：它按根 ID 投递生命周期事件，按上下文 ID 投递请求事件，按调用令牌投递完成事件；
//! - 分发器把这三类 ID 路由到同一工作线程内唯一的根实例与各请求上下文，并承担续体协议中
//!   “令牌 → 原请求上下文”的解析，以及“在途调用期间不回收上下文”的保护。
//!
//! ## 架构定位（Where）
//! - 泛型实现 [`WorkerDispatcher<R>`] 面向具体扩展；对象安全的 [`ExtensionWorker`] 面向宿主适配层，
//!   使 `spark-wasm-proxy` 与 `spark-wasm-tck` 可以在运行期按名称装配任意扩展。
//!
//! ## 状态机约束（What）
//! - 根阶段：`Created → Started → Configured | Rejected → TearingDown → Retired`；
//!   `Configured`/`Rejected` 之间可因配置热更新来回切换；
//! - 仅 `Configured` 阶段接受新的请求上下文；其他阶段到达的请求回调一律记录并放行（`Continue`）；
//! - 宿主请求销毁仍有在途调用的上下文时，回收延后到其完成回调投递之后。
//!
//! ## 风险提示（Trade-offs）
//! - 分发器以 `&mut self` 驱动，天然杜绝同一工作线程内的重入；跨工作线程从不共享分发器。

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::abi::HostAbi;
use crate::broker::{CallBroker, CallCompletion};
use crate::context::{FilterCx, FilterStatus, RequestFilter, RootCx, RootExtension};
use crate::error::ExtensionError;
use crate::ids::{CallToken, ContextId, WorkerId};

/// 根实例生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootPhase {
    Created,
    Started,
    Configured,
    /// 最近一次配置被拒绝，实例不可用。
    Rejected,
    TearingDown,
    Retired,
}

impl RootPhase {
    pub fn accepts_requests(self) -> bool {
        matches!(self, RootPhase::Configured)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RootPhase::Retired)
    }
}

/// 宿主适配层看到的对象安全工作线程接口。
pub trait ExtensionWorker {
    fn worker_id(&self) -> WorkerId;

    fn extension_name(&self) -> &str;

    fn phase(&self) -> RootPhase;

    fn on_vm_start(&mut self, host: &dyn HostAbi, vm_configuration_size: usize) -> bool;

    fn on_configure(&mut self, host: &dyn HostAbi, configuration_size: usize) -> bool;

    /// 创建请求上下文；实例未就绪或 ID 重复时返回 `false`。
    fn on_context_create(&mut self, context: ContextId) -> bool;

    fn on_response_headers(
        &mut self,
        host: &dyn HostAbi,
        context: ContextId,
        header_count: usize,
        end_of_stream: bool,
    ) -> FilterStatus;

    fn on_call_response(
        &mut self,
        host: &dyn HostAbi,
        token: CallToken,
        header_count: usize,
        body_size: usize,
        trailer_count: usize,
    );

    /// 宿主请求销毁上下文；返回 `false` 表示因在途调用而延后回收。
    fn on_context_done(&mut self, context: ContextId) -> bool;

    fn on_teardown_begin(&mut self, host: &dyn HostAbi) -> bool;

    fn on_teardown_complete(&mut self);

    /// 上下文是否仍由本工作线程持有（含延后回收中的上下文）。
    fn has_context(&self, context: ContextId) -> bool;

    fn live_contexts(&self) -> usize;

    fn outstanding_calls(&self) -> usize;
}

struct FilterSlot<F> {
    filter: F,
    response_sent: bool,
    retire_requested: bool,
}

/// 泛型分发器，持有一个根实例及其全部请求上下文。
pub struct WorkerDispatcher<R: RootExtension> {
    worker: WorkerId,
    name: String,
    phase: RootPhase,
    root: R,
    filters: HashMap<ContextId, FilterSlot<R::Filter>>,
    broker: CallBroker,
}

impl<R: RootExtension> WorkerDispatcher<R> {
    pub fn new(worker: WorkerId, name: impl Into<String>, root: R) -> Self {
        let name = name.into();
        info!(worker = %worker, extension = %name, "extension root created");
        Self {
            worker,
            name,
            phase: RootPhase::Created,
            root,
            filters: HashMap::new(),
            broker: CallBroker::new(),
        }
    }

    pub fn root(&self) -> &R {
        &self.root
    }

    pub fn has_responded(&self, context: ContextId) -> bool {
        self.filters
            .get(&context)
            .is_some_and(|slot| slot.response_sent)
    }

    fn retire(&mut self, context: ContextId) {
        if self.filters.remove(&context).is_some() {
            debug!(worker = %self.worker, context = %context, "request context retired");
        }
    }
}

impl<R: RootExtension> ExtensionWorker for WorkerDispatcher<R> {
    fn worker_id(&self) -> WorkerId {
        self.worker
    }

    fn extension_name(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> RootPhase {
        self.phase
    }

    fn on_vm_start(&mut self, host: &dyn HostAbi, vm_configuration_size: usize) -> bool {
        info!(worker = %self.worker, vm_configuration_size, "extension root starting");
        if matches!(self.phase, RootPhase::TearingDown | RootPhase::Retired) {
            warn!(worker = %self.worker, phase = ?self.phase, "start event after teardown ignored");
            return false;
        }
        let started = self
            .root
            .on_vm_start(&RootCx::new(host, self.worker), vm_configuration_size);
        if started && self.phase == RootPhase::Created {
            self.phase = RootPhase::Started;
        }
        started
    }

    fn on_configure(&mut self, host: &dyn HostAbi, configuration_size: usize) -> bool {
        info!(worker = %self.worker, configuration_size, "extension root configuring");
        if matches!(self.phase, RootPhase::TearingDown | RootPhase::Retired) {
            warn!(worker = %self.worker, phase = ?self.phase, "configure after teardown ignored");
            return false;
        }
        match self
            .root
            .on_configure(&RootCx::new(host, self.worker), configuration_size)
        {
            Ok(()) => {
                self.phase = RootPhase::Configured;
                true
            }
            Err(err) => {
                let err = ExtensionError::from(err);
                warn!(worker = %self.worker, code = err.code(), error = %err, "configuration rejected");
                self.phase = RootPhase::Rejected;
                false
            }
        }
    }

    fn on_context_create(&mut self, context: ContextId) -> bool {
        if !self.phase.accepts_requests() {
            warn!(worker = %self.worker, context = %context, phase = ?self.phase, "request context refused");
            return false;
        }
        if self.filters.contains_key(&context) {
            warn!(worker = %self.worker, context = %context, "duplicate request context id");
            return false;
        }
        let filter = self.root.create_filter(context);
        self.filters.insert(
            context,
            FilterSlot {
                filter,
                response_sent: false,
                retire_requested: false,
            },
        );
        debug!(worker = %self.worker, context = %context, "request context created");
        true
    }

    fn on_response_headers(
        &mut self,
        host: &dyn HostAbi,
        context: ContextId,
        header_count: usize,
        end_of_stream: bool,
    ) -> FilterStatus {
        let Some(slot) = self.filters.get_mut(&context) else {
            warn!(worker = %self.worker, context = %context, "response headers for unknown context");
            return FilterStatus::Continue;
        };
        let mut cx = FilterCx::new(
            host,
            &self.root,
            self.worker,
            context,
            &mut self.broker,
            &mut slot.response_sent,
        );
        slot.filter
            .on_response_headers(&mut cx, header_count, end_of_stream)
    }

    fn on_call_response(
        &mut self,
        host: &dyn HostAbi,
        token: CallToken,
        header_count: usize,
        body_size: usize,
        trailer_count: usize,
    ) {
        let Some(context) = self.broker.resolve(token) else {
            warn!(worker = %self.worker, token = %token, "completion for unknown or consumed call token dropped");
            return;
        };
        let completion = CallCompletion {
            token,
            header_count,
            body_size,
            trailer_count,
        };
        let retire = {
            let Some(slot) = self.filters.get_mut(&context) else {
                warn!(worker = %self.worker, context = %context, token = %token, "completion for vanished context dropped");
                return;
            };
            let mut cx = FilterCx::new(
                host,
                &self.root,
                self.worker,
                context,
                &mut self.broker,
                &mut slot.response_sent,
            );
            slot.filter.on_call_completed(&mut cx, completion);
            slot.retire_requested && self.broker.outstanding(context).is_none()
        };
        if retire {
            self.retire(context);
        }
    }

    fn on_context_done(&mut self, context: ContextId) -> bool {
        // 拆除期间宿主不再投递完成回调。
        if self.phase == RootPhase::TearingDown {
            if let Some(token) = self.broker.forget(context) {
                debug!(worker = %self.worker, context = %context, token = %token, "outstanding call abandoned during teardown");
            }
            self.retire(context);
            return true;
        }
        if let Some(token) = self.broker.outstanding(context) {
            if let Some(slot) = self.filters.get_mut(&context) {
                slot.retire_requested = true;
            }
            debug!(worker = %self.worker, context = %context, token = %token, "context retirement deferred until call completes");
            return false;
        }
        self.retire(context);
        true
    }

    fn on_teardown_begin(&mut self, host: &dyn HostAbi) -> bool {
        info!(worker = %self.worker, live = self.filters.len(), "extension root teardown begins");
        self.phase = RootPhase::TearingDown;
        self.root.on_teardown_begin(&RootCx::new(host, self.worker))
    }

    fn on_teardown_complete(&mut self) {
        info!(worker = %self.worker, "extension root teardown complete");
        self.root.on_teardown_complete();
        self.filters.clear();
        self.broker = CallBroker::new();
        self.phase = RootPhase::Retired;
    }

    fn has_context(&self, context: ContextId) -> bool {
        self.filters.contains_key(&context)
    }

    fn live_contexts(&self) -> usize {
        self.filters.len()
    }

    fn outstanding_calls(&self) -> usize {
        self.broker.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use bytes::Bytes;

    use super::*;
    use crate::abi::{
        BufferKind, HeaderMapKind, HostStatus, LocalResponse, OutboundCall, SharedDataAbi,
        SharedValue,
    };
    use crate::error::ConfigError;
    use crate::ids::CasStamp;

    #[derive(Default)]
    struct FakeHost {
        effective: Cell<Option<ContextId>>,
        next_token: Cell<u32>,
        responses: RefCell<Vec<(ContextId, u32)>>,
        config: RefCell<Bytes>,
    }

    impl SharedDataAbi for FakeHost {
        fn get_shared_data(&self, _key: &str) -> Result<Option<SharedValue>, HostStatus> {
            Ok(None)
        }

        fn set_shared_data(
            &self,
            _key: &str,
            _value: &[u8],
            _expected: Option<CasStamp>,
        ) -> Result<(), HostStatus> {
            Err(HostStatus::Unimplemented)
        }
    }

    impl HostAbi for FakeHost {
        fn get_buffer(
            &self,
            _kind: BufferKind,
            _offset: usize,
            _max_size: usize,
        ) -> Result<Option<Bytes>, HostStatus> {
            Ok(Some(self.config.borrow().clone()))
        }

        fn get_header(
            &self,
            _map: HeaderMapKind,
            _name: &str,
        ) -> Result<Option<String>, HostStatus> {
            Ok(None)
        }

        fn set_header(
            &self,
            _map: HeaderMapKind,
            _name: &str,
            _value: Option<&str>,
        ) -> Result<(), HostStatus> {
            Ok(())
        }

        fn add_header(
            &self,
            _map: HeaderMapKind,
            _name: &str,
            _value: &str,
        ) -> Result<(), HostStatus> {
            Ok(())
        }

        fn dispatch_call(&self, _call: &OutboundCall) -> Result<CallToken, HostStatus> {
            let token = self.next_token.get() + 1;
            self.next_token.set(token);
            Ok(CallToken::new(token))
        }

        fn send_response(&self, response: &LocalResponse) -> Result<(), HostStatus> {
            let context = self.effective.get().ok_or(HostStatus::BadArgument)?;
            self.responses.borrow_mut().push((context, response.status));
            Ok(())
        }

        fn set_effective_context(&self, context: ContextId) -> Result<(), HostStatus> {
            self.effective.set(Some(context));
            Ok(())
        }
    }

    /// 配置必须是非空的；每个请求发起一次调用，完成后回 202。
    struct Probe;

    struct ProbeFilter;

    impl RootExtension for Probe {
        type Filter = ProbeFilter;

        fn on_configure(&mut self, cx: &RootCx<'_>, size: usize) -> Result<(), ConfigError> {
            if cx.configuration(size)?.is_empty() {
                return Err(ConfigError::Empty);
            }
            Ok(())
        }

        fn create_filter(&self, _context: ContextId) -> ProbeFilter {
            ProbeFilter
        }
    }

    impl RequestFilter<Probe> for ProbeFilter {
        fn on_response_headers(
            &mut self,
            cx: &mut FilterCx<'_, Probe>,
            _header_count: usize,
            _end_of_stream: bool,
        ) -> FilterStatus {
            let timeout = core::time::Duration::from_secs(1);
            let call = OutboundCall::get("up", "/", "example.com", timeout);
            match cx.dispatch_call(&call) {
                Ok(_) => FilterStatus::StopIteration,
                Err(_) => FilterStatus::Continue,
            }
        }

        fn on_call_completed(&mut self, cx: &mut FilterCx<'_, Probe>, _completion: CallCompletion) {
            let _ = cx.rebind_active();
            let _ = cx.send_response(&LocalResponse::new(202, ""));
        }
    }

    fn configured(host: &FakeHost) -> WorkerDispatcher<Probe> {
        let mut worker = WorkerDispatcher::new(WorkerId::new(1), "probe", Probe);
        *host.config.borrow_mut() = Bytes::from_static(b"on");
        assert!(worker.on_vm_start(host, 0));
        assert!(worker.on_configure(host, 2));
        worker
    }

    #[test]
    fn phases_follow_lifecycle() {
        let host = FakeHost::default();
        let mut worker = WorkerDispatcher::new(WorkerId::new(1), "probe", Probe);
        assert_eq!(worker.phase(), RootPhase::Created);
        assert!(!worker.on_context_create(ContextId::new(2)));

        assert!(worker.on_vm_start(&host, 0));
        assert_eq!(worker.phase(), RootPhase::Started);
        assert!(!worker.on_configure(&host, 0));
        assert_eq!(worker.phase(), RootPhase::Rejected);

        *host.config.borrow_mut() = Bytes::from_static(b"on");
        assert!(worker.on_configure(&host, 2));
        assert_eq!(worker.phase(), RootPhase::Configured);

        assert!(worker.on_teardown_begin(&host));
        worker.on_teardown_complete();
        assert!(worker.phase().is_terminal());
        assert!(!worker.on_configure(&host, 2));
    }

    #[test]
    fn completion_routes_back_to_issuing_context() {
        let host = FakeHost::default();
        let mut worker = configured(&host);
        let (a, b) = (ContextId::new(10), ContextId::new(11));
        assert!(worker.on_context_create(a));
        assert!(worker.on_context_create(b));
        assert!(!worker.on_context_create(a));

        assert_eq!(
            worker.on_response_headers(&host, a, 1, false),
            FilterStatus::StopIteration
        );
        assert_eq!(
            worker.on_response_headers(&host, b, 1, false),
            FilterStatus::StopIteration
        );
        assert_eq!(worker.outstanding_calls(), 2);

        host.effective.set(None);
        worker.on_call_response(&host, CallToken::new(2), 1, 0, 0);
        assert_eq!(*host.responses.borrow(), vec![(b, 202)]);
        assert!(worker.has_responded(b));
        assert!(!worker.has_responded(a));

        worker.on_call_response(&host, CallToken::new(2), 1, 0, 0);
        assert_eq!(host.responses.borrow().len(), 1);
    }

    #[test]
    fn retirement_waits_for_outstanding_call() {
        let host = FakeHost::default();
        let mut worker = configured(&host);
        let context = ContextId::new(5);
        assert!(worker.on_context_create(context));
        worker.on_response_headers(&host, context, 1, true);

        assert!(!worker.on_context_done(context));
        assert!(worker.has_context(context));

        worker.on_call_response(&host, CallToken::new(1), 0, 0, 0);
        assert!(!worker.has_context(context));
        assert_eq!(worker.live_contexts(), 0);
        assert_eq!(*host.responses.borrow(), vec![(context, 202)]);
    }

    #[test]
    fn teardown_abandons_outstanding_calls() {
        let host = FakeHost::default();
        let mut worker = configured(&host);
        let context = ContextId::new(8);
        assert!(worker.on_context_create(context));
        worker.on_response_headers(&host, context, 1, false);

        assert!(worker.on_teardown_begin(&host));
        assert!(worker.on_context_done(context));
        assert_eq!(worker.outstanding_calls(), 0);
        assert!(!worker.has_context(context));
    }

    #[test]
    fn unknown_context_passes_through() {
        let host = FakeHost::default();
        let mut worker = configured(&host);
        assert_eq!(
            worker.on_response_headers(&host, ContextId::new(99), 3, false),
            FilterStatus::Continue
        );
        assert!(worker.on_context_done(ContextId::new(99)));
    }
}
