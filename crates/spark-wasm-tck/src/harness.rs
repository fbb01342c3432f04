//! 驱动扩展的宿主事件序列。
//!
//! [`SimWorker`] 扮演单个工作线程内的宿主调度循环，按真实宿主的顺序投递
//! 生命周期、请求与出站调用完成事件；[`SimProcess`] 在多个工作线程之间共享同一份
//! [`SharedStore`] 与扩展注册表。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context as _, Result, bail};
use bytes::Bytes;
use spark_wasm_core::{
    CallToken, ContextId, ExtensionRegistry, ExtensionWorker, FilterStatus, HeaderPairs,
    LocalResponse, RootPhase, WorkerId,
};
use tracing::debug;

use crate::host::{CallResponse, PendingCall, SimHost};
use crate::store::SharedStore;

fn pairs(headers: &[(&str, &str)]) -> HeaderPairs {
    headers
        .iter()
        .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
        .collect()
}

/// 单工作线程宿主。
pub struct SimWorker {
    host: SimHost,
    worker: Box<dyn ExtensionWorker>,
    next_context: u32,
}

impl SimWorker {
    pub fn new(
        registry: &ExtensionRegistry,
        extension: &str,
        worker: WorkerId,
        store: Arc<SharedStore>,
    ) -> Result<Self> {
        let instance = registry
            .create_worker(extension, worker)
            .with_context(|| format!("instantiating `{extension}` on worker {worker}"))?;
        Ok(Self {
            host: SimHost::new(store),
            worker: instance,
            next_context: worker.get().saturating_mul(1_000).saturating_add(1),
        })
    }

    pub fn host(&self) -> &SimHost {
        &self.host
    }

    pub fn worker(&self) -> &dyn ExtensionWorker {
        self.worker.as_ref()
    }

    pub fn phase(&self) -> RootPhase {
        self.worker.phase()
    }

    pub fn start(&mut self, vm_configuration: impl Into<Bytes>) -> bool {
        let raw = vm_configuration.into();
        let size = raw.len();
        self.host.set_vm_configuration(raw);
        self.host.enter(None);
        self.worker.on_vm_start(&self.host, size)
    }

    pub fn configure(&mut self, configuration: impl Into<Bytes>) -> bool {
        let raw = configuration.into();
        let size = raw.len();
        self.host.set_plugin_configuration(raw);
        self.host.enter(None);
        self.worker.on_configure(&self.host, size)
    }

    /// 启动并配置；任一步被拒绝即返回错误。
    pub fn boot(&mut self, configuration: &str) -> Result<()> {
        if !self.start(Bytes::new()) {
            bail!("worker {} refused to start", self.worker.worker_id());
        }
        if !self.configure(Bytes::copy_from_slice(configuration.as_bytes())) {
            bail!(
                "worker {} rejected configuration {configuration:?}",
                self.worker.worker_id()
            );
        }
        Ok(())
    }

    /// 打开一个请求流；扩展拒绝创建上下文时返回 `None`。
    pub fn open_request(&mut self) -> Option<ContextId> {
        let context = ContextId::new(self.next_context);
        self.next_context = self.next_context.wrapping_add(1);
        self.host.open_stream(context);
        if self.worker.on_context_create(context) {
            Some(context)
        } else {
            self.host.close_stream(context);
            None
        }
    }

    pub fn response_headers(
        &mut self,
        context: ContextId,
        headers: &[(&str, &str)],
        end_of_stream: bool,
    ) -> FilterStatus {
        self.host.set_response_headers(context, pairs(headers));
        self.host.enter(Some(context));
        let status =
            self.worker
                .on_response_headers(&self.host, context, headers.len(), end_of_stream);
        self.host.enter(None);
        status
    }

    pub fn pending_calls(&self) -> Vec<PendingCall> {
        self.host.pending_calls()
    }

    /// 以上游应答完成出站调用；完成回调以根上下文身份投递。
    pub fn complete_call(&mut self, token: CallToken, response: CallResponse) {
        let header_count = response.headers.len();
        let body_size = response.body.len();
        let trailer_count = response.trailers.len();
        if self.host.begin_completion(token, Some(response)).is_none() {
            debug!(token = %token, "delivering completion for a call the host never issued");
        }
        self.worker
            .on_call_response(&self.host, token, header_count, body_size, trailer_count);
        self.host.end_completion();
    }

    /// 以失败（无响应头）完成出站调用，对应超时或连接失败。
    pub fn fail_call(&mut self, token: CallToken) {
        if self.host.begin_completion(token, None).is_none() {
            debug!(token = %token, "delivering failure for a call the host never issued");
        }
        self.worker.on_call_response(&self.host, token, 0, 0, 0);
        self.host.end_completion();
    }

    /// 宿主销毁请求流；返回 `false` 表示扩展延后回收。
    pub fn close_request(&mut self, context: ContextId) -> bool {
        self.worker.on_context_done(context)
    }

    pub fn teardown(&mut self) -> bool {
        self.host.enter(None);
        let done = self.worker.on_teardown_begin(&self.host);
        self.worker.on_teardown_complete();
        done
    }

    pub fn local_responses(&self, context: ContextId) -> Vec<LocalResponse> {
        self.host
            .stream(context)
            .map(|stream| stream.local_responses)
            .unwrap_or_default()
    }

    /// 原始响应上首个同名头部的值。
    pub fn response_header(&self, context: ContextId, name: &str) -> Option<String> {
        self.host.stream(context).and_then(|stream| {
            stream
                .response_headers
                .into_iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }
}

/// 多工作线程进程：共享注册表与共享存储。
#[derive(Debug)]
pub struct SimProcess {
    registry: Arc<ExtensionRegistry>,
    store: Arc<SharedStore>,
    next_worker: AtomicU32,
}

impl SimProcess {
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            store: Arc::new(SharedStore::new()),
            next_worker: AtomicU32::new(1),
        }
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    /// 为新工作线程实例化扩展；返回值不是 `Send`，须在目标线程内调用。
    pub fn worker(&self, extension: &str) -> Result<SimWorker> {
        let id = WorkerId::new(self.next_worker.fetch_add(1, Ordering::AcqRel));
        SimWorker::new(&self.registry, extension, id, Arc::clone(&self.store))
    }
}
