//! SDK 上下文回调到 [`ExtensionWorker`] 的转接。
//!
//! SDK 为每个 VM 维护一张上下文表，并在投递出站调用完成回调前，
//! 把宿主生效上下文切换到发起调用的请求上下文；本模块只负责按 ID 转发。

use std::cell::RefCell;
use std::rc::Rc;

use proxy_wasm::hostcalls;
use proxy_wasm::traits::{Context, HttpContext, RootContext};
use proxy_wasm::types::{Action, ContextType, LogLevel};
use spark_wasm_core::{CallToken, ContextId, ExtensionWorker, WorkerId};
use tracing::{debug, warn};

use crate::binding::{ROOT_ID_PROPERTY, decode_root_id, instantiate, pauses};
use crate::host::ProxyWasmHost;

proxy_wasm::main! {{
    proxy_wasm::set_log_level(LogLevel::Info);
    proxy_wasm::set_root_context(|context_id| -> Box<dyn RootContext> {
        Box::new(ProxyRoot::new(context_id))
    });
}}

type SharedWorker = Rc<RefCell<Box<dyn ExtensionWorker>>>;

/// 宿主在回调内同步重入同一工作线程时，重入的回调被放行。
fn with_worker<T>(
    worker: &SharedWorker,
    f: impl FnOnce(&mut Box<dyn ExtensionWorker>) -> T,
) -> Option<T> {
    match worker.try_borrow_mut() {
        Ok(mut guard) => Some(f(&mut guard)),
        Err(_) => {
            warn!("re-entrant host callback ignored");
            None
        }
    }
}

struct ProxyRoot {
    id: u32,
    worker: Option<SharedWorker>,
}

impl ProxyRoot {
    fn new(id: u32) -> Self {
        Self { id, worker: None }
    }

    /// 首次可读到根 ID 时实例化扩展。
    fn bind(&mut self) -> Option<SharedWorker> {
        if self.worker.is_none() {
            let raw = match hostcalls::get_property(vec![ROOT_ID_PROPERTY]) {
                Ok(raw) => raw,
                Err(status) => {
                    warn!(root = self.id, ?status, "root id property unreadable");
                    None
                }
            };
            let Some(root_id) = decode_root_id(raw.as_deref()) else {
                warn!(root = self.id, "root id missing, extension not bound");
                return None;
            };
            let worker = instantiate(&root_id, WorkerId::new(self.id)).ok()?;
            self.worker = Some(Rc::new(RefCell::new(worker)));
        }
        self.worker.clone()
    }
}

impl Context for ProxyRoot {
    fn on_done(&mut self) -> bool {
        match &self.worker {
            Some(worker) => {
                with_worker(worker, |w| w.on_teardown_begin(&ProxyWasmHost)).unwrap_or(true)
            }
            None => true,
        }
    }
}

impl Drop for ProxyRoot {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            with_worker(worker, |w| w.on_teardown_complete());
        }
    }
}

impl RootContext for ProxyRoot {
    fn on_vm_start(&mut self, vm_configuration_size: usize) -> bool {
        let Some(worker) = self.bind() else {
            return false;
        };
        with_worker(&worker, |w| w.on_vm_start(&ProxyWasmHost, vm_configuration_size))
            .unwrap_or(false)
    }

    fn on_configure(&mut self, plugin_configuration_size: usize) -> bool {
        let Some(worker) = self.bind() else {
            return false;
        };
        with_worker(&worker, |w| w.on_configure(&ProxyWasmHost, plugin_configuration_size))
            .unwrap_or(false)
    }

    fn get_type(&self) -> Option<ContextType> {
        Some(ContextType::HttpContext)
    }

    fn create_http_context(&self, context_id: u32) -> Option<Box<dyn HttpContext>> {
        let context = ContextId::new(context_id);
        let admitted = self.worker.as_ref().filter(|worker| {
            with_worker(worker, |w| w.on_context_create(context)).unwrap_or(false)
        });
        if admitted.is_none() {
            debug!(root = self.id, context = %context, "request passes through unfiltered");
        }
        // SDK 不接受空的请求上下文，未接纳的请求以直通上下文承载。
        Some(Box::new(ProxyHttp {
            context,
            worker: admitted.cloned(),
            deferred: false,
        }))
    }
}

struct ProxyHttp {
    context: ContextId,
    worker: Option<SharedWorker>,
    /// 宿主请求销毁时仍有在途调用。
    deferred: bool,
}

impl Context for ProxyHttp {
    fn on_http_call_response(
        &mut self,
        token_id: u32,
        num_headers: usize,
        body_size: usize,
        num_trailers: usize,
    ) {
        let Some(worker) = &self.worker else {
            return;
        };
        let still_held = with_worker(worker, |w| {
            w.on_call_response(
                &ProxyWasmHost,
                CallToken::new(token_id),
                num_headers,
                body_size,
                num_trailers,
            );
            w.has_context(self.context)
        });
        if self.deferred && still_held == Some(false) {
            if let Err(status) = hostcalls::done() {
                warn!(context = %self.context, ?status, "deferred context release failed");
            }
        }
    }

    fn on_done(&mut self) -> bool {
        let Some(worker) = &self.worker else {
            return true;
        };
        let released = with_worker(worker, |w| w.on_context_done(self.context)).unwrap_or(true);
        self.deferred = !released;
        released
    }
}

impl HttpContext for ProxyHttp {
    fn on_http_response_headers(&mut self, num_headers: usize, end_of_stream: bool) -> Action {
        let Some(worker) = &self.worker else {
            return Action::Continue;
        };
        let status = with_worker(worker, |w| {
            w.on_response_headers(&ProxyWasmHost, self.context, num_headers, end_of_stream)
        });
        match status {
            Some(status) if pauses(status) => Action::Pause,
            _ => Action::Continue,
        }
    }
}
