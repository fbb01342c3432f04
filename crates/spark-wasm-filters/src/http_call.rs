//! # http-call：在响应头阶段挂起并发起出站调用
//!
//! ## 核心意图（Why）
//! - 演示续体协议的完整往返：拦截上游响应头 → 记录原状态码 → 经宿主向另一集群发起 `GET` →
//!   挂起原请求 → 在完成回调中恢复原上下文，以原状态码合成最终响应。
//!
//! ## 状态机（What）
//! - `Created → AwaitingOutboundHeaders → Completed`；宿主拒绝出站调用时直接 `Created → Completed`，
//!   并以 500 本地响应结束请求；
//! - 原始响应永不原样放行：头部回调总是返回 [`FilterStatus::StopIteration`]；
//! - 本地响应自身再次经过过滤链时，非 `Created` 状态的头部回调直接放行。
//!
//! ## 风险提示（Trade-offs）
//! - 重新绑定生效上下文失败时仍尝试发送响应，宿主可能静默丢弃；这一情形以 `warn` 记录。

use core::time::Duration;

use serde::Deserialize;
use spark_wasm_core::{
    CallCompletion, CallDispatchError, CallOutcome, CallToken, ConfigError, ContextId,
    FilterCx, FilterStatus, LocalResponse, OutboundCall, RequestFilter, RootCx, RootExtension,
    Validate, WorkerId, config::require_non_empty, parse_json,
};
use tracing::{debug, info, warn};

/// 出站调用失败或缺少 `:status` 时写入响应体的占位符。
pub const NO_STATUS: &str = "<none>";

/// 宿主拒绝出站调用时本地响应的细节标记。
pub const DISPATCH_FAILURE_DETAILS: &str = "Failed/WASM";

/// 根实例没有可用出站目标时的 500 响应体；此时从未向宿主发起调用。
pub const UNCONFIGURED_BODY: &str = "onResponseHeaders() skipped http call, no upstream configured\n";

/// 原始响应缺少可解析的 `:status` 时沿用的状态码。
pub const FALLBACK_STATUS: u32 = 500;

fn default_path() -> String {
    "/".to_owned()
}

fn default_authority() -> String {
    "example.com".to_owned()
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// `http-call` 的插件配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpCallConfig {
    /// 宿主侧的上游集群名。
    pub upstream: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HttpCallConfig {
    pub const MAX_TIMEOUT_MS: u64 = 60_000;
}

impl Validate for HttpCallConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("upstream", &self.upstream)?;
        require_non_empty("authority", &self.authority)?;
        if !self.path.starts_with('/') {
            return Err(ConfigError::invalid("path", "must start with '/'"));
        }
        if !(1..=Self::MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ConfigError::invalid(
                "timeout_ms",
                format!("must be within 1..={}", Self::MAX_TIMEOUT_MS),
            ));
        }
        Ok(())
    }
}

/// 由配置派生、供请求上下文只读访问的出站目标。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallTarget {
    pub upstream: String,
    pub path: String,
    pub authority: String,
    pub timeout: Duration,
}

impl From<HttpCallConfig> for CallTarget {
    fn from(config: HttpCallConfig) -> Self {
        Self {
            upstream: config.upstream,
            path: config.path,
            authority: config.authority,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

impl CallTarget {
    pub fn outbound_call(&self) -> OutboundCall {
        OutboundCall::get(
            self.upstream.as_str(),
            self.path.as_str(),
            self.authority.as_str(),
            self.timeout,
        )
    }
}

/// 每个工作线程一份的 `http-call` 根实例。
#[derive(Debug)]
pub struct HttpCallRoot {
    worker: WorkerId,
    target: Option<CallTarget>,
}

impl HttpCallRoot {
    pub fn new(worker: WorkerId) -> Self {
        info!(worker = %worker, "http-call root created");
        Self {
            worker,
            target: None,
        }
    }

    /// 最近一次成功配置的出站目标；首次配置成功前为 `None`。
    pub fn target(&self) -> Option<&CallTarget> {
        self.target.as_ref()
    }

    pub fn upstream(&self) -> Option<&str> {
        self.target.as_ref().map(|target| target.upstream.as_str())
    }

    pub fn path(&self) -> Option<&str> {
        self.target.as_ref().map(|target| target.path.as_str())
    }
}

impl RootExtension for HttpCallRoot {
    type Filter = HttpCallFilter;

    fn on_configure(
        &mut self,
        cx: &RootCx<'_>,
        configuration_size: usize,
    ) -> Result<(), ConfigError> {
        let parsed = cx
            .configuration(configuration_size)
            .and_then(|raw| parse_json::<HttpCallConfig>(&raw));
        match parsed {
            Ok(config) => {
                let target = CallTarget::from(config);
                info!(
                    worker = %self.worker,
                    upstream = %target.upstream,
                    path = %target.path,
                    timeout_ms = target.timeout.as_millis() as u64,
                    "http-call configured"
                );
                self.target = Some(target);
                Ok(())
            }
            Err(err) => {
                self.target = None;
                Err(err)
            }
        }
    }

    fn create_filter(&self, context: ContextId) -> HttpCallFilter {
        HttpCallFilter::new(context)
    }

    fn on_teardown_begin(&mut self, _cx: &RootCx<'_>) -> bool {
        info!(worker = %self.worker, "http-call root done");
        true
    }

    fn on_teardown_complete(&mut self) {
        info!(worker = %self.worker, "http-call root deleted");
    }
}

/// 请求上下文所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpCallState {
    Created,
    AwaitingOutboundHeaders { token: CallToken },
    Completed,
}

/// 单个请求的 `http-call` 上下文。
#[derive(Debug)]
pub struct HttpCallFilter {
    context: ContextId,
    state: HttpCallState,
    saved_status: Option<u32>,
}

impl HttpCallFilter {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            state: HttpCallState::Created,
            saved_status: None,
        }
    }

    pub fn state(&self) -> HttpCallState {
        self.state
    }

    /// 头部回调中记录的原始状态码。
    pub fn saved_status(&self) -> Option<u32> {
        self.saved_status
    }

    fn capture_status(&mut self, cx: &FilterCx<'_, HttpCallRoot>) {
        let status = match cx.response_status() {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(context = %self.context, fallback = FALLBACK_STATUS, "response carries no :status");
                FALLBACK_STATUS
            }
            Err(status) => {
                warn!(context = %self.context, %status, fallback = FALLBACK_STATUS, "unreadable :status");
                FALLBACK_STATUS
            }
        };
        self.saved_status = Some(status);
    }

    fn reject(&mut self, cx: &mut FilterCx<'_, HttpCallRoot>, err: &CallDispatchError) {
        warn!(context = %self.context, error = %err, "outbound call rejected");
        let body = match (err, err.host_status()) {
            (CallDispatchError::Unconfigured { .. }, _) => UNCONFIGURED_BODY.to_owned(),
            (_, Some(status)) => {
                format!("onResponseHeaders() failed http call, status is {status:?}\n")
            }
            (_, None) => format!("onResponseHeaders() failed http call, {err}\n"),
        };
        let response = LocalResponse::new(500, body).with_details(DISPATCH_FAILURE_DETAILS);
        if let Err(err) = cx.send_response(&response) {
            warn!(context = %self.context, error = %err, "failed to send rejection response");
        }
        self.state = HttpCallState::Completed;
    }
}

impl RequestFilter<HttpCallRoot> for HttpCallFilter {
    fn on_response_headers(
        &mut self,
        cx: &mut FilterCx<'_, HttpCallRoot>,
        header_count: usize,
        end_of_stream: bool,
    ) -> FilterStatus {
        debug!(context = %self.context, header_count, end_of_stream, "http-call response headers");
        if self.state != HttpCallState::Created {
            debug!(context = %self.context, state = ?self.state, "headers after dispatch pass through");
            return FilterStatus::Continue;
        }

        self.capture_status(cx);

        // 配置热更新被拒绝后，已存在的上下文会看到空目标。
        let Some(call) = cx.root().target().map(CallTarget::outbound_call) else {
            let err = CallDispatchError::Unconfigured {
                context: self.context,
            };
            self.reject(cx, &err);
            return FilterStatus::StopIteration;
        };

        match cx.dispatch_call(&call) {
            Ok(token) => {
                info!(
                    context = %self.context,
                    token = %token,
                    upstream = %call.upstream,
                    path = call.header(":path").unwrap_or("/"),
                    "outbound call dispatched"
                );
                self.state = HttpCallState::AwaitingOutboundHeaders { token };
            }
            Err(err) => self.reject(cx, &err),
        }
        FilterStatus::StopIteration
    }

    fn on_call_completed(&mut self, cx: &mut FilterCx<'_, HttpCallRoot>, completion: CallCompletion) {
        debug!(
            context = %self.context,
            token = %completion.token,
            header_count = completion.header_count,
            body_size = completion.body_size,
            trailer_count = completion.trailer_count,
            "http-call completion"
        );
        let HttpCallState::AwaitingOutboundHeaders { token } = self.state else {
            warn!(context = %self.context, state = ?self.state, "completion outside awaiting state ignored");
            return;
        };
        if token != completion.token {
            warn!(context = %self.context, expected = %token, got = %completion.token, "completion token mismatch ignored");
            return;
        }

        let status = match completion.outcome() {
            CallOutcome::Responded => match cx.call_response_status() {
                Ok(Some(status)) => status,
                Ok(None) => NO_STATUS.to_owned(),
                Err(status) => {
                    warn!(context = %self.context, %status, "call response status unreadable");
                    NO_STATUS.to_owned()
                }
            },
            CallOutcome::Failed => {
                info!(context = %self.context, token = %token, "outbound call failed without headers");
                NO_STATUS.to_owned()
            }
        };

        if let Err(err) = cx.rebind_active() {
            warn!(context = %self.context, error = %err, "rebind failed, emitting response anyway");
        }

        let original = self.saved_status.unwrap_or(FALLBACK_STATUS);
        let body = format!(
            "httpCall() yielded status {status} and a buffer of {} bytes.\n",
            completion.body_size
        );
        match cx.send_response(&LocalResponse::new(original, body)) {
            Ok(()) => debug!(context = %self.context, status = original, "final response sent"),
            Err(err) => warn!(context = %self.context, error = %err, "failed to send final response"),
        }
        self.state = HttpCallState::Completed;
    }
}
