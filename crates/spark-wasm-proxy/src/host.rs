//! 基于 SDK `hostcalls` 的 [`HostAbi`] 实现。

use bytes::Bytes;
use proxy_wasm::hostcalls;
use proxy_wasm::types::{BufferType, MapType, Status};
use spark_wasm_core::{
    BufferKind, CallToken, CasStamp, ContextId, HeaderMapKind, HostAbi, HostStatus,
    LocalResponse, OutboundCall, SharedDataAbi, SharedValue,
};
use tracing::debug;

/// 当前 VM 的宿主句柄；所有调用都作用于宿主的生效上下文。
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ProxyWasmHost;

fn status(status: Status) -> HostStatus {
    match status {
        Status::NotFound => HostStatus::NotFound,
        Status::BadArgument => HostStatus::BadArgument,
        Status::SerializationFailure => HostStatus::SerializationFailure,
        Status::ParseFailure => HostStatus::ParseFailure,
        Status::Empty => HostStatus::Empty,
        Status::CasMismatch => HostStatus::CasMismatch,
        _ => HostStatus::InternalFailure,
    }
}

fn buffer(kind: BufferKind) -> BufferType {
    match kind {
        BufferKind::PluginConfiguration => BufferType::PluginConfiguration,
        BufferKind::VmConfiguration => BufferType::VmConfiguration,
        BufferKind::CallResponseBody => BufferType::HttpCallResponseBody,
    }
}

fn map(kind: HeaderMapKind) -> MapType {
    match kind {
        HeaderMapKind::ResponseHeaders => MapType::HttpResponseHeaders,
        HeaderMapKind::CallResponseHeaders => MapType::HttpCallResponseHeaders,
    }
}

fn pairs(headers: &[(String, String)]) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

impl SharedDataAbi for ProxyWasmHost {
    fn get_shared_data(&self, key: &str) -> Result<Option<SharedValue>, HostStatus> {
        match hostcalls::get_shared_data(key).map_err(status)? {
            (Some(value), Some(cas)) => Ok(Some(SharedValue::new(value, CasStamp::new(cas)))),
            (None, _) => Ok(None),
            // 有值却无版本戳时无法参与 CAS。
            (Some(_), None) => Err(HostStatus::InternalFailure),
        }
    }

    fn set_shared_data(
        &self,
        key: &str,
        value: &[u8],
        expected: Option<CasStamp>,
    ) -> Result<(), HostStatus> {
        hostcalls::set_shared_data(key, Some(value), expected.map(CasStamp::get)).map_err(status)
    }
}

impl HostAbi for ProxyWasmHost {
    fn get_buffer(
        &self,
        kind: BufferKind,
        offset: usize,
        max_size: usize,
    ) -> Result<Option<Bytes>, HostStatus> {
        hostcalls::get_buffer(buffer(kind), offset, max_size)
            .map(|raw| raw.map(Bytes::from))
            .map_err(status)
    }

    fn get_header(&self, kind: HeaderMapKind, name: &str) -> Result<Option<String>, HostStatus> {
        hostcalls::get_map_value(map(kind), name).map_err(status)
    }

    fn set_header(
        &self,
        kind: HeaderMapKind,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), HostStatus> {
        hostcalls::set_map_value(map(kind), name, value).map_err(status)
    }

    fn add_header(&self, kind: HeaderMapKind, name: &str, value: &str) -> Result<(), HostStatus> {
        hostcalls::add_map_value(map(kind), name, value).map_err(status)
    }

    fn dispatch_call(&self, call: &OutboundCall) -> Result<CallToken, HostStatus> {
        let body = (!call.body.is_empty()).then_some(call.body.as_ref());
        hostcalls::dispatch_http_call(
            &call.upstream,
            pairs(&call.headers),
            body,
            pairs(&call.trailers),
            call.timeout,
        )
        .map(CallToken::new)
        .map_err(status)
    }

    fn send_response(&self, response: &LocalResponse) -> Result<(), HostStatus> {
        // SDK 0.2 的本地响应原语不携带细节标记，只在日志中保留。
        if !response.details.is_empty() {
            debug!(status = response.status, details = %response.details, "local response details");
        }
        hostcalls::send_http_response(
            response.status,
            pairs(&response.headers),
            Some(response.body.as_ref()),
        )
        .map_err(status)
    }

    fn set_effective_context(&self, context: ContextId) -> Result<(), HostStatus> {
        hostcalls::set_effective_context(context.get()).map_err(status)
    }
}
