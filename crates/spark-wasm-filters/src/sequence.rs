//! sequence-number：为每个响应附加进程内全局唯一的递增序号。
//!
//! 序号来自 [`SharedCounter`]，无论宿主开启多少工作线程，每个响应拿到的值都互不相同。
//! 计数失败时不添加头部，仅以 `warn` 记录，响应照常放行。
//!
//! 配置分两层：VM 配置给出基线 [`SequenceConfig`]，插件配置以 [`SequenceOverrides`]
//! 逐字段覆盖基线；插件配置为空时基线原样生效。

use serde::Deserialize;
use spark_wasm_core::{
    BufferKind, ConfigError, ContextId, ExtensionError, FilterCx, FilterStatus, InitPolicy,
    RequestFilter, RetryPolicy, RootCx, RootExtension, SharedCounter, Validate, WorkerId,
    config::require_non_empty, parse_json_or_default,
};
use tracing::{debug, info, warn};

/// 默认的响应头名称。
pub const DEFAULT_HEADER: &str = "sequence-number";

/// `sequence-number` 的配置；空缓冲区取全部默认值。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequenceConfig {
    pub shared_key: String,
    pub header: String,
    pub init: InitPolicy,
    /// CAS 尝试上限，`0` 表示不设上限。
    pub max_attempts: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            shared_key: SharedCounter::DEFAULT_KEY.to_owned(),
            header: DEFAULT_HEADER.to_owned(),
            init: InitPolicy::default(),
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Validate for SequenceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("shared_key", &self.shared_key)?;
        require_non_empty("header", &self.header)?;
        if self.header.starts_with(':') {
            return Err(ConfigError::invalid("header", "pseudo headers cannot be added"));
        }
        if self.header.bytes().any(|b| b.is_ascii_whitespace() || b == b':') {
            return Err(ConfigError::invalid("header", "must be a single header token"));
        }
        Ok(())
    }
}

impl SequenceConfig {
    /// 以插件配置覆盖本基线，合并结果重新校验。
    pub fn overlay(&self, overrides: SequenceOverrides) -> Result<SequenceConfig, ConfigError> {
        let merged = SequenceConfig {
            shared_key: overrides
                .shared_key
                .unwrap_or_else(|| self.shared_key.clone()),
            header: overrides.header.unwrap_or_else(|| self.header.clone()),
            init: overrides.init.unwrap_or(self.init),
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// 插件配置：出现的字段覆盖 VM 基线，缺省字段沿用基线。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequenceOverrides {
    pub shared_key: Option<String>,
    pub header: Option<String>,
    pub init: Option<InitPolicy>,
    pub max_attempts: Option<u32>,
}

impl Validate for SequenceOverrides {
    // 单独的覆盖项无法判定合法性，校验留给合并结果。
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// 每个工作线程一份的 `sequence-number` 根实例。
#[derive(Debug)]
pub struct SequenceRoot {
    worker: WorkerId,
    /// VM 配置解析出的基线。
    base: SequenceConfig,
    counter: SharedCounter,
    header: String,
    init: InitPolicy,
}

impl SequenceRoot {
    pub fn new(worker: WorkerId) -> Self {
        info!(worker = %worker, "sequence-number root created");
        Self {
            worker,
            base: SequenceConfig::default(),
            counter: SharedCounter::default(),
            header: DEFAULT_HEADER.to_owned(),
            init: InitPolicy::default(),
        }
    }

    pub fn counter(&self) -> &SharedCounter {
        &self.counter
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn init_policy(&self) -> InitPolicy {
        self.init
    }

    fn apply(&mut self, config: SequenceConfig) {
        self.counter = SharedCounter::new(config.shared_key)
            .with_retry(RetryPolicy::bounded(config.max_attempts));
        self.header = config.header;
        self.init = config.init;
    }

    /// 按当前策略初始化计数器；失败只记录，不阻断启动。
    fn initialize_counter(&self, cx: &RootCx<'_>) {
        match self.counter.initialize(cx.host(), self.init) {
            Ok(outcome) => {
                debug!(worker = %self.worker, key = self.counter.key(), ?outcome, "counter ready");
            }
            Err(err) => {
                warn!(worker = %self.worker, error = %err, "counter initialization failed");
            }
        }
    }
}

impl RootExtension for SequenceRoot {
    type Filter = SequenceFilter;

    fn on_vm_start(&mut self, cx: &RootCx<'_>, vm_configuration_size: usize) -> bool {
        info!(worker = %self.worker, vm_configuration_size, "sequence-number root starting");
        let parsed = cx
            .read_buffer(BufferKind::VmConfiguration, vm_configuration_size)
            .map_err(|status| ConfigError::Unreadable { status })
            .and_then(|raw| parse_json_or_default::<SequenceConfig>(&raw));
        match parsed {
            Ok(config) => {
                self.base = config.clone();
                self.apply(config);
            }
            Err(err) => {
                warn!(worker = %self.worker, error = %err, "vm configuration rejected");
                return false;
            }
        }
        self.initialize_counter(cx);
        true
    }

    fn on_configure(
        &mut self,
        cx: &RootCx<'_>,
        configuration_size: usize,
    ) -> Result<(), ConfigError> {
        let raw = cx.configuration(configuration_size)?;
        let overrides = parse_json_or_default::<SequenceOverrides>(&raw)?;
        let config = self.base.overlay(overrides)?;
        let rekeyed = config.shared_key != self.counter.key();
        self.apply(config);
        info!(
            worker = %self.worker,
            key = self.counter.key(),
            header = %self.header,
            policy = ?self.init,
            "sequence-number configured"
        );
        if rekeyed {
            self.initialize_counter(cx);
        }
        Ok(())
    }

    fn create_filter(&self, context: ContextId) -> SequenceFilter {
        SequenceFilter { context }
    }

    fn on_teardown_begin(&mut self, _cx: &RootCx<'_>) -> bool {
        info!(worker = %self.worker, "sequence-number root done");
        true
    }

    fn on_teardown_complete(&mut self) {
        info!(worker = %self.worker, "sequence-number root deleted");
    }
}

/// 单个请求的 `sequence-number` 上下文。
#[derive(Debug)]
pub struct SequenceFilter {
    context: ContextId,
}

impl RequestFilter<SequenceRoot> for SequenceFilter {
    fn on_response_headers(
        &mut self,
        cx: &mut FilterCx<'_, SequenceRoot>,
        header_count: usize,
        end_of_stream: bool,
    ) -> FilterStatus {
        debug!(context = %self.context, header_count, end_of_stream, "sequence-number response headers");
        let root = cx.root();
        match root.counter().increment(cx.host()) {
            Ok(increment) => {
                if increment.contended() {
                    debug!(context = %self.context, attempts = increment.attempts, "counter contended");
                }
                let value = increment.value.to_string();
                if let Err(status) = cx.add_response_header(root.header(), &value) {
                    warn!(context = %self.context, %status, "failed to add sequence header");
                }
            }
            Err(err) => {
                let err = ExtensionError::from(err);
                warn!(context = %self.context, code = err.code(), error = %err, "sequence number unavailable, header skipped");
            }
        }
        FilterStatus::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_configuration_takes_defaults() {
        let config = parse_json_or_default::<SequenceConfig>(b"").unwrap();
        assert_eq!(config, SequenceConfig::default());
        assert_eq!(config.shared_key, "counter");
        assert_eq!(config.header, "sequence-number");
        assert_eq!(config.init, InitPolicy::IfAbsent);
        assert_eq!(config.max_attempts, 1024);
    }

    #[test]
    fn partial_configuration_keeps_other_defaults() {
        let config =
            parse_json_or_default::<SequenceConfig>(br#"{"init":"reset","max_attempts":0}"#)
                .unwrap();
        assert_eq!(config.init, InitPolicy::Reset);
        assert_eq!(config.header, DEFAULT_HEADER);

        let mut root = SequenceRoot::new(WorkerId::new(1));
        root.apply(config);
        assert_eq!(root.counter().retry_policy(), RetryPolicy::unbounded());
        assert_eq!(root.init_policy(), InitPolicy::Reset);
    }

    #[test]
    fn header_must_be_a_plain_token() {
        for bad in [r#"{"header":":status"}"#, r#"{"header":"a b"}"#, r#"{"header":""}"#] {
            assert!(
                matches!(
                    parse_json_or_default::<SequenceConfig>(bad.as_bytes()),
                    Err(ConfigError::Invalid { field: "header", .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn plugin_fields_override_the_vm_baseline() {
        let base =
            parse_json_or_default::<SequenceConfig>(br#"{"shared_key":"orders","init":"reset"}"#)
                .unwrap();

        let empty = parse_json_or_default::<SequenceOverrides>(b"").unwrap();
        assert_eq!(base.overlay(empty).unwrap(), base);

        let overrides =
            parse_json_or_default::<SequenceOverrides>(br#"{"header":"x-seq"}"#).unwrap();
        let merged = base.overlay(overrides).unwrap();
        assert_eq!(merged.shared_key, "orders");
        assert_eq!(merged.init, InitPolicy::Reset);
        assert_eq!(merged.header, "x-seq");

        let bad = parse_json_or_default::<SequenceOverrides>(br#"{"shared_key":" "}"#).unwrap();
        assert!(matches!(
            base.overlay(bad),
            Err(ConfigError::Invalid { field: "shared_key", .. })
        ));
    }

    #[test]
    fn unknown_policy_is_malformed() {
        assert!(matches!(
            parse_json_or_default::<SequenceConfig>(br#"{"init":"sometimes"}"#),
            Err(ConfigError::Malformed { .. })
        ));
    }
}
