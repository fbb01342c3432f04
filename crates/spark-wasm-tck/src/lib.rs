#![doc = "spark-wasm-tck: 扩展契约测试套件。"]
#![doc = ""]
#![doc = "提供内存共享存储 [`SharedStore`]、可注入故障的单工作线程宿主 [`SimHost`]，"]
#![doc = "以及按真实宿主顺序投递事件的 [`SimWorker`]/[`SimProcess`]，供扩展在原生目标上做场景测试。"]

pub mod harness;
pub mod host;
pub mod store;

pub use harness::{SimProcess, SimWorker};
pub use host::{CallResponse, PendingCall, SimHost, StreamState};
pub use store::SharedStore;

use tracing_subscriber::EnvFilter;

/// 测试日志的过滤环境变量。
pub const LOG_ENV: &str = "SPARK_WASM_LOG";

/// 安装一次性的 `fmt` 订阅者，过滤规则取自 [`LOG_ENV`]，缺省为 `warn`。
///
/// 重复调用或已有全局订阅者时静默返回。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
