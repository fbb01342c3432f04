//! 根 ID 到扩展实例的绑定。
//!
//! 宿主先创建根上下文，之后才能通过属性 `plugin_root_id` 读到它所服务的扩展名；
//! 因此实例化延后到 `on_vm_start`/`on_configure` 中首次可读到根 ID 的时刻。

use std::sync::OnceLock;

use spark_wasm_core::{ExtensionRegistry, ExtensionWorker, FilterStatus, RegistryError, WorkerId};
use spark_wasm_filters::builtin_registry;
use tracing::{info, warn};

/// 宿主属性路径：当前根上下文的根 ID。
pub const ROOT_ID_PROPERTY: &str = "plugin_root_id";

static REGISTRY: OnceLock<Result<ExtensionRegistry, RegistryError>> = OnceLock::new();

/// 进程级内置扩展注册表，首次访问时构建。
pub fn registry() -> Result<&'static ExtensionRegistry, RegistryError> {
    REGISTRY
        .get_or_init(builtin_registry)
        .as_ref()
        .map_err(Clone::clone)
}

/// 解析宿主返回的根 ID 属性值；缺失、非 UTF-8 或空白均视为未提供。
pub fn decode_root_id(raw: Option<&[u8]>) -> Option<String> {
    let text = std::str::from_utf8(raw?).ok()?.trim();
    (!text.is_empty()).then(|| text.to_owned())
}

/// 为根上下文实例化扩展。
pub fn instantiate(
    root_id: &str,
    worker: WorkerId,
) -> Result<Box<dyn ExtensionWorker>, RegistryError> {
    match registry()?.create_worker(root_id, worker) {
        Ok(instance) => {
            info!(worker = %worker, root_id, "extension bound");
            Ok(instance)
        }
        Err(err) => {
            warn!(worker = %worker, root_id, error = %err, "no extension for root id");
            Err(err)
        }
    }
}

/// 过滤结果是否要求宿主暂停迭代。
pub fn pauses(status: FilterStatus) -> bool {
    matches!(status, FilterStatus::StopIteration)
}
