#![doc = "spark-wasm-proxy: 内置扩展的 Proxy-Wasm 入口。"]
#![doc = ""]
#![doc = "- [`binding`]：根 ID 解析与扩展实例化，与目标架构无关，可在本地测试；"]
#![doc = "- `host`/`shim`（仅 `wasm32`）：把 SDK 的宿主调用与上下文回调接到 [`spark_wasm_core::ExtensionWorker`]。"]
#![doc = ""]
#![doc = "宿主以插件配置中的 `root_id`（`http-call` 或 `sequence-number`）选择扩展；"]
#![doc = "同一 `.wasm` 可在一个 VM 内同时承载两个扩展的根实例。"]

pub mod binding;

#[cfg(target_arch = "wasm32")]
mod host;
#[cfg(target_arch = "wasm32")]
mod shim;
