#![deny(unsafe_code)]
#![doc = "spark-wasm-filters: 内置代理扩展。"]
#![doc = ""]
#![doc = "- [`http_call`]：在响应头阶段挂起请求、发起出站 `GET`，完成后以原状态码合成响应；"]
#![doc = "- [`sequence`]：为每个响应附加跨工作线程唯一的递增序号。"]
#![doc = ""]
#![doc = "宿主适配层通过 [`builtin_registry`] 获取注册表，并按根 ID 实例化扩展。"]

pub mod http_call;
pub mod sequence;

pub use http_call::{CallTarget, HttpCallConfig, HttpCallFilter, HttpCallRoot, HttpCallState};
pub use sequence::{SequenceConfig, SequenceFilter, SequenceOverrides, SequenceRoot};

use spark_wasm_core::{ExtensionRegistry, RegistryError};

/// `http-call` 扩展的根 ID。
pub const HTTP_CALL: &str = "http-call";

/// `sequence-number` 扩展的根 ID。
pub const SEQUENCE_NUMBER: &str = "sequence-number";

/// 将内置扩展登记到已有注册表。
pub fn register_builtin(registry: &mut ExtensionRegistry) -> Result<(), RegistryError> {
    registry.register(HTTP_CALL, HttpCallRoot::new)?;
    registry.register(SEQUENCE_NUMBER, SequenceRoot::new)?;
    Ok(())
}

/// 仅包含内置扩展的注册表。
pub fn builtin_registry() -> Result<ExtensionRegistry, RegistryError> {
    let mut registry = ExtensionRegistry::new();
    register_builtin(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_registered_once() {
        let mut registry = builtin_registry().unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec![HTTP_CALL, SEQUENCE_NUMBER]
        );
        assert_eq!(
            register_builtin(&mut registry),
            Err(RegistryError::Duplicate {
                name: HTTP_CALL.to_owned()
            })
        );
    }
}
