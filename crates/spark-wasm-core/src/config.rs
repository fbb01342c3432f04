//! 扩展配置解析。
//!
//! 宿主只交付一段不透明字节。这里约定其内容为 JSON 对象，先经 `serde` 反序列化出结构，
//! 再由 [`Validate`] 做字段级约束检查；任何一步失败都返回 [`ConfigError`]，由调用方拒绝配置，
//! 不回落到硬编码默认值。

use serde::de::DeserializeOwned;

use crate::error::ConfigError;

/// 反序列化之后的字段级校验。
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// 解析必须显式提供的配置；空白缓冲区返回 [`ConfigError::Empty`]。
pub fn parse_json<T>(raw: &[u8]) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Validate,
{
    if is_blank(raw) {
        return Err(ConfigError::Empty);
    }
    decode(raw)
}

/// 解析可选配置；空白缓冲区取 `T::default()`。
pub fn parse_json_or_default<T>(raw: &[u8]) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Validate + Default,
{
    if is_blank(raw) {
        let value = T::default();
        value.validate()?;
        return Ok(value);
    }
    decode(raw)
}

/// 校验字符串字段非空。
pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(u8::is_ascii_whitespace)
}

fn decode<T>(raw: &[u8]) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Validate,
{
    let text = core::str::from_utf8(raw).map_err(|err| ConfigError::Malformed {
        detail: format!("configuration is not valid utf-8: {err}"),
    })?;
    let value: T = serde_json::from_str(text).map_err(|err| ConfigError::Malformed {
        detail: err.to_string(),
    })?;
    value.validate()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        #[serde(default)]
        name: String,
    }

    impl Validate for Sample {
        fn validate(&self) -> Result<(), ConfigError> {
            if self.name.contains(' ') {
                return Err(ConfigError::invalid("name", "must not contain spaces"));
            }
            Ok(())
        }
    }

    #[test]
    fn blank_buffers_are_empty_or_default() {
        assert_eq!(parse_json::<Sample>(b"  \n"), Err(ConfigError::Empty));
        assert_eq!(parse_json_or_default::<Sample>(b""), Ok(Sample::default()));
    }

    #[test]
    fn syntax_and_unknown_fields_are_malformed() {
        assert!(matches!(
            parse_json::<Sample>(b"{\"name\":"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            parse_json::<Sample>(b"{\"nmae\":\"x\"}"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            parse_json::<Sample>(&[0xff, 0xfe]),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn validation_runs_after_decode() {
        assert_eq!(
            parse_json::<Sample>(b"{\"name\":\"a b\"}"),
            Err(ConfigError::invalid("name", "must not contain spaces"))
        );
        assert_eq!(
            parse_json::<Sample>(b"{\"name\":\"ab\"}"),
            Ok(Sample { name: "ab".into() })
        );
    }

    #[test]
    fn non_empty_rule() {
        assert!(require_non_empty("upstream", " ").is_err());
        assert!(require_non_empty("upstream", "cluster").is_ok());
    }
}
