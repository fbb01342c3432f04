//! 标识符契约：工作线程、上下文、出站调用令牌与 CAS 版本戳。
//!
//! # 设计动机（Why）
//! - 宿主 ABI 中所有标识都是裸 `u32`，混用极易把调用令牌当成上下文 ID 传回宿主；
//! - 统一以新类型包装，编译期即可阻止“令牌 ↔ 上下文”的错配。
//!
//! # 契约（What）
//! - 所有类型均为 `Copy + Eq + Hash`，可直接作为 `HashMap` 键；
//! - `Display` 输出原始数值，便于与宿主侧日志对齐。

use core::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// 以宿主提供的原始值构造标识。
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// 返回原始数值，用于回传宿主 ABI。
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

numeric_id!(
    /// 工作线程标识。
    ///
    /// 在 Proxy-Wasm 宿主中等价于根上下文 ID：每个工作线程恰好持有一个根上下文，
    /// 其 ID 在线程生命周期内保持稳定。
    WorkerId
);

numeric_id!(
    /// 请求上下文标识，由宿主在请求开始时分配，生命周期内唯一且不复用。
    ContextId
);

numeric_id!(
    /// 出站调用令牌。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：替代“绑定成员函数的回调闭包”，以显式的续体值把完成回调路由回发起调用的上下文；
    /// - **契约 (What)**：由宿主在受理调用时签发，每个令牌只会收到一次完成回调；
    /// - **风险 (Trade-offs)**：令牌本身不携带上下文信息，必须经由
    ///   [`CallBroker`](crate::broker::CallBroker) 解析。
    CallToken
);

numeric_id!(
    /// 共享数据的 CAS 版本戳。
    ///
    /// 读取共享值时随快照一并返回；写入时携带该戳，宿主仅在期间无其他写者提交时接受写入。
    CasStamp
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_raw_values() {
        assert_eq!(ContextId::new(7).get(), 7);
        assert_eq!(CallToken::from(9).to_string(), "9");
        assert_ne!(WorkerId::new(1), WorkerId::new(2));
    }
}
