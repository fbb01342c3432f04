#![deny(unsafe_code)]
#![doc = "spark-wasm-core: 代理沙箱扩展的宿主 ABI 契约、出站调用续体协议与无锁共享计数器。"]
#![doc = ""]
#![doc = "== 执行模型 =="]
#![doc = "宿主为每个工作线程创建一个根扩展实例，并为每个在途请求创建一个请求上下文；同一工作线程内的回调严格串行。"]
#![doc = "跨工作线程唯一共享的可变资源是宿主托管的共享存储，所有修改都必须经由 [`counter::SharedCounter`] 的 CAS 协议。"]
#![doc = ""]
#![doc = "== 挂起与恢复 =="]
#![doc = "请求上下文通过 [`context::FilterCx::dispatch_call`] 发起出站调用后挂起；宿主以调用令牌投递完成回调，"]
#![doc = "[`worker::WorkerDispatcher`] 经 [`broker::CallBroker`] 把令牌解析回原上下文，上下文重新绑定为生效上下文后发送最终响应。"]

pub mod abi;
pub mod broker;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod ids;
pub mod registry;
pub mod worker;

pub use abi::{
    BufferKind, HeaderMapKind, HeaderPairs, HostAbi, HostStatus, LocalResponse, OutboundCall,
    STATUS_HEADER, SharedDataAbi, SharedValue,
};
pub use broker::{CallBroker, CallCompletion, CallOutcome};
pub use config::{Validate, parse_json, parse_json_or_default};
pub use context::{FilterCx, FilterStatus, RequestFilter, RootCx, RootExtension};
pub use counter::{Increment, InitOutcome, InitPolicy, RetryPolicy, SharedCounter};
pub use error::{
    CallDispatchError, ConfigError, CounterError, ErrorCategory, ExtensionError, RebindError,
    RegistryError, ResponseError,
};
pub use ids::{CallToken, CasStamp, ContextId, WorkerId};
pub use registry::{ExtensionFactory, ExtensionRegistry, RootFactory};
pub use worker::{ExtensionWorker, RootPhase, WorkerDispatcher};
