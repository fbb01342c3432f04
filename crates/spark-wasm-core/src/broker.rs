//! # CallBroker：出站调用续体表
//!
//! ## 核心意图（Why）
//! - 请求上下文发起出站调用后即挂起，完成回调由宿主在之后的某个执行轮次投递，且只携带调用令牌；
//! - 续体不再是“绑定到对象成员函数的闭包”，而是显式的 [`CallToken`]：本表把令牌解析回发起调用的
//!   [`ContextId`]，由工作线程分发器据此恢复原请求上下文。
//!
//! ## 行为契约（What）
//! - `register`：同一上下文至多一个在途调用，重复登记返回 [`CallDispatchError::AlreadyOutstanding`]；
//! - `resolve`：单次消费，解析成功即删除条目，重复或未知令牌返回 `None`；
//! - `outstanding`：供分发器在宿主请求销毁上下文时判断是否需要延后回收。
//!
//! ## 风险提示（Trade-offs）
//! - 表按工作线程各持一份，不做任何同步：工作线程内所有回调串行执行，跨线程从不共享本表。

use std::collections::HashMap;

use crate::error::CallDispatchError;
use crate::ids::{CallToken, ContextId};

/// 出站调用的完成通知。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallCompletion {
    pub token: CallToken,
    pub header_count: usize,
    pub body_size: usize,
    pub trailer_count: usize,
}

impl CallCompletion {
    /// 宿主以零个响应头表示调用失败（超时、连接错误）。
    pub fn outcome(&self) -> CallOutcome {
        if self.header_count == 0 {
            CallOutcome::Failed
        } else {
            CallOutcome::Responded
        }
    }
}

/// 出站调用的结局。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    /// 上游返回了响应，可读取 `CallResponseHeaders` 与响应体。
    Responded,
    /// 超时或网络失败；没有可读的响应头。
    Failed,
}

/// 令牌 ↔ 上下文的双向索引。
#[derive(Debug, Default)]
pub struct CallBroker {
    by_token: HashMap<CallToken, ContextId>,
    by_context: HashMap<ContextId, CallToken>,
}

impl CallBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 检查上下文是否允许发起新的出站调用。
    pub fn ensure_idle(&self, context: ContextId) -> Result<(), CallDispatchError> {
        match self.by_context.get(&context) {
            Some(token) => Err(CallDispatchError::AlreadyOutstanding {
                context,
                token: *token,
            }),
            None => Ok(()),
        }
    }

    /// 登记宿主已受理的调用。
    pub fn register(
        &mut self,
        context: ContextId,
        token: CallToken,
    ) -> Result<(), CallDispatchError> {
        self.ensure_idle(context)?;
        self.by_token.insert(token, context);
        self.by_context.insert(context, token);
        Ok(())
    }

    /// 消费令牌并返回其所属上下文。
    pub fn resolve(&mut self, token: CallToken) -> Option<ContextId> {
        let context = self.by_token.remove(&token)?;
        self.by_context.remove(&context);
        Some(context)
    }

    /// 上下文当前在途的调用令牌。
    pub fn outstanding(&self, context: ContextId) -> Option<CallToken> {
        self.by_context.get(&context).copied()
    }

    /// 丢弃上下文的在途调用，返回被丢弃的令牌。
    pub fn forget(&mut self, context: ContextId) -> Option<CallToken> {
        let token = self.by_context.remove(&context)?;
        self.by_token.remove(&token);
        Some(token)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}
