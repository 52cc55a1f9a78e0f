//! 钩子注册表。
//!
//! 服务的可编程扩展点：连接认证（`onConnect`）、生命周期
//! （`onStart`/`onClose`）、消息载荷校验，以及每个命令的前置/
//! 后置钩子。钩子是装箱的异步闭包，注册表在服务构造时冻结。
//!
//! 前置钩子可以改写参数（改写后仍须满足原命令的参数模式）、
//! 带结果短路，或以错误短路；后置钩子可以改写结果。钩子返回的
//! 错误会取代命令本身的结果。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use domain::{ChatError, UserName};
use serde_json::Value;

use crate::commands::CommandContext;

pub type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// 前置钩子的裁决。
#[derive(Debug, Clone)]
pub enum BeforeOutcome {
    /// 继续执行，携带（可能被改写的）参数。
    Proceed(Vec<Value>),
    /// 短路：直接以这些结果应答，不再分发。
    Complete(Vec<Value>),
}

pub type BeforeHook = Arc<
    dyn Fn(CommandContext, Vec<Value>) -> HookFuture<Result<BeforeOutcome, ChatError>>
        + Send
        + Sync,
>;

pub type AfterHook = Arc<
    dyn Fn(CommandContext, Vec<Value>, Vec<Value>) -> HookFuture<Result<Vec<Value>, ChatError>>
        + Send
        + Sync,
>;

/// 连接钩子：由原始认证载荷得出用户名。
pub type ConnectHook =
    Arc<dyn Fn(Value) -> HookFuture<Result<UserName, ChatError>> + Send + Sync>;

pub type LifecycleHook = Arc<dyn Fn() -> HookFuture<Result<(), ChatError>> + Send + Sync>;

/// 消息载荷校验钩子；注册后取代默认的 `textMessage` 约定。
pub type MessageChecker = Arc<dyn Fn(&Value) -> Result<(), ChatError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct HookRegistry {
    before: HashMap<String, BeforeHook>,
    after: HashMap<String, AfterHook>,
    pub on_connect: Option<ConnectHook>,
    pub on_start: Option<LifecycleHook>,
    pub on_close: Option<LifecycleHook>,
    pub direct_message_checker: Option<MessageChecker>,
    pub room_message_checker: Option<MessageChecker>,
}

impl HookRegistry {
    pub fn set_before(&mut self, command: impl Into<String>, hook: BeforeHook) {
        self.before.insert(command.into(), hook);
    }

    pub fn set_after(&mut self, command: impl Into<String>, hook: AfterHook) {
        self.after.insert(command.into(), hook);
    }

    pub fn before(&self, command: &str) -> Option<&BeforeHook> {
        self.before.get(command)
    }

    pub fn after(&self, command: &str) -> Option<&AfterHook> {
        self.after.get(command)
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before", &self.before.keys().collect::<Vec<_>>())
            .field("after", &self.after.keys().collect::<Vec<_>>())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_start", &self.on_start.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish_non_exhaustive()
    }
}
