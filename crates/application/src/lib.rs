//! 应用层实现。
//!
//! 这里提供围绕领域模型的引擎逻辑：状态存储与传输层的契约及其
//! 内存实现、用户-套接字-房间的分布式关联协议、命令管线
//! （校验 → 前置钩子 → 分发 → 后置钩子）、集群总线以及对外的
//! 服务门面。

pub mod associations;
pub mod bus;
pub mod clock;
pub mod commands;
pub mod events;
pub mod hooks;
pub mod service;
pub mod state;
pub mod transport;
pub mod user;
pub mod validator;

pub use associations::{LocalUserState, UserAssociations};
pub use bus::{BusEnvelope, BusPayload};
pub use clock::{Clock, SystemClock};
pub use commands::{CommandContext, ExecOptions};
pub use events::{echo_channel, room_channel, ServerEvent, ServerNotice, SYSTEM_CHANNEL};
pub use hooks::{AfterHook, BeforeHook, BeforeOutcome, HookRegistry};
pub use service::{ChatService, ChatServiceBuilder};
pub use state::{memory::MemoryStateStore, LockGuard, StateStore};
pub use transport::{
    memory::{MemoryTransport, TestClient},
    ClientFrame, CommandAck, Transport, TransportEvent,
};
pub use user::ChatUser;
