//! 聊天引擎核心领域模型
//!
//! 包含用户名/房间名等值对象、封闭的错误类型、私聊许可记录、
//! 房间状态机（访问名单、消息历史、成员集合）等纯同步逻辑。
//! 这一层不做任何 I/O，所有并发控制由上层持锁完成。

pub mod direct_messaging;
pub mod errors;
pub mod message;
pub mod room;
pub mod value_objects;

// 重新导出常用类型
pub use direct_messaging::*;
pub use errors::*;
pub use message::*;
pub use room::*;
pub use value_objects::*;
