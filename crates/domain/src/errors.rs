//! 引擎的错误定义
//!
//! 错误种类是封闭集合，名字即线上协议的一部分：客户端按
//! `wire_name` 分支处理。序列化形式由 `useRawErrorObjects`
//! 决定（结构化对象或本地化字符串）。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// 引擎错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    /// 某个位置上的参数类型不符
    #[error("command '{command}': bad argument at position {position}")]
    BadArgument { command: String, position: usize },

    /// 未知命令
    #[error("no such command: {0}")]
    NoCommand(String),

    /// 命令需要套接字上下文，或套接字已不存在
    #[error("socket is not available: {0}")]
    NoSocket(String),

    /// 目标用户不在线（或不存在）
    #[error("user is not online: {0}")]
    NoUserOnline(String),

    /// 房间不存在
    #[error("no such room: {0}")]
    NoRoom(String),

    /// 名单种类不存在
    #[error("no such list: {0}")]
    NoList(String),

    /// 权限不足
    #[error("operation is not allowed: {0}")]
    NotAllowed(String),

    /// 用户已存在
    #[error("user already exists: {0}")]
    UserExists(String),

    /// 房间已存在
    #[error("room already exists: {0}")]
    RoomExists(String),

    /// 房间正在删除
    #[error("room is removed: {0}")]
    RoomRemoved(String),

    /// 名称不符合命名规则
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// 参数个数不符
    #[error("command '{command}': expected {min}..={max} arguments, got {actual}")]
    WrongArgumentsCount {
        command: String,
        min: usize,
        max: usize,
        actual: usize,
    },

    /// 内部错误（状态存储 I/O 等）
    #[error("server error: {0}")]
    ServerError(String),
}

impl ChatError {
    pub fn bad_argument(command: impl Into<String>, position: usize) -> Self {
        Self::BadArgument {
            command: command.into(),
            position,
        }
    }

    pub fn no_command(command: impl Into<String>) -> Self {
        Self::NoCommand(command.into())
    }

    pub fn no_socket(detail: impl Into<String>) -> Self {
        Self::NoSocket(detail.into())
    }

    pub fn no_user_online(user: impl Into<String>) -> Self {
        Self::NoUserOnline(user.into())
    }

    pub fn no_room(room: impl Into<String>) -> Self {
        Self::NoRoom(room.into())
    }

    pub fn no_list(list: impl Into<String>) -> Self {
        Self::NoList(list.into())
    }

    pub fn not_allowed(detail: impl Into<String>) -> Self {
        Self::NotAllowed(detail.into())
    }

    pub fn user_exists(user: impl Into<String>) -> Self {
        Self::UserExists(user.into())
    }

    pub fn room_exists(room: impl Into<String>) -> Self {
        Self::RoomExists(room.into())
    }

    pub fn room_removed(room: impl Into<String>) -> Self {
        Self::RoomRemoved(room.into())
    }

    pub fn invalid_name(detail: impl Into<String>) -> Self {
        Self::InvalidName(detail.into())
    }

    pub fn server_error(detail: impl Into<String>) -> Self {
        Self::ServerError(detail.into())
    }

    /// 协议中的错误名。
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::BadArgument { .. } => "badArgument",
            Self::NoCommand(_) => "noCommand",
            Self::NoSocket(_) => "noSocket",
            Self::NoUserOnline(_) => "noUserOnline",
            Self::NoRoom(_) => "noRoom",
            Self::NoList(_) => "noList",
            Self::NotAllowed(_) => "notAllowed",
            Self::UserExists(_) => "userExists",
            Self::RoomExists(_) => "roomExists",
            Self::RoomRemoved(_) => "roomRemoved",
            Self::InvalidName(_) => "invalidName",
            Self::WrongArgumentsCount { .. } => "wrongArgumentsCount",
            Self::ServerError(_) => "serverError",
        }
    }

    /// 结构化错误对象的参数部分。
    pub fn wire_args(&self) -> Vec<Value> {
        match self {
            Self::BadArgument { command, position } => {
                vec![json!(command), json!(position)]
            }
            Self::WrongArgumentsCount {
                command,
                min,
                max,
                actual,
            } => vec![json!(command), json!(min), json!(max), json!(actual)],
            Self::NoCommand(s)
            | Self::NoSocket(s)
            | Self::NoUserOnline(s)
            | Self::NoRoom(s)
            | Self::NoList(s)
            | Self::NotAllowed(s)
            | Self::UserExists(s)
            | Self::RoomExists(s)
            | Self::RoomRemoved(s)
            | Self::InvalidName(s)
            | Self::ServerError(s) => vec![json!(s)],
        }
    }

    pub fn to_raw(&self) -> RawError {
        RawError {
            name: self.wire_name().to_owned(),
            args: self.wire_args(),
        }
    }

    /// 按配置选择序列化形式：结构化对象或人类可读字符串。
    pub fn serialize(&self, use_raw_error_objects: bool) -> Value {
        if use_raw_error_objects {
            json!(self.to_raw())
        } else {
            json!(self.to_string())
        }
    }
}

/// 结构化错误对象 `{name, args}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawError {
    pub name: String,
    pub args: Vec<Value>,
}
