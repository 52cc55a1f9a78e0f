//! 服务端向客户端推送的通知词汇表。
//!
//! 事件在线上表现为 `(事件名, 参数数组)`；事件名是协议的一部分。
//! 每个用户的全部套接字共同加入一个回声频道，用于接收自己在
//! 其他套接字上产生的副作用；每个房间对应一个房间频道。

use domain::{DirectMessage, ListKind, Message, RoomName, SocketId, UserName};
use serde_json::{json, Value};

/// 系统广播频道，注册套接字时加入。
pub const SYSTEM_CHANNEL: &str = "!system";

/// 用户回声频道名。
pub fn echo_channel(user: &UserName) -> String {
    format!("!u:{user}")
}

/// 房间频道名。
pub fn room_channel(room: &RoomName) -> String {
    format!("!r:{room}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    DirectMessage {
        message: DirectMessage,
    },
    DirectMessageEcho {
        to: UserName,
        message: DirectMessage,
    },
    LoginConfirmed {
        user: UserName,
        socket: SocketId,
    },
    LoginRejected {
        error: Value,
    },
    RoomAccessRemoved {
        room: RoomName,
    },
    RoomAccessListAdded {
        room: RoomName,
        list: ListKind,
        names: Vec<UserName>,
    },
    RoomAccessListRemoved {
        room: RoomName,
        list: ListKind,
        names: Vec<UserName>,
    },
    RoomModeChanged {
        room: RoomName,
        mode: bool,
    },
    RoomJoinedEcho {
        room: RoomName,
        socket: SocketId,
        njoined: u32,
    },
    RoomLeftEcho {
        room: RoomName,
        socket: SocketId,
        njoined: u32,
    },
    RoomMessage {
        room: RoomName,
        message: Message,
    },
    RoomUserJoined {
        room: RoomName,
        user: UserName,
    },
    RoomUserLeft {
        room: RoomName,
        user: UserName,
    },
    SocketConnectEcho {
        socket: SocketId,
        n_connected: usize,
    },
    SocketDisconnectEcho {
        socket: SocketId,
        n_connected: usize,
    },
    SystemMessage {
        data: Value,
    },
    Disconnect {
        reason: String,
    },
}

impl ServerEvent {
    /// 线上事件名。
    pub fn name(&self) -> &'static str {
        match self {
            Self::DirectMessage { .. } => "directMessage",
            Self::DirectMessageEcho { .. } => "directMessageEcho",
            Self::LoginConfirmed { .. } => "loginConfirmed",
            Self::LoginRejected { .. } => "loginRejected",
            Self::RoomAccessRemoved { .. } => "roomAccessRemoved",
            Self::RoomAccessListAdded { .. } => "roomAccessListAdded",
            Self::RoomAccessListRemoved { .. } => "roomAccessListRemoved",
            Self::RoomModeChanged { .. } => "roomModeChanged",
            Self::RoomJoinedEcho { .. } => "roomJoinedEcho",
            Self::RoomLeftEcho { .. } => "roomLeftEcho",
            Self::RoomMessage { .. } => "roomMessage",
            Self::RoomUserJoined { .. } => "roomUserJoined",
            Self::RoomUserLeft { .. } => "roomUserLeft",
            Self::SocketConnectEcho { .. } => "socketConnectEcho",
            Self::SocketDisconnectEcho { .. } => "socketDisconnectEcho",
            Self::SystemMessage { .. } => "systemMessage",
            Self::Disconnect { .. } => "disconnect",
        }
    }

    /// 线上参数数组。
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::DirectMessage { message } => vec![json!(message)],
            Self::DirectMessageEcho { to, message } => vec![json!(to), json!(message)],
            Self::LoginConfirmed { user, socket } => {
                vec![json!(user), json!({ "id": socket })]
            }
            Self::LoginRejected { error } => vec![error.clone()],
            Self::RoomAccessRemoved { room } => vec![json!(room)],
            Self::RoomAccessListAdded { room, list, names }
            | Self::RoomAccessListRemoved { room, list, names } => {
                vec![json!(room), json!(list.as_str()), json!(names)]
            }
            Self::RoomModeChanged { room, mode } => vec![json!(room), json!(mode)],
            Self::RoomJoinedEcho {
                room,
                socket,
                njoined,
            }
            | Self::RoomLeftEcho {
                room,
                socket,
                njoined,
            } => vec![json!(room), json!(socket), json!(njoined)],
            Self::RoomMessage { room, message } => vec![json!(room), json!(message)],
            Self::RoomUserJoined { room, user } | Self::RoomUserLeft { room, user } => {
                vec![json!(room), json!(user)]
            }
            Self::SocketConnectEcho {
                socket,
                n_connected,
            }
            | Self::SocketDisconnectEcho {
                socket,
                n_connected,
            } => vec![json!(socket), json!(n_connected)],
            Self::SystemMessage { data } => vec![data.clone()],
            Self::Disconnect { reason } => vec![json!(reason)],
        }
    }
}

/// 服务级事件：状态存储视图与传输层视图出现分歧时上报，
/// 不会转成命令错误，引擎也不做自动修复。
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotice {
    StoreConsistencyFailure {
        user: UserName,
        op_type: String,
        detail: String,
    },
    TransportConsistencyFailure {
        user: UserName,
        op_type: String,
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::MessageBody;

    #[test]
    fn wire_names_match_protocol() {
        let room = RoomName::parse("r").unwrap();
        let user = UserName::parse("alice").unwrap();
        let event = ServerEvent::RoomUserJoined {
            room: room.clone(),
            user: user.clone(),
        };
        assert_eq!(event.name(), "roomUserJoined");
        assert_eq!(event.args(), vec![json!("r"), json!("alice")]);
    }

    #[test]
    fn login_confirmed_wraps_socket_id() {
        let event = ServerEvent::LoginConfirmed {
            user: UserName::parse("alice").unwrap(),
            socket: SocketId::new("s1"),
        };
        assert_eq!(event.args()[1], json!({ "id": "s1" }));
    }

    #[test]
    fn room_message_carries_full_message() {
        let event = ServerEvent::RoomMessage {
            room: RoomName::parse("r").unwrap(),
            message: Message {
                id: 7,
                timestamp: chrono::DateTime::from_timestamp_millis(1_000).unwrap(),
                author: UserName::parse("alice").unwrap(),
                body: MessageBody::text("hi"),
            },
        };
        let args = event.args();
        assert_eq!(args[0], "r");
        assert_eq!(args[1]["id"], 7);
        assert_eq!(args[1]["textMessage"], "hi");
        assert_eq!(args[1]["timestamp"], 1_000);
    }

    #[test]
    fn channel_names_are_disjoint() {
        let user = UserName::parse("x").unwrap();
        let room = RoomName::parse("x").unwrap();
        assert_ne!(echo_channel(&user), room_channel(&room));
        assert_ne!(echo_channel(&user), SYSTEM_CHANNEL);
    }
}
