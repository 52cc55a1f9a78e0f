//! 传输层契约。
//!
//! 传输层拥有每个套接字的连接：接入新连接（交出套接字 id 与原始
//! 认证载荷）、向单个套接字或频道投递事件、把套接字加入/移出
//! 频道、断开连接。命令帧从传输层经 `TransportEvent` 流进入引擎，
//! 应答通过一次性通道回送。
//!
//! `memory` 子模块是单进程实现，同时充当测试客户端的后端。

use std::time::Duration;

use async_trait::async_trait;
use domain::{ChatError, SocketId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::events::ServerEvent;

/// 送达客户端的一帧：事件名加参数数组。
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub event: String,
    pub args: Vec<Value>,
}

impl ClientFrame {
    pub fn of(event: &ServerEvent) -> Self {
        Self {
            event: event.name().to_owned(),
            args: event.args(),
        }
    }
}

/// 命令应答：回调形状 `(error, data…)`。
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    pub error: Option<Value>,
    pub data: Vec<Value>,
}

impl CommandAck {
    pub fn ok(data: Vec<Value>) -> Self {
        Self { error: None, data }
    }

    pub fn err(error: Value) -> Self {
        Self {
            error: Some(error),
            data: Vec::new(),
        }
    }
}

/// 传输层上行到引擎的事件。
#[derive(Debug)]
pub enum TransportEvent {
    Connected {
        socket: SocketId,
        auth: Value,
    },
    Command {
        socket: SocketId,
        name: String,
        args: Vec<Value>,
        ack: oneshot::Sender<CommandAck>,
    },
    Disconnected {
        socket: SocketId,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// 取走上行事件流；只有第一次调用返回 Some。
    async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn has_socket(&self, socket: &SocketId) -> bool;

    async fn emit(&self, socket: &SocketId, event: &ServerEvent) -> Result<(), ChatError>;

    /// 先送出 `disconnect(reason)` 帧再断开。
    async fn disconnect(&self, socket: &SocketId, reason: &str) -> Result<(), ChatError>;

    async fn channel_join(&self, socket: &SocketId, channel: &str) -> Result<(), ChatError>;

    async fn channel_leave(&self, socket: &SocketId, channel: &str) -> Result<(), ChatError>;

    async fn channel_emit(&self, channel: &str, event: &ServerEvent) -> Result<(), ChatError>;

    /// 频道广播，排除一个套接字（通常是动作的发起者）。
    async fn channel_send(
        &self,
        exclude: &SocketId,
        channel: &str,
        event: &ServerEvent,
    ) -> Result<(), ChatError>;

    /// 停止接受新连接，在限期内等待既有连接退场，逾期强制断开。
    async fn close(&self, timeout: Duration) -> Result<(), ChatError>;
}

pub mod memory {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use tokio::sync::{Mutex, RwLock};
    use tokio::time::sleep;

    use super::*;

    struct SocketEntry {
        frames: mpsc::UnboundedSender<ClientFrame>,
    }

    /// 内存传输层。每个服务实例持有自己的一份；频道只覆盖本实例
    /// 的套接字（跨实例的控制流走集群总线）。
    pub struct MemoryTransport {
        sockets: RwLock<HashMap<SocketId, SocketEntry>>,
        channels: RwLock<HashMap<String, HashSet<SocketId>>>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
        accepting: AtomicBool,
        seq: AtomicU64,
    }

    impl Default for MemoryTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                sockets: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                accepting: AtomicBool::new(true),
                seq: AtomicU64::new(0),
            }
        }

        /// 测试客户端接入；返回的句柄用来发命令和收事件帧。
        pub async fn connect(
            transport: &Arc<MemoryTransport>,
            auth: Value,
        ) -> Result<TestClient, ChatError> {
            if !transport.accepting.load(Ordering::SeqCst) {
                return Err(ChatError::no_socket("transport is not accepting"));
            }
            let n = transport.seq.fetch_add(1, Ordering::Relaxed);
            let socket = SocketId::new(format!("socket-{n}"));
            let (frames_tx, frames_rx) = mpsc::unbounded_channel();
            transport
                .sockets
                .write()
                .await
                .insert(socket.clone(), SocketEntry { frames: frames_tx });
            let _ = transport.events_tx.send(TransportEvent::Connected {
                socket: socket.clone(),
                auth,
            });
            Ok(TestClient {
                socket,
                transport: Arc::clone(transport),
                frames: frames_rx,
            })
        }

        async fn drop_socket(&self, socket: &SocketId) -> bool {
            let existed = self.sockets.write().await.remove(socket).is_some();
            let mut channels = self.channels.write().await;
            for members in channels.values_mut() {
                members.remove(socket);
            }
            channels.retain(|_, members| !members.is_empty());
            existed
        }

        async fn send_frame(&self, socket: &SocketId, frame: ClientFrame) -> bool {
            match self.sockets.read().await.get(socket) {
                Some(entry) => entry.frames.send(frame).is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.events_rx.lock().await.take()
        }

        async fn has_socket(&self, socket: &SocketId) -> bool {
            self.sockets.read().await.contains_key(socket)
        }

        async fn emit(&self, socket: &SocketId, event: &ServerEvent) -> Result<(), ChatError> {
            if self.send_frame(socket, ClientFrame::of(event)).await {
                Ok(())
            } else {
                Err(ChatError::no_socket(socket.as_str()))
            }
        }

        async fn disconnect(&self, socket: &SocketId, reason: &str) -> Result<(), ChatError> {
            let frame = ClientFrame::of(&ServerEvent::Disconnect {
                reason: reason.to_owned(),
            });
            self.send_frame(socket, frame).await;
            if self.drop_socket(socket).await {
                let _ = self.events_tx.send(TransportEvent::Disconnected {
                    socket: socket.clone(),
                });
            }
            Ok(())
        }

        async fn channel_join(&self, socket: &SocketId, channel: &str) -> Result<(), ChatError> {
            if !self.has_socket(socket).await {
                return Err(ChatError::no_socket(socket.as_str()));
            }
            self.channels
                .write()
                .await
                .entry(channel.to_owned())
                .or_default()
                .insert(socket.clone());
            Ok(())
        }

        async fn channel_leave(&self, socket: &SocketId, channel: &str) -> Result<(), ChatError> {
            let mut channels = self.channels.write().await;
            if let Some(members) = channels.get_mut(channel) {
                members.remove(socket);
                if members.is_empty() {
                    channels.remove(channel);
                }
            }
            Ok(())
        }

        async fn channel_emit(&self, channel: &str, event: &ServerEvent) -> Result<(), ChatError> {
            let members = match self.channels.read().await.get(channel) {
                Some(members) => members.iter().cloned().collect::<Vec<_>>(),
                None => return Ok(()),
            };
            let frame = ClientFrame::of(event);
            for socket in members {
                self.send_frame(&socket, frame.clone()).await;
            }
            Ok(())
        }

        async fn channel_send(
            &self,
            exclude: &SocketId,
            channel: &str,
            event: &ServerEvent,
        ) -> Result<(), ChatError> {
            let members = match self.channels.read().await.get(channel) {
                Some(members) => members.iter().cloned().collect::<Vec<_>>(),
                None => return Ok(()),
            };
            let frame = ClientFrame::of(event);
            for socket in members {
                if &socket != exclude {
                    self.send_frame(&socket, frame.clone()).await;
                }
            }
            Ok(())
        }

        async fn close(&self, timeout: Duration) -> Result<(), ChatError> {
            self.accepting.store(false, Ordering::SeqCst);
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.sockets.read().await.is_empty() {
                    return Ok(());
                }
                sleep(Duration::from_millis(10)).await;
            }
            // 限期已过，强制断开剩余连接
            let remaining: Vec<SocketId> =
                self.sockets.read().await.keys().cloned().collect();
            for socket in remaining {
                self.disconnect(&socket, "server shutdown").await?;
            }
            Ok(())
        }
    }

    /// 测试客户端句柄：一个已接入的套接字。
    pub struct TestClient {
        socket: SocketId,
        transport: Arc<MemoryTransport>,
        frames: mpsc::UnboundedReceiver<ClientFrame>,
    }

    impl TestClient {
        pub fn id(&self) -> &SocketId {
            &self.socket
        }

        /// 发出一条命令并等待应答。
        pub async fn command(&self, name: &str, args: Vec<Value>) -> CommandAck {
            let (ack_tx, ack_rx) = oneshot::channel();
            let sent = self.transport.events_tx.send(TransportEvent::Command {
                socket: self.socket.clone(),
                name: name.to_owned(),
                args,
                ack: ack_tx,
            });
            if sent.is_err() {
                return CommandAck::err(Value::String("transport closed".to_owned()));
            }
            match ack_rx.await {
                Ok(ack) => ack,
                Err(_) => CommandAck::err(Value::String("no acknowledgement".to_owned())),
            }
        }

        /// 下一帧事件；连接断开后返回 None。
        pub async fn recv(&mut self) -> Option<ClientFrame> {
            self.frames.recv().await
        }

        pub fn try_recv(&mut self) -> Option<ClientFrame> {
            self.frames.try_recv().ok()
        }

        /// 客户端主动断开。
        pub async fn disconnect(self) {
            if self.transport.drop_socket(&self.socket).await {
                let _ = self
                    .transport
                    .events_tx
                    .send(TransportEvent::Disconnected {
                        socket: self.socket.clone(),
                    });
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use domain::{RoomName, UserName};
        use serde_json::json;

        fn event() -> ServerEvent {
            ServerEvent::RoomUserJoined {
                room: RoomName::parse("r").unwrap(),
                user: UserName::parse("alice").unwrap(),
            }
        }

        #[tokio::test]
        async fn channel_send_excludes_one_socket() {
            let transport = Arc::new(MemoryTransport::new());
            let mut a = MemoryTransport::connect(&transport, json!("alice")).await.unwrap();
            let mut b = MemoryTransport::connect(&transport, json!("bob")).await.unwrap();
            transport.channel_join(a.id(), "c").await.unwrap();
            transport.channel_join(b.id(), "c").await.unwrap();

            transport.channel_send(a.id(), "c", &event()).await.unwrap();
            assert!(a.try_recv().is_none());
            let frame = b.recv().await.unwrap();
            assert_eq!(frame.event, "roomUserJoined");
        }

        #[tokio::test]
        async fn emit_to_missing_socket_is_no_socket() {
            let transport = Arc::new(MemoryTransport::new());
            let err = transport
                .emit(&SocketId::new("ghost"), &event())
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::NoSocket(_)));
        }

        #[tokio::test]
        async fn disconnect_sends_reason_then_removes() {
            let transport = Arc::new(MemoryTransport::new());
            let mut a = MemoryTransport::connect(&transport, json!("alice")).await.unwrap();
            let id = a.id().clone();
            transport.disconnect(&id, "kicked").await.unwrap();
            // 断开帧先于注册表移除送达
            let frame = a.recv().await.unwrap();
            assert_eq!(frame.event, "disconnect");
            assert_eq!(frame.args[0], "kicked");
            assert!(!transport.has_socket(&id).await);
        }

        #[tokio::test]
        async fn close_stops_accepting() {
            let transport = Arc::new(MemoryTransport::new());
            transport.close(Duration::from_millis(10)).await.unwrap();
            assert!(MemoryTransport::connect(&transport, json!("x")).await.is_err());
        }
    }
}
