//! 用户-套接字-房间关联。
//!
//! 每个用户有两份投影：本地投影（本实例上的套接字集合及每个
//! 套接字加入的房间）和集群投影（状态存储里的套接字归属与
//! (用户, 房间) 加入计数）。本模块实现套接字的注册/移除以及
//! 持锁的加入/离开协议；跨实例的驱逐编排在服务门面中。
//!
//! 关联组件通过能力结构体注入依赖，从不持有用户对象本身。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use config::ChatConfig;
use domain::{ChatError, InstanceId, RoomName, SocketId, UserName};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{echo_channel, room_channel, ServerEvent, ServerNotice, SYSTEM_CHANNEL};
use crate::state::StateStore;
use crate::transport::Transport;

/// 强制断开本实例套接字时的最大并发度。
const DISCONNECT_CONCURRENCY: usize = 4;

pub(crate) fn user_lock(user: &UserName) -> String {
    format!("user:{user}")
}

pub(crate) fn join_lock(user: &UserName, room: &RoomName) -> String {
    format!("join:{user}:{room}")
}

pub(crate) fn room_lock(room: &RoomName) -> String {
    format!("room:{room}")
}

/// 本实例上某个用户的套接字状态：套接字 → 已加入的房间。
#[derive(Debug, Default)]
pub struct LocalUserState {
    sockets: Mutex<HashMap<SocketId, HashSet<RoomName>>>,
}

impl LocalUserState {
    pub async fn add_socket(&self, socket: &SocketId) {
        self.sockets
            .lock()
            .await
            .entry(socket.clone())
            .or_default();
    }

    pub async fn remove_socket(&self, socket: &SocketId) -> Option<HashSet<RoomName>> {
        self.sockets.lock().await.remove(socket)
    }

    pub async fn join_room(&self, socket: &SocketId, room: &RoomName) -> Result<(), ChatError> {
        let mut sockets = self.sockets.lock().await;
        match sockets.get_mut(socket) {
            Some(rooms) => {
                rooms.insert(room.clone());
                Ok(())
            }
            None => Err(ChatError::no_socket(socket.as_str())),
        }
    }

    pub async fn leave_room(&self, socket: &SocketId, room: &RoomName) {
        if let Some(rooms) = self.sockets.lock().await.get_mut(socket) {
            rooms.remove(room);
        }
    }

    pub async fn socket_count(&self) -> usize {
        self.sockets.lock().await.len()
    }

    pub async fn socket_ids(&self) -> Vec<SocketId> {
        let mut ids: Vec<SocketId> = self.sockets.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn sockets_in_room(&self, room: &RoomName) -> Vec<SocketId> {
        let mut ids: Vec<SocketId> = self
            .sockets
            .lock()
            .await
            .iter()
            .filter(|(_, rooms)| rooms.contains(room))
            .map(|(socket, _)| socket.clone())
            .collect();
        ids.sort();
        ids
    }

    /// `listJoinedSockets` 的应答形状。
    pub async fn snapshot(&self) -> BTreeMap<SocketId, Vec<RoomName>> {
        self.sockets
            .lock()
            .await
            .iter()
            .map(|(socket, rooms)| {
                let mut rooms: Vec<RoomName> = rooms.iter().cloned().collect();
                rooms.sort();
                (socket.clone(), rooms)
            })
            .collect()
    }
}

/// 关联组件的依赖（能力结构体）。
#[derive(Clone)]
pub struct AssociationDeps {
    pub instance: InstanceId,
    pub config: Arc<ChatConfig>,
    pub state: Arc<dyn StateStore>,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub notices: broadcast::Sender<ServerNotice>,
}

pub struct UserAssociations {
    user: UserName,
    local: Arc<LocalUserState>,
    deps: AssociationDeps,
}

impl UserAssociations {
    pub fn new(user: UserName, local: Arc<LocalUserState>, deps: AssociationDeps) -> Self {
        Self { user, local, deps }
    }

    pub fn local(&self) -> &Arc<LocalUserState> {
        &self.local
    }

    fn store_failure(&self, op_type: &str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(user = %self.user, op = op_type, detail = %detail, "状态存储与传输层视图不一致");
        let _ = self.deps.notices.send(ServerNotice::StoreConsistencyFailure {
            user: self.user.clone(),
            op_type: op_type.to_owned(),
            detail,
        });
    }

    /// 注册一个新套接字：写集群归属、进回声频道与系统频道，
    /// 再向该用户的其他套接字发连接回声。
    pub async fn register_socket(&self, socket: &SocketId) -> Result<usize, ChatError> {
        let _guard = self
            .deps
            .state
            .lock(&user_lock(&self.user), self.deps.config.lock_ttl())
            .await?;

        // 客户端可能在认证期间就已离开
        if !self.deps.transport.has_socket(socket).await {
            return Err(ChatError::no_socket(socket.as_str()));
        }

        self.deps
            .state
            .socket_bind(socket, &self.user, self.deps.instance)
            .await?;
        self.local.add_socket(socket).await;

        let echo = echo_channel(&self.user);
        let joined = async {
            self.deps.transport.channel_join(socket, &echo).await?;
            self.deps.transport.channel_join(socket, SYSTEM_CHANNEL).await
        }
        .await;
        if let Err(err) = joined {
            // 回退到注册前的状态
            self.local.remove_socket(socket).await;
            self.deps.state.socket_unbind(socket).await?;
            return Err(err);
        }

        let n_connected = self.deps.state.user_sockets(&self.user).await?.len();
        self.deps
            .transport
            .channel_send(
                socket,
                &echo,
                &ServerEvent::SocketConnectEcho {
                    socket: socket.clone(),
                    n_connected,
                },
            )
            .await?;
        info!(user = %self.user, socket = %socket, n_connected, "套接字注册完成");
        Ok(n_connected)
    }

    /// 移除套接字：先按房间走离开协议，再解除集群归属并发断开回声。
    pub async fn remove_socket(&self, socket: &SocketId) -> Result<usize, ChatError> {
        let _guard = self
            .deps
            .state
            .lock(&user_lock(&self.user), self.deps.config.lock_ttl())
            .await?;

        if let Some(rooms) = self.local.remove_socket(socket).await {
            let mut rooms: Vec<RoomName> = rooms.into_iter().collect();
            rooms.sort();
            for room in rooms {
                let result = async {
                    let _join_guard = self
                        .deps
                        .state
                        .lock(&join_lock(&self.user, &room), self.deps.config.lock_ttl())
                        .await?;
                    self.leave_room_core(socket, &room).await
                }
                .await;
                if let Err(err) = result {
                    // 单个房间的清理失败不阻塞其余清理
                    warn!(user = %self.user, socket = %socket, room = %room,
                        error = %err, "套接字移除时离开房间失败");
                }
            }
        }

        let previous = self.deps.state.socket_unbind(socket).await?;
        if previous.is_none() {
            self.store_failure("removeSocket", format!("socket {socket} was not bound"));
        }

        let n_connected = self.deps.state.user_sockets(&self.user).await?.len();
        self.deps
            .transport
            .channel_send(
                socket,
                &echo_channel(&self.user),
                &ServerEvent::SocketDisconnectEcho {
                    socket: socket.clone(),
                    n_connected,
                },
            )
            .await?;
        info!(user = %self.user, socket = %socket, n_connected, "套接字已移除");
        Ok(n_connected)
    }

    /// 有界并发地强制断开该用户在本实例的全部套接字。
    pub async fn disconnect_instance_sockets(&self, reason: &str) -> Result<usize, ChatError> {
        let sockets = self.local.socket_ids().await;
        let n = sockets.len();
        let transport = Arc::clone(&self.deps.transport);
        let results: Vec<Result<(), ChatError>> = stream::iter(sockets)
            .map(|socket| {
                let transport = Arc::clone(&transport);
                let reason = reason.to_owned();
                async move { transport.disconnect(&socket, &reason).await }
            })
            .buffer_unordered(DISCONNECT_CONCURRENCY)
            .collect()
            .await;
        for result in results {
            if let Err(err) = result {
                warn!(user = %self.user, error = %err, "强制断开套接字失败");
            }
        }
        Ok(n)
    }

    /// 加入协议：在 (用户, 房间) 加入锁内完成房间准入、本地与
    /// 集群投影更新、频道加入和回声。返回该用户已加入此房间的
    /// 套接字数。
    pub async fn join_socket_to_room(
        &self,
        socket: &SocketId,
        room_name: &RoomName,
        bypass_permissions: bool,
    ) -> Result<u32, ChatError> {
        let _guard = self
            .deps
            .state
            .lock(
                &join_lock(&self.user, room_name),
                self.deps.config.lock_ttl(),
            )
            .await?;

        // 成员集合的改写与名单变更共用房间锁；加入锁在外层，
        // 锁的获取顺序全局一致（加入锁 → 房间锁）
        let newly = {
            let _room_guard = self
                .deps
                .state
                .lock(&room_lock(room_name), self.deps.config.lock_ttl())
                .await?;
            let mut room = self.deps.state.room_load(room_name).await?;
            let newly = room.join(&self.user, bypass_permissions, self.deps.clock.now())?;
            self.deps.state.room_store(&room).await?;
            newly
        };

        if let Err(err) = self.local.join_room(socket, room_name).await {
            self.rollback_join(room_name, newly).await;
            return Err(err);
        }
        let njoined = self
            .deps
            .state
            .join_count_incr(&self.user, room_name)
            .await?;

        let channel = room_channel(room_name);
        if let Err(err) = self.deps.transport.channel_join(socket, &channel).await {
            // 传输层已失去该套接字：回退投影并如实上报
            self.local.leave_room(socket, room_name).await;
            let _ = self
                .deps
                .state
                .join_count_decr(&self.user, room_name)
                .await;
            self.rollback_join(room_name, newly).await;
            return Err(err);
        }

        if newly && self.deps.config.enable_userlist_updates {
            let _ = self
                .deps
                .transport
                .channel_emit(
                    &channel,
                    &ServerEvent::RoomUserJoined {
                        room: room_name.clone(),
                        user: self.user.clone(),
                    },
                )
                .await;
        }
        // 回声在套接字进入房间频道之后发出
        self.deps
            .transport
            .channel_send(
                socket,
                &echo_channel(&self.user),
                &ServerEvent::RoomJoinedEcho {
                    room: room_name.clone(),
                    socket: socket.clone(),
                    njoined,
                },
            )
            .await?;
        debug!(user = %self.user, socket = %socket, room = %room_name, njoined, "加入房间");
        Ok(njoined)
    }

    async fn rollback_join(&self, room_name: &RoomName, newly: bool) {
        if !newly {
            return;
        }
        let room_guard = self
            .deps
            .state
            .lock(&room_lock(room_name), self.deps.config.lock_ttl())
            .await;
        if let Err(err) = room_guard {
            self.store_failure("roomJoin", err.to_string());
            return;
        }
        if let Ok(mut room) = self.deps.state.room_load(room_name).await {
            room.leave(&self.user, self.deps.clock.now());
            if let Err(err) = self.deps.state.room_store(&room).await {
                self.store_failure("roomJoin", err.to_string());
            }
        }
    }

    /// 离开协议（`roomLeave` 命令）。
    pub async fn leave_socket_from_room(
        &self,
        socket: &SocketId,
        room_name: &RoomName,
    ) -> Result<u32, ChatError> {
        let _guard = self
            .deps
            .state
            .lock(
                &join_lock(&self.user, room_name),
                self.deps.config.lock_ttl(),
            )
            .await?;
        // 房间已不存在时如实报告
        self.deps.state.room_load(room_name).await?;
        let njoined = self.leave_room_core(socket, room_name).await?;
        self.deps
            .transport
            .channel_send(
                socket,
                &echo_channel(&self.user),
                &ServerEvent::RoomLeftEcho {
                    room: room_name.clone(),
                    socket: socket.clone(),
                    njoined,
                },
            )
            .await?;
        Ok(njoined)
    }

    // 单个套接字的离开：更新两份投影，最后一个套接字离开时
    // 同步房间成员集合并按需广播。调用方负责持有加入锁。
    async fn leave_room_core(
        &self,
        socket: &SocketId,
        room_name: &RoomName,
    ) -> Result<u32, ChatError> {
        self.local.leave_room(socket, room_name).await;
        let _ = self
            .deps
            .transport
            .channel_leave(socket, &room_channel(room_name))
            .await;
        let njoined = self
            .deps
            .state
            .join_count_decr(&self.user, room_name)
            .await?;
        if njoined == 0 {
            let _room_guard = self
                .deps
                .state
                .lock(&room_lock(room_name), self.deps.config.lock_ttl())
                .await?;
            match self.deps.state.room_load(room_name).await {
                Ok(mut room) => {
                    if room.leave(&self.user, self.deps.clock.now()) {
                        self.deps.state.room_store(&room).await?;
                        if self.deps.config.enable_userlist_updates {
                            let _ = self
                                .deps
                                .transport
                                .channel_emit(
                                    &room_channel(room_name),
                                    &ServerEvent::RoomUserLeft {
                                        room: room_name.clone(),
                                        user: self.user.clone(),
                                    },
                                )
                                .await;
                        }
                    }
                }
                // 房间在删除流程中先行消失是正常时序
                Err(ChatError::NoRoom(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(njoined)
    }

    /// 集群总线驱逐的实例本地部分：把该用户在本实例上已加入此
    /// 房间的套接字全部移出，然后在回声频道通告失去访问资格。
    pub async fn disconnect_from_room(&self, room_name: &RoomName) -> Result<(), ChatError> {
        let _guard = self
            .deps
            .state
            .lock(
                &join_lock(&self.user, room_name),
                self.deps.config.lock_ttl(),
            )
            .await?;
        let sockets = self.local.sockets_in_room(room_name).await;
        let channel = room_channel(room_name);
        for socket in &sockets {
            self.local.leave_room(socket, room_name).await;
            let _ = self.deps.transport.channel_leave(socket, &channel).await;
            let _ = self
                .deps
                .state
                .join_count_decr(&self.user, room_name)
                .await;
        }
        if self.local.socket_count().await > 0 {
            let _ = self
                .deps
                .transport
                .channel_emit(
                    &echo_channel(&self.user),
                    &ServerEvent::RoomAccessRemoved {
                        room: room_name.clone(),
                    },
                )
                .await;
        }
        info!(user = %self.user, room = %room_name, sockets = sockets.len(),
            "按驱逐指令移出房间");
        Ok(())
    }
}
