//! 状态存储契约。
//!
//! 状态存储是集群范围集合的唯一事实来源：房间、用户私聊记录、
//! 套接字归属、(用户, 房间) 加入计数、带 TTL 的命名锁以及集群
//! 总线的发布/订阅。契约按引擎的需要表述；`memory` 子模块提供
//! 单进程实现（内建 "memory" 种类，也是测试的默认后端）。
//!
//! 锁守卫在 Drop 时释放，保证任何退出路径（包括 `?` 提前返回）
//! 都不会遗留锁；TTL 到期后锁视为已释放，持有方不得假设其变更
//! 已经完成。

use std::time::Duration;

use async_trait::async_trait;
use domain::{ChatError, DirectMessaging, InstanceId, Room, RoomName, SocketId, UserName};
use tokio::sync::broadcast;

use crate::bus::BusEnvelope;

/// 命名锁的守卫；析构即释放。
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// 获取命名锁；等待超过 `ttl` 仍未得到锁时返回 `serverError`。
    async fn lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, ChatError>;

    // ---- 房间注册表 ----
    async fn room_add(&self, room: Room) -> Result<(), ChatError>;
    async fn room_exists(&self, name: &RoomName) -> Result<bool, ChatError>;
    async fn room_load(&self, name: &RoomName) -> Result<Room, ChatError>;
    async fn room_store(&self, room: &Room) -> Result<(), ChatError>;
    async fn room_remove(&self, name: &RoomName) -> Result<(), ChatError>;
    async fn room_names(&self) -> Result<Vec<RoomName>, ChatError>;

    // ---- 用户注册表（私聊记录是用户的持久状态） ----
    async fn user_add(&self, name: &UserName, record: DirectMessaging) -> Result<(), ChatError>;
    async fn user_exists(&self, name: &UserName) -> Result<bool, ChatError>;
    async fn user_load(&self, name: &UserName) -> Result<DirectMessaging, ChatError>;
    async fn user_store(&self, name: &UserName, record: &DirectMessaging) -> Result<(), ChatError>;
    async fn user_remove(&self, name: &UserName) -> Result<(), ChatError>;

    // ---- 集群范围的套接字归属 ----
    async fn socket_bind(
        &self,
        socket: &SocketId,
        user: &UserName,
        instance: InstanceId,
    ) -> Result<(), ChatError>;
    /// 解除绑定；返回之前的归属（不存在时为 None，供调用方上报分歧）。
    async fn socket_unbind(
        &self,
        socket: &SocketId,
    ) -> Result<Option<(UserName, InstanceId)>, ChatError>;
    async fn socket_user(&self, socket: &SocketId) -> Result<Option<UserName>, ChatError>;
    async fn user_sockets(
        &self,
        user: &UserName,
    ) -> Result<Vec<(SocketId, InstanceId)>, ChatError>;

    // ---- (用户, 房间) 加入计数 ----
    async fn join_count_incr(&self, user: &UserName, room: &RoomName) -> Result<u32, ChatError>;
    async fn join_count_decr(&self, user: &UserName, room: &RoomName) -> Result<u32, ChatError>;
    async fn join_count_clear(&self, user: &UserName, room: &RoomName) -> Result<(), ChatError>;

    // ---- 集群总线 ----
    async fn bus_publish(&self, envelope: &BusEnvelope) -> Result<(), ChatError>;
    fn bus_subscribe(&self) -> broadcast::Receiver<BusEnvelope>;

    async fn close(&self) -> Result<(), ChatError>;
}

pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Instant;

    use tokio::sync::RwLock;
    use tokio::time::sleep;

    use super::*;

    struct LockEntry {
        token: u64,
        expires_at: Instant,
    }

    /// 内存状态存储：单进程内多个服务实例可共享同一份，
    /// 以演练跨实例协议。
    pub struct MemoryStateStore {
        rooms: RwLock<HashMap<RoomName, Room>>,
        users: RwLock<HashMap<UserName, DirectMessaging>>,
        sockets: RwLock<HashMap<SocketId, (UserName, InstanceId)>>,
        join_counts: RwLock<HashMap<(UserName, RoomName), u32>>,
        locks: Arc<StdMutex<HashMap<String, LockEntry>>>,
        lock_seq: AtomicU64,
        bus: broadcast::Sender<BusEnvelope>,
    }

    impl Default for MemoryStateStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryStateStore {
        pub fn new() -> Self {
            let (bus, _) = broadcast::channel(256);
            Self {
                rooms: RwLock::new(HashMap::new()),
                users: RwLock::new(HashMap::new()),
                sockets: RwLock::new(HashMap::new()),
                join_counts: RwLock::new(HashMap::new()),
                locks: Arc::new(StdMutex::new(HashMap::new())),
                lock_seq: AtomicU64::new(0),
                bus,
            }
        }

        fn try_acquire(&self, name: &str, ttl: Duration) -> Option<u64> {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = Instant::now();
            match locks.get(name) {
                Some(entry) if entry.expires_at > now => None,
                _ => {
                    let token = self.lock_seq.fetch_add(1, Ordering::Relaxed);
                    locks.insert(
                        name.to_owned(),
                        LockEntry {
                            token,
                            expires_at: now + ttl,
                        },
                    );
                    Some(token)
                }
            }
        }
    }

    #[async_trait]
    impl StateStore for MemoryStateStore {
        async fn lock(&self, name: &str, ttl: Duration) -> Result<LockGuard, ChatError> {
            let deadline = Instant::now() + ttl;
            loop {
                if let Some(token) = self.try_acquire(name, ttl) {
                    let locks = Arc::clone(&self.locks);
                    let name = name.to_owned();
                    // 过期后别人可能重新拿到锁，释放时校验令牌
                    return Ok(LockGuard::new(move || {
                        let mut locks =
                            locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        if locks.get(&name).map(|e| e.token) == Some(token) {
                            locks.remove(&name);
                        }
                    }));
                }
                if Instant::now() >= deadline {
                    return Err(ChatError::server_error(format!(
                        "lock wait timed out: {name}"
                    )));
                }
                sleep(Duration::from_millis(5)).await;
            }
        }

        async fn room_add(&self, room: Room) -> Result<(), ChatError> {
            let mut rooms = self.rooms.write().await;
            if rooms.contains_key(room.name()) {
                return Err(ChatError::room_exists(room.name().as_str()));
            }
            rooms.insert(room.name().clone(), room);
            Ok(())
        }

        async fn room_exists(&self, name: &RoomName) -> Result<bool, ChatError> {
            Ok(self.rooms.read().await.contains_key(name))
        }

        async fn room_load(&self, name: &RoomName) -> Result<Room, ChatError> {
            self.rooms
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| ChatError::no_room(name.as_str()))
        }

        async fn room_store(&self, room: &Room) -> Result<(), ChatError> {
            self.rooms
                .write()
                .await
                .insert(room.name().clone(), room.clone());
            Ok(())
        }

        async fn room_remove(&self, name: &RoomName) -> Result<(), ChatError> {
            self.rooms.write().await.remove(name);
            let mut counts = self.join_counts.write().await;
            counts.retain(|(_, room), _| room != name);
            Ok(())
        }

        async fn room_names(&self) -> Result<Vec<RoomName>, ChatError> {
            let mut names: Vec<RoomName> = self.rooms.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        }

        async fn user_add(&self, name: &UserName, record: DirectMessaging) -> Result<(), ChatError> {
            let mut users = self.users.write().await;
            if users.contains_key(name) {
                return Err(ChatError::user_exists(name.as_str()));
            }
            users.insert(name.clone(), record);
            Ok(())
        }

        async fn user_exists(&self, name: &UserName) -> Result<bool, ChatError> {
            Ok(self.users.read().await.contains_key(name))
        }

        async fn user_load(&self, name: &UserName) -> Result<DirectMessaging, ChatError> {
            self.users
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| ChatError::no_user_online(name.as_str()))
        }

        async fn user_store(
            &self,
            name: &UserName,
            record: &DirectMessaging,
        ) -> Result<(), ChatError> {
            self.users.write().await.insert(name.clone(), record.clone());
            Ok(())
        }

        async fn user_remove(&self, name: &UserName) -> Result<(), ChatError> {
            self.users.write().await.remove(name);
            Ok(())
        }

        async fn socket_bind(
            &self,
            socket: &SocketId,
            user: &UserName,
            instance: InstanceId,
        ) -> Result<(), ChatError> {
            self.sockets
                .write()
                .await
                .insert(socket.clone(), (user.clone(), instance));
            Ok(())
        }

        async fn socket_unbind(
            &self,
            socket: &SocketId,
        ) -> Result<Option<(UserName, InstanceId)>, ChatError> {
            Ok(self.sockets.write().await.remove(socket))
        }

        async fn socket_user(&self, socket: &SocketId) -> Result<Option<UserName>, ChatError> {
            Ok(self
                .sockets
                .read()
                .await
                .get(socket)
                .map(|(user, _)| user.clone()))
        }

        async fn user_sockets(
            &self,
            user: &UserName,
        ) -> Result<Vec<(SocketId, InstanceId)>, ChatError> {
            let mut sockets: Vec<(SocketId, InstanceId)> = self
                .sockets
                .read()
                .await
                .iter()
                .filter(|(_, (owner, _))| owner == user)
                .map(|(socket, (_, instance))| (socket.clone(), *instance))
                .collect();
            sockets.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(sockets)
        }

        async fn join_count_incr(
            &self,
            user: &UserName,
            room: &RoomName,
        ) -> Result<u32, ChatError> {
            let mut counts = self.join_counts.write().await;
            let count = counts.entry((user.clone(), room.clone())).or_insert(0);
            *count += 1;
            Ok(*count)
        }

        async fn join_count_decr(
            &self,
            user: &UserName,
            room: &RoomName,
        ) -> Result<u32, ChatError> {
            let mut counts = self.join_counts.write().await;
            let key = (user.clone(), room.clone());
            match counts.get_mut(&key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    if remaining == 0 {
                        counts.remove(&key);
                    }
                    Ok(remaining)
                }
                None => Ok(0),
            }
        }

        async fn join_count_clear(
            &self,
            user: &UserName,
            room: &RoomName,
        ) -> Result<(), ChatError> {
            self.join_counts
                .write()
                .await
                .remove(&(user.clone(), room.clone()));
            Ok(())
        }

        async fn bus_publish(&self, envelope: &BusEnvelope) -> Result<(), ChatError> {
            // 没有订阅者不是错误：单实例部署时总线只会自发自收
            let _ = self.bus.send(envelope.clone());
            Ok(())
        }

        fn bus_subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
            self.bus.subscribe()
        }

        async fn close(&self) -> Result<(), ChatError> {
            Ok(())
        }
    }

}
