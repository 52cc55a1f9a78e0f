//! 用户命令的实现。
//!
//! `ChatUser` 是以某个用户身份执行命令的句柄：权限检查与状态
//! 迁移通过状态存储在相应的锁内完成，副作用通知经传输层发出。
//! 关联组件负责套接字生命周期与加入/离开协议。

use std::collections::BTreeMap;
use std::sync::Arc;

use domain::{
    ChatError, DirectListKind, DirectMessage, HistoryInfo, ListKind, Message, MessageBody, Room,
    RoomInit, RoomName, SocketId, UserName, UserSeen,
};
use serde_json::Value;

use crate::associations::{room_lock, UserAssociations};
use crate::commands::CommandContext;
use crate::events::{echo_channel, room_channel, ServerEvent, SYSTEM_CHANNEL};
use crate::hooks::{HookRegistry, MessageChecker};
use crate::service::EngineCore;

pub struct ChatUser {
    core: Arc<EngineCore>,
    name: UserName,
    assoc: UserAssociations,
}

impl ChatUser {
    pub(crate) fn new(core: Arc<EngineCore>, name: UserName, assoc: UserAssociations) -> Self {
        Self { core, name, assoc }
    }

    pub fn name(&self) -> &UserName {
        &self.name
    }

    pub(crate) fn hooks(&self) -> &HookRegistry {
        &self.core.hooks
    }

    pub(crate) fn associations(&self) -> &UserAssociations {
        &self.assoc
    }

    fn checked_body(
        &self,
        checker: &Option<MessageChecker>,
        command: &str,
        position: usize,
        payload: &Value,
    ) -> Result<MessageBody, ChatError> {
        match checker {
            Some(check) => {
                check(payload)?;
                Ok(MessageBody::lenient(payload))
            }
            None => MessageBody::from_value(payload)
                .ok_or_else(|| ChatError::bad_argument(command, position)),
        }
    }

    // ---- 私聊 ----

    pub async fn direct_add_to_list(
        &self,
        kind: DirectListKind,
        names: Vec<UserName>,
    ) -> Result<(), ChatError> {
        let mut record = self.core.state.user_load(&self.name).await?;
        record.add_to_list(&self.name, kind, &names)?;
        self.core.state.user_store(&self.name, &record).await
    }

    pub async fn direct_remove_from_list(
        &self,
        kind: DirectListKind,
        names: Vec<UserName>,
    ) -> Result<(), ChatError> {
        let mut record = self.core.state.user_load(&self.name).await?;
        record.remove_from_list(&self.name, kind, &names)?;
        self.core.state.user_store(&self.name, &record).await
    }

    pub async fn direct_get_access_list(
        &self,
        kind: DirectListKind,
    ) -> Result<Vec<UserName>, ChatError> {
        Ok(self
            .core
            .state
            .user_load(&self.name)
            .await?
            .list_members(kind))
    }

    pub async fn direct_get_whitelist_mode(&self) -> Result<bool, ChatError> {
        Ok(self.core.state.user_load(&self.name).await?.mode())
    }

    pub async fn direct_set_whitelist_mode(&self, mode: bool) -> Result<(), ChatError> {
        let mut record = self.core.state.user_load(&self.name).await?;
        record.set_mode(mode);
        self.core.state.user_store(&self.name, &record).await
    }

    pub async fn direct_message(
        &self,
        ctx: &CommandContext,
        to: UserName,
        payload: &Value,
    ) -> Result<DirectMessage, ChatError> {
        if !self.core.config.enable_direct_messages && !ctx.bypass_permissions {
            return Err(ChatError::not_allowed("direct messages are disabled"));
        }
        if to == self.name {
            return Err(ChatError::not_allowed("cannot message oneself"));
        }
        let record = self.core.state.user_load(&to).await?;
        if self.core.state.user_sockets(&to).await?.is_empty() {
            return Err(ChatError::no_user_online(to.as_str()));
        }
        if !record.admits(&self.name, ctx.bypass_permissions) {
            return Err(ChatError::not_allowed(format!(
                "{to} does not accept messages from {}",
                self.name
            )));
        }
        let body = self.checked_body(
            &self.core.hooks.direct_message_checker,
            "directMessage",
            2,
            payload,
        )?;
        let message = DirectMessage {
            timestamp: self.core.clock.now(),
            author: self.name.clone(),
            body,
        };
        self.core
            .transport
            .channel_emit(
                &echo_channel(&to),
                &ServerEvent::DirectMessage {
                    message: message.clone(),
                },
            )
            .await?;
        let echo = ServerEvent::DirectMessageEcho {
            to,
            message: message.clone(),
        };
        match &ctx.socket {
            Some(socket) => {
                self.core
                    .transport
                    .channel_send(socket, &echo_channel(&self.name), &echo)
                    .await?
            }
            None => {
                self.core
                    .transport
                    .channel_emit(&echo_channel(&self.name), &echo)
                    .await?
            }
        }
        Ok(message)
    }

    // ---- 查询 ----

    pub async fn list_joined_sockets(
        &self,
    ) -> Result<BTreeMap<SocketId, Vec<RoomName>>, ChatError> {
        Ok(self.assoc.local().snapshot().await)
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomName>, ChatError> {
        self.core.state.room_names().await
    }

    // ---- 房间生命周期 ----

    pub async fn room_create(
        &self,
        ctx: &CommandContext,
        name: RoomName,
        whitelist_only: bool,
    ) -> Result<(), ChatError> {
        if !self.core.config.enable_rooms_management && !ctx.bypass_permissions {
            return Err(ChatError::not_allowed("rooms management is disabled"));
        }
        let room = Room::new(
            name,
            RoomInit {
                owner: Some(self.name.clone()),
                whitelist_only,
                ..RoomInit::default()
            },
            self.core.history_limits(),
        );
        self.core.state.room_add(room).await
    }

    pub async fn room_delete(&self, ctx: &CommandContext, name: RoomName) -> Result<(), ChatError> {
        if !self.core.config.enable_rooms_management && !ctx.bypass_permissions {
            return Err(ChatError::not_allowed("rooms management is disabled"));
        }
        let room = self.core.state.room_load(&name).await?;
        if !ctx.bypass_permissions && !room.check_is_owner(&self.name) {
            return Err(ChatError::not_allowed(format!(
                "{} does not own room {name}",
                self.name
            )));
        }
        self.core.remove_room(&name).await
    }

    // ---- 房间名单 ----

    pub async fn room_add_to_list(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        kind: ListKind,
        names: Vec<UserName>,
    ) -> Result<(), ChatError> {
        let evicted = {
            let _guard = self
                .core
                .state
                .lock(&room_lock(&room_name), self.core.config.lock_ttl())
                .await?;
            let mut room = self.core.state.room_load(&room_name).await?;
            let evicted = room.add_to_list(
                &self.name,
                kind,
                &names,
                ctx.bypass_permissions,
                self.core.clock.now(),
            )?;
            self.core.state.room_store(&room).await?;
            evicted
        };
        if self.core.config.enable_access_lists_updates {
            let _ = self
                .core
                .transport
                .channel_emit(
                    &room_channel(&room_name),
                    &ServerEvent::RoomAccessListAdded {
                        room: room_name.clone(),
                        list: kind,
                        names,
                    },
                )
                .await;
        }
        self.core
            .evict_users(&room_name, &evicted, "roomAddToList", true)
            .await;
        Ok(())
    }

    pub async fn room_remove_from_list(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        kind: ListKind,
        names: Vec<UserName>,
    ) -> Result<(), ChatError> {
        let evicted = {
            let _guard = self
                .core
                .state
                .lock(&room_lock(&room_name), self.core.config.lock_ttl())
                .await?;
            let mut room = self.core.state.room_load(&room_name).await?;
            let evicted = room.remove_from_list(
                &self.name,
                kind,
                &names,
                ctx.bypass_permissions,
                self.core.clock.now(),
            )?;
            self.core.state.room_store(&room).await?;
            evicted
        };
        if self.core.config.enable_access_lists_updates {
            let _ = self
                .core
                .transport
                .channel_emit(
                    &room_channel(&room_name),
                    &ServerEvent::RoomAccessListRemoved {
                        room: room_name.clone(),
                        list: kind,
                        names,
                    },
                )
                .await;
        }
        self.core
            .evict_users(&room_name, &evicted, "roomRemoveFromList", true)
            .await;
        Ok(())
    }

    pub async fn room_set_whitelist_mode(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        whitelist_only: bool,
    ) -> Result<(), ChatError> {
        let (evicted, mode) = {
            let _guard = self
                .core
                .state
                .lock(&room_lock(&room_name), self.core.config.lock_ttl())
                .await?;
            let mut room = self.core.state.room_load(&room_name).await?;
            let outcome = room.change_mode(
                &self.name,
                whitelist_only,
                ctx.bypass_permissions,
                self.core.clock.now(),
            )?;
            self.core.state.room_store(&room).await?;
            outcome
        };
        if self.core.config.enable_access_lists_updates {
            let _ = self
                .core
                .transport
                .channel_emit(
                    &room_channel(&room_name),
                    &ServerEvent::RoomModeChanged {
                        room: room_name.clone(),
                        mode,
                    },
                )
                .await;
        }
        self.core
            .evict_users(&room_name, &evicted, "roomSetWhitelistMode", true)
            .await;
        Ok(())
    }

    pub async fn room_get_access_list(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        kind: ListKind,
    ) -> Result<Vec<UserName>, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .get_list(&self.name, kind, ctx.bypass_permissions)
    }

    pub async fn room_get_owner(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
    ) -> Result<Option<UserName>, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .get_owner(&self.name, ctx.bypass_permissions)
    }

    pub async fn room_get_whitelist_mode(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
    ) -> Result<bool, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .get_mode(&self.name, ctx.bypass_permissions)
    }

    pub async fn room_user_seen(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        target: UserName,
    ) -> Result<UserSeen, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .user_seen(&self.name, &target, ctx.bypass_permissions)
    }

    // ---- 房间成员 ----

    pub async fn room_join(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
    ) -> Result<u32, ChatError> {
        let socket = ctx
            .socket
            .as_ref()
            .ok_or_else(|| ChatError::no_socket("roomJoin requires a socket"))?;
        self.assoc
            .join_socket_to_room(socket, &room_name, ctx.bypass_permissions)
            .await
    }

    pub async fn room_leave(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
    ) -> Result<u32, ChatError> {
        let socket = ctx
            .socket
            .as_ref()
            .ok_or_else(|| ChatError::no_socket("roomLeave requires a socket"))?;
        self.assoc.leave_socket_from_room(socket, &room_name).await
    }

    // ---- 房间消息与历史 ----

    pub async fn room_message(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        payload: &Value,
    ) -> Result<u64, ChatError> {
        let body = self.checked_body(
            &self.core.hooks.room_message_checker,
            "roomMessage",
            2,
            payload,
        )?;
        let _guard = self
            .core
            .state
            .lock(&room_lock(&room_name), self.core.config.lock_ttl())
            .await?;
        let mut room = self.core.state.room_load(&room_name).await?;
        let message = room.message(
            &self.name,
            body,
            ctx.bypass_permissions,
            self.core.clock.now(),
        )?;
        self.core.state.room_store(&room).await?;
        // 在房间锁内广播：成功的消息先于任何随后的驱逐通知到达频道
        let _ = self
            .core
            .transport
            .channel_emit(
                &room_channel(&room_name),
                &ServerEvent::RoomMessage {
                    room: room_name.clone(),
                    message: message.clone(),
                },
            )
            .await;
        Ok(message.id)
    }

    pub async fn room_recent_history(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
    ) -> Result<Vec<Message>, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .recent_messages(&self.name, ctx.bypass_permissions)
    }

    pub async fn room_history_get(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
        from_id: u64,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .messages_after(&self.name, from_id, limit, ctx.bypass_permissions)
    }

    pub async fn room_history_info(
        &self,
        ctx: &CommandContext,
        room_name: RoomName,
    ) -> Result<HistoryInfo, ChatError> {
        self.core
            .state
            .room_load(&room_name)
            .await?
            .history_info(&self.name, ctx.bypass_permissions)
    }

    // ---- 系统广播 ----

    pub async fn system_message(&self, ctx: &CommandContext, data: Value) -> Result<(), ChatError> {
        let event = ServerEvent::SystemMessage { data };
        match &ctx.socket {
            Some(socket) => {
                self.core
                    .transport
                    .channel_send(socket, SYSTEM_CHANNEL, &event)
                    .await
            }
            None => self.core.transport.channel_emit(SYSTEM_CHANNEL, &event).await,
        }
    }
}
