//! 房间状态机。
//!
//! 房间持有访问名单（白名单/黑名单/管理员名单）、当前成员集合、
//! 有界的消息历史环以及成员最近加入/离开的时间戳。所有方法都是
//! 纯同步的状态迁移；调用方（应用层）负责在房间锁内执行并回写。
//!
//! 准入判定的规范形式：
//! `user ∉ blacklist ∧ (¬whitelistOnly ∨ user ∈ whitelist ∨ user ∈ adminlist ∨ user = owner)`
//! 管理员与房主不会被名单变更驱逐。

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::message::{Message, MessageBody};
use crate::value_objects::{ListKind, RoomName, Timestamp, UserName};

/// 历史环的尺寸限制，来自服务配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLimits {
    pub max_messages: usize,
    pub max_get_messages: usize,
}

/// 服务端建房时的初始状态。
#[derive(Debug, Clone, Default)]
pub struct RoomInit {
    pub owner: Option<UserName>,
    pub whitelist_only: bool,
    pub whitelist: HashSet<UserName>,
    pub blacklist: HashSet<UserName>,
    pub adminlist: HashSet<UserName>,
}

/// `roomHistoryInfo` 的应答。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryInfo {
    pub history_max_get_messages: usize,
    pub history_max_size: usize,
    pub history_size: usize,
    pub last_id: u64,
}

/// `roomUserSeen` 的应答。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSeen {
    pub joined: bool,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    name: RoomName,
    owner: Option<UserName>,
    whitelist: HashSet<UserName>,
    blacklist: HashSet<UserName>,
    adminlist: HashSet<UserName>,
    whitelist_only: bool,
    userlist: HashSet<UserName>,
    history: VecDeque<Message>,
    last_id: u64,
    user_seen: HashMap<UserName, Timestamp>,
    removing: bool,
    limits: HistoryLimits,
}

impl Room {
    pub fn new(name: RoomName, init: RoomInit, limits: HistoryLimits) -> Self {
        Self {
            name,
            owner: init.owner,
            whitelist: init.whitelist,
            blacklist: init.blacklist,
            adminlist: init.adminlist,
            whitelist_only: init.whitelist_only,
            userlist: HashSet::new(),
            history: VecDeque::new(),
            last_id: 0,
            user_seen: HashMap::new(),
            removing: false,
            limits,
        }
    }

    pub fn name(&self) -> &RoomName {
        &self.name
    }

    pub fn owner(&self) -> Option<&UserName> {
        self.owner.as_ref()
    }

    pub fn is_removing(&self) -> bool {
        self.removing
    }

    /// 删除流程置位后，后续操作全部短路。
    pub fn start_removing(&mut self) {
        self.removing = true;
    }

    fn check_open(&self) -> Result<(), ChatError> {
        if self.removing {
            return Err(ChatError::room_removed(self.name.as_str()));
        }
        Ok(())
    }

    fn is_admin(&self, user: &UserName) -> bool {
        self.adminlist.contains(user) || self.owner.as_ref() == Some(user)
    }

    /// 准入判定（不含服务端旁路，旁路由调用方短路）。
    pub fn admits(&self, user: &UserName) -> bool {
        !self.blacklist.contains(user)
            && (!self.whitelist_only
                || self.whitelist.contains(user)
                || self.adminlist.contains(user)
                || self.owner.as_ref() == Some(user))
    }

    pub fn check_is_owner(&self, user: &UserName) -> bool {
        self.owner.as_ref() == Some(user)
    }

    fn require_admin(&self, caller: &UserName, bypass: bool) -> Result<(), ChatError> {
        if bypass || self.is_admin(caller) {
            return Ok(());
        }
        Err(ChatError::not_allowed(format!(
            "{caller} is not an admin of room {}",
            self.name
        )))
    }

    fn require_member(&self, caller: &UserName, bypass: bool) -> Result<(), ChatError> {
        if bypass || self.userlist.contains(caller) || self.is_admin(caller) {
            return Ok(());
        }
        Err(ChatError::not_allowed(format!(
            "{caller} is not a member of room {}",
            self.name
        )))
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut HashSet<UserName> {
        match kind {
            ListKind::Whitelist => &mut self.whitelist,
            ListKind::Blacklist => &mut self.blacklist,
            ListKind::Adminlist => &mut self.adminlist,
        }
    }

    fn list(&self, kind: ListKind) -> &HashSet<UserName> {
        match kind {
            ListKind::Whitelist => &self.whitelist,
            ListKind::Blacklist => &self.blacklist,
            ListKind::Adminlist => &self.adminlist,
        }
    }

    // 名单变更后失去准入资格的当前成员；管理员与房主豁免。
    fn evict_losers(&mut self, now: Timestamp) -> Vec<UserName> {
        let mut evicted: Vec<UserName> = self
            .userlist
            .iter()
            .filter(|u| !self.is_admin(u) && !self.admits(u))
            .cloned()
            .collect();
        evicted.sort();
        for user in &evicted {
            self.userlist.remove(user);
            self.user_seen.insert(user.clone(), now);
        }
        evicted
    }

    fn reject_owner_in_values(&self, values: &[UserName]) -> Result<(), ChatError> {
        if let Some(owner) = &self.owner {
            if values.contains(owner) {
                return Err(ChatError::not_allowed(format!(
                    "owner {owner} cannot be put on a list"
                )));
            }
        }
        Ok(())
    }

    /// 名单添加；返回因此失去访问资格、需要由调用方驱逐的成员。
    pub fn add_to_list(
        &mut self,
        caller: &UserName,
        kind: ListKind,
        values: &[UserName],
        bypass: bool,
        now: Timestamp,
    ) -> Result<Vec<UserName>, ChatError> {
        self.check_open()?;
        self.require_admin(caller, bypass)?;
        self.reject_owner_in_values(values)?;
        let list = self.list_mut(kind);
        for name in values {
            list.insert(name.clone());
        }
        Ok(self.evict_losers(now))
    }

    /// 名单移除；白名单模式下移出白名单同样可能驱逐成员。
    pub fn remove_from_list(
        &mut self,
        caller: &UserName,
        kind: ListKind,
        values: &[UserName],
        bypass: bool,
        now: Timestamp,
    ) -> Result<Vec<UserName>, ChatError> {
        self.check_open()?;
        self.require_admin(caller, bypass)?;
        self.reject_owner_in_values(values)?;
        let list = self.list_mut(kind);
        for name in values {
            list.remove(name);
        }
        Ok(self.evict_losers(now))
    }

    /// 切换白名单模式；返回 (被驱逐成员, 新模式)。
    pub fn change_mode(
        &mut self,
        caller: &UserName,
        whitelist_only: bool,
        bypass: bool,
        now: Timestamp,
    ) -> Result<(Vec<UserName>, bool), ChatError> {
        self.check_open()?;
        self.require_admin(caller, bypass)?;
        self.whitelist_only = whitelist_only;
        Ok((self.evict_losers(now), self.whitelist_only))
    }

    pub fn get_list(
        &self,
        caller: &UserName,
        kind: ListKind,
        bypass: bool,
    ) -> Result<Vec<UserName>, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        let mut members: Vec<UserName> = self.list(kind).iter().cloned().collect();
        members.sort();
        Ok(members)
    }

    pub fn get_owner(&self, caller: &UserName, bypass: bool) -> Result<Option<UserName>, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        Ok(self.owner.clone())
    }

    pub fn get_mode(&self, caller: &UserName, bypass: bool) -> Result<bool, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        Ok(self.whitelist_only)
    }

    /// 接收一条消息：分配下一个 id，入史并按上限裁剪最旧的消息。
    pub fn message(
        &mut self,
        sender: &UserName,
        body: MessageBody,
        bypass: bool,
        now: Timestamp,
    ) -> Result<Message, ChatError> {
        self.check_open()?;
        if !bypass && !self.userlist.contains(sender) {
            return Err(ChatError::not_allowed(format!(
                "{sender} has not joined room {}",
                self.name
            )));
        }
        self.last_id += 1;
        let message = Message {
            id: self.last_id,
            timestamp: now,
            author: sender.clone(),
            body,
        };
        self.history.push_back(message.clone());
        while self.history.len() > self.limits.max_messages {
            self.history.pop_front();
        }
        Ok(message)
    }

    /// 最近的消息，新的在前。
    pub fn recent_messages(
        &self,
        caller: &UserName,
        bypass: bool,
    ) -> Result<Vec<Message>, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        Ok(self
            .history
            .iter()
            .rev()
            .take(self.limits.max_get_messages)
            .cloned()
            .collect())
    }

    /// id 大于 `from_id` 的消息，新的在前，条数不超过
    /// `min(limit, max_get_messages)`。
    pub fn messages_after(
        &self,
        caller: &UserName,
        from_id: u64,
        limit: usize,
        bypass: bool,
    ) -> Result<Vec<Message>, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        let cap = limit.min(self.limits.max_get_messages);
        Ok(self
            .history
            .iter()
            .rev()
            .filter(|m| m.id > from_id)
            .take(cap)
            .cloned()
            .collect())
    }

    pub fn history_info(&self, caller: &UserName, bypass: bool) -> Result<HistoryInfo, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        Ok(HistoryInfo {
            history_max_get_messages: self.limits.max_get_messages,
            history_max_size: self.limits.max_messages,
            history_size: self.history.len(),
            last_id: self.last_id,
        })
    }

    pub fn user_seen(
        &self,
        caller: &UserName,
        target: &UserName,
        bypass: bool,
    ) -> Result<UserSeen, ChatError> {
        self.check_open()?;
        self.require_member(caller, bypass)?;
        Ok(UserSeen {
            joined: self.userlist.contains(target),
            timestamp: self.user_seen.get(target).copied(),
        })
    }

    /// 集群范围的首次加入返回 true（此时成员集合与时间戳已更新）。
    /// 仅由应用层在 (user, room) 加入锁内调用。
    pub fn join(&mut self, user: &UserName, bypass: bool, now: Timestamp) -> Result<bool, ChatError> {
        self.check_open()?;
        if !bypass && !self.admits(user) {
            return Err(ChatError::not_allowed(format!(
                "{user} is not admitted to room {}",
                self.name
            )));
        }
        let newly = self.userlist.insert(user.clone());
        if newly {
            self.user_seen.insert(user.clone(), now);
        }
        Ok(newly)
    }

    /// 幂等的离开；房间删除期间仍然允许。成员确实被移除时返回 true。
    pub fn leave(&mut self, user: &UserName, now: Timestamp) -> bool {
        let present = self.userlist.remove(user);
        if present {
            self.user_seen.insert(user.clone(), now);
        }
        present
    }

    pub fn userlist(&self) -> Vec<UserName> {
        let mut users: Vec<UserName> = self.userlist.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn has_user(&self, user: &UserName) -> bool {
        self.userlist.contains(user)
    }

    pub fn last_message_id(&self) -> u64 {
        self.last_id
    }
}
