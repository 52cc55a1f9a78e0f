//! 每个用户的私聊许可记录。
//!
//! 黑名单优先；开启白名单模式后只有白名单内的发送者可以私聊。
//! 名单操作是幂等的集合运算。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::value_objects::{DirectListKind, UserName};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectMessaging {
    pub whitelist: HashSet<UserName>,
    pub blacklist: HashSet<UserName>,
    pub whitelist_only: bool,
}

impl DirectMessaging {
    fn list_mut(&mut self, kind: DirectListKind) -> &mut HashSet<UserName> {
        match kind {
            DirectListKind::Whitelist => &mut self.whitelist,
            DirectListKind::Blacklist => &mut self.blacklist,
        }
    }

    fn list(&self, kind: DirectListKind) -> &HashSet<UserName> {
        match kind {
            DirectListKind::Whitelist => &self.whitelist,
            DirectListKind::Blacklist => &self.blacklist,
        }
    }

    // 自己的名字不允许写进自己的名单
    fn reject_own_name(owner: &UserName, values: &[UserName]) -> Result<(), ChatError> {
        if values.contains(owner) {
            return Err(ChatError::not_allowed(format!(
                "{owner} cannot list their own name"
            )));
        }
        Ok(())
    }

    pub fn add_to_list(
        &mut self,
        owner: &UserName,
        kind: DirectListKind,
        values: &[UserName],
    ) -> Result<(), ChatError> {
        Self::reject_own_name(owner, values)?;
        let list = self.list_mut(kind);
        for name in values {
            list.insert(name.clone());
        }
        Ok(())
    }

    pub fn remove_from_list(
        &mut self,
        owner: &UserName,
        kind: DirectListKind,
        values: &[UserName],
    ) -> Result<(), ChatError> {
        Self::reject_own_name(owner, values)?;
        let list = self.list_mut(kind);
        for name in values {
            list.remove(name);
        }
        Ok(())
    }

    /// 名单内容，按名字排序以保证确定的返回顺序。
    pub fn list_members(&self, kind: DirectListKind) -> Vec<UserName> {
        let mut members: Vec<UserName> = self.list(kind).iter().cloned().collect();
        members.sort();
        members
    }

    pub fn mode(&self) -> bool {
        self.whitelist_only
    }

    pub fn set_mode(&mut self, whitelist_only: bool) {
        self.whitelist_only = whitelist_only;
    }

    /// 私聊准入判定。
    pub fn admits(&self, sender: &UserName, bypass_permissions: bool) -> bool {
        if bypass_permissions {
            return true;
        }
        if self.blacklist.contains(sender) {
            return false;
        }
        !self.whitelist_only || self.whitelist.contains(sender)
    }
}
