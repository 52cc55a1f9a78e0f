//! 服务配置
//!
//! 聊天引擎识别的全部配置项，含特性开关、历史尺寸与分布式超时。
//!
//! 分层加载顺序：
//! 1. config/default.yml (基础默认值)
//! 2. config/local.yml (本地开发覆盖，不提交到git)
//! 3. 环境变量 (最高优先级)
//!
//! 配置错误时立即失败，服务不应该带着错误配置启动。

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// 聊天引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// 状态存储的种类标签（内建 "memory"；可经工厂注册表扩展）
    pub state: String,
    /// 传输层的种类标签
    pub transport: String,
    /// 关闭服务时等待客户端断开的上限（毫秒）
    #[serde(rename = "closeTimeout")]
    pub close_timeout_ms: u64,
    /// 是否广播名单变更通知
    #[serde(rename = "enableAccessListsUpdates")]
    pub enable_access_lists_updates: bool,
    /// 是否允许私聊
    #[serde(rename = "enableDirectMessages")]
    pub enable_direct_messages: bool,
    /// 是否允许客户端建房/删房
    #[serde(rename = "enableRoomsManagement")]
    pub enable_rooms_management: bool,
    /// 是否广播成员加入/离开通知
    #[serde(rename = "enableUserlistUpdates")]
    pub enable_userlist_updates: bool,
    /// 单次历史查询的条数上限
    #[serde(rename = "historyMaxGetMessages")]
    pub history_max_get_messages: usize,
    /// 每个房间历史环的容量
    #[serde(rename = "historyMaxMessages")]
    pub history_max_messages: usize,
    /// 错误应答用结构化对象还是字符串
    #[serde(rename = "useRawErrorObjects")]
    pub use_raw_error_objects: bool,
    /// 等待集群总线应答的上限（毫秒）
    #[serde(rename = "busAckTimeout")]
    pub bus_ack_timeout_ms: u64,
    /// 分布式锁的存活时间（毫秒）
    #[serde(rename = "lockTTL")]
    pub lock_ttl_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            state: "memory".to_owned(),
            transport: "memory".to_owned(),
            close_timeout_ms: 5000,
            enable_access_lists_updates: false,
            enable_direct_messages: false,
            enable_rooms_management: false,
            enable_userlist_updates: false,
            history_max_get_messages: 100,
            history_max_messages: 10000,
            use_raw_error_objects: false,
            bus_ack_timeout_ms: 5000,
            lock_ttl_ms: 10000,
        }
    }
}

impl ChatConfig {
    /// 分层加载：default.yml → local.yml → 环境变量。
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Yaml::file("config/default.yml"));

        if Path::new("config/local.yml").exists() {
            figment = figment.merge(Yaml::file("config/local.yml"));
        }

        figment = figment.merge(Env::prefixed("CHAT_"));

        let config: ChatConfig = figment
            .extract()
            .map_err(|e| ConfigError::Figment(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "state kind cannot be empty".to_owned(),
            ));
        }
        if self.transport.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "transport kind cannot be empty".to_owned(),
            ));
        }
        if self.history_max_messages == 0 {
            return Err(ConfigError::InvalidValue(
                "historyMaxMessages must be greater than 0".to_owned(),
            ));
        }
        if self.history_max_get_messages == 0 {
            return Err(ConfigError::InvalidValue(
                "historyMaxGetMessages must be greater than 0".to_owned(),
            ));
        }
        if self.lock_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "lockTTL must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn bus_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_ack_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// 测试专用配置：全部开关打开、超时调短。
    pub fn test_config() -> Self {
        Self {
            enable_access_lists_updates: true,
            enable_direct_messages: true,
            enable_rooms_management: true,
            enable_userlist_updates: true,
            close_timeout_ms: 1000,
            bus_ack_timeout_ms: 1000,
            lock_ttl_ms: 2000,
            ..Self::default()
        }
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("configuration parsing error: {0}")]
    Figment(String),
}
