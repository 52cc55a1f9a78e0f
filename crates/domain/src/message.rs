//! 消息载荷与入史消息。
//!
//! 客户端提交的载荷至少含 `textMessage` 字段，其余字段原样
//! 保留（扁平化），自定义校验钩子可以放宽或收紧这个约定。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::value_objects::{Timestamp, UserName};

/// 客户端提交的消息载荷。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(rename = "textMessage")]
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: Map::new(),
        }
    }

    /// 默认载荷校验：必须是带字符串 `textMessage` 的对象。
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        obj.get("textMessage")?.as_str()?;
        serde_json::from_value(value.clone()).ok()
    }

    /// 宽松解析：自定义校验钩子放行的载荷可以没有 `textMessage`。
    pub fn lenient(value: &Value) -> Self {
        let mut extra = value.as_object().cloned().unwrap_or_default();
        let text = match extra.remove("textMessage") {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };
        Self { text, extra }
    }
}

/// 被房间接收后的消息：房间分配的单调递增 id、毫秒时间戳、作者。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Timestamp,
    pub author: UserName,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// 私聊消息没有 id，只有时间戳和作者。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Timestamp,
    pub author: UserName,
    #[serde(flatten)]
    pub body: MessageBody,
}
