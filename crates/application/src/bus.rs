//! 集群总线报文。
//!
//! 跨实例的控制消息（驱逐、强制断开）经状态存储的发布/订阅
//! 通道送达所有实例；发起方在 `busAckTimeout` 内收集目标实例的
//! 应答，超时只产生一致性失败事件，从不让发起命令失败。

use domain::{InstanceId, RoomName, UserName};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub id: Uuid,
    pub origin: InstanceId,
    pub payload: BusPayload,
}

impl BusEnvelope {
    pub fn new(origin: InstanceId, payload: BusPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            payload,
        }
    }

    pub fn ack(request: Uuid, from: InstanceId) -> Self {
        Self::new(from, BusPayload::Ack { request, from })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BusPayload {
    /// 名单变更驱逐：每个实例把该用户本地已加入此房间的套接字移出。
    DisconnectUserFromRoom { user: UserName, room: RoomName },
    /// 服务端 API 强制断开该用户的全部套接字。
    DisconnectUserSockets { user: UserName },
    /// 对某个请求的实例级应答。
    Ack { request: Uuid, from: InstanceId },
}
