//! 集成测试的公共脚手架：搭一个（或多个共享状态存储的）服务
//! 实例，并提供带超时的收帧辅助函数。
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use application::{
    ChatService, ChatServiceBuilder, ClientFrame, MemoryStateStore, MemoryTransport, StateStore,
    TestClient, Transport,
};
use config::ChatConfig;
use serde_json::{json, Value};

pub struct TestServer {
    pub service: ChatService,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<MemoryStateStore>,
}

/// 用给定配置起一个服务实例（独享内存状态存储）。
pub async fn start_server(config: ChatConfig) -> TestServer {
    start_server_with_store(config, Arc::new(MemoryStateStore::new())).await
}

/// 多实例测试：几个服务实例共享一份状态存储。
pub async fn start_server_with_store(
    config: ChatConfig,
    store: Arc<MemoryStateStore>,
) -> TestServer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let transport = Arc::new(MemoryTransport::new());
    let service = ChatServiceBuilder::new(config)
        .with_state(Arc::clone(&store) as Arc<dyn StateStore>)
        .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .build()
        .expect("service should build");
    service.start().await.expect("service should start");
    TestServer {
        service,
        transport,
        store,
    }
}

/// 接入并完成登录确认。
pub async fn connect(server: &TestServer, name: &str) -> TestClient {
    let mut client = MemoryTransport::connect(&server.transport, json!(name))
        .await
        .expect("transport should accept");
    let frame = recv(&mut client).await;
    assert_eq!(frame.event, "loginConfirmed", "unexpected frame: {frame:?}");
    assert_eq!(frame.args[0], name);
    client
}

/// 带超时收一帧。
pub async fn recv(client: &mut TestClient) -> ClientFrame {
    tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
}

/// 收帧直到拿到指定事件（中途允许出现别的事件）。
pub async fn recv_until(client: &mut TestClient, event: &str) -> ClientFrame {
    for _ in 0..16 {
        let frame = recv(client).await;
        if frame.event == event {
            return frame;
        }
    }
    panic!("did not receive event {event}");
}

/// 命令必须成功，返回应答数据。
pub async fn ok(client: &TestClient, name: &str, args: Vec<Value>) -> Vec<Value> {
    let ack = client.command(name, args).await;
    assert!(
        ack.error.is_none(),
        "command {name} failed: {:?}",
        ack.error
    );
    ack.data
}

/// 命令必须失败，返回序列化后的错误。
pub async fn fail(client: &TestClient, name: &str, args: Vec<Value>) -> Value {
    let ack = client.command(name, args).await;
    ack.error.unwrap_or_else(|| panic!("command {name} unexpectedly succeeded"))
}
