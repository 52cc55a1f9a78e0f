//! 基本命令流测试
//!
//! 覆盖建房-加入-发消息的正路径、多套接字回声、系统广播、
//! 命令管线的校验与钩子。

mod support;

use application::{BeforeOutcome, ExecOptions};
use config::ChatConfig;
use domain::{ChatError, UserName};
use serde_json::json;
use support::*;

fn raw_error_config() -> ChatConfig {
    let mut config = ChatConfig::test_config();
    config.use_raw_error_objects = true;
    config
}

#[tokio::test]
async fn create_join_message_round_trip() {
    let server = start_server(raw_error_config()).await;
    let mut alice = connect(&server, "alice").await;

    assert!(ok(&alice, "roomCreate", vec![json!("r"), json!(false)])
        .await
        .is_empty());
    let data = ok(&alice, "roomJoin", vec![json!("r")]).await;
    assert_eq!(data, vec![json!(1)]);
    // 自己也在房间频道里，能看到成员加入广播
    let frame = recv(&mut alice).await;
    assert_eq!(frame.event, "roomUserJoined");
    assert_eq!(frame.args, vec![json!("r"), json!("alice")]);

    let sent_at = chrono::Utc::now().timestamp_millis();
    let data = ok(
        &alice,
        "roomMessage",
        vec![json!("r"), json!({"textMessage": "hi"})],
    )
    .await;
    assert_eq!(data, vec![json!({"id": 1})]);

    let frame = recv(&mut alice).await;
    assert_eq!(frame.event, "roomMessage");
    assert_eq!(frame.args[0], "r");
    let message = &frame.args[1];
    assert_eq!(message["id"], 1);
    assert_eq!(message["author"], "alice");
    assert_eq!(message["textMessage"], "hi");
    assert!(message["timestamp"].as_i64().unwrap() >= sent_at);

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn second_socket_gets_join_echoes() {
    let server = start_server(ChatConfig::test_config()).await;
    let mut s1 = connect(&server, "alice").await;
    let mut s2 = connect(&server, "alice").await;

    // S2 接入时 S1 收到连接回声
    let frame = recv(&mut s1).await;
    assert_eq!(frame.event, "socketConnectEcho");
    assert_eq!(frame.args, vec![json!(s2.id()), json!(2)]);

    ok(&s1, "roomCreate", vec![json!("r"), json!(false)]).await;
    assert_eq!(ok(&s1, "roomJoin", vec![json!("r")]).await, vec![json!(1)]);
    let frame = recv(&mut s2).await;
    assert_eq!(frame.event, "roomJoinedEcho");
    assert_eq!(frame.args, vec![json!("r"), json!(s1.id()), json!(1)]);

    // 同一用户的第二个套接字加入：没有新的 roomUserJoined
    assert_eq!(ok(&s2, "roomJoin", vec![json!("r")]).await, vec![json!(2)]);
    let frame = recv_until(&mut s1, "roomJoinedEcho").await;
    assert_eq!(frame.args, vec![json!("r"), json!(s2.id()), json!(2)]);
    // S2 自己的队列里只剩自己那次加入的成员广播之外的内容
    assert!(s2.try_recv().is_none());

    // 两个套接字都退出后再看离开回声
    assert_eq!(ok(&s1, "roomLeave", vec![json!("r")]).await, vec![json!(1)]);
    let frame = recv(&mut s2).await;
    assert_eq!(frame.event, "roomLeftEcho");
    assert_eq!(frame.args, vec![json!("r"), json!(s1.id()), json!(1)]);

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn disabled_direct_messages_yield_not_allowed() {
    // 默认配置不开私聊
    let mut config = ChatConfig::default();
    config.use_raw_error_objects = true;
    let server = start_server(config).await;
    let alice = connect(&server, "alice").await;
    let _bob = connect(&server, "bob").await;

    let error = fail(
        &alice,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "hi"})],
    )
    .await;
    assert_eq!(error["name"], "notAllowed");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn direct_message_reaches_recipient_and_echoes() {
    let server = start_server(ChatConfig::test_config()).await;
    let mut alice1 = connect(&server, "alice").await;
    let mut alice2 = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;
    // alice 的第一个套接字会收到第二个套接字的连接回声
    let frame = recv(&mut alice1).await;
    assert_eq!(frame.event, "socketConnectEcho");

    let data = ok(
        &alice1,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "pst"})],
    )
    .await;
    assert_eq!(data[0]["author"], "alice");
    assert_eq!(data[0]["textMessage"], "pst");

    let frame = recv(&mut bob).await;
    assert_eq!(frame.event, "directMessage");
    assert_eq!(frame.args[0]["textMessage"], "pst");

    // 发送者的另一个套接字收到回声，发送套接字收不到
    let frame = recv(&mut alice2).await;
    assert_eq!(frame.event, "directMessageEcho");
    assert_eq!(frame.args[0], "bob");
    assert_eq!(frame.args[1]["textMessage"], "pst");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn system_message_reaches_other_sockets() {
    let server = start_server(ChatConfig::test_config()).await;
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    ok(&alice, "systemMessage", vec![json!({"maintenance": true})]).await;
    let frame = recv(&mut bob).await;
    assert_eq!(frame.event, "systemMessage");
    assert_eq!(frame.args[0]["maintenance"], true);
    // 发起的套接字被排除
    assert!(alice.try_recv().is_none());

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn validation_precedes_execution() {
    let server = start_server(raw_error_config()).await;
    let alice = connect(&server, "alice").await;

    let error = fail(&alice, "roomExplode", vec![]).await;
    assert_eq!(error["name"], "noCommand");

    let error = fail(&alice, "roomJoin", vec![]).await;
    assert_eq!(error["name"], "wrongArgumentsCount");

    let error = fail(&alice, "roomMessage", vec![json!("r"), json!("text")]).await;
    assert_eq!(error["name"], "badArgument");
    assert_eq!(error["args"], json!(["roomMessage", 2]));

    // 载荷必须带 textMessage
    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&alice, "roomJoin", vec![json!("r")]).await;
    let error = fail(&alice, "roomMessage", vec![json!("r"), json!({"x": 1})]).await;
    assert_eq!(error["name"], "badArgument");

    // 名称规则
    let error = fail(&alice, "roomCreate", vec![json!("a b"), json!(false)]).await;
    assert_eq!(error["name"], "invalidName");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn before_and_after_hooks_participate() {
    let transport = std::sync::Arc::new(application::MemoryTransport::new());
    let service = application::ChatServiceBuilder::new(ChatConfig::test_config())
        .with_transport(transport.clone() as std::sync::Arc<dyn application::Transport>)
        // 前置钩子改写房间名
        .before("roomJoin", |_ctx, mut args| async move {
            args[0] = json!("renamed");
            Ok(BeforeOutcome::Proceed(args))
        })
        // 前置钩子短路
        .before("listRooms", |_ctx, _args| async move {
            Ok(BeforeOutcome::Complete(vec![json!(["shadow"])]))
        })
        // 后置钩子改写结果
        .after("roomGetWhitelistMode", |_ctx, _args, _results| async move {
            Ok(vec![json!(true)])
        })
        .before("roomDelete", |_ctx, _args| async move {
            Err(ChatError::not_allowed("deletion is frozen"))
        })
        .build()
        .unwrap();
    service.start().await.unwrap();
    let server_transport = transport;

    let mut client = application::MemoryTransport::connect(&server_transport, json!("alice")).await.unwrap();
    let frame = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.event, "loginConfirmed");

    let ack = client
        .command("roomCreate", vec![json!("renamed"), json!(false)])
        .await;
    assert!(ack.error.is_none());
    // 改写后的参数生效：加入的是 renamed 而不是 other
    let ack = client.command("roomJoin", vec![json!("other")]).await;
    assert!(ack.error.is_none());
    assert_eq!(ack.data, vec![json!(1)]);

    let ack = client.command("listRooms", vec![]).await;
    assert_eq!(ack.data, vec![json!(["shadow"])]);

    let ack = client
        .command("roomGetWhitelistMode", vec![json!("renamed")])
        .await;
    assert_eq!(ack.data, vec![json!(true)]);

    // 钩子错误取代命令结果
    let ack = client.command("roomDelete", vec![json!("renamed")]).await;
    assert!(ack.error.is_some());

    service.close().await.unwrap();
}

#[tokio::test]
async fn exec_runs_without_a_socket() {
    let server = start_server(ChatConfig::test_config()).await;
    let alice = UserName::parse("alice").unwrap();
    server
        .service
        .add_user(&alice, domain::DirectMessaging::default())
        .await
        .unwrap();

    // 本地调用旁路权限建房
    server
        .service
        .exec(
            "roomCreate",
            ExecOptions {
                user_name: Some(alice.clone()),
                bypass_permissions: true,
                is_local_call: true,
                ..ExecOptions::default()
            },
            vec![json!("r"), json!(false)],
        )
        .await
        .unwrap();

    // 没有套接字的 roomJoin 报 noSocket
    let err = server
        .service
        .exec(
            "roomJoin",
            ExecOptions {
                user_name: Some(alice.clone()),
                is_local_call: true,
                ..ExecOptions::default()
            },
            vec![json!("r")],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NoSocket(_)));

    // 未知用户报 noUserOnline
    let err = server
        .service
        .exec(
            "listRooms",
            ExecOptions {
                user_name: Some(UserName::parse("nobody").unwrap()),
                ..ExecOptions::default()
            },
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NoUserOnline(_)));

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn invalid_credentials_are_rejected() {
    let server = start_server(ChatConfig::test_config()).await;
    let mut client = application::MemoryTransport::connect(&server.transport, json!("bad name")).await.unwrap();
    let frame = recv(&mut client).await;
    assert_eq!(frame.event, "loginRejected");
    let frame = recv(&mut client).await;
    assert_eq!(frame.event, "disconnect");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn list_joined_sockets_reports_local_projection() {
    let server = start_server(ChatConfig::test_config()).await;
    let mut s1 = connect(&server, "alice").await;
    let s2 = connect(&server, "alice").await;
    let _ = recv(&mut s1).await; // socketConnectEcho

    ok(&s1, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&s1, "roomJoin", vec![json!("r")]).await;

    let data = ok(&s2, "listJoinedSockets", vec![]).await;
    let map = data[0].as_object().unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map[s1.id().as_str()], json!(["r"]));
    assert_eq!(map[s2.id().as_str()], json!([]));

    server.service.close().await.unwrap();
}
