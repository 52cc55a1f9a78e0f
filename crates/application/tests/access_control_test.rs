//! 访问控制测试
//!
//! 房间名单状态机与驱逐、白名单模式、私聊名单。

mod support;

use config::ChatConfig;
use serde_json::json;
use support::*;

fn raw_error_config() -> ChatConfig {
    let mut config = ChatConfig::test_config();
    config.use_raw_error_objects = true;
    config
}

#[tokio::test]
async fn whitelist_removal_evicts_joined_user() {
    let server = start_server(ChatConfig::test_config()).await;
    let alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(true)]).await;
    ok(
        &alice,
        "roomAddToList",
        vec![json!("r"), json!("whitelist"), json!(["bob"])],
    )
    .await;
    assert_eq!(ok(&bob, "roomJoin", vec![json!("r")]).await, vec![json!(1)]);
    let frame = recv(&mut bob).await;
    assert_eq!(frame.event, "roomUserJoined");

    ok(
        &alice,
        "roomRemoveFromList",
        vec![json!("r"), json!("whitelist"), json!(["bob"])],
    )
    .await;

    // bob 依次看到：名单变更、成员离开、访问资格被移除
    let frame = recv(&mut bob).await;
    assert_eq!(frame.event, "roomAccessListRemoved");
    assert_eq!(
        frame.args,
        vec![json!("r"), json!("whitelist"), json!(["bob"])]
    );
    let frame = recv(&mut bob).await;
    assert_eq!(frame.event, "roomUserLeft");
    assert_eq!(frame.args, vec![json!("r"), json!("bob")]);
    let frame = recv(&mut bob).await;
    assert_eq!(frame.event, "roomAccessRemoved");
    assert_eq!(frame.args, vec![json!("r")]);

    // 驱逐后重新加入被拒
    let error = fail(&bob, "roomJoin", vec![json!("r")]).await;
    assert!(error.as_str().unwrap().contains("not allowed"));

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn blacklisted_user_is_evicted_and_kept_out() {
    let server = start_server(raw_error_config()).await;
    let alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&bob, "roomJoin", vec![json!("r")]).await;
    ok(
        &alice,
        "roomAddToList",
        vec![json!("r"), json!("blacklist"), json!(["bob"])],
    )
    .await;

    let frame = recv_until(&mut bob, "roomAccessRemoved").await;
    assert_eq!(frame.args, vec![json!("r")]);
    let error = fail(&bob, "roomJoin", vec![json!("r")]).await;
    assert_eq!(error["name"], "notAllowed");

    // 成员视图里 bob 已消失，时间戳记录了离开
    let seen = ok(&alice, "roomUserSeen", vec![json!("r"), json!("bob")]).await;
    assert_eq!(seen[0]["joined"], false);
    assert!(seen[0]["timestamp"].is_i64());

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn whitelist_mode_flip_evicts_outsiders() {
    let server = start_server(ChatConfig::test_config()).await;
    let alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;
    let mut carol = connect(&server, "carol").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(
        &alice,
        "roomAddToList",
        vec![json!("r"), json!("whitelist"), json!(["carol"])],
    )
    .await;
    ok(&bob, "roomJoin", vec![json!("r")]).await;
    ok(&carol, "roomJoin", vec![json!("r")]).await;

    ok(
        &alice,
        "roomSetWhitelistMode",
        vec![json!("r"), json!(true)],
    )
    .await;

    // 只有 bob 被驱逐；carol 在白名单上
    let frame = recv_until(&mut bob, "roomAccessRemoved").await;
    assert_eq!(frame.args, vec![json!("r")]);
    let frame = recv_until(&mut carol, "roomModeChanged").await;
    assert_eq!(frame.args, vec![json!("r"), json!(true)]);
    assert!(ok(&carol, "roomMessage", vec![json!("r"), json!({"textMessage": "still here"})])
        .await[0]["id"]
        .is_u64());

    let mode = ok(&alice, "roomGetWhitelistMode", vec![json!("r")]).await;
    assert_eq!(mode, vec![json!(true)]);

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn list_mutation_requires_admin_rights() {
    let server = start_server(raw_error_config()).await;
    let alice = connect(&server, "alice").await;
    let bob = connect(&server, "bob").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&bob, "roomJoin", vec![json!("r")]).await;

    let error = fail(
        &bob,
        "roomAddToList",
        vec![json!("r"), json!("blacklist"), json!(["alice"])],
    )
    .await;
    assert_eq!(error["name"], "notAllowed");

    // 提升为管理员后可以改名单
    ok(
        &alice,
        "roomAddToList",
        vec![json!("r"), json!("adminlist"), json!(["bob"])],
    )
    .await;
    ok(
        &bob,
        "roomAddToList",
        vec![json!("r"), json!("blacklist"), json!(["carol"])],
    )
    .await;

    // 但房主不能被写进名单
    let error = fail(
        &bob,
        "roomAddToList",
        vec![json!("r"), json!("blacklist"), json!(["alice"])],
    )
    .await;
    assert_eq!(error["name"], "notAllowed");

    let list = ok(
        &bob,
        "roomGetAccessList",
        vec![json!("r"), json!("blacklist")],
    )
    .await;
    assert_eq!(list, vec![json!(["carol"])]);

    // 未知名单种类
    let error = fail(
        &bob,
        "roomGetAccessList",
        vec![json!("r"), json!("userlist")],
    )
    .await;
    assert_eq!(error["name"], "noList");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn non_member_cannot_read_room_metadata() {
    let server = start_server(raw_error_config()).await;
    let alice = connect(&server, "alice").await;
    let carol = connect(&server, "carol").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    let error = fail(&carol, "roomGetOwner", vec![json!("r")]).await;
    assert_eq!(error["name"], "notAllowed");

    ok(&carol, "roomJoin", vec![json!("r")]).await;
    let owner = ok(&carol, "roomGetOwner", vec![json!("r")]).await;
    assert_eq!(owner, vec![json!("alice")]);

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn direct_messaging_lists_gate_senders() {
    let server = start_server(raw_error_config()).await;
    let alice = connect(&server, "alice").await;
    let bob = connect(&server, "bob").await;

    // bob 把 alice 拉黑
    ok(
        &bob,
        "directAddToList",
        vec![json!("blacklist"), json!(["alice"])],
    )
    .await;
    let error = fail(
        &alice,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "hi"})],
    )
    .await;
    assert_eq!(error["name"], "notAllowed");

    // 移出黑名单后恢复
    ok(
        &bob,
        "directRemoveFromList",
        vec![json!("blacklist"), json!(["alice"])],
    )
    .await;
    ok(
        &alice,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "hi"})],
    )
    .await;

    // 白名单模式：只有名单内的人能发
    ok(&bob, "directSetWhitelistMode", vec![json!(true)]).await;
    assert_eq!(
        ok(&bob, "directGetWhitelistMode", vec![]).await,
        vec![json!(true)]
    );
    let error = fail(
        &alice,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "hi"})],
    )
    .await;
    assert_eq!(error["name"], "notAllowed");
    ok(
        &bob,
        "directAddToList",
        vec![json!("whitelist"), json!(["alice"])],
    )
    .await;
    ok(
        &alice,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "hi"})],
    )
    .await;
    assert_eq!(
        ok(&bob, "directGetAccessList", vec![json!("whitelist")]).await,
        vec![json!(["alice"])]
    );

    // 自己的名字进不了自己的名单
    let error = fail(
        &bob,
        "directAddToList",
        vec![json!("whitelist"), json!(["bob"])],
    )
    .await;
    assert_eq!(error["name"], "notAllowed");

    // 私聊名单没有 adminlist
    let error = fail(
        &bob,
        "directGetAccessList",
        vec![json!("adminlist")],
    )
    .await;
    assert_eq!(error["name"], "noList");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn offline_recipient_is_no_user_online() {
    let server = start_server(raw_error_config()).await;
    let alice = connect(&server, "alice").await;
    let bob = connect(&server, "bob").await;
    bob.disconnect().await;
    // 等断开清理完成
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let error = fail(
        &alice,
        "directMessage",
        vec![json!("bob"), json!({"textMessage": "hi"})],
    )
    .await;
    assert_eq!(error["name"], "noUserOnline");

    server.service.close().await.unwrap();
}
