//! 历史子引擎测试
//!
//! 历史环饱和、id 单调性、查询上限与 userSeen。

mod support;

use config::ChatConfig;
use serde_json::json;
use support::*;

fn small_history_config() -> ChatConfig {
    let mut config = ChatConfig::test_config();
    config.history_max_messages = 100;
    config.history_max_get_messages = 100;
    config
}

#[tokio::test]
async fn saturated_ring_keeps_latest_and_ids_stay_monotonic() {
    let server = start_server(small_history_config()).await;
    let alice = connect(&server, "alice").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&alice, "roomJoin", vec![json!("r")]).await;

    // 超出环容量 10 条
    for i in 1..=110_u64 {
        let data = ok(
            &alice,
            "roomMessage",
            vec![json!("r"), json!({ "textMessage": format!("m{i}") })],
        )
        .await;
        assert_eq!(data[0]["id"], i);
    }

    let info = ok(&alice, "roomHistoryInfo", vec![json!("r")]).await;
    assert_eq!(info[0]["lastId"], 110);
    assert_eq!(info[0]["historySize"], 100);
    assert_eq!(info[0]["historyMaxSize"], 100);
    assert_eq!(info[0]["historyMaxGetMessages"], 100);

    // id > 10 的全部 100 条都在，新的在前
    let data = ok(
        &alice,
        "roomHistoryGet",
        vec![json!("r"), json!(10), json!(1000)],
    )
    .await;
    let messages = data[0].as_array().unwrap();
    assert_eq!(messages.len(), 100);
    assert_eq!(messages[0]["id"], 110);
    assert_eq!(messages[99]["id"], 11);

    // 从中间的 id 继续取
    let data = ok(
        &alice,
        "roomHistoryGet",
        vec![json!("r"), json!(105), json!(1000)],
    )
    .await;
    let ids: Vec<u64> = data[0]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![110, 109, 108, 107, 106]);

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn fetch_cap_limits_single_reads() {
    let mut config = ChatConfig::test_config();
    config.history_max_messages = 50;
    config.history_max_get_messages = 5;
    let server = start_server(config).await;
    let alice = connect(&server, "alice").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&alice, "roomJoin", vec![json!("r")]).await;
    for _ in 0..20 {
        ok(
            &alice,
            "roomMessage",
            vec![json!("r"), json!({"textMessage": "x"})],
        )
        .await;
    }

    let data = ok(&alice, "roomRecentHistory", vec![json!("r")]).await;
    let messages = data[0].as_array().unwrap();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0]["id"], 20);

    // limit 与上限取较小者
    let data = ok(
        &alice,
        "roomHistoryGet",
        vec![json!("r"), json!(0), json!(3)],
    )
    .await;
    assert_eq!(data[0].as_array().unwrap().len(), 3);
    let data = ok(
        &alice,
        "roomHistoryGet",
        vec![json!("r"), json!(0), json!(100)],
    )
    .await;
    assert_eq!(data[0].as_array().unwrap().len(), 5);

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn history_requires_membership() {
    let mut config = ChatConfig::test_config();
    config.use_raw_error_objects = true;
    let server = start_server(config).await;
    let alice = connect(&server, "alice").await;
    let carol = connect(&server, "carol").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&alice, "roomJoin", vec![json!("r")]).await;
    ok(
        &alice,
        "roomMessage",
        vec![json!("r"), json!({"textMessage": "x"})],
    )
    .await;

    let error = fail(&carol, "roomRecentHistory", vec![json!("r")]).await;
    assert_eq!(error["name"], "notAllowed");
    let error = fail(&carol, "roomHistoryInfo", vec![json!("r")]).await;
    assert_eq!(error["name"], "notAllowed");

    server.service.close().await.unwrap();
}

#[tokio::test]
async fn user_seen_tracks_membership_transitions() {
    let server = start_server(ChatConfig::test_config()).await;
    let alice = connect(&server, "alice").await;
    let bob = connect(&server, "bob").await;

    ok(&alice, "roomCreate", vec![json!("r"), json!(false)]).await;
    ok(&alice, "roomJoin", vec![json!("r")]).await;

    // 从未出现过的用户：joined=false，timestamp=null
    let seen = ok(&alice, "roomUserSeen", vec![json!("r"), json!("bob")]).await;
    assert_eq!(seen[0], json!({"joined": false, "timestamp": null}));

    ok(&bob, "roomJoin", vec![json!("r")]).await;
    let seen = ok(&alice, "roomUserSeen", vec![json!("r"), json!("bob")]).await;
    assert_eq!(seen[0]["joined"], true);
    let joined_at = seen[0]["timestamp"].as_i64().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    ok(&bob, "roomLeave", vec![json!("r")]).await;
    let seen = ok(&alice, "roomUserSeen", vec![json!("r"), json!("bob")]).await;
    assert_eq!(seen[0]["joined"], false);
    assert!(seen[0]["timestamp"].as_i64().unwrap() >= joined_at);

    server.service.close().await.unwrap();
}
