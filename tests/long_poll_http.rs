#![cfg(feature = "http")]
use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use bayeux_rs::prelude::*;
use serde_json::{json, Value};

use server_utils::{build_app, run_integration_test};

#[tokio::test]
async fn wildcard_subscriber_receives_publish() {
    run_integration_test(5, || async {
        let app = build_app(5_000);
        let subscriber = app.handshake().await;
        let publisher = app.handshake().await;

        let response = app.subscribe(&subscriber, "/foo/*").await;
        assert_eq!(response, json!({"successful": true, "subscription": "/foo/*"}));

        let connect = app.spawn_connect(&subscriber);
        app.wait_for_waiting(&subscriber).await;

        let response = app.publish(&publisher, "/foo/bar", json!("X")).await;
        assert_eq!(response, json!({"successful": true, "id": 1}));

        let messages = connect.await.unwrap();
        assert_eq!(
            messages,
            json!([{"channel": "/foo/bar", "data": "X", "id": 1}])
        );
    })
    .await;
}

#[tokio::test]
async fn connect_times_out_with_empty_batch() {
    run_integration_test(5, || async {
        let app = build_app(1_000);
        let client_id = app.handshake().await;

        let started = Instant::now();
        let messages = app.connect(&client_id).await;
        let elapsed = started.elapsed();

        assert_eq!(messages, json!([]));
        assert!(elapsed >= Duration::from_millis(900), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3_000), "{:?}", elapsed);
    })
    .await;
}

#[tokio::test]
async fn expired_session_releases_parked_connect() {
    run_integration_test(5, || async {
        let app = build_app(5_000);
        let client_id = app.handshake().await;
        let connect = app.spawn_connect(&client_id);
        app.wait_for_waiting(&client_id).await;

        let later = chrono::Utc::now() + chrono::TimeDelta::seconds(300);
        let expired = app.dispatcher.sweep(later);
        assert_eq!(expired, vec![SessionId::from(client_id.as_str())]);

        let response = connect.await.unwrap();
        assert_eq!(response["successful"], json!(false));
        assert_eq!(response["error"], json!("SessionExpired"));
        assert_eq!(response["advice"]["reconnect"], json!("handshake"));

        // Gone for good
        let response = app.connect(&client_id).await;
        assert_eq!(response["error"], json!("UnknownSession"));
    })
    .await;
}

#[tokio::test]
async fn disconnect_releases_parked_connect() {
    run_integration_test(5, || async {
        let app = build_app(5_000);
        let client_id = app.handshake().await;
        let connect = app.spawn_connect(&client_id);
        app.wait_for_waiting(&client_id).await;

        let response = app.post("/disconnect", json!({"clientId": client_id})).await;
        assert_eq!(response, json!({"successful": true}));

        let response = connect.await.unwrap();
        assert_eq!(response["error"], json!("Disconnected"));
        assert_eq!(response["advice"]["reconnect"], json!("none"));
    })
    .await;
}

#[tokio::test]
async fn backlog_is_returned_immediately() {
    run_integration_test(5, || async {
        let app = build_app(5_000);
        let subscriber = app.handshake().await;
        let publisher = app.handshake().await;
        app.subscribe(&subscriber, "/news/**").await;

        app.publish(&publisher, "/news/a", json!(1)).await;
        app.publish(&publisher, "/news/a/b", json!(2)).await;
        app.publish(&publisher, "/other", json!(3)).await;

        let started = Instant::now();
        let messages = app.connect(&subscriber).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            messages,
            json!([
                {"channel": "/news/a", "data": 1, "id": 1},
                {"channel": "/news/a/b", "data": 2, "id": 2},
            ])
        );
    })
    .await;
}

#[tokio::test]
async fn concurrent_publishers_keep_per_session_order() {
    run_integration_test(10, || async {
        let app = build_app(5_000);
        let mut subscribers = vec![];
        for _ in 0..4 {
            let client_id = app.handshake().await;
            app.subscribe(&client_id, "/load/*").await;
            subscribers.push(client_id);
        }

        let mut publishers = vec![];
        for worker in 0..4 {
            let app = app.clone();
            publishers.push(tokio::spawn(async move {
                let client_id = app.handshake().await;
                for n in 0..25 {
                    app.publish(&client_id, &format!("/load/{}", worker), json!(n))
                        .await;
                }
            }));
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        for client_id in subscribers {
            let messages = app.connect(&client_id).await;
            let ids: Vec<u64> = messages
                .as_array()
                .unwrap()
                .iter()
                .map(|m| m["id"].as_u64().unwrap())
                .collect();
            assert_eq!(ids.len(), 100);
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "{:?}", ids);

            // Each publisher's own messages come out in the order sent
            let mut per_channel: HashMap<String, Vec<i64>> = HashMap::new();
            for message in messages.as_array().unwrap() {
                per_channel
                    .entry(message["channel"].as_str().unwrap().to_string())
                    .or_default()
                    .push(message["data"].as_i64().unwrap());
            }
            for values in per_channel.values() {
                assert_eq!(values, &(0..25).collect::<Vec<i64>>());
            }
        }
    })
    .await;
}

#[tokio::test]
async fn second_connect_is_rejected() {
    run_integration_test(5, || async {
        let app = build_app(5_000);
        let client_id = app.handshake().await;
        let first = app.spawn_connect(&client_id);
        app.wait_for_waiting(&client_id).await;

        let response = app.connect(&client_id).await;
        assert_eq!(response["successful"], json!(false));
        assert_eq!(response["error"], json!("AlreadyWaiting"));

        // The first one is still parked and gets the next message
        app.subscribe(&client_id, "/ping").await;
        app.dispatcher.publish("/ping", json!("pong")).unwrap();
        let messages = first.await.unwrap();
        assert_eq!(messages[0]["data"], json!("pong"));
    })
    .await;
}

#[tokio::test]
async fn dropped_connect_frees_the_slot() {
    run_integration_test(5, || async {
        let app = build_app(5_000);
        let client_id = app.handshake().await;
        let connect = app.spawn_connect(&client_id);
        app.wait_for_waiting(&client_id).await;

        // Same as the client hanging up
        connect.abort();
        let _ = connect.await;

        let id = SessionId::from(client_id.as_str());
        assert_eq!(app.dispatcher.holder().state(&id), Some(PollState::Idle));

        app.subscribe(&client_id, "/after").await;
        app.dispatcher.publish("/after", json!(true)).unwrap();
        let messages = app.connect(&client_id).await;
        assert_eq!(messages[0]["data"], json!(true));
    })
    .await;
}

#[tokio::test]
async fn protocol_errors() {
    run_integration_test(5, || async {
        let app = build_app(1_000);
        let client_id = app.handshake().await;

        let response = app.subscribe("does-not-exist", "/foo").await;
        assert_eq!(response["successful"], json!(false));
        assert_eq!(response["error"], json!("UnknownSession"));
        assert_eq!(response["advice"]["reconnect"], json!("handshake"));

        let response = app.subscribe(&client_id, "/foo/**/bar").await;
        assert_eq!(response["error"], json!("InvalidPattern"));

        let response = app.subscribe(&client_id, "/meta/connect").await;
        assert_eq!(response["error"], json!("InvalidPattern"));

        let response = app.publish(&client_id, "/foo/*", json!(1)).await;
        assert_eq!(response["error"], json!("InvalidChannel"));

        let response = app
            .post(
                "/connect",
                json!({"clientId": client_id, "connectionType": "websocket"}),
            )
            .await;
        assert_eq!(response["error"], json!("UnsupportedConnectionType"));

        let response = app
            .post("/unsubscribe", json!({"clientId": client_id, "subscription": "/x"}))
            .await;
        assert_eq!(response, json!({"successful": true, "subscription": "/x"}));

        let (status, _) = app.post_raw("/subscribe", "not json".to_string()).await;
        assert!(status.is_client_error(), "{}", status);
    })
    .await;
}

#[tokio::test]
async fn handshake_advertises_long_polling() {
    run_integration_test(5, || async {
        let app = build_app(1_500);
        let response: Value = app.post("/handshake", json!({})).await;
        assert_eq!(response["supportedConnectionTypes"], json!(["long-polling"]));
        assert_eq!(response["version"], json!("1.0"));
        assert_eq!(response["advice"]["timeout"], json!(1_500));
        assert_eq!(response["advice"]["reconnect"], json!("retry"));
        assert_eq!(response["clientId"].as_str().unwrap().len(), 32);

        let (status, _) = app.post_raw("/nowhere", "{}".to_string()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    })
    .await;
}
