//! End-to-end request/response behavior over an in-memory stream.

mod common;

use common::{connect, server, wait_until};
use objex::{ClientBuilder, Error, Value, PROPERTY_CHANGED};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn root_query_yields_same_identifier_for_every_client() {
    let server = server();
    let first = connect(&server, ClientBuilder::new());
    let second = connect(&server, ClientBuilder::new());

    let root_a = first.root().await.unwrap();
    let root_b = second.root().await.unwrap();

    assert_eq!(root_a.id(), root_b.id());
    assert_eq!(root_a.class_name(), "TestRoot");
}

#[tokio::test]
async fn root_proxy_is_populated_with_introduction_state() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    assert!(root.is_populated());
    assert_eq!(root.cached("Greeting"), Some(Value::from("hello")));
}

#[tokio::test]
async fn echo_returns_the_argument() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    let reply = root.invoke("Echo", vec![Value::from("hi")]).await.unwrap();
    assert_eq!(reply, Value::from("hi"));
}

#[tokio::test]
async fn get_after_set_observes_the_written_value() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    root.set("Greeting", Value::from("changed")).await.unwrap();
    let value = root.get("Greeting").await.unwrap();
    assert_eq!(value, Value::from("changed"));
}

#[tokio::test]
async fn unknown_property_yields_an_exception() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    let err = root.get("Nonexistent").await.unwrap_err();
    assert!(err.to_string().contains("unknown property"));
}

#[tokio::test]
async fn unknown_method_and_arity_mismatch_yield_exceptions() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();

    let err = root.invoke("Missing", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("unknown method"));

    let err = root
        .invoke("Echo", vec![Value::from("a"), Value::from("b")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("parameters"));
}

#[tokio::test]
async fn failed_invocation_still_leaves_the_session_usable() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    // Wrong argument type: the handler rejects it.
    assert!(root.invoke("Counter", vec![Value::Int(1)]).await.is_err());
    // The server logged and continued.
    let reply = root.invoke("Echo", vec![Value::from("still up")]).await.unwrap();
    assert_eq!(reply, Value::from("still up"));
}

#[tokio::test]
async fn method_result_can_be_an_object_reference() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    let counter = root
        .invoke("Counter", vec![Value::from("a")])
        .await
        .unwrap()
        .into_proxy()
        .unwrap();

    assert_eq!(counter.class_name(), "Counter");
    assert!(counter.is_populated());
    assert_eq!(counter.cached("Count"), Some(Value::Int(0)));

    let total = counter.invoke("Add", vec![Value::Int(5)]).await.unwrap();
    assert_eq!(total, Value::Int(5));
    assert_eq!(counter.get("Count").await.unwrap(), Value::Int(5));
}

#[tokio::test]
async fn object_argument_resolves_back_to_the_server_object() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    // Echo an object reference through the server and back.
    let counter = root
        .invoke("Counter", vec![Value::from("b")])
        .await
        .unwrap()
        .into_proxy()
        .unwrap();

    let echoed = root
        .invoke("Echo", vec![Value::remote(counter.clone())])
        .await
        .unwrap()
        .into_proxy()
        .unwrap();
    assert_eq!(echoed.id(), counter.id());
}

#[tokio::test]
async fn property_change_notifications_are_delivered_exactly_once() {
    let server = server();
    let watcher = connect(&server, ClientBuilder::new());
    let mutator = connect(&server, ClientBuilder::new());

    let watched_root = watcher.root().await.unwrap();
    let mutated_root = mutator.root().await.unwrap();

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = watched_root
        .subscribe(
            PROPERTY_CHANGED,
            Arc::new(move |args| sink.lock().push(args.clone())),
        )
        .await
        .unwrap();

    mutated_root
        .set("Greeting", Value::from("updated"))
        .await
        .unwrap();

    assert!(wait_until(|| !seen.lock().is_empty(), Duration::from_secs(2)).await);
    // Let any stragglers arrive before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        let args = events[0].as_map().unwrap();
        assert_eq!(args.get("property"), Some(&Value::from("Greeting")));
        assert_eq!(args.get("value"), Some(&Value::from("updated")));
    }

    // The watcher's cache was updated before its handlers ran.
    assert_eq!(watched_root.cached("Greeting"), Some(Value::from("updated")));

    // After removal, further mutations deliver nothing.
    watched_root
        .unsubscribe(PROPERTY_CHANGED, handler)
        .await
        .unwrap();
    mutated_root
        .set("Greeting", Value::from("again"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn stats_track_accepted_sessions_and_requests() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());

    let root = client.root().await.unwrap();
    root.invoke("Echo", vec![Value::from("x")]).await.unwrap();
    let _ = root.get("Nonexistent").await;

    let stats = server.stats().snapshot();
    assert_eq!(stats.connections_accepted, 0); // serve_stream bypasses accept
    assert!(stats.requests_received >= 3);
    assert!(stats.requests_failed >= 1);
}

#[tokio::test]
async fn request_times_out_without_a_server() {
    // One half of a pipe with nobody on the other end.
    let (client_io, _server_io) = tokio::io::duplex(1024);
    let client = ClientBuilder::new()
        .timeout(Duration::from_millis(100))
        .from_stream(client_io);

    match client.root().await {
        Err(Error::Timeout) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_the_session_fails_new_requests() {
    let server = server();
    let client = connect(&server, ClientBuilder::new());
    let root = client.root().await.unwrap();

    client.close();
    assert!(client.is_closed());
    match root.get("Greeting").await {
        Err(Error::SessionClosed) => {}
        other => panic!("expected session closed, got {other:?}"),
    }
}
