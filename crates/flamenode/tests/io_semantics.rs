// crates/flamenode/tests/io_semantics.rs
//
// State/stream input semantics and output publishing against a stub
// directory server.

use flamecore::transport::{Endpoint, Publisher, SubscribeMode, Subscriber};
use flamecore::wire::{ping, read_frame, write_frame};
use flamecore::{DirectoryClient, Retention};
use flamenode::{Inputs, Outputs};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;

async fn stub_directory(entries: HashMap<String, String>) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let entries = entries.clone();
            tokio::spawn(async move {
                while let Ok(request) = read_frame(&mut stream).await {
                    let key = request["key"].as_str().unwrap_or_default();
                    let response = match entries.get(key) {
                        Some(value) => json!({"ok": true, "value": value}),
                        None => json!({"ok": true}),
                    };
                    if write_frame(&mut stream, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    ("127.0.0.1".to_string(), port)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn state_and_stream_input_semantics() {
    let state_pub = Publisher::bind(&Endpoint::local(0)).await.unwrap();
    let stream_pub = Publisher::bind(&Endpoint::local(0)).await.unwrap();

    let mut entries = HashMap::new();
    entries.insert(
        "#n".to_string(),
        json!({"s": "#p/out", "q": "#p/out2", "lit": 5}).to_string(),
    );
    entries.insert("#p/out".to_string(), state_pub.endpoint().to_string());
    entries.insert("#p/out2".to_string(), stream_pub.endpoint().to_string());
    let (host, port) = stub_directory(entries).await;
    let directory = DirectoryClient::connect(&host, port).await.unwrap();

    let mut inputs = Inputs::new();
    inputs.state("s", "a state", "");
    inputs.stream("q", "a stream", "");
    inputs.state("lit", "a literal", "");
    inputs.connect(&directory, "n").await.unwrap();
    settle().await;

    // literals resolve without any traffic
    assert_eq!(inputs.get("lit").await.unwrap(), json!(5));

    // state: only the most recent value is visible, reads do not consume
    for i in 1..=3 {
        state_pub.send(&json!(i)).unwrap();
    }
    settle().await;
    assert_eq!(inputs.get("s").await.unwrap(), json!(3));
    assert_eq!(inputs.get("s").await.unwrap(), json!(3));

    // stream: every value is delivered in order, each read consumes one
    for i in 1..=3 {
        stream_pub.send(&json!(i)).unwrap();
    }
    for i in 1..=3 {
        assert_eq!(inputs.get("q").await.unwrap(), json!(i));
    }
    assert_eq!(inputs.try_get("q"), None);

    // a later state update is visible on the next read
    state_pub.send(&json!(9)).unwrap();
    settle().await;
    assert_eq!(inputs.get("s").await.unwrap(), json!(9));
}

#[tokio::test]
async fn first_state_read_blocks_until_a_value_arrives() {
    let publisher = Publisher::bind(&Endpoint::local(0)).await.unwrap();
    let mut entries = HashMap::new();
    entries.insert("#n".to_string(), json!({"s": "#p/out"}).to_string());
    entries.insert("#p/out".to_string(), publisher.endpoint().to_string());
    let (host, port) = stub_directory(entries).await;
    let directory = DirectoryClient::connect(&host, port).await.unwrap();

    let mut inputs = Inputs::new();
    inputs.state("s", "", "");
    inputs.connect(&directory, "n").await.unwrap();
    settle().await;

    let delayed = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        publisher.send(&json!("late")).unwrap();
        // hold the publisher open until the read completes
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let value = tokio::time::timeout(Duration::from_secs(2), inputs.get("s"))
        .await
        .expect("first read should unblock once a value arrives")
        .unwrap();
    assert_eq!(value, json!("late"));
    delayed.await.unwrap();
}

#[tokio::test]
async fn pings_and_flush_behave_like_the_barrier_expects() {
    let publisher = Publisher::bind(&Endpoint::local(0)).await.unwrap();
    let mut entries = HashMap::new();
    entries.insert("#n".to_string(), json!({"q": "#p/out"}).to_string());
    entries.insert("#p/out".to_string(), publisher.endpoint().to_string());
    let (host, port) = stub_directory(entries).await;
    let directory = DirectoryClient::connect(&host, port).await.unwrap();

    let mut inputs = Inputs::new();
    inputs.stream("q", "", "");
    inputs.connect(&directory, "n").await.unwrap();
    settle().await;

    assert!(!inputs.poll_pings());
    publisher.send(&ping()).unwrap();
    settle().await;
    assert!(inputs.poll_pings());

    // leftover pings are dropped by the flush phase
    publisher.send(&ping()).unwrap();
    settle().await;
    inputs.flush();
    assert_eq!(inputs.try_get("q"), None);

    publisher.send(&json!("data")).unwrap();
    settle().await;
    assert_eq!(inputs.get("q").await.unwrap(), json!("data"));
}

#[tokio::test]
async fn outputs_publish_and_retain() {
    // the endpoint the executor would have allocated for #n/x
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::local(probe.local_addr().unwrap().port());
    drop(probe);

    // the runtime table the executor would have created
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("runtimedata.sqlite");
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute("CREATE TABLE \"#n/x\" (time TEXT NOT NULL, value TEXT)", [])
            .unwrap();
    }

    let mut entries = HashMap::new();
    entries.insert("#n/x".to_string(), endpoint.to_string());
    entries.insert("dataserver".to_string(), db_path.display().to_string());
    let (host, port) = stub_directory(entries).await;
    let directory = DirectoryClient::connect(&host, port).await.unwrap();

    let mut outputs = Outputs::new();
    outputs.define("x", "samples", "a.u.", Retention::Runtime);
    outputs.bind(&directory, "n").await.unwrap();

    let mut subscriber = Subscriber::connect(&endpoint, SubscribeMode::Queue)
        .await
        .unwrap();
    settle().await;

    outputs.set("n", "x", &json!(7)).unwrap();
    outputs.set("n", "x", &json!(8)).unwrap();
    assert_eq!(subscriber.recv().await, Some(json!(7)));
    assert_eq!(subscriber.recv().await, Some(json!(8)));

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM \"#n/x\"", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}
