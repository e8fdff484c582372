// End-to-end: axum hub on an ephemeral port, real WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use tickhub::api;
use tickhub::app_state::AppState;
use tickhub::client::{ClientConfig, ConnectionManager, ConnectionStatus, TungsteniteConnector};
use tickhub::feed::Delivery;
use tickhub::hub::protocol::{ServerFrame, ServerMessage};
use tickhub::runtime_config::RuntimeConfig;
use tickhub::types::{
    BroadcastEnvelope, ChannelKey, DataKind, MarketEnvelope, MarketPayload, TickerData, UpdateType,
};

async fn start_hub() -> (Arc<AppState>, String) {
    let state = Arc::new(AppState::new(RuntimeConfig::default()).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("ws://{addr}/ws"))
}

fn ticker(symbol: &str, price: f64) -> MarketEnvelope {
    MarketEnvelope {
        symbol: symbol.to_string(),
        interval: None,
        payload: MarketPayload::Ticker(TickerData {
            price,
            price_change: 0.0,
            price_change_percent: 0.0,
            high: price,
            low: price,
            volume: 1.0,
            quote_volume: price,
        }),
        timestamp: 1_700_000_000_000,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn subscriber_receives_significant_updates_only() {
    let (state, url) = start_hub().await;
    let channel = ChannelKey::new(DataKind::Ticker, "BTCUSDT", None).unwrap();

    let (handle, _task) = ConnectionManager::spawn(ClientConfig::new(url), TungsteniteConnector);
    assert_eq!(handle.connect().await.unwrap(), ConnectionStatus::Open);

    let (tx, mut rx) = mpsc::unbounded_channel::<BroadcastEnvelope>();
    handle
        .subscribe(channel.clone(), move |env: &BroadcastEnvelope| {
            let _ = tx.send(env.clone());
        })
        .await
        .unwrap();

    let hub = state.hub.clone();
    let ch = channel.clone();
    wait_until(move || hub.subscriber_count(&ch) == 1).await;

    let first = state.pipeline.process(&ticker("BTCUSDT", 100.0)).await.unwrap();
    assert_eq!(first, Delivery::Broadcast(1));
    // 0.05% move is below the default 0.1% threshold.
    let small = state.pipeline.process(&ticker("BTCUSDT", 100.05)).await.unwrap();
    assert_eq!(small, Delivery::Suppressed);
    let big = state.pipeline.process(&ticker("BTCUSDT", 101.0)).await.unwrap();
    assert_eq!(big, Delivery::Broadcast(1));

    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.kind, UpdateType::TickerUpdate);
    assert_eq!(got.symbol, "BTCUSDT");
    assert_eq!(got.data["price"], 100.0);

    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.data["price"], 101.0);
    assert!(rx.try_recv().is_err());

    handle.close().await.unwrap();
    let hub = state.hub.clone();
    wait_until(move || hub.stats().connections == 0).await;
}

#[tokio::test]
async fn malformed_frame_keeps_the_socket_open() {
    let (state, url) = start_hub().await;
    let (mut ws, _) = connect_async(&url).await.unwrap();

    let next_text = |msg: Option<Result<Message, _>>| match msg {
        Some(Ok(Message::Text(text))) => text,
        other => panic!("expected text frame, got {other:?}"),
    };

    let welcome = ServerMessage::parse(&next_text(ws.next().await)).unwrap();
    assert!(matches!(
        welcome,
        ServerMessage::Control(ServerFrame::Welcome { .. })
    ));

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let reply = ServerMessage::parse(&next_text(ws.next().await)).unwrap();
    assert!(matches!(reply, ServerMessage::Control(ServerFrame::Error { .. })));

    ws.send(Message::Text(r#"{"method":"PING","id":9}"#.into()))
        .await
        .unwrap();
    let reply = ServerMessage::parse(&next_text(ws.next().await)).unwrap();
    assert!(matches!(
        reply,
        ServerMessage::Control(ServerFrame::Pong { id: Some(9), .. })
    ));

    ws.send(Message::Text(
        r#"{"method":"SUBSCRIBE","params":["ticker:BTCUSDT","bogus:X"],"id":10}"#.into(),
    ))
    .await
    .unwrap();
    let reply = ServerMessage::parse(&next_text(ws.next().await)).unwrap();
    match reply {
        ServerMessage::Ack(ack) => {
            assert!(!ack.is_success());
            assert_eq!(ack.id, Some(10));
        }
        other => panic!("expected ack, got {other:?}"),
    }
    assert_eq!(state.hub.stats().subscriptions, 0);
}

#[tokio::test]
async fn evicted_socket_is_closed_by_the_hub() {
    let (state, url) = start_hub().await;
    let (mut ws, _) = connect_async(&url).await.unwrap();

    let id = match ws.next().await {
        Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text).unwrap() {
            ServerMessage::Control(ServerFrame::Welcome { connection_id, .. }) => connection_id,
            other => panic!("expected welcome, got {other:?}"),
        },
        other => panic!("expected text frame, got {other:?}"),
    };
    let hub = state.hub.clone();
    wait_until(move || hub.stats().open_connections == 1).await;

    state.hub.evict(id);

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "socket still open after eviction");
    assert_eq!(state.hub.stats().connections, 0);
    assert_eq!(state.hub.stats().evictions, 1);
}
