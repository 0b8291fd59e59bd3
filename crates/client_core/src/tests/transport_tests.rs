use std::sync::Arc;

use super::*;
use crate::{
    connection::{Connection, ConnectionEvent},
    testutil::next_matching,
};
use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use shared::Envelope;
use tokio::net::TcpListener;

async fn echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(_) | WsMessage::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, Router::new().route("/ws", get(echo)))
            .await
            .expect("serve");
    });
    format!("http://{addr}/ws")
}

#[test]
fn http_schemes_map_to_websocket_schemes() {
    assert_eq!(
        websocket_url("http://127.0.0.1:6666/chat").expect("url").as_str(),
        "ws://127.0.0.1:6666/chat"
    );
    assert_eq!(
        websocket_url("https://chat.example.com/ws").expect("url").as_str(),
        "wss://chat.example.com/ws"
    );
    assert_eq!(
        websocket_url(" ws://127.0.0.1:6666 ").expect("url").as_str(),
        "ws://127.0.0.1:6666/"
    );
}

#[test]
fn unsupported_addresses_are_rejected() {
    assert!(matches!(
        websocket_url("ftp://chat.example.com"),
        Err(TransportError::InvalidAddress { .. })
    ));
    assert!(matches!(
        websocket_url("not a url"),
        Err(TransportError::InvalidAddress { .. })
    ));
}

#[tokio::test]
async fn refused_tcp_connect_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let result = WebSocketConnector.open(&format!("ws://{addr}/ws")).await;
    assert!(matches!(result, Err(TransportError::Connect { .. })));
}

#[tokio::test]
async fn connection_round_trips_over_a_real_websocket() {
    let address = spawn_echo_server().await;
    let connection = Connection::new(Arc::new(WebSocketConnector));
    let mut events = connection.subscribe();
    connection.connect(address);

    next_matching(&mut events, |event| {
        matches!(event, ConnectionEvent::Connected).then_some(())
    })
    .await;

    let envelope = Envelope::typed("im.message").with("content", "echo me");
    connection.send(&envelope).expect("send");
    let echoed = next_matching(&mut events, |event| match event {
        ConnectionEvent::MessageReceived(envelope) => Some(envelope.clone()),
        _ => None,
    })
    .await;
    assert_eq!(echoed, envelope);

    connection.send_raw(vec![1, 2, 3]).expect("send raw");
    let raw = next_matching(&mut events, |event| match event {
        ConnectionEvent::RawDataReceived(bytes) => Some(bytes.clone()),
        _ => None,
    })
    .await;
    assert_eq!(raw, vec![1, 2, 3]);

    connection.disconnect();
    assert!(!connection.is_connected());
}
