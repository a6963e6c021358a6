//! Integration tests for bridge dispatch, chunking and the TCP server

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use worker_watchdog::{
    AccessKey, BridgeCommandType, BridgeDispatcher, BridgeHandler, BridgeRequest, BridgeResponse,
    BridgeServer, ChatMessage, ChunkedPayload,
};

/// Handler that records every request and echoes the port back
#[derive(Default)]
struct RecordingHandler {
    requests: Mutex<Vec<BridgeRequest>>,
}

impl RecordingHandler {
    fn received(&self) -> Vec<BridgeRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl BridgeHandler for RecordingHandler {
    async fn handle_bridge_request(
        &self,
        request: BridgeRequest,
        _cancel: &CancellationToken,
    ) -> Option<BridgeResponse> {
        let port = request.port;
        self.requests.lock().push(request);
        Some(match port {
            Some(port) => BridgeResponse::port(port),
            None => BridgeResponse::success(),
        })
    }
}

fn as_handler(handler: &Arc<RecordingHandler>) -> Weak<dyn BridgeHandler> {
    let handler: Arc<dyn BridgeHandler> = handler.clone();
    Arc::downgrade(&handler)
}

fn long_chat(key: &AccessKey) -> BridgeRequest {
    BridgeRequest::chat(ChatMessage {
        text: "ünïcödé ".repeat(40),
        channel_ids: vec![1, 2],
    })
    .with_access(key.clone())
}

#[tokio::test]
async fn test_unknown_key_is_not_answered() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let _registration = dispatcher.register(AccessKey::new("known"), as_handler(&handler));
    let cancel = CancellationToken::new();

    let request = BridgeRequest::new(BridgeCommandType::Prime).with_access(AccessKey::new("forged"));
    assert!(dispatcher.process_bridge_request(request, &cancel).await.is_none());

    let anonymous = BridgeRequest::new(BridgeCommandType::Prime);
    assert!(dispatcher.process_bridge_request(anonymous, &cancel).await.is_none());
    assert!(handler.received().is_empty());
}

#[tokio::test]
async fn test_dropped_registration_unroutes_key() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let cancel = CancellationToken::new();

    let registration = dispatcher.register(key.clone(), as_handler(&handler));
    assert!(dispatcher.is_registered(&key));
    drop(registration);
    assert!(!dispatcher.is_registered(&key));
    assert!(dispatcher.is_empty());

    let request = BridgeRequest::new(BridgeCommandType::Prime).with_access(key);
    assert!(dispatcher.process_bridge_request(request, &cancel).await.is_none());
}

#[tokio::test]
async fn test_dead_handler_is_not_called() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    drop(handler);

    let request = BridgeRequest::new(BridgeCommandType::Prime).with_access(key.clone());
    assert!(
        dispatcher
            .process_bridge_request(request, &CancellationToken::new())
            .await
            .is_none()
    );
    assert!(!dispatcher.is_registered(&key));
}

#[tokio::test]
async fn test_cancelled_dispatch_is_dropped() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let request = BridgeRequest::new(BridgeCommandType::Prime).with_access(key);
    assert!(dispatcher.process_bridge_request(request, &cancel).await.is_none());
    assert!(handler.received().is_empty());
}

#[tokio::test]
async fn test_malformed_json_gets_error() {
    let dispatcher = BridgeDispatcher::new();
    let response = dispatcher
        .process_raw("{not json", &CancellationToken::new())
        .await
        .unwrap();
    assert!(response.is_error());
}

#[tokio::test]
async fn test_chunks_reassemble_out_of_order() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let logical = long_chat(&key);
    let chunks = logical.into_chunks(9, 64).unwrap();
    let total = chunks.len() as u32;
    assert!(total > 3);

    // Deliver in reverse; each partial answer lists what is still missing
    for (delivered, chunk) in chunks.iter().rev().enumerate() {
        let response = dispatcher
            .process_bridge_request(chunk.clone(), &cancel)
            .await
            .unwrap();
        let remaining = total - 1 - delivered as u32;
        if remaining > 0 {
            let expected: Vec<u32> = (0..remaining).collect();
            assert_eq!(response.missing_chunks, Some(expected));
            assert!(handler.received().is_empty());
        } else {
            assert_eq!(response, BridgeResponse::success());
        }
    }

    let received = handler.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], logical);
}

#[tokio::test]
async fn test_resent_chunk_is_harmless() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let chunks = long_chat(&key).into_chunks(3, 100).unwrap();
    let first = dispatcher.process_bridge_request(chunks[0].clone(), &cancel).await.unwrap();
    let again = dispatcher.process_bridge_request(chunks[0].clone(), &cancel).await.unwrap();
    assert_eq!(first, again);

    for chunk in &chunks[1..] {
        dispatcher.process_bridge_request(chunk.clone(), &cancel).await.unwrap();
    }
    assert_eq!(handler.received().len(), 1);
}

#[tokio::test]
async fn test_conflicting_chunk_discards_payload() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let chunks = long_chat(&key).into_chunks(4, 100).unwrap();
    dispatcher.process_bridge_request(chunks[0].clone(), &cancel).await.unwrap();

    let mut forged = chunks[0].clone();
    if let Some(chunk) = forged.chunk.as_mut() {
        chunk.payload.push('!');
    }
    let response = dispatcher.process_bridge_request(forged, &cancel).await.unwrap();
    assert!(response.is_error());

    // The payload starts over, so the remaining parts cannot complete it
    for chunk in &chunks[1..] {
        let response = dispatcher.process_bridge_request(chunk.clone(), &cancel).await.unwrap();
        assert!(response.missing_chunks.is_some_and(|missing| missing.contains(&0)));
    }
    assert!(handler.received().is_empty());

    // A fresh payload id is unaffected by the discarded one
    let logical = long_chat(&key);
    for chunk in logical.into_chunks(5, 100).unwrap() {
        dispatcher.process_bridge_request(chunk, &cancel).await.unwrap();
    }
    let received = handler.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], logical);
}

/// Delivery orders over `n` parts: forward, reverse, every rotation,
/// evens before odds, and alternating from both ends
fn delivery_orders(n: usize) -> Vec<Vec<usize>> {
    let mut orders = vec![(0..n).collect::<Vec<_>>(), (0..n).rev().collect()];
    for shift in 1..n {
        orders.push((0..n).map(|i| (i + shift) % n).collect());
    }
    orders.push((0..n).step_by(2).chain((1..n).step_by(2)).collect());
    let mut ends = Vec::with_capacity(n);
    let (mut low, mut high) = (0, n - 1);
    while low <= high {
        ends.push(high);
        if low != high {
            ends.push(low);
        }
        low += 1;
        if high == 0 {
            break;
        }
        high -= 1;
    }
    orders.push(ends);
    orders
}

#[tokio::test]
async fn test_chunks_reassemble_in_any_order() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let logical = long_chat(&key);
    let n = logical.into_chunks(0, 64).unwrap().len();
    assert!(n > 3);

    let orders = delivery_orders(n);
    for (index, order) in orders.iter().enumerate() {
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..n).collect::<Vec<_>>());

        let payload_id = 100 + index as u32;
        let chunks = logical.into_chunks(payload_id, 64).unwrap();
        for (delivered, &sequence) in order.iter().enumerate() {
            let response = dispatcher
                .process_bridge_request(chunks[sequence].clone(), &cancel)
                .await
                .unwrap();
            assert!(!response.is_error());
            if delivered + 1 < n {
                assert_eq!(response.missing_chunks.map(|missing| missing.len()), Some(n - 1 - delivered));
                assert_eq!(handler.received().len(), index);
            }
        }

        let received = handler.received();
        assert_eq!(received.len(), index + 1, "order {order:?} did not dispatch exactly once");
        assert_eq!(received[index], logical);
        assert_eq!(
            serde_json::to_string(&received[index]).unwrap(),
            serde_json::to_string(&logical).unwrap()
        );
    }
}

#[tokio::test]
async fn test_startup_split_in_two_chunks() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let part = |sequence_id: u32, payload: &str| {
        BridgeRequest::chunk(ChunkedPayload {
            payload_id: 7,
            total_chunks: 2,
            sequence_id,
            payload: payload.to_string(),
        })
        .with_access(key.clone())
    };

    let first = dispatcher
        .process_bridge_request(part(0, "{\"commandType\":"), &cancel)
        .await
        .unwrap();
    assert_eq!(first.missing_chunks, Some(vec![1]));
    assert!(handler.received().is_empty());

    dispatcher
        .process_bridge_request(part(1, "\"Startup\"}"), &cancel)
        .await
        .unwrap();
    let received = handler.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], BridgeRequest::new(BridgeCommandType::Startup).with_access(key));
}

#[tokio::test]
async fn test_chunked_request_inherits_outer_key() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let logical = BridgeRequest::port_update(4242);
    let chunks = logical.into_chunks(1, 10).unwrap();
    let mut last = None;
    for chunk in chunks {
        last = dispatcher
            .process_bridge_request(chunk.with_access(key.clone()), &cancel)
            .await;
    }

    assert_eq!(last, Some(BridgeResponse::port(4242)));
    assert_eq!(handler.received()[0].access_identifier, Some(key));
}

#[tokio::test]
async fn test_nested_chunk_is_rejected() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    let inner = BridgeRequest::chunk(ChunkedPayload {
        payload_id: 1,
        total_chunks: 1,
        sequence_id: 0,
        payload: "{}".to_string(),
    });
    let outer = inner.with_access(key.clone()).into_chunks(2, 1024).unwrap();
    assert_eq!(outer.len(), 1);

    let response = dispatcher
        .process_bridge_request(outer[0].clone(), &cancel)
        .await
        .unwrap();
    assert!(response.is_error());
    assert!(handler.received().is_empty());
}

#[tokio::test]
async fn test_chunks_are_scoped_per_key() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let alice = AccessKey::generate();
    let bob = AccessKey::generate();
    let _a = dispatcher.register(alice.clone(), as_handler(&handler));
    let _b = dispatcher.register(bob.clone(), as_handler(&handler));
    let cancel = CancellationToken::new();

    // Same payload id from two workers must not mix
    let from_alice = long_chat(&alice).into_chunks(5, 100).unwrap();
    let from_bob = long_chat(&bob).into_chunks(5, 100).unwrap();
    dispatcher.process_bridge_request(from_alice[0].clone(), &cancel).await.unwrap();
    for chunk in &from_bob[1..] {
        dispatcher.process_bridge_request(chunk.clone(), &cancel).await.unwrap();
    }
    assert!(handler.received().is_empty());

    for chunk in &from_alice[1..] {
        dispatcher.process_bridge_request(chunk.clone(), &cancel).await.unwrap();
    }
    let received = handler.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].access_identifier, Some(alice));
}

// ============================================================================
// TCP server
// ============================================================================

async fn start_server(
    dispatcher: BridgeDispatcher,
    max_payload: usize,
) -> (u16, CancellationToken) {
    let listener = BridgeServer::bind(0).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server = BridgeServer::new(dispatcher, max_payload);
    tokio::spawn(server.serve(listener, cancel.clone()));
    (port, cancel)
}

async fn connect(port: u16) -> Framed<TcpStream, LinesCodec> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    Framed::new(stream, LinesCodec::new())
}

async fn roundtrip(framed: &mut Framed<TcpStream, LinesCodec>, request: &BridgeRequest) -> Option<BridgeResponse> {
    framed.send(serde_json::to_string(request).unwrap()).await.unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap()?
        .unwrap();
    Some(serde_json::from_str(&line).unwrap())
}

#[tokio::test]
async fn test_server_answers_registered_worker() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let (port, cancel) = start_server(dispatcher, 1024).await;

    let mut framed = connect(port).await;
    let response = roundtrip(&mut framed, &BridgeRequest::port_update(3000).with_access(key.clone()))
        .await
        .unwrap();
    assert_eq!(response.new_port, Some(3000));

    // The connection stays open for further requests
    let response = roundtrip(&mut framed, &BridgeRequest::new(BridgeCommandType::Prime).with_access(key))
        .await
        .unwrap();
    assert_eq!(response, BridgeResponse::success());
    assert_eq!(handler.received().len(), 2);
    cancel.cancel();
}

#[tokio::test]
async fn test_server_rejects_oversized_line() {
    let dispatcher = BridgeDispatcher::new();
    let handler = Arc::new(RecordingHandler::default());
    let key = AccessKey::generate();
    let _registration = dispatcher.register(key.clone(), as_handler(&handler));
    let (port, cancel) = start_server(dispatcher, 512).await;

    let mut framed = connect(port).await;
    let response = roundtrip(&mut framed, &long_chat(&key)).await.unwrap();
    assert!(response.error_message.unwrap().contains("chunks"));

    // Chunked, the same request fits
    let mut last = None;
    for chunk in long_chat(&key).into_chunks(11, 100).unwrap() {
        last = roundtrip(&mut framed, &chunk).await;
    }
    assert_eq!(last, Some(BridgeResponse::success()));
    assert_eq!(handler.received().len(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_server_closes_unroutable_connection() {
    let (port, cancel) = start_server(BridgeDispatcher::new(), 1024).await;

    let mut framed = connect(port).await;
    let request = BridgeRequest::new(BridgeCommandType::Prime).with_access(AccessKey::new("forged"));
    assert!(roundtrip(&mut framed, &request).await.is_none());
    cancel.cancel();
}
