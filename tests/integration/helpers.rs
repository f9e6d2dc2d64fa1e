//! Test helpers and utilities for integration tests

use std::sync::Arc;
use std::time::Duration;

use metricbus::transport::channel::channel_pair;
use metricbus::transport::{MessageSocket, SocketRef};
use metricbus::{AgentId, Envelope, RouteKey};

/// Build a socket pair as shared refs: (bus side, peer side).
pub fn socket_pair(name: &str, capacity: usize) -> (SocketRef, SocketRef) {
    let (near, far) = channel_pair(name, capacity);
    (Arc::new(near), Arc::new(far))
}

/// Create a test envelope with recognizable metadata.
pub fn envelope(to: &str, from: &str, sequence: u64) -> Envelope {
    Envelope {
        to: RouteKey::from(to),
        from: AgentId::from(from),
        ack: false,
        sequence,
        timestamp: 1_700_000_000_000_000 + sequence,
        payload: format!("{{\"seq\":{sequence}}}").into_bytes(),
    }
}

/// Poll a socket until an envelope arrives, or panic after the timeout.
pub async fn recv_with_timeout(socket: &SocketRef, timeout: Duration) -> Envelope {
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(envelope) = socket.try_recv().unwrap() {
                break envelope;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no envelope arrived in time")
}

/// Assert that nothing arrives on the socket within the window.
pub async fn expect_quiet(socket: &SocketRef, window: Duration) {
    tokio::time::sleep(window).await;
    assert!(
        socket.try_recv().unwrap().is_none(),
        "socket {} should have stayed quiet",
        socket.name()
    );
}
