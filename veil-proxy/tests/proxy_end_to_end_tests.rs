//! End-to-end tests: client requests flow through the proxy, the real
//! timestamp-ordering manager, and the in-memory backing store. Replies are
//! captured by a channel sink in place of the TCP transport.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use veil_proxy::{Proxy, ProxyBuilder, ResponseSink};
use veil_shared::{
    ClientId, ClientRequest, ClientResponse, ResponseKind, Statement, VeilError, VeilResult,
};

struct ChannelSink {
    replies: mpsc::UnboundedSender<(SocketAddr, ClientResponse)>,
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn send(&self, addr: SocketAddr, response: ClientResponse) -> VeilResult<()> {
        self.replies
            .send((addr, response))
            .map_err(|_| VeilError::network("reply channel closed"))
    }
}

struct Cluster {
    proxy: Proxy,
    replies: mpsc::UnboundedReceiver<(SocketAddr, ClientResponse)>,
}

fn cluster() -> Cluster {
    let (reply_tx, replies) = mpsc::unbounded_channel();
    let proxy = ProxyBuilder::new()
        .with_port(19_090)
        .with_response_sink(Arc::new(ChannelSink { replies: reply_tx }))
        .build()
        .unwrap();
    Cluster { proxy, replies }
}

impl Cluster {
    async fn register(&mut self, client_id: ClientId) {
        self.proxy
            .handle_request(ClientRequest::register(
                client_id,
                "127.0.0.1",
                41_000 + client_id as u16,
            ))
            .await
            .unwrap();
        let reply = self.next_reply().await;
        assert_eq!(reply.kind, ResponseKind::Register);
    }

    async fn next_reply(&mut self) -> ClientResponse {
        timeout(Duration::from_secs(2), self.replies.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed")
            .1
    }

    async fn roundtrip(&mut self, request: ClientRequest) -> ClientResponse {
        self.proxy.handle_request(request).await.unwrap();
        self.next_reply().await
    }
}

#[tokio::test]
async fn committed_writes_are_visible_to_later_transactions() {
    let mut c = cluster();
    c.register(1).await;
    c.register(2).await;

    // Client 1 writes and commits in two steps.
    let reply = c
        .roundtrip(
            ClientRequest::start(1).with_statements(vec![Statement::write(7, b"seven".to_vec())]),
        )
        .await;
    assert!(!reply.is_error);

    let reply = c.roundtrip(ClientRequest::new(1).with_commit()).await;
    assert!(!reply.is_error);

    // Client 2 reads the committed value back.
    let reply = c
        .roundtrip(
            ClientRequest::start(2)
                .with_statements(vec![Statement::read(7)])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);
    assert_eq!(reply.read_values, vec![b"seven".to_vec()]);
}

#[tokio::test]
async fn read_of_missing_key_returns_empty_value() {
    let mut c = cluster();
    c.register(1).await;

    let reply = c
        .roundtrip(
            ClientRequest::start(1)
                .with_statements(vec![Statement::read(12345)])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);
    assert_eq!(reply.read_values, vec![Vec::<u8>::new()]);
}

#[tokio::test]
async fn aborted_writer_cascades_to_its_reader() {
    let mut c = cluster();
    c.register(1).await;
    c.register(2).await;

    // Client 1 buffers a dirty write.
    let reply = c
        .roundtrip(
            ClientRequest::start(1).with_statements(vec![Statement::write(5, b"dirty".to_vec())]),
        )
        .await;
    assert!(!reply.is_error);

    // Client 2 reads it uncommitted, picking up a read-from dependency.
    let reply = c
        .roundtrip(ClientRequest::start(2).with_statements(vec![Statement::read(5)]))
        .await;
    assert!(!reply.is_error);
    assert_eq!(reply.read_values, vec![b"dirty".to_vec()]);

    // Client 1 aborts; the manager forces client 2's transaction to roll
    // back while client 2 is idle, so the notification is buffered.
    let reply = c.roundtrip(ClientRequest::abort(1)).await;
    assert!(!reply.is_error, "a user abort is not an error");

    // Client 2's next message carries the forced-abort notification.
    let reply = c
        .roundtrip(ClientRequest::new(2).with_statements(vec![Statement::read(5)]))
        .await;
    assert!(reply.is_error);
    assert!(reply.read_values.is_empty());

    // Both clients remain usable for fresh transactions.
    let reply = c
        .roundtrip(
            ClientRequest::start(2)
                .with_statements(vec![Statement::read(5)])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);
    assert_eq!(
        reply.read_values,
        vec![Vec::<u8>::new()],
        "the dirty write never reached the store"
    );
}

#[tokio::test]
async fn delete_removes_a_committed_key() {
    let mut c = cluster();
    c.register(1).await;

    let reply = c
        .roundtrip(
            ClientRequest::start(1)
                .with_statements(vec![Statement::write(3, b"doomed".to_vec())])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);

    let reply = c
        .roundtrip(
            ClientRequest::start(1)
                .with_statements(vec![Statement::delete(3)])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);

    let reply = c
        .roundtrip(
            ClientRequest::start(1)
                .with_statements(vec![Statement::read(3)])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);
    assert_eq!(reply.read_values, vec![Vec::<u8>::new()]);
}

#[tokio::test]
async fn conflicting_write_aborts_with_an_error() {
    let mut c = cluster();
    c.register(1).await;
    c.register(2).await;

    // The older transaction starts first, then a younger one reads the key.
    let reply = c.roundtrip(ClientRequest::start(1)).await;
    assert!(!reply.is_error);
    let reply = c
        .roundtrip(
            ClientRequest::start(2)
                .with_statements(vec![Statement::read(8)])
                .with_commit(),
        )
        .await;
    assert!(!reply.is_error);

    // The older transaction's write now breaks timestamp order and the
    // automatic abort reports an error.
    let reply = c
        .roundtrip(
            ClientRequest::new(1)
                .with_statements(vec![Statement::write(8, b"late".to_vec())])
                .with_commit(),
        )
        .await;
    assert!(reply.is_error);
    assert!(reply.read_values.is_empty());
}
