use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::models::json_rpc;
use crate::models::json_rpc::RpcError;

/// A serialized request envelope bound for the upstream node, tagged with
/// the correlation id the reply will carry.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub id: u64,
    pub body: String,
}

/// Client half of the upstream node connection.
///
/// Every request is assigned a fresh, monotonically allocated correlation id
/// before transmission; replies are routed back through a per-request
/// one-shot. Tearing down the connection resolves every outstanding one-shot
/// with an upstream-disconnected error.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    inner: Arc<UpstreamInner>,
}

#[derive(Debug)]
struct UpstreamInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>,
    outbound: mpsc::UnboundedSender<UpstreamRequest>,
}

impl UpstreamClient {
    /// Create a client and the outbound queue its transport pump drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpstreamRequest>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let client = UpstreamClient {
            inner: Arc::new(UpstreamInner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound,
            }),
        };
        (client, outbound_rx)
    }

    /// Queue a request for transmission and return the reply one-shot.
    pub fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> oneshot::Receiver<Result<Value, RpcError>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json_rpc::encode_request(method, &params, &Value::from(id));
        let (reply_tx, reply_rx) = oneshot::channel();

        self.inner
            .pending
            .lock()
            .expect("pending map lock")
            .insert(id, reply_tx);

        if self.inner.outbound.send(UpstreamRequest { id, body }).is_err() {
            // Transport pump is gone; fail the request right away.
            self.fail(id, RpcError::upstream_disconnected());
        }
        reply_rx
    }

    /// Send a request and await its reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.send_request(method, params)
            .await
            .unwrap_or_else(|_| Err(RpcError::upstream_disconnected()))
    }

    /// Send a request whose reply nobody cares about.
    pub fn notify(&self, method: &str, params: Value) {
        drop(self.send_request(method, params));
    }

    /// Route an upstream reply to its caller. Returns false for ids with no
    /// outstanding request.
    pub fn resolve(&self, id: u64, reply: Result<Value, RpcError>) -> bool {
        let sender = self.inner.pending.lock().expect("pending map lock").remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(reply);
                true
            }
            None => {
                warn!("upstream reply with unknown correlation id {id}");
                false
            }
        }
    }

    fn fail(&self, id: u64, error: RpcError) {
        if let Some(sender) = self.inner.pending.lock().expect("pending map lock").remove(&id) {
            let _ = sender.send(Err(error));
        }
    }

    /// Resolve every outstanding request with an upstream-disconnected
    /// error. Called when the connection is torn down.
    pub fn disconnect_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.inner.pending.lock().expect("pending map lock");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!("failing {} outstanding upstream requests", drained.len());
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(RpcError::upstream_disconnected()));
        }
    }
}
