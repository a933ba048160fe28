//! The common entry point for all client RPC requests and upstream
//! notifications.
//!
//! Requests for methods this wallet handles are queued for the wallet
//! request processor, or answered with a pre-encoded "server busy" error
//! when the bounded queue is full. Requests for unknown methods are given a
//! fresh id and forwarded to the upstream node. Notifications are queued
//! without bound and offered to the processor in arrival order; they are
//! never dropped, since losing one would silently desynchronize the wallet.

use std::collections::VecDeque;

use tokio::select;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::channel::ClientRequest;
use crate::models::channel::UpstreamNotification;
use crate::models::commands::classify;
use crate::models::commands::MethodClass;
use crate::models::json_rpc::Reply;
use crate::models::json_rpc::RpcError;
use crate::upstream::UpstreamClient;

pub async fn rpc_gateway(
    mut client_requests: mpsc::UnboundedReceiver<ClientRequest>,
    mut upstream_ntfns: mpsc::UnboundedReceiver<UpstreamNotification>,
    request_queue: mpsc::Sender<ClientRequest>,
    handle_ntfn: mpsc::Sender<UpstreamNotification>,
    upstream: UpstreamClient,
) {
    let mut ntfn_queue: VecDeque<UpstreamNotification> = VecDeque::new();

    loop {
        select! {
            request = client_requests.recv() => {
                let Some(request) = request else { break };
                route_client_request(request, &request_queue, &upstream);
            }

            notification = upstream_ntfns.recv() => {
                let Some(notification) = notification else { break };
                ntfn_queue.push_back(notification);
            }

            // Offer the oldest notification whenever the processor is ready.
            permit = handle_ntfn.reserve(), if !ntfn_queue.is_empty() => {
                match permit {
                    Ok(permit) => {
                        permit.send(ntfn_queue.pop_front().expect("queue is non-empty"));
                    }
                    // processor is gone
                    Err(_) => break,
                }
            }
        }
    }
    debug!("rpc gateway shutting down");
}

fn route_client_request(
    request: ClientRequest,
    request_queue: &mpsc::Sender<ClientRequest>,
    upstream: &UpstreamClient,
) {
    let local = match classify(&request.request.method) {
        MethodClass::Standard => true,
        // websocket extensions over a plain connection go upstream, where
        // they will typically fail
        MethodClass::WsOnly => request.websocket,
        MethodClass::Unknown => false,
    };

    if local {
        match request_queue.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                // too many requests in flight; the reply body is
                // pre-encoded so overload does not cost marshaling
                request.respond(Reply::busy());
            }
            Err(mpsc::error::TrySendError::Closed(request)) => drop(request),
        }
    } else {
        forward_upstream(request, upstream);
    }
}

/// Hand an unknown-method request to the upstream node under a fresh
/// correlation id, and wire the reply back to the client's sink.
fn forward_upstream(request: ClientRequest, upstream: &UpstreamClient) {
    let reply_rx =
        upstream.send_request(&request.request.method, request.request.params.clone());
    tokio::spawn(async move {
        let reply = match reply_rx.await {
            Ok(Ok(result)) => Reply::Result(result),
            Ok(Err(err)) => Reply::Error(err),
            Err(_) => Reply::Error(RpcError::upstream_disconnected()),
        };
        request.respond(reply);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use serde_json::json;

    use crate::models::json_rpc;
    use crate::models::json_rpc::Request;
    use crate::REQUEST_QUEUE_CAPACITY;

    struct GatewayHarness {
        client_tx: mpsc::UnboundedSender<ClientRequest>,
        ntfn_tx: mpsc::UnboundedSender<UpstreamNotification>,
        request_queue_rx: mpsc::Receiver<ClientRequest>,
        handle_ntfn_rx: mpsc::Receiver<UpstreamNotification>,
        upstream_rx: mpsc::UnboundedReceiver<crate::upstream::UpstreamRequest>,
        upstream: UpstreamClient,
    }

    fn spawn_gateway() -> GatewayHarness {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (ntfn_tx, ntfn_rx) = mpsc::unbounded_channel();
        let (request_queue_tx, request_queue_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (handle_ntfn_tx, handle_ntfn_rx) = mpsc::channel(1);
        let (upstream, upstream_rx) = UpstreamClient::new();
        tokio::spawn(rpc_gateway(
            client_rx,
            ntfn_rx,
            request_queue_tx,
            handle_ntfn_tx,
            upstream.clone(),
        ));
        GatewayHarness {
            client_tx,
            ntfn_tx,
            request_queue_rx,
            handle_ntfn_rx,
            upstream_rx,
            upstream,
        }
    }

    fn request(method: &str, id: serde_json::Value, websocket: bool) -> (ClientRequest, tokio::sync::oneshot::Receiver<Reply>) {
        ClientRequest::new(
            Request {
                method: method.to_owned(),
                params: json!([]),
                id,
            },
            websocket,
        )
    }

    #[tokio::test]
    async fn request_101_gets_server_busy() {
        let mut harness = spawn_gateway();

        let mut pending = Vec::new();
        for n in 0..REQUEST_QUEUE_CAPACITY {
            let (cr, rx) = request("getbalance", json!(n), false);
            harness.client_tx.send(cr).unwrap();
            pending.push(rx);
        }
        let (cr, rx) = request("getbalance", json!(42), false);
        harness.client_tx.send(cr).unwrap();

        let reply = rx.await.unwrap();
        assert_eq!(reply, Reply::busy());
        assert_eq!(
            json_rpc::encode_reply(&reply, &json!(42)),
            r#"{"error":{"code":-32000,"message":"Server busy"},"id":42}"#
        );

        // the first hundred are still queued, not answered
        for _ in 0..REQUEST_QUEUE_CAPACITY {
            assert!(harness.request_queue_rx.recv().await.is_some());
        }
        drop(pending);
    }

    #[tokio::test]
    async fn unknown_method_is_forwarded_with_fresh_id() {
        let mut harness = spawn_gateway();

        let (cr, rx) = request("getblockcount", json!("abc"), false);
        harness.client_tx.send(cr).unwrap();

        let forwarded = harness.upstream_rx.recv().await.unwrap();
        let wire: serde_json::Value = serde_json::from_str(&forwarded.body).unwrap();
        assert_eq!(wire["method"], "getblockcount");
        // the client id is replaced on the upstream wire
        assert_ne!(wire["id"], json!("abc"));
        assert_eq!(wire["id"], json!(forwarded.id));

        harness.upstream.resolve(forwarded.id, Ok(json!(123456)));
        let reply = rx.await.unwrap();
        assert_eq!(
            json_rpc::encode_reply(&reply, &json!("abc")),
            r#"{"result":123456,"id":"abc"}"#
        );
    }

    #[tokio::test]
    async fn ws_only_method_over_plain_connection_goes_upstream() {
        let mut harness = spawn_gateway();

        let (cr, _rx) = request("walletislocked", json!(1), false);
        harness.client_tx.send(cr).unwrap();
        assert!(harness.upstream_rx.recv().await.is_some());

        let (cr, _rx2) = request("walletislocked", json!(2), true);
        harness.client_tx.send(cr).unwrap();
        let queued = harness.request_queue_rx.recv().await.unwrap();
        assert_eq!(queued.request.method, "walletislocked");
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_arrival_order() {
        let mut harness = spawn_gateway();

        for height in 0..5 {
            harness
                .ntfn_tx
                .send(UpstreamNotification::BlockConnected {
                    hash: bitcoin::BlockHash::from_byte_array([height as u8; 32]),
                    height,
                })
                .unwrap();
        }
        for height in 0..5 {
            match harness.handle_ntfn_rx.recv().await.unwrap() {
                UpstreamNotification::BlockConnected { height: got, .. } => {
                    assert_eq!(got, height)
                }
                other => panic!("unexpected notification: {other:?}"),
            }
        }
    }
}
