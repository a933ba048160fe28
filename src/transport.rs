//! Line-delimited JSON-RPC plumbing: the frontend listener and the upstream
//! connection pump.
//!
//! Production deployments terminate TLS and WebSocket framing in front of
//! these sockets; this module deliberately stops at newline-delimited
//! envelopes.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use futures::SinkExt;
use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::models::channel::ClientRequest;
use crate::models::channel::UpstreamNotification;
use crate::models::json_rpc;
use crate::models::json_rpc::Reply;
use crate::upstream::UpstreamRequest;
use crate::App;

const UPSTREAM_RECONNECT_DELAY: Duration = Duration::from_secs(5);

type LineFramed = tokio_util::codec::Framed<TcpStream, tokio_util::codec::LinesCodec>;

fn framed(stream: TcpStream) -> LineFramed {
    tokio_util::codec::Framed::new(stream, tokio_util::codec::LinesCodec::new())
}

/// Maintain the connection to the upstream node: drain the outbound request
/// queue, route replies back by correlation id, and feed notifications into
/// the gateway. A torn-down connection fails every outstanding request and
/// reconnects with a delay.
pub fn spawn_upstream_pump(
    app: App,
    mut outbound: mpsc::UnboundedReceiver<UpstreamRequest>,
    ntfns: mpsc::UnboundedSender<UpstreamNotification>,
    mut reconnect: mpsc::UnboundedReceiver<()>,
) {
    tokio::spawn(async move {
        loop {
            let stream = match TcpStream::connect(&app.cfg.rpcconnect).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("cannot connect to upstream node {}: {err}", app.cfg.rpcconnect);
                    time::sleep(UPSTREAM_RECONNECT_DELAY).await;
                    continue;
                }
            };
            info!("connected to upstream node {}", app.cfg.rpcconnect);
            let mut framed = framed(stream);

            loop {
                select! {
                    request = outbound.recv() => {
                        let Some(request) = request else { return };
                        if framed.send(request.body).await.is_err() {
                            break;
                        }
                    }
                    line = framed.next() => {
                        match line {
                            Some(Ok(line)) => handle_upstream_line(&app, &ntfns, &line),
                            _ => break,
                        }
                    }
                    signal = reconnect.recv() => {
                        if signal.is_none() {
                            return;
                        }
                        info!("restarting upstream connection");
                        break;
                    }
                }
            }

            app.upstream.disconnect_all();
            time::sleep(UPSTREAM_RECONNECT_DELAY).await;
        }
    });
}

fn handle_upstream_line(
    app: &App,
    ntfns: &mpsc::UnboundedSender<UpstreamNotification>,
    line: &str,
) {
    let Ok(request) = json_rpc::decode(line.as_bytes()) else {
        warn!("discarding malformed upstream frame");
        return;
    };

    if request.is_notification() && !request.method.is_empty() {
        // unknown notification methods are silently dropped
        if let Some(notification) = UpstreamNotification::from_request(&request) {
            let _ = ntfns.send(notification);
        }
        return;
    }

    // a reply: route by correlation id
    let Ok(envelope) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let Some(id) = envelope.get("id").and_then(Value::as_u64) else {
        warn!("upstream reply without a numeric id");
        return;
    };
    let reply = match envelope.get("error") {
        Some(error) if !error.is_null() => {
            Err(serde_json::from_value(error.clone()).unwrap_or_else(|_| {
                json_rpc::RpcError::internal("malformed upstream error object")
            }))
        }
        _ => Ok(envelope.get("result").cloned().unwrap_or(Value::Null)),
    };
    app.upstream.resolve(id, reply);
}

/// Bind every configured listener and serve frontend connections.
pub async fn spawn_client_listeners(
    app: App,
    client_requests: mpsc::UnboundedSender<ClientRequest>,
) -> Result<()> {
    for addr in &app.cfg.rpclisten {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {addr}"))?;
        info!("RPC server listening on {addr}");

        let app = app.clone();
        let client_requests = client_requests.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let app = app.clone();
                        let client_requests = client_requests.clone();
                        tokio::spawn(async move {
                            serve_client(app, stream, peer, client_requests).await;
                        });
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
        });
    }
    Ok(())
}

async fn serve_client(
    app: App,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    client_requests: mpsc::UnboundedSender<ClientRequest>,
) {
    debug!("frontend connected from {peer}");
    let mut framed = framed(stream);
    let mut pushes = app.subscribe_clients();
    // the connection owns its outbound byte channel
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<String>();

    loop {
        select! {
            line = framed.next() => {
                let Some(Ok(line)) = line else { break };
                match json_rpc::decode(line.as_bytes()) {
                    Ok(request) => {
                        let id = request.id.clone();
                        let (client_request, reply_rx) = ClientRequest::new(request, false);
                        if client_requests.send(client_request).is_err() {
                            break;
                        }
                        let replies_tx = replies_tx.clone();
                        tokio::spawn(async move {
                            // a binding dropped without a reply means the
                            // server shed the request
                            let reply = reply_rx.await.unwrap_or_else(|_| Reply::busy());
                            let _ = replies_tx.send(json_rpc::encode_reply(&reply, &id));
                        });
                    }
                    Err(err) => {
                        let _ = replies_tx
                            .send(json_rpc::encode_reply(&Reply::Error(err), &Value::Null));
                    }
                }
            }
            reply = replies_rx.recv() => {
                let Some(reply) = reply else { break };
                if framed.send(reply).await.is_err() {
                    break;
                }
            }
            push = pushes.recv() => {
                match push {
                    Ok(line) => {
                        if framed.send(line).await.is_err() {
                            break;
                        }
                    }
                    // skipped notifications after lagging behind
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("frontend {peer} lagged {n} notifications");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("frontend {peer} disconnected");
}
