//! walletd: a Bitcoin wallet daemon speaking the bitcoind JSON-RPC dialect.
//!
//! Frontends connect locally and issue wallet requests; anything the wallet
//! does not handle itself is forwarded to the trusted upstream full node.
//! Chain-state notifications from the node flow back through the gateway to
//! the wallet request processor, which reconciles them with locally
//! initiated sends.

pub mod config_models;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod processor;
pub mod registries;
pub mod signer;
pub mod transport;
pub mod upstream;
pub mod wallet;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::info;

use crate::config_models::cli_args::Config;
use crate::models::json_rpc;
use crate::registries::BlockBalanceBarrier;
use crate::registries::NotifiedRecvTxSet;
use crate::registries::SendTxHistorySync;
use crate::upstream::UpstreamClient;
use crate::wallet::AccountManager;
use crate::wallet::AccountManagerLock;

/// Wallet requests admitted but not yet processed. Overflow is an immediate
/// "server busy" reply.
pub const REQUEST_QUEUE_CAPACITY: usize = 100;

const CLIENT_BROADCAST_CAPACITY: usize = 1024;

/// Shared ownership of everything request handlers and notification
/// handlers touch: the exclusive account manager, the upstream client, the
/// coordination registries, and the all-clients push channel.
#[derive(Clone, Debug)]
pub struct App {
    pub cfg: Arc<Config>,
    pub wallet: AccountManagerLock,
    pub upstream: UpstreamClient,
    pub send_sync: SendTxHistorySync,
    pub notified_recv: NotifiedRecvTxSet,
    pub balance_barrier: BlockBalanceBarrier,
    clients: broadcast::Sender<String>,
    reconnect: mpsc::UnboundedSender<()>,
}

impl App {
    /// Assemble the application object and spawn its registry tasks. The
    /// returned receiver fires whenever the upstream connection must be torn
    /// down and re-established.
    pub fn new(
        cfg: Arc<Config>,
        wallet: AccountManagerLock,
        upstream: UpstreamClient,
    ) -> (App, mpsc::UnboundedReceiver<()>) {
        let (reconnect, reconnect_rx) = mpsc::unbounded_channel();
        let app = App {
            cfg,
            wallet,
            upstream,
            send_sync: SendTxHistorySync::spawn(),
            notified_recv: NotifiedRecvTxSet::spawn(),
            balance_barrier: BlockBalanceBarrier::spawn(),
            clients: broadcast::channel(CLIENT_BROADCAST_CAPACITY).0,
            reconnect,
        };
        (app, reconnect_rx)
    }

    /// Push one notification to every connected frontend.
    pub fn notify_all(&self, method: &str, params: Value) {
        // no receivers just means no frontends are connected
        let _ = self.clients.send(json_rpc::encode_notification(method, params));
    }

    /// Subscribe to the all-clients push channel.
    pub fn subscribe_clients(&self) -> broadcast::Receiver<String> {
        self.clients.subscribe()
    }

    /// Tear down the upstream connection: every outstanding request resolves
    /// with an upstream-disconnected error and the transport reconnects.
    pub fn close_upstream(&self) {
        self.upstream.disconnect_all();
        let _ = self.reconnect.send(());
    }
}

/// Wire the channels, spawn the long-running tasks, and serve until ctrl-c.
pub async fn initialize(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);
    info!(network = %cfg.network, "starting walletd");

    let manager = AccountManager::new(cfg.network, cfg.keypool_size, cfg.disallow_free);
    let wallet = AccountManagerLock::new(manager);
    let (upstream, upstream_outbound) = UpstreamClient::new();
    let (app, reconnect_rx) = App::new(cfg.clone(), wallet, upstream);

    let (client_requests_tx, client_requests_rx) = mpsc::unbounded_channel();
    let (upstream_ntfns_tx, upstream_ntfns_rx) = mpsc::unbounded_channel();
    let (request_queue_tx, request_queue_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
    let (handle_ntfn_tx, handle_ntfn_rx) = mpsc::channel(1);

    transport::spawn_upstream_pump(
        app.clone(),
        upstream_outbound,
        upstream_ntfns_tx,
        reconnect_rx,
    );
    transport::spawn_client_listeners(app.clone(), client_requests_tx).await?;

    let gateway = tokio::spawn(gateway::rpc_gateway(
        client_requests_rx,
        upstream_ntfns_rx,
        request_queue_tx,
        handle_ntfn_tx,
        app.upstream.clone(),
    ));
    let processor = tokio::spawn(processor::wallet_request_processor(
        app.clone(),
        request_queue_rx,
        handle_ntfn_rx,
    ));

    signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    gateway.abort();
    processor.abort();
    Ok(())
}
