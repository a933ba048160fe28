//! The wallet request processor: a single task that, per iteration, handles
//! either one client request or one upstream notification.
//!
//! Request handlers turn every failure into a JSON-RPC error envelope.
//! Notification handlers are different: individual failures must not stall
//! chain-state processing, so every error is logged and swallowed — except
//! the store-inconsistency sentinel, which is treated as evidence of dropped
//! or reordered upstream notifications and answered by reconnecting and
//! reloading accounts from their last known good state.

use tokio::select;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::handlers;
use crate::models::channel::ClientRequest;
use crate::models::channel::UpstreamNotification;
use crate::models::commands::WalletCommand;
use crate::models::json_rpc::Reply;
use crate::notifications;
use crate::wallet::txstore::TxStoreError;
use crate::wallet::WalletError;
use crate::App;

pub async fn wallet_request_processor(
    app: App,
    mut request_queue: mpsc::Receiver<ClientRequest>,
    mut handle_ntfn: mpsc::Receiver<UpstreamNotification>,
) {
    loop {
        select! {
            request = request_queue.recv() => {
                let Some(request) = request else { break };
                handle_request(&app, request).await;
            }
            notification = handle_ntfn.recv() => {
                let Some(notification) = notification else { break };
                handle_notification(&app, notification).await;
            }
        }
    }
    debug!("wallet request processor shutting down");
}

async fn handle_request(app: &App, request: ClientRequest) {
    let params = match request.request.params_array() {
        Ok(params) => params.to_vec(),
        Err(err) => {
            request.respond(Reply::Error(err));
            return;
        }
    };
    let command =
        match WalletCommand::parse(&request.request.method, &params, request.websocket) {
            Ok(command) => command,
            Err(err) => {
                request.respond(Reply::Error(err));
                return;
            }
        };

    let reply = match handlers::dispatch(app, command).await {
        Ok(result) => Reply::Result(result),
        Err(err) => Reply::Error(err),
    };
    request.respond(reply);
}

async fn handle_notification(app: &App, notification: UpstreamNotification) {
    match notifications::handle_notification(app, notification).await {
        Ok(()) => {}
        Err(WalletError::Store(TxStoreError::Inconsistent)) => {
            // Assume the upstream node reordered or dropped notifications.
            // Restart the connection and reload accounts from their last
            // known good state.
            warn!("reconnecting to recover from out-of-order upstream notification");
            app.close_upstream();
            let mut manager = app.wallet.lock_guard().await;
            manager.open_accounts();
        }
        Err(err) => warn!("{err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::Amount;
    use bitcoin::BlockHash;
    use bitcoin::Transaction;
    use bitcoin::TxOut;
    use serde_json::json;
    use serde_json::Value;
    use tracing_test::traced_test;

    use crate::config_models::cli_args::Config;
    use crate::config_models::network::Network;
    use crate::gateway;
    use crate::models::channel::BlockDetails;
    use crate::models::json_rpc::Request;
    use crate::models::json_rpc::RpcError;
    use crate::upstream::UpstreamClient;
    use crate::wallet::AccountManager;
    use crate::wallet::AccountManagerLock;
    use crate::REQUEST_QUEUE_CAPACITY;

    struct Pipeline {
        app: App,
        client_tx: mpsc::UnboundedSender<ClientRequest>,
        _ntfn_tx: mpsc::UnboundedSender<UpstreamNotification>,
        /// hex of the last transaction handed to sendrawtransaction
        broadcast: Arc<Mutex<Option<String>>>,
        /// when set, the mock node rejects broadcasts
        fail_broadcast: Arc<std::sync::atomic::AtomicBool>,
    }

    /// Gateway and processor wired together, with an upstream auto-responder
    /// standing in for the node.
    fn spawn_pipeline() -> Pipeline {
        let manager = AccountManager::new(Network::Testnet3, 4, false);
        let (upstream, mut outbound_rx) = UpstreamClient::new();
        let (app, _reconnect_rx) = App::new(
            Arc::new(Config::for_tests()),
            AccountManagerLock::new(manager),
            upstream.clone(),
        );

        let broadcast = Arc::new(Mutex::new(None));
        let fail_broadcast = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_broadcast = broadcast.clone();
        let reject_broadcast = fail_broadcast.clone();
        let responder_client = upstream.clone();
        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let wire: Value = serde_json::from_str(&request.body).unwrap();
                let reply = match wire["method"].as_str().unwrap_or_default() {
                    "sendrawtransaction" => {
                        if reject_broadcast.load(std::sync::atomic::Ordering::SeqCst) {
                            responder_client
                                .resolve(request.id, Err(RpcError::new(-22, "TX rejected")));
                            continue;
                        }
                        let hex = wire["params"][0].as_str().unwrap_or_default().to_owned();
                        *seen_broadcast.lock().unwrap() = Some(hex.clone());
                        Ok(json!(hex))
                    }
                    "getblockhash" => Ok(json!(BlockHash::all_zeros().to_string())),
                    "getinfo" => Ok(json!({"blocks": 100, "connections": 8})),
                    _ => Ok(Value::Null),
                };
                responder_client.resolve(request.id, reply);
            }
        });

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (ntfn_tx, ntfn_rx) = mpsc::unbounded_channel::<UpstreamNotification>();
        let (request_queue_tx, request_queue_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (handle_ntfn_tx, handle_ntfn_rx) = mpsc::channel(1);

        tokio::spawn(gateway::rpc_gateway(
            client_rx,
            ntfn_rx,
            request_queue_tx,
            handle_ntfn_tx,
            upstream,
        ));
        tokio::spawn(wallet_request_processor(
            app.clone(),
            request_queue_rx,
            handle_ntfn_rx,
        ));

        Pipeline {
            app,
            client_tx,
            _ntfn_tx: ntfn_tx,
            broadcast,
            fail_broadcast,
        }
    }

    impl Pipeline {
        async fn call_ws(&self, method: &str, params: Value, websocket: bool) -> Reply {
            let (request, rx) = ClientRequest::new(
                Request {
                    method: method.to_owned(),
                    params,
                    id: json!(1),
                },
                websocket,
            );
            self.client_tx.send(request).unwrap();
            rx.await.unwrap()
        }

        async fn call(&self, method: &str, params: Value) -> Reply {
            self.call_ws(method, params, false).await
        }

        async fn result(&self, method: &str, params: Value) -> Value {
            match self.call(method, params).await {
                Reply::Result(value) => value,
                other => panic!("expected a result, got {other:?}"),
            }
        }

        async fn rpc_error(&self, method: &str, params: Value) -> RpcError {
            match self.call(method, params).await {
                Reply::Error(err) => err,
                other => panic!("expected an error, got {other:?}"),
            }
        }

        /// Create, unlock, and fund the default account with one mature coin.
        async fn fund_default_account(&self) -> Transaction {
            self.result("createencryptedwallet", json!(["pw"])).await;
            self.result("walletpassphrase", json!(["pw", 3600])).await;

            let mut manager = self.app.wallet.lock_guard().await;
            manager.set_cur_block(100, BlockHash::all_zeros());
            let address = manager.account_mut("").unwrap().new_address().unwrap();
            let coinbase = Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: vec![],
                output: vec![TxOut {
                    value: Amount::from_btc(2.0).unwrap(),
                    script_pubkey: address.script_pubkey(),
                }],
            };
            manager
                .account_mut("")
                .unwrap()
                .store
                .insert_credit(&coinbase, 0, false, Some((50, BlockHash::all_zeros())))
                .unwrap();
            manager.flush_all().unwrap();
            coinbase
        }
    }

    fn dest_address() -> String {
        let mut other = crate::wallet::account::Account::new("x", Network::Testnet3, 1);
        other.new_address().unwrap().to_string()
    }

    #[tokio::test]
    async fn unimplemented_and_unsupported_methods_reply_fixed_errors() {
        let pipeline = spawn_pipeline();
        assert_eq!(
            pipeline.rpc_error("backupwallet", json!([])).await.code,
            crate::models::json_rpc::ERR_METHOD_NOT_FOUND
        );
        let err = pipeline.rpc_error("encryptwallet", json!(["pw"])).await;
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "Request unsupported by walletd");
    }

    #[tokio::test]
    async fn getinfo_merges_wallet_fields_into_upstream_reply() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        let info = pipeline.result("getinfo", json!([])).await;
        assert_eq!(info["blocks"], 100);
        assert_eq!(info["balance"], 2.0);
        assert_eq!(info["keypoolsize"], 5);
    }

    #[tokio::test]
    async fn send_records_history_before_receive_notifications() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        let mut clients = pipeline.app.subscribe_clients();

        let txid = pipeline
            .result("sendtoaddress", json!([dest_address(), 0.5]))
            .await;
        let txid = txid.as_str().unwrap().to_owned();

        // client-visible sequence: the newtx for the send, then both
        // balance notifications
        let first = clients.recv().await.unwrap();
        assert!(first.contains("newtx"), "got {first}");
        assert!(first.contains(&txid));
        let second = clients.recv().await.unwrap();
        assert!(second.contains("accountbalance"));
        let third = clients.recv().await.unwrap();
        assert!(third.contains("accountbalance"));

        // a later mempool recv notification for the change output of this
        // tx is suppressed: the send path already recorded that credit
        let hex = pipeline.broadcast.lock().unwrap().clone().unwrap();
        handle_notification(
            &pipeline.app,
            UpstreamNotification::RecvTx {
                hex_tx: hex,
                block: None,
            },
        )
        .await;
        assert!(clients.try_recv().is_err(), "duplicate credit was announced");
    }

    #[tokio::test]
    async fn broadcast_failure_rolls_back_and_returns_the_upstream_error() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        let before = pipeline.result("getbalance", json!(["", 0])).await;

        pipeline
            .fail_broadcast
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = pipeline
            .rpc_error("sendtoaddress", json!([dest_address(), 0.5]))
            .await;
        // the upstream error is returned verbatim
        assert_eq!(err, RpcError::new(-22, "TX rejected"));

        // nothing was recorded and the send-sync entry was removed, so a
        // retry goes through cleanly
        let after = pipeline.result("getbalance", json!(["", 0])).await;
        assert_eq!(before, after);
        pipeline
            .fail_broadcast
            .store(false, std::sync::atomic::Ordering::SeqCst);
        pipeline
            .result("sendtoaddress", json!([dest_address(), 0.5]))
            .await;
    }

    #[tokio::test]
    async fn change_flush_failure_aborts_the_send() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        {
            let mut manager = pipeline.app.wallet.lock_guard().await;
            manager.fail_flushes = true;
        }

        let err = pipeline
            .rpc_error("sendtoaddress", json!([dest_address(), 0.5]))
            .await;
        assert_eq!(err.code, crate::models::json_rpc::ERR_WALLET);
        // the broadcast was never attempted
        assert!(pipeline.broadcast.lock().unwrap().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn store_inconsistency_triggers_account_reload() {
        let pipeline = spawn_pipeline();
        let coin = pipeline.fund_default_account().await;
        let hex = bitcoin::consensus::encode::serialize_hex(&coin);

        // an unflushed mutation that the reload must discard
        {
            let mut manager = pipeline.app.wallet.lock_guard().await;
            let extra = Transaction {
                version: Version::ONE,
                lock_time: LockTime::ZERO,
                input: vec![],
                output: vec![TxOut {
                    value: Amount::from_btc(1.0).unwrap(),
                    script_pubkey: coin.output[0].script_pubkey.clone(),
                }],
            };
            manager
                .account_mut("")
                .unwrap()
                .store
                .insert_credit(&extra, 0, false, None)
                .unwrap();
        }
        assert_eq!(
            pipeline.result("getbalance", json!(["", 0])).await,
            json!(3.0)
        );

        // a conflicting confirmation height for an already-confirmed record
        handle_notification(
            &pipeline.app,
            UpstreamNotification::RecvTx {
                hex_tx: hex,
                block: Some(BlockDetails {
                    hash: BlockHash::from_byte_array([9; 32]),
                    height: 77,
                }),
            },
        )
        .await;

        // accounts were reloaded from their last persisted state and the
        // pipeline keeps serving requests
        assert_eq!(
            pipeline.result("getbalance", json!(["", 0])).await,
            json!(2.0)
        );
        assert_eq!(
            pipeline.call_ws("walletislocked", json!([]), true).await,
            Reply::Result(json!(false))
        );
        assert!(logs_contain(
            "reconnecting to recover from out-of-order upstream notification"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn passphrase_timeout_relocks_the_wallet() {
        let pipeline = spawn_pipeline();
        pipeline.result("createencryptedwallet", json!(["pw"])).await;

        pipeline.result("walletpassphrase", json!(["pw", 2])).await;
        assert_eq!(
            pipeline.call_ws("walletislocked", json!([]), true).await,
            Reply::Result(json!(false))
        );

        tokio::time::sleep(std::time::Duration::from_secs(3)).await;

        assert_eq!(
            pipeline.call_ws("walletislocked", json!([]), true).await,
            Reply::Result(json!(true))
        );
        let address = {
            let manager = pipeline.app.wallet.lock_guard().await;
            let account = manager.account("").unwrap();
            account.sorted_addresses()[0].clone()
        };
        assert_eq!(
            pipeline.rpc_error("dumpprivkey", json!([address])).await,
            RpcError::unlock_needed()
        );
    }

    #[tokio::test]
    async fn repeated_unlock_extends_availability() {
        let pipeline = spawn_pipeline();
        pipeline.result("createencryptedwallet", json!(["pw"])).await;
        pipeline.result("walletpassphrase", json!(["pw", 60])).await;
        pipeline.result("walletpassphrase", json!(["pw", 60])).await;
        assert_eq!(
            pipeline.call_ws("walletislocked", json!([]), true).await,
            Reply::Result(json!(false))
        );
    }

    #[tokio::test]
    async fn wrong_change_passphrase_reports_incorrect() {
        let pipeline = spawn_pipeline();
        pipeline.result("createencryptedwallet", json!(["pw"])).await;
        assert_eq!(
            pipeline
                .rpc_error("walletpassphrasechange", json!(["nope", "new"]))
                .await,
            RpcError::passphrase_incorrect()
        );
        // a second wallet cannot be created; the reply is preserved as an
        // invalid account name for client compatibility
        assert_eq!(
            pipeline
                .rpc_error("createencryptedwallet", json!(["pw"]))
                .await,
            RpcError::invalid_account_name()
        );
    }

    #[tokio::test]
    async fn sign_and_verify_message_round_trip() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        let address = {
            let mut manager = pipeline.app.wallet.lock_guard().await;
            manager.account_mut("").unwrap().new_address().unwrap().to_string()
        };

        let signature = pipeline
            .result("signmessage", json!([address, "squeamish ossifrage"]))
            .await;
        let ok = pipeline
            .result(
                "verifymessage",
                json!([address, signature, "squeamish ossifrage"]),
            )
            .await;
        assert_eq!(ok, json!(true));

        let bad = pipeline
            .result(
                "verifymessage",
                json!([address, signature, "squeamish ossifragE"]),
            )
            .await;
        assert_eq!(bad, json!(false));
    }

    #[tokio::test]
    async fn import_privkey_duplicate_is_silent_success() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;

        let wif = bitcoin::PrivateKey::new(
            bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng()),
            bitcoin::NetworkKind::Test,
        )
        .to_wif();
        let addresses_for = |value: Value| value.as_array().unwrap().len();

        assert_eq!(
            pipeline.result("importprivkey", json!([wif])).await,
            Value::Null
        );
        let after_first =
            addresses_for(pipeline.result("getaddressesbyaccount", json!([""])).await);
        assert_eq!(
            pipeline.result("importprivkey", json!([wif])).await,
            Value::Null
        );
        let after_second =
            addresses_for(pipeline.result("getaddressesbyaccount", json!([""])).await);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn list_since_block_with_empty_hash_lists_everything() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        let listed = pipeline
            .result("listsinceblock", json!(["", 1]))
            .await;
        assert_eq!(listed["transactions"].as_array().unwrap().len(), 1);
        assert_eq!(
            listed["lastblock"],
            json!(BlockHash::all_zeros().to_string())
        );
    }

    #[tokio::test]
    async fn send_amount_must_be_positive() {
        let pipeline = spawn_pipeline();
        pipeline.fund_default_account().await;
        for amount in [0.0, -1.0] {
            let err = pipeline
                .rpc_error("sendtoaddress", json!([dest_address(), amount]))
                .await;
            assert_eq!(err.code, crate::models::json_rpc::ERR_INVALID_PARAMS);
        }
    }
}
