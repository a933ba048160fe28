//! Handlers for chain-state notifications pushed by the upstream node, and
//! the builders for notifications this wallet pushes to its own frontends.

use bitcoin::consensus;
use bitcoin::Address;
use bitcoin::BlockHash;
use bitcoin::OutPoint;
use bitcoin::Transaction;
use serde_json::json;
use serde_json::Value;
use tracing::warn;

use crate::models::channel::BlockDetails;
use crate::models::channel::UpstreamNotification;
use crate::wallet::AccountManager;
use crate::wallet::WalletError;
use crate::App;

/// Push the lock state of an account to every frontend.
pub fn notify_wallet_lock_state(app: &App, account: &str, locked: bool) {
    app.notify_all("walletlockstate", json!([account, locked]));
}

/// Push a confirmed (`confirmed == true`) or unconfirmed account balance.
pub fn notify_balance(app: &App, account: &str, balance_btc: f64, confirmed: bool) {
    app.notify_all("accountbalance", json!([account, balance_btc, confirmed]));
}

/// Push transaction details to every frontend.
pub fn notify_new_tx(app: &App, account: &str, details: Value) {
    app.notify_all("newtx", json!([account, details]));
}

/// Push both balance variants for one account.
pub fn notify_account_balances(app: &App, manager: &AccountManager, name: &str) {
    let Ok(confirmed) = manager.calculate_balance(name, 1) else {
        return;
    };
    let total = manager.calculate_balance(name, 0).unwrap_or(confirmed);
    notify_balance(app, name, confirmed.to_btc(), true);
    notify_balance(app, name, (total - confirmed).to_btc(), false);
}

/// Dispatch one upstream notification. The only error the caller reacts to
/// is the store-inconsistency sentinel; everything else is logged and
/// swallowed there.
pub async fn handle_notification(
    app: &App,
    notification: UpstreamNotification,
) -> Result<(), WalletError> {
    match notification {
        UpstreamNotification::BlockConnected { hash, height } => {
            handle_block_connected(app, hash, height).await
        }
        UpstreamNotification::BlockDisconnected { hash, height } => {
            handle_block_disconnected(app, hash, height).await
        }
        UpstreamNotification::RecvTx { hex_tx, block } => {
            handle_recv_tx(app, &hex_tx, block).await
        }
    }
}

async fn handle_block_connected(
    app: &App,
    hash: BlockHash,
    height: i32,
) -> Result<(), WalletError> {
    let names: Vec<String> = {
        let mut manager = app.wallet.lock_guard().await;
        manager.set_cur_block(height, hash);
        manager.accounts().map(|account| account.name.clone()).collect()
    };

    // Balance notifications must observe the cumulative effect of the
    // block; wait for every per-tx worker, outside the lock.
    app.balance_barrier.wait_idle(hash).await;

    let manager = app.wallet.lock_guard().await;
    for name in &names {
        notify_account_balances(app, &manager, name);
    }
    Ok(())
}

async fn handle_block_disconnected(
    app: &App,
    hash: BlockHash,
    height: i32,
) -> Result<(), WalletError> {
    warn!("block {hash} at height {height} disconnected");
    let mut manager = app.wallet.lock_guard().await;
    manager.rollback(height);
    Ok(())
}

/// One wallet-owned credit of an incoming transaction, captured under the
/// lock so notification workers need not re-acquire it.
struct RecvCredit {
    account: String,
    outpoint: OutPoint,
    amount_btc: f64,
    address: Option<String>,
    newly_added: bool,
    confirmations: i32,
}

async fn handle_recv_tx(
    app: &App,
    hex_tx: &str,
    block: Option<BlockDetails>,
) -> Result<(), WalletError> {
    let bytes = hex::decode(hex_tx)
        .map_err(|err| WalletError::Internal(format!("bad recvtx hex: {err}")))?;
    let tx: Transaction = consensus::deserialize(&bytes)
        .map_err(|err| WalletError::Internal(format!("bad recvtx encoding: {err}")))?;
    let txid = tx.compute_txid();

    // If this wallet broadcast the transaction, receive history must not be
    // written until its send history has been persisted.
    app.send_sync.wait_for(txid).await;

    let credits = {
        let mut manager = app.wallet.lock_guard().await;
        let network = manager.network().as_bitcoin();
        let current_height = manager.cur_block().height;

        let owned: Vec<(String, u32)> = tx
            .output
            .iter()
            .enumerate()
            .filter_map(|(index, out)| {
                manager
                    .accounts()
                    .find(|account| account.owns_script(&out.script_pubkey))
                    .map(|account| (account.name.clone(), index as u32))
            })
            .collect();

        let mut credits = Vec::with_capacity(owned.len());
        for (account, index) in owned {
            let newly_added = manager.account_mut(&account)?.store.insert_credit(
                &tx,
                index,
                false,
                block.map(|details| (details.height, details.hash)),
            )?;
            manager.schedule_txstore_write(&account);
            let out = &tx.output[index as usize];
            credits.push(RecvCredit {
                account,
                outpoint: OutPoint::new(txid, index),
                amount_btc: out.value.to_btc(),
                address: Address::from_script(&out.script_pubkey, network)
                    .ok()
                    .map(|address| address.to_string()),
                newly_added,
                confirmations: block.map(|details| (current_height - details.height + 1).max(1)).unwrap_or(0),
            });
        }
        credits
    };

    if credits.is_empty() {
        return Ok(());
    }

    match block {
        None => {
            for credit in credits {
                announce_mempool_credit(app, txid, credit).await;
            }
        }
        Some(details) => {
            // Register against the block barrier before scheduling the
            // worker, so the block-connected handler waits for it.
            app.balance_barrier.enter(details.hash).await;
            let app = app.clone();
            tokio::spawn(async move {
                for credit in credits {
                    announce_mined_credit(&app, txid, credit).await;
                }
                app.balance_barrier.worker_done(details.hash);
            });
        }
    }
    Ok(())
}

async fn announce_mempool_credit(app: &App, txid: bitcoin::Txid, credit: RecvCredit) {
    if !credit.newly_added {
        // The send path recorded (and announced) this credit already.
        return;
    }
    if app.notified_recv.contains(credit.outpoint).await {
        return;
    }
    app.notified_recv.add(credit.outpoint);
    let details = recv_tx_details(txid, &credit);
    notify_new_tx(app, &credit.account, details);
}

async fn announce_mined_credit(app: &App, txid: bitcoin::Txid, credit: RecvCredit) {
    if app.notified_recv.contains(credit.outpoint).await {
        // Announced from the mempool earlier; the confirmed form replaces
        // the entry and is delivered normally.
        app.notified_recv.remove(credit.outpoint);
    } else if !credit.newly_added {
        return;
    }
    let details = recv_tx_details(txid, &credit);
    notify_new_tx(app, &credit.account, details);
}

fn recv_tx_details(txid: bitcoin::Txid, credit: &RecvCredit) -> Value {
    json!({
        "account": credit.account,
        "category": "receive",
        "amount": credit.amount_btc,
        "address": credit.address,
        "txid": txid.to_string(),
        "confirmations": credit.confirmations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::Amount;
    use bitcoin::TxOut;

    use crate::config_models::cli_args::Config;
    use crate::config_models::network::Network;
    use crate::upstream::UpstreamClient;
    use crate::wallet::AccountManagerLock;

    async fn test_app() -> App {
        let manager = AccountManager::new(Network::Testnet3, 4, false);
        let (upstream, _outbound) = UpstreamClient::new();
        let (app, _reconnect) = App::new(
            Arc::new(Config::for_tests()),
            AccountManagerLock::new(manager),
            upstream,
        );
        {
            let mut manager = app.wallet.lock_guard().await;
            manager.create_encrypted_wallet("pw").unwrap();
            manager.unlock_wallets("pw").unwrap();
        }
        app
    }

    async fn wallet_payment_tx(app: &App, sats: u64) -> Transaction {
        let mut manager = app.wallet.lock_guard().await;
        let address = manager.account_mut("").unwrap().new_address().unwrap();
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: address.script_pubkey(),
            }],
        }
    }

    fn recv_notification(tx: &Transaction, block: Option<BlockDetails>) -> UpstreamNotification {
        UpstreamNotification::RecvTx {
            hex_tx: bitcoin::consensus::encode::serialize_hex(tx),
            block,
        }
    }

    #[tokio::test]
    async fn mempool_credit_notifies_once() {
        let app = test_app().await;
        let mut clients = app.subscribe_clients();
        let tx = wallet_payment_tx(&app, 50_000).await;

        handle_notification(&app, recv_notification(&tx, None)).await.unwrap();
        let line = clients.recv().await.unwrap();
        assert!(line.contains("newtx"));

        // the duplicate mempool delivery is suppressed
        handle_notification(&app, recv_notification(&tx, None)).await.unwrap();
        assert!(clients.try_recv().is_err());
    }

    #[tokio::test]
    async fn confirmed_form_is_delivered_after_mempool_form() {
        let app = test_app().await;
        let mut clients = app.subscribe_clients();
        let tx = wallet_payment_tx(&app, 50_000).await;

        handle_notification(&app, recv_notification(&tx, None)).await.unwrap();
        clients.recv().await.unwrap();

        let details = BlockDetails {
            hash: BlockHash::from_byte_array([5; 32]),
            height: 10,
        };
        handle_notification(&app, recv_notification(&tx, Some(details)))
            .await
            .unwrap();
        app.balance_barrier.wait_idle(details.hash).await;

        let line = clients.recv().await.unwrap();
        assert!(line.contains("newtx"));
        let manager = app.wallet.lock_guard().await;
        assert_eq!(
            manager.account("").unwrap().store.get(&tx.compute_txid()).unwrap().block_height,
            10
        );
    }

    #[tokio::test]
    async fn block_connected_updates_height_and_announces_balances() {
        let app = test_app().await;
        let tx = wallet_payment_tx(&app, 70_000).await;
        let details = BlockDetails {
            hash: BlockHash::from_byte_array([9; 32]),
            height: 3,
        };
        handle_notification(&app, recv_notification(&tx, Some(details)))
            .await
            .unwrap();

        let mut clients = app.subscribe_clients();
        handle_notification(
            &app,
            UpstreamNotification::BlockConnected {
                hash: details.hash,
                height: 3,
            },
        )
        .await
        .unwrap();

        let balance_line = loop {
            let line = clients.recv().await.unwrap();
            if line.contains("accountbalance") {
                break line;
            }
        };
        assert!(balance_line.contains("accountbalance"));
        let manager = app.wallet.lock_guard().await;
        assert_eq!(manager.cur_block().height, 3);
        assert_eq!(
            manager.calculate_balance("", 1).unwrap(),
            Amount::from_sat(70_000)
        );
    }

    #[tokio::test]
    async fn conflicting_heights_surface_store_inconsistency() {
        let app = test_app().await;
        let tx = wallet_payment_tx(&app, 10_000).await;

        let first = BlockDetails {
            hash: BlockHash::from_byte_array([1; 32]),
            height: 4,
        };
        handle_notification(&app, recv_notification(&tx, Some(first))).await.unwrap();

        let conflicting = BlockDetails {
            hash: BlockHash::from_byte_array([2; 32]),
            height: 9,
        };
        let err = handle_notification(&app, recv_notification(&tx, Some(conflicting)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WalletError::Store(crate::wallet::txstore::TxStoreError::Inconsistent)
        ));
    }
}
