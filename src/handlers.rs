//! Per-method wallet request handlers.
//!
//! Dispatch is an exhaustive match over the decoded command; every arm
//! returns either a result value or a JSON-RPC error, never both, and no
//! handler panics.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::RecoverableSignature;
use bitcoin::secp256k1::ecdsa::RecoveryId;
use bitcoin::secp256k1::Message;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::PrivateKey;
use bitcoin::PublicKey;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use bitcoin::Txid;
use itertools::Itertools;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::models::commands::PrevInput;
use crate::models::commands::WalletCommand;
use crate::models::json_rpc::RpcError;
use crate::notifications;
use crate::signer;
use crate::signer::KeySource;
use crate::wallet::account::Account;
use crate::wallet::AccountManager;
use crate::wallet::AddressInfo;
use crate::wallet::WalletError;
use crate::App;

const WALLET_VERSION: u32 = 60000;

const MESSAGE_MAGIC: &str = "Bitcoin Signed Message:\n";

/// Execute one decoded wallet command.
pub async fn dispatch(app: &App, command: WalletCommand) -> Result<Value, RpcError> {
    match command {
        WalletCommand::AddMultiSigAddress { n_required, keys, account } => {
            add_multisig_address(app, n_required, keys, account).await
        }
        WalletCommand::CreateMultiSig { n_required, keys } => {
            create_multisig(app, n_required, keys).await
        }
        WalletCommand::DumpPrivKey { address } => dump_privkey(app, address).await,
        WalletCommand::GetAccount { address } => get_account(app, address).await,
        WalletCommand::GetAccountAddress { account } => get_account_address(app, account).await,
        WalletCommand::GetAddressesByAccount { account } => {
            get_addresses_by_account(app, account).await
        }
        WalletCommand::GetBalance { account, minconf } => get_balance(app, account, minconf).await,
        WalletCommand::GetInfo => get_info(app).await,
        WalletCommand::GetNewAddress { account } => get_new_address(app, account).await,
        WalletCommand::GetRawChangeAddress { account } => {
            get_raw_change_address(app, account).await
        }
        WalletCommand::GetReceivedByAccount { account, minconf } => {
            get_received_by_account(app, account, minconf).await
        }
        WalletCommand::GetTransaction { txid } => get_transaction(app, txid).await,
        WalletCommand::ImportPrivKey { wif, account, rescan } => {
            import_privkey(app, wif, account, rescan).await
        }
        WalletCommand::KeypoolRefill => Ok(Value::Null),
        WalletCommand::ListAccounts { minconf } => list_accounts(app, minconf).await,
        WalletCommand::ListSinceBlock { block_hash, target_confirmations } => {
            list_since_block(app, block_hash, target_confirmations).await
        }
        WalletCommand::ListTransactions { account, count, from } => {
            list_transactions(app, account, count, from).await
        }
        WalletCommand::ListUnspent { minconf, maxconf, addresses } => {
            list_unspent(app, minconf, maxconf, addresses).await
        }
        WalletCommand::SendFrom { from_account, to_address, amount, minconf } => {
            if amount <= 0.0 {
                return Err(RpcError::invalid_params("amount must be positive"));
            }
            if minconf < 0 {
                return Err(RpcError::invalid_params("minconf must be positive"));
            }
            send_pairs(app, &from_account, vec![(to_address, amount)], minconf).await
        }
        WalletCommand::SendMany { from_account, amounts, minconf } => {
            if minconf < 0 {
                return Err(RpcError::invalid_params("minconf must be positive"));
            }
            send_pairs(app, &from_account, amounts, minconf).await
        }
        WalletCommand::SendToAddress { address, amount } => {
            if amount <= 0.0 {
                return Err(RpcError::invalid_params("amount must be positive"));
            }
            send_pairs(app, "", vec![(address, amount)], 1).await
        }
        WalletCommand::SetTxFee { amount } => set_tx_fee(app, amount).await,
        WalletCommand::SignMessage { address, message } => {
            sign_message(app, address, message).await
        }
        WalletCommand::SignRawTransaction { raw_tx, inputs, priv_keys, flags } => {
            sign_raw_transaction(app, raw_tx, inputs, priv_keys, flags).await
        }
        WalletCommand::ValidateAddress { address } => validate_address(app, address).await,
        WalletCommand::VerifyMessage { address, signature, message } => {
            verify_message(app, address, signature, message).await
        }
        WalletCommand::WalletLock => wallet_lock(app).await,
        WalletCommand::WalletPassphrase { passphrase, timeout } => {
            wallet_passphrase(app, passphrase, timeout).await
        }
        WalletCommand::WalletPassphraseChange { old, new } => {
            wallet_passphrase_change(app, old, new).await
        }
        WalletCommand::CreateEncryptedWallet { passphrase } => {
            create_encrypted_wallet(app, passphrase).await
        }

        WalletCommand::ExportWatchingWallet { account, download } => {
            export_watching_wallet(app, account, download).await
        }
        WalletCommand::GetAddressBalance { address, minconf } => {
            get_address_balance(app, address, minconf).await
        }
        WalletCommand::GetUnconfirmedBalance { account } => {
            get_unconfirmed_balance(app, account).await
        }
        WalletCommand::ListAddressTransactions { addresses, account } => {
            list_address_transactions(app, addresses, account).await
        }
        WalletCommand::ListAllTransactions { account } => {
            list_all_transactions(app, account).await
        }
        WalletCommand::RecoverAddresses { account, n } => recover_addresses(app, account, n).await,
        WalletCommand::WalletIsLocked { account } => wallet_is_locked(app, account).await,

        WalletCommand::Unimplemented => Err(RpcError::method_not_found()),
        WalletCommand::Unsupported => Err(RpcError::unsupported()),
    }
}

/// Map a wallet collaborator error onto the JSON-RPC error space.
fn wallet_err(err: WalletError) -> RpcError {
    match err {
        WalletError::Locked => RpcError::unlock_needed(),
        WalletError::NotFound => RpcError::invalid_account_name(),
        // preserved for client compatibility: a pre-existing wallet reports
        // an invalid account name
        WalletError::WalletExists => RpcError::invalid_account_name(),
        WalletError::WrongPassphrase => RpcError::passphrase_incorrect(),
        WalletError::KeypoolExhausted => RpcError::keypool_ran_out(),
        WalletError::NonPositiveAmount => RpcError::invalid_params("amount must be positive"),
        WalletError::InvalidAddress => RpcError::invalid_address_or_key(),
        other => RpcError::wallet(other.to_string()),
    }
}

fn parse_address(app: &App, address: &str) -> Result<Address, RpcError> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .ok()
        .and_then(|addr| addr.require_network(app.cfg.network.as_bitcoin()).ok())
        .ok_or_else(RpcError::invalid_address_or_key)
}

fn unix_time(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

async fn add_multisig_address(
    app: &App,
    n_required: usize,
    keys: Vec<String>,
    account: String,
) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    manager.account(&account).map_err(wallet_err)?;
    let pubkeys = resolve_pubkeys(&manager, &keys, app)?;
    let script = signer::multisig_script(n_required, &pubkeys)?;
    let address = manager
        .account_mut(&account)
        .map_err(wallet_err)?
        .import_script(script)
        .map_err(wallet_err)?;
    manager.schedule_wallet_write(&account);
    Ok(json!(address.to_string()))
}

async fn create_multisig(
    app: &App,
    n_required: usize,
    keys: Vec<String>,
) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let pubkeys = resolve_pubkeys(&manager, &keys, app)?;
    let script = signer::multisig_script(n_required, &pubkeys)?;
    let address = Address::p2sh(&script, app.cfg.network.as_bitcoin())
        .map_err(|err| RpcError::wallet(err.to_string()))?;
    Ok(json!({
        "address": address.to_string(),
        "redeemScript": script.to_hex_string(),
    }))
}

/// Resolve multisig participants given as hex pubkeys or wallet addresses.
/// Errors here use the parse error code, matching the reference server.
fn resolve_pubkeys(
    manager: &AccountManager,
    keys: &[String],
    app: &App,
) -> Result<Vec<PublicKey>, RpcError> {
    keys.iter()
        .map(|key| {
            if let Ok(pubkey) = key.parse::<PublicKey>() {
                return Ok(pubkey);
            }
            let address = key
                .parse::<Address<NetworkUnchecked>>()
                .ok()
                .and_then(|addr| addr.require_network(app.cfg.network.as_bitcoin()).ok())
                .ok_or_else(|| RpcError::parse(format!("invalid key or address: {key}")))?;
            match manager.address_info(&address) {
                Some(AddressInfo::Key { entry, .. }) => Ok(entry.public),
                _ => Err(RpcError::parse("key is not a pubkey or pubkey hash address")),
            }
        })
        .collect()
}

async fn dump_privkey(app: &App, address: String) -> Result<Value, RpcError> {
    let address = parse_address(app, &address)?;
    let manager = app.wallet.lock_guard().await;
    match manager.dump_wif_private_key(&address) {
        Ok(wif) => Ok(json!(wif)),
        Err(WalletError::Locked) => Err(RpcError::unlock_needed()),
        Err(WalletError::InvalidAddress) => Err(RpcError::invalid_address_or_key()),
        Err(other) => Err(RpcError::wallet(other.to_string())),
    }
}

async fn get_account(app: &App, address: String) -> Result<Value, RpcError> {
    let address = parse_address(app, &address)?;
    let manager = app.wallet.lock_guard().await;
    match manager.account_by_address(&address) {
        Some(account) => Ok(json!(account.name)),
        None => Err(RpcError::new(
            crate::models::json_rpc::ERR_INVALID_ADDRESS_OR_KEY,
            "Address not found in wallet",
        )),
    }
}

async fn get_account_address(app: &App, account: String) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    let address = manager
        .account_mut(&account)
        .map_err(wallet_err)?
        .current_address()
        .map_err(wallet_err)?;
    Ok(json!(address.to_string()))
}

async fn get_addresses_by_account(app: &App, account: String) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let account = manager.account(&account).map_err(wallet_err)?;
    Ok(json!(account.sorted_addresses()))
}

async fn get_balance(app: &App, account: String, minconf: i32) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let balance = manager
        .calculate_balance(&account, minconf)
        .map_err(|_| RpcError::invalid_account_name())?;
    Ok(json!(balance.to_btc()))
}

async fn get_info(app: &App) -> Result<Value, RpcError> {
    // Ask the upstream node first; everything it knows is merged with the
    // wallet-side fields below.
    let mut info = app.upstream.call("getinfo", json!([])).await?;

    let manager = app.wallet.lock_guard().await;
    let balance: f64 = manager
        .list_accounts(1)
        .values()
        .map(|amount| Amount::to_btc(*amount))
        .sum();
    let object = info
        .as_object_mut()
        .ok_or_else(|| RpcError::internal("malformed upstream getinfo reply"))?;
    object.insert("walletversion".into(), json!(WALLET_VERSION));
    object.insert("balance".into(), json!(balance));
    // keypool times are not tracked
    object.insert("keypoololdest".into(), json!(unix_time(SystemTime::now())));
    object.insert("keypoolsize".into(), json!(app.cfg.keypool_size));
    object.insert("paytxfee".into(), json!(manager.fee_increment().to_btc()));
    Ok(info)
}

async fn get_new_address(app: &App, account: String) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    let address = manager
        .account_mut(&account)
        .map_err(wallet_err)?
        .new_address()
        .map_err(wallet_err)?;
    manager.schedule_wallet_write(&account);
    // watch the fresh address for incoming transactions
    app.upstream.notify("notifyreceived", json!([[address.to_string()]]));
    Ok(json!(address.to_string()))
}

async fn get_raw_change_address(app: &App, account: String) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    let address = manager
        .account_mut(&account)
        .map_err(wallet_err)?
        .new_change_address()
        .map_err(wallet_err)?;
    manager.schedule_wallet_write(&account);
    Ok(json!(address.to_string()))
}

async fn get_received_by_account(
    app: &App,
    account: String,
    minconf: i32,
) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let height = manager.cur_block().height;
    let account = manager.account(&account).map_err(wallet_err)?;
    Ok(json!(account.store.total_received(minconf, height).to_btc()))
}

async fn get_transaction(app: &App, txid: String) -> Result<Value, RpcError> {
    let txid: Txid = txid
        .parse()
        .map_err(|_| RpcError::deserialization("invalid txid"))?;

    let manager = app.wallet.lock_guard().await;
    let height = manager.cur_block().height;
    let network = app.cfg.network.as_bitcoin();

    let mut details = Vec::new();
    let mut received = Amount::ZERO;
    let mut fee = None;
    let mut sent = None;
    let mut record_info = None;

    for account in manager.accounts() {
        let Some(record) = account.store.get(&txid) else {
            continue;
        };
        record_info.get_or_insert_with(|| {
            (
                record.tx.clone(),
                record.received,
                record.confirmations(height),
                record.block_hash,
            )
        });
        for credit in &record.credits {
            if credit.change {
                continue;
            }
            let amount = record.credit_amount(*credit);
            received += amount;
            let address = record
                .tx
                .output
                .get(credit.index as usize)
                .and_then(|out| Address::from_script(&out.script_pubkey, network).ok());
            details.push(json!({
                "account": account.name,
                "category": "receive",
                "amount": amount.to_btc(),
                "address": address.map(|addr| addr.to_string()),
            }));
        }
        if let Some(debits) = &record.debits {
            fee = Some(debits.fee.to_btc());
            sent = Some(debits.output_amount);
            details.insert(
                0,
                json!({
                    "account": account.name,
                    "category": "send",
                    "amount": -debits.output_amount.to_btc(),
                    "fee": debits.fee.to_btc(),
                }),
            );
        }
    }

    let Some((tx, received_at, confirmations, block_hash)) = record_info else {
        return Err(RpcError::new(
            crate::models::json_rpc::ERR_INVALID_ADDRESS_OR_KEY,
            "No information available about transaction",
        ));
    };

    let mut amount = received.to_btc();
    if let Some(sent) = sent {
        amount -= sent.to_btc();
    }

    let mut result = json!({
        "txid": txid.to_string(),
        "amount": amount,
        "confirmations": confirmations,
        "time": unix_time(received_at),
        "timereceived": unix_time(received_at),
        "details": details,
        "walletconflicts": [],
        "hex": consensus::encode::serialize_hex(&tx),
    });
    let object = result.as_object_mut().expect("result is an object");
    if let Some(fee) = fee {
        object.insert("fee".into(), json!(fee));
    }
    if let Some(hash) = block_hash {
        object.insert("blockhash".into(), json!(hash.to_string()));
    }
    Ok(result)
}

async fn import_privkey(
    app: &App,
    wif: String,
    account: String,
    _rescan: bool,
) -> Result<Value, RpcError> {
    let key = PrivateKey::from_wif(&wif).map_err(|_| RpcError::invalid_address_or_key())?;
    if !app.cfg.network.matches_key(key.network) {
        return Err(RpcError::invalid_address_or_key());
    }

    let mut manager = app.wallet.lock_guard().await;
    manager.account(&account).map_err(wallet_err)?;
    match manager
        .account_mut(&account)
        .map_err(wallet_err)?
        .import_private_key(key)
    {
        // duplicate imports are a silent success
        Ok(_) | Err(WalletError::DuplicateKey) => {
            manager.schedule_wallet_write(&account);
            Ok(Value::Null)
        }
        Err(WalletError::Locked) => Err(RpcError::unlock_needed()),
        Err(other) => Err(RpcError::wallet(other.to_string())),
    }
}

async fn list_accounts(app: &App, minconf: i32) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let accounts: serde_json::Map<String, Value> = manager
        .list_accounts(minconf)
        .into_iter()
        .map(|(name, balance)| (name, json!(balance.to_btc())))
        .collect();
    Ok(Value::Object(accounts))
}

async fn list_since_block(
    app: &App,
    block_hash: String,
    target_confirmations: i32,
) -> Result<Value, RpcError> {
    let current_height = {
        let manager = app.wallet.lock_guard().await;
        manager.cur_block().height
    };

    // Request the hash of the last counted block now so the reply can
    // arrive while the transaction list is assembled.
    let last_block_rx = app.upstream.send_request(
        "getblockhash",
        json!([i64::from(current_height) + 1 - i64::from(target_confirmations)]),
    );

    // An empty block hash counts every transaction.
    let since_height = if block_hash.is_empty() {
        -1
    } else {
        let block = app.upstream.call("getblock", json!([block_hash])).await?;
        block
            .get("height")
            .and_then(Value::as_i64)
            .ok_or_else(|| RpcError::wallet("malformed upstream getblock reply"))? as i32
    };

    let transactions: Vec<ListTxItem> = {
        let manager = app.wallet.lock_guard().await;
        manager
            .accounts()
            .flat_map(|account| account_tx_items(account, app, current_height))
            .filter(|(record_height, _)| {
                *record_height == crate::wallet::txstore::MEMPOOL_HEIGHT
                    || *record_height > since_height
            })
            .map(|(_, item)| item)
            .collect()
    };

    let last_block = last_block_rx
        .await
        .unwrap_or_else(|_| Err(RpcError::upstream_disconnected()))?;
    Ok(json!({
        "transactions": transactions,
        "lastblock": last_block,
    }))
}

async fn list_transactions(
    app: &App,
    account: String,
    count: usize,
    from: usize,
) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let height = manager.cur_block().height;
    let account = manager.account(&account).map_err(wallet_err)?;
    let items: Vec<ListTxItem> = account_tx_items(account, app, height)
        .into_iter()
        .map(|(_, item)| item)
        .sorted_by_key(|item| std::cmp::Reverse(item.time))
        .skip(from)
        .take(count)
        .collect();
    Ok(json!(items))
}

async fn list_address_transactions(
    app: &App,
    addresses: Vec<String>,
    account: String,
) -> Result<Value, RpcError> {
    let wanted: HashSet<String> = addresses.into_iter().collect();
    for address in &wanted {
        parse_address(app, address)?;
    }

    let manager = app.wallet.lock_guard().await;
    let height = manager.cur_block().height;
    let account = manager.account(&account).map_err(wallet_err)?;
    let items: Vec<ListTxItem> = account_tx_items(account, app, height)
        .into_iter()
        .map(|(_, item)| item)
        .filter(|item| {
            item.address
                .as_ref()
                .is_some_and(|address| wanted.contains(address))
        })
        .collect();
    Ok(json!(items))
}

async fn list_all_transactions(app: &App, account: String) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let height = manager.cur_block().height;
    let account = manager.account(&account).map_err(wallet_err)?;
    let items: Vec<ListTxItem> = account_tx_items(account, app, height)
        .into_iter()
        .map(|(_, item)| item)
        .sorted_by_key(|item| std::cmp::Reverse(item.time))
        .collect();
    Ok(json!(items))
}

async fn list_unspent(
    app: &App,
    minconf: i32,
    maxconf: i32,
    addresses: Vec<String>,
) -> Result<Value, RpcError> {
    let mut filter = HashSet::new();
    for address in &addresses {
        let parsed = parse_address(app, address)?;
        if !filter.insert(parsed.script_pubkey()) {
            return Err(RpcError::invalid_params("duplicate address"));
        }
    }

    let manager = app.wallet.lock_guard().await;
    let height = manager.cur_block().height;
    let network = app.cfg.network.as_bitcoin();
    let mut results = Vec::new();
    for account in manager.accounts() {
        for (outpoint, amount, record, credit) in
            account.store.unspent_credits(minconf, maxconf, height)
        {
            let script = &record.tx.output[credit.index as usize].script_pubkey;
            if !filter.is_empty() && !filter.contains(script) {
                continue;
            }
            results.push(json!({
                "txid": outpoint.txid.to_string(),
                "vout": outpoint.vout,
                "address": Address::from_script(script, network)
                    .ok()
                    .map(|addr| addr.to_string()),
                "account": account.name,
                "scriptPubKey": script.to_hex_string(),
                "amount": amount.to_btc(),
                "confirmations": record.confirmations(height),
            }));
        }
    }
    Ok(json!(results))
}

/// Shared flow of sendfrom/sendmany/sendtoaddress: build and sign the
/// transaction under the lock, broadcast with the lock released, then write
/// send history and announce the new balances.
async fn send_pairs(
    app: &App,
    account: &str,
    pairs: Vec<(String, f64)>,
    minconf: i32,
) -> Result<Value, RpcError> {
    let created = {
        let mut manager = app.wallet.lock_guard().await;
        manager
            .account(account)
            .map_err(|_| RpcError::invalid_account_name())?;
        let created = manager
            .tx_to_pairs(account, &pairs, minconf)
            .map_err(|err| match err {
                WalletError::NonPositiveAmount => {
                    RpcError::invalid_params("amount must be positive")
                }
                WalletError::Locked => RpcError::unlock_needed(),
                WalletError::NotFound => RpcError::invalid_account_name(),
                WalletError::InvalidAddress => RpcError::invalid_address_or_key(),
                other => RpcError::internal(other.to_string()),
            })?;

        // Mark the txid as having send history before broadcast, so receive
        // handlers wait for it.
        app.send_sync.add(created.txid());

        if let Some(change) = &created.change_address {
            manager.schedule_wallet_write(account);
            if let Err(err) = manager.flush_account(account) {
                app.send_sync.remove(created.txid());
                return Err(RpcError::wallet(err.to_string()));
            }
            app.upstream
                .notify("notifyreceived", json!([[change.to_string()]]));
        }
        created
    };
    // the account lock is not held across the upstream broadcast

    let txid = created.txid();
    let hex_tx = consensus::encode::serialize_hex(&created.tx);
    if let Err(err) = app.upstream.call("sendrawtransaction", json!([hex_tx])).await {
        app.send_sync.remove(txid);
        return Err(err);
    }

    let mut manager = app.wallet.lock_guard().await;
    if let Err(err) = manager.record_send(account, &created) {
        warn!("error adding sent tx history: {err}");
        return Err(RpcError::internal(err.to_string()));
    }
    manager.schedule_txstore_write(account);

    notifications::notify_new_tx(
        app,
        account,
        json!({
            "account": account,
            "category": "send",
            "amount": -created.output_amount.to_btc(),
            "fee": created.fee.to_btc(),
            "txid": txid.to_string(),
            "confirmations": 0,
        }),
    );

    // Received notifications for this tx are now ok to add.
    app.send_sync.done(txid);

    if let Err(err) = manager.flush_account(account) {
        // the broadcast cannot be undone; surface the failure in the log
        error!("cannot write account: {err}");
    }

    notifications::notify_account_balances(app, &manager, account);
    info!("successfully sent transaction {txid}");
    Ok(json!(txid.to_string()))
}

async fn set_tx_fee(app: &App, amount: f64) -> Result<Value, RpcError> {
    if amount < 0.0 {
        return Err(RpcError::invalid_params("amount cannot be negative"));
    }
    let fee = Amount::from_btc(amount)
        .map_err(|err| RpcError::invalid_params(err.to_string()))?;
    let mut manager = app.wallet.lock_guard().await;
    manager.set_fee_increment(fee);
    Ok(json!(true))
}

fn message_digest(message: &str) -> [u8; 32] {
    let mut payload = Vec::with_capacity(MESSAGE_MAGIC.len() + message.len());
    payload.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    sha256d::Hash::hash(&payload).to_byte_array()
}

async fn sign_message(app: &App, address: String, message: String) -> Result<Value, RpcError> {
    let address = address
        .parse::<Address<NetworkUnchecked>>()
        .ok()
        .and_then(|addr| addr.require_network(app.cfg.network.as_bitcoin()).ok())
        .ok_or_else(|| RpcError::parse("invalid address"))?;

    let manager = app.wallet.lock_guard().await;
    let (account, entry) = match manager.address_info(&address) {
        Some(AddressInfo::Key { account, entry }) => (account, entry),
        _ => return Err(RpcError::invalid_address_or_key()),
    };
    if manager.account(account).map_err(wallet_err)?.is_locked() {
        return Err(RpcError::wallet("wallet is locked"));
    }

    let secp = Secp256k1::new();
    let digest = Message::from_digest(message_digest(&message));
    let signature = secp.sign_ecdsa_recoverable(&digest, &entry.private.inner);
    let (recovery_id, compact) = signature.serialize_compact();

    let mut bytes = Vec::with_capacity(65);
    bytes.push(27 + recovery_id.to_i32() as u8 + if entry.private.compressed { 4 } else { 0 });
    bytes.extend_from_slice(&compact);
    Ok(json!(BASE64.encode(bytes)))
}

async fn verify_message(
    app: &App,
    address: String,
    signature: String,
    message: String,
) -> Result<Value, RpcError> {
    let address = address
        .parse::<Address<NetworkUnchecked>>()
        .ok()
        .and_then(|addr| addr.require_network(app.cfg.network.as_bitcoin()).ok())
        .ok_or_else(|| RpcError::parse("invalid address"))?;

    let manager = app.wallet.lock_guard().await;
    let entry = match manager.address_info(&address) {
        Some(AddressInfo::Key { entry, .. }) => entry,
        _ => return Err(RpcError::invalid_address_or_key()),
    };

    let bytes = BASE64
        .decode(signature.as_bytes())
        .map_err(|err| RpcError::wallet(err.to_string()))?;
    if bytes.len() != 65 || bytes[0] < 27 {
        return Err(RpcError::wallet("malformed compact signature"));
    }
    let was_compressed = (bytes[0] - 27) & 4 != 0;
    let recovery_id = RecoveryId::from_i32(i32::from((bytes[0] - 27) & 3))
        .map_err(|err| RpcError::wallet(err.to_string()))?;
    let signature = RecoverableSignature::from_compact(&bytes[1..], recovery_id)
        .map_err(|err| RpcError::wallet(err.to_string()))?;

    let secp = Secp256k1::new();
    let digest = Message::from_digest(message_digest(&message));
    let recovered = secp
        .recover_ecdsa(&digest, &signature)
        .map_err(|err| RpcError::wallet(err.to_string()))?;

    Ok(json!(
        recovered == entry.public.inner && was_compressed == entry.private.compressed
    ))
}

async fn sign_raw_transaction(
    app: &App,
    raw_tx: String,
    inputs: Vec<PrevInput>,
    priv_keys: Vec<String>,
    flags: Option<String>,
) -> Result<Value, RpcError> {
    let bytes =
        hex::decode(&raw_tx).map_err(|_| RpcError::deserialization("TX decode failed"))?;
    let mut tx: Transaction = consensus::deserialize(&bytes)
        .map_err(|_| RpcError::deserialization("TX decode failed"))?;

    let network = app.cfg.network.as_bitcoin();
    let restricted = !priv_keys.is_empty();

    // Seed the prevout map with the supplemental inputs. Redeem scripts are
    // only usable when the caller also provided keys; otherwise scripts
    // always come from the wallet.
    let mut prevouts: HashMap<OutPoint, ScriptBuf> = HashMap::new();
    let mut provided_scripts: HashMap<String, ScriptBuf> = HashMap::new();
    for input in &inputs {
        let txid: Txid = input
            .txid
            .parse()
            .map_err(|_| RpcError::deserialization("invalid txid"))?;
        let script = ScriptBuf::from_hex(&input.script_pub_key)
            .map_err(|err| RpcError::deserialization(err.to_string()))?;
        if restricted {
            if let Some(redeem_hex) = &input.redeem_script {
                let redeem = ScriptBuf::from_hex(redeem_hex)
                    .map_err(|err| RpcError::deserialization(err.to_string()))?;
                let address = Address::p2sh(&redeem, network)
                    .map_err(|err| RpcError::deserialization(err.to_string()))?;
                provided_scripts.insert(address.to_string(), redeem);
            }
        }
        prevouts.insert(OutPoint::new(txid, input.vout), script);
    }

    // Fetch every remaining prevout, one async request per referenced
    // transaction. Replies are collected after the cheap argument checks.
    let mut requested: HashMap<Txid, (tokio::sync::oneshot::Receiver<Result<Value, RpcError>>, Vec<u32>)> =
        HashMap::new();
    for txin in &tx.input {
        let outpoint = txin.previous_output;
        if prevouts.contains_key(&outpoint) {
            continue;
        }
        if let Some((_, vouts)) = requested.get_mut(&outpoint.txid) {
            vouts.push(outpoint.vout);
            continue;
        }
        let rx = app
            .upstream
            .send_request("getrawtransaction", json!([outpoint.txid.to_string()]));
        requested.insert(outpoint.txid, (rx, vec![outpoint.vout]));
    }

    let mut provided_keys: HashMap<String, PrivateKey> = HashMap::new();
    let secp = Secp256k1::new();
    for wif in &priv_keys {
        let key = PrivateKey::from_wif(wif)
            .map_err(|err| RpcError::deserialization(err.to_string()))?;
        if !app.cfg.network.matches_key(key.network) {
            return Err(RpcError::deserialization("key network doesn't match wallet's"));
        }
        let address = Address::p2pkh(&key.public_key(&secp), network);
        provided_keys.insert(address.to_string(), key);
    }

    let hash_ty = signer::parse_sighash_flags(flags.as_deref())?;

    for (txid, (rx, vouts)) in requested {
        let reply = rx
            .await
            .unwrap_or_else(|_| Err(RpcError::upstream_disconnected()))?;
        let raw = reply
            .as_str()
            .ok_or_else(|| RpcError::wallet("malformed upstream getrawtransaction reply"))?;
        let prev_tx: Transaction = consensus::deserialize(
            &hex::decode(raw).map_err(|err| RpcError::wallet(err.to_string()))?,
        )
        .map_err(|err| RpcError::wallet(err.to_string()))?;

        for vout in vouts {
            let script = prev_tx
                .output
                .get(vout as usize)
                .map(|out| out.script_pubkey.clone())
                .ok_or_else(|| {
                    RpcError::invalid_params(format!("input {txid}:{vout} is not in tx"))
                })?;
            prevouts.insert(OutPoint::new(txid, vout), script);
        }
    }

    // All prevouts collected; sign under the account lock only when wallet
    // keys may be used.
    let complete = if restricted {
        let source = KeySource::Restricted {
            keys: provided_keys,
            scripts: provided_scripts,
        };
        signer::sign_all_inputs(&secp, &mut tx, hash_ty, &prevouts, &source, network)?
    } else {
        let manager = app.wallet.lock_guard().await;
        let source = KeySource::Wallet(&manager);
        signer::sign_all_inputs(&secp, &mut tx, hash_ty, &prevouts, &source, network)?
    };

    Ok(json!({
        "hex": consensus::encode::serialize_hex(&tx),
        "complete": complete,
    }))
}

async fn validate_address(app: &App, address: String) -> Result<Value, RpcError> {
    let Some(address) = address
        .parse::<Address<NetworkUnchecked>>()
        .ok()
        .and_then(|addr| addr.require_network(app.cfg.network.as_bitcoin()).ok())
    else {
        return Ok(json!({"isvalid": false}));
    };

    let mut result = json!({
        "address": address.to_string(),
        "isvalid": true,
    });
    let object = result.as_object_mut().expect("result is an object");

    let manager = app.wallet.lock_guard().await;
    match manager.address_info(&address) {
        Some(AddressInfo::Key { account, entry }) => {
            object.insert("ismine".into(), json!(true));
            object.insert("account".into(), json!(account));
            object.insert("iscompressed".into(), json!(entry.private.compressed));
            object.insert("pubkey".into(), json!(entry.public.to_string()));
        }
        Some(AddressInfo::Script { account, script }) => {
            object.insert("ismine".into(), json!(true));
            object.insert("account".into(), json!(account));
            object.insert("isscript".into(), json!(true));
            object.insert("hex".into(), json!(script.to_hex_string()));
            if let Some((required, pubkeys)) = signer::parse_multisig(script) {
                object.insert("script".into(), json!("multisig"));
                object.insert("sigsrequired".into(), json!(required));
                let network = app.cfg.network.as_bitcoin();
                let addresses: Vec<String> = pubkeys
                    .iter()
                    .map(|pubkey| Address::p2pkh(pubkey, network).to_string())
                    .collect();
                object.insert("addresses".into(), json!(addresses));
            } else if script.is_p2pkh() {
                object.insert("script".into(), json!("pubkeyhash"));
            } else if script.is_p2pk() {
                object.insert("script".into(), json!("pubkey"));
            } else {
                object.insert("script".into(), json!("nonstandard"));
            }
        }
        None => {}
    }
    Ok(result)
}

async fn wallet_lock(app: &App) -> Result<Value, RpcError> {
    let names = {
        let mut manager = app.wallet.lock_guard().await;
        if manager.accounts().next().is_none() {
            return Err(RpcError::wallet("wallet is not encrypted"));
        }
        manager.lock_wallets();
        manager
            .accounts()
            .map(|account| account.name.clone())
            .collect::<Vec<_>>()
    };
    for name in names {
        notifications::notify_wallet_lock_state(app, &name, true);
    }
    Ok(Value::Null)
}

async fn wallet_passphrase(app: &App, passphrase: String, timeout: u64) -> Result<Value, RpcError> {
    let names = {
        let mut manager = app.wallet.lock_guard().await;
        manager.unlock_wallets(&passphrase).map_err(|err| match err {
            // the unlock path reports a bad passphrase as a wallet error
            WalletError::WrongPassphrase => RpcError::wallet(err.to_string()),
            other => wallet_err(other),
        })?;
        manager
            .accounts()
            .map(|account| account.name.clone())
            .collect::<Vec<_>>()
    };
    for name in &names {
        notifications::notify_wallet_lock_state(app, name, false);
    }

    // Re-lock after the timeout. Repeated unlocks each schedule their own
    // re-lock; locking an already-locked wallet is a no-op.
    let app = app.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout)).await;
        let mut manager = app.wallet.lock_guard().await;
        manager.lock_wallets();
        drop(manager);
        for name in &names {
            notifications::notify_wallet_lock_state(&app, name, true);
        }
    });
    Ok(Value::Null)
}

async fn wallet_passphrase_change(app: &App, old: String, new: String) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    manager.change_passphrase(&old, &new).map_err(|err| match err {
        WalletError::WrongPassphrase => RpcError::passphrase_incorrect(),
        other => RpcError::wallet(other.to_string()),
    })?;
    Ok(Value::Null)
}

async fn create_encrypted_wallet(app: &App, passphrase: String) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    manager
        .create_encrypted_wallet(&passphrase)
        .map_err(wallet_err)?;
    Ok(Value::Null)
}

async fn export_watching_wallet(
    app: &App,
    account: String,
    download: bool,
) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let account = manager.account(&account).map_err(wallet_err)?;
    let snapshot = account.watching_snapshot();

    if download {
        let serialized =
            serde_json::to_vec(&snapshot).map_err(|err| RpcError::wallet(err.to_string()))?;
        return Ok(json!(BASE64.encode(serialized)));
    }

    let dir = app.cfg.datadir.join("watchingwallet");
    std::fs::create_dir_all(&dir).map_err(|err| RpcError::wallet(err.to_string()))?;
    let name = if account.name.is_empty() {
        "default"
    } else {
        &account.name
    };
    let path = dir.join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_vec_pretty(&snapshot).unwrap_or_default())
        .map_err(|err| RpcError::wallet(err.to_string()))?;
    Ok(Value::Null)
}

async fn get_address_balance(app: &App, address: String, minconf: i32) -> Result<Value, RpcError> {
    let address = parse_address(app, &address)?;
    let manager = app.wallet.lock_guard().await;
    let Some(account) = manager.account_by_address(&address) else {
        return Err(RpcError::new(
            crate::models::json_rpc::ERR_INVALID_ADDRESS_OR_KEY,
            "Address not found in wallet",
        ));
    };
    let height = manager.cur_block().height;
    let script = address.script_pubkey();
    let balance: Amount = account
        .store
        .unspent_credits(minconf, i32::MAX, height)
        .into_iter()
        .filter(|(_, _, record, credit)| {
            record.tx.output[credit.index as usize].script_pubkey == script
        })
        .map(|(_, amount, ..)| amount)
        .sum();
    Ok(json!(balance.to_btc()))
}

async fn get_unconfirmed_balance(app: &App, account: String) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let confirmed = manager
        .calculate_balance(&account, 1)
        .map_err(wallet_err)?;
    let total = manager.calculate_balance(&account, 0).map_err(wallet_err)?;
    Ok(json!((total - confirmed).to_btc()))
}

async fn recover_addresses(app: &App, account: String, n: u32) -> Result<Value, RpcError> {
    let mut manager = app.wallet.lock_guard().await;
    manager
        .account_mut(&account)
        .map_err(wallet_err)?
        .recover_addresses(n)
        .map_err(wallet_err)?;
    manager.schedule_wallet_write(&account);
    Ok(Value::Null)
}

async fn wallet_is_locked(app: &App, account: String) -> Result<Value, RpcError> {
    let manager = app.wallet.lock_guard().await;
    let account = manager.account(&account).map_err(wallet_err)?;
    Ok(json!(account.is_locked()))
}

/// One row of a listtransactions-style reply.
#[derive(Clone, Debug, Serialize)]
pub struct ListTxItem {
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub category: String,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    pub confirmations: i64,
    pub txid: String,
    pub time: i64,
    pub timereceived: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<String>,
}

/// All list items of one account, each tagged with its record's block
/// height for since-block filtering.
fn account_tx_items(account: &Account, app: &App, height: i32) -> Vec<(i32, ListTxItem)> {
    let network = app.cfg.network.as_bitcoin();
    let mut items = Vec::new();
    for record in account.store.records() {
        let txid = record.txid().to_string();
        let time = unix_time(record.received);
        let confirmations = i64::from(record.confirmations(height));
        let blockhash = record.block_hash.map(|hash| hash.to_string());

        if let Some(debits) = &record.debits {
            let address = record
                .tx
                .output
                .iter()
                .enumerate()
                .find(|(index, _)| Some(*index as u32) != debits.change_index)
                .and_then(|(_, out)| Address::from_script(&out.script_pubkey, network).ok());
            items.push((
                record.block_height,
                ListTxItem {
                    account: account.name.clone(),
                    address: address.map(|addr| addr.to_string()),
                    category: "send".into(),
                    amount: -debits.output_amount.to_btc(),
                    fee: Some(debits.fee.to_btc()),
                    confirmations,
                    txid: txid.clone(),
                    time,
                    timereceived: time,
                    blockhash: blockhash.clone(),
                },
            ));
        }

        for credit in &record.credits {
            if credit.change {
                continue;
            }
            let address = record
                .tx
                .output
                .get(credit.index as usize)
                .and_then(|out| Address::from_script(&out.script_pubkey, network).ok());
            items.push((
                record.block_height,
                ListTxItem {
                    account: account.name.clone(),
                    address: address.map(|addr| addr.to_string()),
                    category: "receive".into(),
                    amount: record.credit_amount(*credit).to_btc(),
                    fee: None,
                    confirmations,
                    txid: txid.clone(),
                    time,
                    timereceived: time,
                    blockhash: blockhash.clone(),
                },
            ));
        }
    }
    items
}
