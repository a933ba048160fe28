//! The account manager facade: account lookup, balances, key access, and
//! transaction construction, all behind one exclusive async lock.

pub mod account;
pub mod txstore;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::Message;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::BlockHash;
use bitcoin::EcdsaSighashType;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use bitcoin::Witness;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tracing::debug;

use crate::config_models::network::Network;
use crate::wallet::account::Account;
use crate::wallet::account::KeyEntry;
use crate::wallet::txstore::Debits;
use crate::wallet::txstore::TxStoreError;

const DUST_LIMIT: Amount = Amount::from_sat(546);
const DEFAULT_FEE_INCREMENT: Amount = Amount::from_sat(10_000);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet is locked")]
    Locked,
    #[error("account not found")]
    NotFound,
    #[error("wallet already exists")]
    WalletExists,
    #[error("key already held by the wallet")]
    DuplicateKey,
    #[error("wrong wallet passphrase")]
    WrongPassphrase,
    #[error("keypool exhausted")]
    KeypoolExhausted,
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("invalid address or key")]
    InvalidAddress,
    #[error("cannot write account: {0}")]
    Flush(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Store(#[from] TxStoreError),
}

/// The most recently connected block, `height == -1` before any block is
/// known.
#[derive(Clone, Copy, Debug)]
pub struct BlockStamp {
    pub height: i32,
    pub hash: Option<BlockHash>,
}

impl Default for BlockStamp {
    fn default() -> Self {
        BlockStamp {
            height: txstore::MEMPOOL_HEIGHT,
            hash: None,
        }
    }
}

/// A transaction built by `tx_to_pairs`, ready for broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedTx {
    pub tx: Transaction,
    pub inputs: Vec<OutPoint>,
    pub input_amount: Amount,
    pub output_amount: Amount,
    pub fee: Amount,
    pub change_address: Option<Address>,
    pub change_index: Option<u32>,
}

impl CreatedTx {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn debits(&self) -> Debits {
        Debits {
            inputs: self.inputs.clone(),
            input_amount: self.input_amount,
            output_amount: self.output_amount,
            fee: self.fee,
            change_index: self.change_index,
        }
    }
}

/// Address ownership information, for validation and signing lookups.
pub enum AddressInfo<'a> {
    Key { account: &'a str, entry: &'a KeyEntry },
    Script { account: &'a str, script: &'a ScriptBuf },
}

/// Owner of every account, the disk-writer schedule, and the last persisted
/// snapshot each account reloads from after a store inconsistency.
#[derive(Clone, Debug)]
pub struct AccountManager {
    network: Network,
    keypool_size: u32,
    disallow_free: bool,
    fee_increment: Amount,
    accounts: BTreeMap<String, Account>,
    persisted: BTreeMap<String, Account>,
    dirty_wallets: BTreeSet<String>,
    dirty_stores: BTreeSet<String>,
    passphrase_check: Option<sha256d::Hash>,
    cur_block: BlockStamp,
    #[cfg(test)]
    pub(crate) fail_flushes: bool,
}

impl AccountManager {
    pub fn new(network: Network, keypool_size: u32, disallow_free: bool) -> AccountManager {
        AccountManager {
            network,
            keypool_size,
            disallow_free,
            fee_increment: DEFAULT_FEE_INCREMENT,
            accounts: BTreeMap::new(),
            persisted: BTreeMap::new(),
            dirty_wallets: BTreeSet::new(),
            dirty_stores: BTreeSet::new(),
            passphrase_check: None,
            cur_block: BlockStamp::default(),
            #[cfg(test)]
            fail_flushes: false,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn keypool_size(&self) -> u32 {
        self.keypool_size
    }

    pub fn cur_block(&self) -> BlockStamp {
        self.cur_block
    }

    pub fn set_cur_block(&mut self, height: i32, hash: BlockHash) {
        self.cur_block = BlockStamp {
            height,
            hash: Some(hash),
        };
    }

    pub fn fee_increment(&self) -> Amount {
        self.fee_increment
    }

    pub fn set_fee_increment(&mut self, fee: Amount) {
        self.fee_increment = fee;
    }

    /// Create the default account protected by `passphrase`. Refuses when a
    /// wallet already exists.
    pub fn create_encrypted_wallet(&mut self, passphrase: &str) -> Result<(), WalletError> {
        if !self.accounts.is_empty() {
            return Err(WalletError::WalletExists);
        }
        self.passphrase_check = Some(sha256d::Hash::hash(passphrase.as_bytes()));
        let mut account = Account::new("", self.network, self.keypool_size);
        account.lock();
        self.accounts.insert(String::new(), account);
        self.flush_all()
    }

    pub fn account(&self, name: &str) -> Result<&Account, WalletError> {
        self.accounts.get(name).ok_or(WalletError::NotFound)
    }

    pub fn account_mut(&mut self, name: &str) -> Result<&mut Account, WalletError> {
        self.accounts.get_mut(name).ok_or(WalletError::NotFound)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    pub fn account_by_address(&self, address: &Address) -> Option<&Account> {
        self.accounts
            .values()
            .find(|account| account.owns_address(address))
    }

    pub fn address_info(&self, address: &Address) -> Option<AddressInfo<'_>> {
        for account in self.accounts.values() {
            if let Some(entry) = account.key_for_address(address) {
                return Some(AddressInfo::Key {
                    account: &account.name,
                    entry,
                });
            }
            if let Some(script) = account.script_for_address(address) {
                return Some(AddressInfo::Script {
                    account: &account.name,
                    script,
                });
            }
        }
        None
    }

    pub fn calculate_balance(&self, name: &str, minconf: i32) -> Result<Amount, WalletError> {
        let account = self.account(name)?;
        Ok(account.store.balance(minconf, self.cur_block.height))
    }

    /// Account name to balance mapping at the given confirmation depth.
    pub fn list_accounts(&self, minconf: i32) -> BTreeMap<String, Amount> {
        self.accounts
            .values()
            .map(|account| {
                (
                    account.name.clone(),
                    account.store.balance(minconf, self.cur_block.height),
                )
            })
            .collect()
    }

    pub fn dump_wif_private_key(&self, address: &Address) -> Result<String, WalletError> {
        match self.address_info(address) {
            Some(AddressInfo::Key { account, entry }) => {
                if self.account(account)?.is_locked() {
                    return Err(WalletError::Locked);
                }
                Ok(entry.private.to_wif())
            }
            _ => Err(WalletError::InvalidAddress),
        }
    }

    pub fn unlock_wallets(&mut self, passphrase: &str) -> Result<(), WalletError> {
        match self.passphrase_check {
            Some(check) if check == sha256d::Hash::hash(passphrase.as_bytes()) => {
                for account in self.accounts.values_mut() {
                    account.unlock();
                }
                Ok(())
            }
            Some(_) => Err(WalletError::WrongPassphrase),
            None => Err(WalletError::Internal("wallet is not encrypted".into())),
        }
    }

    /// Lock every account. Locking an already-locked wallet is a no-op.
    pub fn lock_wallets(&mut self) {
        for account in self.accounts.values_mut() {
            account.lock();
        }
    }

    pub fn any_unlocked(&self) -> bool {
        self.accounts.values().any(|account| !account.is_locked())
    }

    pub fn change_passphrase(&mut self, old: &str, new: &str) -> Result<(), WalletError> {
        match self.passphrase_check {
            Some(check) if check == sha256d::Hash::hash(old.as_bytes()) => {
                self.passphrase_check = Some(sha256d::Hash::hash(new.as_bytes()));
                self.lock_wallets();
                Ok(())
            }
            Some(_) => Err(WalletError::WrongPassphrase),
            None => Err(WalletError::Internal("wallet is not encrypted".into())),
        }
    }

    pub fn schedule_wallet_write(&mut self, name: &str) {
        self.dirty_wallets.insert(name.to_owned());
    }

    pub fn schedule_txstore_write(&mut self, name: &str) {
        self.dirty_stores.insert(name.to_owned());
    }

    /// Persist one account: its snapshot becomes the state `open_accounts`
    /// restores after a store inconsistency.
    pub fn flush_account(&mut self, name: &str) -> Result<(), WalletError> {
        #[cfg(test)]
        if self.fail_flushes {
            return Err(WalletError::Flush("disk full".into()));
        }
        let account = self.accounts.get(name).ok_or(WalletError::NotFound)?;
        self.persisted.insert(name.to_owned(), account.clone());
        self.dirty_wallets.remove(name);
        self.dirty_stores.remove(name);
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<(), WalletError> {
        let names: Vec<String> = self.accounts.keys().cloned().collect();
        for name in names {
            self.flush_account(&name)?;
        }
        Ok(())
    }

    /// Undo the effect of blocks at or above `height` after a disconnect;
    /// affected records fall back to mempool standing.
    pub fn rollback(&mut self, height: i32) {
        for account in self.accounts.values_mut() {
            account.store.rollback(height);
        }
        self.cur_block = BlockStamp {
            height: height - 1,
            hash: None,
        };
    }

    /// Reload every account from its last persisted snapshot, discarding
    /// unflushed in-memory state.
    pub fn open_accounts(&mut self) {
        debug!("reopening accounts from last persisted state");
        self.accounts = self.persisted.clone();
        self.dirty_wallets.clear();
        self.dirty_stores.clear();
    }

    /// Build a signed transaction paying `pairs` from `name`, selecting
    /// unspent credits with at least `minconf` confirmations. The result has
    /// not been recorded in the transaction store; that happens only after a
    /// successful broadcast.
    pub fn tx_to_pairs(
        &mut self,
        name: &str,
        pairs: &[(String, f64)],
        minconf: i32,
    ) -> Result<CreatedTx, WalletError> {
        let current_height = self.cur_block.height;
        let network = self.network;
        let fee_increment = self.fee_increment;
        let disallow_free = self.disallow_free;

        let account = self.account_mut(name)?;
        if account.is_locked() {
            return Err(WalletError::Locked);
        }

        let mut outputs = Vec::with_capacity(pairs.len() + 1);
        let mut target = Amount::ZERO;
        for (address, btc) in pairs {
            if *btc <= 0.0 {
                return Err(WalletError::NonPositiveAmount);
            }
            let amount =
                Amount::from_btc(*btc).map_err(|_| WalletError::NonPositiveAmount)?;
            let address = address
                .parse::<Address<NetworkUnchecked>>()
                .ok()
                .and_then(|addr| addr.require_network(network.as_bitcoin()).ok())
                .ok_or(WalletError::InvalidAddress)?;
            target += amount;
            outputs.push(TxOut {
                value: amount,
                script_pubkey: address.script_pubkey(),
            });
        }

        // Coin selection over credits this account holds the keys for,
        // recomputing the fee as inputs are added.
        let spendable: Vec<(OutPoint, Amount, ScriptBuf)> = account
            .store
            .unspent_credits(minconf, i32::MAX, current_height)
            .into_iter()
            .filter_map(|(outpoint, amount, record, credit)| {
                let script = record.tx.output[credit.index as usize].script_pubkey.clone();
                account.key_for_script(&script)?;
                Some((outpoint, amount, script))
            })
            .collect();

        let mut selected: Vec<(OutPoint, Amount, ScriptBuf)> = Vec::new();
        let mut selected_amount = Amount::ZERO;
        let mut spendable_iter = spendable.into_iter();
        let fee = loop {
            let fee = estimate_fee(
                fee_increment,
                disallow_free,
                selected.len(),
                outputs.len() + 1,
            );
            if selected_amount >= target + fee && !selected.is_empty() {
                break fee;
            }
            match spendable_iter.next() {
                Some(utxo) => {
                    selected_amount += utxo.1;
                    selected.push(utxo);
                }
                None => return Err(WalletError::InsufficientFunds),
            }
        };

        let change = selected_amount - target - fee;
        let (change_address, change_index) = if change > DUST_LIMIT {
            let address = account.new_change_address()?;
            outputs.push(TxOut {
                value: change,
                script_pubkey: address.script_pubkey(),
            });
            (Some(address), Some(outputs.len() as u32 - 1))
        } else {
            (None, None)
        };

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|(outpoint, ..)| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs,
        };

        let secp = Secp256k1::new();
        let mut script_sigs = Vec::with_capacity(selected.len());
        {
            let cache = SighashCache::new(&tx);
            for (index, (_, _, prev_script)) in selected.iter().enumerate() {
                let entry = account
                    .key_for_script(prev_script)
                    .ok_or_else(|| WalletError::Internal("missing key for selected coin".into()))?;
                let sighash = cache
                    .legacy_signature_hash(index, prev_script, EcdsaSighashType::All.to_u32())
                    .map_err(|err| WalletError::Internal(err.to_string()))?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_ecdsa(&message, &entry.private.inner);
                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
                script_sigs.push(p2pkh_script_sig(&sig_bytes, &entry.public.to_bytes())?);
            }
        }
        for (txin, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            txin.script_sig = script_sig;
        }

        Ok(CreatedTx {
            inputs: selected.iter().map(|(outpoint, ..)| *outpoint).collect(),
            input_amount: selected_amount,
            output_amount: target,
            fee,
            change_address,
            change_index,
            tx,
        })
    }

    /// Record a broadcast transaction's debits (and change credit) in the
    /// account's store.
    pub fn record_send(&mut self, name: &str, created: &CreatedTx) -> Result<(), WalletError> {
        let account = self.account_mut(name)?;
        account.store.insert_send(&created.tx, created.debits())?;
        Ok(())
    }
}

fn p2pkh_script_sig(sig_bytes: &[u8], pubkey_bytes: &[u8]) -> Result<ScriptBuf, WalletError> {
    let sig = PushBytesBuf::try_from(sig_bytes.to_vec())
        .map_err(|err| WalletError::Internal(err.to_string()))?;
    let pubkey = PushBytesBuf::try_from(pubkey_bytes.to_vec())
        .map_err(|err| WalletError::Internal(err.to_string()))?;
    Ok(Builder::new().push_slice(sig).push_slice(pubkey).into_script())
}

fn estimate_fee(increment: Amount, disallow_free: bool, inputs: usize, outputs: usize) -> Amount {
    let size = 10 + 148 * inputs as u64 + 34 * outputs as u64;
    let kb = size.div_ceil(1000);
    let fee = increment * kb;
    if disallow_free && fee == Amount::ZERO {
        Amount::from_sat(1000)
    } else {
        fee
    }
}

/// The exclusive account-manager lock. Exactly one handler may mutate
/// account state at any instant; handlers release the guard before awaiting
/// upstream replies and re-acquire it afterwards.
#[derive(Clone, Debug)]
pub struct AccountManagerLock {
    inner: Arc<Mutex<AccountManager>>,
}

impl AccountManagerLock {
    pub fn new(manager: AccountManager) -> Self {
        AccountManagerLock {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    pub async fn lock_guard(&self) -> MutexGuard<'_, AccountManager> {
        self.inner.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::txstore::MEMPOOL_HEIGHT;

    fn funded_manager() -> AccountManager {
        let mut manager = AccountManager::new(Network::Testnet3, 4, false);
        manager.create_encrypted_wallet("hunter2").unwrap();
        manager.unlock_wallets("hunter2").unwrap();
        manager.set_cur_block(100, BlockHash::all_zeros());

        // fund the default account with one mature coin
        let address = manager.account_mut("").unwrap().new_address().unwrap();
        let coinbase = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_btc(1.0).unwrap(),
                script_pubkey: address.script_pubkey(),
            }],
        };
        let account = manager.account_mut("").unwrap();
        account
            .store
            .insert_credit(&coinbase, 0, false, Some((50, BlockHash::all_zeros())))
            .unwrap();
        manager
    }

    #[test]
    fn create_wallet_twice_reports_exists() {
        let mut manager = AccountManager::new(Network::Testnet3, 2, false);
        manager.create_encrypted_wallet("pw").unwrap();
        assert_eq!(
            manager.create_encrypted_wallet("pw"),
            Err(WalletError::WalletExists)
        );
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let mut manager = AccountManager::new(Network::Testnet3, 2, false);
        manager.create_encrypted_wallet("pw").unwrap();
        assert_eq!(
            manager.unlock_wallets("nope"),
            Err(WalletError::WrongPassphrase)
        );
        assert!(manager.unlock_wallets("pw").is_ok());
        assert!(manager.any_unlocked());
    }

    #[test]
    fn change_passphrase_locks_immediately() {
        let mut manager = AccountManager::new(Network::Testnet3, 2, false);
        manager.create_encrypted_wallet("old").unwrap();
        manager.unlock_wallets("old").unwrap();
        manager.change_passphrase("old", "new").unwrap();
        assert!(!manager.any_unlocked());
        assert_eq!(
            manager.unlock_wallets("old"),
            Err(WalletError::WrongPassphrase)
        );
        assert!(manager.unlock_wallets("new").is_ok());
    }

    #[test]
    fn tx_to_pairs_builds_change_and_fee() {
        let mut manager = funded_manager();
        let dest = Account::new("other", Network::Testnet3, 1)
            .new_address()
            .unwrap();
        let created = manager
            .tx_to_pairs("", &[(dest.to_string(), 0.25)], 1)
            .unwrap();

        assert_eq!(created.inputs.len(), 1);
        assert_eq!(created.output_amount, Amount::from_btc(0.25).unwrap());
        assert!(created.change_address.is_some());
        let change_index = created.change_index.unwrap() as usize;
        assert_eq!(
            created.tx.output[change_index].value,
            created.input_amount - created.output_amount - created.fee
        );
        // inputs are signed
        assert!(created.tx.input.iter().all(|txin| !txin.script_sig.is_empty()));
    }

    #[test]
    fn tx_to_pairs_rejects_non_positive_amounts() {
        let mut manager = funded_manager();
        let err = manager
            .tx_to_pairs("", &[("whatever".into(), 0.0)], 1)
            .unwrap_err();
        assert_eq!(err, WalletError::NonPositiveAmount);
    }

    #[test]
    fn tx_to_pairs_needs_unlocked_wallet() {
        let mut manager = funded_manager();
        manager.lock_wallets();
        let dest = Account::new("other", Network::Testnet3, 1)
            .new_address()
            .unwrap();
        assert_eq!(
            manager.tx_to_pairs("", &[(dest.to_string(), 0.1)], 1),
            Err(WalletError::Locked)
        );
    }

    #[test]
    fn insufficient_funds_at_high_minconf() {
        let mut manager = funded_manager();
        let dest = Account::new("other", Network::Testnet3, 1)
            .new_address()
            .unwrap();
        // the only credit has ~51 confirmations
        assert_eq!(
            manager.tx_to_pairs("", &[(dest.to_string(), 0.1)], 1000),
            Err(WalletError::InsufficientFunds)
        );
    }

    #[test]
    fn open_accounts_restores_last_flushed_snapshot() {
        let mut manager = funded_manager();
        manager.flush_all().unwrap();
        let balance_before = manager.calculate_balance("", 0).unwrap();

        // unflushed mutation
        let tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(5_000),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let account = manager.account_mut("").unwrap();
        account.store.insert_credit(&tx, 0, false, None).unwrap();
        assert_ne!(manager.calculate_balance("", 0).unwrap(), balance_before);

        manager.open_accounts();
        assert_eq!(manager.calculate_balance("", 0).unwrap(), balance_before);
        assert_eq!(manager.cur_block().height, 100);
        assert_ne!(manager.cur_block().height, MEMPOOL_HEIGHT);
    }
}
