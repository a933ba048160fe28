use std::collections::BTreeMap;

use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::SecretKey;
use bitcoin::Address;
use bitcoin::PrivateKey;
use bitcoin::PublicKey;
use bitcoin::ScriptBuf;
use tracing::debug;

use crate::config_models::network::Network;
use crate::wallet::txstore::TxStore;
use crate::wallet::WalletError;

/// One entry of the keypool or the imported-key set.
#[derive(Clone, Debug)]
pub struct KeyEntry {
    pub private: PrivateKey,
    pub public: PublicKey,
    pub address: Address,
}

impl KeyEntry {
    fn generate(network: Network) -> KeyEntry {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let private = PrivateKey::new(secret, network.as_bitcoin());
        let public = private.public_key(&secp);
        let address = Address::p2pkh(&public, network.as_bitcoin());
        KeyEntry {
            private,
            public,
            address,
        }
    }

    pub fn from_private(private: PrivateKey, network: Network) -> KeyEntry {
        let secp = Secp256k1::new();
        let public = private.public_key(&secp);
        let address = Address::p2pkh(&public, network.as_bitcoin());
        KeyEntry {
            private,
            public,
            address,
        }
    }
}

/// A named partition of keys and transactions within the wallet.
///
/// Addresses are issued from an ordered keypool with a cursor: the current
/// address is the first pool entry not yet observed on-chain, and consuming
/// an address advances the cursor. The pool is replenished by deriving fresh
/// keys, which requires the wallet to be unlocked; while locked, issuance can
/// only proceed as long as pre-derived reserve addresses remain.
#[derive(Clone, Debug)]
pub struct Account {
    pub name: String,
    network: Network,
    keypool_size: u32,
    keypool: Vec<KeyEntry>,
    cursor: usize,
    imported: BTreeMap<String, KeyEntry>,
    scripts: BTreeMap<String, ScriptBuf>,
    locked: bool,
    pub store: TxStore,
}

impl Account {
    pub fn new(name: &str, network: Network, keypool_size: u32) -> Account {
        let keypool = (0..keypool_size)
            .map(|_| KeyEntry::generate(network))
            .collect();
        Account {
            name: name.to_owned(),
            network,
            keypool_size,
            keypool,
            cursor: 0,
            imported: BTreeMap::new(),
            scripts: BTreeMap::new(),
            locked: false,
            store: TxStore::default(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    fn replenish_keypool(&mut self) -> Result<(), WalletError> {
        if self.locked {
            return Err(WalletError::KeypoolExhausted);
        }
        debug!(account = %self.name, "extending keypool");
        for _ in 0..self.keypool_size.max(1) {
            self.keypool.push(KeyEntry::generate(self.network));
        }
        Ok(())
    }

    fn address_used(&self, address: &Address) -> bool {
        let script = address.script_pubkey();
        self.store.records().any(|record| {
            record.credits.iter().any(|credit| {
                record
                    .tx
                    .output
                    .get(credit.index as usize)
                    .is_some_and(|out| out.script_pubkey == script)
            })
        })
    }

    /// The most recently issued address, provided it has not appeared in any
    /// transaction yet; otherwise the cursor advances to the next unused
    /// reserve address.
    pub fn current_address(&mut self) -> Result<Address, WalletError> {
        loop {
            if self.cursor >= self.keypool.len() {
                self.replenish_keypool()?;
            }
            let address = self.keypool[self.cursor].address.clone();
            if !self.address_used(&address) {
                return Ok(address);
            }
            self.cursor += 1;
        }
    }

    /// Consume the current address and return it, advancing the cursor.
    pub fn new_address(&mut self) -> Result<Address, WalletError> {
        if self.cursor >= self.keypool.len() {
            self.replenish_keypool()?;
        }
        let address = self.keypool[self.cursor].address.clone();
        self.cursor += 1;
        Ok(address)
    }

    /// A fresh address for change. Change addresses come from the same pool
    /// and are consumed exactly like payment addresses.
    pub fn new_change_address(&mut self) -> Result<Address, WalletError> {
        self.new_address()
    }

    /// Import a WIF-decoded private key. Importing a key already present is
    /// a silent success.
    pub fn import_private_key(&mut self, private: PrivateKey) -> Result<Address, WalletError> {
        if self.locked {
            return Err(WalletError::Locked);
        }
        let entry = KeyEntry::from_private(private, self.network);
        let address = entry.address.clone();
        let key = address.to_string();
        if self.imported.contains_key(&key) || self.key_for_address(&address).is_some() {
            return Err(WalletError::DuplicateKey);
        }
        self.imported.insert(key, entry);
        Ok(address)
    }

    /// Import a redeem script, watching its P2SH address.
    pub fn import_script(&mut self, script: ScriptBuf) -> Result<Address, WalletError> {
        let address = Address::p2sh(&script, self.network.as_bitcoin())
            .map_err(|err| WalletError::Internal(err.to_string()))?;
        self.scripts.insert(address.to_string(), script);
        Ok(address)
    }

    pub fn key_for_address(&self, address: &Address) -> Option<&KeyEntry> {
        let needle = address.to_string();
        self.keypool
            .iter()
            .find(|entry| entry.address == *address)
            .or_else(|| self.imported.get(&needle))
    }

    pub fn script_for_address(&self, address: &Address) -> Option<&ScriptBuf> {
        self.scripts.get(&address.to_string())
    }

    /// The key whose address pays to `script`, searching the whole pool and
    /// the imported set.
    pub fn key_for_script(&self, script: &ScriptBuf) -> Option<&KeyEntry> {
        self.keypool
            .iter()
            .chain(self.imported.values())
            .find(|entry| entry.address.script_pubkey() == *script)
    }

    /// Whether this account holds the key or script behind `address`.
    pub fn owns_address(&self, address: &Address) -> bool {
        self.key_for_address(address).is_some() || self.script_for_address(address).is_some()
    }

    /// Whether `script` pays to an address of this account.
    pub fn owns_script(&self, script: &ScriptBuf) -> bool {
        self.issued_entries()
            .any(|entry| entry.address.script_pubkey() == *script)
            || self
                .scripts
                .values()
                .any(|redeem| ScriptBuf::new_p2sh(&redeem.script_hash()) == *script)
    }

    /// Key entries visible to lookups: issued pool addresses (up to and
    /// including the cursor position) plus imported keys.
    fn issued_entries(&self) -> impl Iterator<Item = &KeyEntry> {
        let issued_end = (self.cursor + 1).min(self.keypool.len());
        self.keypool[..issued_end].iter().chain(self.imported.values())
    }

    /// Sorted active payment addresses of this account.
    pub fn sorted_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .issued_entries()
            .map(|entry| entry.address.to_string())
            .chain(self.scripts.keys().cloned())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Extend the issued range by `n` further reserve addresses.
    pub fn recover_addresses(&mut self, n: u32) -> Result<(), WalletError> {
        for _ in 0..n {
            self.new_address()?;
        }
        Ok(())
    }

    /// A watching-only snapshot: addresses and scripts, no private keys.
    pub fn watching_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "account": self.name,
            "addresses": self.sorted_addresses(),
            "scripts": self
                .scripts
                .values()
                .map(|script| script.to_hex_string())
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("", Network::Testnet3, 4)
    }

    #[test]
    fn current_address_does_not_advance() {
        let mut account = account();
        let first = account.current_address().unwrap();
        assert_eq!(account.current_address().unwrap(), first);
    }

    #[test]
    fn new_address_consumes_the_cursor() {
        let mut account = account();
        let first = account.new_address().unwrap();
        let second = account.new_address().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn locked_account_issues_only_reserve_addresses() {
        let mut account = Account::new("", Network::Testnet3, 2);
        account.lock();
        account.new_address().unwrap();
        account.new_address().unwrap();
        assert!(matches!(
            account.new_address(),
            Err(WalletError::KeypoolExhausted)
        ));

        account.unlock();
        assert!(account.new_address().is_ok());
    }

    #[test]
    fn import_duplicate_key_reports_duplicate() {
        let mut account = account();
        let private = PrivateKey::new(
            SecretKey::new(&mut rand::thread_rng()),
            bitcoin::NetworkKind::Test,
        );
        account.import_private_key(private).unwrap();
        assert!(matches!(
            account.import_private_key(private),
            Err(WalletError::DuplicateKey)
        ));
    }

    #[test]
    fn import_while_locked_needs_unlock() {
        let mut account = account();
        account.lock();
        let private = PrivateKey::new(
            SecretKey::new(&mut rand::thread_rng()),
            bitcoin::NetworkKind::Test,
        );
        assert!(matches!(
            account.import_private_key(private),
            Err(WalletError::Locked)
        ));
    }
}
