use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::SystemTime;

use bitcoin::Amount;
use bitcoin::BlockHash;
use bitcoin::OutPoint;
use bitcoin::Transaction;
use bitcoin::Txid;
use thiserror::Error;

/// Block height standing in for "still in the mempool".
pub const MEMPOOL_HEIGHT: i32 = -1;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TxStoreError {
    /// Evidence of dropped or reordered upstream notifications; the caller
    /// is expected to reconnect and reload accounts from disk.
    #[error("transaction store is inconsistent")]
    Inconsistent,
}

/// A wallet-owned output of a recorded transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credit {
    pub index: u32,
    pub change: bool,
}

/// The spend half of a transaction created by this wallet. A record holds at
/// most one debit set.
#[derive(Clone, Debug)]
pub struct Debits {
    pub inputs: Vec<OutPoint>,
    pub input_amount: Amount,
    pub output_amount: Amount,
    pub fee: Amount,
    pub change_index: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct TxRecord {
    pub tx: Transaction,
    pub credits: Vec<Credit>,
    pub debits: Option<Debits>,
    pub received: SystemTime,
    pub block_height: i32,
    pub block_hash: Option<BlockHash>,
}

impl TxRecord {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    pub fn is_mined(&self) -> bool {
        self.block_height != MEMPOOL_HEIGHT
    }

    pub fn confirmations(&self, current_height: i32) -> i32 {
        if self.is_mined() {
            (current_height - self.block_height + 1).max(0)
        } else {
            0
        }
    }

    pub fn credit_amount(&self, credit: Credit) -> Amount {
        self.tx
            .output
            .get(credit.index as usize)
            .map(|out| out.value)
            .unwrap_or(Amount::ZERO)
    }
}

/// In-memory transaction store for one account: wallet-relevant transaction
/// records plus the set of outpoints spent by this wallet's own debits.
#[derive(Clone, Debug, Default)]
pub struct TxStore {
    records: BTreeMap<Txid, TxRecord>,
    spent: HashSet<OutPoint>,
}

impl TxStore {
    pub fn get(&self, txid: &Txid) -> Option<&TxRecord> {
        self.records.get(txid)
    }

    pub fn records(&self) -> impl Iterator<Item = &TxRecord> {
        self.records.values()
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    /// Record one wallet-owned output. Returns whether the credit was newly
    /// added; a credit already present (for instance change recorded by the
    /// send path) reports `false` so duplicate frontend notifications can be
    /// suppressed.
    ///
    /// A confirmed credit for a record already confirmed at a different
    /// height means a block notification was dropped or reordered.
    pub fn insert_credit(
        &mut self,
        tx: &Transaction,
        index: u32,
        change: bool,
        block: Option<(i32, BlockHash)>,
    ) -> Result<bool, TxStoreError> {
        let txid = tx.compute_txid();
        let record = self.records.entry(txid).or_insert_with(|| TxRecord {
            tx: tx.clone(),
            credits: Vec::new(),
            debits: None,
            received: SystemTime::now(),
            block_height: MEMPOOL_HEIGHT,
            block_hash: None,
        });

        if let Some((height, hash)) = block {
            if record.is_mined() && record.block_height != height {
                return Err(TxStoreError::Inconsistent);
            }
            record.block_height = height;
            record.block_hash = Some(hash);
        }

        if record.credits.iter().any(|credit| credit.index == index) {
            return Ok(false);
        }
        record.credits.push(Credit { index, change });
        record.credits.sort_by_key(|credit| credit.index);
        Ok(true)
    }

    /// Record a transaction created and broadcast by this wallet, marking
    /// its inputs spent. The change output, if any, is recorded as a change
    /// credit.
    pub fn insert_send(&mut self, tx: &Transaction, debits: Debits) -> Result<(), TxStoreError> {
        let txid = tx.compute_txid();
        if self
            .records
            .get(&txid)
            .is_some_and(|record| record.debits.is_some())
        {
            return Err(TxStoreError::Inconsistent);
        }

        for outpoint in &debits.inputs {
            self.spent.insert(*outpoint);
        }
        let change_index = debits.change_index;

        let record = self.records.entry(txid).or_insert_with(|| TxRecord {
            tx: tx.clone(),
            credits: Vec::new(),
            debits: None,
            received: SystemTime::now(),
            block_height: MEMPOOL_HEIGHT,
            block_hash: None,
        });
        record.debits = Some(debits);

        if let Some(index) = change_index {
            if !record.credits.iter().any(|credit| credit.index == index) {
                record.credits.push(Credit { index, change: true });
                record.credits.sort_by_key(|credit| credit.index);
            }
        }
        Ok(())
    }

    /// Demote records mined at or above `height` back to mempool standing.
    pub fn rollback(&mut self, height: i32) {
        for record in self.records.values_mut() {
            if record.is_mined() && record.block_height >= height {
                record.block_height = MEMPOOL_HEIGHT;
                record.block_hash = None;
            }
        }
    }

    /// Unspent credits with confirmations in `[minconf, maxconf]`.
    pub fn unspent_credits(
        &self,
        minconf: i32,
        maxconf: i32,
        current_height: i32,
    ) -> Vec<(OutPoint, Amount, &TxRecord, Credit)> {
        let mut unspent = Vec::new();
        for record in self.records.values() {
            let confirmations = record.confirmations(current_height);
            if confirmations < minconf || confirmations > maxconf {
                continue;
            }
            for credit in &record.credits {
                let outpoint = OutPoint::new(record.txid(), credit.index);
                if self.spent.contains(&outpoint) {
                    continue;
                }
                unspent.push((outpoint, record.credit_amount(*credit), record, *credit));
            }
        }
        unspent.sort_by_key(|(outpoint, ..)| *outpoint);
        unspent
    }

    /// Spendable balance counting credits with at least `minconf`
    /// confirmations.
    pub fn balance(&self, minconf: i32, current_height: i32) -> Amount {
        self.unspent_credits(minconf, i32::MAX, current_height)
            .into_iter()
            .map(|(_, amount, ..)| amount)
            .sum()
    }

    /// Total received by this account at or above `minconf`, excluding
    /// change.
    pub fn total_received(&self, minconf: i32, current_height: i32) -> Amount {
        self.records
            .values()
            .filter(|record| record.confirmations(current_height) >= minconf)
            .flat_map(|record| {
                record
                    .credits
                    .iter()
                    .filter(|credit| !credit.change)
                    .map(|credit| record.credit_amount(*credit))
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::ScriptBuf;
    use bitcoin::TxOut;

    fn tx_with_outputs(sats: &[u64]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: sats
                .iter()
                .map(|value| TxOut {
                    value: Amount::from_sat(*value),
                    script_pubkey: ScriptBuf::new(),
                })
                .collect(),
        }
    }

    fn block(n: u8, height: i32) -> (i32, BlockHash) {
        (height, BlockHash::from_byte_array([n; 32]))
    }

    #[test]
    fn duplicate_credit_is_not_newly_added() {
        let mut store = TxStore::default();
        let tx = tx_with_outputs(&[1000]);
        assert!(store.insert_credit(&tx, 0, false, None).unwrap());
        assert!(!store.insert_credit(&tx, 0, false, None).unwrap());
        assert_eq!(store.records().count(), 1);
    }

    #[test]
    fn mempool_credit_promotes_to_block() {
        let mut store = TxStore::default();
        let tx = tx_with_outputs(&[1000]);
        store.insert_credit(&tx, 0, false, None).unwrap();
        assert_eq!(store.balance(1, 10), Amount::ZERO);
        assert_eq!(store.balance(0, 10), Amount::from_sat(1000));

        assert!(!store.insert_credit(&tx, 0, false, Some(block(9, 5))).unwrap());
        assert_eq!(store.balance(1, 10), Amount::from_sat(1000));
        assert_eq!(store.get(&tx.compute_txid()).unwrap().confirmations(10), 6);
    }

    #[test]
    fn conflicting_confirmation_height_is_inconsistent() {
        let mut store = TxStore::default();
        let tx = tx_with_outputs(&[1000]);
        store.insert_credit(&tx, 0, false, Some(block(9, 5))).unwrap();
        assert_eq!(
            store.insert_credit(&tx, 0, false, Some(block(8, 7))),
            Err(TxStoreError::Inconsistent)
        );
    }

    #[test]
    fn send_marks_inputs_spent_and_records_change() {
        let mut store = TxStore::default();
        let coin = tx_with_outputs(&[10_000]);
        store.insert_credit(&coin, 0, false, Some(block(1, 1))).unwrap();

        let spend = tx_with_outputs(&[7_000, 2_000]);
        let spent_op = OutPoint::new(coin.compute_txid(), 0);
        store
            .insert_send(
                &spend,
                Debits {
                    inputs: vec![spent_op],
                    input_amount: Amount::from_sat(10_000),
                    output_amount: Amount::from_sat(7_000),
                    fee: Amount::from_sat(1_000),
                    change_index: Some(1),
                },
            )
            .unwrap();

        assert!(store.is_spent(&spent_op));
        // the spent coin no longer counts; unconfirmed change does at minconf 0
        assert_eq!(store.balance(0, 1), Amount::from_sat(2_000));
        // change is excluded from received totals
        assert_eq!(store.total_received(0, 1), Amount::from_sat(10_000));
    }

    #[test]
    fn rollback_demotes_to_mempool() {
        let mut store = TxStore::default();
        let tx = tx_with_outputs(&[1000]);
        store.insert_credit(&tx, 0, false, Some(block(3, 8))).unwrap();
        store.rollback(8);
        let record = store.get(&tx.compute_txid()).unwrap();
        assert!(!record.is_mined());
        assert_eq!(record.block_hash, None);
    }
}
