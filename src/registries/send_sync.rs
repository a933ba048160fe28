use std::collections::HashMap;

use bitcoin::Txid;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::trace;

enum SendSyncMsg {
    Add(Txid),
    Done(Txid),
    Remove(Txid),
    Query(Txid, oneshot::Sender<Option<watch::Receiver<bool>>>),
}

/// Tracks transactions created by this wallet so receive-history handlers
/// wait until the corresponding send history has been written.
///
/// An `add` is issued before the transaction is handed to the upstream node
/// for broadcast; `done` fires once send history is persisted. Entries are
/// retained after completion so late queries observe "already completed".
/// `remove` deletes an entry without signaling, for broadcasts that failed.
#[derive(Clone, Debug)]
pub struct SendTxHistorySync {
    tx: mpsc::UnboundedSender<SendSyncMsg>,
}

impl SendTxHistorySync {
    /// Spawn the registry task and return a handle to it.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut entries: HashMap<Txid, watch::Sender<bool>> = HashMap::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    SendSyncMsg::Add(txid) => {
                        trace!("tracking send history for {txid}");
                        entries.insert(txid, watch::channel(false).0);
                    }
                    SendSyncMsg::Done(txid) => {
                        if let Some(signal) = entries.get(&txid) {
                            signal.send_replace(true);
                        }
                    }
                    SendSyncMsg::Remove(txid) => {
                        entries.remove(&txid);
                    }
                    SendSyncMsg::Query(txid, reply) => {
                        let _ = reply.send(entries.get(&txid).map(watch::Sender::subscribe));
                    }
                }
            }
        });
        SendTxHistorySync { tx }
    }

    pub fn add(&self, txid: Txid) {
        let _ = self.tx.send(SendSyncMsg::Add(txid));
    }

    pub fn done(&self, txid: Txid) {
        let _ = self.tx.send(SendSyncMsg::Done(txid));
    }

    pub fn remove(&self, txid: Txid) {
        let _ = self.tx.send(SendSyncMsg::Remove(txid));
    }

    /// Look up the completion signal for a txid. `None` means this wallet
    /// never initiated the transaction.
    pub async fn query(&self, txid: Txid) -> Option<watch::Receiver<bool>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(SendSyncMsg::Query(txid, reply_tx)).ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Block until send history for `txid` has been persisted, if this
    /// wallet is writing any. Returns immediately when the txid is unknown
    /// or its entry was removed after a failed broadcast.
    pub async fn wait_for(&self, txid: Txid) {
        if let Some(mut signal) = self.query(txid).await {
            // An Err means the entry was dropped without signaling, which
            // only happens when the broadcast itself failed.
            let _ = signal.wait_for(|done| *done).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    #[tokio::test]
    async fn query_unknown_txid_is_none() {
        let registry = SendTxHistorySync::spawn();
        assert!(registry.query(txid(1)).await.is_none());
    }

    #[tokio::test]
    async fn done_releases_waiters_and_entry_is_retained() {
        let registry = SendTxHistorySync::spawn();
        registry.add(txid(2));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for(txid(2)).await })
        };

        registry.done(txid(2));
        waiter.await.unwrap();

        // observing "already completed" afterwards is valid
        let signal = registry.query(txid(2)).await.expect("entry retained");
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn remove_releases_waiters_without_signaling() {
        let registry = SendTxHistorySync::spawn();
        registry.add(txid(3));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for(txid(3)).await })
        };

        registry.remove(txid(3));
        waiter.await.unwrap();
        assert!(registry.query(txid(3)).await.is_none());
    }
}
