use std::collections::HashSet;

use bitcoin::OutPoint;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

enum NotifiedRecvMsg {
    Add(OutPoint),
    Remove(OutPoint),
    Contains(OutPoint, oneshot::Sender<bool>),
}

/// The set of credits already announced to frontends from the mempool.
///
/// When the containing transaction is later mined, the upstream node delivers
/// the same credit again; membership here tells the handler whether the
/// mempool form was already announced. The confirmed notification removes the
/// entry and proceeds normally, while a duplicate mempool delivery is
/// suppressed.
#[derive(Clone, Debug)]
pub struct NotifiedRecvTxSet {
    tx: mpsc::UnboundedSender<NotifiedRecvMsg>,
}

impl NotifiedRecvTxSet {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut set: HashSet<OutPoint> = HashSet::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    NotifiedRecvMsg::Add(outpoint) => {
                        set.insert(outpoint);
                    }
                    NotifiedRecvMsg::Remove(outpoint) => {
                        set.remove(&outpoint);
                    }
                    NotifiedRecvMsg::Contains(outpoint, reply) => {
                        let _ = reply.send(set.contains(&outpoint));
                    }
                }
            }
        });
        NotifiedRecvTxSet { tx }
    }

    pub fn add(&self, outpoint: OutPoint) {
        let _ = self.tx.send(NotifiedRecvMsg::Add(outpoint));
    }

    pub fn remove(&self, outpoint: OutPoint) {
        let _ = self.tx.send(NotifiedRecvMsg::Remove(outpoint));
    }

    pub async fn contains(&self, outpoint: OutPoint) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(NotifiedRecvMsg::Contains(outpoint, reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}
