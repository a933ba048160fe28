use std::collections::HashMap;

use bitcoin::BlockHash;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::warn;

enum BarrierMsg {
    Enter(BlockHash, oneshot::Sender<()>),
    WorkerDone(BlockHash),
    GroupFor(BlockHash, oneshot::Sender<Option<watch::Receiver<usize>>>),
    Remove(BlockHash),
}

/// Per-block wait-group over the transaction workers spawned for that block.
///
/// The block-connected handler must not announce account balances until every
/// per-transaction worker registered against the block has finished;
/// otherwise frontends would observe a partial prefix of the block's effect.
#[derive(Clone, Debug)]
pub struct BlockBalanceBarrier {
    tx: mpsc::UnboundedSender<BarrierMsg>,
}

impl BlockBalanceBarrier {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut groups: HashMap<BlockHash, watch::Sender<usize>> = HashMap::new();
            while let Some(msg) = rx.recv().await {
                match msg {
                    BarrierMsg::Enter(block, ack) => {
                        let group = groups.entry(block).or_insert_with(|| watch::channel(0).0);
                        group.send_modify(|count| *count += 1);
                        let _ = ack.send(());
                    }
                    BarrierMsg::WorkerDone(block) => match groups.get(&block) {
                        Some(group) => group.send_modify(|count| {
                            *count = count.saturating_sub(1);
                        }),
                        None => warn!("worker finished for untracked block {block}"),
                    },
                    BarrierMsg::GroupFor(block, reply) => {
                        let _ = reply.send(groups.get(&block).map(watch::Sender::subscribe));
                    }
                    BarrierMsg::Remove(block) => {
                        groups.remove(&block);
                    }
                }
            }
        });
        BlockBalanceBarrier { tx }
    }

    /// Register one worker against `block`. Completes only after the counter
    /// is incremented, so the worker may be scheduled without racing the
    /// block-connected waiter.
    pub async fn enter(&self, block: BlockHash) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(BarrierMsg::Enter(block, ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Mark one worker for `block` as finished.
    pub fn worker_done(&self, block: BlockHash) {
        let _ = self.tx.send(BarrierMsg::WorkerDone(block));
    }

    /// Wait until all workers registered against `block` have finished, then
    /// drop the entry. Returns immediately when no worker was ever
    /// registered.
    pub async fn wait_idle(&self, block: BlockHash) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(BarrierMsg::GroupFor(block, reply_tx)).is_err() {
            return;
        }
        if let Ok(Some(mut group)) = reply_rx.await {
            let _ = group.wait_for(|count| *count == 0).await;
            let _ = self.tx.send(BarrierMsg::Remove(block));
        }
    }
}
