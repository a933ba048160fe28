//! Message-passing registries coordinating send/receive history ordering,
//! duplicate mempool notifications, and per-block balance announcement.
//!
//! Each registry is a single task owning a private map; handles are cheap to
//! clone and communicate with the task over channels only.

pub mod block_barrier;
pub mod notified_recv;
pub mod send_sync;

pub use block_barrier::BlockBalanceBarrier;
pub use notified_recv::NotifiedRecvTxSet;
pub use send_sync::SendTxHistorySync;
