use bitcoin::BlockHash;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::models::json_rpc::Reply;
use crate::models::json_rpc::Request;

/// A frontend request bound to its single-shot reply sink. Dropping the
/// sender without replying is how admission control signals "server busy"
/// to the connection task.
#[derive(Debug)]
pub struct ClientRequest {
    pub request: Request,
    pub websocket: bool,
    pub reply: oneshot::Sender<Reply>,
}

impl ClientRequest {
    pub fn new(request: Request, websocket: bool) -> (Self, oneshot::Receiver<Reply>) {
        let (reply, rx) = oneshot::channel();
        (
            ClientRequest {
                request,
                websocket,
                reply,
            },
            rx,
        )
    }

    /// Deliver the reply. A disconnected client discards it silently.
    pub fn respond(self, reply: Reply) {
        let _ = self.reply.send(reply);
    }
}

/// Where a received transaction was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDetails {
    pub hash: BlockHash,
    pub height: i32,
}

/// Chain-state notifications pushed by the upstream node, in emission order.
#[derive(Clone, Debug)]
pub enum UpstreamNotification {
    BlockConnected { hash: BlockHash, height: i32 },
    BlockDisconnected { hash: BlockHash, height: i32 },
    RecvTx { hex_tx: String, block: Option<BlockDetails> },
}

impl UpstreamNotification {
    /// Decode a notification envelope. Unknown methods decode to `None` and
    /// are dropped by the caller.
    pub fn from_request(request: &Request) -> Option<UpstreamNotification> {
        let params = request.params_array().ok()?;
        match request.method.as_str() {
            "blockconnected" => {
                let (hash, height) = block_params(params)?;
                Some(UpstreamNotification::BlockConnected { hash, height })
            }
            "blockdisconnected" => {
                let (hash, height) = block_params(params)?;
                Some(UpstreamNotification::BlockDisconnected { hash, height })
            }
            "recvtx" => {
                let hex_tx = params.first()?.as_str()?.to_owned();
                let block = match params.get(1) {
                    None | Some(Value::Null) => None,
                    Some(detail) => {
                        let hash = detail.get("hash")?.as_str()?.parse().ok()?;
                        let height = detail.get("height")?.as_i64()? as i32;
                        Some(BlockDetails { hash, height })
                    }
                };
                Some(UpstreamNotification::RecvTx { hex_tx, block })
            }
            _ => None,
        }
    }
}

fn block_params(params: &[Value]) -> Option<(BlockHash, i32)> {
    let hash = params.first()?.as_str()?.parse().ok()?;
    let height = params.get(1)?.as_i64()? as i32;
    Some((hash, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::json_rpc;

    #[test]
    fn decodes_blockconnected() {
        let req = json_rpc::decode(
            br#"{"method":"blockconnected","params":["000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",12],"id":null}"#,
        )
        .unwrap();
        assert!(req.is_notification());
        match UpstreamNotification::from_request(&req) {
            Some(UpstreamNotification::BlockConnected { height, .. }) => assert_eq!(height, 12),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn recvtx_without_block_is_mempool() {
        let req = json_rpc::decode(br#"{"method":"recvtx","params":["0100"],"id":null}"#).unwrap();
        match UpstreamNotification::from_request(&req) {
            Some(UpstreamNotification::RecvTx { block: None, hex_tx }) => {
                assert_eq!(hex_tx, "0100")
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_notification_is_dropped() {
        let req =
            json_rpc::decode(br#"{"method":"somethingelse","params":[],"id":null}"#).unwrap();
        assert!(UpstreamNotification::from_request(&req).is_none());
    }
}
