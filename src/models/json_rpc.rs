use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

// JSON-RPC error space.
pub const ERR_PARSE: i32 = -32700;
pub const ERR_INVALID_REQUEST: i32 = -32600;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_INTERNAL: i32 = -32603;
pub const ERR_SERVER_BUSY: i32 = -32000;

// Domain error space, matching the bitcoind dialect.
pub const ERR_WALLET: i32 = -4;
pub const ERR_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const ERR_INVALID_ACCOUNT_NAME: i32 = -11;
pub const ERR_KEYPOOL_RAN_OUT: i32 = -12;
pub const ERR_UNLOCK_NEEDED: i32 = -13;
pub const ERR_PASSPHRASE_INCORRECT: i32 = -14;
pub const ERR_DESERIALIZATION: i32 = -22;

/// Raw JSON encoding of the "server busy" error object. Admission-control
/// rejections splice this string into the reply envelope so an overloaded
/// server does not marshal a fresh error per dropped request.
pub const SERVER_BUSY_RAW: &str = r#"{"code":-32000,"message":"Server busy"}"#;

/// A JSON-RPC error object, used both as the error half of a response
/// envelope and as the error type of every handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ERR_PARSE, message)
    }

    pub fn method_not_found() -> Self {
        Self::new(ERR_METHOD_NOT_FOUND, "Method not found")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ERR_INTERNAL, message)
    }

    pub fn wallet(message: impl Into<String>) -> Self {
        Self::new(ERR_WALLET, message)
    }

    pub fn invalid_address_or_key() -> Self {
        Self::new(ERR_INVALID_ADDRESS_OR_KEY, "Invalid address or key")
    }

    pub fn invalid_account_name() -> Self {
        Self::new(ERR_INVALID_ACCOUNT_NAME, "Invalid account name")
    }

    pub fn keypool_ran_out() -> Self {
        Self::new(ERR_KEYPOOL_RAN_OUT, "Keypool ran out")
    }

    pub fn unlock_needed() -> Self {
        Self::new(ERR_UNLOCK_NEEDED, "Enter the wallet passphrase first")
    }

    pub fn passphrase_incorrect() -> Self {
        Self::new(ERR_PASSPHRASE_INCORRECT, "The wallet passphrase is incorrect")
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(ERR_DESERIALIZATION, message)
    }

    pub fn unsupported() -> Self {
        Self::new(-1, "Request unsupported by walletd")
    }

    pub fn upstream_disconnected() -> Self {
        Self::new(ERR_INTERNAL, "upstream node disconnected")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A decoded JSON-RPC 1.0 request envelope. `id` is whatever the client
/// chose; notifications carry a null id.
#[derive(Clone, Debug, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl Request {
    /// Positional parameter list. A null or absent `params` decodes as empty.
    pub fn params_array(&self) -> Result<&[Value], RpcError> {
        match &self.params {
            Value::Null => Ok(&[]),
            Value::Array(items) => Ok(items),
            _ => Err(RpcError::invalid_params("params must be an array")),
        }
    }

    /// A request without an id is a notification and gets no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }
}

/// Decode one request envelope from a frame of bytes.
pub fn decode(bytes: &[u8]) -> Result<Request, RpcError> {
    serde_json::from_slice(bytes).map_err(|err| RpcError::parse(err.to_string()))
}

/// The reply half of a request: exactly one of a result value or an error.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Result(Value),
    Error(RpcError),
    /// A pre-encoded error object, spliced verbatim into the envelope.
    RawError(&'static str),
}

impl Reply {
    pub fn busy() -> Self {
        Reply::RawError(SERVER_BUSY_RAW)
    }
}

#[derive(Serialize)]
struct ResponseEnvelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcError>,
    id: &'a Value,
}

/// Encode a reply envelope for the given client id.
pub fn encode_reply(reply: &Reply, id: &Value) -> String {
    match reply {
        Reply::Result(value) => serde_json::to_string(&ResponseEnvelope {
            result: Some(value),
            error: None,
            id,
        })
        .expect("response envelope serializes"),
        Reply::Error(err) => serde_json::to_string(&ResponseEnvelope {
            result: None,
            error: Some(err),
            id,
        })
        .expect("response envelope serializes"),
        Reply::RawError(raw) => {
            let id = serde_json::to_string(id).expect("id serializes");
            format!(r#"{{"error":{raw},"id":{id}}}"#)
        }
    }
}

/// Encode a request envelope (used for upstream-bound requests).
pub fn encode_request(method: &str, params: &Value, id: &Value) -> String {
    serde_json::to_string(&serde_json::json!({
        "method": method,
        "params": params,
        "id": id,
    }))
    .expect("request envelope serializes")
}

/// Encode a server-push notification envelope (null id).
pub fn encode_notification(method: &str, params: Value) -> String {
    serde_json::to_string(&serde_json::json!({
        "method": method,
        "params": params,
        "id": Value::Null,
    }))
    .expect("notification envelope serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_positional_request() {
        let req = decode(br#"{"method":"getbalance","params":["",1],"id":42}"#).unwrap();
        assert_eq!(req.method, "getbalance");
        assert_eq!(req.params_array().unwrap().len(), 2);
        assert_eq!(req.id, json!(42));
        assert!(!req.is_notification());
    }

    #[test]
    fn missing_params_decode_as_empty() {
        let req = decode(br#"{"method":"walletlock","id":"a"}"#).unwrap();
        assert!(req.params_array().unwrap().is_empty());
    }

    #[test]
    fn malformed_framing_is_a_parse_error() {
        let err = decode(b"{nope").unwrap_err();
        assert_eq!(err.code, ERR_PARSE);
    }

    #[test]
    fn object_params_are_rejected() {
        let req = decode(br#"{"method":"x","params":{"a":1},"id":1}"#).unwrap();
        assert_eq!(
            req.params_array().unwrap_err().code,
            ERR_INVALID_PARAMS
        );
    }

    #[test]
    fn result_envelope_omits_error() {
        let encoded = encode_reply(&Reply::Result(json!(123456)), &json!("abc"));
        assert_eq!(encoded, r#"{"result":123456,"id":"abc"}"#);
    }

    #[test]
    fn error_envelope_omits_result() {
        let encoded = encode_reply(
            &Reply::Error(RpcError::method_not_found()),
            &json!(7),
        );
        assert_eq!(
            encoded,
            r#"{"error":{"code":-32601,"message":"Method not found"},"id":7}"#
        );
    }

    #[test]
    fn busy_reply_matches_the_preencoded_body() {
        let encoded = encode_reply(&Reply::busy(), &json!(42));
        assert_eq!(
            encoded,
            r#"{"error":{"code":-32000,"message":"Server busy"},"id":42}"#
        );
    }

    #[test]
    fn notification_envelope_has_null_id() {
        let encoded = encode_notification("accountbalance", json!(["", 1.5, true]));
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert!(value["id"].is_null());
        assert_eq!(value["method"], "accountbalance");
    }
}
