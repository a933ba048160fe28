use serde::Deserialize;
use serde_json::Value;

use crate::models::json_rpc::RpcError;

/// Standard bitcoind methods handled locally.
pub const STANDARD_METHODS: &[&str] = &[
    "addmultisigaddress",
    "createmultisig",
    "dumpprivkey",
    "getaccount",
    "getaccountaddress",
    "getaddressesbyaccount",
    "getbalance",
    "getinfo",
    "getnewaddress",
    "getrawchangeaddress",
    "getreceivedbyaccount",
    "gettransaction",
    "importprivkey",
    "keypoolrefill",
    "listaccounts",
    "listsinceblock",
    "listtransactions",
    "listunspent",
    "sendfrom",
    "sendmany",
    "sendtoaddress",
    "settxfee",
    "signmessage",
    "signrawtransaction",
    "validateaddress",
    "verifymessage",
    "walletlock",
    "walletpassphrase",
    "walletpassphrasechange",
    // extension not exclusive to websocket connections
    "createencryptedwallet",
];

/// Standard bitcoind methods recognized but not implemented; these reply
/// with a method-not-found error rather than being forwarded upstream.
pub const UNIMPLEMENTED_METHODS: &[&str] = &[
    "backupwallet",
    "dumpwallet",
    "getblocktemplate",
    "getreceivedbyaddress",
    "gettxout",
    "gettxoutsetinfo",
    "getwork",
    "importwallet",
    "listaddressgroupings",
    "listlockunspent",
    "listreceivedbyaccount",
    "listreceivedbyaddress",
    "lockunspent",
    "move",
    "setaccount",
    "stop",
];

/// Methods which will never be supported due to design differences.
pub const UNSUPPORTED_METHODS: &[&str] = &["encryptwallet"];

/// Extensions exclusive to websocket connections.
pub const WS_METHODS: &[&str] = &[
    "exportwatchingwallet",
    "getaddressbalance",
    "getunconfirmedbalance",
    "listaddresstransactions",
    "listalltransactions",
    "recoveraddresses",
    "walletislocked",
];

/// How the gateway routes a method name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodClass {
    /// Handled locally for any connection.
    Standard,
    /// Handled locally only over websocket connections.
    WsOnly,
    /// Forwarded to the upstream node.
    Unknown,
}

pub fn classify(method: &str) -> MethodClass {
    if STANDARD_METHODS.contains(&method)
        || UNIMPLEMENTED_METHODS.contains(&method)
        || UNSUPPORTED_METHODS.contains(&method)
    {
        MethodClass::Standard
    } else if WS_METHODS.contains(&method) {
        MethodClass::WsOnly
    } else {
        MethodClass::Unknown
    }
}

/// A supplemental input for signrawtransaction.
#[derive(Clone, Debug, Deserialize)]
pub struct PrevInput {
    pub txid: String,
    pub vout: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: String,
    #[serde(rename = "redeemScript", default)]
    pub redeem_script: Option<String>,
}

/// A decoded wallet request. Decoding both parses the parameters and selects
/// the handler, so dispatch is an exhaustive match with no "wrong command
/// type" escape hatch.
#[derive(Clone, Debug)]
pub enum WalletCommand {
    AddMultiSigAddress { n_required: usize, keys: Vec<String>, account: String },
    CreateMultiSig { n_required: usize, keys: Vec<String> },
    DumpPrivKey { address: String },
    GetAccount { address: String },
    GetAccountAddress { account: String },
    GetAddressesByAccount { account: String },
    GetBalance { account: String, minconf: i32 },
    GetInfo,
    GetNewAddress { account: String },
    GetRawChangeAddress { account: String },
    GetReceivedByAccount { account: String, minconf: i32 },
    GetTransaction { txid: String },
    ImportPrivKey { wif: String, account: String, rescan: bool },
    KeypoolRefill,
    ListAccounts { minconf: i32 },
    ListSinceBlock { block_hash: String, target_confirmations: i32 },
    ListTransactions { account: String, count: usize, from: usize },
    ListUnspent { minconf: i32, maxconf: i32, addresses: Vec<String> },
    SendFrom { from_account: String, to_address: String, amount: f64, minconf: i32 },
    SendMany { from_account: String, amounts: Vec<(String, f64)>, minconf: i32 },
    SendToAddress { address: String, amount: f64 },
    SetTxFee { amount: f64 },
    SignMessage { address: String, message: String },
    SignRawTransaction {
        raw_tx: String,
        inputs: Vec<PrevInput>,
        priv_keys: Vec<String>,
        flags: Option<String>,
    },
    ValidateAddress { address: String },
    VerifyMessage { address: String, signature: String, message: String },
    WalletLock,
    WalletPassphrase { passphrase: String, timeout: u64 },
    WalletPassphraseChange { old: String, new: String },
    CreateEncryptedWallet { passphrase: String },

    // websocket extensions
    ExportWatchingWallet { account: String, download: bool },
    GetAddressBalance { address: String, minconf: i32 },
    GetUnconfirmedBalance { account: String },
    ListAddressTransactions { addresses: Vec<String>, account: String },
    ListAllTransactions { account: String },
    RecoverAddresses { account: String, n: u32 },
    WalletIsLocked { account: String },

    /// Recognized but deliberately not implemented; replies method-not-found.
    Unimplemented,
    /// Never supported by this wallet; replies a fixed error.
    Unsupported,
}

impl WalletCommand {
    /// Decode a method and its positional parameters. Websocket-only methods
    /// over a non-websocket connection fall through to `Unimplemented`.
    pub fn parse(method: &str, params: &[Value], websocket: bool) -> Result<Self, RpcError> {
        if UNIMPLEMENTED_METHODS.contains(&method) {
            return Ok(WalletCommand::Unimplemented);
        }
        if UNSUPPORTED_METHODS.contains(&method) {
            return Ok(WalletCommand::Unsupported);
        }
        if WS_METHODS.contains(&method) && !websocket {
            return Ok(WalletCommand::Unimplemented);
        }

        let cmd = match method {
            "addmultisigaddress" => WalletCommand::AddMultiSigAddress {
                n_required: usize_at(params, 0, "nrequired")?,
                keys: string_vec_at(params, 1, "keys")?,
                account: opt_string_at(params, 2, "account")?.unwrap_or_default(),
            },
            "createmultisig" => WalletCommand::CreateMultiSig {
                n_required: usize_at(params, 0, "nrequired")?,
                keys: string_vec_at(params, 1, "keys")?,
            },
            "dumpprivkey" => WalletCommand::DumpPrivKey {
                address: string_at(params, 0, "address")?,
            },
            "getaccount" => WalletCommand::GetAccount {
                address: string_at(params, 0, "address")?,
            },
            "getaccountaddress" => WalletCommand::GetAccountAddress {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
            },
            "getaddressesbyaccount" => WalletCommand::GetAddressesByAccount {
                account: string_at(params, 0, "account")?,
            },
            "getbalance" => WalletCommand::GetBalance {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
                minconf: opt_i32_at(params, 1, "minconf")?.unwrap_or(1),
            },
            "getinfo" => WalletCommand::GetInfo,
            "getnewaddress" => WalletCommand::GetNewAddress {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
            },
            "getrawchangeaddress" => WalletCommand::GetRawChangeAddress {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
            },
            "getreceivedbyaccount" => WalletCommand::GetReceivedByAccount {
                account: string_at(params, 0, "account")?,
                minconf: opt_i32_at(params, 1, "minconf")?.unwrap_or(1),
            },
            "gettransaction" => WalletCommand::GetTransaction {
                txid: string_at(params, 0, "txid")?,
            },
            "importprivkey" => WalletCommand::ImportPrivKey {
                wif: string_at(params, 0, "privkey")?,
                account: opt_string_at(params, 1, "label")?.unwrap_or_default(),
                rescan: opt_bool_at(params, 2, "rescan")?.unwrap_or(true),
            },
            "keypoolrefill" => WalletCommand::KeypoolRefill,
            "listaccounts" => WalletCommand::ListAccounts {
                minconf: opt_i32_at(params, 0, "minconf")?.unwrap_or(1),
            },
            "listsinceblock" => WalletCommand::ListSinceBlock {
                block_hash: opt_string_at(params, 0, "blockhash")?.unwrap_or_default(),
                target_confirmations: opt_i32_at(params, 1, "targetconfirmations")?.unwrap_or(1),
            },
            "listtransactions" => WalletCommand::ListTransactions {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
                count: opt_usize_at(params, 1, "count")?.unwrap_or(10),
                from: opt_usize_at(params, 2, "from")?.unwrap_or(0),
            },
            "listunspent" => WalletCommand::ListUnspent {
                minconf: opt_i32_at(params, 0, "minconf")?.unwrap_or(1),
                maxconf: opt_i32_at(params, 1, "maxconf")?.unwrap_or(999_999),
                addresses: opt_string_vec_at(params, 2, "addresses")?.unwrap_or_default(),
            },
            "sendfrom" => WalletCommand::SendFrom {
                from_account: string_at(params, 0, "fromaccount")?,
                to_address: string_at(params, 1, "toaddress")?,
                amount: f64_at(params, 2, "amount")?,
                minconf: opt_i32_at(params, 3, "minconf")?.unwrap_or(1),
            },
            "sendmany" => WalletCommand::SendMany {
                from_account: string_at(params, 0, "fromaccount")?,
                amounts: amounts_at(params, 1)?,
                minconf: opt_i32_at(params, 2, "minconf")?.unwrap_or(1),
            },
            "sendtoaddress" => WalletCommand::SendToAddress {
                address: string_at(params, 0, "address")?,
                amount: f64_at(params, 1, "amount")?,
            },
            "settxfee" => WalletCommand::SetTxFee {
                amount: f64_at(params, 0, "amount")?,
            },
            "signmessage" => WalletCommand::SignMessage {
                address: string_at(params, 0, "address")?,
                message: string_at(params, 1, "message")?,
            },
            "signrawtransaction" => WalletCommand::SignRawTransaction {
                raw_tx: string_at(params, 0, "rawtx")?,
                inputs: match params.get(1) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(value) => serde_json::from_value(value.clone())
                        .map_err(|err| RpcError::invalid_params(err.to_string()))?,
                },
                priv_keys: opt_string_vec_at(params, 2, "privkeys")?.unwrap_or_default(),
                flags: opt_string_at(params, 3, "flags")?,
            },
            "validateaddress" => WalletCommand::ValidateAddress {
                address: string_at(params, 0, "address")?,
            },
            "verifymessage" => WalletCommand::VerifyMessage {
                address: string_at(params, 0, "address")?,
                signature: string_at(params, 1, "signature")?,
                message: string_at(params, 2, "message")?,
            },
            "walletlock" => WalletCommand::WalletLock,
            "walletpassphrase" => WalletCommand::WalletPassphrase {
                passphrase: string_at(params, 0, "passphrase")?,
                timeout: usize_at(params, 1, "timeout")? as u64,
            },
            "walletpassphrasechange" => WalletCommand::WalletPassphraseChange {
                old: string_at(params, 0, "oldpassphrase")?,
                new: string_at(params, 1, "newpassphrase")?,
            },
            "createencryptedwallet" => WalletCommand::CreateEncryptedWallet {
                passphrase: string_at(params, 0, "passphrase")?,
            },

            "exportwatchingwallet" => WalletCommand::ExportWatchingWallet {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
                download: opt_bool_at(params, 1, "download")?.unwrap_or(false),
            },
            "getaddressbalance" => WalletCommand::GetAddressBalance {
                address: string_at(params, 0, "address")?,
                minconf: opt_i32_at(params, 1, "minconf")?.unwrap_or(1),
            },
            "getunconfirmedbalance" => WalletCommand::GetUnconfirmedBalance {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
            },
            "listaddresstransactions" => WalletCommand::ListAddressTransactions {
                addresses: string_vec_at(params, 0, "addresses")?,
                account: opt_string_at(params, 1, "account")?.unwrap_or_default(),
            },
            "listalltransactions" => WalletCommand::ListAllTransactions {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
            },
            "recoveraddresses" => WalletCommand::RecoverAddresses {
                account: string_at(params, 0, "account")?,
                n: usize_at(params, 1, "n")? as u32,
            },
            "walletislocked" => WalletCommand::WalletIsLocked {
                account: opt_string_at(params, 0, "account")?.unwrap_or_default(),
            },

            // The gateway only queues known methods, but a request raced in
            // with a stale table is still answered rather than dropped.
            _ => WalletCommand::Unimplemented,
        };
        Ok(cmd)
    }
}

fn string_at(params: &[Value], idx: usize, name: &str) -> Result<String, RpcError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RpcError::invalid_params(format!("{name} parameter must be a string")))
}

fn opt_string_at(params: &[Value], idx: usize, name: &str) -> Result<Option<String>, RpcError> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RpcError::invalid_params(format!(
            "{name} parameter must be a string"
        ))),
    }
}

fn f64_at(params: &[Value], idx: usize, name: &str) -> Result<f64, RpcError> {
    params
        .get(idx)
        .and_then(Value::as_f64)
        .ok_or_else(|| RpcError::invalid_params(format!("{name} parameter must be a number")))
}

fn opt_i32_at(params: &[Value], idx: usize, name: &str) -> Result<Option<i32>, RpcError> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(|n| Some(n as i32))
            .ok_or_else(|| RpcError::invalid_params(format!("{name} parameter must be an integer"))),
    }
}

fn usize_at(params: &[Value], idx: usize, name: &str) -> Result<usize, RpcError> {
    params
        .get(idx)
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| RpcError::invalid_params(format!("{name} parameter must be an integer")))
}

fn opt_usize_at(params: &[Value], idx: usize, name: &str) -> Result<Option<usize>, RpcError> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| RpcError::invalid_params(format!("{name} parameter must be an integer"))),
    }
}

fn opt_bool_at(params: &[Value], idx: usize, name: &str) -> Result<Option<bool>, RpcError> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(RpcError::invalid_params(format!(
            "{name} parameter must be a boolean"
        ))),
    }
}

fn string_vec_at(params: &[Value], idx: usize, name: &str) -> Result<Vec<String>, RpcError> {
    let items = params
        .get(idx)
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::invalid_params(format!("{name} parameter must be an array")))?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_owned).ok_or_else(|| {
                RpcError::invalid_params(format!("{name} entries must be strings"))
            })
        })
        .collect()
}

fn opt_string_vec_at(
    params: &[Value],
    idx: usize,
    name: &str,
) -> Result<Option<Vec<String>>, RpcError> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => string_vec_at(params, idx, name).map(Some),
    }
}

fn amounts_at(params: &[Value], idx: usize) -> Result<Vec<(String, f64)>, RpcError> {
    let object = params
        .get(idx)
        .and_then(Value::as_object)
        .ok_or_else(|| RpcError::invalid_params("amounts parameter must be an object"))?;
    object
        .iter()
        .map(|(addr, amount)| {
            amount
                .as_f64()
                .map(|amt| (addr.clone(), amt))
                .ok_or_else(|| RpcError::invalid_params("amounts must be numbers"))
        })
        .collect()
}
