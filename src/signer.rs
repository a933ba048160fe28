//! Raw-transaction signing: per-input key/script resolution, legacy sighash
//! signing for the standard script classes (P2PKH, P2PK, bare multisig, and
//! P2SH wrapping any of them), and the satisfaction re-check that decides
//! whether a transaction is complete.
//!
//! Partial signing is a first-class outcome: an input that cannot be signed
//! or whose script does not yet satisfy marks the transaction incomplete
//! without failing the call, so multi-party workflows can hand the hex to
//! the next signer.

use std::collections::HashMap;

use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::opcodes::all::OP_PUSHNUM_16;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::script::Instruction;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::All;
use bitcoin::secp256k1::Message;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::sighash::SighashCache;
use bitcoin::Address;
use bitcoin::EcdsaSighashType;
use bitcoin::OutPoint;
use bitcoin::PrivateKey;
use bitcoin::PublicKey;
use bitcoin::Script;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use thiserror::Error;
use tracing::debug;

use crate::models::json_rpc::RpcError;
use crate::wallet::AccountManager;
use crate::wallet::AddressInfo;

/// Why one input could not be signed. Per-input failures are not fatal to
/// the request; they mark the result incomplete.
#[derive(Clone, Debug, Error)]
pub enum SignError {
    #[error("no key for address {0}")]
    NoKey(String),
    #[error("no script for address {0}")]
    NoScript(String),
    #[error("address is not a pubkey address")]
    NotPubkeyAddress,
    #[error("address is not a script address")]
    NotScriptAddress,
    #[error("wallet is locked")]
    Locked,
    #[error("unsupported script class")]
    UnsupportedScript,
    #[error("{0}")]
    Sighash(String),
}

/// Where the per-input callbacks resolve keys and redeem scripts.
///
/// When the caller supplied WIF keys the signer runs in restricted mode:
/// only the supplied keys and supplied redeem scripts are usable, so
/// wallet-held keys cannot leak into a caller-driven signing session.
pub enum KeySource<'a> {
    Restricted {
        keys: HashMap<String, PrivateKey>,
        scripts: HashMap<String, ScriptBuf>,
    },
    Wallet(&'a AccountManager),
}

impl KeySource<'_> {
    fn key_for_address(&self, address: &Address) -> Result<PrivateKey, SignError> {
        match self {
            KeySource::Restricted { keys, .. } => keys
                .get(&address.to_string())
                .copied()
                .ok_or_else(|| SignError::NoKey(address.to_string())),
            KeySource::Wallet(manager) => match manager.address_info(address) {
                Some(AddressInfo::Key { account, entry }) => {
                    if manager
                        .account(account)
                        .map_err(|_| SignError::NoKey(address.to_string()))?
                        .is_locked()
                    {
                        return Err(SignError::Locked);
                    }
                    Ok(entry.private)
                }
                Some(AddressInfo::Script { .. }) => Err(SignError::NotPubkeyAddress),
                None => Err(SignError::NoKey(address.to_string())),
            },
        }
    }

    fn script_for_address(&self, address: &Address) -> Result<ScriptBuf, SignError> {
        match self {
            KeySource::Restricted { scripts, .. } => scripts
                .get(&address.to_string())
                .cloned()
                .ok_or_else(|| SignError::NoScript(address.to_string())),
            KeySource::Wallet(manager) => match manager.address_info(address) {
                Some(AddressInfo::Script { script, .. }) => Ok(script.clone()),
                Some(AddressInfo::Key { .. }) => Err(SignError::NotScriptAddress),
                None => Err(SignError::NoScript(address.to_string())),
            },
        }
    }
}

/// Translate a sighash-flags string into a sighash type.
pub fn parse_sighash_flags(flags: Option<&str>) -> Result<EcdsaSighashType, RpcError> {
    match flags.unwrap_or("ALL") {
        "ALL" => Ok(EcdsaSighashType::All),
        "NONE" => Ok(EcdsaSighashType::None),
        "SINGLE" => Ok(EcdsaSighashType::Single),
        "ALL|ANYONECANPAY" => Ok(EcdsaSighashType::AllPlusAnyoneCanPay),
        "NONE|ANYONECANPAY" => Ok(EcdsaSighashType::NonePlusAnyoneCanPay),
        "SINGLE|ANYONECANPAY" => Ok(EcdsaSighashType::SinglePlusAnyoneCanPay),
        _ => Err(RpcError::invalid_params("Invalid sighash parameter")),
    }
}

/// Build an m-of-n multisig script.
pub fn multisig_script(required: usize, pubkeys: &[PublicKey]) -> Result<ScriptBuf, RpcError> {
    if required == 0 || required > pubkeys.len() || pubkeys.len() > 16 {
        return Err(RpcError::invalid_params(
            "invalid number of required signatures",
        ));
    }
    let mut builder = Builder::new().push_int(required as i64);
    for pubkey in pubkeys {
        builder = builder.push_key(pubkey);
    }
    Ok(builder
        .push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Sign every input whose prevout script is in `prevouts`, then re-check
/// satisfaction of each input. Returns whether the transaction is complete.
///
/// Inputs with the SINGLE flag but no matching output index are left
/// untouched, per the legacy sighash rules.
pub fn sign_all_inputs(
    secp: &Secp256k1<All>,
    tx: &mut Transaction,
    hash_ty: EcdsaSighashType,
    prevouts: &HashMap<OutPoint, ScriptBuf>,
    source: &KeySource<'_>,
    network: bitcoin::Network,
) -> Result<bool, RpcError> {
    let mut complete = true;
    let output_count = tx.output.len();
    for index in 0..tx.input.len() {
        let outpoint = tx.input[index].previous_output;
        let prev_script = prevouts.get(&outpoint).ok_or_else(|| {
            // unreachable when prevout collection succeeded
            RpcError::wallet(format!("{}:{} not found", outpoint.txid, outpoint.vout))
        })?;

        let single = matches!(
            hash_ty,
            EcdsaSighashType::Single | EcdsaSighashType::SinglePlusAnyoneCanPay
        );
        if !(single && index >= output_count) {
            let existing = tx.input[index].script_sig.clone();
            match solve_input(secp, tx, index, prev_script, hash_ty, source, network, &existing) {
                Ok(script_sig) => tx.input[index].script_sig = script_sig,
                Err(err) => {
                    debug!("input {index} not signed: {err}");
                    complete = false;
                    continue;
                }
            }
        }

        if !verify_input(secp, tx, index, prev_script) {
            complete = false;
        }
    }
    Ok(complete)
}

/// Produce a scriptSig for one input, merging any usable signatures already
/// present in `existing`.
#[allow(clippy::too_many_arguments)]
fn solve_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    prev_script: &Script,
    hash_ty: EcdsaSighashType,
    source: &KeySource<'_>,
    network: bitcoin::Network,
    existing: &Script,
) -> Result<ScriptBuf, SignError> {
    if prev_script.is_p2sh() {
        let address = Address::from_script(prev_script, network)
            .map_err(|_| SignError::UnsupportedScript)?;
        let redeem = source.script_for_address(&address)?;

        // Signatures already present sit before the trailing redeem push.
        let mut inner_pushes = push_data(existing).unwrap_or_default();
        if inner_pushes.last().is_some_and(|last| last == redeem.as_bytes()) {
            inner_pushes.pop();
        }
        let inner = solve_plain(
            secp, tx, index, &redeem, hash_ty, source, network, &inner_pushes,
        )?;

        let redeem_push = PushBytesBuf::try_from(redeem.to_bytes())
            .map_err(|err| SignError::Sighash(err.to_string()))?;
        let mut builder = Builder::new();
        for push in push_data(&inner).unwrap_or_default() {
            let bytes =
                PushBytesBuf::try_from(push).map_err(|err| SignError::Sighash(err.to_string()))?;
            builder = builder.push_slice(bytes);
        }
        Ok(builder.push_slice(redeem_push).into_script())
    } else {
        let existing_pushes = push_data(existing).unwrap_or_default();
        solve_plain(
            secp, tx, index, prev_script, hash_ty, source, network, &existing_pushes,
        )
    }
}

/// Solve a non-P2SH script class. `script_code` doubles as the sighash
/// script code.
#[allow(clippy::too_many_arguments)]
fn solve_plain(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    hash_ty: EcdsaSighashType,
    source: &KeySource<'_>,
    network: bitcoin::Network,
    existing_pushes: &[Vec<u8>],
) -> Result<ScriptBuf, SignError> {
    if script_code.is_p2pkh() {
        let address = Address::from_script(script_code, network)
            .map_err(|_| SignError::UnsupportedScript)?;
        let key = source.key_for_address(&address)?;
        let pubkey = key.public_key(secp);
        let sig = raw_signature(secp, tx, index, script_code, hash_ty, &key)?;
        let sig = PushBytesBuf::try_from(sig).map_err(|err| SignError::Sighash(err.to_string()))?;
        let pubkey = PushBytesBuf::try_from(pubkey.to_bytes())
            .map_err(|err| SignError::Sighash(err.to_string()))?;
        Ok(Builder::new().push_slice(sig).push_slice(pubkey).into_script())
    } else if let Some(pubkey) = parse_p2pk(script_code) {
        let address = Address::p2pkh(&pubkey, network);
        let key = source.key_for_address(&address)?;
        let sig = raw_signature(secp, tx, index, script_code, hash_ty, &key)?;
        let sig = PushBytesBuf::try_from(sig).map_err(|err| SignError::Sighash(err.to_string()))?;
        Ok(Builder::new().push_slice(sig).into_script())
    } else if let Some((required, pubkeys)) = parse_multisig(script_code) {
        sign_multisig(
            secp, tx, index, script_code, hash_ty, source, network, existing_pushes, required,
            &pubkeys,
        )
    } else {
        Err(SignError::UnsupportedScript)
    }
}

/// Best-effort multisig solve: keep every still-valid signature from the
/// previous scriptSig, add fresh ones for keys we hold, and assemble them in
/// pubkey order behind the OP_CHECKMULTISIG dummy push.
#[allow(clippy::too_many_arguments)]
fn sign_multisig(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    hash_ty: EcdsaSighashType,
    source: &KeySource<'_>,
    network: bitcoin::Network,
    existing_pushes: &[Vec<u8>],
    required: usize,
    pubkeys: &[PublicKey],
) -> Result<ScriptBuf, SignError> {
    let mut per_key: Vec<Option<Vec<u8>>> = vec![None; pubkeys.len()];

    for push in existing_pushes.iter().filter(|push| !push.is_empty()) {
        for (slot, pubkey) in pubkeys.iter().enumerate() {
            if per_key[slot].is_none()
                && check_signature(secp, tx, index, script_code, push, pubkey)
            {
                per_key[slot] = Some(push.clone());
                break;
            }
        }
    }

    for (slot, pubkey) in pubkeys.iter().enumerate() {
        if per_key[slot].is_some() {
            continue;
        }
        let address = Address::p2pkh(pubkey, network);
        let Ok(key) = source.key_for_address(&address) else {
            continue;
        };
        if key.public_key(secp).inner != pubkey.inner {
            continue;
        }
        per_key[slot] = Some(raw_signature(secp, tx, index, script_code, hash_ty, &key)?);
    }

    // Trailing OP_CHECKMULTISIG dummy, then signatures in pubkey order.
    let mut builder = Builder::new().push_slice(PushBytesBuf::new());
    let mut placed = 0;
    for sig in per_key.into_iter().flatten() {
        if placed == required {
            break;
        }
        let sig = PushBytesBuf::try_from(sig).map_err(|err| SignError::Sighash(err.to_string()))?;
        builder = builder.push_slice(sig);
        placed += 1;
    }
    Ok(builder.into_script())
}

fn raw_signature(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    hash_ty: EcdsaSighashType,
    key: &PrivateKey,
) -> Result<Vec<u8>, SignError> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(index, script_code, hash_ty.to_u32())
        .map_err(|err| SignError::Sighash(err.to_string()))?;
    let message = Message::from_digest(sighash.to_byte_array());
    let signature = secp.sign_ecdsa(&message, &key.inner);
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(hash_ty.to_u32() as u8);
    Ok(bytes)
}

/// Check one `signature || sighash-byte` blob against a pubkey, enforcing
/// strict DER encoding.
fn check_signature(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    sig_bytes: &[u8],
    pubkey: &PublicKey,
) -> bool {
    let Some((ty_byte, der)) = sig_bytes.split_last() else {
        return false;
    };
    let Ok(signature) = Signature::from_der(der) else {
        return false;
    };
    let hash_ty = EcdsaSighashType::from_consensus(u32::from(*ty_byte));
    let cache = SighashCache::new(tx);
    let Ok(sighash) = cache.legacy_signature_hash(index, script_code, hash_ty.to_u32()) else {
        return false;
    };
    let message = Message::from_digest(sighash.to_byte_array());
    secp.verify_ecdsa(&message, &signature, &pubkey.inner).is_ok()
}

/// Re-run the satisfaction check for one input: does `script_sig` satisfy
/// `prev_script` under P2SH and strict-DER rules?
pub fn verify_input(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    prev_script: &Script,
) -> bool {
    let script_sig = tx.input[index].script_sig.clone();
    let Some(pushes) = push_data(&script_sig) else {
        return false;
    };

    if prev_script.is_p2sh() {
        let Some((redeem_bytes, sig_pushes)) = pushes.split_last() else {
            return false;
        };
        let redeem = ScriptBuf::from_bytes(redeem_bytes.clone());
        if ScriptBuf::new_p2sh(&redeem.script_hash()) != *prev_script {
            return false;
        }
        verify_with_code(secp, tx, index, &redeem, sig_pushes)
    } else {
        verify_with_code(secp, tx, index, prev_script, &pushes)
    }
}

fn verify_with_code(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    index: usize,
    script_code: &Script,
    pushes: &[Vec<u8>],
) -> bool {
    if script_code.is_p2pkh() {
        let [sig, pubkey_bytes] = pushes else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
            return false;
        };
        ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) == *script_code
            && check_signature(secp, tx, index, script_code, sig, &pubkey)
    } else if let Some(pubkey) = parse_p2pk(script_code) {
        let [sig] = pushes else {
            return false;
        };
        check_signature(secp, tx, index, script_code, sig, &pubkey)
    } else if let Some((required, pubkeys)) = parse_multisig(script_code) {
        // Consensus order: signatures must appear in the same relative order
        // as their pubkeys. The leading dummy push is skipped.
        let sigs: Vec<&Vec<u8>> = pushes.iter().filter(|push| !push.is_empty()).collect();
        if sigs.len() < required {
            return false;
        }
        let mut key_cursor = 0;
        let mut valid = 0;
        for sig in sigs {
            loop {
                if key_cursor >= pubkeys.len() {
                    return false;
                }
                if check_signature(secp, tx, index, script_code, sig, &pubkeys[key_cursor]) {
                    key_cursor += 1;
                    valid += 1;
                    break;
                }
                key_cursor += 1;
            }
        }
        valid >= required
    } else {
        false
    }
}

/// All push data of a script, or `None` if it contains non-push opcodes.
fn push_data(script: &Script) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    for instruction in script.instructions() {
        match instruction.ok()? {
            Instruction::PushBytes(bytes) => pushes.push(bytes.as_bytes().to_vec()),
            Instruction::Op(_) => return None,
        }
    }
    Some(pushes)
}

fn parse_p2pk(script: &Script) -> Option<PublicKey> {
    if !script.is_p2pk() {
        return None;
    }
    match script.instructions().next()?.ok()? {
        Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes()).ok(),
        Instruction::Op(_) => None,
    }
}

/// Decompose an m-of-n CHECKMULTISIG script.
pub fn parse_multisig(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let instructions: Vec<Instruction> = script.instructions().collect::<Result<_, _>>().ok()?;
    if instructions.len() < 4 {
        return None;
    }
    if !matches!(instructions.last(), Some(Instruction::Op(op)) if *op == OP_CHECKMULTISIG) {
        return None;
    }
    let required = small_int(&instructions[0])?;
    let total = small_int(&instructions[instructions.len() - 2])?;
    let pubkeys: Vec<PublicKey> = instructions[1..instructions.len() - 2]
        .iter()
        .map(|instruction| match instruction {
            Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes()).ok(),
            Instruction::Op(_) => None,
        })
        .collect::<Option<_>>()?;
    if pubkeys.len() != total || required == 0 || required > total {
        return None;
    }
    Some((required, pubkeys))
}

fn small_int(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op)
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&op.to_u8()) =>
        {
            Some((op.to_u8() - OP_PUSHNUM_1.to_u8() + 1) as usize)
        }
        _ => None,
    }
}
