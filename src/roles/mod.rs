//! The PSBT roles. Each one is a pure transform from one document to the next.

pub mod blinder;
pub mod combiner;
pub mod creator;
pub mod extractor;
pub mod finalizer;
pub mod signer;
pub mod updater;

use std::collections::BTreeMap;

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::secp256k1_zkp::{Message, Secp256k1, Verification, ecdsa};
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{EcdsaSighashType, Transaction, TxOut};

use crate::document::Psbt;
use crate::script::{Satisfier, SpendPlan, hash160, plan_spend};

/// The spent output of input `index` and how it is spent.
pub(crate) fn input_plan(psbt: &Psbt, index: usize) -> Result<(TxOut, SpendPlan), String> {
    let spent = psbt
        .spent_output(index)
        .ok_or_else(|| "missing UTXO".to_string())?;
    let record = &psbt.inputs[index];
    let plan = plan_spend(
        &spent.script_pubkey,
        record.redeem_script.as_ref(),
        record.witness_script.as_ref(),
    )
    .map_err(|e| e.to_string())?;
    Ok((spent, plan))
}

pub(crate) fn input_sighash(
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    plan: &SpendPlan,
    spent: &TxOut,
    ty: EcdsaSighashType,
) -> [u8; 32] {
    let sighash = if plan.segwit {
        cache.segwitv0_sighash(index, &plan.script_code, spent.value, ty)
    } else {
        cache.legacy_sighash(index, &plan.script_code, ty)
    };
    sighash.to_byte_array()
}

/// The partial signatures of input `index` that verify against `plan`.
pub(crate) fn valid_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    plan: &SpendPlan,
    spent: &TxOut,
    partial_sigs: &BTreeMap<PublicKey, Vec<u8>>,
) -> BTreeMap<PublicKey, Vec<u8>> {
    let mut valid = BTreeMap::new();
    for (pubkey, bytes) in partial_sigs {
        let ok = plan.involves(pubkey)
            && signature_verifies(secp, cache, index, plan, spent, pubkey, bytes);
        if ok {
            valid.insert(*pubkey, bytes.clone());
        } else {
            log::warn!("input {index}: ignoring invalid signature for {pubkey}");
        }
    }
    valid
}

pub(crate) fn signature_verifies<C: Verification>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    plan: &SpendPlan,
    spent: &TxOut,
    pubkey: &PublicKey,
    bytes: &[u8],
) -> bool {
    let Some((&ty, der)) = bytes.split_last() else {
        return false;
    };
    let Ok(ty) = EcdsaSighashType::from_standard(u32::from(ty)) else {
        return false;
    };
    let Ok(sig) = ecdsa::Signature::from_der(der) else {
        return false;
    };
    let digest = input_sighash(cache, index, plan, spent, ty);
    secp.verify_ecdsa(&Message::from_digest(digest), &sig, &pubkey.inner)
        .is_ok()
}

/// Satisfies a spend plan from a set of already-checked signatures.
pub(crate) struct SignatureSet<'a>(pub &'a BTreeMap<PublicKey, Vec<u8>>);

impl Satisfier for SignatureSet<'_> {
    fn key_hash_signature(&self, hash: &[u8; 20]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.0
            .iter()
            .find(|(pk, _)| hash160(&pk.to_bytes()) == *hash)
            .map(|(pk, sig)| (pk.to_bytes(), sig.clone()))
    }

    fn signature(&self, key: &PublicKey) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }
}
