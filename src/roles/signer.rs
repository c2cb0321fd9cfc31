use lwk_wollet::elements::secp256k1_zkp::{All, Secp256k1};
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{EcdsaSighashType, Transaction};

use crate::document::{Psbt, without_witness};
use crate::error::{Error, Result};
use crate::keys::SigningOracle;
use crate::roles::{SignatureSet, input_plan, input_sighash, valid_signatures};

pub const SIGHASH_ALL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignOptions {
    pub sighash_type: u32,
    /// Sign even when the amounts cannot be checked or do not balance.
    pub allow_unbalanced: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            sighash_type: SIGHASH_ALL,
            allow_unbalanced: false,
        }
    }
}

/// Add a partial signature from every key `oracle` holds that the inputs'
/// scripts reference. Existing signatures are kept untouched.
///
/// Returns the signed document and whether every input now has enough valid
/// signatures to be finalized.
pub fn sign_psbt<O: SigningOracle + ?Sized>(
    psbt: &Psbt,
    oracle: &O,
    options: &SignOptions,
) -> Result<(Psbt, bool)> {
    psbt.validate()?;
    if psbt.needs_blinding() {
        return Err(Error::Signing("transaction not fully blinded".into()));
    }

    let signing_tx = psbt.signing_transaction()?;
    let secp = Secp256k1::new();
    // Checked before the first signature, so parties with nothing to sign
    // pass the document through untouched.
    let mut amounts_checked = options.allow_unbalanced;

    let ty = EcdsaSighashType::from_standard(options.sighash_type)
        .map_err(|_| Error::Signing(format!("invalid sighash type {}", options.sighash_type)))?;
    let keys = oracle.public_keys();
    let mut cache = SighashCache::new(&signing_tx);
    let mut signed = psbt.clone();
    let mut complete = true;

    for index in 0..signed.inputs.len() {
        if signed.is_input_finalized(index) {
            continue;
        }
        if let Some(requested) = signed.inputs[index].sighash_type {
            if requested != options.sighash_type {
                return Err(Error::Signing(format!(
                    "input {index}: sighash type {} does not match the requested {requested}",
                    options.sighash_type
                )));
            }
        }

        let (spent, plan) = match input_plan(&signed, index) {
            Ok(found) => found,
            Err(reason) => {
                log::debug!("input {index}: cannot sign ({reason})");
                complete = false;
                continue;
            }
        };

        let record = &mut signed.inputs[index];
        if plan.segwit && record.witness_utxo.is_none() {
            record.witness_utxo = Some(without_witness(&spent));
        }

        let digest = input_sighash(&mut cache, index, &plan, &spent, ty);
        for key in keys.iter().filter(|k| plan.involves(k)) {
            if record.partial_sigs.contains_key(key) {
                continue;
            }
            if !amounts_checked {
                check_amounts(psbt, &signing_tx, &secp)?;
                amounts_checked = true;
            }
            let sig = oracle.sign(&digest, key)?;
            let mut bytes = sig.serialize_der().to_vec();
            bytes.push(ty.as_u32() as u8);
            record.partial_sigs.insert(*key, bytes);
            log::debug!("input {index}: signed with {key}");
        }

        let valid = valid_signatures(&secp, &mut cache, index, &plan, &spent, &record.partial_sigs);
        if plan.satisfy(&SignatureSet(&valid)).is_err() {
            complete = false;
        }
    }

    log::info!("signed PSBT, complete: {complete}");
    Ok((signed, complete))
}

/// Every input's spent output must be known and the blinded amounts must
/// balance with valid proofs.
fn check_amounts(
    psbt: &Psbt,
    signing_tx: &Transaction,
    secp: &Secp256k1<All>,
) -> Result<()> {
    let spent = psbt.spent_outputs().map_err(|index| {
        Error::Signing(format!(
            "input {index} is missing its UTXO, cannot check the value balance"
        ))
    })?;
    signing_tx
        .verify_tx_amt_proofs(secp, &spent)
        .map_err(|e| Error::Signing(format!("value imbalance: {e:?}")))
}
