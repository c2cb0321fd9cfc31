use lwk_wollet::elements::confidential::{Asset, AssetBlindingFactor, Value, ValueBlindingFactor};
use lwk_wollet::elements::AssetId;
use lwk_wollet::elements::secp256k1_zkp::{All, Generator, Secp256k1, SecretKey, Tag, Tweak};
use rand::{CryptoRng, RngCore};

use crate::commitment::{BlindingSecrets, balance_last_output, blind_output};
use crate::document::Psbt;
use crate::error::{Error, Result};

const NEED_ANOTHER_OUTPUT: &str = "need another output to blind";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlindOptions {
    /// Complete with explicit outputs instead of failing when the blinders
    /// cannot be balanced.
    pub ignore_blind_fail: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlindStatus {
    /// These outputs received commitments and proofs.
    Blinded { outputs: Vec<usize> },
    NothingToBlind,
    /// Blinding was impossible and these outputs were left explicit.
    LeftUnblinded { outputs: Vec<usize> },
}

/// Blind every output that carries a blinding pubkey but no commitments yet.
///
/// The last such output takes a value blinder that makes the blinders of the
/// whole transaction sum to zero, so every input must have known secrets.
pub fn blind_psbt<R: RngCore + CryptoRng>(
    psbt: &Psbt,
    options: &BlindOptions,
    rng: &mut R,
) -> Result<(Psbt, BlindStatus)> {
    psbt.validate()?;
    let secp = Secp256k1::new();

    let pending = psbt.pending_blinding_outputs();
    let confidential_inputs = (0..psbt.inputs.len())
        .filter(|&i| input_is_confidential(psbt, i))
        .count();
    let blinded_outputs = psbt.outputs.iter().filter(|o| o.is_blinded()).count();

    if pending.is_empty() {
        if confidential_inputs > 0 && blinded_outputs == 0 {
            return refuse(psbt, options, pending);
        }
        return Ok((psbt.clone(), BlindStatus::NothingToBlind));
    }
    if pending.len() == 1 && confidential_inputs == 0 && blinded_outputs == 0 {
        return refuse(psbt, options, pending);
    }
    // Blinding rewrites the outputs every signature commits to.
    if let Some(index) = psbt
        .inputs
        .iter()
        .position(|i| !i.partial_sigs.is_empty() || i.is_finalized())
    {
        return Err(Error::Blinding(format!(
            "input {index} is already signed; blind before signing"
        )));
    }

    let inputs = input_secrets(psbt)?;
    let domain: Vec<_> = inputs.iter().map(|s| s.surjection_target(&secp)).collect();

    let mut settled = Vec::new();
    for index in 0..psbt.outputs.len() {
        if !pending.contains(&index) {
            settled.push(settled_output_secrets(psbt, index)?);
        }
    }

    // Fresh blinders for all but the last pending output, which balances.
    let mut chosen = Vec::with_capacity(pending.len());
    for (n, &index) in pending.iter().enumerate() {
        let (value, asset) = explicit_amount(psbt, index)?;
        let abf = AssetBlindingFactor::new(rng);
        let vbf = if n + 1 == pending.len() {
            let others: Vec<_> = settled.iter().chain(&chosen).copied().collect();
            balance_last_output(&secp, value, abf, &inputs, &others)
        } else {
            ValueBlindingFactor::new(rng)
        };
        chosen.push(BlindingSecrets::new(value, asset, abf, vbf));
    }

    let mut blinded = psbt.clone();
    for (&index, secrets) in pending.iter().zip(&chosen) {
        apply_blinding(&secp, rng, &mut blinded, index, secrets, &domain)?;
    }
    blinded.validate()?;

    log::info!("blinded {} outputs", pending.len());
    Ok((blinded, BlindStatus::Blinded { outputs: pending }))
}

fn refuse(
    psbt: &Psbt,
    options: &BlindOptions,
    pending: Vec<usize>,
) -> Result<(Psbt, BlindStatus)> {
    if !options.ignore_blind_fail {
        return Err(Error::Blinding(NEED_ANOTHER_OUTPUT.into()));
    }
    log::warn!("{NEED_ANOTHER_OUTPUT}; leaving outputs {pending:?} explicit");
    let mut unblinded = psbt.clone();
    for &index in &pending {
        unblinded.outputs[index].blinding_pubkey = None;
    }
    Ok((unblinded, BlindStatus::LeftUnblinded { outputs: pending }))
}

fn input_is_confidential(psbt: &Psbt, index: usize) -> bool {
    if let Some(secrets) = psbt.inputs[index].secrets() {
        return secrets.is_blinded();
    }
    psbt.spent_output(index).is_some_and(|txout| {
        matches!(txout.value, Value::Confidential(_)) || matches!(txout.asset, Asset::Confidential(_))
    })
}

fn input_secrets(psbt: &Psbt) -> Result<Vec<BlindingSecrets>> {
    let mut secrets = Vec::with_capacity(psbt.inputs.len());
    for (index, record) in psbt.inputs.iter().enumerate() {
        if let Some(known) = record.secrets() {
            secrets.push(known);
            continue;
        }
        let txout = psbt
            .spent_output(index)
            .ok_or_else(|| Error::Blinding(format!("input {index} has no UTXO information")))?;
        match (txout.value, txout.asset) {
            (Value::Explicit(value), Asset::Explicit(asset)) => {
                secrets.push(BlindingSecrets::explicit(value, asset))
            }
            _ => {
                return Err(Error::Blinding(format!(
                    "input {index} is confidential but its blinding secrets are unknown"
                )));
            }
        }
    }
    Ok(secrets)
}

fn explicit_amount(psbt: &Psbt, index: usize) -> Result<(u64, AssetId)> {
    psbt.explicit_output(index)
        .ok_or_else(|| Error::MalformedDocument(format!("output {index} is not explicit")))
}

/// Secrets of an output that is either explicit or already blinded.
fn settled_output_secrets(psbt: &Psbt, index: usize) -> Result<BlindingSecrets> {
    let (value, asset) = explicit_amount(psbt, index)?;
    let record = &psbt.outputs[index];
    if !record.is_blinded() {
        return Ok(BlindingSecrets::explicit(value, asset));
    }
    match (record.asset_blinding_factor, record.value_blinding_factor) {
        (Some(abf), Some(vbf)) => Ok(BlindingSecrets::new(value, asset, abf, vbf)),
        _ => Err(Error::Blinding(format!(
            "output {index} is blinded but its blinders are unknown"
        ))),
    }
}

fn apply_blinding<R: RngCore + CryptoRng>(
    secp: &Secp256k1<All>,
    rng: &mut R,
    psbt: &mut Psbt,
    index: usize,
    secrets: &BlindingSecrets,
    domain: &[(Generator, Tag, Tweak)],
) -> Result<()> {
    let record = &psbt.outputs[index];
    let blinding_pubkey = record
        .blinding_pubkey
        .ok_or_else(|| Error::Blinding(format!("output {index} has no blinding pubkey")))?;
    let script_pubkey = &psbt.tx.output[index].script_pubkey;

    let ephemeral_sk = SecretKey::new(rng);
    let out = blind_output(
        rng,
        secp,
        secrets,
        script_pubkey,
        &blinding_pubkey,
        ephemeral_sk,
        domain,
    )
    .map_err(|e| Error::Blinding(format!("output {index}: {e}")))?;

    let record = &mut psbt.outputs[index];
    record.value_commitment = Some(out.value_commitment);
    record.asset_commitment = Some(out.asset_commitment);
    record.nonce_commitment = Some(out.nonce_commitment);
    record.range_proof = Some(out.range_proof.serialize());
    record.surjection_proof = Some(out.surjection_proof.serialize());
    record.value_blinding_factor = Some(secrets.vbf);
    record.asset_blinding_factor = Some(secrets.abf);
    Ok(())
}
