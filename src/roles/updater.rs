use lwk_wollet::elements::secp256k1_zkp::Secp256k1;
use lwk_wollet::elements::{Script, TxOut};

use crate::chain::{SpentOutput, UtxoSource};
use crate::commitment::secrets_match_txout;
use crate::document::{InputRecord, OutputRecord, Psbt, without_witness};
use crate::error::{Error, Result};
use crate::script::{ScriptKind, classify};

/// Attach whatever `source` knows about the spent outputs and the paid-to
/// scripts. Only fields that are still absent are filled.
pub fn update_psbt<S: UtxoSource + ?Sized>(psbt: &Psbt, source: &S) -> Result<Psbt> {
    psbt.validate()?;
    let secp = Secp256k1::new();
    let mut updated = psbt.clone();

    let mut known = 0;
    for index in 0..updated.inputs.len() {
        if updated.is_input_finalized(index) {
            continue;
        }
        let outpoint = updated.tx.input[index].previous_output;
        let spent = match source.lookup(&outpoint) {
            Ok(spent) => spent,
            Err(Error::UtxoNotFound(_)) => {
                log::debug!("input {index}: {outpoint} unknown to this party");
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(prev) = &spent.prev_tx {
            if prev.txid() != outpoint.txid {
                return Err(Error::MalformedDocument(format!(
                    "input {index}: previous transaction does not hash to {}",
                    outpoint.txid
                )));
            }
        }

        let record = &mut updated.inputs[index];
        if !spent_matches(record, &spent.txout) {
            return Err(Error::MalformedDocument(format!(
                "input {index}: {outpoint} disagrees with the recorded UTXO"
            )));
        }
        fill_scripts(record, &spent);
        if !attach_utxo(index, record, &spent) {
            continue;
        }

        if let Some(secrets) = spent.secrets {
            if record.secrets().is_none() {
                if secrets_match_txout(&secp, &secrets, &spent.txout) {
                    record.set_secrets(&secrets);
                } else {
                    log::warn!("input {index}: blinding secrets do not open the spent output");
                }
            }
        }
        known += 1;
    }

    for (txout, record) in updated.tx.output.iter().zip(updated.outputs.iter_mut()) {
        if let Some(info) = source.output_info(&txout.script_pubkey) {
            fill_output(record, info);
        }
    }

    updated.validate()?;
    log::info!("updated {known} of {} inputs", updated.inputs.len());
    Ok(updated)
}

fn fill_scripts(record: &mut InputRecord, spent: &SpentOutput) {
    if record.redeem_script.is_none() {
        record.redeem_script = spent.redeem_script.clone();
    }
    if record.witness_script.is_none() {
        record.witness_script = spent.witness_script.clone();
    }
    for (key, origin) in &spent.bip32_derivation {
        record
            .bip32_derivation
            .entry(*key)
            .or_insert_with(|| origin.clone());
    }
}

/// Witness spends carry just the spent output, legacy spends the whole
/// previous transaction. Returns false when the input is left without UTXO
/// data.
fn attach_utxo(index: usize, record: &mut InputRecord, spent: &SpentOutput) -> bool {
    if is_witness_spend(&spent.txout.script_pubkey, record.redeem_script.as_ref()) {
        if record.witness_utxo.is_none() {
            record.witness_utxo = Some(without_witness(&spent.txout));
        }
        return true;
    }
    if record.non_witness_utxo.is_some() {
        return true;
    }
    match &spent.prev_tx {
        Some(prev) => {
            record.non_witness_utxo = Some(prev.clone());
            true
        }
        None => {
            log::debug!("input {index}: legacy spend without its previous transaction");
            false
        }
    }
}

fn is_witness_spend(script_pubkey: &Script, redeem_script: Option<&Script>) -> bool {
    match classify(script_pubkey) {
        ScriptKind::P2wpkh(_) | ScriptKind::P2wsh(_) => true,
        ScriptKind::P2sh(_) => redeem_script.is_some_and(|rs| {
            matches!(classify(rs), ScriptKind::P2wpkh(_) | ScriptKind::P2wsh(_))
        }),
        _ => false,
    }
}

fn fill_output(record: &mut OutputRecord, info: crate::chain::OutputInfo) {
    if record.redeem_script.is_none() {
        record.redeem_script = info.redeem_script;
    }
    if record.witness_script.is_none() {
        record.witness_script = info.witness_script;
    }
    for (key, origin) in info.bip32_derivation {
        record.bip32_derivation.entry(key).or_insert(origin);
    }
}

fn spent_matches(record: &InputRecord, txout: &TxOut) -> bool {
    record
        .witness_utxo
        .as_ref()
        .is_none_or(|w| without_witness(w) == without_witness(txout))
}
