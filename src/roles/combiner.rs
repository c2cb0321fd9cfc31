use std::collections::BTreeMap;

use crate::document::{GlobalRecord, InputRecord, OutputRecord, Psbt};
use crate::error::{Error, Result};

/// Merge documents describing the same unsigned transaction.
///
/// Every field is unioned. A field set to different values in two documents
/// is a conflict, never a silent choice.
pub fn combine_psbts(psbts: &[Psbt]) -> Result<Psbt> {
    let (first, rest) = psbts.split_first().ok_or(Error::EmptyCombine)?;
    first.validate()?;

    let mut merged = first.clone();
    for other in rest {
        other.validate()?;
        if other.tx != merged.tx {
            return Err(Error::MismatchedTransactions);
        }
        merge_global(&mut merged.global, &other.global)?;
        for (index, (ours, theirs)) in merged.inputs.iter_mut().zip(&other.inputs).enumerate() {
            merge_input(index, ours, theirs)?;
        }
        for (index, (ours, theirs)) in merged.outputs.iter_mut().zip(&other.outputs).enumerate() {
            merge_output(index, ours, theirs)?;
        }
    }

    merged.validate()?;
    log::info!("combined {} PSBTs", psbts.len());
    Ok(merged)
}

fn merge_option<T: PartialEq + Clone>(
    ours: &mut Option<T>,
    theirs: &Option<T>,
    record: &str,
    field: &'static str,
) -> Result<()> {
    match (ours.as_ref(), theirs) {
        (_, None) => Ok(()),
        (None, Some(t)) => {
            *ours = Some(t.clone());
            Ok(())
        }
        (Some(o), Some(t)) if o == t => Ok(()),
        (Some(_), Some(_)) => Err(Error::Conflict {
            record: record.to_string(),
            field,
        }),
    }
}

fn merge_map<K: Ord + Clone, V: PartialEq + Clone>(
    ours: &mut BTreeMap<K, V>,
    theirs: &BTreeMap<K, V>,
    record: &str,
    field: &'static str,
) -> Result<()> {
    for (key, value) in theirs {
        match ours.get(key) {
            None => {
                ours.insert(key.clone(), value.clone());
            }
            Some(existing) if existing == value => {}
            Some(_) => {
                return Err(Error::Conflict {
                    record: record.to_string(),
                    field,
                });
            }
        }
    }
    Ok(())
}

fn merge_global(ours: &mut GlobalRecord, theirs: &GlobalRecord) -> Result<()> {
    merge_option(&mut ours.version, &theirs.version, "global", "version")?;
    merge_map(&mut ours.xpubs, &theirs.xpubs, "global", "xpub")?;
    merge_map(&mut ours.unknown, &theirs.unknown, "global", "unknown")
}

fn merge_input(index: usize, ours: &mut InputRecord, theirs: &InputRecord) -> Result<()> {
    let record = format!("input {index}");
    let r = record.as_str();

    merge_option(&mut ours.non_witness_utxo, &theirs.non_witness_utxo, r, "non_witness_utxo")?;
    merge_option(&mut ours.witness_utxo, &theirs.witness_utxo, r, "witness_utxo")?;
    merge_option(&mut ours.final_script_sig, &theirs.final_script_sig, r, "final_scriptsig")?;
    merge_option(
        &mut ours.final_script_witness,
        &theirs.final_script_witness,
        r,
        "final_scriptwitness",
    )?;
    merge_option(&mut ours.value, &theirs.value, r, "value")?;
    merge_option(
        &mut ours.value_blinding_factor,
        &theirs.value_blinding_factor,
        r,
        "value_blinding_factor",
    )?;
    merge_option(&mut ours.asset, &theirs.asset, r, "asset")?;
    merge_option(
        &mut ours.asset_blinding_factor,
        &theirs.asset_blinding_factor,
        r,
        "asset_blinding_factor",
    )?;
    merge_map(&mut ours.unknown, &theirs.unknown, r, "unknown")?;

    // Once either side is final the signing data is spent.
    if ours.is_finalized() {
        ours.clear_signing_fields();
        return Ok(());
    }
    merge_map(&mut ours.partial_sigs, &theirs.partial_sigs, r, "partial_sig")?;
    merge_option(&mut ours.sighash_type, &theirs.sighash_type, r, "sighash_type")?;
    merge_option(&mut ours.redeem_script, &theirs.redeem_script, r, "redeem_script")?;
    merge_option(&mut ours.witness_script, &theirs.witness_script, r, "witness_script")?;
    merge_map(
        &mut ours.bip32_derivation,
        &theirs.bip32_derivation,
        r,
        "bip32_derivation",
    )
}

fn merge_output(index: usize, ours: &mut OutputRecord, theirs: &OutputRecord) -> Result<()> {
    let record = format!("output {index}");
    let r = record.as_str();

    merge_option(&mut ours.redeem_script, &theirs.redeem_script, r, "redeem_script")?;
    merge_option(&mut ours.witness_script, &theirs.witness_script, r, "witness_script")?;
    merge_map(
        &mut ours.bip32_derivation,
        &theirs.bip32_derivation,
        r,
        "bip32_derivation",
    )?;
    merge_option(&mut ours.blinding_pubkey, &theirs.blinding_pubkey, r, "blinding_pubkey")?;
    merge_option(
        &mut ours.value_commitment,
        &theirs.value_commitment,
        r,
        "value_commitment",
    )?;
    merge_option(
        &mut ours.value_blinding_factor,
        &theirs.value_blinding_factor,
        r,
        "value_blinding_factor",
    )?;
    merge_option(
        &mut ours.asset_commitment,
        &theirs.asset_commitment,
        r,
        "asset_commitment",
    )?;
    merge_option(
        &mut ours.asset_blinding_factor,
        &theirs.asset_blinding_factor,
        r,
        "asset_blinding_factor",
    )?;
    merge_option(
        &mut ours.nonce_commitment,
        &theirs.nonce_commitment,
        r,
        "nonce_commitment",
    )?;
    merge_option(&mut ours.range_proof, &theirs.range_proof, r, "range_proof")?;
    merge_option(
        &mut ours.surjection_proof,
        &theirs.surjection_proof,
        r,
        "surjection_proof",
    )?;
    merge_map(&mut ours.unknown, &theirs.unknown, r, "unknown")
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::{AssetId, OutPoint, Txid};

    use super::*;
    use crate::roles::creator::{CreateParams, OutputSpec, create_psbt};

    fn base(fee: u64) -> Psbt {
        create_psbt(&CreateParams {
            inputs: vec![OutPoint::new(Txid::from_byte_array([4; 32]), 1).into()],
            outputs: vec![OutputSpec::Fee {
                asset: AssetId::from_slice(&[1; 32]).unwrap(),
                amount: fee,
            }],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn empty_list_is_an_error() {
        assert_eq!(
            combine_psbts(&[]).unwrap_err().to_string(),
            "Parameter 'txs' cannot be empty"
        );
    }

    #[test]
    fn different_transactions_do_not_combine() {
        assert!(matches!(
            combine_psbts(&[base(1), base(2)]),
            Err(Error::MismatchedTransactions)
        ));
    }

    #[test]
    fn unions_are_commutative_and_conflicts_named() {
        let mut a = base(1);
        a.inputs[0].unknown.insert(vec![0x0F], vec![1]);
        let mut b = base(1);
        b.inputs[0].unknown.insert(vec![0x0E], vec![2]);
        b.global.unknown.insert(vec![0x0D], vec![3]);

        let ab = combine_psbts(&[a.clone(), b.clone()]).unwrap();
        let ba = combine_psbts(&[b.clone(), a.clone()]).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.inputs[0].unknown.len(), 2);

        let mut c = base(1);
        c.inputs[0].unknown.insert(vec![0x0F], vec![9]);
        match combine_psbts(&[a, c]) {
            Err(Error::Conflict { record, field }) => {
                assert_eq!(record, "input 0");
                assert_eq!(field, "unknown");
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[test]
    fn explicit_version_survives_either_order() {
        let mut versioned = base(1);
        versioned.global.version = Some(0);
        let plain = base(1);
        let one = combine_psbts(&[versioned.clone(), plain.clone()]).unwrap();
        let two = combine_psbts(&[plain, versioned]).unwrap();
        assert_eq!(one.global.version, Some(0));
        assert_eq!(one, two);
    }

    #[test]
    fn final_record_drops_signing_data() {
        let mut signed = base(1);
        signed.inputs[0].sighash_type = Some(1);
        let mut finalized = base(1);
        finalized.inputs[0].final_script_witness = Some(vec![vec![1], vec![2]]);

        for pair in [
            [signed.clone(), finalized.clone()],
            [finalized.clone(), signed.clone()],
        ] {
            let merged = combine_psbts(&pair).unwrap();
            assert!(merged.inputs[0].is_finalized());
            assert!(!merged.inputs[0].has_signing_fields());
        }
    }
}
