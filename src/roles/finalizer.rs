use lwk_wollet::elements::Transaction;
use lwk_wollet::elements::secp256k1_zkp::Secp256k1;
use lwk_wollet::elements::sighash::SighashCache;

use crate::document::Psbt;
use crate::error::{Error, Result};
use crate::roles::extractor::extract_transaction;
use crate::roles::{SignatureSet, input_plan, valid_signatures};

#[derive(Debug, Clone)]
pub struct FinalizeResult {
    pub psbt: Psbt,
    /// Present when extraction was requested.
    pub tx: Option<Transaction>,
}

/// Turn the partial signatures of every input into a final scriptSig and
/// witness, dropping the data that was only needed for signing.
pub fn finalize_psbt(psbt: &Psbt, extract: bool) -> Result<FinalizeResult> {
    psbt.validate()?;
    let secp = Secp256k1::verification_only();
    let signing_tx = psbt.signing_transaction()?;
    let mut cache = SighashCache::new(&signing_tx);
    let mut finalized = psbt.clone();

    for index in 0..finalized.inputs.len() {
        if finalized.is_input_finalized(index) {
            continue;
        }
        let (spent, plan) = input_plan(&finalized, index)
            .map_err(|reason| Error::Unsatisfiable { input: index, reason })?;

        let record = &mut finalized.inputs[index];
        let valid = valid_signatures(&secp, &mut cache, index, &plan, &spent, &record.partial_sigs);
        let (script_sig, witness) = plan
            .satisfy(&SignatureSet(&valid))
            .map_err(|quorum| Error::IncompleteSignatures {
                input: index,
                have: quorum.have,
                need: quorum.need,
            })?;

        record.final_script_sig = (!script_sig.is_empty()).then_some(script_sig);
        record.final_script_witness = (!witness.is_empty()).then_some(witness);
        record.clear_signing_fields();
        log::debug!("input {index}: finalized");
    }

    finalized.validate()?;
    let tx = if extract {
        Some(extract_transaction(&finalized)?)
    } else {
        None
    };
    log::info!("finalized {} inputs", finalized.inputs.len());
    Ok(FinalizeResult { psbt: finalized, tx })
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::secp256k1_zkp::SecretKey;
    use lwk_wollet::elements::{AssetId, OutPoint, Script, TxOut, TxOutWitness, Txid};

    use super::*;
    use crate::keys::{Keyring, SigningOracle};
    use crate::roles::creator::{CreateParams, OutputSpec, create_psbt};
    use crate::roles::signer::{SignOptions, sign_psbt};
    use crate::script::{multisig, p2sh, p2wsh};

    fn asset() -> AssetId {
        AssetId::from_slice(&[4; 32]).unwrap()
    }

    fn keyring(bytes: &[u8]) -> Keyring {
        Keyring::from_secret_keys(bytes.iter().map(|&b| SecretKey::from_slice(&[b; 32]).unwrap()))
    }

    /// A P2SH-wrapped 2-of-3 P2WSH spend with its scripts already attached.
    fn wrapped_multisig() -> Psbt {
        let ms = multisig(2, &keyring(&[1, 2, 3]).public_keys());
        let program = p2wsh(&ms);
        let mut psbt = create_psbt(&CreateParams {
            inputs: vec![OutPoint::new(Txid::from_byte_array([5; 32]), 0).into()],
            outputs: vec![
                OutputSpec::Payment {
                    script_pubkey: Script::from(vec![0x51]),
                    asset: asset(),
                    amount: 4_000,
                    blinding_pubkey: None,
                },
                OutputSpec::Fee {
                    asset: asset(),
                    amount: 1_000,
                },
            ],
            ..Default::default()
        })
        .unwrap();
        let record = &mut psbt.inputs[0];
        record.witness_utxo = Some(TxOut {
            asset: Asset::Explicit(asset()),
            value: Value::Explicit(5_000),
            nonce: Nonce::Null,
            script_pubkey: p2sh(&program),
            witness: TxOutWitness::default(),
        });
        record.redeem_script = Some(program);
        record.witness_script = Some(ms);
        psbt
    }

    #[test]
    fn wrapped_witness_multisig_finalizes() {
        let (signed, complete) =
            sign_psbt(&wrapped_multisig(), &keyring(&[1, 3]), &SignOptions::default()).unwrap();
        assert!(complete);

        let result = finalize_psbt(&signed, true).unwrap();
        let record = &result.psbt.inputs[0];
        assert!(!record.has_signing_fields());
        // scriptSig pushes the witness program, the witness carries the rest.
        assert_eq!(record.final_script_sig.as_ref().unwrap().len(), 35);
        assert_eq!(record.final_script_witness.as_ref().unwrap().len(), 4);
        let tx = result.tx.unwrap();
        assert_eq!(tx.input[0].witness.script_witness.len(), 4);
    }

    #[test]
    fn invalid_signatures_do_not_count() {
        let (mut signed, _) =
            sign_psbt(&wrapped_multisig(), &keyring(&[1, 2]), &SignOptions::default()).unwrap();
        let sig = signed.inputs[0].partial_sigs.values_mut().next().unwrap();
        sig[10] ^= 0xff;
        assert!(matches!(
            finalize_psbt(&signed, false),
            Err(Error::IncompleteSignatures {
                input: 0,
                have: 1,
                need: 2
            })
        ));
    }

    #[test]
    fn missing_scripts_are_unsatisfiable() {
        let mut psbt = wrapped_multisig();
        psbt.inputs[0].witness_script = None;
        assert!(matches!(
            finalize_psbt(&psbt, false),
            Err(Error::Unsatisfiable { input: 0, .. })
        ));
    }

    #[test]
    fn finalizing_twice_is_a_no_op() {
        let (signed, _) =
            sign_psbt(&wrapped_multisig(), &keyring(&[2, 3]), &SignOptions::default()).unwrap();
        let once = finalize_psbt(&signed, false).unwrap().psbt;
        let twice = finalize_psbt(&once, false).unwrap();
        assert_eq!(twice.psbt, once);
        assert!(twice.tx.is_none());
    }
}
