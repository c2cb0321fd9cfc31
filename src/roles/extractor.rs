use lwk_wollet::elements::{Script, Transaction};

use crate::document::Psbt;
use crate::error::{Error, Result};

/// The ledger transaction of a fully finalized, fully blinded document.
pub fn extract_transaction(psbt: &Psbt) -> Result<Transaction> {
    psbt.validate()?;
    if let Some(&index) = psbt.pending_blinding_outputs().first() {
        return Err(Error::BlindingIncomplete(index));
    }
    if let Some(index) = psbt.inputs.iter().position(|i| !i.is_finalized()) {
        return Err(Error::NotFinalized(index));
    }

    let mut tx = psbt.signing_transaction()?;
    for (txin, record) in tx.input.iter_mut().zip(&psbt.inputs) {
        txin.script_sig = record.final_script_sig.clone().unwrap_or_else(Script::new);
        txin.witness.script_witness = record.final_script_witness.clone().unwrap_or_default();
    }
    log::info!("extracted {}", tx.txid());
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::AssetId;
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::secp256k1_zkp::{PublicKey, Secp256k1, SecretKey};
    use lwk_wollet::elements::{OutPoint, Txid};

    use super::*;
    use crate::roles::creator::{CreateParams, OutputSpec, create_psbt};

    fn psbt(blinding_pubkey: Option<PublicKey>) -> Psbt {
        create_psbt(&CreateParams {
            inputs: vec![OutPoint::new(Txid::from_byte_array([6; 32]), 0).into()],
            outputs: vec![OutputSpec::Payment {
                script_pubkey: Script::from(vec![0x51]),
                asset: AssetId::from_slice(&[1; 32]).unwrap(),
                amount: 100,
                blinding_pubkey,
            }],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn pending_blinding_blocks_extraction() {
        let secp = Secp256k1::new();
        let key = PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[3; 32]).unwrap());
        assert!(matches!(
            extract_transaction(&psbt(Some(key))),
            Err(Error::BlindingIncomplete(0))
        ));
    }

    #[test]
    fn unfinalized_inputs_block_extraction() {
        assert!(matches!(
            extract_transaction(&psbt(None)),
            Err(Error::NotFinalized(0))
        ));
    }

    #[test]
    fn final_scripts_land_in_the_transaction() {
        let mut psbt = psbt(None);
        psbt.inputs[0].final_script_sig = Some(Script::from(vec![0x00]));
        psbt.inputs[0].final_script_witness = Some(vec![vec![1, 2]]);
        let tx = extract_transaction(&psbt).unwrap();
        assert_eq!(tx.input[0].script_sig, Script::from(vec![0x00]));
        assert_eq!(tx.input[0].witness.script_witness, vec![vec![1, 2]]);
        assert_eq!(tx.txid(), psbt.tx.txid());
    }
}
