//! The partially signed transaction and its per-input / per-output records.

use std::collections::BTreeMap;

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::secp256k1_zkp::{
    self, Generator, PedersenCommitment, RangeProof, SurjectionProof,
};
use lwk_wollet::elements::{AssetId, OutPoint, Script, Transaction, TxOut, TxOutWitness};

use crate::commitment::BlindingSecrets;
use crate::error::{Error, Result};

/// Raw key → value pairs this crate does not interpret.
pub type UnknownFields = BTreeMap<Vec<u8>, Vec<u8>>;

/// Master key fingerprint plus derivation path. Hardened steps have bit 31 set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KeySource {
    pub fingerprint: [u8; 4],
    pub path: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalRecord {
    /// Document version, `None` when the entry is absent. Only 0 is
    /// understood.
    pub version: Option<u32>,
    /// Serialized extended public keys and where they come from.
    pub xpubs: BTreeMap<Vec<u8>, KeySource>,
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputRecord {
    pub non_witness_utxo: Option<Transaction>,
    pub witness_utxo: Option<TxOut>,
    /// DER signature with the sighash byte appended, per public key.
    pub partial_sigs: BTreeMap<PublicKey, Vec<u8>>,
    pub sighash_type: Option<u32>,
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    pub bip32_derivation: BTreeMap<PublicKey, KeySource>,
    pub final_script_sig: Option<Script>,
    pub final_script_witness: Option<Vec<Vec<u8>>>,

    pub value: Option<u64>,
    pub value_blinding_factor: Option<ValueBlindingFactor>,
    pub asset: Option<AssetId>,
    pub asset_blinding_factor: Option<AssetBlindingFactor>,

    pub unknown: UnknownFields,
}

impl InputRecord {
    pub fn is_finalized(&self) -> bool {
        self.final_script_sig.is_some() || self.final_script_witness.is_some()
    }

    /// Fields that only make sense before finalization.
    pub fn has_signing_fields(&self) -> bool {
        !self.partial_sigs.is_empty()
            || self.sighash_type.is_some()
            || self.redeem_script.is_some()
            || self.witness_script.is_some()
            || !self.bip32_derivation.is_empty()
    }

    pub(crate) fn clear_signing_fields(&mut self) {
        self.partial_sigs.clear();
        self.sighash_type = None;
        self.redeem_script = None;
        self.witness_script = None;
        self.bip32_derivation.clear();
    }

    /// The owner's opening of the spent coin, if every part is known.
    pub fn secrets(&self) -> Option<BlindingSecrets> {
        Some(BlindingSecrets::new(
            self.value?,
            self.asset?,
            self.asset_blinding_factor?,
            self.value_blinding_factor?,
        ))
    }

    pub(crate) fn set_secrets(&mut self, secrets: &BlindingSecrets) {
        self.value = Some(secrets.value);
        self.asset = Some(secrets.asset);
        self.asset_blinding_factor = Some(secrets.abf);
        self.value_blinding_factor = Some(secrets.vbf);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputRecord {
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    pub bip32_derivation: BTreeMap<PublicKey, KeySource>,

    /// Receiver's blinding key. Its presence asks for the output to be blinded.
    pub blinding_pubkey: Option<secp256k1_zkp::PublicKey>,
    pub value_commitment: Option<PedersenCommitment>,
    pub value_blinding_factor: Option<ValueBlindingFactor>,
    pub asset_commitment: Option<Generator>,
    pub asset_blinding_factor: Option<AssetBlindingFactor>,
    pub nonce_commitment: Option<secp256k1_zkp::PublicKey>,
    pub range_proof: Option<Vec<u8>>,
    pub surjection_proof: Option<Vec<u8>>,

    pub unknown: UnknownFields,
}

impl OutputRecord {
    pub fn is_blinded(&self) -> bool {
        self.value_commitment.is_some() && self.asset_commitment.is_some()
    }

    pub fn needs_blinding(&self) -> bool {
        self.blinding_pubkey.is_some() && !self.is_blinded()
    }

    pub(crate) fn clear_blinding(&mut self) {
        self.value_commitment = None;
        self.value_blinding_factor = None;
        self.asset_commitment = None;
        self.asset_blinding_factor = None;
        self.nonce_commitment = None;
        self.range_proof = None;
        self.surjection_proof = None;
    }
}

/// A transaction under collaborative construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Psbt {
    /// The unsigned transaction every party works on. Never altered after creation.
    pub tx: Transaction,
    pub global: GlobalRecord,
    pub inputs: Vec<InputRecord>,
    pub outputs: Vec<OutputRecord>,
}

impl Psbt {
    /// Wrap an unsigned transaction with empty records.
    pub fn new(tx: Transaction) -> Result<Self> {
        let psbt = Self {
            inputs: vec![InputRecord::default(); tx.input.len()],
            outputs: vec![OutputRecord::default(); tx.output.len()],
            global: GlobalRecord::default(),
            tx,
        };
        psbt.validate()?;
        Ok(psbt)
    }

    pub fn outpoint(&self, index: usize) -> Option<OutPoint> {
        self.tx.input.get(index).map(|txin| txin.previous_output)
    }

    pub fn is_input_finalized(&self, index: usize) -> bool {
        self.inputs.get(index).is_some_and(InputRecord::is_finalized)
    }

    pub fn is_fully_finalized(&self) -> bool {
        self.inputs.iter().all(InputRecord::is_finalized)
    }

    /// The output an input spends, from whichever UTXO field is present.
    pub fn spent_output(&self, index: usize) -> Option<TxOut> {
        let record = self.inputs.get(index)?;
        if let Some(txout) = &record.witness_utxo {
            return Some(txout.clone());
        }
        let prev = record.non_witness_utxo.as_ref()?;
        let vout = self.outpoint(index)?.vout as usize;
        prev.output.get(vout).cloned()
    }

    /// Spent outputs for every input, or the index of the first unknown one.
    pub fn spent_outputs(&self) -> std::result::Result<Vec<TxOut>, usize> {
        (0..self.inputs.len())
            .map(|i| self.spent_output(i).ok_or(i))
            .collect()
    }

    pub fn pending_blinding_outputs(&self) -> Vec<usize> {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.needs_blinding())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn needs_blinding(&self) -> bool {
        self.outputs.iter().any(OutputRecord::needs_blinding)
    }

    /// Explicit output amounts and assets from the base transaction.
    pub fn explicit_output(&self, index: usize) -> Option<(u64, AssetId)> {
        let txout = self.tx.output.get(index)?;
        match (txout.value, txout.asset) {
            (Value::Explicit(v), Asset::Explicit(a)) => Some((v, a)),
            _ => None,
        }
    }

    /// Check the structural invariants every role relies on.
    pub fn validate(&self) -> Result<()> {
        if self.inputs.len() != self.tx.input.len() {
            return Err(Error::MalformedDocument(format!(
                "{} input records for {} transaction inputs",
                self.inputs.len(),
                self.tx.input.len()
            )));
        }
        if self.outputs.len() != self.tx.output.len() {
            return Err(Error::MalformedDocument(format!(
                "{} output records for {} transaction outputs",
                self.outputs.len(),
                self.tx.output.len()
            )));
        }
        if let Some(version) = self.global.version.filter(|&v| v != 0) {
            return Err(Error::MalformedDocument(format!(
                "unsupported version {version}"
            )));
        }

        for (i, txin) in self.tx.input.iter().enumerate() {
            if !txin.script_sig.is_empty() || !txin.witness.script_witness.is_empty() {
                return Err(Error::MalformedDocument(format!(
                    "unsigned transaction input {i} has a scriptSig or witness"
                )));
            }
        }
        for (i, txout) in self.tx.output.iter().enumerate() {
            if txout.value.explicit().is_none() || txout.asset.explicit().is_none() {
                return Err(Error::MalformedDocument(format!(
                    "unsigned transaction output {i} is not explicit"
                )));
            }
        }

        for (i, record) in self.inputs.iter().enumerate() {
            if record.is_finalized() && record.has_signing_fields() {
                return Err(Error::MalformedDocument(format!(
                    "input {i} is finalized but still carries signing data"
                )));
            }
            if let Some(prev) = &record.non_witness_utxo {
                let outpoint = self.tx.input[i].previous_output;
                if prev.txid() != outpoint.txid {
                    return Err(Error::MalformedDocument(format!(
                        "input {i} non-witness utxo does not match the spent txid"
                    )));
                }
                let spent = prev.output.get(outpoint.vout as usize).ok_or_else(|| {
                    Error::MalformedDocument(format!(
                        "input {i} spends missing output {}",
                        outpoint.vout
                    ))
                })?;
                if record
                    .witness_utxo
                    .as_ref()
                    .is_some_and(|w| without_witness(w) != without_witness(spent))
                {
                    return Err(Error::MalformedDocument(format!(
                        "input {i} witness utxo disagrees with non-witness utxo"
                    )));
                }
            }
        }

        for (i, record) in self.outputs.iter().enumerate() {
            if record.value_commitment.is_some() != record.asset_commitment.is_some() {
                return Err(Error::MalformedDocument(format!(
                    "output {i} has only one of value and asset commitment"
                )));
            }
        }
        Ok(())
    }

    /// The transaction whose sighashes are signed: the base transaction with
    /// every blinded output's commitments, nonce and proofs applied.
    pub fn signing_transaction(&self) -> Result<Transaction> {
        let mut tx = self.tx.clone();
        for (i, (txout, record)) in tx.output.iter_mut().zip(&self.outputs).enumerate() {
            let (Some(value), Some(asset)) = (record.value_commitment, record.asset_commitment)
            else {
                continue;
            };
            txout.value = Value::Confidential(value);
            txout.asset = Asset::Confidential(asset);
            txout.nonce = record
                .nonce_commitment
                .map(Nonce::Confidential)
                .unwrap_or(Nonce::Null);
            txout.witness = output_witness(i, record)?;
        }
        Ok(tx)
    }
}

/// A transaction output as committed to by its outpoint, proofs dropped.
pub(crate) fn without_witness(txout: &TxOut) -> TxOut {
    TxOut {
        witness: TxOutWitness::default(),
        ..txout.clone()
    }
}

fn output_witness(index: usize, record: &OutputRecord) -> Result<TxOutWitness> {
    let rangeproof = record
        .range_proof
        .as_deref()
        .map(RangeProof::from_slice)
        .transpose()
        .map_err(|e| Error::MalformedDocument(format!("output {index} range proof: {e}")))?;
    let surjection_proof = record
        .surjection_proof
        .as_deref()
        .map(SurjectionProof::from_slice)
        .transpose()
        .map_err(|e| Error::MalformedDocument(format!("output {index} surjection proof: {e}")))?;
    Ok(TxOutWitness {
        surjection_proof: surjection_proof.map(Box::new),
        rangeproof: rangeproof.map(Box::new),
    })
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::{LockTime, Sequence, TxIn, Txid};

    use super::*;

    fn base_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 1),
                is_pegin: false,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                asset_issuance: Default::default(),
                witness: Default::default(),
            }],
            output: vec![TxOut {
                asset: Asset::Explicit(AssetId::from_slice(&[1; 32]).unwrap()),
                value: Value::Explicit(1000),
                nonce: Nonce::Null,
                script_pubkey: Script::new(),
                witness: TxOutWitness::default(),
            }],
        }
    }

    #[test]
    fn new_document_has_one_record_per_entry() {
        let psbt = Psbt::new(base_tx()).unwrap();
        assert_eq!(psbt.inputs.len(), 1);
        assert_eq!(psbt.outputs.len(), 1);
        assert!(!psbt.needs_blinding());
        assert_eq!(psbt.spent_output(0), None);
    }

    #[test]
    fn record_count_mismatch_is_malformed() {
        let mut psbt = Psbt::new(base_tx()).unwrap();
        psbt.outputs.push(OutputRecord::default());
        assert!(matches!(psbt.validate(), Err(Error::MalformedDocument(_))));
    }

    #[test]
    fn finalized_input_cannot_keep_signatures() {
        let mut psbt = Psbt::new(base_tx()).unwrap();
        psbt.inputs[0].final_script_witness = Some(vec![vec![1]]);
        psbt.inputs[0].sighash_type = Some(1);
        assert!(matches!(psbt.validate(), Err(Error::MalformedDocument(_))));
    }

    #[test]
    fn half_committed_output_is_malformed() {
        let mut psbt = Psbt::new(base_tx()).unwrap();
        let secp = secp256k1_zkp::Secp256k1::new();
        psbt.outputs[0].asset_commitment = Some(Generator::new_unblinded(
            &secp,
            AssetId::from_slice(&[1; 32]).unwrap().into_tag(),
        ));
        assert!(matches!(psbt.validate(), Err(Error::MalformedDocument(_))));
    }

    #[test]
    fn non_witness_utxo_must_match_outpoint() {
        let mut psbt = Psbt::new(base_tx()).unwrap();
        psbt.inputs[0].non_witness_utxo = Some(base_tx());
        assert!(matches!(psbt.validate(), Err(Error::MalformedDocument(_))));
    }

    #[test]
    fn pending_outputs_follow_blinding_key() {
        let mut psbt = Psbt::new(base_tx()).unwrap();
        let secp = secp256k1_zkp::Secp256k1::new();
        let sk = secp256k1_zkp::SecretKey::from_slice(&[3; 32]).unwrap();
        psbt.outputs[0].blinding_pubkey = Some(secp256k1_zkp::PublicKey::from_secret_key(&secp, &sk));
        assert_eq!(psbt.pending_blinding_outputs(), vec![0]);
        assert!(psbt.needs_blinding());
    }
}
