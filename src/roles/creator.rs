use std::collections::{BTreeMap, BTreeSet};

use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::secp256k1_zkp;
use lwk_wollet::elements::{
    AssetId, LockTime, OutPoint, Script, Sequence, Transaction, TxIn, TxInWitness, TxOut,
    TxOutWitness,
};

use crate::document::Psbt;
use crate::error::{Error, Result};

/// Largest amount of a single asset a transaction may move, in base units.
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

const SEQUENCE_FINAL: u32 = 0xffff_ffff;
const SEQUENCE_LOCKTIME: u32 = 0xffff_fffe;
const SEQUENCE_RBF: u32 = 0xffff_fffd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub outpoint: OutPoint,
    /// Overrides the sequence derived from the lock time and replaceability.
    pub sequence: Option<u32>,
}

impl From<OutPoint> for InputSpec {
    fn from(outpoint: OutPoint) -> Self {
        Self {
            outpoint,
            sequence: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    Payment {
        script_pubkey: Script,
        asset: AssetId,
        amount: u64,
        /// Set to have the output blinded to this key.
        blinding_pubkey: Option<secp256k1_zkp::PublicKey>,
    },
    Fee {
        asset: AssetId,
        amount: u64,
    },
}

impl OutputSpec {
    fn asset_amount(&self) -> (AssetId, u64) {
        match self {
            OutputSpec::Payment { asset, amount, .. } | OutputSpec::Fee { asset, amount } => {
                (*asset, *amount)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateParams {
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
    pub lock_time: u32,
    pub replaceable: bool,
}

impl CreateParams {
    fn default_sequence(&self) -> u32 {
        if self.replaceable {
            SEQUENCE_RBF
        } else if self.lock_time != 0 {
            SEQUENCE_LOCKTIME
        } else {
            SEQUENCE_FINAL
        }
    }
}

/// Build a fresh document around a new unsigned transaction.
pub fn create_psbt(params: &CreateParams) -> Result<Psbt> {
    if params.inputs.is_empty() && params.outputs.is_empty() {
        return Err(Error::Create(
            "transaction needs at least one input or output".into(),
        ));
    }

    let mut seen = BTreeSet::new();
    for input in &params.inputs {
        if !seen.insert(input.outpoint) {
            return Err(Error::Create(format!(
                "Invalid parameter, duplicated input: {}",
                input.outpoint
            )));
        }
    }

    let mut totals: BTreeMap<AssetId, u64> = BTreeMap::new();
    let mut fee_assets = BTreeSet::new();
    for (i, spec) in params.outputs.iter().enumerate() {
        let (asset, amount) = spec.asset_amount();
        if amount > MAX_MONEY {
            return Err(Error::Create(format!("output {i}: amount out of range")));
        }
        if let OutputSpec::Payment {
            blinding_pubkey: Some(_),
            ..
        } = spec
        {
            if amount == 0 {
                return Err(Error::Create(format!(
                    "output {i}: a confidential payment must carry a positive amount"
                )));
            }
        }
        if let OutputSpec::Fee { .. } = spec {
            if amount == 0 {
                return Err(Error::Create(format!("output {i}: fee must be positive")));
            }
            if !fee_assets.insert(asset) {
                return Err(Error::Create(format!(
                    "output {i}: fee already specified for asset {asset}"
                )));
            }
        }
        let total = totals.entry(asset).or_default();
        *total = total
            .checked_add(amount)
            .filter(|t| *t <= MAX_MONEY)
            .ok_or_else(|| Error::Create(format!("total for asset {asset} out of range")))?;
    }

    let default_sequence = params.default_sequence();
    let input = params
        .inputs
        .iter()
        .map(|spec| TxIn {
            previous_output: spec.outpoint,
            is_pegin: false,
            script_sig: Script::new(),
            sequence: Sequence::from_consensus(spec.sequence.unwrap_or(default_sequence)),
            asset_issuance: Default::default(),
            witness: TxInWitness::default(),
        })
        .collect();
    let output = params.outputs.iter().map(base_output).collect();

    let tx = Transaction {
        version: 2,
        lock_time: LockTime::from_consensus(params.lock_time),
        input,
        output,
    };

    let mut psbt = Psbt::new(tx)?;
    for (record, spec) in psbt.outputs.iter_mut().zip(&params.outputs) {
        if let OutputSpec::Payment {
            blinding_pubkey, ..
        } = spec
        {
            record.blinding_pubkey = *blinding_pubkey;
        }
    }

    log::info!(
        "created PSBT with {} inputs and {} outputs",
        psbt.inputs.len(),
        psbt.outputs.len()
    );
    Ok(psbt)
}

fn base_output(spec: &OutputSpec) -> TxOut {
    let (asset, amount) = spec.asset_amount();
    let script_pubkey = match spec {
        OutputSpec::Payment { script_pubkey, .. } => script_pubkey.clone(),
        OutputSpec::Fee { .. } => Script::new(),
    };
    TxOut {
        asset: Asset::Explicit(asset),
        value: Value::Explicit(amount),
        nonce: Nonce::Null,
        script_pubkey,
        witness: TxOutWitness::default(),
    }
}
