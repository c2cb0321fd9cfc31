//! Read-only report of where a document stands and who has to act next.

use serde::Serialize;

use lwk_wollet::elements::Script;
use lwk_wollet::elements::secp256k1_zkp::Secp256k1;
use lwk_wollet::elements::sighash::SighashCache;

use crate::document::Psbt;
use crate::roles::{SignatureSet, input_plan, valid_signatures};
use crate::script::{DummySatisfier, Leaf, PlanError, hash160, plan_spend};

/// The role that can move a document forward. Ordered by workflow position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Creator,
    Updater,
    Blinder,
    Signer,
    Finalizer,
    Extractor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Updated,
    Blinded,
    PartiallySigned,
    Complete,
    Finalized,
}

/// What an input still lacks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Missing {
    /// HASH160 of each key whose signature is still needed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputAnalysis {
    pub has_utxo: bool,
    pub is_final: bool,
    pub next: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Missing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PsbtAnalysis {
    pub inputs: Vec<InputAnalysis>,
    pub next: Role,
    /// Sum of the explicit fee outputs, when they all pay the same asset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_vsize: Option<usize>,
    /// Fee rate in base units per 1000 virtual bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_feerate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Analyze a document. Problems are reported in the result, never raised.
pub fn analyze_psbt(psbt: &Psbt) -> PsbtAnalysis {
    if let Err(e) = psbt.validate() {
        return PsbtAnalysis {
            inputs: Vec::new(),
            next: Role::Creator,
            fee: None,
            estimated_vsize: None,
            estimated_feerate: None,
            error: Some(e.to_string()),
        };
    }

    let inputs: Vec<_> = (0..psbt.inputs.len()).map(|i| analyze_input(psbt, i)).collect();
    let mut next = inputs.iter().map(|i| i.next).min().unwrap_or(Role::Extractor);
    if psbt.needs_blinding() {
        next = next.min(Role::Blinder);
    }

    let fee = fee(psbt);
    let estimated_vsize = estimate_vsize(psbt);
    let estimated_feerate = match (fee, estimated_vsize) {
        (Some(fee), Some(vsize)) if vsize > 0 => Some(fee.saturating_mul(1000) / vsize as u64),
        _ => None,
    };

    PsbtAnalysis {
        inputs,
        next,
        fee,
        estimated_vsize,
        estimated_feerate,
        error: None,
    }
}

fn analyze_input(psbt: &Psbt, index: usize) -> InputAnalysis {
    let record = &psbt.inputs[index];
    let has_utxo = psbt.spent_output(index).is_some();
    if record.is_finalized() {
        return InputAnalysis {
            has_utxo,
            is_final: true,
            next: Role::Extractor,
            missing: None,
        };
    }
    let Some(spent) = psbt.spent_output(index) else {
        return InputAnalysis {
            has_utxo,
            is_final: false,
            next: Role::Updater,
            missing: None,
        };
    };

    let plan = match plan_spend(
        &spent.script_pubkey,
        record.redeem_script.as_ref(),
        record.witness_script.as_ref(),
    ) {
        Ok(plan) => plan,
        Err(e) => {
            let missing = match e {
                PlanError::MissingRedeemScript(hash) => Some(Missing {
                    redeem_script: Some(hash),
                    ..Default::default()
                }),
                PlanError::MissingWitnessScript(hash) => Some(Missing {
                    witness_script: Some(hash),
                    ..Default::default()
                }),
                _ => None,
            };
            return InputAnalysis {
                has_utxo,
                is_final: false,
                next: Role::Updater,
                missing,
            };
        }
    };

    // Signatures only count once the outputs they commit to are settled.
    let valid = match psbt.signing_transaction() {
        Ok(tx) => {
            let secp = Secp256k1::verification_only();
            let mut cache = SighashCache::new(&tx);
            valid_signatures(&secp, &mut cache, index, &plan, &spent, &record.partial_sigs)
        }
        Err(_) => Default::default(),
    };
    if plan.satisfy(&SignatureSet(&valid)).is_ok() {
        return InputAnalysis {
            has_utxo,
            is_final: false,
            next: Role::Finalizer,
            missing: None,
        };
    }

    let signatures = match &plan.leaf {
        Leaf::KeyHash(hash) => vec![hex::encode(hash)],
        Leaf::Multisig { keys, .. } => keys
            .iter()
            .filter(|k| !valid.contains_key(k))
            .map(|k| hex::encode(hash160(&k.to_bytes())))
            .collect(),
    };
    InputAnalysis {
        has_utxo,
        is_final: false,
        next: if psbt.needs_blinding() {
            Role::Blinder
        } else {
            Role::Signer
        },
        missing: Some(Missing {
            signatures,
            ..Default::default()
        }),
    }
}

fn fee(psbt: &Psbt) -> Option<u64> {
    let mut asset = None;
    let mut total = 0u64;
    for (index, txout) in psbt.tx.output.iter().enumerate() {
        if !txout.script_pubkey.is_empty() {
            continue;
        }
        let (value, fee_asset) = psbt.explicit_output(index)?;
        if asset.is_some_and(|a| a != fee_asset) {
            return None;
        }
        asset = Some(fee_asset);
        total = total.checked_add(value)?;
    }
    asset.map(|_| total)
}

/// Size of the final transaction, using placeholder signatures for inputs
/// that are not final yet.
fn estimate_vsize(psbt: &Psbt) -> Option<usize> {
    if psbt.needs_blinding() {
        return None;
    }
    let mut tx = psbt.signing_transaction().ok()?;
    for (index, txin) in tx.input.iter_mut().enumerate() {
        let record = &psbt.inputs[index];
        if record.is_finalized() {
            txin.script_sig = record.final_script_sig.clone().unwrap_or_else(Script::new);
            txin.witness.script_witness = record.final_script_witness.clone().unwrap_or_default();
            continue;
        }
        let (_, plan) = input_plan(psbt, index).ok()?;
        let (script_sig, witness) = plan.satisfy(&DummySatisfier).ok()?;
        txin.script_sig = script_sig;
        txin.witness.script_witness = witness;
    }
    Some(tx.weight().div_ceil(4))
}

/// Where the document sits in the role workflow.
pub fn stage(psbt: &Psbt) -> Stage {
    if !psbt.inputs.is_empty() && psbt.is_fully_finalized() {
        return Stage::Finalized;
    }
    let analysis = analyze_psbt(psbt);
    if !analysis.inputs.is_empty() && analysis.next >= Role::Finalizer {
        return Stage::Complete;
    }
    if psbt.inputs.iter().any(|i| !i.partial_sigs.is_empty()) {
        return Stage::PartiallySigned;
    }
    if !psbt.needs_blinding() && psbt.outputs.iter().any(|o| o.is_blinded()) {
        return Stage::Blinded;
    }
    if !psbt.inputs.is_empty() && analysis.inputs.iter().all(|i| i.has_utxo) {
        return Stage::Updated;
    }
    Stage::Created
}
