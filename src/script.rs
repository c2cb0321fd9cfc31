//! Standard script templates: recognising them, building them, and turning
//! signatures into the scriptSig / witness that satisfies them.

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::hashes::{Hash, hash160, sha256};
use lwk_wollet::elements::opcodes::{self, all::OP_CHECKMULTISIG};
use lwk_wollet::elements::script::{Builder, Instruction};
use lwk_wollet::elements::{PubkeyHash, Script, WPubkeyHash};
use thiserror::Error;

/// Placeholder sizes used when estimating a satisfaction.
pub const DUMMY_SIGNATURE_LEN: usize = 72;
pub const DUMMY_PUBKEY_LEN: usize = 33;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh([u8; 20]),
    P2wpkh([u8; 20]),
    P2sh([u8; 20]),
    P2wsh([u8; 32]),
    Multisig { threshold: usize, keys: Vec<PublicKey> },
    NonStandard,
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    hash160::Hash::hash(data).to_byte_array()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).to_byte_array()
}

pub fn classify(script: &Script) -> ScriptKind {
    let b = script.as_bytes();
    if script.is_p2pkh() {
        ScriptKind::P2pkh(copy_array(&b[3..23]))
    } else if script.is_v0_p2wpkh() {
        ScriptKind::P2wpkh(copy_array(&b[2..]))
    } else if script.is_v0_p2wsh() {
        ScriptKind::P2wsh(copy_array(&b[2..]))
    } else if script.is_p2sh() {
        ScriptKind::P2sh(copy_array(&b[2..22]))
    } else {
        parse_multisig(script).unwrap_or(ScriptKind::NonStandard)
    }
}

fn copy_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// The value of OP_1 through OP_16.
fn push_num(op: opcodes::All) -> Option<usize> {
    match op.classify(opcodes::ClassifyContext::Legacy) {
        opcodes::Class::PushNum(n) if n > 0 => Some(n as usize),
        _ => None,
    }
}

fn parse_multisig(script: &Script) -> Option<ScriptKind> {
    let instructions = script
        .instructions_minimal()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let (first, rest) = instructions.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (total, body) = rest.split_last()?;
    if last.op()? != OP_CHECKMULTISIG {
        return None;
    }
    let threshold = push_num(first.op()?)?;
    let total = push_num(total.op()?)?;

    let keys = body
        .iter()
        .map(|i| i.push_bytes().and_then(|b| PublicKey::from_slice(b).ok()))
        .collect::<Option<Vec<_>>>()?;
    (keys.len() == total && threshold <= total).then_some(ScriptKind::Multisig { threshold, keys })
}

/// The data items of a push-only script, or `None` if it does anything else.
/// OP_1 through OP_16 count as one-byte items.
pub fn pushed_items(script: &Script) -> Option<Vec<Vec<u8>>> {
    script
        .instructions()
        .map(|instruction| match instruction.ok()? {
            Instruction::PushBytes(data) => Some(data.to_vec()),
            Instruction::Op(op) => push_num(op).map(|n| vec![n as u8]),
        })
        .collect()
}

pub fn p2pkh_from_hash(hash: &[u8; 20]) -> Script {
    Script::new_p2pkh(&PubkeyHash::from_byte_array(*hash))
}

pub fn p2pkh(pubkey: &PublicKey) -> Script {
    Script::new_p2pkh(&PubkeyHash::hash(&pubkey.to_bytes()))
}

pub fn p2wpkh(pubkey: &PublicKey) -> Script {
    Script::new_v0_wpkh(&WPubkeyHash::hash(&pubkey.to_bytes()))
}

pub fn p2sh(redeem_script: &Script) -> Script {
    Script::new_p2sh(&redeem_script.script_hash())
}

pub fn p2wsh(witness_script: &Script) -> Script {
    Script::new_v0_wsh(&witness_script.wscript_hash())
}

/// `threshold`-of-`keys.len()` CHECKMULTISIG. At most 16 keys.
pub fn multisig(threshold: usize, keys: &[PublicKey]) -> Script {
    keys.iter()
        .fold(Builder::new().push_int(threshold as i64), |builder, key| builder.push_key(key))
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

// ── Spend planning ──────────────────────────────────────────────────────

/// What must be proven at the bottom of the script stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    KeyHash([u8; 20]),
    Multisig { threshold: usize, keys: Vec<PublicKey> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPlan {
    pub leaf: Leaf,
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    /// Script committed to by the sighash.
    pub script_code: Script,
    pub segwit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("missing redeem script with hash {0}")]
    MissingRedeemScript(String),

    #[error("missing witness script with hash {0}")]
    MissingWitnessScript(String),

    #[error("redeem script does not match the spent script hash")]
    RedeemScriptMismatch,

    #[error("witness script does not match the spent script hash")]
    WitnessScriptMismatch,

    #[error("unsupported script template")]
    Unsupported,
}

fn leaf_of(script: &Script) -> Result<Leaf, PlanError> {
    match classify(script) {
        ScriptKind::P2pkh(hash) => Ok(Leaf::KeyHash(hash)),
        ScriptKind::Multisig { threshold, keys } => Ok(Leaf::Multisig { threshold, keys }),
        _ => Err(PlanError::Unsupported),
    }
}

fn plan_witness_script(
    hash: [u8; 32],
    witness_script: Option<&Script>,
) -> Result<(Leaf, Script), PlanError> {
    let ws = witness_script.ok_or_else(|| PlanError::MissingWitnessScript(hex::encode(hash)))?;
    if sha256(ws.as_bytes()) != hash {
        return Err(PlanError::WitnessScriptMismatch);
    }
    Ok((leaf_of(ws)?, ws.clone()))
}

/// Work out how an output with `script_pubkey` is spent, given whatever
/// redeem and witness scripts are known.
pub fn plan_spend(
    script_pubkey: &Script,
    redeem_script: Option<&Script>,
    witness_script: Option<&Script>,
) -> Result<SpendPlan, PlanError> {
    match classify(script_pubkey) {
        ScriptKind::P2pkh(hash) => Ok(SpendPlan {
            leaf: Leaf::KeyHash(hash),
            redeem_script: None,
            witness_script: None,
            script_code: script_pubkey.clone(),
            segwit: false,
        }),
        ScriptKind::P2wpkh(hash) => Ok(SpendPlan {
            leaf: Leaf::KeyHash(hash),
            redeem_script: None,
            witness_script: None,
            script_code: p2pkh_from_hash(&hash),
            segwit: true,
        }),
        ScriptKind::P2wsh(hash) => {
            let (leaf, ws) = plan_witness_script(hash, witness_script)?;
            Ok(SpendPlan {
                leaf,
                redeem_script: None,
                script_code: ws.clone(),
                witness_script: Some(ws),
                segwit: true,
            })
        }
        ScriptKind::P2sh(hash) => {
            let rs = redeem_script.ok_or_else(|| PlanError::MissingRedeemScript(hex::encode(hash)))?;
            if hash160(rs.as_bytes()) != hash {
                return Err(PlanError::RedeemScriptMismatch);
            }
            match classify(rs) {
                ScriptKind::P2wpkh(inner) => Ok(SpendPlan {
                    leaf: Leaf::KeyHash(inner),
                    redeem_script: Some(rs.clone()),
                    witness_script: None,
                    script_code: p2pkh_from_hash(&inner),
                    segwit: true,
                }),
                ScriptKind::P2wsh(inner) => {
                    let (leaf, ws) = plan_witness_script(inner, witness_script)?;
                    Ok(SpendPlan {
                        leaf,
                        redeem_script: Some(rs.clone()),
                        script_code: ws.clone(),
                        witness_script: Some(ws),
                        segwit: true,
                    })
                }
                _ => Ok(SpendPlan {
                    leaf: leaf_of(rs)?,
                    redeem_script: Some(rs.clone()),
                    witness_script: None,
                    script_code: rs.clone(),
                    segwit: false,
                }),
            }
        }
        ScriptKind::Multisig { threshold, keys } => Ok(SpendPlan {
            leaf: Leaf::Multisig { threshold, keys },
            redeem_script: None,
            witness_script: None,
            script_code: script_pubkey.clone(),
            segwit: false,
        }),
        ScriptKind::NonStandard => Err(PlanError::Unsupported),
    }
}

/// Source of signatures when assembling a final scriptSig / witness.
pub trait Satisfier {
    /// A serialized public key hashing to `hash` plus its signature.
    fn key_hash_signature(&self, hash: &[u8; 20]) -> Option<(Vec<u8>, Vec<u8>)>;

    fn signature(&self, key: &PublicKey) -> Option<Vec<u8>>;
}

/// Stands in for real signatures when only the size matters.
pub struct DummySatisfier;

impl Satisfier for DummySatisfier {
    fn key_hash_signature(&self, _hash: &[u8; 20]) -> Option<(Vec<u8>, Vec<u8>)> {
        Some((vec![0x02; DUMMY_PUBKEY_LEN], vec![0; DUMMY_SIGNATURE_LEN]))
    }

    fn signature(&self, _key: &PublicKey) -> Option<Vec<u8>> {
        Some(vec![0; DUMMY_SIGNATURE_LEN])
    }
}

/// Signatures available toward a plan, and how many it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    pub have: usize,
    pub need: usize,
}

impl SpendPlan {
    pub fn required_signatures(&self) -> usize {
        match &self.leaf {
            Leaf::KeyHash(_) => 1,
            Leaf::Multisig { threshold, .. } => *threshold,
        }
    }

    /// Public keys the leaf names directly. Empty for key-hash leaves.
    pub fn keys(&self) -> &[PublicKey] {
        match &self.leaf {
            Leaf::KeyHash(_) => &[],
            Leaf::Multisig { keys, .. } => keys,
        }
    }

    /// True when `key` can sign for this plan.
    pub fn involves(&self, key: &PublicKey) -> bool {
        match &self.leaf {
            Leaf::KeyHash(hash) => hash160(&key.to_bytes()) == *hash,
            Leaf::Multisig { keys, .. } => keys.contains(key),
        }
    }

    /// Build the final scriptSig and witness stack.
    pub fn satisfy<S: Satisfier + ?Sized>(
        &self,
        satisfier: &S,
    ) -> Result<(Script, Vec<Vec<u8>>), Quorum> {
        let stack = match &self.leaf {
            Leaf::KeyHash(hash) => {
                let (pubkey, sig) = satisfier
                    .key_hash_signature(hash)
                    .ok_or(Quorum { have: 0, need: 1 })?;
                vec![sig, pubkey]
            }
            Leaf::Multisig { threshold, keys } => {
                let sigs: Vec<Vec<u8>> = keys
                    .iter()
                    .filter_map(|k| satisfier.signature(k))
                    .take(*threshold)
                    .collect();
                if sigs.len() < *threshold {
                    return Err(Quorum {
                        have: sigs.len(),
                        need: *threshold,
                    });
                }
                // CHECKMULTISIG pops one extra element.
                std::iter::once(Vec::new()).chain(sigs).collect()
            }
        };

        let redeem = self.redeem_script.as_ref();
        if self.segwit {
            let mut witness = stack;
            if let Some(ws) = &self.witness_script {
                witness.push(ws.to_bytes());
            }
            let script_sig = redeem
                .into_iter()
                .fold(Builder::new(), |builder, rs| builder.push_slice(rs.as_bytes()));
            Ok((script_sig.into_script(), witness))
        } else {
            let script_sig = stack
                .iter()
                .map(Vec::as_slice)
                .chain(redeem.map(|rs| rs.as_bytes()))
                .fold(Builder::new(), |builder, item| builder.push_slice(item));
            Ok((script_sig.into_script(), Vec::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::secp256k1_zkp::{Secp256k1, SecretKey};

    use super::*;

    fn key(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::new(lwk_wollet::elements::secp256k1_zkp::PublicKey::from_secret_key(&secp, &sk))
    }

    struct Fixed(Vec<PublicKey>);

    impl Satisfier for Fixed {
        fn key_hash_signature(&self, hash: &[u8; 20]) -> Option<(Vec<u8>, Vec<u8>)> {
            self.0
                .iter()
                .find(|k| hash160(&k.to_bytes()) == *hash)
                .map(|k| (k.to_bytes(), vec![0xAA]))
        }

        fn signature(&self, key: &PublicKey) -> Option<Vec<u8>> {
            self.0.contains(key).then(|| key.to_bytes()[1..3].to_vec())
        }
    }

    #[test]
    fn builders_classify_back() {
        let k = key(1);
        assert!(matches!(classify(&p2pkh(&k)), ScriptKind::P2pkh(_)));
        assert!(matches!(classify(&p2wpkh(&k)), ScriptKind::P2wpkh(_)));
        let ms = multisig(2, &[key(1), key(2), key(3)]);
        assert_eq!(
            classify(&ms),
            ScriptKind::Multisig {
                threshold: 2,
                keys: vec![key(1), key(2), key(3)]
            }
        );
        assert!(matches!(classify(&p2sh(&ms)), ScriptKind::P2sh(_)));
        assert!(matches!(classify(&p2wsh(&ms)), ScriptKind::P2wsh(_)));
        assert_eq!(classify(&Script::new()), ScriptKind::NonStandard);
    }

    #[test]
    fn pushed_items_reads_every_push_form() {
        let script = Builder::new()
            .push_slice(&[])
            .push_slice(&[7; 75])
            .push_slice(&[8; 76])
            .push_slice(&[9; 300])
            .push_int(3)
            .into_script();
        let items = pushed_items(&script).unwrap();
        assert_eq!(items, vec![vec![], vec![7; 75], vec![8; 76], vec![9; 300], vec![3]]);

        assert_eq!(pushed_items(&p2pkh(&key(1))), None);
        // Truncated push.
        assert_eq!(pushed_items(&Script::from(vec![0x4c, 0x05, 0x01])), None);
    }

    #[test]
    fn templates_match_their_byte_layout() {
        let k = key(2);
        let spk = p2pkh(&k);
        assert_eq!(spk.len(), 25);
        assert_eq!(classify(&spk), ScriptKind::P2pkh(hash160(&k.to_bytes())));
        assert_eq!(p2pkh_from_hash(&hash160(&k.to_bytes())), spk);

        let ms = multisig(1, &[k]);
        assert_eq!(classify(&p2wsh(&ms)), ScriptKind::P2wsh(sha256(ms.as_bytes())));
        assert_eq!(classify(&p2sh(&ms)), ScriptKind::P2sh(hash160(ms.as_bytes())));
        assert_eq!(ms.as_bytes()[0], 0x51);
        assert_eq!(ms.as_bytes()[ms.len() - 1], 0xae);
    }

    #[test]
    fn wrapped_witness_key_hash_plan() {
        let k = key(4);
        let redeem = p2wpkh(&k);
        let plan = plan_spend(&p2sh(&redeem), Some(&redeem), None).unwrap();
        assert!(plan.segwit);
        assert_eq!(plan.script_code, p2pkh(&k));
        assert!(plan.involves(&k));

        let (script_sig, witness) = plan.satisfy(&Fixed(vec![k])).unwrap();
        let expected = Builder::new().push_slice(redeem.as_bytes()).into_script();
        assert_eq!(script_sig, expected);
        assert_eq!(witness, vec![vec![0xAA], k.to_bytes()]);
    }

    #[test]
    fn witness_script_hash_needs_script() {
        let ms = multisig(1, &[key(1)]);
        assert!(matches!(
            plan_spend(&p2wsh(&ms), None, None),
            Err(PlanError::MissingWitnessScript(_))
        ));
        let other = multisig(1, &[key(2)]);
        assert_eq!(
            plan_spend(&p2wsh(&ms), None, Some(&other)),
            Err(PlanError::WitnessScriptMismatch)
        );
    }

    #[test]
    fn multisig_takes_signatures_in_key_order() {
        let ms = multisig(2, &[key(1), key(2), key(3)]);
        let plan = plan_spend(&p2wsh(&ms), None, Some(&ms)).unwrap();
        assert_eq!(plan.required_signatures(), 2);

        let short = plan.satisfy(&Fixed(vec![key(3)])).unwrap_err();
        assert_eq!(short, Quorum { have: 1, need: 2 });

        let (script_sig, witness) = plan.satisfy(&Fixed(vec![key(3), key(1)])).unwrap();
        assert!(script_sig.is_empty());
        assert_eq!(witness.len(), 4);
        assert!(witness[0].is_empty());
        assert_eq!(witness[1], key(1).to_bytes()[1..3].to_vec());
        assert_eq!(witness[2], key(3).to_bytes()[1..3].to_vec());
        assert_eq!(witness[3], ms.to_bytes());
    }

    #[test]
    fn legacy_multisig_goes_in_script_sig() {
        let ms = multisig(1, &[key(1), key(2)]);
        let plan = plan_spend(&p2sh(&ms), Some(&ms), None).unwrap();
        assert!(!plan.segwit);
        let (script_sig, witness) = plan.satisfy(&DummySatisfier).unwrap();
        assert!(witness.is_empty());
        assert_eq!(script_sig.as_bytes()[0], 0x00);

        let items = pushed_items(&script_sig).unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_empty());
        assert_eq!(items[1].len(), DUMMY_SIGNATURE_LEN);
        assert_eq!(items[2], ms.to_bytes());
        assert_eq!(pushed_items(&ms), None);
    }
}
