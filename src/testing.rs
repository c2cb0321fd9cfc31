//! In-memory chain for exercising the full role workflow without a network.
//!
//! [`MemoryChain`] acts as both the UTXO source and the ledger. Submitted
//! transactions are checked for balanced amounts, valid proofs and a valid
//! signature on every input before their outputs become spendable.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::hashes::Hash;
use lwk_wollet::elements::secp256k1_zkp::{self, Secp256k1, SecretKey};
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{
    AssetId, LockTime, OutPoint, Script, Sequence, Transaction, TxIn, TxOut, TxOutWitness, Txid,
};
use rand::thread_rng;

use crate::chain::{Ledger, OutputInfo, SpentOutput, UtxoSource};
use crate::commitment::{BlindingSecrets, asset_generator, unblind_txout, value_commitment};
use crate::document::without_witness;
use crate::error::{Error, Result};
use crate::roles::signature_verifies;
use crate::script::{Leaf, ScriptKind, classify, hash160, plan_spend, pushed_items};

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

/// Build a compressed public key from a repeated secret byte.
pub fn test_key(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).expect("valid secret key");
    let pk = PublicKey::new(secp256k1_zkp::PublicKey::from_secret_key(&secp, &sk));
    (sk, pk)
}

/// Blinding key pair for receiving confidential outputs.
pub fn test_blinding_key(byte: u8) -> (SecretKey, secp256k1_zkp::PublicKey) {
    let (sk, pk) = test_key(byte);
    (sk, pk.inner)
}

pub fn test_asset(byte: u8) -> AssetId {
    AssetId::from_slice(&[byte; 32]).expect("valid asset")
}

/// Build an explicit (non-confidential) TxOut for tests.
pub fn explicit_txout(asset: AssetId, amount: u64, spk: &Script) -> TxOut {
    TxOut {
        asset: Asset::Explicit(asset),
        value: Value::Explicit(amount),
        nonce: Nonce::Null,
        script_pubkey: spk.clone(),
        witness: TxOutWitness::default(),
    }
}

// ---------------------------------------------------------------------------
// MemoryChain
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChainState {
    transactions: HashMap<Txid, Transaction>,
    unspent: BTreeMap<OutPoint, SpentOutput>,
    scripts: HashMap<Script, OutputInfo>,
    submitted: Vec<Txid>,
    next_funding: u32,
}

#[derive(Default)]
pub struct MemoryChain {
    state: Mutex<ChainState>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Teach the chain the scripts behind `script_pubkey`, as a wallet that
    /// owns it would know them.
    pub fn register_script(&self, script_pubkey: &Script, info: OutputInfo) {
        self.state().scripts.insert(script_pubkey.clone(), info);
    }

    /// Create an explicit coin out of thin air.
    pub fn fund_explicit(&self, script_pubkey: &Script, asset: AssetId, value: u64) -> OutPoint {
        let txout = explicit_txout(asset, value, script_pubkey);
        self.fund(txout, Some(BlindingSecrets::explicit(value, asset)))
    }

    /// Create a blinded coin and return its opening.
    pub fn fund_confidential(
        &self,
        script_pubkey: &Script,
        asset: AssetId,
        value: u64,
    ) -> (OutPoint, BlindingSecrets) {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        let secrets = BlindingSecrets::new(
            value,
            asset,
            AssetBlindingFactor::new(&mut rng),
            ValueBlindingFactor::new(&mut rng),
        );
        let generator = asset_generator(&secp, asset, secrets.abf);
        let txout = TxOut {
            asset: Asset::Confidential(generator),
            value: Value::Confidential(value_commitment(&secp, value, generator, secrets.vbf)),
            nonce: Nonce::Null,
            script_pubkey: script_pubkey.clone(),
            witness: TxOutWitness::default(),
        };
        (self.fund(txout, Some(secrets)), secrets)
    }

    fn fund(&self, txout: TxOut, secrets: Option<BlindingSecrets>) -> OutPoint {
        let mut state = self.state();
        state.next_funding += 1;
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&state.next_funding.to_le_bytes());
        let tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array(seed), 0),
                is_pegin: false,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                asset_issuance: Default::default(),
                witness: Default::default(),
            }],
            output: vec![txout],
        };
        let outpoint = OutPoint::new(tx.txid(), 0);
        let mut spent = SpentOutput::new(tx.output[0].clone()).with_prev_tx(tx.clone());
        spent.secrets = secrets;
        state.unspent.insert(outpoint, spent);
        state.transactions.insert(tx.txid(), tx);
        outpoint
    }

    /// Record the opening of a blinded coin the holder of `blinding_key`
    /// received.
    pub fn unblind(&self, outpoint: &OutPoint, blinding_key: SecretKey) -> Result<BlindingSecrets> {
        let secp = Secp256k1::new();
        let mut state = self.state();
        let tx = state
            .transactions
            .get(&outpoint.txid)
            .ok_or(Error::UtxoNotFound(*outpoint))?;
        let txout = tx
            .output
            .get(outpoint.vout as usize)
            .ok_or(Error::UtxoNotFound(*outpoint))?;
        let secrets = unblind_txout(&secp, txout, blinding_key)
            .map_err(|e| Error::Blinding(e.to_string()))?;
        let entry = state
            .unspent
            .get_mut(outpoint)
            .ok_or(Error::UtxoNotFound(*outpoint))?;
        entry.secrets = Some(secrets);
        Ok(secrets)
    }

    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.state().unspent.contains_key(outpoint)
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.state().transactions.get(txid).cloned()
    }

    pub fn submitted(&self) -> Vec<Txid> {
        self.state().submitted.clone()
    }
}

impl UtxoSource for MemoryChain {
    fn lookup(&self, outpoint: &OutPoint) -> Result<SpentOutput> {
        let state = self.state();
        let spent = state
            .unspent
            .get(outpoint)
            .cloned()
            .ok_or(Error::UtxoNotFound(*outpoint))?;
        Ok(match state.scripts.get(&spent.txout.script_pubkey) {
            Some(info) => spent.with_scripts(info),
            None => spent,
        })
    }

    fn output_info(&self, script_pubkey: &Script) -> Option<OutputInfo> {
        self.state().scripts.get(script_pubkey).cloned()
    }
}

impl Ledger for MemoryChain {
    fn submit(&self, tx: &Transaction) -> Result<Txid> {
        let secp = Secp256k1::new();
        let mut state = self.state();

        let mut spent = Vec::with_capacity(tx.input.len());
        for (index, txin) in tx.input.iter().enumerate() {
            let utxo = state.unspent.get(&txin.previous_output).ok_or_else(|| {
                Error::LedgerRejected(format!("input {index}: missing or spent coin"))
            })?;
            spent.push(without_witness(&utxo.txout));
        }

        tx.verify_tx_amt_proofs(&secp, &spent)
            .map_err(|e| Error::LedgerRejected(format!("amounts: {e:?}")))?;

        let mut cache = SighashCache::new(tx);
        for (index, spent) in spent.iter().enumerate() {
            if !input_is_satisfied(&secp, &mut cache, tx, index, spent) {
                return Err(Error::LedgerRejected(format!(
                    "input {index}: missing or invalid signatures"
                )));
            }
        }

        let txid = tx.txid();
        for txin in &tx.input {
            state.unspent.remove(&txin.previous_output);
        }
        for (vout, txout) in tx.output.iter().enumerate() {
            if txout.script_pubkey.is_empty() {
                continue;
            }
            let outpoint = OutPoint::new(txid, vout as u32);
            let mut coin = SpentOutput::new(txout.clone()).with_prev_tx(tx.clone());
            if let (Value::Explicit(v), Asset::Explicit(a)) = (txout.value, txout.asset) {
                coin.secrets = Some(BlindingSecrets::explicit(v, a));
            }
            state.unspent.insert(outpoint, coin);
        }
        state.transactions.insert(txid, tx.clone());
        state.submitted.push(txid);
        log::info!("accepted {txid}");
        Ok(txid)
    }
}

/// Check that the scriptSig and witness of input `index` carry enough valid
/// signatures for the spent script.
fn input_is_satisfied(
    secp: &Secp256k1<secp256k1_zkp::All>,
    cache: &mut SighashCache<&Transaction>,
    tx: &Transaction,
    index: usize,
    spent: &TxOut,
) -> bool {
    let txin = &tx.input[index];
    let Some(script_items) = pushed_items(&txin.script_sig) else {
        return false;
    };
    let witness = &txin.witness.script_witness;

    let redeem_script = match classify(&spent.script_pubkey) {
        ScriptKind::P2sh(_) => script_items.last().map(|b| Script::from(b.clone())),
        _ => None,
    };
    let witness_script = witness.last().map(|b| Script::from(b.clone()));
    let Ok(plan) = plan_spend(
        &spent.script_pubkey,
        redeem_script.as_ref(),
        witness_script.as_ref(),
    ) else {
        return false;
    };

    // The stack below any trailing redeem or witness script.
    let stack: &[Vec<u8>] = match (plan.segwit, &plan.witness_script, &plan.redeem_script) {
        (true, Some(_), _) => &witness[..witness.len().saturating_sub(1)],
        (true, None, _) => witness.as_slice(),
        (false, _, Some(_)) => &script_items[..script_items.len().saturating_sub(1)],
        (false, _, None) => script_items.as_slice(),
    };
    let verifies = |pk: &PublicKey, sig: &[u8], cache: &mut SighashCache<&Transaction>| {
        signature_verifies(secp, cache, index, &plan, spent, pk, sig)
    };

    match &plan.leaf {
        Leaf::KeyHash(hash) => {
            let [sig, pk] = stack else {
                return false;
            };
            let Ok(pk) = PublicKey::from_slice(pk) else {
                return false;
            };
            hash160(&pk.to_bytes()) == *hash && verifies(&pk, sig, cache)
        }
        Leaf::Multisig { threshold, keys } => {
            // CHECKMULTISIG pops a dummy element, then walks keys and
            // signatures in order.
            let Some((dummy, sigs)) = stack.split_first() else {
                return false;
            };
            if !dummy.is_empty() || sigs.len() < *threshold {
                return false;
            }
            let mut key_iter = keys.iter();
            sigs.iter()
                .all(|sig| key_iter.by_ref().any(|k| verifies(k, sig, cache)))
        }
    }
}
