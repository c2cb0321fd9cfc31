//! Pedersen commitment arithmetic for confidential outputs.
//!
//! Everything here works on plain values, assets and blinding factors and has
//! no knowledge of the PSBT document. A coin's value commitment is
//! `v*H_a + vbf*G` where `H_a = H(asset) + abf*G`, so the transaction balances
//! exactly when `sum_in(v*abf + vbf) == sum_out(v*abf + vbf)`.

use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::secp256k1_zkp::{
    self, All, Generator, PedersenCommitment, PublicKey, RangeProof, Secp256k1, SecretKey,
    SurjectionProof, Tag, Tweak,
};
use lwk_wollet::elements::{AssetId, Script, TxOut, TxOutSecrets};
use rand::{CryptoRng, RngCore};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommitmentError {
    #[error("output has a null value")]
    NullValue,

    #[error("output has a null asset")]
    NullAsset,

    #[error("cannot unblind output: {0}")]
    Unblind(String),

    #[error(transparent)]
    Upstream(#[from] secp256k1_zkp::Error),
}

/// The opening of one coin: its explicit value and asset plus both blinders.
///
/// Explicit coins carry zero blinders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlindingSecrets {
    pub value: u64,
    pub asset: AssetId,
    pub abf: AssetBlindingFactor,
    pub vbf: ValueBlindingFactor,
}

impl BlindingSecrets {
    pub fn new(
        value: u64,
        asset: AssetId,
        abf: AssetBlindingFactor,
        vbf: ValueBlindingFactor,
    ) -> Self {
        Self {
            value,
            asset,
            abf,
            vbf,
        }
    }

    pub fn explicit(value: u64, asset: AssetId) -> Self {
        Self::new(
            value,
            asset,
            AssetBlindingFactor::zero(),
            ValueBlindingFactor::zero(),
        )
    }

    pub fn is_blinded(&self) -> bool {
        self.abf != AssetBlindingFactor::zero() || self.vbf != ValueBlindingFactor::zero()
    }

    fn value_blind_inputs(&self) -> (u64, AssetBlindingFactor, ValueBlindingFactor) {
        (self.value, self.abf, self.vbf)
    }

    /// Surjection domain entry for a coin with these secrets.
    pub fn surjection_target(&self, secp: &Secp256k1<All>) -> (Generator, Tag, Tweak) {
        (
            asset_generator(secp, self.asset, self.abf),
            self.asset.into_tag(),
            self.abf.into_inner(),
        )
    }
}

impl From<TxOutSecrets> for BlindingSecrets {
    fn from(s: TxOutSecrets) -> Self {
        Self::new(s.value, s.asset, s.asset_bf, s.value_bf)
    }
}

impl From<BlindingSecrets> for TxOutSecrets {
    fn from(s: BlindingSecrets) -> Self {
        TxOutSecrets::new(s.asset, s.abf, s.value, s.vbf)
    }
}

pub fn asset_generator(
    secp: &Secp256k1<All>,
    asset: AssetId,
    abf: AssetBlindingFactor,
) -> Generator {
    Generator::new_blinded(secp, asset.into_tag(), abf.into_inner())
}

pub fn value_commitment(
    secp: &Secp256k1<All>,
    value: u64,
    generator: Generator,
    vbf: ValueBlindingFactor,
) -> PedersenCommitment {
    PedersenCommitment::new(secp, value, vbf.into_inner(), generator)
}

/// Commitment of an explicit amount. Zero amounts contribute nothing.
pub fn explicit_commitment(
    secp: &Secp256k1<All>,
    value: u64,
    asset: AssetId,
) -> Option<PedersenCommitment> {
    if value == 0 {
        return None;
    }
    let generator = Generator::new_unblinded(secp, asset.into_tag());
    Some(PedersenCommitment::new_unblinded(secp, value, generator))
}

/// The value commitment a transaction output contributes to the balance.
pub fn txout_value_commitment(
    secp: &Secp256k1<All>,
    txout: &TxOut,
) -> Result<Option<PedersenCommitment>, CommitmentError> {
    match (txout.value, txout.asset) {
        (Value::Null, _) => Err(CommitmentError::NullValue),
        (_, Asset::Null) => Err(CommitmentError::NullAsset),
        (Value::Explicit(0), _) => Ok(None),
        (Value::Explicit(v), Asset::Explicit(asset)) => Ok(explicit_commitment(secp, v, asset)),
        (Value::Explicit(v), Asset::Confidential(generator)) => {
            Ok(Some(PedersenCommitment::new_unblinded(secp, v, generator)))
        }
        (Value::Confidential(commitment), _) => Ok(Some(commitment)),
    }
}

/// The asset generator a transaction output commits to.
pub fn txout_asset_generator(
    secp: &Secp256k1<All>,
    txout: &TxOut,
) -> Result<Generator, CommitmentError> {
    txout
        .asset
        .into_asset_gen(secp)
        .ok_or(CommitmentError::NullAsset)
}

/// True when the input commitments minus the output commitments sum to zero.
pub fn commitments_balance(
    secp: &Secp256k1<All>,
    inputs: &[PedersenCommitment],
    outputs: &[PedersenCommitment],
) -> bool {
    secp256k1_zkp::verify_commitments_sum_to_equal(secp, inputs, outputs)
}

/// Value blinder for the final blinded output, chosen so the whole
/// transaction balances. `outputs` holds every other output, explicit ones
/// included with zero blinders.
pub fn balance_last_output(
    secp: &Secp256k1<All>,
    value: u64,
    abf: AssetBlindingFactor,
    inputs: &[BlindingSecrets],
    outputs: &[BlindingSecrets],
) -> ValueBlindingFactor {
    let inputs: Vec<_> = inputs.iter().map(BlindingSecrets::value_blind_inputs).collect();
    let outputs: Vec<_> = outputs.iter().map(BlindingSecrets::value_blind_inputs).collect();
    ValueBlindingFactor::last(secp, value, abf, &inputs, &outputs)
}

/// Everything an output gains when it is blinded.
#[derive(Debug, Clone)]
pub struct BlindedOutput {
    pub asset_commitment: Generator,
    pub value_commitment: PedersenCommitment,
    /// Ephemeral public key the receiver combines with its blinding key.
    pub nonce_commitment: PublicKey,
    pub range_proof: RangeProof,
    pub surjection_proof: SurjectionProof,
}

/// Blind one output with the given secrets.
///
/// `domain` is the surjection domain: one entry per transaction input.
pub fn blind_output<R: RngCore + CryptoRng>(
    rng: &mut R,
    secp: &Secp256k1<All>,
    secrets: &BlindingSecrets,
    script_pubkey: &Script,
    blinding_pubkey: &PublicKey,
    ephemeral_sk: SecretKey,
    domain: &[(Generator, Tag, Tweak)],
) -> Result<BlindedOutput, CommitmentError> {
    let asset_commitment = asset_generator(secp, secrets.asset, secrets.abf);
    let value_commitment = value_commitment(secp, secrets.value, asset_commitment, secrets.vbf);

    let (_, shared_secret) = Nonce::with_ephemeral_sk(secp, ephemeral_sk, blinding_pubkey);
    let nonce_commitment = PublicKey::from_secret_key(secp, &ephemeral_sk);

    let range_proof = RangeProof::new(
        secp,
        TxOut::RANGEPROOF_MIN_VALUE,
        value_commitment,
        secrets.value,
        secrets.vbf.into_inner(),
        &range_proof_message(secrets.asset, secrets.abf),
        script_pubkey.as_bytes(),
        shared_secret,
        TxOut::RANGEPROOF_EXP_SHIFT,
        TxOut::RANGEPROOF_MIN_PRIV_BITS,
        asset_commitment,
    )?;

    let surjection_proof = SurjectionProof::new(
        secp,
        rng,
        secrets.asset.into_tag(),
        secrets.abf.into_inner(),
        domain,
    )?;

    Ok(BlindedOutput {
        asset_commitment,
        value_commitment,
        nonce_commitment,
        range_proof,
        surjection_proof,
    })
}

/// Asset tag followed by the asset blinder, so the receiver can rewind both.
fn range_proof_message(asset: AssetId, abf: AssetBlindingFactor) -> [u8; 64] {
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(asset.into_tag().as_ref());
    message[32..].copy_from_slice(abf.into_inner().as_ref());
    message
}

pub fn verify_range_proof(
    secp: &Secp256k1<All>,
    proof: &RangeProof,
    commitment: PedersenCommitment,
    generator: Generator,
    script_pubkey: &Script,
) -> bool {
    proof
        .verify(secp, commitment, script_pubkey.as_bytes(), generator)
        .is_ok()
}

pub fn verify_surjection_proof(
    secp: &Secp256k1<All>,
    proof: &SurjectionProof,
    generator: Generator,
    domain: &[Generator],
) -> bool {
    proof.verify(secp, generator, domain)
}

/// Recover the secrets of a blinded output with the receiver's blinding key.
pub fn unblind_txout(
    secp: &Secp256k1<All>,
    txout: &TxOut,
    blinding_key: SecretKey,
) -> Result<BlindingSecrets, CommitmentError> {
    txout
        .unblind(secp, blinding_key)
        .map(BlindingSecrets::from)
        .map_err(|e| CommitmentError::Unblind(format!("{e:?}")))
}

/// Check that `secrets` open the commitments carried by `txout`.
pub fn secrets_match_txout(
    secp: &Secp256k1<All>,
    secrets: &BlindingSecrets,
    txout: &TxOut,
) -> bool {
    let generator = asset_generator(secp, secrets.asset, secrets.abf);
    let asset_ok = match txout.asset {
        Asset::Explicit(asset) => asset == secrets.asset && !secrets.is_blinded(),
        Asset::Confidential(g) => g == generator,
        Asset::Null => false,
    };
    let value_ok = match txout.value {
        Value::Explicit(v) => v == secrets.value,
        Value::Confidential(c) => c == value_commitment(secp, secrets.value, generator, secrets.vbf),
        Value::Null => false,
    };
    asset_ok && value_ok
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::TxOutWitness;
    use rand::thread_rng;

    use super::*;

    fn asset(byte: u8) -> AssetId {
        AssetId::from_slice(&[byte; 32]).unwrap()
    }

    fn random_blinded(value: u64, asset: AssetId) -> BlindingSecrets {
        let mut rng = thread_rng();
        BlindingSecrets::new(
            value,
            asset,
            AssetBlindingFactor::new(&mut rng),
            ValueBlindingFactor::new(&mut rng),
        )
    }

    fn commit(secp: &Secp256k1<All>, s: &BlindingSecrets) -> PedersenCommitment {
        value_commitment(secp, s.value, asset_generator(secp, s.asset, s.abf), s.vbf)
    }

    #[test]
    fn zero_explicit_value_contributes_nothing() {
        let secp = Secp256k1::new();
        assert!(explicit_commitment(&secp, 0, asset(1)).is_none());
        assert!(explicit_commitment(&secp, 5, asset(1)).is_some());
    }

    #[test]
    fn explicit_amounts_balance_without_blinders() {
        let secp = Secp256k1::new();
        let a = asset(7);
        let inputs = [explicit_commitment(&secp, 100, a).unwrap()];
        let outputs = [
            explicit_commitment(&secp, 60, a).unwrap(),
            explicit_commitment(&secp, 40, a).unwrap(),
        ];
        assert!(commitments_balance(&secp, &inputs, &outputs));

        let short = [explicit_commitment(&secp, 60, a).unwrap()];
        assert!(!commitments_balance(&secp, &inputs, &short));
    }

    #[test]
    fn last_blinder_balances_mixed_sides() {
        let secp = Secp256k1::new();
        let a = asset(3);
        let mut rng = thread_rng();

        let inputs = [random_blinded(70, a), BlindingSecrets::explicit(30, a)];
        let first = random_blinded(45, a);
        let fee = BlindingSecrets::explicit(5, a);
        let last_abf = AssetBlindingFactor::new(&mut rng);
        let last_vbf = balance_last_output(&secp, 50, last_abf, &inputs, &[first, fee]);
        let last = BlindingSecrets::new(50, a, last_abf, last_vbf);

        let in_commits: Vec<_> = inputs.iter().map(|s| commit(&secp, s)).collect();
        let out_commits = vec![
            commit(&secp, &first),
            explicit_commitment(&secp, 5, a).unwrap(),
            commit(&secp, &last),
        ];
        assert!(commitments_balance(&secp, &in_commits, &out_commits));
    }

    #[test]
    fn blinded_output_proofs_verify_and_unblind() {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        let a = asset(9);
        let input = BlindingSecrets::explicit(1_000, a);
        let secrets = random_blinded(999, a);
        let spk = Script::from(vec![0x00, 0x14].into_iter().chain([0x42; 20]).collect::<Vec<u8>>());
        let receiver_sk = SecretKey::new(&mut rng);
        let receiver_pk = PublicKey::from_secret_key(&secp, &receiver_sk);

        let ephemeral_sk = SecretKey::new(&mut rng);
        let blinded = blind_output(
            &mut rng,
            &secp,
            &secrets,
            &spk,
            &receiver_pk,
            ephemeral_sk,
            &[input.surjection_target(&secp)],
        )
        .unwrap();

        assert!(verify_range_proof(
            &secp,
            &blinded.range_proof,
            blinded.value_commitment,
            blinded.asset_commitment,
            &spk,
        ));
        let domain = [input.surjection_target(&secp).0];
        assert!(verify_surjection_proof(
            &secp,
            &blinded.surjection_proof,
            blinded.asset_commitment,
            &domain,
        ));

        let txout = TxOut {
            asset: Asset::Confidential(blinded.asset_commitment),
            value: Value::Confidential(blinded.value_commitment),
            nonce: Nonce::Confidential(blinded.nonce_commitment),
            script_pubkey: spk,
            witness: TxOutWitness {
                surjection_proof: Some(Box::new(blinded.surjection_proof)),
                rangeproof: Some(Box::new(blinded.range_proof)),
            },
        };
        let recovered = unblind_txout(&secp, &txout, receiver_sk).unwrap();
        assert_eq!(recovered, secrets);
        assert!(secrets_match_txout(&secp, &recovered, &txout));
    }

    #[test]
    fn wrong_secrets_do_not_match() {
        let secp = Secp256k1::new();
        let a = asset(4);
        let txout = TxOut {
            asset: Asset::Explicit(a),
            value: Value::Explicit(10),
            nonce: Nonce::Null,
            script_pubkey: Script::new(),
            witness: TxOutWitness::default(),
        };
        assert!(secrets_match_txout(&secp, &BlindingSecrets::explicit(10, a), &txout));
        assert!(!secrets_match_txout(&secp, &BlindingSecrets::explicit(11, a), &txout));
        assert!(!secrets_match_txout(&secp, &random_blinded(10, a), &txout));
    }
}
