use confidential_psbt::commitment::{commitments_balance, txout_value_commitment};
use confidential_psbt::elements::secp256k1_zkp::{All, PedersenCommitment, PublicKey, Secp256k1};
use confidential_psbt::elements::{AssetId, OutPoint, Script, Transaction, TxOut};
use confidential_psbt::script::p2wpkh;
use confidential_psbt::testing::{MemoryChain, test_asset, test_blinding_key, test_key};
use confidential_psbt::{
    BlindStatus, CreateParams, EngineConfig, Error, Keyring, OutputSpec, Psbt, PsbtEngine,
};

const COIN: u64 = 100_000_000;

fn asset() -> AssetId {
    test_asset(0xbb)
}

/// The spending party: one signing key, one script.
struct Wallet {
    keys: Keyring,
    script_pubkey: Script,
}

fn wallet(byte: u8) -> Wallet {
    let (sk, pk) = test_key(byte);
    Wallet {
        keys: Keyring::from_secret_keys([sk]),
        script_pubkey: p2wpkh(&pk),
    }
}

fn receiver(byte: u8) -> (Script, PublicKey) {
    (p2wpkh(&test_key(byte).1), test_blinding_key(byte + 0x40).1)
}

fn confidential(byte: u8, amount: u64) -> OutputSpec {
    let (script_pubkey, blinding_pubkey) = receiver(byte);
    OutputSpec::Payment {
        script_pubkey,
        asset: asset(),
        amount,
        blinding_pubkey: Some(blinding_pubkey),
    }
}

fn explicit(byte: u8, amount: u64) -> OutputSpec {
    OutputSpec::Payment {
        script_pubkey: receiver(byte).0,
        asset: asset(),
        amount,
        blinding_pubkey: None,
    }
}

fn fee(amount: u64) -> OutputSpec {
    OutputSpec::Fee {
        asset: asset(),
        amount,
    }
}

fn updated(engine: &PsbtEngine<&MemoryChain>, inputs: &[OutPoint], outputs: Vec<OutputSpec>) -> Psbt {
    let psbt = engine
        .create(&CreateParams {
            inputs: inputs.iter().map(|&o| o.into()).collect(),
            outputs,
            ..Default::default()
        })
        .expect("create should succeed");
    engine.update(&psbt).expect("update should succeed")
}

/// Blind, sign, finalize and submit.
fn complete(engine: &PsbtEngine<&MemoryChain>, psbt: &Psbt, wallet: &Wallet) -> Transaction {
    let (blinded, _) = engine.blind(psbt).expect("blinding should succeed");
    let (signed, complete) = engine.sign(&blinded, &wallet.keys).expect("signing should succeed");
    assert!(complete);
    let tx = engine
        .finalize(&signed, true)
        .expect("finalize should succeed")
        .tx
        .expect("extraction was requested");
    engine.submit(&tx).expect("ledger should accept");
    tx
}

fn commitments(secp: &Secp256k1<All>, txouts: &[TxOut]) -> Vec<PedersenCommitment> {
    txouts
        .iter()
        .filter_map(|txout| txout_value_commitment(secp, txout).unwrap())
        .collect()
}

/// Inputs minus outputs, fee included, sum to the zero commitment.
fn assert_balanced(psbt: &Psbt) {
    let secp = Secp256k1::new();
    let tx = psbt.signing_transaction().unwrap();
    let inputs = commitments(&secp, &psbt.spent_outputs().unwrap());
    let outputs = commitments(&secp, &tx.output);
    assert!(commitments_balance(&secp, &inputs, &outputs));
}

#[test]
fn explicit_input_splits_into_two_confidential_outputs() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(1);
    let coin = chain.fund_explicit(&w.script_pubkey, asset(), 50 * COIN);

    let psbt = updated(
        &engine,
        &[coin],
        vec![
            confidential(0x11, 2_499_900_000),
            confidential(0x12, 2_499_900_000),
            fee(200_000),
        ],
    );
    let (blinded, status) = engine.blind(&psbt).unwrap();
    assert_eq!(status, BlindStatus::Blinded { outputs: vec![0, 1] });
    for record in &blinded.outputs[..2] {
        assert!(record.range_proof.is_some());
        assert!(record.surjection_proof.is_some());
    }
    assert_balanced(&blinded);

    let tx = complete(&engine, &psbt, &w);
    assert!(tx.output[0].value.is_confidential());
    assert!(tx.output[1].asset.is_confidential());

    // The receiver can open what it was sent and spend it on.
    let received = OutPoint::new(tx.txid(), 0);
    let opened = chain.unblind(&received, test_blinding_key(0x51).0).unwrap();
    assert_eq!(opened.value, 2_499_900_000);
    assert_eq!(opened.asset, asset());

    let next = updated(
        &engine,
        &[received],
        vec![
            confidential(0x13, 1_000_000_000),
            confidential(0x14, 1_499_800_000),
            fee(100_000),
        ],
    );
    assert!(next.inputs[0].value_blinding_factor.is_some());
    complete(&engine, &next, &wallet(0x11));
}

#[test]
fn confidential_input_splits_into_two_confidential_outputs() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(9);
    let (coin, _) = chain.fund_confidential(&w.script_pubkey, asset(), 50 * COIN);

    let psbt = updated(
        &engine,
        &[coin],
        vec![
            confidential(0x91, 2_499_900_000),
            confidential(0x92, 2_499_900_000),
            fee(200_000),
        ],
    );
    let (blinded, status) = engine.blind(&psbt).unwrap();
    assert_eq!(status, BlindStatus::Blinded { outputs: vec![0, 1] });
    assert_balanced(&blinded);

    let tx = complete(&engine, &psbt, &w);
    let funding = chain.transaction(&coin.txid).unwrap();
    let spent = [funding.output[coin.vout as usize].clone()];
    assert!(tx.verify_tx_amt_proofs(&Secp256k1::new(), &spent).is_ok());
    assert!(tx.output[..2].iter().all(|o| o.value.is_confidential()));
    assert!(tx.output[2].is_fee());

    let opened = chain.unblind(&OutPoint::new(tx.txid(), 1), test_blinding_key(0xd2).0).unwrap();
    assert_eq!(opened.value, 2_499_900_000);
}

#[test]
fn single_confidential_output_from_explicit_inputs_needs_another_output() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(2);
    let coin = chain.fund_explicit(&w.script_pubkey, asset(), 50 * COIN);

    let psbt = updated(&engine, &[coin], vec![confidential(0x21, 4_999_800_000), fee(200_000)]);
    let err = engine.blind(&psbt).unwrap_err();
    assert!(matches!(err, Error::Blinding(ref m) if m == "need another output to blind"));

    let err = engine.sign(&psbt, &w.keys).unwrap_err();
    assert!(matches!(err, Error::Signing(ref m) if m == "transaction not fully blinded"));
}

#[test]
fn ignore_blind_fail_completes_unblinded() {
    let chain = MemoryChain::new();
    let config = EngineConfig {
        ignore_blind_fail: true,
        ..Default::default()
    };
    let engine = PsbtEngine::new(config, &chain);
    let w = wallet(3);
    let coin = chain.fund_explicit(&w.script_pubkey, asset(), 50 * COIN);

    let psbt = updated(&engine, &[coin], vec![confidential(0x31, 4_999_900_000), fee(100_000)]);
    let (unblinded, status) = engine.blind(&psbt).unwrap();
    assert_eq!(status, BlindStatus::LeftUnblinded { outputs: vec![0] });
    assert!(!unblinded.needs_blinding());

    let tx = complete(&engine, &unblinded, &w);
    assert!(tx.output[0].value.is_explicit());
}

#[test]
fn confidential_to_explicit_cannot_balance() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(4);
    let (coin, _) = chain.fund_confidential(&w.script_pubkey, asset(), 25 * COIN);

    let psbt = updated(&engine, &[coin], vec![explicit(0x41, 2_499_900_000), fee(100_000)]);
    assert!(psbt.inputs[0].asset_blinding_factor.is_some());
    assert!(matches!(engine.blind(&psbt), Err(Error::Blinding(_))));
}

#[test]
fn confidential_to_explicit_and_confidential() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(5);
    let (coin, _) = chain.fund_confidential(&w.script_pubkey, asset(), 25 * COIN);

    let psbt = updated(
        &engine,
        &[coin],
        vec![
            explicit(0x51, 10 * COIN),
            confidential(0x52, 1_499_900_000),
            fee(100_000),
        ],
    );
    let tx = complete(&engine, &psbt, &w);
    assert!(tx.output[0].value.is_explicit());
    assert!(tx.output[1].value.is_confidential());
}

#[test]
fn confidential_to_confidential() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(6);
    let (coin, _) = chain.fund_confidential(&w.script_pubkey, asset(), 25 * COIN);

    let psbt = updated(&engine, &[coin], vec![confidential(0x61, 2_499_900_000), fee(100_000)]);
    complete(&engine, &psbt, &w);
    assert!(!chain.is_unspent(&coin));
}

#[test]
fn explicit_input_to_explicit_and_two_confidential() {
    let chain = MemoryChain::new();
    let engine = PsbtEngine::new(EngineConfig::default(), &chain);
    let w = wallet(7);
    let coin = chain.fund_explicit(&w.script_pubkey, asset(), 50 * COIN);

    let psbt = updated(
        &engine,
        &[coin],
        vec![
            explicit(0x71, 2_499_900_000),
            confidential(0x72, 1_499_900_000),
            confidential(0x73, 10 * COIN),
            fee(200_000),
        ],
    );
    complete(&engine, &psbt, &w);
}

#[test]
fn blinding_balances_for_every_shape() {
    let w = wallet(8);
    for n_inputs in 1..=4u64 {
        for n_outputs in 1..=4u64 {
            let chain = MemoryChain::new();
            let engine = PsbtEngine::new(EngineConfig::default(), &chain);

            // Even positions are confidential, so neither refusal case applies.
            let inputs: Vec<_> = (0..n_inputs)
                .map(|i| {
                    let value = (i + 1) * COIN;
                    if i % 2 == 0 {
                        chain.fund_confidential(&w.script_pubkey, asset(), value).0
                    } else {
                        chain.fund_explicit(&w.script_pubkey, asset(), value)
                    }
                })
                .collect();
            let total: u64 = (1..=n_inputs).map(|i| i * COIN).sum();
            let fee_amount = 10_000 * n_outputs;
            let share = (total - fee_amount) / n_outputs;
            let mut outputs: Vec<_> = (0..n_outputs)
                .map(|j| {
                    let amount = if j + 1 == n_outputs {
                        total - fee_amount - share * (n_outputs - 1)
                    } else {
                        share
                    };
                    if j % 2 == 0 {
                        confidential(0x80 + j as u8, amount)
                    } else {
                        explicit(0x80 + j as u8, amount)
                    }
                })
                .collect();
            outputs.push(fee(fee_amount));

            let psbt = updated(&engine, &inputs, outputs);
            let (blinded, status) = engine.blind(&psbt).unwrap();
            assert!(
                matches!(status, BlindStatus::Blinded { .. }),
                "{n_inputs} inputs, {n_outputs} outputs: {status:?}"
            );
            assert_balanced(&blinded);
            complete(&engine, &psbt, &w);
        }
    }
}
