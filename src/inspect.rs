//! Human-readable JSON rendering of a document.

use std::collections::BTreeMap;

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::confidential::{Asset, Value};
use lwk_wollet::elements::encode::serialize;
use lwk_wollet::elements::{Address, Script, Transaction, TxOut};
use serde_json::{Map, Value as Json, json};

use crate::analyzer::analyze_psbt;
use crate::document::{InputRecord, KeySource, OutputRecord, Psbt, UnknownFields};
use crate::network::Network;
use crate::script::{ScriptKind, classify};

/// Render every field of `psbt` as a named, typed JSON value.
pub fn inspect_psbt(psbt: &Psbt, network: Network) -> Json {
    let inputs: Vec<_> = psbt.inputs.iter().map(|r| input_json(r, network)).collect();
    let outputs: Vec<_> = psbt
        .outputs
        .iter()
        .enumerate()
        .map(|(i, r)| output_json(&psbt.tx.output[i], r, network))
        .collect();

    let mut doc = json!({
        "tx": transaction_json(&psbt.tx, network),
        "global": {
            "version": psbt.global.version.unwrap_or(0),
            "xpubs": psbt.global.xpubs.iter().map(|(xpub, origin)| json!({
                "xpub": hex::encode(xpub),
                "master_fingerprint": hex::encode(origin.fingerprint),
                "path": derivation_path(origin),
            })).collect::<Vec<_>>(),
        },
        "inputs": inputs,
        "outputs": outputs,
    });
    if !psbt.global.unknown.is_empty() {
        doc["global"]["unknown"] = unknown_json(&psbt.global.unknown);
    }
    if let Some(fee) = analyze_psbt(psbt).fee {
        doc["fee"] = json!(fee);
    }
    doc
}

fn transaction_json(tx: &Transaction, network: Network) -> Json {
    json!({
        "txid": tx.txid().to_string(),
        "hex": hex::encode(serialize(tx)),
        "version": tx.version,
        "locktime": tx.lock_time.to_consensus_u32(),
        "vin": tx.input.iter().map(|txin| json!({
            "txid": txin.previous_output.txid.to_string(),
            "vout": txin.previous_output.vout,
            "sequence": txin.sequence.to_consensus_u32(),
        })).collect::<Vec<_>>(),
        "vout": tx.output.iter().enumerate().map(|(n, txout)| {
            let mut out = txout_json(txout, None, network);
            out["n"] = json!(n);
            out
        }).collect::<Vec<_>>(),
    })
}

fn txout_json(
    txout: &TxOut,
    blinder: Option<lwk_wollet::elements::secp256k1_zkp::PublicKey>,
    network: Network,
) -> Json {
    let mut out = Map::new();
    match txout.value {
        Value::Explicit(v) => {
            out.insert("value".into(), json!(v));
        }
        Value::Confidential(c) => {
            out.insert("valuecommitment".into(), json!(hex::encode(c.serialize())));
        }
        Value::Null => {}
    }
    match txout.asset {
        Asset::Explicit(a) => {
            out.insert("asset".into(), json!(a.to_string()));
        }
        Asset::Confidential(g) => {
            out.insert("assetcommitment".into(), json!(hex::encode(g.serialize())));
        }
        Asset::Null => {}
    }
    out.insert(
        "scriptPubKey".into(),
        script_pubkey_json(&txout.script_pubkey, blinder, network),
    );
    Json::Object(out)
}

fn script_pubkey_json(
    spk: &Script,
    blinder: Option<lwk_wollet::elements::secp256k1_zkp::PublicKey>,
    network: Network,
) -> Json {
    let mut out = script_json(spk);
    if spk.is_empty() {
        out["type"] = json!("fee");
    } else if let Some(address) = Address::from_script(spk, blinder, network.address_params()) {
        out["address"] = json!(address.to_string());
    }
    out
}

fn script_json(script: &Script) -> Json {
    let kind = match classify(script) {
        ScriptKind::P2pkh(_) => "pubkeyhash",
        ScriptKind::P2wpkh(_) => "witness_v0_keyhash",
        ScriptKind::P2sh(_) => "scripthash",
        ScriptKind::P2wsh(_) => "witness_v0_scripthash",
        ScriptKind::Multisig { .. } => "multisig",
        ScriptKind::NonStandard => "nonstandard",
    };
    json!({ "hex": hex::encode(script.as_bytes()), "type": kind })
}

fn derivation_path(origin: &KeySource) -> String {
    let mut path = String::from("m");
    for step in &origin.path {
        if step & 0x8000_0000 != 0 {
            path.push_str(&format!("/{}'", step & 0x7fff_ffff));
        } else {
            path.push_str(&format!("/{step}"));
        }
    }
    path
}

fn derivations_json(derivations: &BTreeMap<PublicKey, KeySource>) -> Json {
    derivations
        .iter()
        .map(|(pk, origin)| {
            json!({
                "pubkey": pk.to_string(),
                "master_fingerprint": hex::encode(origin.fingerprint),
                "path": derivation_path(origin),
            })
        })
        .collect()
}

fn unknown_json(unknown: &UnknownFields) -> Json {
    Json::Object(
        unknown
            .iter()
            .map(|(k, v)| (hex::encode(k), json!(hex::encode(v))))
            .collect(),
    )
}

fn input_json(record: &InputRecord, network: Network) -> Json {
    let mut out = Map::new();
    if let Some(tx) = &record.non_witness_utxo {
        out.insert("non_witness_utxo".into(), transaction_json(tx, network));
    }
    if let Some(txout) = &record.witness_utxo {
        out.insert("witness_utxo".into(), txout_json(txout, None, network));
    }
    if !record.partial_sigs.is_empty() {
        let sigs: Map<_, _> = record
            .partial_sigs
            .iter()
            .map(|(pk, sig)| (pk.to_string(), json!(hex::encode(sig))))
            .collect();
        out.insert("partial_signatures".into(), Json::Object(sigs));
    }
    if let Some(ty) = record.sighash_type {
        out.insert("sighash".into(), json!(sighash_name(ty)));
    }
    if let Some(script) = &record.redeem_script {
        out.insert("redeem_script".into(), script_json(script));
    }
    if let Some(script) = &record.witness_script {
        out.insert("witness_script".into(), script_json(script));
    }
    if !record.bip32_derivation.is_empty() {
        out.insert("bip32_derivs".into(), derivations_json(&record.bip32_derivation));
    }
    if let Some(script) = &record.final_script_sig {
        out.insert(
            "final_scriptSig".into(),
            json!({ "hex": hex::encode(script.as_bytes()) }),
        );
    }
    if let Some(witness) = &record.final_script_witness {
        out.insert(
            "final_scriptwitness".into(),
            witness.iter().map(hex::encode).collect(),
        );
    }
    if let Some(v) = record.value {
        out.insert("value".into(), json!(v));
    }
    if let Some(vbf) = record.value_blinding_factor {
        out.insert("value_blinder".into(), json!(vbf.to_string()));
    }
    if let Some(asset) = record.asset {
        out.insert("asset".into(), json!(asset.to_string()));
    }
    if let Some(abf) = record.asset_blinding_factor {
        out.insert("asset_blinder".into(), json!(abf.to_string()));
    }
    if !record.unknown.is_empty() {
        out.insert("unknown".into(), unknown_json(&record.unknown));
    }
    Json::Object(out)
}

fn output_json(txout: &TxOut, record: &OutputRecord, network: Network) -> Json {
    let mut out = Map::new();
    if let Some(script) = &record.redeem_script {
        out.insert("redeem_script".into(), script_json(script));
    }
    if let Some(script) = &record.witness_script {
        out.insert("witness_script".into(), script_json(script));
    }
    if !record.bip32_derivation.is_empty() {
        out.insert("bip32_derivs".into(), derivations_json(&record.bip32_derivation));
    }
    if let Some(pk) = record.blinding_pubkey {
        out.insert("blinding_pubkey".into(), json!(pk.to_string()));
        if let Some(address) =
            Address::from_script(&txout.script_pubkey, Some(pk), network.address_params())
        {
            out.insert("confidential_address".into(), json!(address.to_string()));
        }
    }
    if let Some(c) = record.value_commitment {
        out.insert("value_commitment".into(), json!(hex::encode(c.serialize())));
    }
    if let Some(vbf) = record.value_blinding_factor {
        out.insert("value_blinder".into(), json!(vbf.to_string()));
    }
    if let Some(g) = record.asset_commitment {
        out.insert("asset_commitment".into(), json!(hex::encode(g.serialize())));
    }
    if let Some(abf) = record.asset_blinding_factor {
        out.insert("asset_blinder".into(), json!(abf.to_string()));
    }
    if let Some(nonce) = record.nonce_commitment {
        out.insert("ecdh_pubkey".into(), json!(nonce.to_string()));
    }
    if let Some(proof) = &record.range_proof {
        out.insert("value_rangeproof".into(), json!(hex::encode(proof)));
    }
    if let Some(proof) = &record.surjection_proof {
        out.insert("asset_surjection_proof".into(), json!(hex::encode(proof)));
    }
    if !record.unknown.is_empty() {
        out.insert("unknown".into(), unknown_json(&record.unknown));
    }
    Json::Object(out)
}

fn sighash_name(ty: u32) -> String {
    let base = match ty & 0x1f {
        1 => "ALL",
        2 => "NONE",
        3 => "SINGLE",
        _ => return ty.to_string(),
    };
    if ty & 0x80 != 0 {
        format!("{base}|ANYONECANPAY")
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use lwk_wollet::elements::AssetId;
    use lwk_wollet::elements::hashes::Hash;
    use lwk_wollet::elements::{OutPoint, Txid};

    use super::*;
    use crate::roles::creator::{CreateParams, OutputSpec, create_psbt};

    #[test]
    fn renders_named_fields() {
        let mut psbt = create_psbt(&CreateParams {
            inputs: vec![OutPoint::new(Txid::from_byte_array([7; 32]), 2).into()],
            outputs: vec![OutputSpec::Fee {
                asset: AssetId::from_slice(&[1; 32]).unwrap(),
                amount: 250,
            }],
            ..Default::default()
        })
        .unwrap();
        psbt.inputs[0].sighash_type = Some(0x81);
        psbt.inputs[0].unknown.insert(vec![0x0F, 0x01], vec![0xAB]);
        psbt.global.xpubs.insert(
            vec![0x04; 78],
            KeySource {
                fingerprint: [0xde, 0xad, 0xbe, 0xef],
                path: vec![0x8000_0054, 0x8000_0001, 0],
            },
        );

        let json = inspect_psbt(&psbt, Network::LiquidRegtest);
        assert_eq!(json["tx"]["vin"][0]["vout"], 2);
        assert_eq!(json["tx"]["vout"][0]["value"], 250);
        assert_eq!(json["tx"]["vout"][0]["scriptPubKey"]["type"], "fee");
        assert_eq!(json["inputs"][0]["sighash"], "ALL|ANYONECANPAY");
        assert_eq!(json["inputs"][0]["unknown"]["0f01"], "ab");
        assert_eq!(json["global"]["xpubs"][0]["path"], "m/84'/1'/0");
        assert_eq!(json["fee"], 250);
    }
}
