//! Binary and base64 encoding of [`Psbt`] documents.
//!
//! Layout follows BIP174: magic, a global map, one map per input and one per
//! output. Each map is a list of `<compact len><key><compact len><value>`
//! pairs ended by a zero byte. Confidential fields live under the
//! proprietary key type `0xFC` with the identifier `elements`.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::confidential::{
    Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor,
};
use lwk_wollet::elements::encode::{Decodable, VarInt, deserialize, serialize};
use lwk_wollet::elements::secp256k1_zkp::{self, Generator, PedersenCommitment};
use lwk_wollet::elements::{AssetId, Script, Transaction, TxOut};

use crate::document::{
    GlobalRecord, InputRecord, KeySource, OutputRecord, Psbt, UnknownFields, without_witness,
};
use crate::error::{DecodeError, Error, Result};

pub const MAGIC: [u8; 5] = *b"psbt\xff";

const PROPRIETARY: u8 = 0xFC;
const ELEMENTS_ID: &[u8] = b"elements";

mod global {
    pub const UNSIGNED_TX: u8 = 0x00;
    pub const XPUB: u8 = 0x01;
    pub const VERSION: u8 = 0xFB;
}

mod input {
    pub const NON_WITNESS_UTXO: u8 = 0x00;
    pub const WITNESS_UTXO: u8 = 0x01;
    pub const PARTIAL_SIG: u8 = 0x02;
    pub const SIGHASH_TYPE: u8 = 0x03;
    pub const REDEEM_SCRIPT: u8 = 0x04;
    pub const WITNESS_SCRIPT: u8 = 0x05;
    pub const BIP32_DERIVATION: u8 = 0x06;
    pub const FINAL_SCRIPTSIG: u8 = 0x07;
    pub const FINAL_SCRIPTWITNESS: u8 = 0x08;

    pub const ELEMENTS_VALUE: u8 = 0x00;
    pub const ELEMENTS_VALUE_BLINDER: u8 = 0x01;
    pub const ELEMENTS_ASSET: u8 = 0x02;
    pub const ELEMENTS_ASSET_BLINDER: u8 = 0x03;
}

mod output {
    pub const REDEEM_SCRIPT: u8 = 0x00;
    pub const WITNESS_SCRIPT: u8 = 0x01;
    pub const BIP32_DERIVATION: u8 = 0x02;

    pub const ELEMENTS_VALUE_COMMITMENT: u8 = 0x00;
    pub const ELEMENTS_VALUE_BLINDER: u8 = 0x01;
    pub const ELEMENTS_ASSET_COMMITMENT: u8 = 0x02;
    pub const ELEMENTS_ASSET_BLINDER: u8 = 0x03;
    pub const ELEMENTS_RANGE_PROOF: u8 = 0x04;
    pub const ELEMENTS_SURJECTION_PROOF: u8 = 0x05;
    pub const ELEMENTS_BLINDING_PUBKEY: u8 = 0x06;
    pub const ELEMENTS_NONCE_COMMITMENT: u8 = 0x07;
}

fn malformed(reason: impl Into<String>) -> DecodeError {
    DecodeError::Malformed(reason.into())
}

// ---------------------------------------------------------------------------
// Primitive readers and writers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(malformed("unexpected end of data"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// A minimally encoded compact size.
    fn compact_size(&mut self) -> std::result::Result<u64, DecodeError> {
        let mut rest = &self.data[self.pos..];
        let before = rest.len();
        let VarInt(n) = VarInt::consensus_decode(&mut rest)
            .map_err(|e| malformed(format!("bad length prefix: {e}")))?;
        self.pos += before - rest.len();
        Ok(n)
    }

    fn sized(&mut self) -> std::result::Result<&'a [u8], DecodeError> {
        let len = self.compact_size()?;
        let len = usize::try_from(len).map_err(|_| malformed("length overflow"))?;
        self.take(len)
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> std::result::Result<[u8; N], DecodeError> {
    bytes
        .try_into()
        .map_err(|_| malformed(format!("expected {N} bytes, got {}", bytes.len())))
}

fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    out.extend_from_slice(&serialize(&VarInt(n)));
}

fn write_sized(out: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// One key-value map, in the order it appeared.
type RawMap = Vec<(Vec<u8>, Vec<u8>)>;

fn read_map(r: &mut Reader<'_>, what: &str) -> std::result::Result<RawMap, DecodeError> {
    let mut seen = BTreeSet::new();
    let mut pairs = Vec::new();
    loop {
        let key = r.sized()?;
        if key.is_empty() {
            return Ok(pairs);
        }
        let value = r.sized()?;
        if !seen.insert(key.to_vec()) {
            return Err(malformed(format!(
                "duplicate key {} in {what}",
                hex::encode(key)
            )));
        }
        pairs.push((key.to_vec(), value.to_vec()));
    }
}

/// Emits known fields sorted by key, then proprietary fields, then unknowns.
#[derive(Default)]
struct MapWriter {
    known: RawMap,
    proprietary: RawMap,
}

impl MapWriter {
    fn field(&mut self, key_type: u8, key_data: &[u8], value: Vec<u8>) {
        let mut key = vec![key_type];
        key.extend_from_slice(key_data);
        self.known.push((key, value));
    }

    fn elements(&mut self, subtype: u8, value: Vec<u8>) {
        self.proprietary.push((elements_key(subtype), value));
    }

    fn finish(mut self, out: &mut Vec<u8>, unknown: &UnknownFields) {
        self.known.sort();
        self.proprietary.sort();
        let unknown = unknown.iter().map(|(k, v)| (k.clone(), v.clone()));
        for (key, value) in self.known.into_iter().chain(self.proprietary).chain(unknown) {
            write_sized(out, &key);
            write_sized(out, &value);
        }
        out.push(0x00);
    }
}

fn elements_key(subtype: u8) -> Vec<u8> {
    let mut key = vec![PROPRIETARY];
    write_sized(&mut key, ELEMENTS_ID);
    write_compact_size(&mut key, subtype as u64);
    key
}

/// Subtype of an `elements` proprietary key without key data.
fn elements_subtype(key: &[u8]) -> Option<u8> {
    if key.first() != Some(&PROPRIETARY) {
        return None;
    }
    let mut r = Reader::new(&key[1..]);
    let id = r.sized().ok()?;
    if id != ELEMENTS_ID {
        return None;
    }
    let subtype = r.compact_size().ok()?;
    if r.remaining() != 0 {
        return None;
    }
    u8::try_from(subtype).ok()
}

fn require_bare_key(key: &[u8], what: &str) -> std::result::Result<(), DecodeError> {
    if key.len() != 1 {
        return Err(malformed(format!(
            "{what} key 0x{:02x} carries unexpected key data",
            key[0]
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Field value codecs
// ---------------------------------------------------------------------------

fn decode_tx(bytes: &[u8]) -> std::result::Result<Transaction, DecodeError> {
    deserialize(bytes).map_err(|e| malformed(format!("transaction: {e}")))
}

fn decode_txout(bytes: &[u8]) -> std::result::Result<TxOut, DecodeError> {
    deserialize(bytes).map_err(|e| malformed(format!("witness utxo: {e}")))
}

fn decode_pubkey(bytes: &[u8]) -> std::result::Result<PublicKey, DecodeError> {
    PublicKey::from_slice(bytes).map_err(|e| malformed(format!("public key: {e}")))
}

fn decode_key_source(bytes: &[u8]) -> std::result::Result<KeySource, DecodeError> {
    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(malformed("key origin must be a fingerprint plus 4-byte path steps"));
    }
    let fingerprint = fixed(&bytes[..4])?;
    let path = bytes[4..]
        .chunks_exact(4)
        .map(|step| fixed(step).map(u32::from_le_bytes))
        .collect::<std::result::Result<_, _>>()?;
    Ok(KeySource { fingerprint, path })
}

fn encode_key_source(source: &KeySource) -> Vec<u8> {
    let mut out = source.fingerprint.to_vec();
    for step in &source.path {
        out.extend_from_slice(&step.to_le_bytes());
    }
    out
}

fn decode_witness(bytes: &[u8]) -> std::result::Result<Vec<Vec<u8>>, DecodeError> {
    let mut r = Reader::new(bytes);
    let count = r.compact_size()?;
    let mut stack = Vec::new();
    for _ in 0..count {
        stack.push(r.sized()?.to_vec());
    }
    if r.remaining() != 0 {
        return Err(malformed("trailing bytes in final script witness"));
    }
    Ok(stack)
}

fn encode_witness(stack: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    write_compact_size(&mut out, stack.len() as u64);
    for item in stack {
        write_sized(&mut out, item);
    }
    out
}

fn decode_abf(bytes: &[u8]) -> std::result::Result<AssetBlindingFactor, DecodeError> {
    AssetBlindingFactor::from_slice(bytes).map_err(|e| malformed(format!("asset blinder: {e}")))
}

fn decode_vbf(bytes: &[u8]) -> std::result::Result<ValueBlindingFactor, DecodeError> {
    ValueBlindingFactor::from_slice(bytes).map_err(|e| malformed(format!("value blinder: {e}")))
}

fn decode_blinding_key(
    bytes: &[u8],
) -> std::result::Result<secp256k1_zkp::PublicKey, DecodeError> {
    secp256k1_zkp::PublicKey::from_slice(bytes).map_err(|e| malformed(format!("blinding key: {e}")))
}

// ---------------------------------------------------------------------------
// Maps
// ---------------------------------------------------------------------------

fn decode_global(
    map: RawMap,
    unsigned_tx: &mut Option<Transaction>,
) -> std::result::Result<GlobalRecord, DecodeError> {
    let mut record = GlobalRecord::default();
    for (key, value) in map {
        match key[0] {
            global::UNSIGNED_TX => {
                require_bare_key(&key, "global")?;
                *unsigned_tx = Some(decode_tx(&value)?);
            }
            global::XPUB => {
                if key.len() != 79 {
                    return Err(malformed("extended public key must be 78 bytes"));
                }
                record.xpubs.insert(key[1..].to_vec(), decode_key_source(&value)?);
            }
            global::VERSION => {
                require_bare_key(&key, "global")?;
                let version = u32::from_le_bytes(fixed(&value)?);
                if version != 0 {
                    return Err(malformed(format!("unsupported PSBT version {version}")));
                }
                record.version = Some(version);
            }
            _ => {
                record.unknown.insert(key, value);
            }
        }
    }
    Ok(record)
}

fn encode_global(psbt: &Psbt, out: &mut Vec<u8>) {
    let mut w = MapWriter::default();
    w.field(global::UNSIGNED_TX, &[], serialize(&psbt.tx));
    for (xpub, source) in &psbt.global.xpubs {
        w.field(global::XPUB, xpub, encode_key_source(source));
    }
    if let Some(version) = psbt.global.version {
        w.field(global::VERSION, &[], version.to_le_bytes().to_vec());
    }
    w.finish(out, &psbt.global.unknown);
}

fn decode_input(map: RawMap) -> std::result::Result<InputRecord, DecodeError> {
    let mut record = InputRecord::default();
    for (key, value) in map {
        if let Some(subtype) = elements_subtype(&key) {
            match subtype {
                input::ELEMENTS_VALUE => {
                    record.value = Some(u64::from_le_bytes(fixed(&value)?));
                    continue;
                }
                input::ELEMENTS_VALUE_BLINDER => {
                    record.value_blinding_factor = Some(decode_vbf(&value)?);
                    continue;
                }
                input::ELEMENTS_ASSET => {
                    let asset = AssetId::from_slice(&value)
                        .map_err(|e| malformed(format!("asset: {e}")))?;
                    record.asset = Some(asset);
                    continue;
                }
                input::ELEMENTS_ASSET_BLINDER => {
                    record.asset_blinding_factor = Some(decode_abf(&value)?);
                    continue;
                }
                _ => {}
            }
        }
        match key[0] {
            input::NON_WITNESS_UTXO => {
                require_bare_key(&key, "input")?;
                record.non_witness_utxo = Some(decode_tx(&value)?);
            }
            input::WITNESS_UTXO => {
                require_bare_key(&key, "input")?;
                record.witness_utxo = Some(decode_txout(&value)?);
            }
            input::PARTIAL_SIG => {
                record
                    .partial_sigs
                    .insert(decode_pubkey(&key[1..])?, value);
            }
            input::SIGHASH_TYPE => {
                require_bare_key(&key, "input")?;
                record.sighash_type = Some(u32::from_le_bytes(fixed(&value)?));
            }
            input::REDEEM_SCRIPT => {
                require_bare_key(&key, "input")?;
                record.redeem_script = Some(Script::from(value));
            }
            input::WITNESS_SCRIPT => {
                require_bare_key(&key, "input")?;
                record.witness_script = Some(Script::from(value));
            }
            input::BIP32_DERIVATION => {
                record
                    .bip32_derivation
                    .insert(decode_pubkey(&key[1..])?, decode_key_source(&value)?);
            }
            input::FINAL_SCRIPTSIG => {
                require_bare_key(&key, "input")?;
                record.final_script_sig = Some(Script::from(value));
            }
            input::FINAL_SCRIPTWITNESS => {
                require_bare_key(&key, "input")?;
                record.final_script_witness = Some(decode_witness(&value)?);
            }
            _ => {
                record.unknown.insert(key, value);
            }
        }
    }
    Ok(record)
}

fn encode_input(record: &InputRecord, out: &mut Vec<u8>) {
    let mut w = MapWriter::default();
    if let Some(tx) = &record.non_witness_utxo {
        w.field(input::NON_WITNESS_UTXO, &[], serialize(tx));
    }
    if let Some(txout) = &record.witness_utxo {
        w.field(input::WITNESS_UTXO, &[], serialize(txout));
    }
    for (pubkey, sig) in &record.partial_sigs {
        w.field(input::PARTIAL_SIG, &pubkey.to_bytes(), sig.clone());
    }
    if let Some(sighash) = record.sighash_type {
        w.field(input::SIGHASH_TYPE, &[], sighash.to_le_bytes().to_vec());
    }
    if let Some(script) = &record.redeem_script {
        w.field(input::REDEEM_SCRIPT, &[], script.to_bytes());
    }
    if let Some(script) = &record.witness_script {
        w.field(input::WITNESS_SCRIPT, &[], script.to_bytes());
    }
    for (pubkey, source) in &record.bip32_derivation {
        w.field(input::BIP32_DERIVATION, &pubkey.to_bytes(), encode_key_source(source));
    }
    if let Some(script) = &record.final_script_sig {
        w.field(input::FINAL_SCRIPTSIG, &[], script.to_bytes());
    }
    if let Some(stack) = &record.final_script_witness {
        w.field(input::FINAL_SCRIPTWITNESS, &[], encode_witness(stack));
    }

    if let Some(value) = record.value {
        w.elements(input::ELEMENTS_VALUE, value.to_le_bytes().to_vec());
    }
    if let Some(vbf) = record.value_blinding_factor {
        w.elements(input::ELEMENTS_VALUE_BLINDER, vbf.into_inner().as_ref().to_vec());
    }
    if let Some(asset) = record.asset {
        w.elements(input::ELEMENTS_ASSET, asset.into_tag().as_ref().to_vec());
    }
    if let Some(abf) = record.asset_blinding_factor {
        w.elements(input::ELEMENTS_ASSET_BLINDER, abf.into_inner().as_ref().to_vec());
    }
    w.finish(out, &record.unknown);
}

fn decode_output(map: RawMap) -> std::result::Result<OutputRecord, DecodeError> {
    let mut record = OutputRecord::default();
    for (key, value) in map {
        if let Some(subtype) = elements_subtype(&key) {
            let handled = match subtype {
                output::ELEMENTS_VALUE_COMMITMENT => {
                    let commitment = PedersenCommitment::from_slice(&value)
                        .map_err(|e| malformed(format!("value commitment: {e}")))?;
                    record.value_commitment = Some(commitment);
                    true
                }
                output::ELEMENTS_VALUE_BLINDER => {
                    record.value_blinding_factor = Some(decode_vbf(&value)?);
                    true
                }
                output::ELEMENTS_ASSET_COMMITMENT => {
                    let generator = Generator::from_slice(&value)
                        .map_err(|e| malformed(format!("asset commitment: {e}")))?;
                    record.asset_commitment = Some(generator);
                    true
                }
                output::ELEMENTS_ASSET_BLINDER => {
                    record.asset_blinding_factor = Some(decode_abf(&value)?);
                    true
                }
                output::ELEMENTS_RANGE_PROOF => {
                    record.range_proof = Some(value.clone());
                    true
                }
                output::ELEMENTS_SURJECTION_PROOF => {
                    record.surjection_proof = Some(value.clone());
                    true
                }
                output::ELEMENTS_BLINDING_PUBKEY => {
                    record.blinding_pubkey = Some(decode_blinding_key(&value)?);
                    true
                }
                output::ELEMENTS_NONCE_COMMITMENT => {
                    record.nonce_commitment = Some(decode_blinding_key(&value)?);
                    true
                }
                _ => false,
            };
            if handled {
                continue;
            }
        }
        match key[0] {
            output::REDEEM_SCRIPT => {
                require_bare_key(&key, "output")?;
                record.redeem_script = Some(Script::from(value));
            }
            output::WITNESS_SCRIPT => {
                require_bare_key(&key, "output")?;
                record.witness_script = Some(Script::from(value));
            }
            output::BIP32_DERIVATION => {
                record
                    .bip32_derivation
                    .insert(decode_pubkey(&key[1..])?, decode_key_source(&value)?);
            }
            _ => {
                record.unknown.insert(key, value);
            }
        }
    }
    Ok(record)
}

fn encode_output(record: &OutputRecord, out: &mut Vec<u8>) {
    let mut w = MapWriter::default();
    if let Some(script) = &record.redeem_script {
        w.field(output::REDEEM_SCRIPT, &[], script.to_bytes());
    }
    if let Some(script) = &record.witness_script {
        w.field(output::WITNESS_SCRIPT, &[], script.to_bytes());
    }
    for (pubkey, source) in &record.bip32_derivation {
        w.field(output::BIP32_DERIVATION, &pubkey.to_bytes(), encode_key_source(source));
    }

    if let Some(commitment) = record.value_commitment {
        w.elements(output::ELEMENTS_VALUE_COMMITMENT, commitment.serialize().to_vec());
    }
    if let Some(vbf) = record.value_blinding_factor {
        w.elements(output::ELEMENTS_VALUE_BLINDER, vbf.into_inner().as_ref().to_vec());
    }
    if let Some(generator) = record.asset_commitment {
        w.elements(output::ELEMENTS_ASSET_COMMITMENT, generator.serialize().to_vec());
    }
    if let Some(abf) = record.asset_blinding_factor {
        w.elements(output::ELEMENTS_ASSET_BLINDER, abf.into_inner().as_ref().to_vec());
    }
    if let Some(proof) = &record.range_proof {
        w.elements(output::ELEMENTS_RANGE_PROOF, proof.clone());
    }
    if let Some(proof) = &record.surjection_proof {
        w.elements(output::ELEMENTS_SURJECTION_PROOF, proof.clone());
    }
    if let Some(pubkey) = record.blinding_pubkey {
        w.elements(output::ELEMENTS_BLINDING_PUBKEY, pubkey.serialize().to_vec());
    }
    if let Some(pubkey) = record.nonce_commitment {
        w.elements(output::ELEMENTS_NONCE_COMMITMENT, pubkey.serialize().to_vec());
    }
    w.finish(out, &record.unknown);
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Serialize a document in canonical field order.
pub fn encode(psbt: &Psbt) -> Vec<u8> {
    let mut out = MAGIC.to_vec();
    encode_global(psbt, &mut out);
    for record in &psbt.inputs {
        encode_input(record, &mut out);
    }
    for record in &psbt.outputs {
        encode_output(record, &mut out);
    }
    out
}

/// Parse a document, rejecting anything structurally invalid.
pub fn decode(bytes: &[u8]) -> Result<Psbt> {
    let mut r = Reader::new(bytes);
    if r.take(MAGIC.len()).ok() != Some(&MAGIC[..]) {
        return Err(malformed("invalid PSBT magic bytes").into());
    }

    let mut tx = None;
    let global = decode_global(read_map(&mut r, "global map")?, &mut tx)?;
    let tx = tx.ok_or_else(|| malformed("no unsigned transaction was provided"))?;

    let inputs = (0..tx.input.len())
        .map(|_| read_map(&mut r, "input map").and_then(decode_input))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let outputs = (0..tx.output.len())
        .map(|_| read_map(&mut r, "output map").and_then(decode_output))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if r.remaining() != 0 {
        return Err(malformed(format!("{} trailing bytes", r.remaining())).into());
    }

    let psbt = Psbt {
        tx,
        global,
        inputs,
        outputs,
    };
    psbt.validate().map_err(|e| match e {
        Error::MalformedDocument(reason) => Error::malformed(reason),
        other => other,
    })?;
    Ok(psbt)
}

pub fn encode_base64(psbt: &Psbt) -> String {
    BASE64.encode(encode(psbt))
}

pub fn decode_base64(s: &str) -> Result<Psbt> {
    let bytes = BASE64
        .decode(s.trim())
        .map_err(|e| malformed(format!("invalid base64: {e}")))?;
    decode(&bytes)
}

impl std::fmt::Display for Psbt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&encode_base64(self))
    }
}

impl std::str::FromStr for Psbt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        decode_base64(s)
    }
}

/// Turn a raw network transaction into a fresh document.
///
/// Inputs that already carry a scriptSig or witness are refused unless
/// `allow_strip` is set, in which case the signature data is dropped. An
/// explicit output whose nonce holds a blinding key becomes an output
/// awaiting blinding.
pub fn from_raw_transaction(bytes: &[u8], allow_strip: bool) -> Result<Psbt> {
    let mut tx = decode_tx(bytes)?;

    let signed = tx
        .input
        .iter()
        .any(|txin| !txin.script_sig.is_empty() || !txin.witness.script_witness.is_empty());
    if signed && !allow_strip {
        return Err(DecodeError::ExistingSignatures.into());
    }
    for txin in &mut tx.input {
        txin.script_sig = Script::new();
        txin.witness = Default::default();
    }

    let mut blinding_keys = Vec::with_capacity(tx.output.len());
    for (i, txout) in tx.output.iter_mut().enumerate() {
        if !matches!(txout.value, Value::Explicit(_)) || !matches!(txout.asset, Asset::Explicit(_)) {
            return Err(malformed(format!("output {i} is already blinded")).into());
        }
        blinding_keys.push(match txout.nonce {
            Nonce::Confidential(pubkey) => Some(pubkey),
            _ => None,
        });
        *txout = TxOut {
            nonce: Nonce::Null,
            ..without_witness(txout)
        };
    }

    let mut psbt = Psbt::new(tx).map_err(|e| match e {
        Error::MalformedDocument(reason) => Error::malformed(reason),
        other => other,
    })?;
    for (record, key) in psbt.outputs.iter_mut().zip(blinding_keys) {
        record.blinding_pubkey = key;
    }
    log::debug!(
        "converted raw transaction with {} inputs and {} outputs",
        psbt.inputs.len(),
        psbt.outputs.len()
    );
    Ok(psbt)
}
