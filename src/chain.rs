use std::collections::BTreeMap;

use lwk_wollet::elements::bitcoin::PublicKey;
use lwk_wollet::elements::{OutPoint, Script, Transaction, TxOut, Txid};

use crate::commitment::BlindingSecrets;
use crate::document::KeySource;
use crate::error::{Error, Result};

/// Everything a UTXO source knows about one spent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub txout: TxOut,
    /// Full previous transaction, needed for non-witness spends.
    pub prev_tx: Option<Transaction>,
    /// The owner's opening of a confidential output.
    pub secrets: Option<BlindingSecrets>,
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    pub bip32_derivation: BTreeMap<PublicKey, KeySource>,
}

impl SpentOutput {
    pub fn new(txout: TxOut) -> Self {
        Self {
            txout,
            prev_tx: None,
            secrets: None,
            redeem_script: None,
            witness_script: None,
            bip32_derivation: BTreeMap::new(),
        }
    }

    pub fn with_prev_tx(mut self, tx: Transaction) -> Self {
        self.prev_tx = Some(tx);
        self
    }

    pub fn with_secrets(mut self, secrets: BlindingSecrets) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_scripts(mut self, info: &OutputInfo) -> Self {
        self.redeem_script = info.redeem_script.clone();
        self.witness_script = info.witness_script.clone();
        self.bip32_derivation = info.bip32_derivation.clone();
        self
    }
}

/// Scripts and key origins a party knows for one of its script pubkeys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputInfo {
    pub redeem_script: Option<Script>,
    pub witness_script: Option<Script>,
    pub bip32_derivation: BTreeMap<PublicKey, KeySource>,
}

/// Looks up the outputs a transaction spends.
pub trait UtxoSource {
    /// Fails with [`Error::UtxoNotFound`] when the outpoint is unknown or spent.
    fn lookup(&self, outpoint: &OutPoint) -> Result<SpentOutput>;

    /// Scripts and derivations for an output the caller is paying to.
    fn output_info(&self, _script_pubkey: &Script) -> Option<OutputInfo> {
        None
    }
}

impl<T: UtxoSource + ?Sized> UtxoSource for &T {
    fn lookup(&self, outpoint: &OutPoint) -> Result<SpentOutput> {
        (**self).lookup(outpoint)
    }

    fn output_info(&self, script_pubkey: &Script) -> Option<OutputInfo> {
        (**self).output_info(script_pubkey)
    }
}

/// Accepts finished transactions.
pub trait Ledger {
    fn submit(&self, tx: &Transaction) -> Result<Txid>;
}

impl<T: Ledger + ?Sized> Ledger for &T {
    fn submit(&self, tx: &Transaction) -> Result<Txid> {
        (**self).submit(tx)
    }
}

/// A backend that can both look up UTXOs and accept transactions.
pub trait ChainBackend: UtxoSource + Ledger {}

impl<T: UtxoSource + Ledger> ChainBackend for T {}

/// Electrum-based chain backend for Liquid.
pub struct ElectrumBackend {
    electrum_url: String,
    timeout_secs: Option<u8>,
}

impl ElectrumBackend {
    pub fn new(electrum_url: &str) -> Self {
        Self {
            electrum_url: electrum_url.to_string(),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().clamp(1, u8::MAX as u64) as u8);
        self
    }

    pub fn electrum_url(&self) -> &str {
        &self.electrum_url
    }

    fn raw_client(&self) -> Result<electrum_client::Client> {
        let config = electrum_client::ConfigBuilder::new()
            .timeout(self.timeout_secs)
            .build();
        electrum_client::Client::from_config(&self.electrum_url, config)
            .map_err(|e| Error::Electrum(e.to_string()))
    }

    fn lwk_client(&self) -> Result<lwk_wollet::ElectrumClient> {
        let url: lwk_wollet::ElectrumUrl = self
            .electrum_url
            .parse()
            .map_err(|e| Error::Electrum(format!("{:?}", e)))?;
        lwk_wollet::ElectrumClient::new(&url).map_err(|e| Error::Electrum(e.to_string()))
    }

    /// Fetch a transaction by its txid. `None` when the server does not
    /// know it.
    pub fn fetch_transaction(&self, txid: &Txid) -> Result<Option<Transaction>> {
        use electrum_client::ElectrumApi;

        let client = self.raw_client()?;
        let resp = match client.raw_call(
            "blockchain.transaction.get",
            [electrum_client::Param::String(txid.to_string())],
        ) {
            Ok(resp) => resp,
            Err(electrum_client::Error::Protocol(reply)) if is_missing_transaction(&reply) => {
                log::debug!("{txid} unknown to the server");
                return Ok(None);
            }
            Err(e) => return Err(Error::Electrum(e.to_string())),
        };

        let raw = resp
            .as_str()
            .ok_or_else(|| Error::Electrum("expected hex string response".into()))
            .and_then(|s| hex::decode(s).map_err(|e| Error::Electrum(format!("bad hex: {e}"))))?;
        let tx: Transaction = lwk_wollet::elements::encode::deserialize(&raw)
            .map_err(|e| Error::Electrum(format!("bad transaction: {e}")))?;
        Ok(Some(tx))
    }

    /// Unspent outpoints paying to `script_pubkey`, confirmed or not.
    pub fn list_unspent(&self, script_pubkey: &Script) -> Result<Vec<OutPoint>> {
        use electrum_client::ElectrumApi;
        use sha2::{Digest, Sha256};

        let client = self.raw_client()?;

        // Electrum script hash = SHA256(scriptPubKey) with reversed byte order.
        let mut hash = Sha256::digest(script_pubkey.as_bytes()).to_vec();
        hash.reverse();
        let script_hash_hex = hex::encode(&hash);

        let resp = client
            .raw_call(
                "blockchain.scripthash.listunspent",
                [electrum_client::Param::String(script_hash_hex)],
            )
            .map_err(|e| Error::Electrum(e.to_string()))?;

        let entries = resp
            .as_array()
            .ok_or_else(|| Error::Electrum("expected array response".into()))?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let tx_hash_hex = entry["tx_hash"]
                .as_str()
                .ok_or_else(|| Error::Electrum("missing tx_hash".into()))?;
            let tx_pos = entry["tx_pos"]
                .as_u64()
                .ok_or_else(|| Error::Electrum("missing tx_pos".into()))?;
            let txid: Txid = tx_hash_hex
                .parse()
                .map_err(|e| Error::Electrum(format!("bad tx_hash: {e}")))?;
            let vout = u32::try_from(tx_pos)
                .map_err(|_| Error::Electrum(format!("tx_pos {tx_pos} out of range")))?;
            results.push(OutPoint::new(txid, vout));
        }
        Ok(results)
    }
}

/// Whether a server error reply means the transaction does not exist.
///
/// electrs relays the daemon's RPC_INVALID_ADDRESS_OR_KEY (-5); ElectrumX
/// and Fulcrum answer with a message.
fn is_missing_transaction(reply: &serde_json::Value) -> bool {
    let message = reply
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| reply.as_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    reply.get("code").and_then(|c| c.as_i64()) == Some(-5)
        || message.contains("no such mempool or blockchain transaction")
        || message.contains("missing transaction")
        || message.contains("transaction not found")
        || message.contains("code: -5")
}

impl UtxoSource for ElectrumBackend {
    fn lookup(&self, outpoint: &OutPoint) -> Result<SpentOutput> {
        let tx = self
            .fetch_transaction(&outpoint.txid)?
            .ok_or(Error::UtxoNotFound(*outpoint))?;
        let txout = tx
            .output
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or(Error::UtxoNotFound(*outpoint))?;

        if !self.list_unspent(&txout.script_pubkey)?.contains(outpoint) {
            log::debug!("{outpoint} exists but is already spent");
            return Err(Error::UtxoNotFound(*outpoint));
        }
        Ok(SpentOutput::new(txout).with_prev_tx(tx))
    }
}

impl Ledger for ElectrumBackend {
    fn submit(&self, tx: &Transaction) -> Result<Txid> {
        use lwk_wollet::blocking::BlockchainBackend;

        let client = self.lwk_client()?;
        let txid = client
            .broadcast(tx)
            .map_err(|e| Error::LedgerRejected(e.to_string()))?;
        log::info!("broadcast {txid}");
        Ok(txid)
    }
}
