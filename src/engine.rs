use lwk_wollet::elements::{Transaction, Txid};
use rand::thread_rng;

use crate::analyzer::{PsbtAnalysis, analyze_psbt};
use crate::chain::{ChainBackend, ElectrumBackend};
use crate::codec;
use crate::config::EngineConfig;
use crate::document::Psbt;
use crate::error::Result;
use crate::inspect::inspect_psbt;
use crate::keys::SigningOracle;
use crate::roles::blinder::{BlindStatus, blind_psbt};
use crate::roles::combiner::combine_psbts;
use crate::roles::creator::{CreateParams, create_psbt};
use crate::roles::extractor::extract_transaction;
use crate::roles::finalizer::{FinalizeResult, finalize_psbt};
use crate::roles::signer::sign_psbt;
use crate::roles::updater::update_psbt;

/// One party's view of the workflow: its configuration plus the chain it
/// looks UTXOs up in and submits to.
pub struct PsbtEngine<B: ChainBackend> {
    config: EngineConfig,
    chain: B,
}

impl PsbtEngine<ElectrumBackend> {
    pub fn with_electrum(config: EngineConfig) -> Self {
        let chain = ElectrumBackend::new(config.electrum_url()).with_timeout(config.electrum_timeout);
        Self::new(config, chain)
    }
}

impl<B: ChainBackend> PsbtEngine<B> {
    pub fn new(config: EngineConfig, chain: B) -> Self {
        Self { config, chain }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chain(&self) -> &B {
        &self.chain
    }

    pub fn create(&self, params: &CreateParams) -> Result<Psbt> {
        create_psbt(params)
    }

    pub fn update(&self, psbt: &Psbt) -> Result<Psbt> {
        update_psbt(psbt, &self.chain)
    }

    pub fn blind(&self, psbt: &Psbt) -> Result<(Psbt, BlindStatus)> {
        blind_psbt(psbt, &self.config.blind_options(), &mut thread_rng())
    }

    pub fn sign<O: SigningOracle + ?Sized>(&self, psbt: &Psbt, oracle: &O) -> Result<(Psbt, bool)> {
        sign_psbt(psbt, oracle, &self.config.sign_options())
    }

    /// Update then sign: everything one party can add on its own.
    pub fn process<O: SigningOracle + ?Sized>(
        &self,
        psbt: &Psbt,
        oracle: &O,
    ) -> Result<(Psbt, bool)> {
        let updated = self.update(psbt)?;
        self.sign(&updated, oracle)
    }

    pub fn combine(&self, psbts: &[Psbt]) -> Result<Psbt> {
        combine_psbts(psbts)
    }

    pub fn finalize(&self, psbt: &Psbt, extract: bool) -> Result<FinalizeResult> {
        finalize_psbt(psbt, extract)
    }

    pub fn extract(&self, psbt: &Psbt) -> Result<Transaction> {
        extract_transaction(psbt)
    }

    pub fn submit(&self, tx: &Transaction) -> Result<Txid> {
        self.chain.submit(tx)
    }

    /// Finalize, extract and submit in one go.
    pub fn finalize_and_submit(&self, psbt: &Psbt) -> Result<Txid> {
        let finalized = self.finalize(psbt, false)?;
        let tx = self.extract(&finalized.psbt)?;
        self.submit(&tx)
    }

    pub fn analyze(&self, psbt: &Psbt) -> PsbtAnalysis {
        analyze_psbt(psbt)
    }

    pub fn inspect(&self, psbt: &Psbt) -> serde_json::Value {
        inspect_psbt(psbt, self.config.network)
    }

    pub fn decode(&self, base64: &str) -> Result<Psbt> {
        codec::decode_base64(base64)
    }

    pub fn encode(&self, psbt: &Psbt) -> String {
        codec::encode_base64(psbt)
    }
}
