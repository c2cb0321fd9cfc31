pub use lwk_wollet::elements;

pub mod analyzer;
pub mod chain;
pub mod codec;
pub mod commitment;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod keys;
pub mod network;
pub mod roles;
pub mod script;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Core types
pub use chain::{ChainBackend, ElectrumBackend, Ledger, OutputInfo, SpentOutput, UtxoSource};
pub use commitment::BlindingSecrets;
pub use config::EngineConfig;
pub use document::{GlobalRecord, InputRecord, KeySource, OutputRecord, Psbt};
pub use engine::PsbtEngine;
pub use error::{DecodeError, Error, Result};
pub use keys::{Keyring, SigningOracle};
pub use network::Network;

// Re-export LWK for app-layer use
pub use lwk_wollet;

// Codec
pub use codec::{decode, decode_base64, encode, encode_base64, from_raw_transaction};

// Roles
pub use roles::blinder::{BlindOptions, BlindStatus, blind_psbt};
pub use roles::combiner::combine_psbts;
pub use roles::creator::{CreateParams, InputSpec, OutputSpec, create_psbt};
pub use roles::extractor::extract_transaction;
pub use roles::finalizer::{FinalizeResult, finalize_psbt};
pub use roles::signer::{SIGHASH_ALL, SignOptions, sign_psbt};
pub use roles::updater::update_psbt;

// Analysis
pub use analyzer::{InputAnalysis, Missing, PsbtAnalysis, Role, Stage, analyze_psbt, stage};
pub use inspect::inspect_psbt;
