use lwk_wollet::elements::OutPoint;
use thiserror::Error;

/// Failures while turning bytes into a [`Psbt`](crate::document::Psbt).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("TX decode failed: {0}")]
    Malformed(String),

    #[error("Inputs must not have existing signatures")]
    ExistingSignatures,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("malformed PSBT: {0}")]
    MalformedDocument(String),

    #[error("create error: {0}")]
    Create(String),

    #[error("blinding error: {0}")]
    Blinding(String),

    #[error("blinding is incomplete: output {0} still needs blinding")]
    BlindingIncomplete(usize),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("conflicting values for {field} in {record}")]
    Conflict { record: String, field: &'static str },

    #[error("cannot combine PSBTs for different transactions")]
    MismatchedTransactions,

    #[error("Parameter 'txs' cannot be empty")]
    EmptyCombine,

    #[error("input {input} has {have} of {need} required signatures")]
    IncompleteSignatures {
        input: usize,
        have: usize,
        need: usize,
    },

    #[error("input {0} is not finalized")]
    NotFinalized(usize),

    #[error("input {input} cannot be finalized: {reason}")]
    Unsatisfiable { input: usize, reason: String },

    #[error("utxo not found: {0}")]
    UtxoNotFound(OutPoint),

    #[error("signing oracle refused: {0}")]
    OracleRefused(String),

    #[error("ledger rejected transaction: {0}")]
    LedgerRejected(String),

    #[error("electrum error: {0}")]
    Electrum(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Decode(DecodeError::Malformed(reason.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
