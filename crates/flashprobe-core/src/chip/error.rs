use thiserror::Error;

use super::types::FlashInterface;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChipError {
    #[error("Chip not identified (raw ID: {raw_id})")]
    Unresolved { raw_id: String },

    #[error("Uncorrectable ECC error at page {page}")]
    UncorrectableEcc { page: u64 },

    #[error("{operation} is not supported on {interface}")]
    CapabilityMismatch {
        interface: FlashInterface,
        operation: &'static str,
    },

    #[error("Invalid ONFI parameter page: {0}")]
    InvalidParamPage(String),

    #[error("Invalid {kind} descriptor: {reason}")]
    InvalidDescriptor { kind: &'static str, reason: String },
}
