//! Core receipt model for the ReceiptGate ledger.
//!
//! This crate is pure: the receipt types, the canonical-hash computation that
//! serves as the idempotency key, and the schema validator live here, with no
//! database or transport dependencies. Storage backends consume
//! [`ValidatedReceipt`] values and return committed [`Receipt`] rows.

pub mod canonical;
pub mod clock;
pub mod error;
pub mod model;
pub mod validate;

pub use canonical::{canonical_bytes, canonical_hash};
pub use clock::{format_db_timestamp, now_db_utc, now_utc, parse_db_timestamp};
pub use error::{FieldError, ReceiptGateError};
pub use model::{
    ArtifactKind, ArtifactRef, Phase, Receipt, ReceiptDraft, SubmitOutcome, TERMINAL_PHASES,
};
pub use validate::{parse_receipt, validate_receipt, ValidatedReceipt};
