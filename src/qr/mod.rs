//! Time-boxed QR check-in protocol.
//!
//! - `token`: signing, validation, countdown arithmetic
//! - `display`: periodic regeneration on the customer's screen
//! - `checkin`: staff-side scan, replay lookup, visit recording

pub mod checkin;
pub mod display;
pub mod token;

pub use checkin::{CheckIn, CheckInReceipt, ScanAccepted, ScanRejection};
pub use display::{Clock, QrDisplay, QrFrame, SystemClock};
pub use token::{
    countdown_secs, generate, validate, QrProtocol, QrToken, Signer, TokenRejection, WINDOW_MS,
};
