//! NailBliss loyalty client.
//!
//! Customers show a QR code that rotates once a minute; staff scan it to
//! record a visit and add a loyalty point. The core is split into:
//! - `auth`: start-up session restore, retry budget, user actions
//! - `qr`: token signing and validation, the rotating display, check-in
//! - `backend`: contracts for the hosted auth and row store
//! - `integrations`: the Supabase implementation of those contracts

pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod integrations;
pub mod loyalty;
pub mod qr;

#[cfg(test)]
pub(crate) mod testing;
