//! Core domain + application logic for the file-store bot.
//!
//! This crate is intentionally framework-agnostic. The Telegram transport,
//! the ffmpeg media tool and the record store live behind ports (traits)
//! implemented in adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod expiry;
pub mod formatting;
pub mod index;
pub mod link;
pub mod logging;
pub mod media;
pub mod records;
pub mod store;
pub mod transport;
pub mod workspace;

pub use errors::{Error, Result};
