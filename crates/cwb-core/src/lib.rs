//! Core domain + application logic for the commit watch bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and GitHub live behind
//! ports (traits) implemented in adapter crates.

pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod gateway;
pub mod logging;
pub mod messaging;
pub mod poller;
pub mod registry;
pub mod source;
pub mod store;

pub use errors::{Error, Result};
