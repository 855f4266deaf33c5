//! Mailbox ingestion and draft automation.
//!
//! Polls a connected mailbox, classifies unread customer mail, labels it,
//! records an activity per message, generates reply drafts and optionally
//! sends them after a per-user delay.

pub mod auth;
pub mod autosend;
pub mod category;
pub mod client;
pub mod config;
pub mod db;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod gmail;
pub mod http;
pub mod labels;
pub mod models;
pub mod pipeline;
pub mod refresh;
pub mod services;
pub mod store;

#[doc(hidden)]
pub mod testing;
