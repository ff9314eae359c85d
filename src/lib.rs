//! Inbox workers: mail sync, AI thread processing and the scheduler that drives them.

pub mod ai;
pub mod api;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod logging;
pub mod mail;
pub mod metrics;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;
