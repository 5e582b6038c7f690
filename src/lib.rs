//! Tether: keeps long-lived messaging network sessions alive for many
//! agents at once.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod health;
pub mod ingest;
pub mod policy;
pub mod session;
pub mod transport;
pub mod vault;
pub mod webhook;
