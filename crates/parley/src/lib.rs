//! Parley backend library.
//!
//! Core components for the Parley chat backend: run scheduling, the durable
//! run event log, live fan-out, and the resumable streaming API.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod provider;
pub mod run;
