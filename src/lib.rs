// ===============================
// src/lib.rs
// ===============================
pub mod agent;
pub mod analyst;
pub mod bus;
pub mod config;
pub mod domain;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod portfolio;
pub mod recorder;
pub mod simulator;
pub mod store;
pub mod wallet;
