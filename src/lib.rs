// ===============================
// src/lib.rs
// ===============================
pub mod agents;
pub mod collector;
pub mod config;
pub mod decision;
pub mod domain;
pub mod execution;
pub mod fallback;
pub mod feed;
pub mod fusion;
pub mod market;
pub mod metrics;
pub mod positions;
pub mod rate_budget;
pub mod recorder;
pub mod regime;
pub mod risk;
pub mod vpin;
