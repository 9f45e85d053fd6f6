//! WA Copilot backend
//!
//! Core functionality of the messaging copilot: policy screening and PII
//! masking, a semantic generation cache, a token-budgeted context builder,
//! a model router with a primary/fallback ladder, quality validation of
//! model output, and a durable at-least-once job pipeline (queue, batching
//! producer, worker processor) behind a thin axum HTTP surface.

pub mod app_state;
pub mod config;
pub mod db;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
