//! Induction Guard - Abuse-Resistance Rate Limiting Engine
//!
//! This crate implements the guardrail layer in front of the untrusted entry
//! points of a visitor-induction service: public QR access, login, sign-in,
//! sign-out by token and CSP report ingestion. Counters live in Redis when a
//! backend is configured and in process memory otherwise.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;
