//! # hatym-rs
//!
//! Lease-based distribution of the 604 pages of a communal hatym among
//! anonymous participants.
//!
//! Provides the assignment store contract (in-memory and Postgres), the
//! per-device claim coordinator, the expiry sweeper, the kiosk dashboard
//! projection, and OpenTelemetry observability.

pub mod asset;
pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod event;
pub mod model;
pub mod store;
pub mod sweeper;
pub mod telemetry;
