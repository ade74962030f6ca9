//! Odoo Manager, a local control plane for Odoo projects, each running as
//! a Docker container pair (Odoo + Postgres).
//!
//! The HTTP layer answers fast and pushes all long work onto background
//! lifecycle tasks; browsers follow along over the `/api/events` SSE
//! stream. See `api` for the surface, `lifecycle` for the orchestration
//! contract, and `docker` for the daemon plumbing.

pub mod api;
pub mod audit;
pub mod config;
pub mod docker;
pub mod errors;
pub mod events;
pub mod gitops;
pub mod lifecycle;
pub mod server;
pub mod sse;
pub mod store;
