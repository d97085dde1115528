//! modserve: a service-hosting runtime.
//!
//! Independently loadable service modules register into a shared process;
//! requests are dispatched by name or by pattern, framed by a symmetric
//! two-encoding wire protocol, orchestrated in composed or chained batches
//! and optionally brokered to remote targets with ordered failover.

pub mod auth;
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod orchestration;
pub mod service;
pub mod wire;
