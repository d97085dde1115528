//! Orchestration layer
//!
//! Lets one module invoke others: composed batches merged into a single
//! response, chained pipelines where each step consumes its predecessor's
//! output, and the out-of-band notification path for async batches.

pub mod executor;
pub mod notify;

pub use executor::{parse_batch, FaultPolicy, Orchestrator};
pub use notify::{LogNotifier, Notifier};
