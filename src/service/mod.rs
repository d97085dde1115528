//! Runtime assembly
//!
//! Builds the registry, dispatcher, orchestrator and broker from
//! configuration. No component reaches for ambient state: everything is
//! constructed here and injected.

pub mod tcp;

use std::sync::Arc;

use crate::{
    auth::build_authenticator,
    broker::{Broker, TargetTable},
    config::Config,
    core::{Dispatcher, Registry, ServiceResult},
    orchestration::{FaultPolicy, LogNotifier, Orchestrator},
};

pub use tcp::TcpHost;

/// Build the full runtime from configuration, loading modules from the
/// configured bundle directories.
pub async fn build_runtime(config: &Config) -> ServiceResult<(Arc<Registry>, Arc<Broker>)> {
    let registry = Arc::new(Registry::new());
    registry
        .load(
            &config.runtime.module_dirs,
            config.runtime.isolated,
            config.runtime.fail_on_error,
        )
        .await?;

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
    let orchestrator = Arc::new(Orchestrator::new(
        dispatcher,
        Arc::new(LogNotifier),
        FaultPolicy {
            abort_composed_on_fault: config.orchestration.abort_composed_on_fault,
        },
    ));
    let targets = TargetTable::from_config(&config.targets)?;
    let auth = build_authenticator(&config.auth)?;
    let broker = Arc::new(Broker::new(orchestrator, targets, auth));

    Ok((registry, broker))
}
