//! Target descriptors
//!
//! Compiles the configured per-service target lists into producers once at
//! startup. The compiled table is immutable; failover order is the
//! configured order.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::info;

use crate::{
    config::{self, TargetKind},
    core::error::ServiceResult,
};

use super::producer::{HttpMessageProducer, HttpRawProducer, MessageProducer, RawProducer};

pub enum TargetProducer {
    /// In-process short-circuit through the orchestration engine.
    Local,
    Raw(Arc<dyn RawProducer>),
    Structured(Arc<dyn MessageProducer>),
}

pub struct Target {
    /// Display label for logging: the endpoint, or "local".
    pub label: String,
    pub auth_required: bool,
    pub read_timeout: Option<Duration>,
    pub producer: TargetProducer,
}

impl Target {
    pub fn local() -> Self {
        Self {
            label: "local".to_string(),
            auth_required: false,
            read_timeout: None,
            producer: TargetProducer::Local,
        }
    }

    fn from_config(config: &config::Target) -> ServiceResult<Self> {
        if config.local {
            return Ok(Self {
                auth_required: config.auth,
                ..Self::local()
            });
        }
        // Validated at config load: a remote target always has a url.
        let url = config.url.clone().unwrap_or_default();
        let connect = config.connect_timeout.map(Duration::from_secs);
        let read = config.read_timeout.map(Duration::from_secs);
        let producer = match config.kind {
            TargetKind::Raw => {
                TargetProducer::Raw(Arc::new(HttpRawProducer::new(&url, connect, read)?))
            }
            TargetKind::Structured => {
                TargetProducer::Structured(Arc::new(HttpMessageProducer::new(&url, connect, read)?))
            }
        };
        Ok(Self {
            label: url,
            auth_required: config.auth,
            read_timeout: read,
            producer,
        })
    }
}

/// Immutable logical-name to failover-list table.
#[derive(Default)]
pub struct TargetTable {
    targets: HashMap<String, Vec<Target>>,
}

impl TargetTable {
    pub fn from_config(config: &HashMap<String, Vec<config::Target>>) -> ServiceResult<Self> {
        let mut targets = HashMap::new();
        for (service, entries) in config {
            let compiled: Vec<Target> = entries
                .iter()
                .map(Target::from_config)
                .collect::<ServiceResult<_>>()?;
            info!(
                "virtualized service '{service}' over {} target(s)",
                compiled.len()
            );
            targets.insert(service.clone(), compiled);
        }
        Ok(Self { targets })
    }

    /// Table with explicit entries, used by tests and embedders.
    pub fn with_targets(targets: HashMap<String, Vec<Target>>) -> Self {
        Self { targets }
    }

    pub fn get(&self, service: &str) -> Option<&[Target]> {
        self.targets
            .get(service)
            .map(Vec::as_slice)
            .filter(|list| !list.is_empty())
    }
}
