//! Module registry and dispatcher
//!
//! The registry holds the loaded modules in one immutable generation: a
//! name map plus a pattern index derived from it, swapped atomically as a
//! pair so readers never observe maps from different generations. The
//! dispatcher resolves requests by name or by pattern against the current
//! generation and frames the handler result onto the output sink.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use arc_swap::ArcSwap;
use log::{error, info, log, warn};

use crate::wire::{codec, writer::DynSink, MergeMode, ResponseWriter, WireMessage};

use super::{
    context::RequestContext,
    error::{ServiceError, ServiceResult},
    loader::load_pass,
    module::Module,
};

/// One immutable registry generation.
struct Generation {
    by_name: HashMap<String, Arc<Module>>,
    /// Pattern index: dispatch group to modules in ascending priority
    /// order, ties broken by registration order.
    by_group: HashMap<String, Vec<Arc<Module>>>,
}

impl Generation {
    fn empty() -> Self {
        Self {
            by_name: HashMap::new(),
            by_group: HashMap::new(),
        }
    }

    fn build(modules: Vec<Arc<Module>>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_group: HashMap<String, Vec<Arc<Module>>> = HashMap::new();
        for module in modules {
            if let Some(pattern) = &module.pattern {
                by_group
                    .entry(pattern.group.clone())
                    .or_default()
                    .push(Arc::clone(&module));
            }
            by_name.insert(module.name.clone(), module);
        }
        for members in by_group.values_mut() {
            // Stable sort keeps registration order within equal priorities.
            members.sort_by_key(|m| m.pattern.as_ref().map(|p| p.priority).unwrap_or(u32::MAX));
        }
        Self { by_name, by_group }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub module_count: usize,
    pub group_count: usize,
}

pub struct Registry {
    current: ArcSwap<Generation>,
    /// Guards load/reload/destroy; dispatch reads never take it.
    reload_lock: tokio::sync::Mutex<()>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Generation::empty()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Scan the directories and install the loaded modules as the new
    /// generation. On any failure the registry is left empty, never
    /// partially populated.
    pub async fn load(
        &self,
        dirs: &[PathBuf],
        isolated: bool,
        fail_on_error: bool,
    ) -> ServiceResult<usize> {
        let _guard = self.reload_lock.lock().await;
        self.load_locked(dirs, isolated, fail_on_error)
    }

    /// Destroy-then-load with a single atomic generation swap.
    pub async fn reload(
        &self,
        dirs: &[PathBuf],
        isolated: bool,
        fail_on_error: bool,
    ) -> ServiceResult<usize> {
        let _guard = self.reload_lock.lock().await;
        self.teardown_generation(&self.current.load_full()).await;
        self.load_locked(dirs, isolated, fail_on_error)
    }

    /// Tear down every module and install the empty generation.
    pub async fn destroy(&self) {
        let _guard = self.reload_lock.lock().await;
        let old = self.current.swap(Arc::new(Generation::empty()));
        self.teardown_generation(&old).await;
    }

    /// Install pre-built modules as the new generation, bypassing bundle
    /// loading. Embedders use this to register in-process modules.
    pub async fn install(&self, modules: Vec<Arc<Module>>) {
        let _guard = self.reload_lock.lock().await;
        self.current.store(Arc::new(Generation::build(modules)));
    }

    fn load_locked(
        &self,
        dirs: &[PathBuf],
        isolated: bool,
        fail_on_error: bool,
    ) -> ServiceResult<usize> {
        match load_pass(dirs, isolated, fail_on_error) {
            Ok(modules) => {
                let count = modules.len();
                self.current.store(Arc::new(Generation::build(modules)));
                let stats = self.stats();
                info!(
                    "registry loaded: {} module(s), {} dispatch group(s)",
                    stats.module_count, stats.group_count
                );
                Ok(count)
            }
            Err(e) => {
                self.current.store(Arc::new(Generation::empty()));
                error!("load pass failed, registry cleared: {e}");
                Err(e)
            }
        }
    }

    async fn teardown_generation(&self, generation: &Generation) {
        for module in generation.by_name.values() {
            if let Err(e) = module.destroy().await {
                warn!("teardown of module '{}' failed: {e}", module.name);
            }
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.current.load().by_name.get(name).cloned()
    }

    /// First pattern match in the group's priority order, or `None` so the
    /// caller can signal "service not found".
    pub fn get_by_pattern(&self, group: &str, ctx: &RequestContext) -> Option<Arc<Module>> {
        let generation = self.current.load();
        generation
            .by_group
            .get(group)?
            .iter()
            .find(|module| module.active && module.matches(ctx))
            .cloned()
    }

    /// Refresh one module's health on demand. `None` when the module does
    /// not exist.
    pub async fn refresh_health(&self, name: &str) -> Option<bool> {
        let module = self.get_by_name(name)?;
        Some(module.refresh_health().await)
    }

    pub fn stats(&self) -> RegistryStats {
        let generation = self.current.load();
        RegistryStats {
            module_count: generation.by_name.len(),
            group_count: generation.by_group.len(),
        }
    }
}

/// Resolves a request to a module action and frames the result.
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch one request and write a complete framed response (success
    /// or error) to the sink. Resolution and handler errors become faulted
    /// wire responses and are recorded on the context; only sink I/O
    /// failures propagate as `Err`.
    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        request: &WireMessage,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let module = self.resolve(ctx, request);
        let service = match &module {
            Some(module) if request.service.is_empty() => module.name.clone(),
            _ => request.service.clone(),
        };

        let handler = match module {
            None => {
                let message = match ctx.dispatch_group() {
                    Some(group) => format!("no module matches group '{group}'"),
                    None => format!("unknown service '{service}'"),
                };
                return self.fail(ctx, &service, out, ServiceError::NotFound(message));
            }
            Some(module) if !module.active => {
                let message = format!("module '{}' is not active", module.name);
                return self.fail(ctx, &service, out, ServiceError::NotFound(message));
            }
            Some(module) => match module.action(ctx.action()) {
                Some(handler) => handler,
                None => {
                    let message =
                        format!("module '{}' has no action '{}'", module.name, ctx.action());
                    return self.fail(ctx, &service, out, ServiceError::NotFound(message));
                }
            },
        };

        match handler.handle(ctx, request).await {
            Ok(outcome) => {
                let raw = ctx.raw_output || outcome.raw.is_some();
                let mut writer = self.build_writer(ctx, &service, out).raw(raw);
                if !outcome.parameters.is_empty() {
                    writer.set_parameters(outcome.parameters);
                }
                if ctx.wants_duration {
                    writer.set_duration(ctx.duration_millis());
                }
                if ctx.orchestration_marker {
                    writer.set_fault(ctx.has_fault());
                }
                log!(
                    ctx.log_level,
                    "dispatched '{service}' action '{}' in {}ms",
                    ctx.action(),
                    ctx.duration_millis()
                );
                match (outcome.raw, outcome.payload) {
                    (Some(bytes), _) => writer.write_response(&bytes),
                    (None, Some(payload)) => {
                        let text = codec::encode_payload(ctx.output_encoding(), &payload)?;
                        writer.write_response(text.as_bytes())
                    }
                    (None, None) => writer.done(),
                }
            }
            Err(e) => self.fail(ctx, &service, out, e),
        }
    }

    fn resolve(&self, ctx: &RequestContext, request: &WireMessage) -> Option<Arc<Module>> {
        match ctx.dispatch_group() {
            Some(group) => self.registry.get_by_pattern(group, ctx),
            None => self.registry.get_by_name(&request.service),
        }
    }

    fn build_writer<'a>(
        &self,
        ctx: &RequestContext,
        service: &str,
        out: DynSink<'a>,
    ) -> ResponseWriter<DynSink<'a>> {
        let mut writer =
            ResponseWriter::new(out, ctx.output_encoding(), service).action(ctx.action());
        if let Some(transaction) = &ctx.transaction {
            writer = writer.transaction(transaction);
        }
        if let Some((index, total)) = ctx.merge_window() {
            writer = writer.merge(MergeMode::window(index, total));
        }
        writer
    }

    fn fail(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        out: DynSink<'_>,
        error: ServiceError,
    ) -> ServiceResult<()> {
        let wire_code = error.wire_code();
        let message = error.to_string();
        warn!("dispatch of '{service}' failed ({wire_code}): {message}");
        ctx.raise_fault(wire_code, message.clone());
        let mut writer = self.build_writer(ctx, service, out);
        if ctx.wants_duration {
            writer.set_duration(ctx.duration_millis());
        }
        if ctx.orchestration_marker {
            writer.set_fault(true);
        }
        writer.write_error_response(wire_code, &message)
    }
}
