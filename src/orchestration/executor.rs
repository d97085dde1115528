//! Orchestration executor
//!
//! Runs batches of sub-requests against the dispatcher in composed
//! (independent, merged into one array response) or chained (sequential,
//! each step consuming the previous step's output) mode, with the merge
//! window protocol for externally-assembled fragment streams and an async
//! mode that detaches the batch from the caller's response cycle.

use std::sync::Arc;

use log::{debug, warn, Level};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    core::{
        context::param,
        error::{code, ServiceError, ServiceResult},
        Dispatcher, OrchestrationMode, RequestContext,
    },
    wire::{writer::DynSink, Encoding, MergeMode, ResponseWriter, WireMessage},
};

use super::notify::Notifier;

/// Fault handling policy for composed batches. Chained batches always stop
/// on fault when the caller asked for faults to be respected.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPolicy {
    /// Abort a composed batch on the first fault instead of dispatching
    /// the remaining sub-requests.
    pub abort_composed_on_fault: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<dyn Notifier>,
    policy: FaultPolicy,
}

impl Orchestrator {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        notifier: Arc<dyn Notifier>,
        policy: FaultPolicy,
    ) -> Self {
        Self {
            dispatcher,
            notifier,
            policy,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Execute the batch carried in the context payload and write the
    /// merged response to the sink. Batch-level problems (bad payload, no
    /// mode) become framed error responses; only sink I/O failures
    /// propagate as `Err`.
    pub async fn execute(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let batch = match ctx.payload() {
            Err(e) => return self.refuse(ctx, service, out, e),
            Ok(None) => {
                return self.refuse(
                    ctx,
                    service,
                    out,
                    ServiceError::Decode("orchestration request has no batch payload".to_string()),
                )
            }
            Ok(Some(payload)) => match parse_batch(payload) {
                Ok(batch) => batch,
                Err(e) => return self.refuse(ctx, service, out, e),
            },
        };

        if !ctx.mode.is_orchestrated() {
            return self.refuse(
                ctx,
                service,
                out,
                ServiceError::IllegalState(
                    "orchestration requires mode=composed or mode=chained".to_string(),
                ),
            );
        }

        if ctx.is_async() {
            return self.execute_async(ctx, service, batch, out);
        }
        self.run_batch(ctx, service, batch, out).await
    }

    async fn run_batch(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        batch: Vec<WireMessage>,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        match ctx.mode {
            OrchestrationMode::Composed => self.run_composed(ctx, service, batch, out).await,
            OrchestrationMode::Chained => self.run_chained(ctx, service, batch, out).await,
            OrchestrationMode::None => unreachable!("checked by execute"),
        }
    }

    // --- composed ---

    async fn run_composed(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        batch: Vec<WireMessage>,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let encoding = ctx.output_encoding();
        let window = ctx.merge_window();
        let abort_on_fault = self.policy.abort_composed_on_fault && ctx.respect_fault();

        // Each sub-request renders into its own buffer; buffers are
        // flushed in input order regardless of completion order.
        let mut children: Vec<(RequestContext, WireMessage)> = batch
            .into_iter()
            .map(|sub| (self.child_context(ctx, &sub), sub))
            .collect();

        let mut fragments: Vec<Vec<u8>> = Vec::with_capacity(children.len());
        if abort_on_fault {
            for (child, sub) in children.iter_mut() {
                fragments.push(self.render_fragment(child, sub).await);
                if child.has_fault() {
                    warn!("composed batch aborted at fragment {}", fragments.len());
                    break;
                }
            }
        } else {
            fragments = futures::future::join_all(
                children
                    .iter_mut()
                    .map(|(child, sub)| self.render_fragment(child, sub)),
            )
            .await;
        }

        // Faults persist on each child until read back here.
        for (child, _) in &children {
            if let Some(fault) = child.fault() {
                ctx.raise_fault(fault.code, fault.message.clone());
            }
        }

        let mut writer = self.batch_writer(ctx, service, out, window);
        {
            let mut sink = writer.stream()?;
            let mut first = window.map(|(index, _)| index == 0).unwrap_or(true);
            for fragment in &fragments {
                if encoding == Encoding::Json && !first {
                    std::io::Write::write_all(&mut sink, b",")?;
                }
                std::io::Write::write_all(&mut sink, fragment)?;
                first = false;
            }
        }
        if ctx.wants_duration {
            writer.set_duration(ctx.duration_millis());
        }
        writer.set_fault(ctx.has_fault());
        writer.done()
    }

    /// Dispatch one sub-request into a private buffer, producing a
    /// complete framed sub-response even when dispatch itself errors.
    async fn render_fragment(&self, child: &mut RequestContext, sub: &WireMessage) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        if let Err(e) = self.dispatcher.dispatch(child, sub, &mut buf).await {
            warn!("sub-request to '{}' failed outside dispatch: {e}", sub.service);
            child.raise_fault(e.wire_code(), e.to_string());
            buf = error_fragment(child.output_encoding(), &sub.service, &e);
        }
        buf
    }

    // --- chained ---

    async fn run_chained(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        batch: Vec<WireMessage>,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let window = ctx.merge_window();
        let respect_fault = ctx.respect_fault();
        let total = batch.len();
        let mut previous: Option<Vec<u8>> = None;

        for (step, sub) in batch.iter().enumerate() {
            let last = step + 1 == total;
            let mut child = self.child_context(ctx, sub);
            child.chains_forward = !last;
            child.is_last = last;

            // Step i's buffered output is the only input step i+1 sees.
            if let Some(bytes) = previous.take() {
                match decode_step_output(&bytes) {
                    Ok(message) => {
                        if message.is_error() {
                            ctx.raise_fault(
                                message.error_code,
                                message.error_message.clone().unwrap_or_default(),
                            );
                            if respect_fault {
                                return self.write_chain_fault(ctx, service, out);
                            }
                        }
                        child.set_payload(message.payload);
                    }
                    Err(e) => {
                        ctx.raise_fault(e.wire_code(), e.to_string());
                        return self.write_chain_fault(ctx, service, out);
                    }
                }
            }

            if last {
                // Seed accumulated fault state so the final frame carries
                // the orchestration-fault marker.
                if let Some(fault) = ctx.fault() {
                    child.raise_fault(fault.code, fault.message.clone());
                }
                child.orchestration_marker = true;
                child.wants_duration = ctx.wants_duration;
                if let Some((w_index, w_total)) = window {
                    child.set_param(param::MERGE_INDEX, w_index.to_string());
                    child.set_param(param::MERGE_TOTAL, w_total.to_string());
                }
                self.dispatcher.dispatch(&mut child, sub, out).await?;
                if let Some(fault) = child.fault() {
                    ctx.raise_fault(fault.code, fault.message.clone());
                }
                return Ok(());
            }

            let mut buf: Vec<u8> = Vec::new();
            self.dispatcher.dispatch(&mut child, sub, &mut buf).await?;
            debug!(
                "chained step {step} of '{service}' produced {} byte(s)",
                buf.len()
            );
            if let Some(fault) = child.fault() {
                ctx.raise_fault(fault.code, fault.message.clone());
                if respect_fault {
                    return self.write_chain_fault(ctx, service, out);
                }
            }
            previous = Some(buf);
            // What this step wrote becomes the next step's channel input.
            ctx.rotate_channels();
        }

        // Empty batch: a well-formed empty success response.
        let mut writer = self.outer_writer(ctx, service, out, window);
        writer.set_fault(ctx.has_fault());
        writer.done()
    }

    /// Final faulted response for a stopped chain. Never merge-suppressed:
    /// an aborted fragment stream ends with a standalone error document.
    fn write_chain_fault(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let fault = ctx
            .fault()
            .cloned()
            .unwrap_or_else(|| crate::core::FaultInfo {
                code: code::FAULT,
                message: "chained batch faulted".to_string(),
            });
        let mut writer = self.outer_writer(ctx, service, out, None);
        if ctx.wants_duration {
            writer.set_duration(ctx.duration_millis());
        }
        writer.set_fault(true);
        writer.write_error_response(fault.code, &fault.message)
    }

    // --- async mode ---

    /// Substitute a no-op sink for the batch, answer the caller with an
    /// immediate empty success response and report the outcome out of band
    /// once the background task finishes.
    fn execute_async(
        &self,
        ctx: &mut RequestContext,
        service: &str,
        batch: Vec<WireMessage>,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let transaction = ctx
            .transaction
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ctx.transaction = Some(transaction.clone());

        let mut detached = RequestContext::new(ctx.params().clone(), ctx.verb().clone(), None);
        detached.transaction = Some(transaction.clone());
        detached.adopt_channels(ctx);
        if let Ok(Some(payload)) = ctx.payload() {
            detached.set_payload(Some(payload.clone()));
        }

        let orchestrator = self.clone();
        let notify = ctx.wants_notify();
        let service_name = service.to_string();
        tokio::spawn(async move {
            let mut discard = std::io::sink();
            let result = orchestrator
                .run_batch(&mut detached, &service_name, batch, &mut discard)
                .await;
            if !notify {
                return;
            }
            let (level, status) = match (&result, detached.fault()) {
                (Err(e), _) => (Level::Error, format!("failed: {e}")),
                (Ok(()), Some(fault)) => {
                    (Level::Warn, format!("faulted ({}): {}", fault.code, fault.message))
                }
                (Ok(()), None) => (Level::Info, "completed".to_string()),
            };
            orchestrator.notifier.notify(
                level,
                &format!("orchestration '{transaction}' on '{service_name}' {status}"),
            );
        });

        let mut writer = self.outer_writer(ctx, service, out, None);
        writer.done()
    }

    // --- helpers ---

    /// Per-sub-request context: the sub-request's own parameters plus the
    /// inherited negotiation parameters, a fresh fault slot and duration
    /// clock, and the parent's object channel references.
    fn child_context(&self, parent: &RequestContext, sub: &WireMessage) -> RequestContext {
        let mut params = sub.parameters.clone();
        for key in [
            param::ENCODING_IN,
            param::ENCODING_OUT,
            param::LOG_LEVEL,
        ] {
            if !params.contains_key(key) {
                if let Some(values) = parent.params().get(key) {
                    params.insert(key.to_string(), values.clone());
                }
            }
        }
        let mut child = RequestContext::new(params, parent.verb().clone(), None);
        if let Some(action) = &sub.action {
            child.set_action(action.clone());
        }
        if child.transaction.is_none() {
            child.transaction = sub
                .transaction
                .clone()
                .or_else(|| parent.transaction.clone());
        }
        if sub.payload.is_some() {
            child.set_payload(sub.payload.clone());
        }
        child.adopt_channels(parent);
        child
    }

    fn batch_writer<'a>(
        &self,
        ctx: &RequestContext,
        service: &str,
        out: DynSink<'a>,
        window: Option<(usize, usize)>,
    ) -> ResponseWriter<DynSink<'a>> {
        self.outer_writer(ctx, service, out, window).batch(true)
    }

    fn outer_writer<'a>(
        &self,
        ctx: &RequestContext,
        service: &str,
        out: DynSink<'a>,
        window: Option<(usize, usize)>,
    ) -> ResponseWriter<DynSink<'a>> {
        let mut writer = ResponseWriter::new(out, ctx.output_encoding(), service);
        if let Some(transaction) = &ctx.transaction {
            writer = writer.transaction(transaction);
        }
        if let Some((index, total)) = window {
            writer = writer.merge(MergeMode::window(index, total));
        }
        writer
    }

    fn refuse(
        &self,
        ctx: &RequestContext,
        service: &str,
        out: DynSink<'_>,
        error: ServiceError,
    ) -> ServiceResult<()> {
        warn!("orchestration request refused: {error}");
        let mut writer = self.outer_writer(ctx, service, out, None);
        writer.write_error_response(error.wire_code(), &error.to_string())
    }
}

/// Parse the batch payload: either an array of sub-request envelopes or an
/// object wrapping one under `requests`.
pub fn parse_batch(payload: &Value) -> ServiceResult<Vec<WireMessage>> {
    let entries = match payload {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("requests") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(ServiceError::Decode(
                    "orchestration payload must be an array of sub-requests".to_string(),
                ))
            }
        },
        _ => {
            return Err(ServiceError::Decode(
                "orchestration payload must be an array of sub-requests".to_string(),
            ))
        }
    };
    entries.iter().map(WireMessage::from_structured).collect()
}

fn decode_step_output(bytes: &[u8]) -> ServiceResult<WireMessage> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ServiceError::Decode(format!("step output is not text: {e}")))?;
    WireMessage::from_text(text).map(|(_, message)| message)
}

fn error_fragment(encoding: Encoding, service: &str, error: &ServiceError) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    let mut writer = ResponseWriter::new(&mut buf, encoding, service);
    // Writing into a Vec cannot fail.
    let _ = writer.write_error_response(error.wire_code(), &error.to_string());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_batch_accepts_array_and_wrapper() {
        let batch = parse_batch(&json!([
            {"service": "a"},
            {"service": "b", "action": "x", "data": {"k": "v"}}
        ]))
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].service, "b");
        assert_eq!(batch[1].action.as_deref(), Some("x"));

        let batch = parse_batch(&json!({"requests": [{"service": "a"}]})).unwrap();
        assert_eq!(batch.len(), 1);

        assert!(parse_batch(&json!("nope")).is_err());
        assert!(parse_batch(&json!({"other": 1})).is_err());
    }
}
