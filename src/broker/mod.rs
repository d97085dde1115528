//! Broker / target virtualization
//!
//! Resolves a logical service name to in-process dispatch or to one of
//! several ordered remote targets. Failover advances past a target only
//! when its response is "service not found"; the last target's result is
//! returned unconditionally. Authorization is evaluated per target before
//! dispatch and never retried across targets.

pub mod producer;
pub mod target;

use std::{io::Write, sync::Arc, time::Duration};

use http::Method;
use log::{debug, warn};

use crate::{
    auth::Authenticator,
    core::{
        context::param,
        error::{code, ServiceError, ServiceResult},
        RequestContext,
    },
    orchestration::Orchestrator,
    wire::{codec, peek_error_code, writer::DynSink, ResponseWriter, WireMessage},
};

pub use producer::{HttpMessageProducer, HttpRawProducer, MessageProducer, RawProducer};
pub use target::{Target, TargetProducer, TargetTable};

pub struct Broker {
    orchestrator: Arc<Orchestrator>,
    targets: TargetTable,
    auth: Arc<dyn Authenticator>,
}

impl Broker {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        targets: TargetTable,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            orchestrator,
            targets,
            auth,
        }
    }

    /// Route one request: local dispatch when the logical name has no
    /// targets (or hits a local one), ordered failover otherwise. The
    /// `target` parameter overrides the logical name for resolution.
    pub async fn invoke(
        &self,
        ctx: &mut RequestContext,
        request: &WireMessage,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let logical = ctx
            .param(param::TARGET)
            .unwrap_or(&request.service)
            .to_string();

        match self.targets.get(&logical) {
            None => self.dispatch_local(ctx, request, out).await,
            Some(targets) => self.failover(ctx, request, &logical, targets, out).await,
        }
    }

    /// Consumer entry point: an already-framed message targeted at the
    /// broker itself (e.g. arriving over a transport the broker does not
    /// own) goes through the same resolution logic and comes back framed.
    pub async fn consume(&self, message: WireMessage, verb: Method) -> ServiceResult<WireMessage> {
        let mut ctx = RequestContext::from_message(&message, verb);
        let mut buf: Vec<u8> = Vec::new();
        self.invoke(&mut ctx, &message, &mut buf).await?;
        let text = String::from_utf8(buf)
            .map_err(|e| ServiceError::Internal(format!("response is not text: {e}")))?;
        WireMessage::from_text(&text).map(|(_, message)| message)
    }

    async fn dispatch_local(
        &self,
        ctx: &mut RequestContext,
        request: &WireMessage,
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        if ctx.mode.is_orchestrated() {
            self.orchestrator.execute(ctx, &request.service, out).await
        } else {
            self.orchestrator
                .dispatcher()
                .dispatch(ctx, request, out)
                .await
        }
    }

    async fn failover(
        &self,
        ctx: &mut RequestContext,
        request: &WireMessage,
        logical: &str,
        targets: &[Target],
        out: DynSink<'_>,
    ) -> ServiceResult<()> {
        let payload_bytes = self.payload_bytes(ctx, request)?;
        let read_override = ctx
            .param(param::READ_TIMEOUT)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);

        let count = targets.len();
        for (position, target) in targets.iter().enumerate() {
            let last = position + 1 == count;

            if target.auth_required {
                // Fails fast: an auth error is final, no further targets.
                let principal = self.auth.authenticate(ctx.params(), &payload_bytes).await?;
                debug!(
                    "authorized '{}' for target {} of '{logical}'",
                    principal.subject, target.label
                );
            }

            let read_timeout = read_override.or(target.read_timeout);
            match &target.producer {
                TargetProducer::Local => {
                    debug!("'{logical}' short-circuits to local dispatch");
                    return self.dispatch_local(ctx, request, out).await;
                }
                TargetProducer::Raw(producer) => {
                    let response = producer.produce(&payload_bytes, read_timeout).await?;
                    match response {
                        Some(bytes) => {
                            if !last && peek_error_code(&bytes) == Some(code::NOT_FOUND) {
                                warn!(
                                    "target {} of '{logical}' has no such service, failing over",
                                    target.label
                                );
                                continue;
                            }
                            out.write_all(&bytes)?;
                            return Ok(());
                        }
                        None => {
                            // nil out: synthesize an empty success response
                            let mut writer =
                                ResponseWriter::new(out, ctx.output_encoding(), logical);
                            return writer.done();
                        }
                    }
                }
                TargetProducer::Structured(producer) => {
                    let response = producer
                        .produce(request, ctx.output_encoding(), read_timeout)
                        .await?;
                    if !last && response.error_code == code::NOT_FOUND {
                        warn!(
                            "target {} of '{logical}' has no such service, failing over",
                            target.label
                        );
                        continue;
                    }
                    let text = response.to_text(ctx.output_encoding())?;
                    out.write_all(text.as_bytes())?;
                    return Ok(());
                }
            }
        }
        Err(ServiceError::NotFound(format!(
            "no targets configured for '{logical}'"
        )))
    }

    /// Payload bytes handed to raw producers and the auth collaborator.
    fn payload_bytes(
        &self,
        ctx: &RequestContext,
        request: &WireMessage,
    ) -> ServiceResult<Vec<u8>> {
        match &request.payload {
            Some(payload) => {
                let text = codec::encode(ctx.output_encoding(), payload)?;
                Ok(text.into_bytes())
            }
            None => Ok(Vec::new()),
        }
    }
}
