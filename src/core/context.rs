//! Request context management
//!
//! One `RequestContext` exists per inbound or internally-generated request.
//! It carries the negotiated encodings, action, transaction token, flags,
//! the fault state, and the object channel used to pass results between
//! orchestration steps without serialization.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use http::Method;
use log::Level;
use once_cell::unsync::OnceCell;
use serde_json::Value;

use crate::wire::{codec, Encoding, ParamMap, WireMessage};

use super::error::ServiceResult;

/// Dispatch selection parameters consumed from the caller.
pub mod param {
    pub const ENCODING_IN: &str = "encoding-in";
    pub const ENCODING_OUT: &str = "encoding-out";
    pub const ACTION: &str = "action";
    pub const TRANSACTION: &str = "transaction-data";
    pub const DATA: &str = "data";
    pub const RAW_RESPONSE: &str = "raw-response";
    pub const DURATION: &str = "duration";
    pub const LOG_LEVEL: &str = "log-level";
    pub const DISPATCH_GROUP: &str = "dispatch-group";
    pub const DISPATCH_PATH: &str = "dispatch-path";
    pub const MERGE_INDEX: &str = "merge-index";
    pub const MERGE_TOTAL: &str = "merge-total";
    pub const MODE: &str = "mode";
    pub const RESPECT_FAULT: &str = "respect-fault";
    pub const ASYNC: &str = "async";
    pub const NOTIFY: &str = "notify";
    pub const TARGET: &str = "target";
    pub const CONNECT_TIMEOUT: &str = "connect-timeout";
    pub const READ_TIMEOUT: &str = "read-timeout";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestrationMode {
    #[default]
    None,
    Composed,
    Chained,
}

impl OrchestrationMode {
    fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("composed") => OrchestrationMode::Composed,
            Some("chained") => OrchestrationMode::Chained,
            _ => OrchestrationMode::None,
        }
    }

    pub fn is_orchestrated(&self) -> bool {
        !matches!(self, OrchestrationMode::None)
    }
}

/// Value space of the object channel. An explicit variant type rather than
/// raw object identity, so chained modules agree on what can travel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    Text(String),
    Bytes(Vec<u8>),
    Structured(Value),
    Flag(bool),
}

type ChannelMap = HashMap<String, ChannelValue>;

/// Fault raised by a sub-request, carried on the context until the
/// orchestration loop clears it.
#[derive(Debug, Clone)]
pub struct FaultInfo {
    pub code: u32,
    pub message: String,
}

pub struct RequestContext {
    params: ParamMap,
    verb: Method,
    body: Option<String>,
    encoding_in: OnceCell<Encoding>,
    encoding_out: OnceCell<Encoding>,
    action: OnceCell<String>,
    payload: OnceCell<Option<Value>>,
    pub transaction: Option<String>,
    pub raw_output: bool,
    pub wants_duration: bool,
    /// Level at which this request's dispatch summary is logged.
    pub log_level: Level,
    started: Instant,
    channel_in: Arc<Mutex<ChannelMap>>,
    channel_out: Arc<Mutex<ChannelMap>>,
    fault: Option<FaultInfo>,
    pub chains_forward: bool,
    pub is_last: bool,
    pub mode: OrchestrationMode,
    /// When set, the dispatcher stamps the orchestration-fault marker onto
    /// the response it frames (used for the final step of a chain).
    pub orchestration_marker: bool,
}

impl RequestContext {
    pub fn new(params: ParamMap, verb: Method, body: Option<String>) -> Self {
        let transaction = first(&params, param::TRANSACTION).map(str::to_string);
        let raw_output = flag(&params, param::RAW_RESPONSE);
        let wants_duration = flag(&params, param::DURATION);
        let log_level = first(&params, param::LOG_LEVEL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::Debug);
        let mode = OrchestrationMode::from_param(first(&params, param::MODE));

        Self {
            params,
            verb,
            body,
            encoding_in: OnceCell::new(),
            encoding_out: OnceCell::new(),
            action: OnceCell::new(),
            payload: OnceCell::new(),
            transaction,
            raw_output,
            wants_duration,
            log_level,
            started: Instant::now(),
            channel_in: Arc::new(Mutex::new(ChannelMap::new())),
            channel_out: Arc::new(Mutex::new(ChannelMap::new())),
            fault: None,
            chains_forward: false,
            is_last: true,
            mode,
            orchestration_marker: false,
        }
    }

    /// Build a context for an already-framed message, e.g. one arriving
    /// through the broker's consumer entry point.
    pub fn from_message(message: &WireMessage, verb: Method) -> Self {
        let mut ctx = Self::new(message.parameters.clone(), verb, None);
        if let Some(action) = &message.action {
            ctx.set_action(action.clone());
        }
        if ctx.transaction.is_none() {
            ctx.transaction = message.transaction.clone();
        }
        if let Some(payload) = &message.payload {
            ctx.set_payload(Some(payload.clone()));
        }
        ctx
    }

    // --- parameters ---

    pub fn param(&self, name: &str) -> Option<&str> {
        first(&self.params, name)
    }

    pub fn param_flag(&self, name: &str) -> bool {
        flag(&self.params, name)
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    /// Replace a parameter. Flags derived at construction are unaffected;
    /// lazily-read parameters (dispatch selectors, merge window) see the
    /// new value.
    pub fn set_param(&mut self, name: &str, value: String) {
        self.params.insert(name.to_string(), vec![value]);
    }

    // --- lazy negotiated state ---

    /// Input encoding: explicit parameter, else the default.
    pub fn input_encoding(&self) -> Encoding {
        *self.encoding_in.get_or_init(|| {
            self.param(param::ENCODING_IN)
                .and_then(Encoding::from_name)
                .unwrap_or_default()
        })
    }

    /// Output encoding: explicit parameter, else mirrors the input.
    pub fn output_encoding(&self) -> Encoding {
        *self.encoding_out.get_or_init(|| {
            self.param(param::ENCODING_OUT)
                .and_then(Encoding::from_name)
                .unwrap_or_else(|| self.input_encoding())
        })
    }

    /// Action: explicit parameter, else the underlying transport verb.
    pub fn action(&self) -> &str {
        self.action.get_or_init(|| {
            self.param(param::ACTION)
                .map(str::to_string)
                .unwrap_or_else(|| self.verb.to_string())
        })
    }

    pub fn set_action(&mut self, action: String) {
        self.action = OnceCell::new();
        let _ = self.action.set(action);
    }

    /// Payload object, parsed once from the `data` parameter or the request
    /// body. Absence is a valid state, not an error.
    pub fn payload(&self) -> ServiceResult<Option<&Value>> {
        let parsed = self.payload.get_or_try_init(|| {
            let text = self
                .param(param::DATA)
                .or(self.body.as_deref())
                .map(str::trim)
                .filter(|t| !t.is_empty());
            match text {
                None => Ok(None),
                Some(text) => codec::decode(self.input_encoding(), text).map(Some),
            }
        })?;
        Ok(parsed.as_ref())
    }

    pub fn set_payload(&mut self, payload: Option<Value>) {
        self.payload = OnceCell::new();
        let _ = self.payload.set(payload);
    }

    pub fn verb(&self) -> &Method {
        &self.verb
    }

    // --- duration tracking ---

    pub fn duration_since(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn duration_millis(&self) -> u64 {
        self.duration_since().as_millis() as u64
    }

    pub fn reset_duration(&mut self) {
        self.started = Instant::now();
    }

    // --- dispatch selection ---

    pub fn dispatch_group(&self) -> Option<&str> {
        self.param(param::DISPATCH_GROUP)
    }

    pub fn dispatch_path(&self) -> Option<&str> {
        self.param(param::DISPATCH_PATH)
    }

    pub fn merge_window(&self) -> Option<(usize, usize)> {
        let index = self.param(param::MERGE_INDEX)?.parse().ok()?;
        let total = self.param(param::MERGE_TOTAL)?.parse().ok()?;
        Some((index, total))
    }

    /// Whether sub-request faults stop orchestration early. Defaults on.
    pub fn respect_fault(&self) -> bool {
        self.param(param::RESPECT_FAULT)
            .map(truthy)
            .unwrap_or(true)
    }

    pub fn is_async(&self) -> bool {
        self.param_flag(param::ASYNC)
    }

    pub fn wants_notify(&self) -> bool {
        self.param(param::NOTIFY).map(truthy).unwrap_or(true)
    }

    // --- fault state ---

    pub fn raise_fault(&mut self, code: u32, message: impl Into<String>) {
        // The first fault wins; later ones are still visible per fragment.
        if self.fault.is_none() {
            self.fault = Some(FaultInfo {
                code,
                message: message.into(),
            });
        }
    }

    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    pub fn fault(&self) -> Option<&FaultInfo> {
        self.fault.as_ref()
    }

    pub fn has_fault(&self) -> bool {
        self.fault.is_some()
    }

    // --- object channel ---

    /// Read a value the previous orchestration step stored.
    pub fn channel_get(&self, key: &str) -> Option<ChannelValue> {
        lock(&self.channel_in).get(key).cloned()
    }

    /// Store a value for the next orchestration step.
    pub fn channel_put(&self, key: impl Into<String>, value: ChannelValue) {
        lock(&self.channel_out).insert(key.into(), value);
    }

    pub fn channel_keys(&self) -> Vec<String> {
        lock(&self.channel_in).keys().cloned().collect()
    }

    /// Copy every incoming entry to the outgoing side, making the previous
    /// step's values visible beyond the next step.
    pub fn channel_forward_all(&self) {
        let entries: Vec<(String, ChannelValue)> = lock(&self.channel_in)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut out = lock(&self.channel_out);
        for (k, v) in entries {
            out.insert(k, v);
        }
    }

    /// Share another context's channel references (composed sub-requests
    /// all see the parent's single map).
    pub fn adopt_channels(&mut self, other: &RequestContext) {
        self.channel_in = Arc::clone(&other.channel_in);
        self.channel_out = Arc::clone(&other.channel_out);
    }

    /// Collapse the channel to one shared map for both directions.
    pub fn share_channel(&mut self) {
        self.channel_out = Arc::clone(&self.channel_in);
    }

    /// Advance the channel one step: what the previous step wrote becomes
    /// the next step's input, and a fresh outgoing map is installed.
    pub fn rotate_channels(&mut self) {
        self.channel_in = std::mem::replace(
            &mut self.channel_out,
            Arc::new(Mutex::new(ChannelMap::new())),
        );
    }
}

fn first<'a>(params: &'a ParamMap, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

fn flag(params: &ParamMap, name: &str) -> bool {
    first(params, name).map(truthy).unwrap_or(false)
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> ParamMap {
        let mut map = ParamMap::new();
        for (k, v) in entries {
            map.entry(k.to_string())
                .or_insert_with(Vec::new)
                .push(v.to_string());
        }
        map
    }

    #[test]
    fn encodings_default_and_mirror() {
        let ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        assert_eq!(ctx.input_encoding(), Encoding::Json);
        assert_eq!(ctx.output_encoding(), Encoding::Json);

        let ctx = RequestContext::new(
            params(&[("encoding-in", "xml")]),
            Method::POST,
            None,
        );
        assert_eq!(ctx.input_encoding(), Encoding::Xml);
        assert_eq!(ctx.output_encoding(), Encoding::Xml);

        let ctx = RequestContext::new(
            params(&[("encoding-in", "xml"), ("encoding-out", "json")]),
            Method::POST,
            None,
        );
        assert_eq!(ctx.output_encoding(), Encoding::Json);
    }

    #[test]
    fn action_falls_back_to_transport_verb() {
        let ctx = RequestContext::new(ParamMap::new(), Method::PUT, None);
        assert_eq!(ctx.action(), "PUT");

        let ctx = RequestContext::new(params(&[("action", "charge")]), Method::PUT, None);
        assert_eq!(ctx.action(), "charge");
    }

    #[test]
    fn payload_parses_once_and_absence_is_valid() {
        let ctx = RequestContext::new(
            ParamMap::new(),
            Method::POST,
            Some("{\"k\":\"v\"}".to_string()),
        );
        assert_eq!(
            ctx.payload().unwrap(),
            Some(&serde_json::json!({"k": "v"}))
        );

        let ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        assert!(ctx.payload().unwrap().is_none());

        let ctx = RequestContext::new(
            ParamMap::new(),
            Method::POST,
            Some("not json".to_string()),
        );
        assert!(ctx.payload().is_err());
    }

    #[test]
    fn data_parameter_takes_precedence_over_body() {
        let ctx = RequestContext::new(
            params(&[("data", "{\"from\":\"param\"}")]),
            Method::POST,
            Some("{\"from\":\"body\"}".to_string()),
        );
        assert_eq!(
            ctx.payload().unwrap(),
            Some(&serde_json::json!({"from": "param"}))
        );
    }

    #[test]
    fn fault_persists_until_cleared() {
        let mut ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        ctx.raise_fault(7, "first");
        ctx.raise_fault(1, "second");
        assert_eq!(ctx.fault().unwrap().message, "first");
        ctx.clear_fault();
        assert!(!ctx.has_fault());
    }

    #[test]
    fn channel_rotation_isolates_steps() {
        let mut ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        ctx.channel_put("step1", ChannelValue::Text("a".to_string()));
        ctx.rotate_channels();
        assert!(ctx.channel_get("step1").is_some());
        ctx.channel_put("step2", ChannelValue::Flag(true));
        ctx.rotate_channels();
        // step1's entry is gone unless it was forwarded
        assert!(ctx.channel_get("step1").is_none());
        assert!(ctx.channel_get("step2").is_some());
    }

    #[test]
    fn mode_and_window_parse_from_params() {
        let ctx = RequestContext::new(
            params(&[
                ("mode", "composed"),
                ("merge-index", "1"),
                ("merge-total", "3"),
                ("respect-fault", "false"),
            ]),
            Method::POST,
            None,
        );
        assert_eq!(ctx.mode, OrchestrationMode::Composed);
        assert_eq!(ctx.merge_window(), Some((1, 3)));
        assert!(!ctx.respect_fault());
    }
}
