//! Service modules and action handlers
//!
//! A module is a named, independently loaded unit of request-handling
//! logic: a set of named action handlers, an optional dispatch pattern for
//! pattern-based routing, and lifecycle hooks for health and teardown.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::wire::ParamMap;

use super::{
    context::{ChannelValue, RequestContext},
    error::{ServiceError, ServiceResult},
};

/// Dispatch-pattern descriptor `group|pattern|priority`.
///
/// The pattern is a regular expression evaluated against the request's
/// dispatch path; lower priority numbers are tried first.
#[derive(Debug, Clone)]
pub struct DispatchPattern {
    pub group: String,
    pub regex: Regex,
    pub priority: u32,
}

impl DispatchPattern {
    pub fn parse(descriptor: &str) -> ServiceResult<Self> {
        // The pattern itself may contain '|' (regex alternation): the group
        // ends at the first separator, the priority starts at the last.
        let parsed = descriptor
            .split_once('|')
            .and_then(|(group, rest)| rest.rsplit_once('|').map(|(p, prio)| (group, p, prio)));
        let Some((group, pattern, priority)) = parsed else {
            return Err(ServiceError::Load(format!(
                "dispatch pattern '{descriptor}' must have the form group|pattern|priority"
            )));
        };
        if group.is_empty() {
            return Err(ServiceError::Load(format!(
                "dispatch pattern '{descriptor}' has an empty group"
            )));
        }
        let regex = Regex::new(pattern)
            .map_err(|e| ServiceError::Load(format!("invalid dispatch pattern regex: {e}")))?;
        let priority = priority
            .trim()
            .parse()
            .map_err(|_| ServiceError::Load(format!("invalid dispatch priority '{priority}'")))?;
        Ok(Self {
            group: group.to_string(),
            regex,
            priority,
        })
    }
}

/// Result of one action invocation.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// Structured payload, framed into `data` by the dispatcher.
    pub payload: Option<Value>,
    /// Pre-encoded bytes, streamed without envelope framing.
    pub raw: Option<Vec<u8>>,
    /// Response-only parameters.
    pub parameters: ParamMap,
}

impl ActionOutcome {
    pub fn structured(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// A named sub-handler of a module.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        request: &crate::wire::WireMessage,
    ) -> ServiceResult<ActionOutcome>;
}

/// Optional module lifecycle hooks. Health is refreshed on demand only;
/// teardown runs on unload and reload.
#[async_trait]
pub trait ModuleHooks: Send + Sync {
    async fn health(&self) -> bool {
        true
    }

    async fn destroy(&self) -> ServiceResult<()> {
        Ok(())
    }
}

pub struct Module {
    pub name: String,
    pub pattern: Option<DispatchPattern>,
    pub active: bool,
    healthy: AtomicBool,
    actions: HashMap<String, Arc<dyn ActionHandler>>,
    hooks: Option<Arc<dyn ModuleHooks>>,
    pub metadata: HashMap<String, serde_yaml::Value>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("active", &self.active)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Module {
    pub fn new(name: impl Into<String>, actions: HashMap<String, Arc<dyn ActionHandler>>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            active: true,
            healthy: AtomicBool::new(true),
            actions,
            hooks: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_pattern(mut self, pattern: DispatchPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ModuleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_yaml::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn action(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(name).cloned()
    }

    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    /// Pattern-match predicate evaluated by the dispatcher against the
    /// request's dispatch path.
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        match (&self.pattern, ctx.dispatch_path()) {
            (Some(pattern), Some(path)) => pattern.regex.is_match(path),
            _ => false,
        }
    }

    /// Last measured health. Never refreshed implicitly.
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn refresh_health(&self) -> bool {
        let healthy = match &self.hooks {
            Some(hooks) => hooks.health().await,
            None => true,
        };
        self.healthy.store(healthy, Ordering::Relaxed);
        healthy
    }

    /// Best-effort teardown; failures are logged by the registry.
    pub async fn destroy(&self) -> ServiceResult<()> {
        match &self.hooks {
            Some(hooks) => hooks.destroy().await,
            None => Ok(()),
        }
    }
}

/// Factory signature for built-in handlers; receives the manifest-supplied
/// handler configuration.
pub type HandlerCreateFn = fn(serde_yaml::Value) -> ServiceResult<Arc<dyn ActionHandler>>;

/// Host registry mapping handler binding names to factory functions.
/// Bundles resolve their manifest bindings against a scope seeded from
/// this registry.
static HANDLER_BUILDER_REGISTRY: Lazy<HashMap<&'static str, HandlerCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, HandlerCreateFn)> = vec![
        ("echo", create_echo_handler),
        ("static", create_static_handler),
        ("relay", create_relay_handler),
    ];
    arr.into_iter().collect()
});

/// Look up a built-in handler factory by binding name.
pub fn host_factory(binding: &str) -> Option<HandlerCreateFn> {
    HANDLER_BUILDER_REGISTRY.get(binding).copied()
}

pub fn host_factories() -> impl Iterator<Item = (&'static str, HandlerCreateFn)> {
    HANDLER_BUILDER_REGISTRY.iter().map(|(k, v)| (*k, *v))
}

// --- built-in handlers ---

/// Creates an Echo handler: returns the request payload unchanged and
/// mirrors the request parameters into the response parameters.
fn create_echo_handler(_cfg: serde_yaml::Value) -> ServiceResult<Arc<dyn ActionHandler>> {
    Ok(Arc::new(EchoHandler))
}

struct EchoHandler;

#[async_trait]
impl ActionHandler for EchoHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        request: &crate::wire::WireMessage,
    ) -> ServiceResult<ActionOutcome> {
        let payload = match request.payload.clone() {
            Some(payload) => Some(payload),
            None => ctx.payload()?.cloned(),
        };
        Ok(ActionOutcome {
            payload,
            raw: None,
            parameters: request.parameters.clone(),
        })
    }
}

/// Creates a Static handler: always responds with the body configured in
/// the manifest.
fn create_static_handler(cfg: serde_yaml::Value) -> ServiceResult<Arc<dyn ActionHandler>> {
    #[derive(serde::Deserialize)]
    struct Config {
        body: Value,
    }
    let config: Config = serde_yaml::from_value(cfg)
        .map_err(|e| ServiceError::Load(format!("invalid static handler config: {e}")))?;
    Ok(Arc::new(StaticHandler { body: config.body }))
}

struct StaticHandler {
    body: Value,
}

#[async_trait]
impl ActionHandler for StaticHandler {
    async fn handle(
        &self,
        _ctx: &mut RequestContext,
        _request: &crate::wire::WireMessage,
    ) -> ServiceResult<ActionOutcome> {
        Ok(ActionOutcome::structured(self.body.clone()))
    }
}

/// Creates a Relay handler: forwards every incoming object-channel entry
/// to the next step, stores its own payload under `relayed`, and returns
/// the payload unchanged.
fn create_relay_handler(_cfg: serde_yaml::Value) -> ServiceResult<Arc<dyn ActionHandler>> {
    Ok(Arc::new(RelayHandler))
}

struct RelayHandler;

#[async_trait]
impl ActionHandler for RelayHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        request: &crate::wire::WireMessage,
    ) -> ServiceResult<ActionOutcome> {
        ctx.channel_forward_all();
        if let Some(payload) = &request.payload {
            ctx.channel_put("relayed", ChannelValue::Structured(payload.clone()));
        }
        Ok(ActionOutcome {
            payload: request.payload.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn dispatch_pattern_parses_and_rejects() {
        let pattern = DispatchPattern::parse("g|^echo.*|10").unwrap();
        assert_eq!(pattern.group, "g");
        assert_eq!(pattern.priority, 10);
        assert!(pattern.regex.is_match("echoX"));
        assert!(!pattern.regex.is_match("foo"));

        assert!(DispatchPattern::parse("missing-parts").is_err());
        assert!(DispatchPattern::parse("|^x|1").is_err());
        assert!(DispatchPattern::parse("g|[bad|1").is_err());
        assert!(DispatchPattern::parse("g|^x|high").is_err());
    }

    #[test]
    fn module_matches_on_dispatch_path() {
        let module = Module::new("echo", HashMap::new())
            .with_pattern(DispatchPattern::parse("g|^echo.*|10").unwrap());

        let mut params = ParamMap::new();
        params.insert("dispatch-path".to_string(), vec!["echoX".to_string()]);
        let ctx = RequestContext::new(params, Method::POST, None);
        assert!(module.matches(&ctx));

        let ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        assert!(!module.matches(&ctx));
    }

    #[tokio::test]
    async fn echo_handler_returns_payload_and_parameters() {
        let handler = create_echo_handler(serde_yaml::Value::Null).unwrap();
        let mut ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        let mut request = crate::wire::WireMessage::request("echo");
        request.payload = Some(serde_json::json!({"k": "v"}));
        request
            .parameters
            .insert("p".to_string(), vec!["1".to_string()]);

        let outcome = handler.handle(&mut ctx, &request).await.unwrap();
        assert_eq!(outcome.payload, Some(serde_json::json!({"k": "v"})));
        assert_eq!(outcome.parameters.get("p").unwrap(), &vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn static_handler_serves_configured_body() {
        let cfg: serde_yaml::Value = serde_yaml::from_str("body:\n  greeting: hello\n").unwrap();
        let handler = host_factory("static").unwrap()(cfg).unwrap();
        let mut ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        let outcome = handler
            .handle(&mut ctx, &crate::wire::WireMessage::request("s"))
            .await
            .unwrap();
        assert_eq!(outcome.payload, Some(serde_json::json!({"greeting": "hello"})));

        assert!(host_factory("static").unwrap()(serde_yaml::Value::Null).is_err());
    }

    #[tokio::test]
    async fn relay_handler_forwards_incoming_channel_entries() {
        let handler = host_factory("relay").unwrap()(serde_yaml::Value::Null).unwrap();
        let mut ctx = RequestContext::new(ParamMap::new(), Method::POST, None);
        ctx.channel_put("earlier", ChannelValue::Text("kept".to_string()));
        ctx.rotate_channels();

        let request = crate::wire::WireMessage::request("r")
            .with_payload(serde_json::json!({"step": "2"}));
        let outcome = handler.handle(&mut ctx, &request).await.unwrap();
        assert_eq!(outcome.payload, Some(serde_json::json!({"step": "2"})));

        // Both the forwarded entry and the relayed payload survive rotation.
        ctx.rotate_channels();
        assert_eq!(
            ctx.channel_get("earlier"),
            Some(ChannelValue::Text("kept".to_string()))
        );
        assert!(matches!(
            ctx.channel_get("relayed"),
            Some(ChannelValue::Structured(_))
        ));
    }

    #[tokio::test]
    async fn health_is_refreshed_on_demand_only() {
        struct FlakyHooks;

        #[async_trait]
        impl ModuleHooks for FlakyHooks {
            async fn health(&self) -> bool {
                false
            }
        }

        let module = Module::new("m", HashMap::new()).with_hooks(Arc::new(FlakyHooks));
        assert!(module.healthy());
        assert!(!module.refresh_health().await);
        assert!(!module.healthy());
    }
}
