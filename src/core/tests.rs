//! Tests for the core runtime
//!
//! Cross-component tests: registry generations and pattern dispatch,
//! composed and chained orchestration, the merge window protocol, and
//! broker failover.

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use http::Method;
    use serde_json::json;

    use crate::{
        auth::AllowAll,
        broker::{Broker, MessageProducer, Target, TargetProducer, TargetTable},
        core::{
            error::{code, ServiceError, ServiceResult},
            module::{host_factory, ActionHandler, ActionOutcome, DispatchPattern, Module},
            ChannelValue, Dispatcher, Registry, RequestContext,
        },
        orchestration::{
            notify::testing::RecordingNotifier, FaultPolicy, Notifier, Orchestrator,
        },
        wire::{Encoding, ParamMap, WireMessage},
    };

    fn params(entries: &[(&str, &str)]) -> ParamMap {
        let mut map = ParamMap::new();
        for (k, v) in entries {
            map.entry(k.to_string())
                .or_insert_with(Vec::new)
                .push(v.to_string());
        }
        map
    }

    fn context(entries: &[(&str, &str)]) -> RequestContext {
        RequestContext::new(params(entries), Method::POST, None)
    }

    /// Handler that reports the channel keys it can see and optionally
    /// writes one of its own.
    struct ChannelProbe {
        write_key: Option<&'static str>,
    }

    #[async_trait]
    impl ActionHandler for ChannelProbe {
        async fn handle(
            &self,
            ctx: &mut RequestContext,
            _request: &WireMessage,
        ) -> ServiceResult<ActionOutcome> {
            let mut seen = ctx.channel_keys();
            seen.sort();
            if let Some(key) = self.write_key {
                ctx.channel_put(key, ChannelValue::Flag(true));
            }
            Ok(ActionOutcome::structured(json!({ "seen": seen })))
        }
    }

    fn probe_module(name: &str, write_key: Option<&'static str>) -> Arc<Module> {
        let mut actions: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
        actions.insert("run".to_string(), Arc::new(ChannelProbe { write_key }));
        Arc::new(Module::new(name, actions))
    }

    fn echo_module(name: &str, pattern: Option<&str>) -> Arc<Module> {
        let echo = host_factory("echo").unwrap()(serde_yaml::Value::Null).unwrap();
        let mut actions: HashMap<String, Arc<dyn ActionHandler>> = HashMap::new();
        actions.insert("run".to_string(), echo);
        let mut module = Module::new(name, actions);
        if let Some(pattern) = pattern {
            module = module.with_pattern(DispatchPattern::parse(pattern).unwrap());
        }
        Arc::new(module)
    }

    async fn runtime_with(modules: Vec<Arc<Module>>) -> (Arc<Registry>, Arc<Orchestrator>) {
        runtime_with_policy(modules, FaultPolicy::default()).await
    }

    async fn runtime_with_policy(
        modules: Vec<Arc<Module>>,
        policy: FaultPolicy,
    ) -> (Arc<Registry>, Arc<Orchestrator>) {
        let registry = Arc::new(Registry::new());
        registry.install(modules).await;
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        let orchestrator = Arc::new(Orchestrator::new(
            dispatcher,
            Arc::new(RecordingNotifier::new()),
            policy,
        ));
        (registry, orchestrator)
    }

    // --- registry and pattern dispatch ---

    #[tokio::test]
    async fn pattern_dispatch_scenario() {
        let registry = Arc::new(Registry::new());
        registry
            .install(vec![echo_module("echo", Some("g|^echo.*|10"))])
            .await;

        let ctx = context(&[("dispatch-path", "echoX")]);
        let resolved = registry.get_by_pattern("g", &ctx).unwrap();
        assert_eq!(resolved.name, "echo");

        let ctx = context(&[("dispatch-path", "foo")]);
        assert!(registry.get_by_pattern("g", &ctx).is_none());
    }

    #[tokio::test]
    async fn pattern_dispatch_is_deterministic_by_priority() {
        let registry = Arc::new(Registry::new());
        registry
            .install(vec![
                echo_module("wide", Some("g|^e.*|10")),
                echo_module("narrow", Some("g|^echo.*|5")),
                // Same priority as "narrow": registration order decides.
                echo_module("tied", Some("g|^echo.*|5")),
            ])
            .await;

        let ctx = context(&[("dispatch-path", "echoX")]);
        for _ in 0..16 {
            let resolved = registry.get_by_pattern("g", &ctx).unwrap();
            assert_eq!(resolved.name, "narrow");
        }
    }

    #[tokio::test]
    async fn name_map_and_pattern_index_agree() {
        let registry = Arc::new(Registry::new());
        registry
            .install(vec![echo_module("echo", Some("g|^echo.*|10"))])
            .await;

        let ctx = context(&[("dispatch-path", "echoX")]);
        let by_pattern = registry.get_by_pattern("g", &ctx).unwrap();
        let by_name = registry.get_by_name("echo").unwrap();
        assert!(Arc::ptr_eq(&by_pattern, &by_name));

        // A failed load pass leaves both maps empty, never one of them.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bad.bundle.yaml"),
            "name: mismatched\nhandlers:\n  a:\n    binding: echo\n",
        )
        .unwrap();
        assert!(registry
            .reload(&[dir.path().to_path_buf()], false, true)
            .await
            .is_err());
        assert_eq!(registry.stats().module_count, 0);
        assert!(registry.get_by_name("echo").is_none());
        assert!(registry.get_by_pattern("g", &ctx).is_none());
    }

    #[tokio::test]
    async fn dispatcher_frames_name_and_pattern_requests() {
        let (_registry, orchestrator) =
            runtime_with(vec![echo_module("echo", Some("g|^echo.*|10"))]).await;
        let dispatcher = orchestrator.dispatcher();

        // name-based
        let mut ctx = context(&[("action", "run")]);
        let request = WireMessage::request("echo");
        let mut buf: Vec<u8> = Vec::new();
        dispatcher.dispatch(&mut ctx, &request, &mut buf).await.unwrap();
        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.error_code, code::OK);
        assert_eq!(response.service, "echo");

        // pattern-based: no service name, resolved through the group index
        let mut ctx = context(&[
            ("action", "run"),
            ("dispatch-group", "g"),
            ("dispatch-path", "echoX"),
        ]);
        let request = WireMessage::request("");
        let mut buf: Vec<u8> = Vec::new();
        dispatcher.dispatch(&mut ctx, &request, &mut buf).await.unwrap();
        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.error_code, code::OK);
        assert_eq!(response.service, "echo");

        // miss: service not found, recorded as a fault
        let mut ctx = context(&[("action", "run")]);
        let request = WireMessage::request("foo");
        let mut buf: Vec<u8> = Vec::new();
        dispatcher.dispatch(&mut ctx, &request, &mut buf).await.unwrap();
        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.error_code, code::NOT_FOUND);
        assert!(ctx.has_fault());
    }

    // --- composed orchestration ---

    fn batch_payload() -> serde_json::Value {
        json!([
            {"service": "missing", "action": "run"},
            {"service": "echo", "action": "run"}
        ])
    }

    #[tokio::test]
    async fn composed_batch_reports_fault_and_keeps_going() {
        let (_registry, orchestrator) = runtime_with(vec![echo_module("echo", None)]).await;

        let mut ctx = context(&[("mode", "composed"), ("respect-fault", "false")]);
        ctx.set_payload(Some(batch_payload()));

        let mut buf: Vec<u8> = Vec::new();
        orchestrator
            .execute(&mut ctx, "batch", &mut buf)
            .await
            .unwrap();

        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.fault, Some(true));
        let fragments = match response.payload.unwrap() {
            serde_json::Value::Array(fragments) => fragments,
            other => panic!("expected fragment array, got {other}"),
        };
        assert_eq!(fragments.len(), 2);
        let first = WireMessage::from_structured(&fragments[0]).unwrap();
        let second = WireMessage::from_structured(&fragments[1]).unwrap();
        assert_ne!(first.error_code, 0);
        assert_eq!(second.error_code, 0);
    }

    #[tokio::test]
    async fn composed_abort_policy_stops_after_first_fault() {
        let (_registry, orchestrator) = runtime_with_policy(
            vec![echo_module("echo", None)],
            FaultPolicy {
                abort_composed_on_fault: true,
            },
        )
        .await;

        let mut ctx = context(&[("mode", "composed")]);
        ctx.set_payload(Some(batch_payload()));

        let mut buf: Vec<u8> = Vec::new();
        orchestrator
            .execute(&mut ctx, "batch", &mut buf)
            .await
            .unwrap();

        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.fault, Some(true));
        let fragments = match response.payload.unwrap() {
            serde_json::Value::Array(fragments) => fragments,
            other => panic!("expected fragment array, got {other}"),
        };
        assert_eq!(fragments.len(), 1);
    }

    #[tokio::test]
    async fn merge_window_fragments_concatenate_to_whole_batch() {
        let (_registry, orchestrator) = runtime_with(vec![echo_module("echo", None)]).await;

        let sub = |n: u32| json!({"service": "echo", "action": "run", "data": {"n": n}});

        // The whole batch in one response.
        let mut whole: Vec<u8> = Vec::new();
        let mut ctx = context(&[("mode", "composed")]);
        ctx.set_payload(Some(json!([sub(1), sub(2), sub(3)])));
        orchestrator
            .execute(&mut ctx, "batch", &mut whole)
            .await
            .unwrap();

        // The same batch split over three window fragments.
        let mut pieces: Vec<u8> = Vec::new();
        for index in 0..3usize {
            let mut ctx = context(&[
                ("mode", "composed"),
                ("merge-index", &index.to_string()),
                ("merge-total", "3"),
            ]);
            ctx.set_payload(Some(json!([sub(index as u32 + 1)])));
            let mut buf: Vec<u8> = Vec::new();
            orchestrator.execute(&mut ctx, "batch", &mut buf).await.unwrap();
            pieces.extend_from_slice(&buf);
        }

        assert_eq!(whole, pieces);
        // And the concatenation itself is a valid document.
        let (_, response) =
            WireMessage::from_text(std::str::from_utf8(&pieces).unwrap()).unwrap();
        assert_eq!(response.fault, Some(false));
    }

    // --- chained orchestration ---

    #[tokio::test]
    async fn chained_steps_see_only_their_predecessor_channel() {
        let (_registry, orchestrator) = runtime_with(vec![
            probe_module("s1", Some("step1")),
            probe_module("s2", Some("step2")),
            probe_module("s3", None),
        ])
        .await;

        let mut ctx = context(&[("mode", "chained")]);
        ctx.set_payload(Some(json!([
            {"service": "s1", "action": "run"},
            {"service": "s2", "action": "run"},
            {"service": "s3", "action": "run"}
        ])));

        let mut buf: Vec<u8> = Vec::new();
        orchestrator
            .execute(&mut ctx, "chain", &mut buf)
            .await
            .unwrap();

        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.error_code, code::OK);
        // Step 3 sees exactly what step 2 wrote, not step 1's entry.
        assert_eq!(response.payload.unwrap(), json!({"seen": ["step2"]}));
        assert_eq!(response.fault, Some(false));
    }

    #[tokio::test]
    async fn chained_payloads_flow_between_steps() {
        let (_registry, orchestrator) = runtime_with(vec![echo_module("echo", None)]).await;

        let mut ctx = context(&[("mode", "chained")]);
        ctx.set_payload(Some(json!([
            {"service": "echo", "action": "run", "data": {"origin": "step0"}},
            {"service": "echo", "action": "run"}
        ])));

        let mut buf: Vec<u8> = Vec::new();
        orchestrator
            .execute(&mut ctx, "chain", &mut buf)
            .await
            .unwrap();

        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        // The second step consumed and returned the first step's output.
        assert_eq!(response.payload.unwrap(), json!({"origin": "step0"}));
    }

    #[tokio::test]
    async fn chained_fault_stops_the_chain() {
        let (_registry, orchestrator) = runtime_with(vec![echo_module("echo", None)]).await;

        let mut ctx = context(&[("mode", "chained")]);
        ctx.set_payload(Some(json!([
            {"service": "missing", "action": "run"},
            {"service": "echo", "action": "run"}
        ])));

        let mut buf: Vec<u8> = Vec::new();
        orchestrator
            .execute(&mut ctx, "chain", &mut buf)
            .await
            .unwrap();

        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.error_code, code::NOT_FOUND);
        assert_eq!(response.fault, Some(true));
    }

    // --- async mode ---

    #[tokio::test]
    async fn async_mode_answers_immediately_and_notifies() {
        let registry = Arc::new(Registry::new());
        registry.install(vec![echo_module("echo", None)]).await;
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = Arc::new(Orchestrator::new(
            dispatcher,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            FaultPolicy::default(),
        ));

        let mut ctx = context(&[
            ("mode", "composed"),
            ("async", "true"),
            ("transaction-data", "tx-42"),
        ]);
        ctx.set_payload(Some(json!([{"service": "echo", "action": "run"}])));

        let mut buf: Vec<u8> = Vec::new();
        orchestrator
            .execute(&mut ctx, "batch", &mut buf)
            .await
            .unwrap();

        // The caller gets an immediate empty success response.
        let (_, response) = WireMessage::from_text(std::str::from_utf8(&buf).unwrap()).unwrap();
        assert_eq!(response.error_code, code::OK);
        assert!(response.payload.is_none());
        assert_eq!(response.transaction.as_deref(), Some("tx-42"));

        // The outcome arrives out of band.
        let mut waited = 0;
        loop {
            if !notifier.messages.lock().unwrap().is_empty() {
                break;
            }
            waited += 1;
            assert!(waited < 100, "no notification arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let messages = notifier.messages.lock().unwrap();
        assert!(messages[0].1.contains("tx-42"));
        assert!(messages[0].1.contains("completed"));
    }

    // --- broker failover ---

    struct StubProducer {
        response: WireMessage,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageProducer for StubProducer {
        async fn produce(
            &self,
            _request: &WireMessage,
            _encoding: Encoding,
            _read_timeout: Option<Duration>,
        ) -> ServiceResult<WireMessage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn stub_target(response: WireMessage, calls: Arc<AtomicUsize>) -> Target {
        Target {
            label: "stub".to_string(),
            auth_required: false,
            read_timeout: None,
            producer: TargetProducer::Structured(Arc::new(StubProducer { response, calls })),
        }
    }

    fn not_found_response() -> WireMessage {
        let mut message = WireMessage::request("remote");
        message.error_code = code::NOT_FOUND;
        message.error_message = Some("no such service".to_string());
        message
    }

    fn ok_response(marker: &str) -> WireMessage {
        WireMessage::request("remote").with_payload(json!({"from": marker}))
    }

    #[tokio::test]
    async fn failover_stops_at_first_accepted_target() {
        let (_registry, orchestrator) = runtime_with(vec![]).await;

        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let c = Arc::new(AtomicUsize::new(0));
        let d = Arc::new(AtomicUsize::new(0));
        let mut targets = HashMap::new();
        targets.insert(
            "billing".to_string(),
            vec![
                stub_target(not_found_response(), Arc::clone(&a)),
                stub_target(not_found_response(), Arc::clone(&b)),
                stub_target(ok_response("c"), Arc::clone(&c)),
                stub_target(ok_response("d"), Arc::clone(&d)),
            ],
        );
        let broker = Broker::new(
            orchestrator,
            TargetTable::with_targets(targets),
            Arc::new(AllowAll),
        );

        let response = broker
            .consume(WireMessage::request("billing"), Method::POST)
            .await
            .unwrap();
        assert_eq!(response.error_code, code::OK);
        assert_eq!(response.payload.unwrap(), json!({"from": "c"}));
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 1);
        assert_eq!(d.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn last_target_result_is_returned_unconditionally() {
        let (_registry, orchestrator) = runtime_with(vec![]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut targets = HashMap::new();
        targets.insert(
            "billing".to_string(),
            vec![
                stub_target(not_found_response(), Arc::new(AtomicUsize::new(0))),
                stub_target(not_found_response(), Arc::clone(&calls)),
            ],
        );
        let broker = Broker::new(
            orchestrator,
            TargetTable::with_targets(targets),
            Arc::new(AllowAll),
        );

        let response = broker
            .consume(WireMessage::request("billing"), Method::POST)
            .await
            .unwrap();
        assert_eq!(response.error_code, code::NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_failure_is_final_and_skips_the_producer() {
        struct Deny;

        #[async_trait]
        impl crate::auth::Authenticator for Deny {
            async fn authenticate(
                &self,
                _attributes: &ParamMap,
                _payload: &[u8],
            ) -> ServiceResult<crate::auth::Principal> {
                Err(ServiceError::Unauthorized("denied".to_string()))
            }
        }

        let (_registry, orchestrator) = runtime_with(vec![]).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let fallback = Arc::new(AtomicUsize::new(0));
        let mut targets = HashMap::new();
        targets.insert(
            "billing".to_string(),
            vec![
                Target {
                    auth_required: true,
                    ..stub_target(ok_response("a"), Arc::clone(&calls))
                },
                stub_target(ok_response("b"), Arc::clone(&fallback)),
            ],
        );
        let broker = Broker::new(
            orchestrator,
            TargetTable::with_targets(targets),
            Arc::new(Deny),
        );

        let mut ctx = context(&[]);
        let request = WireMessage::request("billing");
        let mut buf: Vec<u8> = Vec::new();
        let err = broker.invoke(&mut ctx, &request, &mut buf).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(fallback.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_target_short_circuits_to_dispatch() {
        let (_registry, orchestrator) = runtime_with(vec![echo_module("echo", None)]).await;

        let mut targets = HashMap::new();
        targets.insert("echo".to_string(), vec![Target::local()]);
        let broker = Broker::new(
            orchestrator,
            TargetTable::with_targets(targets),
            Arc::new(AllowAll),
        );

        let request = WireMessage::request("echo")
            .with_action("run")
            .with_payload(json!({"k": "v"}));
        let mut message = request.clone();
        message
            .parameters
            .insert("action".to_string(), vec!["run".to_string()]);
        let response = broker.consume(message, Method::POST).await.unwrap();
        assert_eq!(response.error_code, code::OK);
    }
}
