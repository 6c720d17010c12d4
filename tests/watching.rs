mod common;

use common::{calc_class, probes_called, MockHost, APP_LOADER};
use jvm_sandbox::config::CoreConfig;
use jvm_sandbox::event::{
    Event, EventKind, EventListener, EventType, EventTypes, ListenerError, ProcessControl,
};
use jvm_sandbox::host::{HostError, LoadedType};
use jvm_sandbox::jvm::class_file::ClassFile;
use jvm_sandbox::jvm::BinaryName;
use jvm_sandbox::matcher::{Matcher, PatternFilter};
use jvm_sandbox::pipeline::{PipelineSettings, RetransformPipeline};
use jvm_sandbox::spy::{Ret, SpyRegistry, Value};
use jvm_sandbox::structure::StructureFactory;
use jvm_sandbox::watcher::{Progress, WatchError};
use jvm_sandbox::{Sandbox, SandboxError};
use parking_lot::Mutex;
use std::sync::Arc;

const BEFORE_AND_EXITS: &[&str] = &["spyMethodOnBefore", "spyMethodOnReturn", "spyMethodOnThrows"];

fn calc_host() -> Arc<MockHost> {
    let host = MockHost::new();
    host.load(Some(APP_LOADER), calc_class());
    Arc::new(host)
}

fn sandbox(host: &Arc<MockHost>, registry: &Arc<SpyRegistry>) -> Sandbox {
    Sandbox::new(CoreConfig::default(), host.clone(), registry.clone()).unwrap()
}

fn calc_method(method: &str) -> Matcher {
    Matcher::filter(PatternFilter::new("demo.Calc", method))
}

type Seen = Arc<Mutex<Vec<EventType>>>;

/// Listener recording event types, answering `answer` to `BEFORE`
fn recording(seen: Seen, answer: ProcessControl) -> Arc<dyn EventListener> {
    Arc::new(move |event: &mut Event| -> Result<ProcessControl, ListenerError> {
        seen.lock().push(event.event_type());
        Ok(match event.kind {
            EventKind::Before { .. } => answer.clone(),
            _ => ProcessControl::Continue,
        })
    })
}

fn continuing() -> Arc<dyn EventListener> {
    recording(Seen::default(), ProcessControl::Continue)
}

/// Simulate woven `demo.Calc.sum` entering
fn enter_sum(registry: &SpyRegistry, watch_id: u32) -> Ret {
    let mut arguments = [Value::Null];
    registry.on_before(
        &mut arguments,
        "default",
        watch_id as i32,
        APP_LOADER,
        "demo.Calc",
        "sum",
        "([I)I",
        None,
    )
}

#[test]
fn watching_weaves_and_deleting_restores() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);

    let watch_id = sandbox
        .watch(calc_method("sum"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    assert_eq!(sandbox.watch_ids(), vec![watch_id]);
    assert_eq!(sandbox.affect(watch_id), Some((1, 1)));
    assert_eq!(host.transformer_count(), 1);

    let woven = host.current_bytes("demo.Calc").unwrap();
    assert_eq!(probes_called(&woven, "sum"), BEFORE_AND_EXITS);
    assert!(probes_called(&woven, "add").is_empty());

    // The woven class parses back, with the handler reporting exceptions last
    let class = ClassFile::from_bytes(&woven).unwrap();
    let sum = class
        .methods
        .iter()
        .find(|method| method.name(&class.constants).unwrap() == "sum")
        .unwrap();
    let code = sum.code(&class.constants).unwrap().unwrap();
    let last = code.exception_table.last().unwrap();
    assert_eq!(
        class.constants.class_name(last.catch_type).unwrap(),
        "java/lang/Throwable"
    );

    sandbox.delete(watch_id, None).unwrap();
    assert!(sandbox.watch_ids().is_empty());
    assert_eq!(sandbox.affect(watch_id), None);
    assert_eq!(host.transformer_count(), 0);
    assert_eq!(host.current_bytes("demo.Calc"), host.original_bytes("demo.Calc"));

    match sandbox.delete(watch_id, None) {
        Err(SandboxError::Watch(WatchError::UnknownWatch(id))) => assert_eq!(id, watch_id),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    sandbox.shutdown();
}

#[test]
fn watch_ids_start_at_one_thousand() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    let first = sandbox
        .watch(calc_method("sum"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    let second = sandbox
        .watch(calc_method("add"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    assert_eq!((first, second), (1000, 1001));
    sandbox.shutdown();
}

#[test]
fn probes_of_several_watches_stack() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);

    let first = sandbox
        .watch(calc_method("sum"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    let second = sandbox
        .watch(calc_method("*"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    let woven = host.current_bytes("demo.Calc").unwrap();
    assert_eq!(probes_called(&woven, "sum").len(), 2 * BEFORE_AND_EXITS.len());
    assert_eq!(probes_called(&woven, "add"), BEFORE_AND_EXITS);

    // Native methods are never woven
    assert!(probes_called(&woven, "hash").is_empty());

    sandbox.delete(first, None).unwrap();
    let woven = host.current_bytes("demo.Calc").unwrap();
    assert_eq!(probes_called(&woven, "sum"), BEFORE_AND_EXITS);

    sandbox.delete(second, None).unwrap();
    assert_eq!(host.current_bytes("demo.Calc"), host.original_bytes("demo.Calc"));
    sandbox.shutdown();
}

#[test]
fn listeners_can_return_early() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    let seen = Seen::default();
    let watch_id = sandbox
        .watch(
            calc_method("sum"),
            recording(seen.clone(), ProcessControl::return_immediately(Value::Int(100))),
            EventTypes::BEFORE | EventTypes::RETURN | EventTypes::IMMEDIATELY_RETURN,
            None,
        )
        .unwrap();

    let ret = enter_sum(&registry, watch_id);
    assert_eq!(ret.state(), Ret::STATE_RETURN);
    assert_eq!(ret, Ret::Return(Value::Int(100)));
    assert_eq!(
        *seen.lock(),
        vec![EventType::Before, EventType::ImmediatelyReturn]
    );

    // Once the watch is gone, the woven code carries on as usual
    sandbox.delete(watch_id, None).unwrap();
    assert_eq!(enter_sum(&registry, watch_id), Ret::None);
    sandbox.shutdown();
}

/// `sum` calls `add`: `add` is made to throw on return, and `sum` to return 100 on that throw
#[test]
fn early_exits_chain_across_methods() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);

    let boom = Value::throwable("java.lang.RuntimeException", "boom");
    let throwing = {
        let boom = boom.clone();
        move |event: &mut Event| -> Result<ProcessControl, ListenerError> {
            Ok(match event.kind {
                EventKind::Return { .. } => ProcessControl::throw_immediately(boom.clone()),
                _ => ProcessControl::Continue,
            })
        }
    };
    let recovering = |event: &mut Event| -> Result<ProcessControl, ListenerError> {
        Ok(match event.kind {
            EventKind::Throws { .. } => ProcessControl::return_immediately(Value::Int(100)),
            _ => ProcessControl::Continue,
        })
    };
    let on_add = sandbox
        .watch(calc_method("add"), Arc::new(throwing), EventTypes::RETURN, None)
        .unwrap();
    let on_sum = sandbox
        .watch(calc_method("sum"), Arc::new(recovering), EventTypes::THROWS, None)
        .unwrap();
    let (on_add, on_sum) = (on_add as i32, on_sum as i32);

    // What the woven code of `sum` and `add` does, probe by probe
    assert_eq!(enter_sum(&registry, on_sum as u32), Ret::None);
    let mut arguments = [Value::Int(1), Value::Int(2)];
    let entered = registry.on_before(
        &mut arguments,
        "default",
        on_add,
        APP_LOADER,
        "demo.Calc",
        "add",
        "(II)I",
        None,
    );
    assert_eq!(entered, Ret::None);
    let returned = registry.on_return(Value::Int(3), "default", on_add);
    assert_eq!(returned, Ret::Throws(boom.clone()));

    // The throw goes through the handler of `add`, then the one of `sum`. Once `add` has
    // returned its process stack is empty, so the process and its early throw flag are gone and
    // nothing is delivered for it.
    let rethrown = registry.on_throws(boom.clone(), "default", on_add);
    assert_eq!(rethrown, Ret::None);
    let recovered = registry.on_throws(boom, "default", on_sum);
    assert_eq!(recovered, Ret::Return(Value::Int(100)));
    sandbox.shutdown();
}

#[test]
fn listeners_can_change_arguments() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    let listener = |event: &mut Event| -> Result<ProcessControl, ListenerError> {
        if let EventKind::Before { arguments, .. } = &mut event.kind {
            arguments[0] = Value::Int(40);
        }
        Ok(ProcessControl::Continue)
    };
    let watch_id = sandbox
        .watch(calc_method("add"), Arc::new(listener), EventTypes::BEFORE, None)
        .unwrap();

    let mut arguments = [Value::Int(1), Value::Int(2)];
    let ret = registry.on_before(
        &mut arguments,
        "default",
        watch_id as i32,
        APP_LOADER,
        "demo.Calc",
        "add",
        "(II)I",
        None,
    );
    assert_eq!(ret, Ret::None);
    assert_eq!(arguments, [Value::Int(40), Value::Int(2)]);
    sandbox.shutdown();
}

#[test]
fn probes_fired_by_listeners_are_ignored() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    let seen = Seen::default();

    let inner_registry = registry.clone();
    let inner_seen = seen.clone();
    let inner_ret = Arc::new(Mutex::new(None));
    let inner_ret_slot = inner_ret.clone();
    let watch_id = Arc::new(Mutex::new(0u32));
    let listener_watch_id = watch_id.clone();
    let listener = move |event: &mut Event| -> Result<ProcessControl, ListenerError> {
        inner_seen.lock().push(event.event_type());
        // The listener calls instrumented code itself
        let ret = enter_sum(&inner_registry, *listener_watch_id.lock());
        *inner_ret_slot.lock() = Some(ret);
        Ok(ProcessControl::Continue)
    };

    let id = sandbox
        .watch(calc_method("sum"), Arc::new(listener), EventTypes::BEFORE, None)
        .unwrap();
    *watch_id.lock() = id;

    assert_eq!(enter_sum(&registry, id), Ret::None);
    assert_eq!(*seen.lock(), vec![EventType::Before]);
    assert_eq!(*inner_ret.lock(), Some(Ret::None));
    sandbox.shutdown();
}

#[test]
fn failing_listeners_follow_the_error_policy() {
    let failing = |_: &mut Event| -> Result<ProcessControl, ListenerError> {
        Err(ListenerError::from("listener broke"))
    };

    for (features, expected_state) in [
        (";namespace=default;", Ret::STATE_NONE),
        (
            ";namespace=default;listener.error.policy=propagate;",
            Ret::STATE_THROWS,
        ),
    ] {
        let host = calc_host();
        let registry = Arc::new(SpyRegistry::new());
        let sandbox = Sandbox::from_feature_string(features, host, registry.clone()).unwrap();
        let watch_id = sandbox
            .watch(calc_method("sum"), Arc::new(failing), EventTypes::BEFORE, None)
            .unwrap();
        assert_eq!(enter_sum(&registry, watch_id).state(), expected_state);
        sandbox.shutdown();
    }
}

#[test]
fn watching_deletes_afterwards() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);

    let result = sandbox
        .watching(
            calc_method("sum"),
            continuing(),
            EventTypes::BEFORE,
            None,
            || probes_called(&host.current_bytes("demo.Calc").unwrap(), "sum").len(),
        )
        .unwrap();
    assert_eq!(result, BEFORE_AND_EXITS.len());
    assert!(sandbox.watch_ids().is_empty());
    assert_eq!(host.current_bytes("demo.Calc"), host.original_bytes("demo.Calc"));
    sandbox.shutdown();
}

#[test]
fn watching_deletes_even_when_the_callback_panics() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);

    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sandbox.watching(
            calc_method("sum"),
            continuing(),
            EventTypes::BEFORE,
            None,
            || panic!("callback failed"),
        )
    }));
    assert!(panicked.is_err());
    assert!(sandbox.watch_ids().is_empty());
    assert_eq!(host.transformer_count(), 0);
    assert_eq!(host.current_bytes("demo.Calc"), host.original_bytes("demo.Calc"));
    sandbox.shutdown();
}

#[derive(Default)]
struct RecordedProgress {
    calls: Mutex<Vec<String>>,
}

impl Progress for RecordedProgress {
    fn begin(&self, total: usize) -> Result<(), ListenerError> {
        self.calls.lock().push(format!("begin {}", total));
        Ok(())
    }

    fn on_success(&self, loaded: &LoadedType, index: usize) -> Result<(), ListenerError> {
        self.calls
            .lock()
            .push(format!("success {} {}", loaded.name, index));
        Ok(())
    }

    fn on_failed(
        &self,
        loaded: &LoadedType,
        index: usize,
        _error: &HostError,
    ) -> Result<(), ListenerError> {
        self.calls
            .lock()
            .push(format!("failed {} {}", loaded.name, index));
        Ok(())
    }

    fn finish(&self, class_count: usize, method_count: usize) -> Result<(), ListenerError> {
        self.calls
            .lock()
            .push(format!("finish {} {}", class_count, method_count));
        Ok(())
    }
}

#[test]
fn progress_is_reported() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    let progress = Arc::new(RecordedProgress::default());

    sandbox
        .watch(
            calc_method("*"),
            continuing(),
            EventTypes::BEFORE,
            Some(progress.clone()),
        )
        .unwrap();
    assert_eq!(
        *progress.calls.lock(),
        vec!["begin 1", "success demo.Calc 0", "finish 1 3"]
    );
    sandbox.shutdown();
}

#[test]
fn loaders_without_the_bridge_are_left_alone() {
    let host = calc_host();
    host.hide_bridge_from(APP_LOADER);
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);

    let watch_id = sandbox
        .watch(calc_method("sum"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    assert_eq!(sandbox.affect(watch_id), Some((0, 0)));
    assert_eq!(host.current_bytes("demo.Calc"), host.original_bytes("demo.Calc"));
    sandbox.shutdown();
}

#[test]
fn shutting_down_deletes_everything() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    assert!(registry.is_installed("default"));

    sandbox
        .watch(calc_method("sum"), continuing(), EventTypes::BEFORE, None)
        .unwrap();
    sandbox.shutdown();

    assert!(!registry.is_installed("default"));
    assert!(sandbox.watch_ids().is_empty());
    assert_eq!(host.transformer_count(), 0);
    assert!(matches!(
        sandbox.watch(calc_method("sum"), continuing(), EventTypes::BEFORE, None),
        Err(SandboxError::Watch(WatchError::Pipeline(_)))
    ));
}

#[test]
fn matching_behaviors_go_through_the_guard() {
    let host = calc_host();
    let registry = Arc::new(SpyRegistry::new());
    let sandbox = sandbox(&host, &registry);
    let loaded = LoadedType::new("demo.Calc", Some(APP_LOADER));

    let everything = Matcher::filter(PatternFilter::new("demo.Calc", "*"));
    let codes = sandbox
        .find_matching_behaviors(&loaded, &everything)
        .unwrap()
        .signature_codes();
    assert_eq!(
        codes.into_iter().collect::<Vec<_>>(),
        vec!["demo.Calc#<init>()", "demo.Calc#add(int,int)", "demo.Calc#sum(int[])"]
    );

    let bridge = sandbox.bridge_classes().unwrap();
    assert_eq!(bridge[0].0, BinaryName::SPY);
    assert_eq!(bridge[1].0, BinaryName::SPY_RET);
    sandbox.shutdown();
}

#[test]
fn requests_for_the_same_type_are_coalesced() {
    let host = calc_host();
    let factory = StructureFactory::new(host.clone(), 16);
    let pipeline = RetransformPipeline::new(factory, PipelineSettings::default());

    // Everything is queued before the pipeline starts, so it all lands in one batch
    let completions: Vec<_> = (0..5)
        .map(|_| pipeline.submit(calc_method("sum"), None).unwrap())
        .collect();
    pipeline.start().unwrap();

    for completion in completions {
        let outcome = completion.wait().unwrap();
        assert_eq!(
            outcome.types,
            vec![LoadedType::new("demo.Calc", Some(APP_LOADER))]
        );
        assert!(outcome.failed.is_empty());
    }
    assert_eq!(host.retransform_calls(), 1);
    pipeline.shutdown();
}

#[test]
fn requests_without_identity_are_not_coalesced() {
    let host = calc_host();
    let factory = StructureFactory::new(host.clone(), 16);
    let pipeline = RetransformPipeline::new(factory, PipelineSettings::default());

    let wildcard = || Matcher::filter(PatternFilter::new("demo.*", "sum"));
    let first = pipeline.submit(wildcard(), None).unwrap();
    let second = pipeline.submit(wildcard(), None).unwrap();
    pipeline.start().unwrap();

    assert_eq!(first.wait().unwrap().types.len(), 1);
    assert_eq!(second.wait().unwrap().types.len(), 1);
    assert_eq!(host.retransform_calls(), 2);
    pipeline.shutdown();
}

#[test]
fn concurrent_requests_all_complete_through_a_full_queue() {
    let host = calc_host();
    let factory = StructureFactory::new(host.clone(), 16);
    let pipeline = RetransformPipeline::new(
        factory,
        PipelineSettings {
            queue_capacity: 4,
            flush_capacity: 2,
            workers: 2,
            batch_size: 3,
        },
    );
    pipeline.start().unwrap();

    // More submitters than queue slots, so some of them block until the coalescer catches up
    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let submitters: Vec<_> = (0..32)
            .map(|idx| {
                let pipeline = &pipeline;
                scope.spawn(move || {
                    let matcher = if idx % 2 == 0 {
                        calc_method("sum")
                    } else {
                        Matcher::filter(PatternFilter::new("demo.*", "add"))
                    };
                    pipeline.submit(matcher, None).unwrap().wait()
                })
            })
            .collect();
        submitters
            .into_iter()
            .map(|submitter| submitter.join().unwrap())
            .collect()
    });

    assert_eq!(outcomes.len(), 32);
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        assert_eq!(
            outcome.types,
            vec![LoadedType::new("demo.Calc", Some(APP_LOADER))]
        );
        assert!(outcome.failed.is_empty());
    }
    // Each wildcard request is handled on its own, identical ones may share a call
    let calls = host.retransform_calls();
    assert!((17..=32).contains(&calls), "{} retransform calls", calls);
    pipeline.shutdown();
}

#[test]
fn requests_left_at_shutdown_are_refused() {
    let host = calc_host();
    let factory = StructureFactory::new(host.clone(), 16);
    let pipeline = RetransformPipeline::new(factory, PipelineSettings::default());
    let queued = pipeline.submit(calc_method("sum"), None).unwrap();
    pipeline.shutdown();

    assert!(queued.wait().is_err());
    assert!(pipeline.submit(calc_method("sum"), None).is_err());
    assert_eq!(host.retransform_calls(), 0);
}
