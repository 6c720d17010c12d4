mod common;

use common::{calc_class, probes_called};
use jvm_sandbox::config::CoreConfig;
use jvm_sandbox::event::{Event, EventTypes, ListenerError, ProcessControl};
use jvm_sandbox::host::{ClassPathHost, HostRuntime, LoadedType, CLASS_PATH_LOADER};
use jvm_sandbox::matcher::{Matcher, PatternFilter};
use jvm_sandbox::spy::SpyRegistry;
use jvm_sandbox::Sandbox;
use std::fs;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

/// Fresh class path directory holding `demo/Calc.class`, removed when dropped
fn class_path() -> TempDir {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("demo")).unwrap();
    fs::write(dir.path().join("demo").join("Calc.class"), calc_class()).unwrap();
    dir
}

#[test]
fn class_path_lists_its_classes() {
    let dir = class_path();
    let host = ClassPathHost::new(vec![dir.path().to_path_buf()]);
    assert_eq!(
        host.loaded_types(),
        vec![LoadedType::new("demo.Calc", Some(CLASS_PATH_LOADER))]
    );
    assert!(host.find_resource(None, "demo/Calc.class").is_none());

    let metadata = host
        .live_metadata(Some(CLASS_PATH_LOADER), "demo.Calc")
        .unwrap();
    assert_eq!(metadata.super_name.as_deref(), Some("java.lang.Object"));
}

#[test]
fn class_path_classes_can_be_watched() {
    let dir = class_path();
    let host = Arc::new(ClassPathHost::new(vec![dir.path().to_path_buf()]));
    let sandbox = Sandbox::new(
        CoreConfig::default(),
        host.clone(),
        Arc::new(SpyRegistry::new()),
    )
    .unwrap();

    let listener = |_: &mut Event| -> Result<ProcessControl, ListenerError> {
        Ok(ProcessControl::Continue)
    };
    let watch_id = sandbox
        .watch(
            Matcher::filter(PatternFilter::new("demo.Calc", "add")),
            Arc::new(listener),
            EventTypes::BEFORE | EventTypes::LINE,
            None,
        )
        .unwrap();
    let woven = host.transformed_bytes("demo/Calc").unwrap();
    assert_eq!(
        probes_called(&woven, "add"),
        vec![
            "spyMethodOnBefore",
            "spyMethodOnLine",
            "spyMethodOnReturn",
            "spyMethodOnThrows",
        ]
    );

    sandbox.delete(watch_id, None).unwrap();
    assert_eq!(
        host.transformed_bytes("demo/Calc"),
        host.read("demo/Calc.class")
    );
    sandbox.shutdown();
}
