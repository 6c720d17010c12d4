use super::{ObjectRef, Ret, SelfCallBarrier, Value};
use crate::config::ListenerErrorPolicy;
use crate::host::LoaderId;
use dashmap::DashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Failure while handling a probe call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,

    /// Should the failure reach the instrumented code whatever the error policy says?
    pub interrupt: bool,
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Engine side of the probe calls, for one namespace
pub trait SpyHandler: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn handle_on_before(
        &self,
        listener_id: i32,
        loader: Option<LoaderId>,
        arguments: &mut [Value],
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        target: Option<ObjectRef>,
    ) -> Result<Ret, HandlerError>;

    fn handle_on_return(&self, listener_id: i32, value: Value) -> Result<Ret, HandlerError>;

    fn handle_on_throws(&self, listener_id: i32, throwable: Value) -> Result<Ret, HandlerError>;

    fn handle_on_line(&self, listener_id: i32, line: i32) -> Result<(), HandlerError>;

    fn handle_on_call_before(
        &self,
        listener_id: i32,
        line: i32,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), HandlerError>;

    fn handle_on_call_return(&self, listener_id: i32) -> Result<(), HandlerError>;

    fn handle_on_call_throws(
        &self,
        listener_id: i32,
        exception_class_name: &str,
    ) -> Result<(), HandlerError>;
}

struct Installed {
    handler: Arc<dyn SpyHandler>,
    policy: ListenerErrorPolicy,
}

/// Routes probe calls from woven code to the handler of their namespace
///
/// The host forwards every native bridge method here. Calls made while the current thread is
/// already inside a dispatch (eg. a listener calling instrumented code) are ignored. Handler
/// failures stop here: depending on the namespace's policy they are logged and ignored, or turned
/// into an exception thrown from the instrumented method.
#[derive(Default)]
pub struct SpyRegistry {
    handlers: DashMap<String, Installed>,
    barrier: SelfCallBarrier,
}

impl SpyRegistry {
    pub fn new() -> SpyRegistry {
        SpyRegistry::default()
    }

    pub fn install(
        &self,
        namespace: &str,
        handler: Arc<dyn SpyHandler>,
        policy: ListenerErrorPolicy,
    ) {
        log::info!("Installing spy handler for namespace '{}'", namespace);
        self.handlers
            .insert(String::from(namespace), Installed { handler, policy });
    }

    pub fn uninstall(&self, namespace: &str) -> bool {
        let removed = self.handlers.remove(namespace).is_some();
        if removed {
            log::info!("Uninstalled spy handler for namespace '{}'", namespace);
        }
        removed
    }

    pub fn is_installed(&self, namespace: &str) -> bool {
        self.handlers.contains_key(namespace)
    }

    /// Handler and policy for a namespace, without keeping the map locked
    fn lookup(&self, namespace: &str) -> Option<(Arc<dyn SpyHandler>, ListenerErrorPolicy)> {
        self.handlers
            .get(namespace)
            .map(|installed| (installed.handler.clone(), installed.policy))
    }

    /// Run a handler call inside the barrier, applying the namespace's error policy
    fn dispatch<F>(&self, namespace: &str, probe: &str, call: F) -> Ret
    where
        F: FnOnce(&dyn SpyHandler) -> Result<Ret, HandlerError>,
    {
        let (handler, policy) = match self.lookup(namespace) {
            Some(found) => found,
            None => return Ret::None,
        };
        let _guard = match self.barrier.enter() {
            Some(guard) => guard,
            None => return Ret::None,
        };
        match call(handler.as_ref()) {
            Ok(ret) => ret,
            Err(err) if err.interrupt || policy == ListenerErrorPolicy::Propagate => {
                log::warn!("{} in namespace '{}' failed, throwing: {}", probe, namespace, err);
                Ret::Throws(Value::throwable(
                    "java.lang.RuntimeException",
                    format!("sandbox listener failed: {}", err),
                ))
            }
            Err(err) => {
                log::warn!("{} in namespace '{}' failed: {}", probe, namespace, err);
                Ret::None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_before(
        &self,
        arguments: &mut [Value],
        namespace: &str,
        listener_id: i32,
        loader_id: i32,
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        target: Option<ObjectRef>,
    ) -> Ret {
        let loader = if loader_id == 0 { None } else { Some(loader_id) };
        self.dispatch(namespace, "on_before", |handler| {
            handler.handle_on_before(
                listener_id,
                loader,
                arguments,
                class_name,
                method_name,
                descriptor,
                target,
            )
        })
    }

    pub fn on_return(&self, value: Value, namespace: &str, listener_id: i32) -> Ret {
        self.dispatch(namespace, "on_return", |handler| {
            handler.handle_on_return(listener_id, value)
        })
    }

    pub fn on_throws(&self, throwable: Value, namespace: &str, listener_id: i32) -> Ret {
        self.dispatch(namespace, "on_throws", |handler| {
            handler.handle_on_throws(listener_id, throwable)
        })
    }

    pub fn on_line(&self, line: i32, namespace: &str, listener_id: i32) {
        self.dispatch(namespace, "on_line", |handler| {
            handler.handle_on_line(listener_id, line).map(|()| Ret::None)
        });
    }

    pub fn on_call_before(
        &self,
        line: i32,
        owner: &str,
        name: &str,
        descriptor: &str,
        namespace: &str,
        listener_id: i32,
    ) {
        self.dispatch(namespace, "on_call_before", |handler| {
            handler
                .handle_on_call_before(listener_id, line, owner, name, descriptor)
                .map(|()| Ret::None)
        });
    }

    pub fn on_call_return(&self, namespace: &str, listener_id: i32) {
        self.dispatch(namespace, "on_call_return", |handler| {
            handler.handle_on_call_return(listener_id).map(|()| Ret::None)
        });
    }

    pub fn on_call_throws(&self, exception_class_name: &str, namespace: &str, listener_id: i32) {
        self.dispatch(namespace, "on_call_throws", |handler| {
            handler
                .handle_on_call_throws(listener_id, exception_class_name)
                .map(|()| Ret::None)
        });
    }
}
