//! Turning probe calls into listener events
//!
//! [`EventListenerHandler`] is the [`SpyHandler`] of one engine instance. It keeps the active
//! listeners by listener id and, for each of them, a per-thread stack of the invocations
//! currently running. The bottom of the stack is the process id.

use crate::event::{Event, EventKind, EventListener, EventType, EventTypes, ProcessControl};
use crate::host::LoaderId;
use crate::spy::{HandlerError, ObjectRef, Ret, SpyHandler, Value};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// First invoke id handed out
const FIRST_INVOKE_ID: u64 = 1000;

/// Invocations running on one thread for one listener
#[derive(Default)]
struct Process {
    stack: Vec<u64>,

    /// No more events for this process
    ignore: bool,

    /// The next `THROWS` comes from a listener's `ThrowImmediately`
    exception_from_immediately: bool,
}

impl Process {
    fn process_id(&self) -> Option<u64> {
        self.stack.first().copied()
    }

    fn invoke_id(&self) -> Option<u64> {
        self.stack.last().copied()
    }
}

/// Listener of an active watch, with its per-thread processes
struct Activation {
    listener_id: i32,
    listener: Arc<dyn EventListener>,
    event_types: EventTypes,
    processes: Mutex<HashMap<ThreadId, Process>>,
}

impl Activation {
    /// Run something on the current thread's process
    ///
    /// The process is dropped once its stack is empty, which also clears its flags.
    fn with_process<T>(&self, f: impl FnOnce(&mut Process) -> T) -> T {
        let thread = thread::current().id();
        let mut processes = self.processes.lock();
        let process = processes.entry(thread).or_default();
        let result = f(process);
        if process.stack.is_empty() {
            processes.remove(&thread);
        }
        result
    }

    /// Current process and invoke id, unless there is no running invocation or it is ignored
    fn current_ids(&self) -> Option<(u64, u64)> {
        self.with_process(|process| {
            if process.ignore {
                return None;
            }
            Some((process.process_id()?, process.invoke_id()?))
        })
    }
}

/// Engine-side handler of probe calls
pub struct EventListenerHandler {
    activations: DashMap<i32, Arc<Activation>>,
    invoke_ids: AtomicU64,
}

impl Default for EventListenerHandler {
    fn default() -> Self {
        EventListenerHandler::new()
    }
}

impl EventListenerHandler {
    pub fn new() -> EventListenerHandler {
        EventListenerHandler {
            activations: DashMap::new(),
            invoke_ids: AtomicU64::new(FIRST_INVOKE_ID),
        }
    }

    /// Start delivering events of the given types to a listener
    pub fn activate(
        &self,
        listener_id: i32,
        listener: Arc<dyn EventListener>,
        event_types: EventTypes,
    ) {
        log::info!(
            "Activating listener {} for events {:?}",
            listener_id,
            event_types
        );
        self.activations.insert(
            listener_id,
            Arc::new(Activation {
                listener_id,
                listener,
                event_types,
                processes: Mutex::new(HashMap::new()),
            }),
        );
    }

    /// Stop delivering events to a listener
    ///
    /// Calls already running keep the activation they started with.
    pub fn freeze(&self, listener_id: i32) -> bool {
        match self.activations.remove(&listener_id) {
            Some(_) => {
                log::info!("Froze listener {}", listener_id);
                true
            }
            None => {
                log::debug!("Listener {} is not active, nothing to freeze", listener_id);
                false
            }
        }
    }

    pub fn is_active(&self, listener_id: i32) -> bool {
        self.activations.contains_key(&listener_id)
    }

    fn activation(&self, listener_id: i32) -> Option<Arc<Activation>> {
        let found = self
            .activations
            .get(&listener_id)
            .map(|activation| activation.value().clone());
        if found.is_none() {
            log::debug!("Listener {} is not active, ignoring event", listener_id);
        }
        found
    }

    /// Deliver an event and turn the listener's answer into a result for the woven code
    fn handle_event(
        &self,
        activation: &Activation,
        event: &mut Event,
    ) -> Result<Ret, HandlerError> {
        let event_type = event.event_type();
        if !activation.event_types.has(event_type) {
            return Ok(Ret::None);
        }

        log::debug!(
            "on-event: {}|{}|{}|{}",
            event_type.name(),
            event.process_id,
            event.invoke_id,
            activation.listener_id
        );
        let control = match activation.listener.on_event(event) {
            Ok(control) => control,
            Err(err) => {
                return Err(HandlerError {
                    message: format!(
                        "listener {} failed on {}: {}",
                        activation.listener_id,
                        event_type.name(),
                        err
                    ),
                    interrupt: activation.listener.is_interrupted(),
                })
            }
        };

        if control.ignores_process() {
            activation.with_process(|process| process.ignore = true);
        }
        let is_before = event_type == EventType::Before;

        match control {
            ProcessControl::Continue => Ok(Ret::None),
            ProcessControl::ReturnImmediately {
                value,
                ignore_process,
            } => {
                if !ignore_process {
                    let compensation = EventKind::ImmediatelyReturn {
                        value: value.clone(),
                    };
                    self.compensate(activation, event, compensation);
                }

                // There will be no `RETURN` for an invocation cut short in `BEFORE`
                if is_before {
                    activation.with_process(|process| process.stack.pop());
                }
                Ok(Ret::Return(value))
            }
            ProcessControl::ThrowImmediately {
                throwable,
                ignore_process,
            } => {
                if !ignore_process {
                    activation.with_process(|process| {
                        if is_before {
                            process.stack.pop();
                        }
                        if event_type != EventType::Throws {
                            process.exception_from_immediately = true;
                        }
                    });
                    let compensation = EventKind::ImmediatelyThrows {
                        throwable: throwable.clone(),
                    };
                    self.compensate(activation, event, compensation);
                }
                Ok(Ret::Throws(throwable))
            }
        }
    }

    /// Tell a listener about the early return or throw it asked for, if it listens for those
    fn compensate(&self, activation: &Activation, original: &Event, kind: EventKind) {
        let mut event = Event {
            process_id: original.process_id,
            invoke_id: original.invoke_id,
            kind,
        };
        let event_type = event.event_type();
        if !activation.event_types.has(event_type) {
            return;
        }
        log::debug!(
            "compensate-event: {}|{}|{}|{} for {}",
            event_type.name(),
            event.process_id,
            event.invoke_id,
            activation.listener_id,
            original.event_type().name()
        );
        if let Err(err) = activation.listener.on_event(&mut event) {
            log::warn!(
                "Listener {} failed on compensating {}: {}",
                activation.listener_id,
                event_type.name(),
                err
            );
        }
    }

    /// Shared path of `RETURN` and `THROWS`
    fn handle_on_end(&self, listener_id: i32, kind: EventKind) -> Result<Ret, HandlerError> {
        let activation = match self.activation(listener_id) {
            Some(activation) => activation,
            None => return Ok(Ret::None),
        };
        let is_throws = matches!(kind, EventKind::Throws { .. });

        enum End {
            Skip,
            Rethrow,
            Deliver(u64, u64),
        }
        let end = activation.with_process(|process| {
            // Invocations started before the activation (or `super(...)` calls) have no `BEFORE`
            let process_id = match process.process_id() {
                Some(process_id) => process_id,
                None => return End::Skip,
            };
            if is_throws && process.exception_from_immediately {
                process.exception_from_immediately = false;
                return End::Rethrow;
            }
            let invoke_id = match process.stack.pop() {
                Some(invoke_id) => invoke_id,
                None => return End::Skip,
            };
            if process.ignore {
                return End::Skip;
            }
            let is_empty = process.stack.is_empty();
            if (process_id == invoke_id) != is_empty {
                log::warn!(
                    "Inconsistent process stack: pid={};iid={};listener={};",
                    process_id,
                    invoke_id,
                    listener_id
                );
            }
            End::Deliver(process_id, invoke_id)
        });

        match end {
            End::Skip => Ok(Ret::None),
            End::Rethrow => match kind {
                EventKind::Throws { throwable } => Ok(Ret::Throws(throwable)),
                _ => Ok(Ret::None),
            },
            End::Deliver(process_id, invoke_id) => self.handle_event(
                &activation,
                &mut Event {
                    process_id,
                    invoke_id,
                    kind,
                },
            ),
        }
    }

    /// Shared path of the events raised in the middle of an invocation
    fn handle_inside(&self, listener_id: i32, kind: EventKind) -> Result<(), HandlerError> {
        let activation = match self.activation(listener_id) {
            Some(activation) => activation,
            None => return Ok(()),
        };
        let (process_id, invoke_id) = match activation.current_ids() {
            Some(ids) => ids,
            None => return Ok(()),
        };
        self.handle_event(
            &activation,
            &mut Event {
                process_id,
                invoke_id,
                kind,
            },
        )
        .map(|_| ())
    }
}

impl SpyHandler for EventListenerHandler {
    fn handle_on_before(
        &self,
        listener_id: i32,
        loader: Option<LoaderId>,
        arguments: &mut [Value],
        class_name: &str,
        method_name: &str,
        descriptor: &str,
        target: Option<ObjectRef>,
    ) -> Result<Ret, HandlerError> {
        let activation = match self.activation(listener_id) {
            Some(activation) => activation,
            None => return Ok(Ret::None),
        };

        let invoke_id = self.invoke_ids.fetch_add(1, Ordering::SeqCst);
        let process_id = activation.with_process(|process| {
            if process.ignore {
                return None;
            }
            process.stack.push(invoke_id);
            process.process_id()
        });
        let process_id = match process_id {
            Some(process_id) => process_id,
            None => {
                log::debug!("Listener {} ignores the current process", listener_id);
                return Ok(Ret::None);
            }
        };

        let mut event = Event {
            process_id,
            invoke_id,
            kind: EventKind::Before {
                loader,
                class_name: String::from(class_name),
                method_name: String::from(method_name),
                descriptor: String::from(descriptor),
                target,
                arguments: arguments.to_vec(),
            },
        };

        // Arguments go back to the woven code even if the listener asks for an early exit
        let result = self.handle_event(&activation, &mut event);
        if let EventKind::Before {
            arguments: changed, ..
        } = &event.kind
        {
            for (slot, value) in arguments.iter_mut().zip(changed) {
                *slot = value.clone();
            }
        }
        result
    }

    fn handle_on_return(&self, listener_id: i32, value: Value) -> Result<Ret, HandlerError> {
        self.handle_on_end(listener_id, EventKind::Return { value })
    }

    fn handle_on_throws(&self, listener_id: i32, throwable: Value) -> Result<Ret, HandlerError> {
        self.handle_on_end(listener_id, EventKind::Throws { throwable })
    }

    fn handle_on_line(&self, listener_id: i32, line: i32) -> Result<(), HandlerError> {
        self.handle_inside(listener_id, EventKind::Line { line })
    }

    fn handle_on_call_before(
        &self,
        listener_id: i32,
        line: i32,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<(), HandlerError> {
        self.handle_inside(
            listener_id,
            EventKind::CallBefore {
                line,
                owner: String::from(owner),
                name: String::from(name),
                descriptor: String::from(descriptor),
            },
        )
    }

    fn handle_on_call_return(&self, listener_id: i32) -> Result<(), HandlerError> {
        self.handle_inside(listener_id, EventKind::CallReturn)
    }

    fn handle_on_call_throws(
        &self,
        listener_id: i32,
        exception_class_name: &str,
    ) -> Result<(), HandlerError> {
        self.handle_inside(
            listener_id,
            EventKind::CallThrows {
                exception_class_name: String::from(exception_class_name),
            },
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::ListenerError;

    type Seen = Arc<Mutex<Vec<(EventType, u64, u64)>>>;

    /// Listener recording everything, answering with `answer` for events of type `on`
    fn recording(
        seen: Seen,
        on: EventType,
        answer: ProcessControl,
    ) -> Arc<dyn EventListener> {
        Arc::new(move |event: &mut Event| -> Result<ProcessControl, ListenerError> {
            let typ = event.event_type();
            seen.lock().push((typ, event.process_id, event.invoke_id));
            Ok(if typ == on {
                answer.clone()
            } else {
                ProcessControl::Continue
            })
        })
    }

    fn before(handler: &EventListenerHandler, listener_id: i32, arguments: &mut [Value]) -> Ret {
        handler
            .handle_on_before(listener_id, None, arguments, "demo.Calc", "sum", "(II)I", None)
            .unwrap()
    }

    #[test]
    fn nested_invocations_share_a_process() {
        let handler = EventListenerHandler::new();
        let seen = Seen::default();
        let listener = recording(seen.clone(), EventType::Line, ProcessControl::Continue);
        handler.activate(7, listener, EventTypes::BEFORE | EventTypes::RETURN);

        assert_eq!(before(&handler, 7, &mut []), Ret::None);
        assert_eq!(before(&handler, 7, &mut []), Ret::None);
        assert_eq!(handler.handle_on_return(7, Value::Int(1)).unwrap(), Ret::None);
        assert_eq!(handler.handle_on_return(7, Value::Int(2)).unwrap(), Ret::None);

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        let (_, outer_pid, outer_iid) = seen[0];
        let (_, inner_pid, inner_iid) = seen[1];
        assert_eq!(outer_pid, outer_iid);
        assert_eq!(inner_pid, outer_pid);
        assert_ne!(inner_iid, outer_iid);
        assert_eq!(seen[2], (EventType::Return, outer_pid, inner_iid));
        assert_eq!(seen[3], (EventType::Return, outer_pid, outer_iid));
    }

    #[test]
    fn early_return_from_before_unwinds_the_stack() {
        let handler = EventListenerHandler::new();
        let seen = Seen::default();
        let answer = ProcessControl::return_immediately(Value::Int(100));
        let listener = recording(seen.clone(), EventType::Before, answer);
        let types = EventTypes::BEFORE | EventTypes::RETURN | EventTypes::IMMEDIATELY_RETURN;
        handler.activate(7, listener, types);

        assert_eq!(before(&handler, 7, &mut []), Ret::Return(Value::Int(100)));

        // The invocation never ran, so the stack is empty again
        assert_eq!(handler.handle_on_return(7, Value::Null).unwrap(), Ret::None);
        let seen = seen.lock();
        let types: Vec<EventType> = seen.iter().map(|(typ, _, _)| *typ).collect();
        assert_eq!(types, vec![EventType::Before, EventType::ImmediatelyReturn]);
    }

    #[test]
    fn early_throw_is_not_reported_again() {
        let handler = EventListenerHandler::new();
        let seen = Seen::default();
        let boom = Value::throwable("java.lang.IllegalStateException", "boom");
        let answer = ProcessControl::throw_immediately(boom.clone());
        let listener = recording(seen.clone(), EventType::Return, answer);
        let types = EventTypes::BEFORE | EventTypes::RETURN | EventTypes::THROWS;
        handler.activate(7, listener, types);

        before(&handler, 7, &mut []);
        before(&handler, 7, &mut []);
        assert_eq!(
            handler.handle_on_return(7, Value::Int(3)).unwrap(),
            Ret::Throws(boom.clone())
        );

        // The inner method's own handler sees the throwable first, then the outer one does
        assert_eq!(
            handler.handle_on_throws(7, boom.clone()).unwrap(),
            Ret::Throws(boom.clone())
        );
        assert_eq!(handler.handle_on_throws(7, boom).unwrap(), Ret::None);

        let types: Vec<EventType> = seen.lock().iter().map(|(typ, _, _)| *typ).collect();
        assert_eq!(
            types,
            vec![
                EventType::Before,
                EventType::Before,
                EventType::Return,
                EventType::Throws
            ]
        );
    }

    #[test]
    fn arguments_are_written_back() {
        let handler = EventListenerHandler::new();
        let listener: Arc<dyn EventListener> =
            Arc::new(|event: &mut Event| -> Result<ProcessControl, ListenerError> {
                if let EventKind::Before { arguments, .. } = &mut event.kind {
                    arguments[1] = Value::Int(40);
                }
                Ok(ProcessControl::Continue)
            });
        handler.activate(7, listener, EventTypes::BEFORE);

        let mut arguments = [Value::Int(1), Value::Int(2)];
        before(&handler, 7, &mut arguments);
        assert_eq!(arguments, [Value::Int(1), Value::Int(40)]);
    }

    #[test]
    fn frozen_listeners_get_nothing() {
        let handler = EventListenerHandler::new();
        let seen = Seen::default();
        let listener = recording(seen.clone(), EventType::Line, ProcessControl::Continue);
        handler.activate(7, listener, EventTypes::all());
        assert!(handler.is_active(7));
        assert!(handler.freeze(7));
        assert!(!handler.freeze(7));

        assert_eq!(before(&handler, 7, &mut []), Ret::None);
        assert_eq!(handler.handle_on_return(7, Value::Null).unwrap(), Ret::None);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn listener_failures_are_reported() {
        let handler = EventListenerHandler::new();
        let listener: Arc<dyn EventListener> =
            Arc::new(|_: &mut Event| -> Result<ProcessControl, ListenerError> {
                Err("no luck".into())
            });
        handler.activate(7, listener, EventTypes::BEFORE);

        let err = handler
            .handle_on_before(7, None, &mut [], "demo.Calc", "sum", "(II)I", None)
            .unwrap_err();
        assert!(err.message.contains("no luck"));
        assert!(!err.interrupt);
    }
}
