//! Events delivered to listeners, and what listeners answer with
//!
//! Each call into an instrumented method is an _invocation_ with its own invoke id. Invocations
//! nested on the same thread (for the same listener) form a _process_, identified by the invoke
//! id of the outermost invocation.

use crate::host::LoaderId;
use crate::spy::{ObjectRef, Value};
use bitflags::bitflags;
use std::error::Error;

/// Kinds of events
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum EventType {
    Before,
    Return,
    Throws,
    Line,
    CallBefore,
    CallReturn,
    CallThrows,
    ImmediatelyReturn,
    ImmediatelyThrows,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::Before,
        EventType::Return,
        EventType::Throws,
        EventType::Line,
        EventType::CallBefore,
        EventType::CallReturn,
        EventType::CallThrows,
        EventType::ImmediatelyReturn,
        EventType::ImmediatelyThrows,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            EventType::Before => "BEFORE",
            EventType::Return => "RETURN",
            EventType::Throws => "THROWS",
            EventType::Line => "LINE",
            EventType::CallBefore => "CALL_BEFORE",
            EventType::CallReturn => "CALL_RETURN",
            EventType::CallThrows => "CALL_THROWS",
            EventType::ImmediatelyReturn => "IMMEDIATELY_RETURN",
            EventType::ImmediatelyThrows => "IMMEDIATELY_THROWS",
        }
    }

    pub const fn mask(&self) -> EventTypes {
        match self {
            EventType::Before => EventTypes::BEFORE,
            EventType::Return => EventTypes::RETURN,
            EventType::Throws => EventTypes::THROWS,
            EventType::Line => EventTypes::LINE,
            EventType::CallBefore => EventTypes::CALL_BEFORE,
            EventType::CallReturn => EventTypes::CALL_RETURN,
            EventType::CallThrows => EventTypes::CALL_THROWS,
            EventType::ImmediatelyReturn => EventTypes::IMMEDIATELY_RETURN,
            EventType::ImmediatelyThrows => EventTypes::IMMEDIATELY_THROWS,
        }
    }
}

bitflags! {
    /// Set of event types a listener wants
    pub struct EventTypes: u16 {
        const BEFORE = 0x0001;
        const RETURN = 0x0002;
        const THROWS = 0x0004;
        const LINE = 0x0008;
        const CALL_BEFORE = 0x0010;
        const CALL_RETURN = 0x0020;
        const CALL_THROWS = 0x0040;
        const IMMEDIATELY_RETURN = 0x0080;
        const IMMEDIATELY_THROWS = 0x0100;

        const CALLS = Self::CALL_BEFORE.bits | Self::CALL_RETURN.bits | Self::CALL_THROWS.bits;
    }
}

impl EventTypes {
    /// Parse a comma separated list of event type names (eg. `BEFORE,RETURN`)
    pub fn from_names(names: &str) -> Result<EventTypes, String> {
        let mut types = EventTypes::empty();
        for name in names.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let found = EventType::ALL
                .iter()
                .find(|typ| typ.name().eq_ignore_ascii_case(name))
                .ok_or_else(|| format!("unknown event type '{}'", name))?;
            types |= found.mask();
        }
        Ok(types)
    }

    pub fn has(&self, typ: EventType) -> bool {
        self.contains(typ.mask())
    }

    /// Does weaving need call-site probes?
    pub fn wants_calls(&self) -> bool {
        self.intersects(EventTypes::CALLS)
    }
}

/// Event delivered to a listener
#[derive(Debug)]
pub struct Event {
    pub process_id: u64,
    pub invoke_id: u64,
    pub kind: EventKind,
}

#[derive(Debug)]
pub enum EventKind {
    /// Method entered
    ///
    /// Changes made to `arguments` are written back into the method's parameters.
    Before {
        loader: Option<LoaderId>,
        class_name: String,
        method_name: String,
        descriptor: String,

        /// `this`, absent for static methods and constructors
        target: Option<ObjectRef>,
        arguments: Vec<Value>,
    },

    /// Method returned normally (`Null` for `void` methods)
    Return { value: Value },

    /// Method is exiting with an exception
    Throws { throwable: Value },

    /// Source line about to run
    Line { line: i32 },

    /// Method about to call another method (`line` is `-1` when unknown)
    CallBefore {
        line: i32,
        owner: String,
        name: String,
        descriptor: String,
    },
    CallReturn,
    CallThrows { exception_class_name: String },

    /// A listener made the method return early
    ImmediatelyReturn { value: Value },

    /// A listener made the method throw early
    ImmediatelyThrows { throwable: Value },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::Before { .. } => EventType::Before,
            EventKind::Return { .. } => EventType::Return,
            EventKind::Throws { .. } => EventType::Throws,
            EventKind::Line { .. } => EventType::Line,
            EventKind::CallBefore { .. } => EventType::CallBefore,
            EventKind::CallReturn => EventType::CallReturn,
            EventKind::CallThrows { .. } => EventType::CallThrows,
            EventKind::ImmediatelyReturn { .. } => EventType::ImmediatelyReturn,
            EventKind::ImmediatelyThrows { .. } => EventType::ImmediatelyThrows,
        }
    }
}

/// What the instrumented method should do once the listener is done
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessControl {
    Continue,

    /// Return `value` from the method right away
    ///
    /// With `ignore_process`, no further events are delivered for the rest of the process.
    ReturnImmediately { value: Value, ignore_process: bool },

    /// Throw `throwable` from the method right away
    ThrowImmediately {
        throwable: Value,
        ignore_process: bool,
    },
}

impl ProcessControl {
    pub fn return_immediately(value: Value) -> ProcessControl {
        ProcessControl::ReturnImmediately {
            value,
            ignore_process: false,
        }
    }

    pub fn throw_immediately(throwable: Value) -> ProcessControl {
        ProcessControl::ThrowImmediately {
            throwable,
            ignore_process: false,
        }
    }

    /// Stop delivering events for the rest of the process
    pub fn ignoring_process(self) -> ProcessControl {
        match self {
            ProcessControl::ReturnImmediately { value, .. } => ProcessControl::ReturnImmediately {
                value,
                ignore_process: true,
            },
            ProcessControl::ThrowImmediately { throwable, .. } => {
                ProcessControl::ThrowImmediately {
                    throwable,
                    ignore_process: true,
                }
            }
            ProcessControl::Continue => ProcessControl::Continue,
        }
    }

    pub fn ignores_process(&self) -> bool {
        matches!(
            self,
            ProcessControl::ReturnImmediately {
                ignore_process: true,
                ..
            } | ProcessControl::ThrowImmediately {
                ignore_process: true,
                ..
            }
        )
    }
}

pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Receiver of the events of a watch
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &mut Event) -> Result<ProcessControl, ListenerError>;

    /// Should failures of this listener abort the instrumented method?
    fn is_interrupted(&self) -> bool {
        false
    }
}

impl<F> EventListener for F
where
    F: Fn(&mut Event) -> Result<ProcessControl, ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &mut Event) -> Result<ProcessControl, ListenerError> {
        self(event)
    }
}
