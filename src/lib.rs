//! Method-level instrumentation for JVM classes
//!
//! Given a [`matcher::Matcher`] describing which classes and methods to watch, the engine rewrites
//! their bytecode (see [`weaver`]) so that they call into a small bridge class on entry, exit,
//! exceptions, and optionally source lines and method calls. Those calls end up in the
//! [`handler`], which turns them into [`event::Event`]s for listeners. Listeners can alter the
//! arguments of a call, or make the method return or throw early.
//!
//! The engine doesn't talk to a JVM itself: everything it needs from the runtime goes through
//! [`host::HostRuntime`]. [`sandbox::Sandbox`] is the entry point.

pub mod config;
pub mod event;
pub mod handler;
pub mod host;
pub mod jvm;
pub mod matcher;
pub mod pipeline;
pub mod sandbox;
pub mod spy;
pub mod structure;
pub mod util;
pub mod watcher;
pub mod weaver;

pub use sandbox::{Sandbox, SandboxError};
