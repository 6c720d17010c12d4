//! Entry point of the engine
//!
//! A [`Sandbox`] ties one namespace's worth of engine together: it installs its event handler
//! in the [`SpyRegistry`] shared with the host, runs the retransform pipeline, and exposes the
//! watch operations.

use crate::config::{ConfigError, CoreConfig};
use crate::event::{EventListener, EventTypes};
use crate::handler::EventListenerHandler;
use crate::host::{HostRuntime, LoadedType};
use crate::jvm::{self, BinaryName};
use crate::matcher::{Matcher, MatchingResult, UnsupportedGuard};
use crate::pipeline::{PipelineSettings, RetransformPipeline};
use crate::spy::SpyRegistry;
use crate::structure::{ResolveError, StructureFactory};
use crate::watcher::{ModuleEventWatcher, Progress, WatchError};
use crate::weaver::Weaver;
use once_cell::sync::OnceCell;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Debug)]
pub enum SandboxError {
    Config(ConfigError),
    Watch(WatchError),
    Resolve(ResolveError),

    /// Bridge classes could not be generated
    Bridge(jvm::Error),

    /// Pipeline threads could not be spawned
    Io(std::io::Error),
}

impl Display for SandboxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Config(err) => write!(f, "configuration error: {}", err),
            SandboxError::Watch(err) => write!(f, "watch error: {}", err),
            SandboxError::Resolve(err) => write!(f, "cannot resolve type: {}", err),
            SandboxError::Bridge(err) => write!(f, "cannot generate bridge classes: {}", err),
            SandboxError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<ConfigError> for SandboxError {
    fn from(err: ConfigError) -> SandboxError {
        SandboxError::Config(err)
    }
}

impl From<WatchError> for SandboxError {
    fn from(err: WatchError) -> SandboxError {
        SandboxError::Watch(err)
    }
}

impl From<ResolveError> for SandboxError {
    fn from(err: ResolveError) -> SandboxError {
        SandboxError::Resolve(err)
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> SandboxError {
        SandboxError::Io(err)
    }
}

pub struct Sandbox {
    config: CoreConfig,
    registry: Arc<SpyRegistry>,
    factory: Arc<StructureFactory>,
    weaver: Arc<Weaver>,
    guard: Matcher,
    pipeline: Arc<RetransformPipeline>,
    watcher: ModuleEventWatcher,
    bridge_classes: OnceCell<Vec<(BinaryName, Vec<u8>)>>,
}

impl Sandbox {
    /// Start an engine for the namespace of `config`
    ///
    /// The engine's handler is installed in `registry` right away, replacing whatever was
    /// installed for the same namespace.
    pub fn new(
        config: CoreConfig,
        host: Arc<dyn HostRuntime>,
        registry: Arc<SpyRegistry>,
    ) -> Result<Sandbox, SandboxError> {
        let factory = StructureFactory::new(host.clone(), config.structure_cache_capacity);
        let weaver = Arc::new(Weaver::new(config.bridge_names()));
        let guard = Matcher::filter(UnsupportedGuard::new(
            host,
            config.unsafe_enabled,
            config.excluded_packages(),
            config.native_prefix.clone(),
        ));

        let pipeline = Arc::new(RetransformPipeline::new(
            factory.clone(),
            PipelineSettings {
                queue_capacity: config.pipeline_queue_capacity,
                flush_capacity: config.pipeline_flush_capacity,
                workers: config.pipeline_workers,
                batch_size: config.pipeline_batch_size,
            },
        ));
        pipeline.start()?;

        let handler = Arc::new(EventListenerHandler::new());
        registry.install(
            &config.namespace,
            handler.clone(),
            config.listener_error_policy,
        );
        let watcher = ModuleEventWatcher::new(
            config.namespace.clone(),
            factory.clone(),
            weaver.clone(),
            guard.clone(),
            handler,
            pipeline.clone(),
        );

        log::info!("Sandbox started for namespace '{}'", config.namespace);
        Ok(Sandbox {
            config,
            registry,
            factory,
            weaver,
            guard,
            pipeline,
            watcher,
            bridge_classes: OnceCell::new(),
        })
    }

    /// Start an engine from a feature string (eg. `;namespace=default;unsafe.enable=true;`)
    pub fn from_feature_string(
        features: &str,
        host: Arc<dyn HostRuntime>,
        registry: Arc<SpyRegistry>,
    ) -> Result<Sandbox, SandboxError> {
        let config = CoreConfig::from_feature_string(features)?;
        Sandbox::new(config, host, registry)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn weaver(&self) -> &Weaver {
        &self.weaver
    }

    /// Instrument everything the matcher selects, delivering events of the given types
    ///
    /// Returns the watch id, once matching types already loaded have been woven.
    pub fn watch(
        &self,
        matcher: Matcher,
        listener: Arc<dyn EventListener>,
        event_types: EventTypes,
        progress: Option<Arc<dyn Progress>>,
    ) -> Result<u32, SandboxError> {
        Ok(self
            .watcher
            .watch(matcher, listener, event_types, progress)?)
    }

    pub fn delete(
        &self,
        watch_id: u32,
        progress: Option<Arc<dyn Progress>>,
    ) -> Result<(), SandboxError> {
        Ok(self.watcher.delete(watch_id, progress)?)
    }

    /// Watch while `callback` runs, then delete the watch
    pub fn watching<T>(
        &self,
        matcher: Matcher,
        listener: Arc<dyn EventListener>,
        event_types: EventTypes,
        progress: Option<Arc<dyn Progress>>,
        callback: impl FnOnce() -> T,
    ) -> Result<T, SandboxError> {
        Ok(self
            .watcher
            .watching(matcher, listener, event_types, progress, callback)?)
    }

    pub fn watch_ids(&self) -> Vec<u32> {
        self.watcher.watch_ids()
    }

    /// Classes and methods woven so far by a live watch
    pub fn affect(&self, watch_id: u32) -> Option<(usize, usize)> {
        self.watcher.affect(watch_id)
    }

    /// Behaviors of a loaded type a matcher would instrument (the guard applies)
    pub fn find_matching_behaviors(
        &self,
        loaded: &LoadedType,
        matcher: &Matcher,
    ) -> Result<MatchingResult, SandboxError> {
        let structure = self
            .factory
            .from_live(loaded)
            .or_else(|_| self.factory.from_resource(loaded))?;
        let matcher = Matcher::And(vec![self.guard.clone(), matcher.clone()]);
        Ok(matcher.matching_or_raw(&structure, &self.factory)?)
    }

    /// Class files of the bridge classes, for the host to define in the root loader
    pub fn bridge_classes(&self) -> Result<&[(BinaryName, Vec<u8>)], SandboxError> {
        self.bridge_classes
            .get_or_try_init(|| self.weaver.bridge().generate())
            .map(Vec::as_slice)
            .map_err(SandboxError::Bridge)
    }

    /// Delete every watch, stop the pipeline, and uninstall the handler
    pub fn shutdown(&self) {
        self.watcher.delete_all();
        self.pipeline.shutdown();
        self.registry.uninstall(&self.config.namespace);
        log::info!("Sandbox for namespace '{}' shut down", self.config.namespace);
    }
}
