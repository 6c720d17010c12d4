//! Lifecycle of watches
//!
//! Watching a matcher registers a transformer with the runtime (so types loaded from now on get
//! woven), retransforms the matching types already loaded, and only then starts delivering events
//! to the listener. Deleting a watch does the reverse: events stop right away, the transformer is
//! removed, and the affected types are retransformed with whatever other watches remain.

mod progress;

pub use progress::*;

use crate::event::{EventListener, EventTypes};
use crate::handler::EventListenerHandler;
use crate::host::{ClassTransformer, LoadedType, LoaderId};
use crate::matcher::Matcher;
use crate::pipeline::{PipelineError, RetransformPipeline};
use crate::structure::StructureFactory;
use crate::weaver::{LoaderHierarchy, WeaveRequest, Weaver};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// First watch id handed out
const FIRST_WATCH_ID: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    UnknownWatch(u32),
    Pipeline(PipelineError),
}

impl Display for WatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::UnknownWatch(id) => write!(f, "no watch with id {}", id),
            WatchError::Pipeline(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for WatchError {}

impl From<PipelineError> for WatchError {
    fn from(err: PipelineError) -> WatchError {
        WatchError::Pipeline(err)
    }
}

/// Weaves the classes the runtime hands over, on behalf of one watch
pub struct SandboxTransformer {
    namespace: String,
    listener_id: i32,

    /// Matcher of the watch, guard included
    matcher: Matcher,
    event_types: EventTypes,
    factory: Arc<StructureFactory>,
    weaver: Arc<Weaver>,
    affect: Arc<AffectStatistic>,
}

impl ClassTransformer for SandboxTransformer {
    fn transform(
        &self,
        loader: Option<LoaderId>,
        internal_name: &str,
        being_redefined: bool,
        class_bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let structure = match self.factory.from_bytes(loader, class_bytes) {
            Ok(structure) => structure,
            Err(err) => {
                log::debug!("Cannot read {} for weaving: {}", internal_name, err);
                return None;
            }
        };
        let matching = match self.matcher.matching_or_raw(&structure, &self.factory) {
            Ok(matching) if matching.is_matched() => matching,
            Ok(_) => return None,
            Err(err) => {
                log::debug!("Cannot match {}: {}", internal_name, err);
                return None;
            }
        };

        let host = self.factory.host();
        if !host.expose_bridge(loader) {
            log::warn!(
                "Bridge classes are not visible from loader {:?}, leaving {} alone",
                loader,
                internal_name
            );
            return None;
        }

        let request = WeaveRequest {
            namespace: self.namespace.clone(),
            listener_id: self.listener_id,
            loader,
            event_types: self.event_types,
            signature_codes: matching.signature_codes(),
        };
        let hierarchy = LoaderHierarchy::new(host.as_ref(), loader);
        match self.weaver.weave(class_bytes, &request, &hierarchy) {
            Ok(Some(woven)) => {
                log::debug!(
                    "Wove {} ({} behavior(s), redefined: {}) for watch {}",
                    structure.name(),
                    woven.behaviors.len(),
                    being_redefined,
                    self.listener_id
                );
                let loaded = LoadedType::new(structure.name(), loader);
                self.affect.record(loaded, &woven.behaviors);
                Some(woven.bytes)
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("Failed to weave {}: {}", structure.name(), err);
                None
            }
        }
    }
}

struct WatchRecord {
    matcher: Matcher,
    affect: Arc<AffectStatistic>,
}

/// Registry of the watches of one engine
pub struct ModuleEventWatcher {
    namespace: String,
    factory: Arc<StructureFactory>,
    weaver: Arc<Weaver>,

    /// Combined with every watched matcher
    guard: Matcher,
    handler: Arc<EventListenerHandler>,
    pipeline: Arc<RetransformPipeline>,
    watches: Mutex<BTreeMap<u32, WatchRecord>>,
    next_id: AtomicU32,
}

fn finish(progress: &Option<Arc<dyn Progress>>, affect: &AffectStatistic) {
    if let Some(progress) = progress {
        if let Err(err) = progress.finish(affect.class_count(), affect.method_count()) {
            log::warn!("Progress callback failed: {}", err);
        }
    }
}

impl ModuleEventWatcher {
    pub fn new(
        namespace: impl Into<String>,
        factory: Arc<StructureFactory>,
        weaver: Arc<Weaver>,
        guard: Matcher,
        handler: Arc<EventListenerHandler>,
        pipeline: Arc<RetransformPipeline>,
    ) -> ModuleEventWatcher {
        ModuleEventWatcher {
            namespace: namespace.into(),
            factory,
            weaver,
            guard,
            handler,
            pipeline,
            watches: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(FIRST_WATCH_ID),
        }
    }

    /// Instrument everything the matcher selects and deliver its events to the listener
    ///
    /// Returns once the types already loaded have been retransformed.
    pub fn watch(
        &self,
        matcher: Matcher,
        listener: Arc<dyn EventListener>,
        event_types: EventTypes,
        progress: Option<Arc<dyn Progress>>,
    ) -> Result<u32, WatchError> {
        let watch_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let matcher = Matcher::And(vec![self.guard.clone(), matcher]);
        let affect = Arc::new(AffectStatistic::default());

        let transformer = SandboxTransformer {
            namespace: self.namespace.clone(),
            listener_id: watch_id as i32,
            matcher: matcher.clone(),
            event_types,
            factory: self.factory.clone(),
            weaver: self.weaver.clone(),
            affect: affect.clone(),
        };
        let host = self.factory.host();
        host.add_transformer(watch_id, Arc::new(transformer));
        self.watches.lock().insert(
            watch_id,
            WatchRecord {
                matcher: matcher.clone(),
                affect: affect.clone(),
            },
        );

        let outcome = match self
            .pipeline
            .submit(matcher, progress.clone())
            .and_then(|completion| completion.wait())
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.watches.lock().remove(&watch_id);
                host.remove_transformer(watch_id);
                return Err(err.into());
            }
        };

        self.handler
            .activate(watch_id as i32, listener, event_types);
        finish(&progress, &affect);
        log::info!(
            "Watch {} in namespace '{}' matched {} type(s), affected {} class(es) and {} method(s)",
            watch_id,
            self.namespace,
            outcome.types.len(),
            affect.class_count(),
            affect.method_count()
        );
        Ok(watch_id)
    }

    /// Stop a watch and take its probes back out
    pub fn delete(
        &self,
        watch_id: u32,
        progress: Option<Arc<dyn Progress>>,
    ) -> Result<(), WatchError> {
        let record = self
            .watches
            .lock()
            .remove(&watch_id)
            .ok_or(WatchError::UnknownWatch(watch_id))?;
        self.handler.freeze(watch_id as i32);
        self.factory.host().remove_transformer(watch_id);

        let outcome = self
            .pipeline
            .submit(record.matcher, progress.clone())?
            .wait()?;
        finish(&progress, &record.affect);
        log::info!(
            "Deleted watch {} in namespace '{}', restored {} type(s)",
            watch_id,
            self.namespace,
            outcome.types.len()
        );
        Ok(())
    }

    /// Watch for as long as `callback` runs
    ///
    /// The watch is deleted afterwards, whatever the callback did.
    pub fn watching<T>(
        &self,
        matcher: Matcher,
        listener: Arc<dyn EventListener>,
        event_types: EventTypes,
        progress: Option<Arc<dyn Progress>>,
        callback: impl FnOnce() -> T,
    ) -> Result<T, WatchError> {
        let watch_id = self.watch(matcher, listener, event_types, progress.clone())?;
        let pending = PendingDelete {
            watcher: self,
            watch_id,
            progress,
            armed: true,
        };
        let result = callback();
        pending.finish()?;
        Ok(result)
    }

    /// Ids of the live watches
    pub fn watch_ids(&self) -> Vec<u32> {
        self.watches.lock().keys().copied().collect()
    }

    /// Classes and methods a live watch has woven so far
    pub fn affect(&self, watch_id: u32) -> Option<(usize, usize)> {
        let watches = self.watches.lock();
        let record = watches.get(&watch_id)?;
        Some((record.affect.class_count(), record.affect.method_count()))
    }

    /// Delete every live watch
    pub fn delete_all(&self) {
        for watch_id in self.watch_ids() {
            if let Err(err) = self.delete(watch_id, None) {
                log::warn!("Failed to delete watch {}: {}", watch_id, err);
            }
        }
    }
}

/// Deletes a watch when dropped, unless [`PendingDelete::finish`] already did
struct PendingDelete<'a> {
    watcher: &'a ModuleEventWatcher,
    watch_id: u32,
    progress: Option<Arc<dyn Progress>>,
    armed: bool,
}

impl PendingDelete<'_> {
    fn finish(mut self) -> Result<(), WatchError> {
        self.armed = false;
        self.watcher.delete(self.watch_id, self.progress.take())
    }
}

impl Drop for PendingDelete<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.watcher.delete(self.watch_id, self.progress.take()) {
            log::warn!("Failed to delete watch {} after unwinding: {}", self.watch_id, err);
        }
    }
}
