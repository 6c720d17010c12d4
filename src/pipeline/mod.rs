//! Batching of retransformation requests
//!
//! Watching and deleting both end with "retransform every loaded type this matcher selects". Those
//! requests go through one bounded queue. A coalescing thread drains it in batches and groups the
//! requests of a batch by matcher identity (requests whose matchers can only select the same
//! type), so that a burst of watches on one type costs a single retransformation. Groups are then
//! handed to a small pool of workers.
//!
//! Grouping is only a scheduling hint: every request is answered, whatever group it lands in.

use crate::event::ListenerError;
use crate::host::{HostError, LoadedType};
use crate::matcher::Matcher;
use crate::structure::StructureFactory;
use crate::watcher::Progress;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Sizes of the pipeline's queues and pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub flush_capacity: usize,
    pub workers: usize,
    pub batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> PipelineSettings {
        PipelineSettings {
            queue_capacity: 512,
            flush_capacity: 300,
            workers: 4,
            batch_size: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The pipeline was shut down before the request could be handled
    Closed,
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Closed => f.write_str("retransform pipeline is shut down"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// What happened to the types selected by a request
#[derive(Debug, Clone, Default)]
pub struct RetransformOutcome {
    /// Types selected by the matcher of the request's group
    pub types: Vec<LoadedType>,

    /// Types the runtime refused to retransform
    pub failed: Vec<(LoadedType, HostError)>,
}

/// Answer to a submitted request
pub struct Completion(Receiver<RetransformOutcome>);

impl Completion {
    /// Block until the request has been handled
    pub fn wait(self) -> Result<RetransformOutcome, PipelineError> {
        self.0.recv().map_err(|_| PipelineError::Closed)
    }
}

struct Job {
    matcher: Matcher,
    progress: Option<Arc<dyn Progress>>,
    done: Sender<RetransformOutcome>,
}

struct Group {
    key: String,
    jobs: Vec<Job>,
}

pub struct RetransformPipeline {
    factory: Arc<StructureFactory>,
    settings: PipelineSettings,
    submit: Mutex<Option<Sender<Job>>>,

    /// Receiving end of the submission queue, until the pipeline starts
    pending: Mutex<Option<Receiver<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RetransformPipeline {
    /// Pipeline which accepts requests right away, but only handles them once started
    pub fn new(factory: Arc<StructureFactory>, settings: PipelineSettings) -> RetransformPipeline {
        let (submit, pending) = bounded(settings.queue_capacity);
        RetransformPipeline {
            factory,
            settings,
            submit: Mutex::new(Some(submit)),
            pending: Mutex::new(Some(pending)),
            threads: Mutex::new(vec![]),
        }
    }

    /// Spawn the coalescing thread and the workers (does nothing if already started)
    pub fn start(&self) -> std::io::Result<()> {
        let jobs = match self.pending.lock().take() {
            Some(jobs) => jobs,
            None => return Ok(()),
        };
        let (flush, groups) = bounded::<Group>(self.settings.flush_capacity);
        let mut threads = self.threads.lock();

        let batch_size = self.settings.batch_size;
        threads.push(
            thread::Builder::new()
                .name(String::from("sandbox-coalescer"))
                .spawn(move || coalesce(jobs, flush, batch_size))?,
        );
        for idx in 0..self.settings.workers {
            let groups = groups.clone();
            let factory = self.factory.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("sandbox-retransform-{}", idx))
                    .spawn(move || {
                        while let Ok(group) = groups.recv() {
                            handle_group(&factory, group);
                        }
                    })?,
            );
        }
        log::debug!(
            "Started retransform pipeline with {} worker(s)",
            self.settings.workers
        );
        Ok(())
    }

    /// Queue a request, blocking while the queue is full
    pub fn submit(
        &self,
        matcher: Matcher,
        progress: Option<Arc<dyn Progress>>,
    ) -> Result<Completion, PipelineError> {
        let submit = self.submit.lock().clone().ok_or(PipelineError::Closed)?;
        let (done, completion) = bounded(1);
        let job = Job {
            matcher,
            progress,
            done,
        };
        submit.send(job).map_err(|_| PipelineError::Closed)?;
        Ok(Completion(completion))
    }

    /// Close the queue and wait for every thread to finish what was already queued
    pub fn shutdown(&self) {
        self.submit.lock().take();
        self.pending.lock().take();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                log::warn!("Retransform pipeline thread panicked");
            }
        }
    }
}

impl Drop for RetransformPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Key grouping requests whose matchers select the same single type
///
/// Matchers without an identity get a random key, so they end up alone in their group.
fn group_key(matcher: &Matcher) -> String {
    match matcher.identity() {
        Some(identity) => identity,
        None => random_key(),
    }
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

fn coalesce(jobs: Receiver<Job>, flush: Sender<Group>, batch_size: usize) {
    while let Ok(first) = jobs.recv() {
        let mut groups: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        groups.entry(group_key(&first.matcher)).or_default().push(first);

        let mut batched = 1;
        while batched < batch_size {
            match jobs.try_recv() {
                Ok(job) => {
                    groups.entry(group_key(&job.matcher)).or_default().push(job);
                    batched += 1;
                }
                Err(_) => break,
            }
        }

        log::debug!("Flushing {} request(s) in {} group(s)", batched, groups.len());
        for (key, jobs) in groups {
            if flush.send(Group { key, jobs }).is_err() {
                return;
            }
        }
    }
}

fn handle_group(factory: &StructureFactory, group: Group) {
    let matcher = match group.jobs.as_slice() {
        [job] => job.matcher.clone(),
        jobs => Matcher::Or(jobs.iter().map(|job| job.matcher.clone()).collect()),
    };
    let types = find_matching_types(factory, &matcher);
    let progresses: Vec<Arc<dyn Progress>> = group
        .jobs
        .iter()
        .filter_map(|job| job.progress.clone())
        .collect();
    log::debug!(
        "Retransforming {} type(s) for group {} of {} request(s)",
        types.len(),
        group.key,
        group.jobs.len()
    );

    let failed = retransform(factory, &types, &progresses);
    let outcome = RetransformOutcome { types, failed };
    for job in group.jobs {
        // The submitter may have given up waiting
        let _ = job.done.send(outcome.clone());
    }
}

/// Every loaded type the matcher selects
pub fn find_matching_types(factory: &StructureFactory, matcher: &Matcher) -> Vec<LoadedType> {
    let mut matched = vec![];
    for loaded in factory.host().loaded_types() {
        let structure = match factory
            .from_live(&loaded)
            .or_else(|_| factory.from_resource(&loaded))
        {
            Ok(structure) => structure,
            Err(err) => {
                log::debug!("Skipping {}: {}", loaded, err);
                continue;
            }
        };
        match matcher.matching_or_raw(&structure, factory) {
            Ok(result) if result.is_matched() => matched.push(loaded),
            Ok(_) => (),
            Err(err) => log::debug!("Skipping {}: {}", loaded, err),
        }
    }
    matched
}

/// Call a progress callback, logging its failure
fn notify(progresses: &[Arc<dyn Progress>], call: impl Fn(&dyn Progress) -> Result<(), ListenerError>) {
    for progress in progresses {
        if let Err(err) = call(progress.as_ref()) {
            log::warn!("Progress callback failed: {}", err);
        }
    }
}

/// Retransform the types, all at once if possible and one by one otherwise
///
/// Going one by one is also how progress gets reported, so that's what happens whenever someone
/// is listening for progress.
fn retransform(
    factory: &StructureFactory,
    types: &[LoadedType],
    progresses: &[Arc<dyn Progress>],
) -> Vec<(LoadedType, HostError)> {
    let host = factory.host();
    if types.is_empty() {
        notify(progresses, |progress| progress.begin(0));
        return vec![];
    }
    if progresses.is_empty() {
        match host.retransform(types) {
            Ok(()) => return vec![],
            Err(err) => log::warn!(
                "Batch retransform of {} type(s) failed ({}), retrying one by one",
                types.len(),
                err
            ),
        }
    }

    notify(progresses, |progress| progress.begin(types.len()));
    let mut failed = vec![];
    for (idx, typ) in types.iter().enumerate() {
        match host.retransform(std::slice::from_ref(typ)) {
            Ok(()) => notify(progresses, |progress| progress.on_success(typ, idx)),
            Err(err) => {
                log::warn!("Retransform of {} failed: {}", typ, err);
                notify(progresses, |progress| progress.on_failed(typ, idx, &err));
                failed.push((typ.clone(), err));
            }
        }
    }
    failed
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_keys() {
        let first = random_key();
        let second = random_key();
        assert_eq!(first.len(), 10);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, second);
    }

    #[test]
    fn keys_follow_identity() {
        use crate::matcher::PatternFilter;

        let exact = Matcher::filter(PatternFilter::new("demo.Calc", "*"));
        let wildcard = Matcher::filter(PatternFilter::new("demo.*", "*"));
        assert_eq!(group_key(&exact), "demo.Calc");
        assert_ne!(group_key(&wildcard), group_key(&wildcard));
    }
}
