//! Deciding which types and behaviors get instrumented
//!
//! A [`Filter`] is a pure predicate over names and access flags. A [`Matcher`] composes filters
//! with `And`/`Or` and evaluates them against a [`TypeStructure`], producing the set of matched
//! behaviors.

mod guard;
mod pattern;

pub use guard::*;
pub use pattern::*;

use crate::host::{LoadedType, LoaderId};
use crate::jvm::{ClassAccessFlags, MethodAccessFlags};
use crate::structure::{BehaviorStructure, ResolveError, StructureFactory, TypeStructure};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Structural predicate deciding what to instrument
///
/// All names are Java names.
pub trait Filter: Send + Sync {
    fn matches_type(
        &self,
        access: ClassAccessFlags,
        name: &str,
        super_name: Option<&str>,
        interface_names: &[String],
        annotation_names: &[String],
    ) -> bool;

    fn matches_behavior(
        &self,
        access: MethodAccessFlags,
        name: &str,
        parameter_type_names: &[String],
        exception_type_names: &[String],
        annotation_names: &[String],
    ) -> bool;

    /// Second look at a behavior that passed [`Filter::matches_behavior`], with its full structure
    fn accepts_behavior(&self, _behavior: &BehaviorStructure) -> bool {
        true
    }

    /// Should a type also match when one of its super types does?
    fn include_subtypes(&self) -> bool {
        false
    }

    /// Should types from the root loader be considered at all?
    fn include_root_loaded(&self) -> bool {
        false
    }

    fn matches_loader(&self, _loader: Option<LoaderId>) -> bool {
        true
    }

    /// Name of the single type this filter can match, if there is one
    fn identity(&self) -> Option<String> {
        None
    }
}

/// Composition of filters
#[derive(Clone)]
pub enum Matcher {
    Filter(Arc<dyn Filter>),

    /// Behaviors matched by every child
    And(Vec<Matcher>),

    /// Behaviors matched by any child
    Or(Vec<Matcher>),
}

/// Behaviors of one type selected by a matcher, keyed by signature code
#[derive(Debug, Clone, Default)]
pub struct MatchingResult {
    behaviors: BTreeMap<String, Arc<BehaviorStructure>>,
}

impl MatchingResult {
    pub fn is_matched(&self) -> bool {
        !self.behaviors.is_empty()
    }

    pub fn behaviors(&self) -> impl Iterator<Item = &Arc<BehaviorStructure>> {
        self.behaviors.values()
    }

    pub fn signature_codes(&self) -> BTreeSet<String> {
        self.behaviors.keys().cloned().collect()
    }

    fn intersect(&mut self, other: MatchingResult) {
        self.behaviors
            .retain(|code, _| other.behaviors.contains_key(code));
    }

    fn union(&mut self, other: MatchingResult) {
        self.behaviors.extend(other.behaviors);
    }
}

impl Matcher {
    pub fn filter(filter: impl Filter + 'static) -> Matcher {
        Matcher::Filter(Arc::new(filter))
    }

    /// Name of the single type this matcher can match, if there is one
    pub fn identity(&self) -> Option<String> {
        match self {
            Matcher::Filter(filter) => filter.identity(),
            Matcher::And(children) => {
                let identities: BTreeSet<String> =
                    children.iter().filter_map(Matcher::identity).collect();
                if identities.len() == 1 {
                    identities.into_iter().next()
                } else {
                    None
                }
            }
            Matcher::Or(children) => {
                let mut identities = children.iter().map(Matcher::identity);
                let first = identities.next()??;
                if identities.all(|identity| identity.as_ref() == Some(&first)) {
                    Some(first)
                } else {
                    None
                }
            }
        }
    }

    /// Behaviors of the type selected by this matcher
    pub fn matching(&self, structure: &Arc<TypeStructure>) -> Result<MatchingResult, ResolveError> {
        match self {
            Matcher::Filter(filter) => filter_matching(filter.as_ref(), structure),
            Matcher::And(children) => {
                let mut children = children.iter();
                let mut result = match children.next() {
                    None => return Ok(MatchingResult::default()),
                    Some(first) => first.matching(structure)?,
                };
                for child in children {
                    if !result.is_matched() {
                        break;
                    }
                    result.intersect(child.matching(structure)?);
                }
                Ok(result)
            }
            Matcher::Or(children) => {
                let mut result = MatchingResult::default();
                for child in children {
                    result.union(child.matching(structure)?);
                }
                Ok(result)
            }
        }
    }

    /// Like [`Matcher::matching`], but when a referenced type can't be linked yet, the structure
    /// gets re-derived from the class file and matching is retried once
    pub fn matching_or_raw(
        &self,
        structure: &Arc<TypeStructure>,
        factory: &StructureFactory,
    ) -> Result<MatchingResult, ResolveError> {
        match self.matching(structure) {
            Err(err) if err.is_linkage() => {
                log::debug!(
                    "Matching {} failed ({}), retrying from class file",
                    structure.name(),
                    err
                );
                let loaded = LoadedType::new(structure.name(), structure.loader());
                let raw = factory.from_resource(&loaded)?;
                self.matching(&raw)
            }
            other => other,
        }
    }
}

impl Debug for Matcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Matcher::Filter(filter) => match filter.identity() {
                Some(identity) => write!(f, "Filter({})", identity),
                None => f.write_str("Filter(..)"),
            },
            Matcher::And(children) => f.debug_tuple("And").field(children).finish(),
            Matcher::Or(children) => f.debug_tuple("Or").field(children).finish(),
        }
    }
}

fn filter_matching(
    filter: &dyn Filter,
    structure: &Arc<TypeStructure>,
) -> Result<MatchingResult, ResolveError> {
    let mut result = MatchingResult::default();
    if structure.loader().is_none() && !filter.include_root_loaded() {
        return Ok(result);
    }
    if !filter.matches_loader(structure.loader()) {
        return Ok(result);
    }

    let mut type_matched = type_matches(filter, structure)?;
    if !type_matched && filter.include_subtypes() {
        for member in structure.family_types()? {
            if type_matches(filter, member)? {
                type_matched = true;
                break;
            }
        }
    }
    if !type_matched {
        return Ok(result);
    }

    for behavior in structure.behaviors() {
        if filter.matches_behavior(
            behavior.access(),
            behavior.name(),
            behavior.parameter_type_names(),
            behavior.exception_type_names(),
            behavior.annotation_names(),
        ) && filter.accepts_behavior(behavior)
        {
            result
                .behaviors
                .insert(behavior.signature_code(), behavior.clone());
        }
    }
    Ok(result)
}

fn type_matches(filter: &dyn Filter, structure: &TypeStructure) -> Result<bool, ResolveError> {
    let declared = structure.metadata();
    let interface_names = names_of(
        &declared.interface_names,
        structure.family_interface_types()?,
    );
    let annotation_names = names_of(
        &declared.annotation_names,
        structure.family_annotation_types()?,
    );
    Ok(filter.matches_type(
        structure.access(),
        structure.name(),
        declared.super_name.as_deref(),
        &interface_names,
        &annotation_names,
    ))
}

/// Declared names, followed by names of the resolved family (which may skip unresolvable ones)
fn names_of(declared: &[String], family: &[Arc<TypeStructure>]) -> Vec<String> {
    let mut names = declared.to_vec();
    for member in family {
        if !names.iter().any(|name| name == member.name()) {
            names.push(String::from(member.name()));
        }
    }
    names
}
