//! Load-order bookkeeping for rewritten classes.
//!
//! Two relations are recorded for every added tree: outer-class containment
//! (an inner class can only link after its outer class) and
//! implemented-interface edges between declared classes (a handlee that
//! implements a handler interface derived from its own declared bytes must
//! be defined after that interface). [`DependencyTree::classes_to_load`]
//! linearizes them into a stable, deterministic definition order.

use std::collections::{BTreeMap, BTreeSet};

use crate::names;
use crate::nodes::ClassNode;

#[derive(Debug, Default)]
pub struct DependencyTree {
    declared: BTreeSet<String>,
    /// class → names that must be defined before it.
    prerequisites: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rewritten class and its declaration relationships.
    pub fn add(&mut self, class: &ClassNode) {
        let name = names::to_binary(&class.name);
        self.declared.insert(name.clone());

        // The whole outer chain precedes the inner class.
        let outer = class
            .outer_class()
            .map(|outer| names::to_binary(&outer))
            .or_else(|| names::outer_name(&name).map(str::to_string));
        let mut inner = name.clone();
        let mut next_outer = outer;
        while let Some(outer) = next_outer {
            self.prerequisites
                .entry(inner.clone())
                .or_default()
                .insert(outer.clone());
            next_outer = names::outer_name(&outer).map(str::to_string);
            inner = outer;
        }

        // Supertypes precede their implementors; only relationships among
        // declared classes matter for ordering, the rest resolve ambiently.
        for interface in &class.interfaces {
            self.prerequisites
                .entry(name.clone())
                .or_default()
                .insert(names::to_binary(interface));
        }
        if let Some(super_name) = &class.super_name {
            self.prerequisites
                .entry(name.clone())
                .or_default()
                .insert(names::to_binary(super_name));
        }
    }

    pub fn contains(&self, binary_name: &str) -> bool {
        self.declared.contains(binary_name)
    }

    pub fn declared(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    /// Linearize `query` (empty = everything declared) so that every outer
    /// class precedes its inner classes and every declared dependency
    /// precedes its dependents. Lexicographic among unordered peers, so the
    /// result is deterministic. Queried names nobody knows anything about
    /// pass through.
    pub fn classes_to_load(&self, query: &[String]) -> Vec<String> {
        // Closure over prerequisites, restricted to names we can say
        // anything about: declared classes and outer-chain members.
        let mut pending: Vec<String> = if query.is_empty() {
            self.declared.iter().cloned().collect()
        } else {
            query.to_vec()
        };
        let mut members: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = pending.pop() {
            if !members.insert(name.clone()) {
                continue;
            }
            if let Some(prerequisites) = self.prerequisites.get(&name) {
                for prerequisite in prerequisites {
                    // Only declared prerequisites join the load order; every
                    // other supertype resolves ambiently.
                    if self.declared.contains(prerequisite) {
                        pending.push(prerequisite.clone());
                    }
                }
            }
            if let Some(outer) = names::outer_name(&name) {
                pending.push(outer.to_string());
            }
        }

        // Kahn's algorithm over the restricted graph; ready names are taken
        // in lexicographic order.
        let mut blockers: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for name in &members {
            let wanted: BTreeSet<&str> = self
                .prerequisites
                .get(name)
                .into_iter()
                .flatten()
                .map(String::as_str)
                .chain(names::outer_name(name))
                .filter(|prerequisite| members.contains(*prerequisite))
                .collect();
            blockers.insert(name, wanted);
        }

        let mut order = Vec::with_capacity(members.len());
        while !blockers.is_empty() {
            let ready: Vec<&str> = blockers
                .iter()
                .filter(|(_, wanted)| wanted.is_empty())
                .map(|(name, _)| *name)
                .collect();
            if ready.is_empty() {
                // Dependency cycle; emit what remains in name order rather
                // than looping forever.
                order.extend(blockers.keys().map(|name| name.to_string()));
                break;
            }
            for name in ready {
                blockers.remove(name);
                for wanted in blockers.values_mut() {
                    wanted.remove(name);
                }
                order.push(name.to_string());
            }
        }
        order
    }
}
