//! Child Registry (C1): a pure in-memory table of `ProcessSpec`s.
//!
//! Registration is write-once per instance: there is no runtime
//! `Unregister`. To change membership the whole registry (and, in practice,
//! the Supervisor on top of it) is re-created from a reloaded configuration.
use crate::error::RegistryError;
use crate::model::ProcessSpec;
use std::collections::{HashMap, HashSet};

/// Declarative table of managed processes, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct ChildRegistry {
    specs: HashMap<String, ProcessSpec>,
    /// Insertion order, preserved so `List()` is deterministic even though
    /// the backing map is unordered.
    order: Vec<String>,
}

impl ChildRegistry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a spec. Fails with `DuplicateProcess` if the name exists.
    pub fn register(&mut self, spec: ProcessSpec) -> Result<(), RegistryError> {
        if self.specs.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateProcess(spec.name));
        }
        self.order.push(spec.name.clone());
        self.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Returns a deterministically ordered (registration order) copy of
    /// every registered spec.
    pub fn list(&self) -> Vec<ProcessSpec> {
        self.order
            .iter()
            .filter_map(|name| self.specs.get(name).cloned())
            .collect()
    }

    /// Returns a defensive copy of the spec registered under `name`.
    pub fn get(&self, name: &str) -> Option<ProcessSpec> {
        self.specs.get(name).cloned()
    }

    /// Returns true if a spec is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Number of registered specs.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True if no specs are registered.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Validates the dependency graph and returns names in a valid start
    /// order (dependencies before dependents). Rejects unknown dependency
    /// references and cycles.
    pub fn start_order(&self) -> Result<Vec<String>, RegistryError> {
        for name in &self.order {
            let spec = &self.specs[name];
            for dep in &spec.depends_on {
                if !self.specs.contains_key(&dep.name) {
                    return Err(RegistryError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.name.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm over the `depends_on` edges (dependency -> dependent).
        let mut in_degree: HashMap<&str, usize> =
            self.order.iter().map(|n| (n.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> =
            self.order.iter().map(|n| (n.as_str(), Vec::new())).collect();

        for name in &self.order {
            let spec = &self.specs[name];
            *in_degree.get_mut(name.as_str()).unwrap() += spec.depends_on.len();
            for dep in &spec.depends_on {
                dependents.get_mut(dep.name.as_str()).unwrap().push(name.as_str());
            }
        }

        let mut ready: Vec<&str> = self
            .order
            .iter()
            .map(|n| n.as_str())
            .filter(|n| in_degree[n] == 0)
            .collect();
        ready.sort();

        let mut resolved: Vec<String> = Vec::with_capacity(self.order.len());
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(name) = ready.pop() {
            if !visited.insert(name) {
                continue;
            }
            resolved.push(name.to_string());
            let mut newly_ready = Vec::new();
            for dependent in &dependents[name] {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    newly_ready.push(*dependent);
                }
            }
            newly_ready.sort();
            ready.extend(newly_ready);
            ready.sort();
        }

        if resolved.len() != self.order.len() {
            let stuck: Vec<&str> = self
                .order
                .iter()
                .map(|n| n.as_str())
                .filter(|n| !resolved.contains(&n.to_string()))
                .collect();
            return Err(RegistryError::DependencyCycle {
                cycle: stuck.join(" -> "),
            });
        }

        Ok(resolved)
    }

    /// Reverse of `start_order`: dependents before dependencies, used to
    /// stop services in an order that never stops a dependency before its
    /// dependents.
    pub fn stop_order(&self) -> Result<Vec<String>, RegistryError> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }
}
