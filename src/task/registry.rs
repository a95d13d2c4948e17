use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use glob::Pattern;

use crate::core::ArcStr;
use crate::error::{RegistryError, SchedulerError};
use crate::task::{BodyFn, Params, Task, TaskId};

/// Everything needed to define a task family.
pub(crate) struct FamilySpec {
    pub name: ArcStr,
    pub body: BodyFn,
    pub depends: Vec<TaskId>,
    pub reads: Vec<ArcStr>,
    pub description: Option<ArcStr>,
}

struct Family {
    spec: FamilySpec,
    instances: Vec<TaskId>,
}

/// Stores all task families and their instances.
///
/// A family is a name bound to a body and its declared dependencies. Each
/// instance is that family evaluated with a concrete parameter set, a plain
/// task is the family's instance with empty parameters.
#[derive(Default)]
pub struct Registry {
    families: BTreeMap<ArcStr, Family>,
    tasks: BTreeMap<TaskId, Task>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a family without any instance.
    pub(crate) fn define(&mut self, spec: FamilySpec) -> Result<(), RegistryError> {
        validate_name(&spec.name)?;

        if let Some(existing) = self.families.get(&spec.name) {
            let same = Arc::ptr_eq(&existing.spec.body, &spec.body)
                && existing.spec.depends == spec.depends
                && existing.spec.reads == spec.reads;

            return if same {
                Ok(())
            } else {
                Err(RegistryError::IdentityCollision(TaskId::named(&spec.name)))
            };
        }

        tracing::debug!(family = %spec.name, "defined task family");
        let name = spec.name.clone();
        self.families.insert(
            name,
            Family {
                spec,
                instances: Vec::new(),
            },
        );

        Ok(())
    }

    /// Defines a family and registers its parameterless instance.
    pub(crate) fn register(&mut self, spec: FamilySpec) -> Result<TaskId, RegistryError> {
        let name = spec.name.clone();
        let id = TaskId::named(&name);

        if self.tasks.contains_key(&id) {
            let existing = &self.families[&name].spec;
            let same = Arc::ptr_eq(&existing.body, &spec.body)
                && existing.depends == spec.depends
                && existing.reads == spec.reads;

            return if same {
                Ok(id)
            } else {
                Err(RegistryError::IdentityCollision(id))
            };
        }

        self.define(spec)?;
        self.add_instance(&name, Params::new())
    }

    /// Adds an instance of an already defined family. Adding the same
    /// parameter set twice returns the existing identity.
    pub fn add_instance(&mut self, name: &str, params: Params) -> Result<TaskId, RegistryError> {
        let family = self
            .families
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownFamily(name.to_string()))?;

        let id = TaskId::new(name, params);
        if self.tasks.contains_key(&id) {
            tracing::debug!(task = %id, "instance already registered");
            return Ok(id);
        }

        let task = Task {
            id: id.clone(),
            body: family.spec.body.clone(),
            depends: family.spec.depends.clone(),
            reads: family.spec.reads.clone(),
            description: family.spec.description.clone(),
        };

        family.instances.push(id.clone());
        self.tasks.insert(id.clone(), task);
        tracing::debug!(task = %id, "registered task");

        Ok(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// All task instances, ordered by identity.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(AsRef::as_ref)
    }

    /// Instances of a family in registration order.
    pub fn instances(&self, name: &str) -> Option<&[TaskId]> {
        self.families
            .get(name)
            .map(|family| family.instances.as_slice())
    }

    /// Resolves a user supplied name into task identities. A name is either
    /// a family name, an instance label as printed by [`TaskId`], or a glob
    /// pattern over either.
    pub fn resolve(&self, name: &str) -> Result<BTreeSet<TaskId>, SchedulerError> {
        let mut found = BTreeSet::new();

        if let Some(instances) = self.instances(name) {
            found.extend(instances.iter().cloned());
        }

        found.extend(
            self.tasks
                .keys()
                .filter(|id| id.to_string() == name)
                .cloned(),
        );

        if found.is_empty() && name.contains(['*', '?', '[']) {
            let pattern = Pattern::new(name)?;

            for (family, entry) in &self.families {
                if pattern.matches(family) {
                    found.extend(entry.instances.iter().cloned());
                }
            }

            found.extend(
                self.tasks
                    .keys()
                    .filter(|id| pattern.matches(&id.to_string()))
                    .cloned(),
            );
        }

        if found.is_empty() {
            return Err(SchedulerError::UnknownTask(name.to_string()));
        }

        Ok(found)
    }

    /// Resolves every name of a list, see [`resolve`](Self::resolve).
    pub fn resolve_all<S>(&self, names: &[S]) -> Result<BTreeSet<TaskId>, SchedulerError>
    where
        S: AsRef<str>,
    {
        let mut found = BTreeSet::new();
        for name in names {
            found.extend(self.resolve(name.as_ref())?);
        }
        Ok(found)
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}
