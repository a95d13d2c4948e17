//! All the task-related abstractions.
//!
//! A task is identified by its family name and a canonical parameter set.
//! Its body is a factory: every run calls it with a [`TaskContext`] to obtain
//! a fresh [`Producer`] which the executor then drives to completion.

mod context;
mod params;
pub mod producer;
mod registry;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::core::{ArcStr, Hash32};

pub use context::TaskContext;
pub use params::Params;
pub(crate) use params::write_value;
pub use producer::{Producer, Step};
pub use registry::Registry;
pub(crate) use registry::FamilySpec;

/// Type-erased task body.
pub(crate) type BodyFn =
    Arc<dyn Fn(&TaskContext) -> anyhow::Result<Box<dyn Producer>> + Send + Sync>;

/// A task body: a factory called once per run to build the task's producer.
///
/// Bodies are compared by identity. Registering a name again with a clone of
/// the same `TaskBody` is a no-op, any other body is a collision.
#[derive(Clone)]
pub struct TaskBody(pub(crate) BodyFn);

impl TaskBody {
    pub fn new<F, P>(body: F) -> Self
    where
        F: Fn(&TaskContext) -> anyhow::Result<P> + Send + Sync + 'static,
        P: Producer + 'static,
    {
        TaskBody(Arc::new(
            move |ctx: &TaskContext| -> anyhow::Result<Box<dyn Producer>> {
                Ok(Box::new(body(ctx)?))
            },
        ))
    }
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskBody")
    }
}

/// Identity key of a task instance: the family name plus the fingerprint of
/// its canonical parameter set.
///
/// A `TaskId` is cheap to clone. It can be built before the task it names is
/// registered, which is how forward dependencies are declared.
#[derive(Clone)]
pub struct TaskId {
    name: ArcStr,
    params: Arc<Params>,
    fingerprint: Hash32,
}

impl TaskId {
    pub fn new(name: impl AsRef<str>, params: Params) -> Self {
        let fingerprint = params.fingerprint();
        Self {
            name: name.as_ref().into(),
            params: Arc::new(params),
            fingerprint,
        }
    }

    /// Identity of the parameterless instance of `name`.
    pub fn named(name: impl AsRef<str>) -> Self {
        Self::new(name, Params::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn fingerprint(&self) -> Hash32 {
        self.fingerprint
    }

    /// Label as shown to users, `name` or `name[k=v,...]`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl PartialEq for TaskId {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.name == other.name
    }
}

impl Eq for TaskId {}

impl Hash for TaskId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.fingerprint.hash(state);
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.fingerprint.cmp(&other.fingerprint))
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.params)
        }
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({self})")
    }
}

impl From<&TaskId> for TaskId {
    fn from(value: &TaskId) -> Self {
        value.clone()
    }
}

/// A registered task instance. Immutable once registered.
#[derive(Clone)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) body: BodyFn,
    /// Explicitly declared dependencies.
    pub(crate) depends: Vec<TaskId>,
    /// Families whose cache the body declares to read.
    pub(crate) reads: Vec<ArcStr>,
    pub(crate) description: Option<ArcStr>,
}

impl Task {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn depends(&self) -> &[TaskId] {
        &self.depends
    }

    pub fn reads(&self) -> impl Iterator<Item = &str> {
        self.reads.iter().map(AsRef::as_ref)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("depends", &self.depends)
            .field("reads", &self.reads)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_param_order() {
        let a = TaskId::new("sim", Params::new().with("a", 1).with("b", 2));
        let b = TaskId::new("sim", Params::new().with("b", 2).with("a", 1));

        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_identity_depends_on_name() {
        assert_ne!(TaskId::named("a"), TaskId::named("b"));
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskId::named("sim").to_string(), "sim");
        assert_eq!(
            TaskId::new("sim", Params::new().with("power", 2)).to_string(),
            "sim[power=2]"
        );
    }
}
