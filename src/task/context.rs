use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::{CacheRecord, CacheStore, Loaded};
use crate::core::ArcStr;
use crate::error::{CacheError, StaleDependencyWarning, StaleReason, Warning};
use crate::task::{Params, TaskId};

/// What a task body gets to see while building its producer.
///
/// Reads of other tasks' caches go through here, so that reads of
/// incomplete, excluded or undeclared data can be reported back as
/// warnings on the run result.
pub struct TaskContext {
    id: TaskId,
    store: CacheStore,
    declared: BTreeSet<ArcStr>,
    excluded: Arc<BTreeSet<TaskId>>,
    /// Registered instances per family, reads never see anything else.
    families: Arc<BTreeMap<ArcStr, Vec<TaskId>>>,
    warnings: RefCell<Vec<Warning>>,
}

impl TaskContext {
    pub(crate) fn new(
        id: TaskId,
        store: CacheStore,
        declared: BTreeSet<ArcStr>,
        excluded: Arc<BTreeSet<TaskId>>,
        families: Arc<BTreeMap<ArcStr, Vec<TaskId>>>,
    ) -> Self {
        Self {
            id,
            store,
            declared,
            excluded,
            families,
            warnings: RefCell::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Parameters of the running instance.
    pub fn params(&self) -> &Params {
        self.id.params()
    }

    /// Loads every instance of a task family, see [`CacheStore::load`].
    pub fn load(&self, name: &str) -> Result<Loaded, CacheError> {
        self.load_inner(name, None)
    }

    /// Loads the instances of a family whose parameters contain `filter`.
    pub fn load_matching(&self, name: &str, filter: &Params) -> Result<Loaded, CacheError> {
        self.load_inner(name, Some(filter))
    }

    /// Loads exactly one instance.
    pub fn load_instance(&self, id: &TaskId) -> Result<CacheRecord, CacheError> {
        self.check_declared(id.name());

        match self.store.read(id)? {
            Some(record) => {
                self.check_fresh(&record);
                Ok(record)
            }
            None => {
                self.stale(id.clone(), StaleReason::Missing);
                Err(CacheError::NotFound(id.to_string()))
            }
        }
    }

    fn load_inner(&self, name: &str, filter: Option<&Params>) -> Result<Loaded, CacheError> {
        self.check_declared(name);

        let instances = self.families.get(name).map(Vec::as_slice).unwrap_or_default();

        match self.store.load(name, instances, filter) {
            Ok(loaded) => {
                for record in loaded.records() {
                    self.check_fresh(record);
                }
                Ok(loaded)
            }
            Err(CacheError::NotFound(name)) => {
                self.stale(TaskId::named(&name), StaleReason::Missing);
                Err(CacheError::NotFound(name))
            }
            Err(err) => Err(err),
        }
    }

    fn check_declared(&self, name: &str) {
        if name == self.id.name() || self.declared.contains(name) {
            return;
        }

        tracing::warn!(task = %self.id, family = name, "read of an undeclared dependency");
        self.warnings.borrow_mut().push(Warning::UndeclaredRead {
            task: self.id.clone(),
            family: name.to_string(),
        });
    }

    fn check_fresh(&self, record: &CacheRecord) {
        if self.excluded.contains(&record.id) {
            self.stale(record.id.clone(), StaleReason::Excluded);
        } else if !record.finalized {
            self.stale(record.id.clone(), StaleReason::Incomplete);
        }
    }

    fn stale(&self, dependency: TaskId, reason: StaleReason) {
        let warning = StaleDependencyWarning {
            task: self.id.clone(),
            dependency,
            reason,
        };

        tracing::warn!("{warning}");
        self.warnings.borrow_mut().push(Warning::Stale(warning));
    }

    pub(crate) fn into_warnings(self) -> Vec<Warning> {
        self.warnings.into_inner()
    }
}
