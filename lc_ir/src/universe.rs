//! The class universe: every class under analysis, keyed by internal name.

use crate::class::ClassNode;
use indexmap::IndexMap;

/// One class of the universe: the mutable node, its container provenance,
/// and failures recorded against it during any pass.
#[derive(Debug, Clone)]
pub struct ClassRecord {
    pub node: ClassNode,
    /// Container entry the class came from, e.g. `com/a/b.class`.
    pub entry: Option<String>,
    /// Original bytes; a class that fails a pass surfaces these unchanged.
    pub bytes: Option<Vec<u8>>,
    pub failures: Vec<String>,
}

impl ClassRecord {
    pub fn new(node: ClassNode) -> Self {
        Self {
            node,
            entry: None,
            bytes: None,
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.failures.push(message.into());
    }
}

/// Mapping from internal class name to class record. Insertion order is
/// preserved so pipeline runs are deterministic.
#[derive(Debug, Default)]
pub struct Universe {
    classes: IndexMap<String, ClassRecord>,
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record under the node's own name, replacing any previous
    /// record of that name.
    pub fn insert(&mut self, record: ClassRecord) {
        self.classes.insert(record.node.name.clone(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<ClassRecord> {
        self.classes.shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ClassRecord> {
        self.classes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ClassRecord> {
        self.classes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Snapshot of all class names. Passes that mutate the universe while
    /// iterating must walk this instead of a live iterator.
    pub fn names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClassRecord)> {
        self.classes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ClassRecord)> {
        self.classes.iter_mut()
    }

    /// All failures recorded across the universe, `(class, message)`.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.classes
            .iter()
            .flat_map(|(name, record)| {
                record
                    .failures
                    .iter()
                    .map(move |f| (name.clone(), f.clone()))
            })
            .collect()
    }
}
