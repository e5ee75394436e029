use crate::plugin::FilterFactory;
use std::collections::HashMap;
use std::sync::Arc;

/// Filter-kind registry. Built once at startup, immutable thereafter;
/// chain assembly resolves kinds against it on every snapshot publish.
pub struct FilterRegistry {
    factories: HashMap<String, Arc<dyn FilterFactory>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a filter factory.
    pub fn register(&mut self, factory: Arc<dyn FilterFactory>) {
        let kind = factory.kind().to_string();
        tracing::info!(filter = %kind, "Registered filter kind");
        self.factories.insert(kind, factory);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn FilterFactory>> {
        self.factories.get(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
