//! Name-keyed backend registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Backend, BackendError, EchoBackend};

#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `echo` backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoBackend::new()));
        registry
    }

    /// Add a backend under its own name, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        let name = backend.name().to_string();
        debug!(backend = %name, "Backend registered");
        self.backends.insert(name, backend)
    }

    #[must_use]
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>, BackendError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::Unknown {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_echo() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.contains("echo"));
        assert_eq!(registry.get("echo").unwrap().name(), "echo");
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.get("openai"),
            Err(BackendError::Unknown { name }) if name == "openai"
        ));
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = BackendRegistry::with_defaults();
        let previous = registry.register(Arc::new(EchoBackend::streaming()));
        assert!(previous.is_some());
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }
}
