//! Stream registry: ownership domains and their worker bindings.

use crate::error::{OrchestratorError, Result};
use crate::model::{StreamSpec, WorkerId};
use dashmap::DashMap;
use tracing::debug;

/// Maps each stream to its spec and, once spawned, to exactly one worker.
#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<String, StreamSpec>,
    bindings: DashMap<String, WorkerId>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream spec. Resource disjointness across streams is
    /// re-checked here even though plan validation catches it first, since
    /// streams can also be registered programmatically.
    pub fn register(&self, spec: StreamSpec) -> Result<()> {
        for existing in self.streams.iter() {
            if existing.key() == &spec.name {
                return Err(OrchestratorError::PlanValidation(format!(
                    "stream {} already registered",
                    spec.name
                )));
            }
            for resource in &spec.owned_resources {
                if existing.owned_resources.contains(resource) {
                    return Err(OrchestratorError::PlanValidation(format!(
                        "resource {} owned by both {} and {}",
                        resource,
                        existing.key(),
                        spec.name
                    )));
                }
            }
        }
        debug!("Registered stream {}", spec.name);
        self.streams.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<StreamSpec> {
        self.streams
            .get(name)
            .map(|s| s.clone())
            .ok_or_else(|| OrchestratorError::StreamNotFound {
                stream: name.to_string(),
            })
    }

    pub fn required_capabilities(&self, name: &str) -> Result<Vec<String>> {
        self.get(name).map(|s| s.required_capabilities)
    }

    /// Bind a worker to a stream. Each stream takes exactly one worker for
    /// the run's duration.
    pub fn bind(&self, stream: &str, worker: &WorkerId) -> Result<()> {
        self.get(stream)?;
        if let Some(existing) = self.bindings.get(stream) {
            return Err(OrchestratorError::StreamAlreadyBound {
                stream: stream.to_string(),
                worker: existing.clone(),
            });
        }
        debug!("Bound worker {} to stream {}", worker, stream);
        self.bindings.insert(stream.to_string(), worker.clone());
        Ok(())
    }

    pub fn worker_for(&self, stream: &str) -> Option<WorkerId> {
        self.bindings.get(stream).map(|w| w.clone())
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|s| s.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, resources: &[&str], caps: &[&str]) -> StreamSpec {
        StreamSpec {
            name: name.to_string(),
            owned_resources: resources.iter().map(|s| s.to_string()).collect(),
            required_capabilities: caps.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = StreamRegistry::new();
        registry
            .register(spec("s1", &["src/api"], &["api-conventions"]))
            .unwrap();
        assert_eq!(
            registry.required_capabilities("s1").unwrap(),
            vec!["api-conventions".to_string()]
        );
        assert!(matches!(
            registry.required_capabilities("ghost"),
            Err(OrchestratorError::StreamNotFound { .. })
        ));
    }

    #[test]
    fn test_overlapping_resources_rejected() {
        let registry = StreamRegistry::new();
        registry.register(spec("s1", &["shared"], &[])).unwrap();
        let err = registry.register(spec("s2", &["shared"], &[])).unwrap_err();
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn test_one_worker_per_stream() {
        let registry = StreamRegistry::new();
        registry.register(spec("s1", &[], &[])).unwrap();
        registry.bind("s1", &"w1".to_string()).unwrap();
        let err = registry.bind("s1", &"w2".to_string()).unwrap_err();
        assert!(matches!(err, OrchestratorError::StreamAlreadyBound { .. }));
        assert_eq!(registry.worker_for("s1"), Some("w1".to_string()));
    }
}
