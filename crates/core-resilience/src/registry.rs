//! Named pipeline registry
//!
//! Pipelines are built once, up front, and looked up by resource name at call time.

use crate::error::ResilienceError;
use crate::pipeline::{PipelineOptions, ResiliencePipeline};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Pipeline name for the message broker
pub const BROKER: &str = "broker";
/// Pipeline name for the cache
pub const CACHE: &str = "cache";
/// Pipeline name for the database
pub const DATABASE: &str = "database";

/// Immutable set of resilience pipelines keyed by resource name
#[derive(Debug, Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<ResiliencePipeline>>,
}

impl PipelineRegistry {
    /// Start building a registry
    pub fn builder() -> PipelineRegistryBuilder {
        PipelineRegistryBuilder::default()
    }

    /// Look up the pipeline registered for `name`
    pub fn get(&self, name: &str) -> Result<Arc<ResiliencePipeline>, ResilienceError> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| ResilienceError::UnknownPipeline(name.to_string()))
    }

    /// Whether a pipeline is registered for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    /// Registered resource names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder for [`PipelineRegistry`]
#[derive(Debug, Default)]
pub struct PipelineRegistryBuilder {
    options: Vec<(String, PipelineOptions)>,
}

impl PipelineRegistryBuilder {
    /// Register options for a resource; a later call for the same name wins
    pub fn with_pipeline(mut self, name: impl Into<String>, options: PipelineOptions) -> Self {
        let name = name.into();
        self.options.retain(|(existing, _)| *existing != name);
        self.options.push((name, options));
        self
    }

    pub fn build(self) -> PipelineRegistry {
        let pipelines = self
            .options
            .into_iter()
            .map(|(name, options)| {
                debug!(
                    resource = %name,
                    max_retries = options.retry.max_retry_attempts,
                    timeout_ms = options.timeout.as_millis() as u64,
                    "Built resilience pipeline"
                );
                let pipeline = Arc::new(ResiliencePipeline::new(name.as_str(), options));
                (name, pipeline)
            })
            .collect();
        PipelineRegistry { pipelines }
    }
}
