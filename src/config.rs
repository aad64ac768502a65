//! Service configuration.
//!
//! Configuration is an explicitly constructed object handed to each
//! component at build time, never ambient global state. The builder resolves
//! values in order (later wins):
//!
//! 1. Compiled defaults
//! 2. Environment variables (`LORESMITH_*`, loaded through `dotenvy`)
//! 3. Programmatic overrides on the builder
//!
//! ```rust
//! use loresmith::config::ServiceConfig;
//!
//! let config = ServiceConfig::builder()
//!     .embedding_dimensions(1536)
//!     .top_k(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.retrieval.top_k, 4);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::LoreError;

/// Provider-facing settings: endpoints, model ids, inference knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the embedding endpoint.
    pub embedding_endpoint: String,
    /// Embedding model identifier sent with each invoke.
    pub embedding_model: String,
    /// Fixed system-wide embedding dimensionality. Any response with a
    /// different length is a hard failure.
    pub embedding_dimensions: usize,
    /// Base URL of the generation endpoint.
    pub generation_endpoint: String,
    /// Generation model identifier.
    pub generation_model: String,
    /// Bearer token for both endpoints, if the deployment requires one.
    pub api_key: Option<String>,
    /// Upper bound on a single embedding call.
    pub embed_timeout: Duration,
    /// Upper bound on starting a generation stream and on each stream read.
    pub generation_timeout: Duration,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            embedding_endpoint: "http://localhost:8080".to_string(),
            embedding_model: "amazon.titan-embed-text-v2:0".to_string(),
            embedding_dimensions: 1536,
            generation_endpoint: "http://localhost:8080".to_string(),
            generation_model: "anthropic.claude-3-haiku-20240307-v1:0".to_string(),
            api_key: None,
            embed_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(60),
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 150,
        }
    }
}

/// Persona baked into every generation prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Name the assistant identifies itself by.
    pub assistant_name: String,
    /// Name of the platform the assistant serves.
    pub platform_name: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Lorebot".to_string(),
            platform_name: "Loresmith".to_string(),
        }
    }
}

/// Knobs for the ingestion pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Maximum chunk size in characters. Must exceed `chunk_overlap`.
    pub max_chunk_size: usize,
    /// Characters of overlap between consecutive chunks.
    pub chunk_overlap: usize,
    /// Bounded attempts per chunk embedding (first try included).
    pub max_embed_attempts: u32,
    /// Base delay for exponential backoff between embedding retries.
    pub retry_backoff: Duration,
    /// How long a dequeued job may stay unacknowledged before it is
    /// redelivered.
    pub visibility_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1000,
            chunk_overlap: 100,
            max_embed_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            visibility_timeout: Duration::from_secs(120),
        }
    }
}

/// Knobs for the retrieval planner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of nearest chunks requested from the vector index.
    pub top_k: usize,
    /// Character budget for the assembled context block. Truncation never
    /// splits a chunk.
    pub context_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            context_budget: 6000,
        }
    }
}

/// Complete configuration for a [`crate::service::KnowledgeService`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub provider: ProviderConfig,
    pub persona: PersonaConfig,
    pub ingestion: IngestionConfig,
    pub retrieval: RetrievalConfig,
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Checks cross-field invariants. Called by the builder; call directly
    /// when constructing a config by hand.
    pub fn validate(&self) -> Result<(), LoreError> {
        if self.ingestion.max_chunk_size == 0 {
            return Err(LoreError::Validation(
                "max_chunk_size must be greater than zero".into(),
            ));
        }
        if self.ingestion.chunk_overlap >= self.ingestion.max_chunk_size {
            return Err(LoreError::Validation(format!(
                "chunk_overlap ({}) must be smaller than max_chunk_size ({})",
                self.ingestion.chunk_overlap, self.ingestion.max_chunk_size
            )));
        }
        if self.provider.embedding_dimensions == 0 {
            return Err(LoreError::Validation(
                "embedding_dimensions must be greater than zero".into(),
            ));
        }
        if self.ingestion.max_embed_attempts == 0 {
            return Err(LoreError::Validation(
                "max_embed_attempts must be at least 1".into(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(LoreError::Validation("top_k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.provider.temperature) {
            return Err(LoreError::Validation(format!(
                "temperature {} out of range [0, 1]",
                self.provider.temperature
            )));
        }
        Ok(())
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
    use_env: bool,
}

impl ServiceConfigBuilder {
    /// Enable overrides from `LORESMITH_*` environment variables.
    ///
    /// Recognized keys: `LORESMITH_EMBEDDING_ENDPOINT`,
    /// `LORESMITH_EMBEDDING_MODEL`, `LORESMITH_EMBEDDING_DIMENSIONS`,
    /// `LORESMITH_GENERATION_ENDPOINT`, `LORESMITH_GENERATION_MODEL`,
    /// `LORESMITH_API_KEY`, `LORESMITH_ASSISTANT_NAME`,
    /// `LORESMITH_PLATFORM_NAME`.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    #[must_use]
    pub fn embedding_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.provider.embedding_endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.config.provider.embedding_model = model.into();
        self
    }

    #[must_use]
    pub fn embedding_dimensions(mut self, dims: usize) -> Self {
        self.config.provider.embedding_dimensions = dims;
        self
    }

    #[must_use]
    pub fn generation_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.provider.generation_endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn generation_model(mut self, model: impl Into<String>) -> Self {
        self.config.provider.generation_model = model.into();
        self
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.provider.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn persona(mut self, assistant: impl Into<String>, platform: impl Into<String>) -> Self {
        self.config.persona.assistant_name = assistant.into();
        self.config.persona.platform_name = platform.into();
        self
    }

    #[must_use]
    pub fn chunking(mut self, max_chunk_size: usize, overlap: usize) -> Self {
        self.config.ingestion.max_chunk_size = max_chunk_size;
        self.config.ingestion.chunk_overlap = overlap;
        self
    }

    #[must_use]
    pub fn max_embed_attempts(mut self, attempts: u32) -> Self {
        self.config.ingestion.max_embed_attempts = attempts;
        self
    }

    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.ingestion.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.config.ingestion.visibility_timeout = timeout;
        self
    }

    #[must_use]
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.config.retrieval.top_k = top_k;
        self
    }

    #[must_use]
    pub fn context_budget(mut self, chars: usize) -> Self {
        self.config.retrieval.context_budget = chars;
        self
    }

    /// Build the final configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LoreError::Validation`] when a cross-field invariant is
    /// violated or an environment override cannot be parsed.
    pub fn build(mut self) -> Result<ServiceConfig, LoreError> {
        if self.use_env {
            dotenvy::dotenv().ok();
            self.apply_env()?;
        }
        self.config.validate()?;
        Ok(self.config)
    }

    fn apply_env(&mut self) -> Result<(), LoreError> {
        if let Ok(v) = std::env::var("LORESMITH_EMBEDDING_ENDPOINT") {
            self.config.provider.embedding_endpoint = v;
        }
        if let Ok(v) = std::env::var("LORESMITH_EMBEDDING_MODEL") {
            self.config.provider.embedding_model = v;
        }
        if let Ok(v) = std::env::var("LORESMITH_EMBEDDING_DIMENSIONS") {
            self.config.provider.embedding_dimensions = v.parse().map_err(|_| {
                LoreError::Validation(format!(
                    "LORESMITH_EMBEDDING_DIMENSIONS must be a positive integer, got '{v}'"
                ))
            })?;
        }
        if let Ok(v) = std::env::var("LORESMITH_GENERATION_ENDPOINT") {
            self.config.provider.generation_endpoint = v;
        }
        if let Ok(v) = std::env::var("LORESMITH_GENERATION_MODEL") {
            self.config.provider.generation_model = v;
        }
        if let Ok(v) = std::env::var("LORESMITH_API_KEY") {
            self.config.provider.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("LORESMITH_ASSISTANT_NAME") {
            self.config.persona.assistant_name = v;
        }
        if let Ok(v) = std::env::var("LORESMITH_PLATFORM_NAME") {
            self.config.persona.platform_name = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ServiceConfig::builder().build().unwrap();
        assert_eq!(config.ingestion.max_chunk_size, 1000);
        assert_eq!(config.provider.temperature, 0.2);
        assert_eq!(config.provider.max_tokens, 150);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_size() {
        let err = ServiceConfig::builder().chunking(100, 100).build();
        assert!(matches!(err, Err(LoreError::Validation(_))));
    }

    #[test]
    fn zero_top_k_rejected() {
        let err = ServiceConfig::builder().top_k(0).build();
        assert!(matches!(err, Err(LoreError::Validation(_))));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ServiceConfig::builder()
            .persona("Kiosk", "Atrium")
            .embedding_dimensions(384)
            .build()
            .unwrap();
        assert_eq!(config.persona.assistant_name, "Kiosk");
        assert_eq!(config.provider.embedding_dimensions, 384);
    }
}
