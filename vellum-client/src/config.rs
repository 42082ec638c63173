//! Client configuration types and builders.

use std::time::Duration;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);
/// Default minimum payload size before compression is attempted.
const DEFAULT_COMPRESSION_MIN_SIZE: usize = 32;
/// Default maximum accepted compressed/original ratio.
const DEFAULT_COMPRESSION_MIN_RATIO: f64 = 0.83;

/// Configuration for outgoing payload compression.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    enabled: bool,
    min_size: usize,
    min_ratio: f64,
}

impl CompressionConfig {
    /// Creates a builder for compression settings.
    pub fn builder() -> CompressionConfigBuilder {
        CompressionConfigBuilder::default()
    }

    /// Returns true if compression is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the minimum payload size before compression is attempted.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Returns the maximum accepted compressed/original size ratio.
    pub fn min_ratio(&self) -> f64 {
        self.min_ratio
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: DEFAULT_COMPRESSION_MIN_SIZE,
            min_ratio: DEFAULT_COMPRESSION_MIN_RATIO,
        }
    }
}

/// Builder for `CompressionConfig`.
#[derive(Debug, Clone, Default)]
pub struct CompressionConfigBuilder {
    enabled: Option<bool>,
    min_size: Option<usize>,
    min_ratio: Option<f64>,
}

impl CompressionConfigBuilder {
    /// Enables or disables compression.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Sets the minimum payload size before compression is attempted.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = Some(min_size);
        self
    }

    /// Sets the maximum accepted compressed/original size ratio.
    pub fn min_ratio(mut self, min_ratio: f64) -> Self {
        self.min_ratio = Some(min_ratio);
        self
    }

    /// Builds the compression configuration.
    pub fn build(self) -> CompressionConfig {
        let defaults = CompressionConfig::default();
        CompressionConfig {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            min_size: self.min_size.unwrap_or(defaults.min_size),
            min_ratio: self.min_ratio.unwrap_or(defaults.min_ratio),
        }
    }
}

/// Negotiated per-connection state consulted while encoding and decoding.
///
/// Stands in for the feature set the server advertised during the hello
/// exchange; topology discovery (an external collaborator) owns producing
/// it.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    bucket: String,
    collections_enabled: bool,
    mutation_tokens_enabled: bool,
    sync_replication_enabled: bool,
    compression: CompressionConfig,
}

impl ConnectionContext {
    /// Creates a builder for a connection context against a bucket.
    pub fn builder(bucket: impl Into<String>) -> ConnectionContextBuilder {
        ConnectionContextBuilder {
            bucket: bucket.into(),
            collections_enabled: false,
            mutation_tokens_enabled: false,
            sync_replication_enabled: false,
            compression: CompressionConfig::default(),
        }
    }

    /// Returns the bucket this connection is scoped to.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Returns true if collection-prefixed keys are in effect.
    pub fn collections_enabled(&self) -> bool {
        self.collections_enabled
    }

    /// Returns true if mutation tokens were negotiated.
    pub fn mutation_tokens_enabled(&self) -> bool {
        self.mutation_tokens_enabled
    }

    /// Returns true if the server supports synchronous replication.
    pub fn sync_replication_enabled(&self) -> bool {
        self.sync_replication_enabled
    }

    /// Returns the compression settings for this connection.
    pub fn compression(&self) -> &CompressionConfig {
        &self.compression
    }
}

/// Builder for `ConnectionContext`.
#[derive(Debug, Clone)]
pub struct ConnectionContextBuilder {
    bucket: String,
    collections_enabled: bool,
    mutation_tokens_enabled: bool,
    sync_replication_enabled: bool,
    compression: CompressionConfig,
}

impl ConnectionContextBuilder {
    /// Enables collection-prefixed keys.
    pub fn collections_enabled(mut self, enabled: bool) -> Self {
        self.collections_enabled = enabled;
        self
    }

    /// Enables mutation tokens on responses.
    pub fn mutation_tokens_enabled(mut self, enabled: bool) -> Self {
        self.mutation_tokens_enabled = enabled;
        self
    }

    /// Enables synchronous replication framing.
    pub fn sync_replication_enabled(mut self, enabled: bool) -> Self {
        self.sync_replication_enabled = enabled;
        self
    }

    /// Configures compression using a builder function.
    pub fn compression<F>(mut self, f: F) -> Self
    where
        F: FnOnce(CompressionConfigBuilder) -> CompressionConfigBuilder,
    {
        self.compression = f(CompressionConfigBuilder::default()).build();
        self
    }

    /// Builds the connection context.
    pub fn build(self) -> ConnectionContext {
        ConnectionContext {
            bucket: self.bucket,
            collections_enabled: self.collections_enabled,
            mutation_tokens_enabled: self.mutation_tokens_enabled,
            sync_replication_enabled: self.sync_replication_enabled,
            compression: self.compression,
        }
    }
}

/// Returns the default per-request timeout.
pub fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}
