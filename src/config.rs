use std::sync::Arc;
use std::time::Duration;

use crate::compression::Compression;
use crate::limiter::RateLimiter;
use crate::packet::{Identify, ReceivePacket};
use crate::session::SessionStore;

/// Callback invoked for every decoded inbound packet.
///
/// Informational only: the shard ignores anything it does, and packet
/// handling proceeds regardless.
pub type PacketCallback = Arc<dyn Fn(&ReceivePacket) + Send + Sync>;

/// Configuration for a single shard.
///
/// Built through [`ShardConfig::builder`], which validates the shard tuple
/// and timeouts up front so `open` only ever fails for runtime reasons.
pub struct ShardConfig<S> {
    /// Identify payload: token, shard tuple, intents, initial presence.
    pub identify: Identify,
    /// Gateway protocol version, sent as the `v` query parameter.
    pub version: u32,
    /// Session persistence backend.
    pub store: S,
    /// Base gateway URL. Usually discovered by the supervisor; `open`
    /// returns a configuration error when absent.
    pub gateway_url: Option<String>,
    /// Identify gate, shared across every shard in the same identify bucket.
    pub identify_limiter: Arc<RateLimiter>,
    /// Optional observer for every decoded packet.
    pub on_packet: Option<PacketCallback>,
    /// WebSocket dial timeout.
    pub connect_timeout: Duration,
    /// Transport compression to negotiate.
    pub compression: Compression,
}

impl<S: SessionStore> ShardConfig<S> {
    /// Start building a config from the two mandatory pieces.
    pub fn builder(identify: Identify, store: S) -> ShardConfigBuilder<S> {
        ShardConfigBuilder {
            config: ShardConfig {
                identify,
                version: 10,
                store,
                gateway_url: None,
                identify_limiter: Arc::new(RateLimiter::default_identify()),
                on_packet: None,
                connect_timeout: Duration::from_secs(10),
                compression: Compression::default(),
            },
        }
    }
}

impl<S> std::fmt::Debug for ShardConfig<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("shard", &self.identify.shard)
            .field("version", &self.version)
            .field("gateway_url", &self.gateway_url)
            .field("connect_timeout", &self.connect_timeout)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// The identify token is empty.
    #[error("identify token must not be empty")]
    MissingToken,
    /// The shard tuple is inconsistent (zero count, or index >= count).
    #[error("invalid shard tuple [{index}, {count}]: index must be < count")]
    InvalidShard { index: u32, count: u32 },
    /// The connect timeout is zero.
    #[error("connect timeout must be non-zero")]
    ZeroConnectTimeout,
}

/// Builder for [`ShardConfig`].
pub struct ShardConfigBuilder<S> {
    config: ShardConfig<S>,
}

impl<S: SessionStore> ShardConfigBuilder<S> {
    /// Set the gateway protocol version (default 10).
    pub fn version(mut self, version: u32) -> Self {
        self.config.version = version;
        self
    }

    /// Set the base gateway URL.
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    /// Inject a shared identify limiter (default: a private `(1, 5s)` gate).
    pub fn identify_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.config.identify_limiter = limiter;
        self
    }

    /// Observe every decoded inbound packet.
    pub fn on_packet(mut self, callback: impl Fn(&ReceivePacket) + Send + Sync + 'static) -> Self {
        self.config.on_packet = Some(Arc::new(callback));
        self
    }

    /// Set the WebSocket dial timeout (default 10s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Negotiate transport compression (default none).
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ShardConfig<S>, ConfigError> {
        let [index, count] = self.config.identify.shard;
        if count == 0 || index >= count {
            return Err(ConfigError::InvalidShard { index, count });
        }
        if self.config.identify.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.config.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        Ok(self.config)
    }
}
