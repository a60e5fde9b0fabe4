//! Ring buffer construction settings.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::sequencer::{self, MultiProducerSequencer, Sequencer, SingleProducerSequencer};
use super::wait_strategy::{WaitStrategy, WaitStrategyKind};

/// How many threads may publish to a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerType {
    Single,
    #[default]
    Multi,
}

impl ProducerType {
    /// Creates the matching sequencer.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for an unsupported buffer size.
    pub fn sequencer(
        self,
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Arc<dyn Sequencer>, ConfigError> {
        Ok(match self {
            Self::Single => Arc::new(SingleProducerSequencer::new(buffer_size, wait_strategy)?),
            Self::Multi => Arc::new(MultiProducerSequencer::new(buffer_size, wait_strategy)?),
        })
    }
}

/// Ring buffer construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferConfig {
    /// Number of slots; a power of two.
    pub buffer_size: usize,
    pub producer_type: ProducerType,
    pub wait_strategy: WaitStrategyKind,
    /// Deadline for `timeout-blocking`, ignored by the other strategies.
    pub wait_timeout_ms: u64,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            producer_type: ProducerType::Multi,
            wait_strategy: WaitStrategyKind::Blocking,
            wait_timeout_ms: 1000,
        }
    }
}

impl RingBufferConfig {
    /// # Errors
    ///
    /// [`ConfigError`] if `buffer_size` is not a supported power of two.
    pub fn validate(&self) -> Result<(), ConfigError> {
        sequencer::validate_buffer_size(self.buffer_size)
    }

    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    #[must_use]
    pub fn build_wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        self.wait_strategy.build(self.wait_timeout())
    }

    /// Validates the config and creates its sequencer.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if validation fails.
    pub fn build_sequencer(&self) -> Result<Arc<dyn Sequencer>, ConfigError> {
        self.validate()?;
        self.producer_type
            .sequencer(self.buffer_size, self.build_wait_strategy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RingBufferConfig::default();
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.producer_type, ProducerType::Multi);
        assert_eq!(config.wait_strategy, WaitStrategyKind::Blocking);
        assert_eq!(config.wait_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: RingBufferConfig =
            serde_json::from_str(r#"{"buffer_size": 64, "producer_type": "single"}"#).unwrap();
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.producer_type, ProducerType::Single);
        assert_eq!(config.wait_strategy, WaitStrategyKind::Blocking);
        assert_eq!(config.wait_timeout_ms, 1000);
    }

    #[test]
    fn test_build_sequencer_validates() {
        let config = RingBufferConfig {
            buffer_size: 100,
            ..RingBufferConfig::default()
        };
        assert!(matches!(
            config.build_sequencer(),
            Err(ConfigError::BufferSizeNotPowerOfTwo(100))
        ));

        let config = RingBufferConfig {
            buffer_size: 16,
            producer_type: ProducerType::Single,
            ..RingBufferConfig::default()
        };
        let sequencer = config.build_sequencer().unwrap();
        assert_eq!(sequencer.buffer_size(), 16);
    }
}
