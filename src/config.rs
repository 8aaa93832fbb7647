//! Tunables for stage buffering and batching.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FlowResult};
use crate::{bail, flow_error};

/// Default number of records accumulated before a destination write.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default capacity of the bounded channel feeding each stage.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Batching configuration for destinations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum number of records per batch. Must be greater than zero.
    pub max_size: usize,
}

impl BatchConfig {
    /// Creates a validated batch configuration.
    pub fn new(max_size: usize) -> FlowResult<Self> {
        if max_size == 0 {
            bail!(
                ErrorKind::ConfigError,
                "Batch size must be greater than zero"
            );
        }

        Ok(Self { max_size })
    }

    /// Returns an error if the configuration was built with an invalid size.
    pub(crate) fn validate(&self) -> FlowResult<()> {
        if self.max_size == 0 {
            return Err(flow_error!(
                ErrorKind::ConfigError,
                "Batch size must be greater than zero"
            ));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(BatchConfig::new(0).is_err());
        assert!(BatchConfig::new(1).is_ok());
    }

    #[test]
    fn default_batch_size_is_valid() {
        assert!(BatchConfig::default().validate().is_ok());
    }
}
