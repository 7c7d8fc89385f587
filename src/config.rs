use crate::error::CacheError;

/// Runtime configuration shared by every query cache on a server.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Largest array a sequence or grouped result may materialize into.
    pub array_limit: usize,
    pub batch_max_rows: usize,
    pub batch_max_bytes: usize,
    pub batch_max_duration_ms: u64,
    /// Divisor applied to row/byte/time limits for the first batch of a
    /// stream so the client sees data quickly.
    pub first_batch_scaledown: usize,
    /// Default for connections that do not negotiate the behaviour
    /// themselves.
    pub return_empty_normal_batches: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            array_limit: 100_000,
            batch_max_rows: 1_000,
            batch_max_bytes: 1024 * 1024,
            batch_max_duration_ms: 500,
            first_batch_scaledown: 4,
            return_empty_normal_batches: false,
        }
    }
}

impl CacheConfig {
    pub fn development() -> Self {
        Self {
            array_limit: 10_000,
            batch_max_rows: 100,
            ..Self::default()
        }
    }

    /// Smaller, faster batches for interactive clients.
    pub fn low_latency() -> Self {
        Self {
            batch_max_rows: 256,
            batch_max_bytes: 256 * 1024,
            batch_max_duration_ms: 50,
            first_batch_scaledown: 8,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.array_limit == 0 {
            return Err(CacheError::InvalidConfig {
                message: "array_limit must be > 0".into(),
            });
        }
        if self.batch_max_rows == 0 {
            return Err(CacheError::InvalidConfig {
                message: "batch_max_rows must be > 0".into(),
            });
        }
        if self.batch_max_bytes == 0 {
            return Err(CacheError::InvalidConfig {
                message: "batch_max_bytes must be > 0".into(),
            });
        }
        if self.batch_max_duration_ms == 0 {
            return Err(CacheError::InvalidConfig {
                message: "batch_max_duration_ms must be > 0".into(),
            });
        }
        if self.first_batch_scaledown == 0 || self.first_batch_scaledown > self.batch_max_rows {
            return Err(CacheError::InvalidConfig {
                message: "first_batch_scaledown must be > 0 and <= batch_max_rows".into(),
            });
        }
        Ok(())
    }
}
