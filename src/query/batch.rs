use crate::config::CacheConfig;
use crate::response::ResponseNote;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    /// First batch of a stream; limits are scaled down so the client sees
    /// data quickly.
    NormalFirst,
    Normal,
}

/// Limits a stream should respect while producing one batch. A stream may
/// return fewer rows; it should not return more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpec {
    pub batch_type: BatchType,
    pub max_rows: usize,
    pub max_bytes: usize,
    pub max_duration: Duration,
}

impl BatchSpec {
    pub fn user(batch_type: BatchType, config: &CacheConfig) -> Self {
        let divisor = match batch_type {
            BatchType::NormalFirst => config.first_batch_scaledown.max(1),
            BatchType::Normal => 1,
        };
        Self {
            batch_type,
            max_rows: (config.batch_max_rows / divisor).max(1),
            max_bytes: (config.batch_max_bytes / divisor).max(1),
            max_duration: Duration::from_millis(
                (config.batch_max_duration_ms / divisor as u64).max(1),
            ),
        }
    }
}

/// Changefeed category of a stream. Anything but `NotFeed` may legitimately
/// produce empty batches without being exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedType {
    NotFeed,
    Stream,
    Point,
    OrderByLimit,
    Unioned,
}

impl FeedType {
    pub fn is_feed(self) -> bool {
        !matches!(self, FeedType::NotFeed)
    }

    pub fn note(self) -> Option<ResponseNote> {
        match self {
            FeedType::NotFeed => None,
            FeedType::Stream => Some(ResponseNote::SequenceFeed),
            FeedType::Point => Some(ResponseNote::AtomFeed),
            FeedType::OrderByLimit => Some(ResponseNote::OrderByLimitFeed),
            FeedType::Unioned => Some(ResponseNote::UnionedFeed),
        }
    }
}
