use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Returned when a wait is abandoned because its interruptor fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupted")
    }
}

impl std::error::Error for Interrupted {}

impl From<Interrupted> for crate::error::CacheError {
    fn from(_: Interrupted) -> Self {
        crate::error::CacheError::Interrupted
    }
}

/// Drives `fut` to completion unless `interruptor` fires first. An
/// interruptor that has already fired wins without polling `fut`.
pub async fn wait_interruptible<F>(
    fut: F,
    interruptor: &CancellationToken,
) -> Result<F::Output, Interrupted>
where
    F: Future,
{
    if interruptor.is_cancelled() {
        return Err(Interrupted);
    }
    tokio::select! {
        biased;
        _ = interruptor.cancelled() => Err(Interrupted),
        out = fut => Ok(out),
    }
}

/// Logical OR of the connection interruptor and one query's own
/// interruptor. Each side is owned and pulsed independently.
#[derive(Debug, Clone)]
pub struct CombinedInterruptor {
    connection: CancellationToken,
    query: CancellationToken,
}

impl CombinedInterruptor {
    pub fn new(connection: CancellationToken, query: CancellationToken) -> Self {
        Self { connection, query }
    }

    pub fn is_cancelled(&self) -> bool {
        self.connection.is_cancelled() || self.query.is_cancelled()
    }

    pub fn connection_pulsed(&self) -> bool {
        self.connection.is_cancelled()
    }

    pub fn query_pulsed(&self) -> bool {
        self.query.is_cancelled()
    }

    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.connection.cancelled() => {}
            _ = self.query.cancelled() => {}
        }
    }

    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Interrupted),
            out = fut => Ok(out),
        }
    }
}
