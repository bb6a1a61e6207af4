use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use eyre::Result;
use tokio::{
    signal,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested by the OS (SIGTERM, SIGINT)
    Graceful,
    /// The owning server was closed programmatically
    Close,
    /// Force shutdown (timeout exceeded)
    Force,
}

/// Owns the single process-wide shutdown token.
///
/// The token is triggered at most once; every [`ShutdownToken`] handed out
/// observes the same trigger, including tokens created after the fact.
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
    /// Maximum time to wait for in-flight connections once triggered
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new GracefulShutdown manager with custom timeout
    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            shutdown_timeout,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown. Returns `false` when it had already been triggered.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason).is_ok() {
            tracing::info!("Shutdown triggered: {:?}", reason);
            self.token.cancel();
            true
        } else {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
            false
        }
    }

    /// Start listening for OS signals and trigger shutdown on the first one
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started. Listening for SIGTERM and SIGINT");

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                self.trigger_shutdown(ShutdownReason::Graceful);
            }
            result = wait_for_sigterm() => {
                result?;
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                self.trigger_shutdown(ShutdownReason::Graceful);
            }
            _ = self.token.cancelled() => {}
        }

        tracing::info!("Signal handler shutting down");
        Ok(())
    }

    /// Wait indefinitely for the shutdown trigger
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.shutdown_token().wait_for_shutdown().await
    }

    /// Create a read-only handle observing this manager's trigger
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            token: self.token.clone(),
            reason: self.reason.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> std::io::Result<()> {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<std::io::Result<()>>().await
}

/// Observer side of the shutdown trigger. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownToken {
    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason recorded by the trigger, if it already fired
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Resolves once shutdown is triggered
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Wait for the trigger and report its reason
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Force)
    }
}

/// Which of the composed signals fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Shutdown,
    Timeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "shutdown"),
            CancelReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// First-of-N cancellation: the shutdown token or a deadline, whichever
/// fires first. The deadline is fixed when the signal is built, not when it
/// is first awaited.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    shutdown: ShutdownToken,
    deadline: Option<Instant>,
}

impl CancelSignal {
    /// Only the shutdown token; never times out.
    pub fn shutdown_only(shutdown: ShutdownToken) -> Self {
        Self {
            shutdown,
            deadline: None,
        }
    }

    /// Shutdown OR a timer of `timeout` started now.
    pub fn any(shutdown: ShutdownToken, timeout: Duration) -> Self {
        Self {
            shutdown,
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// The signal that has already fired, if any. Shutdown wins ties.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.shutdown.is_shutdown_initiated() {
            return Some(CancelReason::Shutdown);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::Timeout),
            _ => None,
        }
    }

    /// Resolves with whichever signal fires first.
    pub async fn fired(&self) -> CancelReason {
        let timer = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => CancelReason::Shutdown,
            _ = timer => CancelReason::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert_eq!(shutdown.shutdown_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_trigger_only_once() {
        let shutdown = GracefulShutdown::new();

        assert!(shutdown.trigger_shutdown(ShutdownReason::Close));
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Graceful));
        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(
            shutdown.shutdown_token().reason(),
            Some(ShutdownReason::Close)
        );
    }

    #[tokio::test]
    async fn test_token_created_after_trigger_observes_it() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Graceful);

        let token = shutdown.shutdown_token();
        assert!(token.is_shutdown_initiated());
        assert_eq!(token.wait_for_shutdown().await, ShutdownReason::Graceful);
    }

    #[tokio::test]
    async fn test_multiple_observers() {
        let shutdown = GracefulShutdown::new();
        let first = shutdown.shutdown_token();
        let second = first.clone();

        let waiter = tokio::spawn(async move { second.wait_for_shutdown().await });
        shutdown.trigger_shutdown(ShutdownReason::Close);

        assert_eq!(waiter.await.unwrap(), ShutdownReason::Close);
        assert!(first.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn test_cancel_signal_times_out() {
        let shutdown = GracefulShutdown::new();
        let signal = CancelSignal::any(shutdown.shutdown_token(), Duration::from_millis(20));

        assert_eq!(signal.reason(), None);
        assert_eq!(signal.fired().await, CancelReason::Timeout);
        assert_eq!(signal.reason(), Some(CancelReason::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_signal_prefers_shutdown() {
        let shutdown = GracefulShutdown::new();
        let signal = CancelSignal::any(shutdown.shutdown_token(), Duration::from_secs(60));

        shutdown.trigger_shutdown(ShutdownReason::Close);
        assert_eq!(signal.reason(), Some(CancelReason::Shutdown));
        assert_eq!(signal.fired().await, CancelReason::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_only_signal_waits_for_trigger() {
        let shutdown = GracefulShutdown::new();
        let signal = CancelSignal::shutdown_only(shutdown.shutdown_token());

        let pending =
            tokio::time::timeout(Duration::from_millis(20), signal.fired()).await;
        assert!(pending.is_err());

        shutdown.trigger_shutdown(ShutdownReason::Graceful);
        assert_eq!(signal.fired().await, CancelReason::Shutdown);
    }
}
