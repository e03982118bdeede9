//! Node configuration: send retry backoff and runtime knobs.

use std::{future::Future, time::Duration};

use rand::Rng;

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a given retry count with jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(retries.cast_signed());
        let capped = base.min(self.max.as_secs_f64());
        // Add jitter: 50% to 150% of the base duration
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Sleep function trait for testing with different runtimes (tokio vs turmoil)
pub trait Sleep: Clone + Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-based sleep implementation
#[derive(Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Runtime configuration for a [`crate::MutexNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Backoff between connect/send retries to one peer.
    pub backoff: BackoffConfig,
    /// Attempts before a send to one peer is abandoned.
    pub max_send_attempts: u32,
    /// Seed for the jitter RNG (deterministic in simulation tests).
    pub rng_seed: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_send_attempts: 8,
            rng_seed: 0,
        }
    }
}
