use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_THREADS: usize = 4;
const DEFAULT_STAGGER_DELAY_MS: u64 = 100;
const DEFAULT_RETRY_COUNT: usize = 3;
const DEFAULT_RETRY_COUNT_AGGRESSIVE: usize = 12;

/// Knobs of the download engine. Loading them is up to the embedding program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers per round.
    pub thread_count: usize,
    /// Pause between starting two workers.
    pub stagger_delay_ms: u64,
    /// Round bound in normal mode.
    pub retry_count: usize,
    /// Round bound in aggressive mode.
    pub retry_count_aggressive: usize,
    pub aggressive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREADS,
            stagger_delay_ms: DEFAULT_STAGGER_DELAY_MS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_count_aggressive: DEFAULT_RETRY_COUNT_AGGRESSIVE,
            aggressive: false,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The round bound that applies in the configured mode, at least one.
    pub fn rounds(&self) -> usize {
        let rounds = if self.aggressive {
            self.retry_count_aggressive
        } else {
            self.retry_count
        };
        if rounds == 0 {
            tracing::warn!("round count of 0 configured, running a single round");
        }
        rounds.max(1)
    }

    /// Worker count, at least one.
    pub fn threads(&self) -> usize {
        if self.thread_count == 0 {
            tracing::warn!("thread count of 0 configured, using a single worker");
        }
        self.thread_count.max(1)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }
}

pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn threads(mut self, thread_count: usize) -> Self {
        self.config.thread_count = thread_count;
        self
    }

    pub fn stagger_delay(mut self, delay: Duration) -> Self {
        self.config.stagger_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn retries(mut self, normal: usize, aggressive: usize) -> Self {
        self.config.retry_count = normal;
        self.config.retry_count_aggressive = aggressive;
        self
    }

    pub fn aggressive(mut self, aggressive: bool) -> Self {
        self.config.aggressive = aggressive;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
