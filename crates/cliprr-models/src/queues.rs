//! Queue definitions: names, priorities, retry policy, timeouts.

use serde::{Deserialize, Serialize};

/// The six processing queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    EpisodeProcessing,
    AudioExtraction,
    Fingerprinting,
    Detection,
    Trimming,
    Cleanup,
}

/// Which worker limit drives a queue's concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencySource {
    /// `cpu_worker_limit`
    Cpu,
    /// `min(cpu_worker_limit, cap)`
    CpuCapped(usize),
    /// `gpu_worker_limit`
    Gpu,
    /// Fixed concurrency
    Fixed(usize),
}

/// Static per-queue policy.
#[derive(Debug, Clone, Copy)]
pub struct QueueSpec {
    pub name: QueueName,
    /// Higher runs earlier when jobs compete inside one queue
    pub priority: i64,
    pub concurrency: ConcurrencySource,
    /// Total attempts before a job lands in `failed`
    pub attempts: u32,
    /// Base for exponential backoff, in milliseconds
    pub backoff_ms: u64,
    /// Per-job visibility timeout, in milliseconds
    pub timeout_ms: u64,
}

/// Queues paused together when CPU-bound work must stop.
pub const PAUSE_GROUP_CPU: [QueueName; 4] = [
    QueueName::EpisodeProcessing,
    QueueName::AudioExtraction,
    QueueName::Fingerprinting,
    QueueName::Detection,
];

/// Queues paused together when GPU-bound work must stop.
pub const PAUSE_GROUP_GPU: [QueueName; 1] = [QueueName::Trimming];

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::EpisodeProcessing,
        QueueName::AudioExtraction,
        QueueName::Fingerprinting,
        QueueName::Detection,
        QueueName::Trimming,
        QueueName::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::EpisodeProcessing => "episode-processing",
            QueueName::AudioExtraction => "audio-extraction",
            QueueName::Fingerprinting => "fingerprinting",
            QueueName::Detection => "detection",
            QueueName::Trimming => "trimming",
            QueueName::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "episode-processing" => Some(QueueName::EpisodeProcessing),
            "audio-extraction" => Some(QueueName::AudioExtraction),
            "fingerprinting" => Some(QueueName::Fingerprinting),
            "detection" => Some(QueueName::Detection),
            "trimming" => Some(QueueName::Trimming),
            "cleanup" => Some(QueueName::Cleanup),
            _ => None,
        }
    }

    /// The static policy for this queue.
    pub fn spec(&self) -> QueueSpec {
        match self {
            QueueName::EpisodeProcessing => QueueSpec {
                name: *self,
                priority: 10,
                concurrency: ConcurrencySource::Cpu,
                attempts: 3,
                backoff_ms: 5000,
                timeout_ms: 300_000,
            },
            QueueName::AudioExtraction => QueueSpec {
                name: *self,
                priority: 5,
                concurrency: ConcurrencySource::Cpu,
                attempts: 2,
                backoff_ms: 3000,
                timeout_ms: 120_000,
            },
            QueueName::Fingerprinting => QueueSpec {
                name: *self,
                priority: 3,
                concurrency: ConcurrencySource::Cpu,
                attempts: 2,
                backoff_ms: 2000,
                timeout_ms: 180_000,
            },
            QueueName::Detection => QueueSpec {
                name: *self,
                priority: 2,
                concurrency: ConcurrencySource::CpuCapped(4),
                attempts: 1,
                backoff_ms: 1000,
                timeout_ms: 60_000,
            },
            QueueName::Trimming => QueueSpec {
                name: *self,
                priority: 1,
                concurrency: ConcurrencySource::Gpu,
                attempts: 1,
                backoff_ms: 1000,
                timeout_ms: 120_000,
            },
            QueueName::Cleanup => QueueSpec {
                name: *self,
                priority: 0,
                concurrency: ConcurrencySource::Fixed(1),
                attempts: 1,
                backoff_ms: 1000,
                timeout_ms: 60_000,
            },
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl QueueSpec {
    /// Exponential backoff delay for a given (1-based) attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        self.backoff_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
    }

    /// Resolve concurrency given the configured worker limits.
    pub fn resolve_concurrency(&self, cpu_limit: usize, gpu_limit: usize) -> usize {
        match self.concurrency {
            ConcurrencySource::Cpu => cpu_limit.max(1),
            ConcurrencySource::CpuCapped(cap) => cpu_limit.min(cap).max(1),
            ConcurrencySource::Gpu => gpu_limit.max(1),
            ConcurrencySource::Fixed(n) => n.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_round_trip() {
        for q in QueueName::ALL {
            assert_eq!(QueueName::parse(q.as_str()), Some(q));
        }
        assert_eq!(QueueName::parse("unknown"), None);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let spec = QueueName::EpisodeProcessing.spec();
        assert_eq!(spec.backoff_for_attempt(1), 5000);
        assert_eq!(spec.backoff_for_attempt(2), 10000);
        assert_eq!(spec.backoff_for_attempt(3), 20000);
    }

    #[test]
    fn detection_concurrency_is_capped_at_four() {
        let spec = QueueName::Detection.spec();
        assert_eq!(spec.resolve_concurrency(16, 1), 4);
        assert_eq!(spec.resolve_concurrency(2, 1), 2);
    }

    #[test]
    fn cleanup_serializes_with_itself() {
        let spec = QueueName::Cleanup.spec();
        assert_eq!(spec.resolve_concurrency(16, 8), 1);
    }
}
