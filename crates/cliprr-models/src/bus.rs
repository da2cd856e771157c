//! Progress bus message contract.
//!
//! These messages are what external push channels (WebSocket bridges) carry
//! to clients; field names stay camelCase on the wire for compatibility with
//! the existing frontend.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status carried by a `job_update` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobUpdateStatus {
    Processing,
    Completed,
    Failed,
    Active,
    Error,
}

impl JobUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobUpdateStatus::Processing => "processing",
            JobUpdateStatus::Completed => "completed",
            JobUpdateStatus::Failed => "failed",
            JobUpdateStatus::Active => "active",
            JobUpdateStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobUpdateStatus::Completed | JobUpdateStatus::Failed | JobUpdateStatus::Error
        )
    }
}

/// The file a job is currently working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentFile {
    pub file_id: i64,
    pub file_path: String,
    pub episode: i64,
    pub season: i64,
    pub show: String,
}

/// Per-queue counters in a `queue_status` message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Messages published on the progress bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Greeting sent to every new subscriber
    Welcome {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Echo of a sender's raw bytes, stringified
    Echo {
        data: String,
        timestamp: DateTime<Utc>,
    },

    /// Progress or terminal state of one job
    #[serde(rename_all = "camelCase")]
    JobUpdate {
        broker_job_id: String,
        store_job_id: String,
        status: JobUpdateStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fps: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_file: Option<CurrentFile>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Snapshot of all queues
    QueueStatus {
        queues: BTreeMap<String, QueueCounts>,
        timestamp: DateTime<Utc>,
    },

    /// Fine-grained decode progress for one episode file
    #[serde(rename_all = "camelCase")]
    AudioExtractionProgress {
        episode_file_id: i64,
        file_path: String,
        percent: f64,
        status: String,
        timestamp: DateTime<Utc>,
    },
}

impl BusMessage {
    pub fn welcome(message: impl Into<String>) -> Self {
        BusMessage::Welcome {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn echo(data: impl Into<String>) -> Self {
        BusMessage::Echo {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    /// A progress update for a running job.
    pub fn job_progress(
        broker_job_id: impl Into<String>,
        store_job_id: i64,
        progress: u8,
        current_file: Option<CurrentFile>,
    ) -> Self {
        BusMessage::JobUpdate {
            broker_job_id: broker_job_id.into(),
            store_job_id: store_job_id.to_string(),
            status: JobUpdateStatus::Processing,
            progress: Some(progress.min(100)),
            fps: None,
            current_file,
            message: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A terminal update for a job.
    pub fn job_terminal(
        broker_job_id: impl Into<String>,
        store_job_id: i64,
        status: JobUpdateStatus,
        error: Option<String>,
    ) -> Self {
        BusMessage::JobUpdate {
            broker_job_id: broker_job_id.into(),
            store_job_id: store_job_id.to_string(),
            status,
            progress: None,
            fps: None,
            current_file: None,
            message: None,
            error,
            timestamp: Utc::now(),
        }
    }

    pub fn queue_status(queues: BTreeMap<String, QueueCounts>) -> Self {
        BusMessage::QueueStatus {
            queues,
            timestamp: Utc::now(),
        }
    }

    pub fn audio_extraction_progress(
        episode_file_id: i64,
        file_path: impl Into<String>,
        percent: f64,
        status: impl Into<String>,
    ) -> Self {
        BusMessage::AudioExtractionProgress {
            episode_file_id,
            file_path: file_path.into(),
            percent: percent.clamp(0.0, 100.0),
            status: status.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_update_wire_shape() {
        let msg = BusMessage::job_progress(
            "epjob-7",
            7,
            42,
            Some(CurrentFile {
                file_id: 3,
                file_path: "/media/s01e01.mkv".into(),
                episode: 1,
                season: 1,
                show: "Test Show".into(),
            }),
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"job_update\""));
        assert!(json.contains("\"brokerJobId\":\"epjob-7\""));
        assert!(json.contains("\"storeJobId\":\"7\""));
        assert!(json.contains("\"progress\":42"));
        assert!(json.contains("\"filePath\":\"/media/s01e01.mkv\""));
    }

    #[test]
    fn progress_clamps_to_100() {
        let msg = BusMessage::job_progress("epjob-1", 1, 150, None);
        if let BusMessage::JobUpdate { progress, .. } = msg {
            assert_eq!(progress, Some(100));
        } else {
            panic!("expected JobUpdate");
        }
    }

    #[test]
    fn queue_status_wire_shape() {
        let mut queues = BTreeMap::new();
        queues.insert(
            "episode-processing".to_string(),
            QueueCounts {
                waiting: 2,
                active: 1,
                completed: 10,
                failed: 0,
            },
        );
        let json = serde_json::to_string(&BusMessage::queue_status(queues)).unwrap();
        assert!(json.contains("\"type\":\"queue_status\""));
        assert!(json.contains("\"episode-processing\":{\"waiting\":2"));
    }

    #[test]
    fn extraction_progress_round_trip() {
        let msg = BusMessage::audio_extraction_progress(9, "/m/e.mkv", 55.5, "decoding");
        let json = serde_json::to_string(&msg).unwrap();
        let back: BusMessage = serde_json::from_str(&json).unwrap();
        if let BusMessage::AudioExtractionProgress {
            episode_file_id,
            percent,
            ..
        } = back
        {
            assert_eq!(episode_file_id, 9);
            assert!((percent - 55.5).abs() < f64::EPSILON);
        } else {
            panic!("expected AudioExtractionProgress");
        }
    }
}
