//! Queued job payloads, broker ids, and enqueue-time validation.

use serde::{Deserialize, Serialize};

use cliprr_models::{broker_job_id, QueueName};

use crate::error::{QueueError, QueueResult};

/// `storeJobId` travels as a string containing an integer (wire compat with
/// the existing frontend); both plain integers and digit strings are
/// accepted, anything else is a validation error.
mod string_int {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        struct IntOrString;

        impl Visitor<'_> for IntOrString {
            type Value = i64;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an integer or a string containing an integer")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
                Ok(v)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
                i64::try_from(v).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
                v.parse().map_err(|_| E::custom(format!("not numeric: {v}")))
            }
        }

        d.deserialize_any(IntOrString)
    }
}

/// Payload of the per-episode stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeJob {
    #[serde(with = "string_int")]
    pub store_job_id: i64,
    pub episode_file_id: i64,
}

/// Payload of a season detection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionJob {
    #[serde(with = "string_int")]
    pub store_job_id: i64,
    pub show_id: i64,
    pub season_number: i64,
}

/// Payload of a trim run for a verified job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimJob {
    #[serde(with = "string_int")]
    pub store_job_id: i64,
    pub episode_file_id: i64,
}

/// What a cleanup run removes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CleanupOp {
    /// Delete specific jobs, or everything when `all` is set
    #[serde(rename_all = "camelCase")]
    DeleteJobs {
        #[serde(default)]
        job_ids: Vec<i64>,
        #[serde(default)]
        all: bool,
    },
    /// Delete shows and every queue entry referencing their jobs
    #[serde(rename_all = "camelCase")]
    DeleteShows { show_ids: Vec<i64> },
}

/// Payload of a cleanup run. `token` makes the broker id unique per request
/// so repeated cleanups do not absorb each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupJob {
    #[serde(with = "string_int")]
    pub store_job_id: i64,
    pub token: String,
    #[serde(flatten)]
    pub op: CleanupOp,
}

impl CleanupJob {
    pub fn new(op: CleanupOp) -> Self {
        Self {
            store_job_id: 0,
            token: uuid::Uuid::new_v4().to_string(),
            op,
        }
    }
}

/// The tagged union the worker dispatches on. One variant per queue; no
/// subclass polymorphism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedJob {
    EpisodeProcessing(EpisodeJob),
    AudioExtraction(EpisodeJob),
    Fingerprinting(EpisodeJob),
    Detection(DetectionJob),
    Trimming(TrimJob),
    Cleanup(CleanupJob),
}

impl QueuedJob {
    /// The queue this job belongs to.
    pub fn queue(&self) -> QueueName {
        match self {
            QueuedJob::EpisodeProcessing(_) => QueueName::EpisodeProcessing,
            QueuedJob::AudioExtraction(_) => QueueName::AudioExtraction,
            QueuedJob::Fingerprinting(_) => QueueName::Fingerprinting,
            QueuedJob::Detection(_) => QueueName::Detection,
            QueuedJob::Trimming(_) => QueueName::Trimming,
            QueuedJob::Cleanup(_) => QueueName::Cleanup,
        }
    }

    /// The store job id every payload must carry.
    pub fn store_job_id(&self) -> i64 {
        match self {
            QueuedJob::EpisodeProcessing(j) => j.store_job_id,
            QueuedJob::AudioExtraction(j) => j.store_job_id,
            QueuedJob::Fingerprinting(j) => j.store_job_id,
            QueuedJob::Detection(j) => j.store_job_id,
            QueuedJob::Trimming(j) => j.store_job_id,
            QueuedJob::Cleanup(j) => j.store_job_id,
        }
    }

    /// The stable broker id used for reconciliation and deletion.
    pub fn broker_id(&self) -> String {
        match self {
            QueuedJob::EpisodeProcessing(j) => broker_job_id(j.store_job_id),
            QueuedJob::AudioExtraction(j) => format!("audio-{}", j.store_job_id),
            QueuedJob::Fingerprinting(j) => format!("fp-{}", j.store_job_id),
            QueuedJob::Detection(j) => format!("detect-{}-s{}", j.show_id, j.season_number),
            QueuedJob::Trimming(j) => format!("trim-{}", j.store_job_id),
            QueuedJob::Cleanup(j) => format!("cleanup-{}", j.token),
        }
    }

    /// Parse and validate a raw payload for a queue, as the enqueue surface
    /// receives it. Missing or non-numeric `storeJobId`/`episodeFileId`
    /// fields are rejected before anything is written.
    pub fn from_payload(queue: QueueName, payload: serde_json::Value) -> QueueResult<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| QueueError::validation("payload must be a JSON object"))?;

        require_numeric(obj, "storeJobId")?;
        if matches!(
            queue,
            QueueName::EpisodeProcessing
                | QueueName::AudioExtraction
                | QueueName::Fingerprinting
                | QueueName::Trimming
        ) {
            require_numeric(obj, "episodeFileId")?;
        }

        let job = match queue {
            QueueName::EpisodeProcessing => {
                QueuedJob::EpisodeProcessing(parse_payload(payload)?)
            }
            QueueName::AudioExtraction => QueuedJob::AudioExtraction(parse_payload(payload)?),
            QueueName::Fingerprinting => QueuedJob::Fingerprinting(parse_payload(payload)?),
            QueueName::Detection => QueuedJob::Detection(parse_payload(payload)?),
            QueueName::Trimming => QueuedJob::Trimming(parse_payload(payload)?),
            QueueName::Cleanup => QueuedJob::Cleanup(parse_payload(payload)?),
        };
        Ok(job)
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> QueueResult<T> {
    serde_json::from_value(payload).map_err(|e| QueueError::validation(e.to_string()))
}

fn require_numeric(
    obj: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> QueueResult<()> {
    let value = obj
        .get(field)
        .ok_or_else(|| QueueError::validation(format!("missing {field}")))?;
    let ok = match value {
        serde_json::Value::Number(n) => n.is_i64() || n.is_u64(),
        serde_json::Value::String(s) => s.parse::<i64>().is_ok(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(QueueError::validation(format!("{field} is not numeric")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn episode_payload_round_trips_with_string_store_id() {
        let job = QueuedJob::EpisodeProcessing(EpisodeJob {
            store_job_id: 42,
            episode_file_id: 7,
        });
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"storeJobId\":\"42\""));
        assert!(json.contains("\"episodeFileId\":7"));

        let back: QueuedJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn broker_ids_are_stable() {
        let job = QueuedJob::EpisodeProcessing(EpisodeJob {
            store_job_id: 42,
            episode_file_id: 7,
        });
        assert_eq!(job.broker_id(), "epjob-42");

        let detect = QueuedJob::Detection(DetectionJob {
            store_job_id: 42,
            show_id: 3,
            season_number: 2,
        });
        assert_eq!(detect.broker_id(), "detect-3-s2");
    }

    #[test]
    fn non_numeric_episode_file_id_is_rejected() {
        let err = QueuedJob::from_payload(
            QueueName::EpisodeProcessing,
            json!({"episodeFileId": "seven", "storeJobId": "1"}),
        )
        .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[test]
    fn missing_store_job_id_is_rejected_on_every_queue() {
        for queue in QueueName::ALL {
            let err = QueuedJob::from_payload(queue, json!({"episodeFileId": 7})).unwrap_err();
            assert!(matches!(err, QueueError::Validation(_)), "queue {queue}");
        }
    }

    #[test]
    fn valid_payload_parses() {
        let job = QueuedJob::from_payload(
            QueueName::EpisodeProcessing,
            json!({"episodeFileId": 7, "storeJobId": "42"}),
        )
        .unwrap();
        assert_eq!(job.store_job_id(), 42);
        assert_eq!(job.queue(), QueueName::EpisodeProcessing);
    }

    #[test]
    fn cleanup_op_serde() {
        let job = QueuedJob::Cleanup(CleanupJob {
            store_job_id: 0,
            token: "t0".into(),
            op: CleanupOp::DeleteJobs {
                job_ids: vec![],
                all: true,
            },
        });
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"op\":\"delete_jobs\""));
        assert!(json.contains("\"all\":true"));
        let back: QueuedJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
