use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod agents;
pub mod api;
pub mod db;
pub mod fallback;
pub mod orchestrator;
pub mod queue;
pub mod ratelimit;
pub mod telemetry;
pub mod testing;
pub mod worker;

/// Lifecycle of one profiling job.
///
/// Transitions are one-directional: pending -> processing -> completed | failed,
/// with the single edge pending -> failed for submissions that die before any
/// processing. Terminal rows are never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "profiling_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Queue message lifecycle. LOCKED rows left behind by a crashed run are reset
/// to QUEUED on startup, giving at-least-once delivery across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_status_enum", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Queued,
    Locked,
    Dead,
}

/// The person being profiled, as distinct from the platform user submitting
/// the request. Field names follow the platform's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilingTarget {
    #[serde(default)]
    pub id: Option<String>,
    pub nome: String,
    pub cognome: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub telefono: Option<String>,
    #[serde(default)]
    pub citta: Option<String>,
    #[serde(default)]
    pub professione: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub consenso_profilazione: bool,
    #[serde(default)]
    pub data_consenso: Option<NaiveDate>,
}

impl ProfilingTarget {
    /// Consent is a hard legal gate: flag plus a recorded consent date.
    pub fn has_consent(&self) -> bool {
        self.consenso_profilazione && self.data_consenso.is_some()
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.nome, self.cognome)
    }
}

/// One row of the job record store, the single source of truth for polling
/// clients.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ProfilingJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: i16,
    pub current_phase: Option<String>,
    pub target: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Queue message payload, tagged by `schema` so future shape changes version
/// the payload instead of silently corrupting older in-flight jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum JobPayload {
    #[serde(rename = "profiling.v1")]
    ProfilingV1 { job_id: Uuid, target: ProfilingTarget },
}

impl JobPayload {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobPayload::ProfilingV1 { job_id, .. } => *job_id,
        }
    }
}

/// A claimed message from the durable queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueMessage {
    pub id: i64,
    pub job_id: Uuid,
    pub payload: Value,
    pub attempts: i32,
}

/// One successfully gathered slice of the composite profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSection {
    pub agent: String,
    pub summary: String,
    pub data: Value,
    pub confidence: u8,
}

/// Tells the end user why a section is empty instead of hiding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingSection {
    pub agent: String,
    pub reason: String,
}

/// The composite profile assembled by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub target_id: String,
    pub nome: String,
    pub cognome: String,
    pub sections: Vec<ProfileSection>,
    pub missing: Vec<MissingSection>,
    pub overall_score: u8,
    pub completeness: u8,
    pub agents_used: Vec<String>,
    pub elapsed_ms: u64,
    pub generated_at: DateTime<Utc>,
}

/// Progress report emitted by the orchestrator while a job runs.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub progress: i16,
    pub phase: String,
}
