//! In-memory test doubles for the persistence and agent seams.
//!
//! These mirror the transition guards of the Postgres implementations so the
//! state-machine properties can be exercised without a database.

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

use crate::agents::{Agent, AgentError, AgentKind, AgentReport};
use crate::db::{DurableQueue, JobStore, ProfileArchive};
use crate::{JobPayload, JobStatus, Profile, ProfilingJob, ProfilingTarget};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, ProfilingJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, target: &ProfilingTarget) -> Result<Uuid, Error> {
        let id = Uuid::new_v4();
        let job = ProfilingJob {
            id,
            status: JobStatus::Pending,
            progress: 0,
            current_phase: None,
            target: serde_json::to_value(target)?,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.jobs
            .lock()
            .expect("Couldn't lock job map")
            .insert(id, job);
        Ok(id)
    }

    async fn start_job(&self, id: Uuid) -> Result<(), Error> {
        let mut jobs = self.jobs.lock().expect("Couldn't lock job map");
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_progress(&self, id: Uuid, progress: i16, phase: &str) -> Result<(), Error> {
        let mut jobs = self.jobs.lock().expect("Couldn't lock job map");
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.progress = progress;
                job.current_phase = Some(phase.to_string());
            }
        }
        Ok(())
    }

    async fn complete_job(&self, id: Uuid, result: &Profile) -> Result<(), Error> {
        let mut jobs = self.jobs.lock().expect("Couldn't lock job map");
        if let Some(job) = jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.current_phase = None;
                job.result = Some(serde_json::to_value(result)?);
                job.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), Error> {
        let mut jobs = self.jobs.lock().expect("Couldn't lock job map");
        if let Some(job) = jobs.get_mut(&id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                job.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<ProfilingJob>, Error> {
        Ok(self
            .jobs
            .lock()
            .expect("Couldn't lock job map")
            .get(&id)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryArchive {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target_id: &str) -> Option<Profile> {
        self.profiles
            .lock()
            .expect("Couldn't lock profile map")
            .get(target_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().expect("Couldn't lock profile map").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProfileArchive for MemoryArchive {
    async fn upsert(&self, profile: &Profile) -> Result<(), Error> {
        self.profiles
            .lock()
            .expect("Couldn't lock profile map")
            .insert(profile.target_id.clone(), profile.clone());
        Ok(())
    }
}

/// Records enqueued payloads without any durability.
#[derive(Default)]
pub struct CollectingQueue {
    messages: Mutex<Vec<JobPayload>>,
}

impl CollectingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<JobPayload> {
        self.messages
            .lock()
            .expect("Couldn't lock message list")
            .clone()
    }
}

#[async_trait]
impl DurableQueue for CollectingQueue {
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), Error> {
        self.messages
            .lock()
            .expect("Couldn't lock message list")
            .push(payload.clone());
        Ok(())
    }
}

/// Always fails to enqueue, exercising the fallback path.
pub struct RejectingQueue;

#[async_trait]
impl DurableQueue for RejectingQueue {
    async fn enqueue(&self, _payload: &JobPayload) -> Result<(), Error> {
        Err(anyhow!("queue schema not migrated"))
    }
}

/// Succeeds with a canned report.
pub struct StaticAgent {
    name: &'static str,
    confidence: u8,
}

impl StaticAgent {
    pub fn new(name: &'static str, confidence: u8) -> Self {
        StaticAgent { name, confidence }
    }
}

#[async_trait]
impl Agent for StaticAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Inference
    }

    fn description(&self) -> &'static str {
        "canned report"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        Ok(AgentReport {
            summary: format!("canned report for {}", target.display_name()),
            data: serde_json::json!({ "agent": self.name }),
            confidence: self.confidence,
        })
    }
}

/// Always fails, simulating an unreachable upstream.
pub struct FailingAgent {
    name: &'static str,
}

impl FailingAgent {
    pub fn new(name: &'static str) -> Self {
        FailingAgent { name }
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Scraping
    }

    fn description(&self) -> &'static str {
        "always fails"
    }

    async fn run(&self, _target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        Err(AgentError::UpstreamStatus { status: 503 })
    }
}

/// Counts invocations; used to assert that a code path makes no agent calls.
pub struct CountingAgent {
    name: &'static str,
    calls: AtomicUsize,
}

impl CountingAgent {
    pub fn new(name: &'static str) -> Self {
        CountingAgent {
            name,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for CountingAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Inference
    }

    fn description(&self) -> &'static str {
        "counts invocations"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentReport {
            summary: format!("call recorded for {}", target.display_name()),
            data: serde_json::json!({}),
            confidence: 50,
        })
    }
}

/// Sleeps before answering; used to exercise the orchestration deadline.
pub struct SlowAgent {
    name: &'static str,
    delay: Duration,
}

impl SlowAgent {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        SlowAgent { name, delay }
    }
}

#[async_trait]
impl Agent for SlowAgent {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Scraping
    }

    fn description(&self) -> &'static str {
        "slow upstream"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        sleep(self.delay).await;
        Ok(AgentReport {
            summary: format!("slow report for {}", target.display_name()),
            data: serde_json::json!({}),
            confidence: 50,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn target() -> ProfilingTarget {
        ProfilingTarget {
            id: Some("t-1".into()),
            nome: "Mario".into(),
            cognome: "Draghi".into(),
            email: None,
            telefono: None,
            citta: None,
            professione: None,
            note: None,
            consenso_profilazione: true,
            data_consenso: Some(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()),
        }
    }

    fn profile() -> Profile {
        Profile {
            target_id: "t-1".into(),
            nome: "Mario".into(),
            cognome: "Draghi".into(),
            sections: vec![],
            missing: vec![],
            overall_score: 50,
            completeness: 100,
            agents_used: vec![],
            elapsed_ms: 1,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_then_get_is_pending_and_clean() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn legal_transition_chain_completes() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        store.start_job(id).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        store.complete_job(id, &profile()).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        // pending -> completed is not a legal edge
        store.complete_job(id, &profile()).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn terminal_states_are_sticky() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        store.start_job(id).await.unwrap();
        store.complete_job(id, &profile()).await.unwrap();

        // A redelivered message must not drag the job back to processing.
        store.start_job(id).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        store.fail_job(id, "late failure").await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn fail_job_is_idempotent_first_error_wins() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        store.start_job(id).await.unwrap();
        store.fail_job(id, "first error").await.unwrap();
        store.fail_job(id, "second error").await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("first error"));
    }

    #[tokio::test]
    async fn pending_jobs_can_fail_directly() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        store.fail_job(id, "enqueue exploded").await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn progress_only_moves_while_processing() {
        let store = MemoryJobStore::new();
        let id = store.create_job(&target()).await.unwrap();

        store.set_progress(id, 50, "identity").await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.progress, 0);

        store.start_job(id).await.unwrap();
        store.set_progress(id, 50, "identity").await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.progress, 50);
        assert_eq!(job.current_phase.as_deref(), Some("identity"));
    }

    #[tokio::test]
    async fn archive_upsert_overwrites_by_target() {
        let archive = MemoryArchive::new();
        let mut p = profile();
        archive.upsert(&p).await.unwrap();

        p.overall_score = 90;
        archive.upsert(&p).await.unwrap();

        assert_eq!(archive.len(), 1);
        assert_eq!(archive.get("t-1").unwrap().overall_score, 90);
    }
}
