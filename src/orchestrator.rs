//! The multi-step profiling orchestrator: runs the agent plan against one
//! target and assembles the composite profile.
//!
//! Partial failures degrade gracefully: a failed agent becomes a missing
//! section with a reason, and the completeness score tells the end user how
//! much of the profile was actually gathered. The run only fails outright
//! when consent is missing, every agent fails, or the wall-clock deadline
//! expires.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::agents::{Agent, AgentKind};
use crate::{MissingSection, Profile, ProfileSection, ProfilingTarget, ProgressUpdate};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("profiling consent has not been granted for this target")]
    ConsentMissing,

    #[error("all {total} agents failed, last error: {last_error}")]
    AllAgentsFailed { total: usize, last_error: String },

    #[error("profiling run exceeded the {}s deadline", .0.as_secs())]
    DeadlineExceeded(Duration),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub position: usize,
    pub agent: String,
    pub kind: AgentKind,
    pub description: String,
}

/// Static description of which agents run and in what order.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationPlan {
    pub steps: Vec<PlanStep>,
}

pub struct Orchestrator {
    agents: Vec<Arc<dyn Agent>>,
    deadline: Duration,
}

impl Orchestrator {
    pub fn new(agents: Vec<Arc<dyn Agent>>, deadline: Duration) -> Self {
        Orchestrator { agents, deadline }
    }

    /// Side-effect free: backs the introspection endpoint and performs no
    /// external calls.
    pub fn plan(&self) -> OrchestrationPlan {
        OrchestrationPlan {
            steps: self
                .agents
                .iter()
                .enumerate()
                .map(|(position, agent)| PlanStep {
                    position: position + 1,
                    agent: agent.name().to_string(),
                    kind: agent.kind(),
                    description: agent.description().to_string(),
                })
                .collect(),
        }
    }

    /// Profiles one target. The consent gate runs before any agent is
    /// invoked; the whole run is bounded by the configured deadline so a
    /// hung upstream cannot pin a job in processing forever.
    #[instrument(skip_all, fields(target = %target.display_name()))]
    pub async fn profile_target(
        &self,
        target: &ProfilingTarget,
        progress: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<Profile, OrchestratorError> {
        if !target.has_consent() {
            return Err(OrchestratorError::ConsentMissing);
        }

        tokio::time::timeout(self.deadline, self.run(target, progress))
            .await
            .map_err(|_| OrchestratorError::DeadlineExceeded(self.deadline))?
    }

    async fn run(
        &self,
        target: &ProfilingTarget,
        progress: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<Profile, OrchestratorError> {
        let started = Instant::now();
        let total = self.agents.len();

        let mut sections = Vec::new();
        let mut missing = Vec::new();
        let mut agents_used = Vec::new();
        let mut last_error = String::new();

        for (index, agent) in self.agents.iter().enumerate() {
            if let Some(tx) = &progress {
                // Receiver loss only means nobody is watching progress.
                let _ = tx.send(ProgressUpdate {
                    progress: (10 + index * 80 / total.max(1)) as i16,
                    phase: agent.name().to_string(),
                });
            }

            match agent.run(target).await {
                Ok(report) => {
                    debug!(agent = agent.name(), confidence = report.confidence, "Agent succeeded");
                    agents_used.push(agent.name().to_string());
                    sections.push(ProfileSection {
                        agent: agent.name().to_string(),
                        summary: report.summary,
                        data: report.data,
                        confidence: report.confidence,
                    });
                }
                Err(err) => {
                    warn!(agent = agent.name(), error = %err, "Agent failed, continuing");
                    last_error = err.to_string();
                    missing.push(MissingSection {
                        agent: agent.name().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if sections.is_empty() && total > 0 {
            return Err(OrchestratorError::AllAgentsFailed { total, last_error });
        }

        if let Some(tx) = &progress {
            let _ = tx.send(ProgressUpdate {
                progress: 95,
                phase: "assembling".to_string(),
            });
        }

        let completeness = if total == 0 {
            0
        } else {
            (sections.len() * 100 / total) as u8
        };
        let overall_score = if sections.is_empty() {
            0
        } else {
            (sections
                .iter()
                .map(|section| u32::from(section.confidence))
                .sum::<u32>()
                / sections.len() as u32) as u8
        };

        Ok(Profile {
            target_id: target
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            nome: target.nome.clone(),
            cognome: target.cognome.clone(),
            sections,
            missing,
            overall_score,
            completeness,
            agents_used,
            elapsed_ms: started.elapsed().as_millis() as u64,
            generated_at: Utc::now(),
        })
    }
}
