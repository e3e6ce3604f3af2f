//! Agents, the units of orchestrator work. Each wraps exactly one external
//! data-gathering call: AI inference or web scraping. Timeout and retry
//! policy live here, not in the orchestrator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ProfilingTarget;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("unusable upstream payload: {0}")]
    Payload(String),
}

/// What kind of external call an agent wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Inference,
    Scraping,
}

/// The data an agent contributes to the composite profile.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub summary: String,
    pub data: Value,
    pub confidence: u8,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> AgentKind;
    fn description(&self) -> &'static str;
    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError>;
}

/// Endpoints and credentials for the external services.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub inference_url: String,
    pub inference_api_key: String,
    pub inference_model: String,
    pub scraping_url: String,
    pub scraping_api_key: String,
    pub request_timeout: Duration,
    pub retries: u32,
}

/// Thin chat-completions client for the AI inference service.
#[derive(Clone)]
pub struct InferenceClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl InferenceClient {
    pub fn new(config: &AgentConfig) -> Result<Self, reqwest::Error> {
        Ok(InferenceClient {
            http: Client::builder().timeout(config.request_timeout).build()?,
            base_url: config.inference_url.trim_end_matches('/').to_string(),
            api_key: config.inference_api_key.clone(),
            model: config.inference_model.clone(),
            retries: config.retries,
        })
    }

    pub async fn complete(&self, system: &str, user: &str) -> Result<String, AgentError> {
        let mut attempt = 0;
        loop {
            match self.try_complete(system, user).await {
                Ok(content) => return Ok(content),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %err, attempt, "Inference call failed, retrying");
                    sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_complete(&self, system: &str, user: &str) -> Result<String, AgentError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: system,
                    },
                    ChatMessage {
                        role: "user",
                        content: user,
                    },
                ],
                temperature: 0.2,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentError::UpstreamStatus {
                status: response.status().as_u16(),
            });
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AgentError::Payload("empty choices".into()))
    }
}

/// One search hit from the scraping service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

/// Client for the web-scraping/search service.
#[derive(Clone)]
pub struct ScrapingClient {
    http: Client,
    base_url: String,
    api_key: String,
    retries: u32,
}

impl ScrapingClient {
    pub fn new(config: &AgentConfig) -> Result<Self, reqwest::Error> {
        Ok(ScrapingClient {
            http: Client::builder().timeout(config.request_timeout).build()?,
            base_url: config.scraping_url.trim_end_matches('/').to_string(),
            api_key: config.scraping_api_key.clone(),
            retries: config.retries,
        })
    }

    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, AgentError> {
        let mut attempt = 0;
        loop {
            match self.try_search(query).await {
                Ok(hits) => return Ok(hits),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %err, attempt, "Search call failed, retrying");
                    sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_search(&self, query: &str) -> Result<Vec<SearchHit>, AgentError> {
        debug!(query, "Searching");
        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&SearchRequest { query, limit: 10 })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AgentError::UpstreamStatus {
                status: response.status().as_u16(),
            });
        }

        let body: SearchResponse = response.json().await?;
        Ok(body.results)
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

const IDENTITY_SYSTEM: &str = "Sei un analista OSINT per una piattaforma assicurativa. \
Arricchisci il profilo anagrafico del soggetto con deduzioni prudenti e verificabili. \
Rispondi in italiano, massimo 200 parole.";

/// Demographic/identity enrichment via AI inference.
pub struct IdentityAgent {
    inference: InferenceClient,
}

impl IdentityAgent {
    pub fn new(inference: InferenceClient) -> Self {
        IdentityAgent { inference }
    }
}

#[async_trait]
impl Agent for IdentityAgent {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Inference
    }

    fn description(&self) -> &'static str {
        "Demographic and identity enrichment via AI inference"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        let prompt = format!(
            "Nome: {}\nCognome: {}\nCittà: {}\nProfessione: {}\nNote: {}",
            target.nome,
            target.cognome,
            target.citta.as_deref().unwrap_or("-"),
            target.professione.as_deref().unwrap_or("-"),
            target.note.as_deref().unwrap_or("-"),
        );

        let analysis = self.inference.complete(IDENTITY_SYSTEM, &prompt).await?;

        Ok(AgentReport {
            summary: first_line(&analysis),
            data: json!({ "analysis": analysis }),
            confidence: 70,
        })
    }
}

/// Public web references for the target, via the scraping service.
pub struct WebPresenceAgent {
    scraping: ScrapingClient,
}

impl WebPresenceAgent {
    pub fn new(scraping: ScrapingClient) -> Self {
        WebPresenceAgent { scraping }
    }
}

#[async_trait]
impl Agent for WebPresenceAgent {
    fn name(&self) -> &'static str {
        "web_presence"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Scraping
    }

    fn description(&self) -> &'static str {
        "Public web references gathered through the scraping service"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        let mut query = format!("\"{}\"", target.display_name());
        if let Some(citta) = &target.citta {
            query.push(' ');
            query.push_str(citta);
        }

        let hits = self.scraping.search(&query).await?;
        let confidence = (30 + 15 * hits.len() as u32).min(90) as u8;

        Ok(AgentReport {
            summary: format!("{} public web references found", hits.len()),
            data: json!({ "query": query, "results": hits }),
            confidence: if hits.is_empty() { 20 } else { confidence },
        })
    }
}

/// Social network footprint, via the scraping service with site filters.
pub struct SocialFootprintAgent {
    scraping: ScrapingClient,
}

impl SocialFootprintAgent {
    pub fn new(scraping: ScrapingClient) -> Self {
        SocialFootprintAgent { scraping }
    }
}

#[async_trait]
impl Agent for SocialFootprintAgent {
    fn name(&self) -> &'static str {
        "social_footprint"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Scraping
    }

    fn description(&self) -> &'static str {
        "Social network profiles located through site-filtered search"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        let query = format!(
            "(site:linkedin.com OR site:facebook.com OR site:instagram.com) \"{}\"",
            target.display_name()
        );

        let hits = self.scraping.search(&query).await?;

        Ok(AgentReport {
            summary: format!("{} social profiles located", hits.len()),
            data: json!({ "profiles": hits }),
            confidence: if hits.is_empty() { 25 } else { 65 },
        })
    }
}

const RISK_SYSTEM: &str = "Sei un sottoscrittore assicurativo. Valuta il potenziale \
commerciale e il rischio del soggetto descritto. Rispondi SOLO con JSON: \
{\"score\": <0-100>, \"rationale\": \"<una frase>\"}";

#[derive(Deserialize)]
struct RiskAssessment {
    score: u8,
    rationale: String,
}

/// Sales-potential/risk synthesis via AI inference.
pub struct InsuranceRiskAgent {
    inference: InferenceClient,
}

impl InsuranceRiskAgent {
    pub fn new(inference: InferenceClient) -> Self {
        InsuranceRiskAgent { inference }
    }
}

#[async_trait]
impl Agent for InsuranceRiskAgent {
    fn name(&self) -> &'static str {
        "insurance_risk"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Inference
    }

    fn description(&self) -> &'static str {
        "Insurance sales-potential score synthesized by AI inference"
    }

    async fn run(&self, target: &ProfilingTarget) -> Result<AgentReport, AgentError> {
        let prompt = format!(
            "Soggetto: {}\nProfessione: {}\nCittà: {}",
            target.display_name(),
            target.professione.as_deref().unwrap_or("-"),
            target.citta.as_deref().unwrap_or("-"),
        );

        let content = self.inference.complete(RISK_SYSTEM, &prompt).await?;

        // Models occasionally ignore the JSON instruction; keep the raw text
        // at low confidence rather than losing the section.
        match serde_json::from_str::<RiskAssessment>(content.trim()) {
            Ok(assessment) => Ok(AgentReport {
                summary: first_line(&assessment.rationale),
                data: json!({ "score": assessment.score, "rationale": assessment.rationale }),
                confidence: 75,
            }),
            Err(_) => Ok(AgentReport {
                summary: "risk assessment (unstructured)".to_string(),
                data: json!({ "raw": content }),
                confidence: 40,
            }),
        }
    }
}

/// The fixed agent set in plan order.
pub fn default_agents(config: &AgentConfig) -> Result<Vec<Arc<dyn Agent>>, anyhow::Error> {
    let inference = InferenceClient::new(config)?;
    let scraping = ScrapingClient::new(config)?;

    Ok(vec![
        Arc::new(IdentityAgent::new(inference.clone())),
        Arc::new(WebPresenceAgent::new(scraping.clone())),
        Arc::new(SocialFootprintAgent::new(scraping)),
        Arc::new(InsuranceRiskAgent::new(inference)),
    ])
}
