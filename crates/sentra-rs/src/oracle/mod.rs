use std::{collections::HashMap, fmt::Write, sync::Arc, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::OracleConfig,
    models::{OsFamily, ScanSession, ToolRun},
    tools::ToolInfo,
};

const ANALYSIS_CHARS_PER_TOOL: usize = 3_000;
const FIXES_CHARS_PER_TOOL: usize = 2_000;
const MEMORY_TURNS: usize = 6;
const DEFAULT_SYSTEM: &str = "You are Sentra.AI, a cybersecurity expert.";

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle is not configured: {0}")]
    NotConfigured(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("response error: {0}")]
    Response(String),
    #[error("unparsable oracle output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub history: Vec<ChatTurn>,
    pub user: String,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: vec![],
            user: user.into(),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<String, OracleError>;
}

/// Chat-completions client for OpenRouter and other OpenAI-compatible endpoints.
pub struct OpenRouterClient {
    client: reqwest::Client,
    config: OracleConfig,
}

impl OpenRouterClient {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OracleError::Http(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatTurn,
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: LlmRequest) -> Result<String, OracleError> {
        let key = self.config.api_key.trim();
        if key.is_empty() || key.contains("your-key-here") {
            return Err(OracleError::NotConfigured("API key is missing".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| OracleError::NotConfigured(e.to_string()))?,
        );
        headers.insert("X-Title", HeaderValue::from_static("Sentra.AI"));

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatTurn {
            role: "system".to_string(),
            content: request.system,
        });
        messages.extend(request.history);
        messages.push(ChatTurn {
            role: "user".to_string(),
            content: request.user,
        });

        let body = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::Response(format!("HTTP {status}: {text}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Parse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| OracleError::Response("no choices in response".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Intent {
    Scan {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<String>>,
    },
    Chat {
        #[serde(default)]
        message: String,
    },
    Shell {
        command: String,
    },
    Attack {
        target: String,
    },
    Setup {
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        message: String,
    },
}

const POLITE: &str = r"^(?:can\s+you\s+|could\s+you\s+|can\s+u\s+|please\s+)?";

static TOOL_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){POLITE}(?:run|execute|use|start)?\s*(nmap|nikto|sslscan|gobuster)\s+(?:on\s+|against\s+)?([a-zA-Z0-9.-]+)$"
    ))
    .expect("static regex")
});

static SCAN_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){POLITE}(?:scan|check|test|analyze)\s+([a-zA-Z0-9.-]+)$"
    ))
    .expect("static regex")
});

static ATTACK_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i){POLITE}(?:attack|hack|exploit|purple\s+team)\s+([a-zA-Z0-9.-]+)$"
    ))
    .expect("static regex")
});

/// Deterministic recognition of the common phrasings, tried before the oracle.
pub fn quick_intent(message: &str) -> Option<Intent> {
    let message = message.trim();
    if let Some(caps) = TOOL_REQUEST.captures(message) {
        return Some(Intent::Scan {
            target: caps[2].to_string(),
            tools: Some(vec![caps[1].to_lowercase()]),
        });
    }
    if let Some(caps) = SCAN_REQUEST.captures(message) {
        return Some(Intent::Scan {
            target: caps[1].to_string(),
            tools: None,
        });
    }
    ATTACK_REQUEST.captures(message).map(|caps| Intent::Attack {
        target: caps[1].to_string(),
    })
}

pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    for fence in ["```json", "```JSON", "```"] {
        if let Some(rest) = text.strip_prefix(fence) {
            text = rest;
            break;
        }
    }
    text.strip_suffix("```").unwrap_or(text).trim()
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, open: char, close: char) -> Result<T, OracleError> {
    let clean = strip_code_fences(raw);
    if let Ok(v) = serde_json::from_str(clean) {
        return Ok(v);
    }
    // tolerate chatter around the payload
    let start = clean.find(open);
    let end = clean.rfind(close);
    match (start, end) {
        (Some(s), Some(e)) if s < e => {
            serde_json::from_str(&clean[s..=e]).map_err(|e| OracleError::Parse(e.to_string()))
        }
        _ => Err(OracleError::Parse(format!(
            "no JSON payload in: {}",
            truncate_chars(clean, 200)
        ))),
    }
}

pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The advisory oracle as the pipeline sees it. Every call may fail; callers own the fallback.
#[derive(Clone)]
pub struct Advisor {
    client: Arc<dyn LlmClient>,
    memory: Arc<Mutex<HashMap<Uuid, Vec<ChatTurn>>>>,
}

impl Advisor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            memory: Arc::default(),
        }
    }

    pub async fn ask(&self, prompt: &str) -> Result<String, OracleError> {
        self.client
            .complete(LlmRequest::new(DEFAULT_SYSTEM, prompt))
            .await
    }

    pub async fn analyze(&self, runs: &[ToolRun]) -> Result<String, OracleError> {
        let mut prompt = String::from(
            "Analyze these security scan results and provide a concise assessment:\n\n",
        );
        for run in runs {
            let _ = writeln!(
                prompt,
                "=== {} ===\n{}\n",
                run.tool.to_uppercase(),
                truncate_chars(&run.output, ANALYSIS_CHARS_PER_TOOL)
            );
        }
        prompt.push_str(
            "Format as:\n1. **Summary**: What is running?\n\
             2. **Risks**: Potential vulnerabilities (if any obvious versions).\n\
             3. **Recommendations**: Basic hardening steps.\n",
        );
        self.ask(&prompt).await
    }

    /// Follow-up tools chosen from `catalog`. Names outside the catalog are dropped.
    pub async fn select_tools(
        &self,
        baseline_output: &str,
        catalog: &[ToolInfo],
    ) -> Result<Vec<String>, OracleError> {
        let mut tools = String::new();
        for tool in catalog {
            let ports: Vec<String> = tool.ports.iter().map(u16::to_string).collect();
            let _ = writeln!(
                tools,
                "- {}: {} (triggers on ports: {})",
                tool.name,
                tool.description,
                ports.join(", ")
            );
        }
        let prompt = format!(
            "You are a security assessment agent. Based on the port scan results below, decide \
             which follow-up tools to run.\n\nAVAILABLE TOOLS:\n{tools}\nPORT SCAN RESULTS:\n{}\n\n\
             RULES:\n\
             1. Select ONLY tools whose relevant ports are open in the results.\n\
             2. If no web ports (80, 443, 8080, 8443) are open, do NOT select web-focused tools.\n\
             3. Respond with ONLY a raw JSON array of tool names. Example: [\"nikto\", \"sslscan\"]\n\
             4. If no follow-up tools are appropriate, respond with: []\n",
            truncate_chars(baseline_output, ANALYSIS_CHARS_PER_TOOL)
        );

        let raw = self
            .client
            .complete(LlmRequest::new(
                "You are a security tool orchestrator. Respond ONLY with JSON.",
                prompt,
            ))
            .await?;
        let names: Vec<String> = parse_json(&raw, '[', ']')?;

        let mut selected: Vec<String> = Vec::new();
        for name in names {
            let name = name.trim().to_lowercase();
            if catalog.iter().any(|t| t.name == name) && !selected.contains(&name) {
                selected.push(name);
            } else {
                debug!(tool = %name, "discarding unknown or duplicate tool from oracle");
            }
        }
        Ok(selected)
    }

    pub async fn classify_intent(&self, message: &str) -> Result<Intent, OracleError> {
        let system = "You are Sentra.AI, an expert cybersecurity assistant.\n\
            Determine whether the user wants to initiate a vulnerability scan on a target, run a \
            shell command, attack a target, set up a tool, or is chatting.\n\
            RULES:\n\
            1. Respond ONLY with a raw JSON object. No markdown, no filler.\n\
            2. Scan: {\"action\": \"scan\", \"target\": \"<ip_or_domain>\"}\n\
            3. Shell command (not scanners): {\"action\": \"shell\", \"command\": \"<command>\"}\n\
            4. Explicit attack/pen-test/purple team: {\"action\": \"attack\", \"target\": \"<ip_or_domain>\"}\n\
            5. Installing or configuring a tool: {\"action\": \"setup\", \"tool\": \"<name>\", \"message\": \"<steps>\"}\n\
            6. Anything else: {\"action\": \"chat\", \"message\": \"<your helpful answer>\"}";
        let raw = self
            .client
            .complete(LlmRequest::new(system, message))
            .await?;
        parse_json(&raw, '{', '}')
    }

    /// Fast path, then oracle, then a plain chat answer describing the failure.
    pub async fn interpret(&self, message: &str) -> Intent {
        if let Some(intent) = quick_intent(message) {
            return intent;
        }
        match self.classify_intent(message).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(error = %e, "intent classification failed, defaulting to chat");
                Intent::Chat {
                    message: format!(
                        "I processed that, but could not reach the analysis service ({e}). \
                         Could you rephrase or try again?"
                    ),
                }
            }
        }
    }

    pub async fn recommend_fixes(
        &self,
        baseline_output: &str,
        web_output: &str,
        os: OsFamily,
    ) -> Result<String, OracleError> {
        let prompt = format!(
            "Based on these scan results, generate specific remediation commands.\n\
             Target OS appears to be: {}\n\n=== PORT SCAN ===\n{}\n\n=== WEB AUDIT ===\n{}\n\n\
             For each vulnerability found, provide:\n\
             1. What the issue is\n2. The exact command to fix it (copy-pasteable)\n\
             3. Mark severity as CRITICAL, HIGH, MEDIUM, or LOW\n\n\
             Format as a numbered list. Focus on actionable commands, not general advice.",
            os.as_str(),
            truncate_chars(baseline_output, FIXES_CHARS_PER_TOOL),
            truncate_chars(web_output, FIXES_CHARS_PER_TOOL),
        );
        self.client
            .complete(LlmRequest::new(
                "You are a Blue Team security engineer. Generate safe, specific remediation commands.",
                prompt,
            ))
            .await
    }

    /// Conversational answer with scan context and the last few turns of per-scan memory.
    pub async fn chat(
        &self,
        message: &str,
        scan: Option<&ScanSession>,
    ) -> Result<String, OracleError> {
        let mut system = String::from("You are Sentra.AI, an expert cybersecurity assistant.");
        if let Some(scan) = scan {
            let score = scan
                .risk()
                .map(|r| format!("{:.1}/10 ({})", r.score, r.label.as_str()))
                .unwrap_or_else(|| "N/A".to_string());
            let baseline = scan
                .outputs
                .first()
                .map(|r| truncate_chars(&r.output, 500))
                .unwrap_or("No data");
            let analysis = scan
                .analysis
                .as_deref()
                .map(|a| truncate_chars(a, 1_000))
                .unwrap_or("No analysis");
            let _ = write!(
                system,
                "\n\nScan context:\n- Target: {}\n- Risk Score: {score}\n- Open Ports Summary: {baseline}\n\
                 - AI Analysis: {analysis}\n- Tools Used: {}\n\n\
                 Use this context to answer follow-up questions precisely.",
                scan.target,
                scan.tools_used.join(", ")
            );
        }

        let scan_id = scan.map(|s| s.scan_id);
        let history = match scan_id {
            Some(id) => {
                let memory = self.memory.lock().await;
                let turns = memory.get(&id).map(Vec::as_slice).unwrap_or_default();
                turns[turns.len().saturating_sub(MEMORY_TURNS)..].to_vec()
            }
            None => vec![],
        };

        let reply = self
            .client
            .complete(LlmRequest {
                system,
                history,
                user: message.to_string(),
            })
            .await?;

        if let Some(id) = scan_id {
            let mut memory = self.memory.lock().await;
            let turns = memory.entry(id).or_default();
            turns.push(ChatTurn {
                role: "user".to_string(),
                content: message.to_string(),
            });
            turns.push(ChatTurn {
                role: "assistant".to_string(),
                content: reply.clone(),
            });
        }
        Ok(reply)
    }

    pub async fn forget(&self, scan_id: Uuid) {
        self.memory.lock().await.remove(&scan_id);
    }
}
