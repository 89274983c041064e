use std::{
    collections::{BTreeSet, HashMap},
    fmt::Write,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    broadcast::BroadcastHub,
    config::AppConfig,
    db::{ScanStore, StoreError},
    models::{RemediationReport, ScanPatch, ScanSession, ScanStage, ScanStatus, ToolRun},
    oracle::{truncate_chars, Advisor, Intent, OracleError},
    parser, remediation, risk,
    security::OwnershipVerifier,
    tools::{ScanTool, ToolInfo, ToolRegistry},
};

const FALLBACK_CHARS_PER_TOOL: usize = 1_500;
const MAX_LIST_LIMIT: i64 = 500;
const INTERRUPTED: &str = "interrupted by service restart";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("target {0} failed ownership verification")]
    TargetRejected(String),
    #[error("scan {0} not found")]
    NotFound(Uuid),
    #[error("scan {0} is not complete yet")]
    NotComplete(Uuid),
    #[error("persistence failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub baseline_timeout: Duration,
    pub followup_timeout: Duration,
    pub pacing: Duration,
    pub recent_limit: i64,
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            baseline_timeout: cfg.baseline_timeout(),
            followup_timeout: cfg.followup_timeout(),
            pacing: cfg.pacing(),
            recent_limit: cfg.recent_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub baseline: ToolInfo,
    pub followups: Vec<ToolInfo>,
    pub active_scans: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatReply {
    ActionRequired {
        action: String,
        target: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<String>>,
        message: String,
    },
    ActionBlocked {
        action: String,
        message: String,
    },
    Error {
        message: String,
    },
    Message {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FollowupPlan {
    Advised,
    BaselineOnly,
    Fixed(Vec<String>),
}

#[derive(Clone)]
pub struct ScanEngine {
    registry: ToolRegistry,
    hub: BroadcastHub,
    advisor: Advisor,
    verifier: Arc<dyn OwnershipVerifier>,
    store: Arc<dyn ScanStore>,
    sessions: Arc<RwLock<HashMap<Uuid, ScanSession>>>,
    fixes_lock: Arc<Mutex<()>>,
    settings: EngineSettings,
}

impl ScanEngine {
    pub fn new(
        registry: ToolRegistry,
        hub: BroadcastHub,
        advisor: Advisor,
        verifier: Arc<dyn OwnershipVerifier>,
        store: Arc<dyn ScanStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            hub,
            advisor,
            verifier,
            store,
            sessions: Arc::default(),
            fixes_lock: Arc::default(),
            settings,
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub async fn start_scan(
        &self,
        target: &str,
        tools: Option<Vec<String>>,
    ) -> Result<Uuid, EngineError> {
        let target = target.trim();
        validate_target(target)?;
        if !self.verifier.verify(target).await {
            warn!(target, "target rejected by ownership verification");
            return Err(EngineError::TargetRejected(target.to_string()));
        }

        let plan = self.plan(tools.as_deref());
        let session = ScanSession::new(target);
        let id = session.scan_id;
        self.store.upsert(&session).await?;
        self.sessions.write().await.insert(id, session);
        info!(scan_id = %id, target, ?plan, "scan queued");

        tokio::spawn(self.clone().run(id, target.to_string(), plan));
        Ok(id)
    }

    fn plan(&self, tools: Option<&[String]>) -> FollowupPlan {
        let Some(tools) = tools.filter(|t| !t.is_empty()) else {
            return FollowupPlan::Advised;
        };
        let baseline = self.registry.baseline().name();
        let mut picked: Vec<String> = Vec::new();
        for name in tools {
            let name = name.trim().to_lowercase();
            if name == baseline || picked.contains(&name) {
                continue;
            }
            if self.registry.followup(&name).is_some() {
                picked.push(name);
            } else {
                warn!(tool = %name, "ignoring unknown tool in restricted list");
            }
        }
        if picked.is_empty() {
            FollowupPlan::BaselineOnly
        } else {
            FollowupPlan::Fixed(picked)
        }
    }

    async fn run(self, id: Uuid, target: String, plan: FollowupPlan) {
        match self.pipeline(id, &target, plan).await {
            Ok(()) => {}
            Err(EngineError::NotFound(_)) => {
                info!(scan_id = %id, "scan deleted while running, stopping");
            }
            Err(e) => {
                error!(scan_id = %id, error = %e, "scan pipeline failed");
                self.narrate(id, format!("[!] Scan failed: {e}")).await;
                self.fail(id, e.to_string()).await;
            }
        }
        if self.sessions.read().await.contains_key(&id) {
            self.hub.close(id).await;
        } else {
            // deleted while running
            self.hub.remove(id).await;
        }
    }

    async fn pipeline(&self, id: Uuid, target: &str, plan: FollowupPlan) -> Result<(), EngineError> {
        let baseline = self.registry.baseline().clone();
        let baseline_output = self
            .run_tool(
                id,
                target,
                &baseline,
                0,
                Some(ScanStatus::Scanning),
                self.settings.baseline_timeout,
            )
            .await?;
        let open_ports = parser::open_port_numbers(&baseline_output);
        self.narrate(
            id,
            format!("[+] {} found {} open port(s).", baseline.label(), open_ports.len()),
        )
        .await;

        let selected = match plan {
            FollowupPlan::BaselineOnly => {
                self.narrate(id, "[*] Follow-up tools disabled for this scan.").await;
                vec![]
            }
            FollowupPlan::Fixed(names) => names,
            FollowupPlan::Advised => {
                self.select_followups(id, &baseline_output, &open_ports).await?
            }
        };

        let mut followup_findings = 0;
        let mut web_audits = Vec::new();
        for (i, name) in selected.iter().enumerate() {
            let Some(tool) = self.registry.followup(name).cloned() else {
                continue;
            };
            let output = self
                .run_tool(id, target, &tool, i + 1, None, self.settings.followup_timeout)
                .await?;
            followup_findings += tool.count_findings(&output);
            if tool.web_audit() {
                web_audits.push(ToolRun {
                    tool: name.clone(),
                    output,
                });
            }
        }

        self.commit(
            id,
            ScanPatch::stage(&ScanStage::Analyzing).with_status(ScanStatus::Analyzing),
        )
        .await?;
        self.narrate(id, "[*] Interpreting results...").await;
        let runs = self.snapshot(id).await?.outputs;
        let analysis = match self.advisor.analyze(&runs).await {
            Ok(text) => text,
            Err(e) => {
                warn!(scan_id = %id, error = %e, "analysis unavailable, passing raw output through");
                fallback_analysis(&e, &runs)
            }
        };
        self.commit(
            id,
            ScanPatch {
                analysis: Some(analysis),
                ..ScanPatch::default()
            },
        )
        .await?;
        self.pace().await;

        self.commit(id, ScanPatch::stage(&ScanStage::GeneratingFixes)).await?;
        self.narrate(id, "[*] Generating remediation steps...").await;
        let report = self
            .derive_fixes(baseline.name(), &baseline_output, &web_audits)
            .await;
        self.pace().await;

        self.commit(id, ScanPatch::stage(&ScanStage::Scoring)).await?;
        let risk = risk::score(
            open_ports.len(),
            followup_findings,
            report.findings.iter().map(|f| f.severity),
        );

        self.commit(
            id,
            ScanPatch {
                status: Some(ScanStatus::Complete),
                stage: Some(ScanStage::Complete.record()),
                fixes: Some(report),
                risk: Some(risk),
                completed_at: Some(Utc::now()),
                ..ScanPatch::default()
            },
        )
        .await?;
        self.narrate(
            id,
            format!(
                "[+] Scan complete. Risk score: {:.1}/10 ({}).",
                risk.score,
                risk.label.as_str()
            ),
        )
        .await;
        info!(scan_id = %id, score = risk.score, label = risk.label.as_str(), "scan complete");
        Ok(())
    }

    async fn run_tool(
        &self,
        id: Uuid,
        target: &str,
        tool: &Arc<dyn ScanTool>,
        position: usize,
        status: Option<ScanStatus>,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let name = tool.name();
        let mut patch = ScanPatch::stage(&ScanStage::ToolRunning {
            tool: name.to_string(),
            position,
        });
        patch.status = status;
        self.commit(id, patch).await?;
        self.narrate(id, format!("[*] Running {} against {target}...", tool.label()))
            .await;

        let mut stream = tool.run(target, timeout);
        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            self.hub.broadcast(id, line.clone()).await;
            lines.push(line);
        }
        let output = lines.join("\n");

        self.commit(
            id,
            ScanPatch::stage(&ScanStage::ToolDone {
                tool: name.to_string(),
                position,
            })
            .with_tool_run(name, output.clone()),
        )
        .await?;
        self.pace().await;
        Ok(output)
    }

    async fn select_followups(
        &self,
        id: Uuid,
        baseline_output: &str,
        open_ports: &BTreeSet<u16>,
    ) -> Result<Vec<String>, EngineError> {
        self.commit(id, ScanPatch::stage(&ScanStage::SelectingTools)).await?;
        self.narrate(id, "[*] Choosing follow-up tools...").await;

        let catalog = self.registry.catalog();
        let selected = match self.advisor.select_tools(baseline_output, &catalog).await {
            Ok(names) => names,
            Err(e) => {
                warn!(scan_id = %id, error = %e, "tool selection failed, using port heuristic");
                self.narrate(id, "[!] Advisory oracle unavailable, selecting tools by open ports.")
                    .await;
                self.registry.select_by_ports(open_ports)
            }
        };

        if selected.is_empty() {
            self.narrate(id, "[*] No follow-up tools selected.").await;
        } else {
            self.narrate(id, format!("[*] Follow-up tools: {}", selected.join(", ")))
                .await;
        }
        info!(scan_id = %id, tools = ?selected, "follow-up tools selected");
        Ok(selected)
    }

    async fn derive_fixes(
        &self,
        baseline_tool: &str,
        baseline_output: &str,
        web_audits: &[ToolRun],
    ) -> RemediationReport {
        let mut report = remediation::derive(baseline_tool, baseline_output, web_audits);
        if remediation::needs_ai_supplement(&report) {
            let web = web_audits
                .iter()
                .map(|run| run.output.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            match self
                .advisor
                .recommend_fixes(baseline_output, &web, report.os_detected)
                .await
            {
                Ok(text) => report.ai_recommendations = text,
                Err(e) => warn!(error = %e, "supplementary remediation unavailable"),
            }
        }
        report
    }

    // store first, then memory
    async fn commit(&self, id: Uuid, patch: ScanPatch) -> Result<(), EngineError> {
        match self.sessions.read().await.get(&id) {
            None => return Err(EngineError::NotFound(id)),
            Some(session) if session.status.is_terminal() => {
                warn!(scan_id = %id, "ignoring update to a finished scan");
                return Ok(());
            }
            Some(session) => {
                if let Some(next) = patch.status {
                    if !session.status.can_advance_to(next) {
                        warn!(scan_id = %id, from = %session.status, to = %next, "refusing status regression");
                        return Ok(());
                    }
                }
            }
        }

        self.store.update(id, &patch).await?;
        if let Some(stage) = &patch.stage {
            info!(scan_id = %id, stage = %stage.stage, "stage transition");
        }
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.apply(&patch);
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, message: String) {
        match self.sessions.read().await.get(&id) {
            Some(session) if !session.status.is_terminal() => {}
            _ => return,
        }
        let patch = failure_patch(message);
        if let Err(e) = self.store.update(id, &patch).await {
            error!(scan_id = %id, error = %e, "could not persist failed state");
        }
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.apply(&patch);
        }
    }

    // startup only, before any scan is started
    pub async fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let ids = self.store.list_unfinished().await?;
        for id in &ids {
            self.store
                .update(*id, &failure_patch(INTERRUPTED.to_string()))
                .await?;
            warn!(scan_id = %id, "scan interrupted by restart, marked failed");
        }
        Ok(ids.len())
    }

    async fn narrate(&self, id: Uuid, line: impl Into<String>) {
        self.hub.broadcast(id, line).await;
    }

    async fn pace(&self) {
        if !self.settings.pacing.is_zero() {
            tokio::time::sleep(self.settings.pacing).await;
        }
    }

    async fn snapshot(&self, id: Uuid) -> Result<ScanSession, EngineError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn get(&self, id: Uuid) -> Result<ScanSession, EngineError> {
        if let Ok(session) = self.snapshot(id).await {
            return Ok(session);
        }
        self.store.get(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn list_recent(&self, limit: Option<i64>) -> Result<Vec<ScanSession>, EngineError> {
        let limit = limit
            .unwrap_or(self.settings.recent_limit)
            .clamp(1, MAX_LIST_LIMIT);
        let mut sessions = self.store.list_recent(limit).await?;
        let live = self.sessions.read().await;
        for session in &mut sessions {
            if let Some(current) = live.get(&session.scan_id) {
                *session = current.clone();
            }
        }
        Ok(sessions)
    }

    /// Drops bookkeeping for a scan. A tool that is still running is not interrupted.
    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        let in_memory = self.sessions.write().await.remove(&id).is_some();
        let in_store = self.store.delete(id).await?;
        self.hub.remove(id).await;
        self.advisor.forget(id).await;
        if !in_memory && !in_store {
            return Err(EngineError::NotFound(id));
        }
        info!(scan_id = %id, "scan deleted");
        Ok(())
    }

    pub async fn fixes(&self, id: Uuid) -> Result<RemediationReport, EngineError> {
        let session = self.get(id).await?;
        if session.status != ScanStatus::Complete {
            return Err(EngineError::NotComplete(id));
        }
        if let Some(fixes) = session.fixes {
            return Ok(fixes);
        }

        let _guard = self.fixes_lock.lock().await;
        let session = self.get(id).await?;
        if let Some(fixes) = session.fixes {
            return Ok(fixes);
        }

        let baseline = self.registry.baseline().name();
        let baseline_output = session.output_of(baseline).unwrap_or_default().to_string();
        let web_audits: Vec<ToolRun> = session
            .outputs
            .iter()
            .filter(|run| {
                self.registry
                    .get(&run.tool)
                    .is_some_and(|tool| tool.web_audit())
            })
            .cloned()
            .collect();
        let report = self
            .derive_fixes(baseline, &baseline_output, &web_audits)
            .await;

        let patch = ScanPatch {
            fixes: Some(report.clone()),
            ..ScanPatch::default()
        };
        self.store.update(id, &patch).await?;
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.apply(&patch);
        }
        info!(scan_id = %id, findings = report.findings.len(), "remediation report cached");
        Ok(report)
    }

    pub async fn health(&self) -> EngineHealth {
        let active_scans = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.status.is_terminal())
            .count();
        EngineHealth {
            baseline: self.registry.describe_baseline(),
            followups: self.registry.catalog(),
            active_scans,
        }
    }

    pub async fn chat(&self, message: &str, scan_id: Option<Uuid>) -> ChatReply {
        match self.advisor.interpret(message).await {
            Intent::Scan { target, tools } => {
                if validate_target(&target).is_err() || !self.verifier.verify(&target).await {
                    return ChatReply::Error {
                        message: format!(
                            "VERIFICATION FAILED: {target}. Host 'sentra-verify.txt' on the target \
                             or use an allow-listed host."
                        ),
                    };
                }
                ChatReply::ActionRequired {
                    action: "start_scan".to_string(),
                    message: format!("Target {target} verified. Ready to launch scan."),
                    target,
                    tools,
                }
            }
            Intent::Shell { command } => ChatReply::ActionBlocked {
                action: "shell".to_string(),
                message: format!("Shell execution is not available from chat: {command}"),
            },
            Intent::Attack { target } => ChatReply::ActionBlocked {
                action: "attack".to_string(),
                message: format!(
                    "Offensive operations against {target} are not supported. Start a scan instead."
                ),
            },
            Intent::Setup { tool, message } => ChatReply::Message {
                message: if message.trim().is_empty() {
                    format!(
                        "Install {} and make sure it is on PATH, then restart the service.",
                        tool.as_deref().unwrap_or("the tool")
                    )
                } else {
                    message
                },
            },
            Intent::Chat { message: answer } => {
                let context = match scan_id {
                    Some(id) => self.get(id).await.ok(),
                    None => None,
                };
                if context.is_none() && !answer.trim().is_empty() {
                    return ChatReply::Message { message: answer };
                }
                match self.advisor.chat(message, context.as_ref()).await {
                    Ok(reply) => ChatReply::Message { message: reply },
                    Err(e) => ChatReply::Message {
                        message: format!("The analysis service is unavailable right now ({e})."),
                    },
                }
            }
        }
    }
}

fn validate_target(target: &str) -> Result<(), EngineError> {
    if target.is_empty() {
        return Err(EngineError::InvalidTarget("target is empty".to_string()));
    }
    if target.starts_with('-') || target.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EngineError::InvalidTarget(target.to_string()));
    }
    Ok(())
}

fn failure_patch(message: String) -> ScanPatch {
    ScanPatch {
        status: Some(ScanStatus::Failed),
        stage: Some(ScanStage::Failed.record()),
        error: Some(message),
        completed_at: Some(Utc::now()),
        ..ScanPatch::default()
    }
}

fn fallback_analysis(err: &OracleError, runs: &[ToolRun]) -> String {
    let mut out = format!("AI analysis unavailable ({err}). Raw tool output follows.\n");
    for run in runs {
        let _ = write!(
            out,
            "\n=== {} ===\n{}\n",
            run.tool.to_uppercase(),
            truncate_chars(&run.output, FALLBACK_CHARS_PER_TOOL)
        );
    }
    out
}
