use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Analyzing,
    Complete,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Analyzing => "analyzing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "scanning" => Some(Self::Scanning),
            "analyzing" => Some(Self::Analyzing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scanning => 1,
            Self::Analyzing => 2,
            Self::Complete => 3,
            Self::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    /// `failed` is reachable from every non-terminal status.
    pub fn can_advance_to(&self, next: ScanStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() >= self.rank()
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained pipeline progress. The tag form (`nmap_running`, `analyzing`, ...) is what
/// observers see; the ordinal gives the total order used to keep transitions monotonic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStage {
    Queued,
    ToolRunning { tool: String, position: usize },
    ToolDone { tool: String, position: usize },
    SelectingTools,
    Analyzing,
    GeneratingFixes,
    Scoring,
    Complete,
    Failed,
}

impl ScanStage {
    pub fn tag(&self) -> String {
        match self {
            Self::Queued => "queued".to_string(),
            Self::ToolRunning { tool, .. } => format!("{tool}_running"),
            Self::ToolDone { tool, .. } => format!("{tool}_done"),
            Self::SelectingTools => "selecting_tools".to_string(),
            Self::Analyzing => "analyzing".to_string(),
            Self::GeneratingFixes => "generating_fixes".to_string(),
            Self::Scoring => "scoring".to_string(),
            Self::Complete => "complete".to_string(),
            Self::Failed => "failed".to_string(),
        }
    }

    pub fn ordinal(&self) -> i64 {
        // phase * 100_000 + tool position * 10 + sub-step
        let (phase, position, sub) = match self {
            Self::Queued => (0, 0, 0),
            Self::ToolRunning { position: 0, .. } => (1, 0, 0),
            Self::ToolDone { position: 0, .. } => (1, 0, 1),
            Self::SelectingTools => (2, 0, 0),
            Self::ToolRunning { position, .. } => (3, *position, 0),
            Self::ToolDone { position, .. } => (3, *position, 1),
            Self::Analyzing => (4, 0, 0),
            Self::GeneratingFixes => (5, 0, 0),
            Self::Scoring => (6, 0, 0),
            Self::Complete => (7, 0, 0),
            Self::Failed => (8, 0, 0),
        };
        phase * 100_000 + (position as i64) * 10 + sub
    }

    pub fn record(&self) -> StageRecord {
        StageRecord {
            stage: self.tag(),
            ordinal: self.ordinal(),
            entered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StageRecord {
    pub stage: String,
    pub ordinal: i64,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ToolRun {
    pub tool: String,
    pub output: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[serde(other)]
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
    Unknown,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RemediationFinding {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finding: Option<String>,
    pub description: String,
    pub severity: Severity,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RemediationReport {
    pub os_detected: OsFamily,
    pub findings: Vec<RemediationFinding>,
    #[serde(default)]
    pub ai_recommendations: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLabel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Score and label travel together so one is never stored without the other.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub score: f64,
    pub label: RiskLabel,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ScanSession {
    pub scan_id: Uuid,
    pub target: String,
    pub status: ScanStatus,
    pub scan_stage: String,
    pub tools_used: Vec<String>,
    pub outputs: Vec<ToolRun>,
    pub analysis: Option<String>,
    pub fixes: Option<RemediationReport>,
    pub risk_score: Option<f64>,
    pub risk_label: Option<RiskLabel>,
    pub error: Option<String>,
    pub stage_history: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    pub fn new(target: impl Into<String>) -> Self {
        let created_at = Utc::now();
        let queued = StageRecord {
            stage: ScanStage::Queued.tag(),
            ordinal: ScanStage::Queued.ordinal(),
            entered_at: created_at,
        };
        Self {
            scan_id: Uuid::new_v4(),
            target: target.into(),
            status: ScanStatus::Pending,
            scan_stage: queued.stage.clone(),
            tools_used: vec![],
            outputs: vec![],
            analysis: None,
            fixes: None,
            risk_score: None,
            risk_label: None,
            error: None,
            stage_history: vec![queued],
            created_at,
            completed_at: None,
        }
    }

    pub fn output_of(&self, tool: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|run| run.tool == tool)
            .map(|run| run.output.as_str())
    }

    pub fn risk(&self) -> Option<RiskAssessment> {
        match (self.risk_score, self.risk_label) {
            (Some(score), Some(label)) => Some(RiskAssessment { score, label }),
            _ => None,
        }
    }

    pub fn apply(&mut self, patch: &ScanPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(stage) = &patch.stage {
            self.scan_stage = stage.stage.clone();
            self.stage_history.push(stage.clone());
        }
        if let Some(run) = &patch.tool_run {
            if self.output_of(&run.tool).is_none() {
                self.tools_used.push(run.tool.clone());
                self.outputs.push(run.clone());
            }
        }
        if let Some(analysis) = &patch.analysis {
            self.analysis = Some(analysis.clone());
        }
        if let Some(fixes) = &patch.fixes {
            self.fixes = Some(fixes.clone());
        }
        if let Some(risk) = patch.risk {
            self.risk_score = Some(risk.score);
            self.risk_label = Some(risk.label);
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(at) = patch.completed_at {
            self.completed_at = Some(at);
        }
    }
}

/// Field-level partial update. Absent fields are left untouched both in memory and in the store.
#[derive(Debug, Clone, Default)]
pub struct ScanPatch {
    pub status: Option<ScanStatus>,
    pub stage: Option<StageRecord>,
    pub tool_run: Option<ToolRun>,
    pub analysis: Option<String>,
    pub fixes: Option<RemediationReport>,
    pub risk: Option<RiskAssessment>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanPatch {
    pub fn stage(stage: &ScanStage) -> Self {
        Self {
            stage: Some(stage.record()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ScanStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_tool_run(mut self, tool: impl Into<String>, output: impl Into<String>) -> Self {
        self.tool_run = Some(ToolRun {
            tool: tool.into(),
            output: output.into(),
        });
        self
    }
}
