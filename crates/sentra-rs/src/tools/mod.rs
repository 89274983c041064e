use std::{
    collections::BTreeSet,
    path::Path,
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};

use tracing::{info, warn};

use crate::{
    config::ToolPaths,
    stream::{single_line, spawn_lines, CommandSpec, LineStream},
};

const WEB_PORTS: &[u16] = &[80, 443, 8080, 8443];
const TLS_PORTS: &[u16] = &[443, 8443];
const NMAP_WINDOWS_DEFAULT: &str = "C:\\Program Files (x86)\\Nmap\\nmap.exe";

/// A scanner the engine can invoke. Implementations never fail past this boundary: problems
/// surface as output lines.
pub trait ScanTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn label(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Ports that make this tool worth running as a follow-up.
    fn relevant_ports(&self) -> &'static [u16];
    fn is_available(&self) -> bool;
    /// Whether the output is a web audit that the remediation pattern table applies to.
    fn web_audit(&self) -> bool {
        false
    }
    fn count_findings(&self, _output: &str) -> usize {
        0
    }
    fn run(&self, target: &str, timeout: Duration) -> LineStream;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub label: String,
    pub description: String,
    pub ports: Vec<u16>,
    pub available: bool,
}

pub struct NmapTool {
    path: Option<String>,
}

impl NmapTool {
    pub fn new(path: Option<String>) -> Self {
        Self { path }
    }

    pub fn discover(configured: Option<&str>) -> Self {
        let path = configured
            .map(ToString::to_string)
            .or_else(|| find_binary("nmap"))
            .or_else(|| {
                (cfg!(windows) && Path::new(NMAP_WINDOWS_DEFAULT).exists())
                    .then(|| NMAP_WINDOWS_DEFAULT.to_string())
            });
        Self::new(path)
    }
}

impl ScanTool for NmapTool {
    fn name(&self) -> &'static str {
        "nmap"
    }

    fn label(&self) -> &'static str {
        "Nmap"
    }

    fn description(&self) -> &'static str {
        "Port and service discovery (fast scan of the most common ports)"
    }

    fn relevant_ports(&self) -> &'static [u16] {
        &[]
    }

    fn is_available(&self) -> bool {
        self.path.is_some()
    }

    fn count_findings(&self, output: &str) -> usize {
        crate::parser::parse_open_ports(output).len()
    }

    fn run(&self, target: &str, timeout: Duration) -> LineStream {
        match &self.path {
            Some(path) => spawn_lines(CommandSpec::new(path, ["-F", "-T4", target]), timeout),
            None => single_line("Error: Nmap not found. Please install Nmap."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NiktoMode {
    Local(String),
    Docker(String),
    Missing,
}

pub struct NiktoTool {
    mode: NiktoMode,
}

impl NiktoTool {
    pub fn new(mode: NiktoMode) -> Self {
        Self { mode }
    }

    /// Local nikto first, then the containerised image if a docker daemon answers.
    pub fn discover(nikto: Option<&str>, docker: Option<&str>) -> Self {
        if let Some(path) = nikto.map(ToString::to_string).or_else(|| find_binary("nikto")) {
            return Self::new(NiktoMode::Local(path));
        }
        let Some(docker) = docker.map(ToString::to_string).or_else(|| find_binary("docker")) else {
            return Self::new(NiktoMode::Missing);
        };
        let daemon_up = Command::new(&docker)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if daemon_up {
            info!("docker daemon is running, nikto enabled via docker");
            Self::new(NiktoMode::Docker(docker))
        } else {
            warn!("docker binary found but daemon is not running, nikto disabled");
            Self::new(NiktoMode::Missing)
        }
    }

    fn command(&self, target: &str) -> Option<CommandSpec> {
        match &self.mode {
            NiktoMode::Local(path) => Some(CommandSpec::new(
                path,
                ["-h", target, "-maxtime", "60"],
            )),
            NiktoMode::Docker(docker) => {
                let host = match target {
                    "localhost" | "127.0.0.1" | "::1" => "host.docker.internal",
                    other => other,
                };
                Some(CommandSpec::new(
                    docker,
                    [
                        "run".to_string(),
                        "--rm".to_string(),
                        "frapsoft/nikto".to_string(),
                        "-h".to_string(),
                        format!("http://{host}:80"),
                        "-maxtime".to_string(),
                        "60".to_string(),
                    ],
                ))
            }
            NiktoMode::Missing => None,
        }
    }
}

const NIKTO_HEADER_PREFIXES: &[&str] = &[
    "+ Target IP:",
    "+ Target Hostname:",
    "+ Target Port:",
    "+ Start Time:",
    "+ End Time:",
    "+ Server:",
    "+ SSL Info:",
];

impl ScanTool for NiktoTool {
    fn name(&self) -> &'static str {
        "nikto"
    }

    fn label(&self) -> &'static str {
        "Nikto"
    }

    fn description(&self) -> &'static str {
        "Web server vulnerability scanner (misconfigurations, dangerous files, outdated software)"
    }

    fn relevant_ports(&self) -> &'static [u16] {
        WEB_PORTS
    }

    fn is_available(&self) -> bool {
        self.mode != NiktoMode::Missing
    }

    fn web_audit(&self) -> bool {
        true
    }

    fn count_findings(&self, output: &str) -> usize {
        output
            .lines()
            .map(str::trim_start)
            .filter(|line| line.starts_with("+ "))
            .filter(|line| !NIKTO_HEADER_PREFIXES.iter().any(|p| line.starts_with(p)))
            .filter(|line| !line.contains("host(s) tested"))
            .count()
    }

    fn run(&self, target: &str, timeout: Duration) -> LineStream {
        match self.command(target) {
            Some(spec) => spawn_lines(spec, timeout),
            None => single_line("Nikto not installed (and Docker not found). Skipping web scan."),
        }
    }
}

pub struct SslscanTool {
    path: Option<String>,
}

impl SslscanTool {
    pub fn discover(configured: Option<&str>) -> Self {
        Self {
            path: configured
                .map(ToString::to_string)
                .or_else(|| find_binary("sslscan")),
        }
    }
}

impl ScanTool for SslscanTool {
    fn name(&self) -> &'static str {
        "sslscan"
    }

    fn label(&self) -> &'static str {
        "SSLScan"
    }

    fn description(&self) -> &'static str {
        "TLS/SSL configuration audit (protocol versions, weak ciphers, certificate details)"
    }

    fn relevant_ports(&self) -> &'static [u16] {
        TLS_PORTS
    }

    fn is_available(&self) -> bool {
        self.path.is_some()
    }

    fn count_findings(&self, output: &str) -> usize {
        output
            .lines()
            .filter(|line| {
                let line = line.trim();
                ["SSLv2", "SSLv3", "TLSv1.0", "TLSv1.1"]
                    .iter()
                    .any(|proto| line.starts_with(proto))
                    && line.contains("enabled")
            })
            .count()
    }

    fn run(&self, target: &str, timeout: Duration) -> LineStream {
        match &self.path {
            Some(path) => spawn_lines(CommandSpec::new(path, ["--no-colour", target]), timeout),
            None => single_line("sslscan not installed. Skipping TLS audit."),
        }
    }
}

pub struct GobusterTool {
    path: Option<String>,
    wordlist: String,
}

impl GobusterTool {
    pub fn discover(configured: Option<&str>, wordlist: &str) -> Self {
        Self {
            path: configured
                .map(ToString::to_string)
                .or_else(|| find_binary("gobuster")),
            wordlist: wordlist.to_string(),
        }
    }
}

impl ScanTool for GobusterTool {
    fn name(&self) -> &'static str {
        "gobuster"
    }

    fn label(&self) -> &'static str {
        "Gobuster"
    }

    fn description(&self) -> &'static str {
        "Directory and file brute-forcing against the web root"
    }

    fn relevant_ports(&self) -> &'static [u16] {
        WEB_PORTS
    }

    fn is_available(&self) -> bool {
        self.path.is_some() && Path::new(&self.wordlist).exists()
    }

    fn count_findings(&self, output: &str) -> usize {
        output.lines().filter(|line| line.contains("(Status:")).count()
    }

    fn run(&self, target: &str, timeout: Duration) -> LineStream {
        let Some(path) = self.path.as_ref().filter(|_| self.is_available()) else {
            return single_line("gobuster or its wordlist is missing. Skipping directory scan.");
        };
        let url = if target.starts_with("http") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        spawn_lines(
            CommandSpec::new(
                path,
                [
                    "dir".to_string(),
                    "-u".to_string(),
                    url,
                    "-w".to_string(),
                    self.wordlist.clone(),
                    "-q".to_string(),
                    "--no-color".to_string(),
                ],
            ),
            timeout,
        )
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    baseline: Arc<dyn ScanTool>,
    followups: Vec<Arc<dyn ScanTool>>,
}

impl ToolRegistry {
    pub fn new(baseline: Arc<dyn ScanTool>, followups: Vec<Arc<dyn ScanTool>>) -> Self {
        Self {
            baseline,
            followups,
        }
    }

    pub fn from_config(paths: &ToolPaths) -> Self {
        Self::new(
            Arc::new(NmapTool::discover(paths.nmap_path.as_deref())),
            vec![
                Arc::new(NiktoTool::discover(
                    paths.nikto_path.as_deref(),
                    paths.docker_path.as_deref(),
                )),
                Arc::new(SslscanTool::discover(paths.sslscan_path.as_deref())),
                Arc::new(GobusterTool::discover(
                    paths.gobuster_path.as_deref(),
                    &paths.gobuster_wordlist,
                )),
            ],
        )
    }

    pub fn baseline(&self) -> &Arc<dyn ScanTool> {
        &self.baseline
    }

    pub fn followup(&self, name: &str) -> Option<&Arc<dyn ScanTool>> {
        self.followups.iter().find(|t| t.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ScanTool>> {
        if self.baseline.name() == name {
            Some(&self.baseline)
        } else {
            self.followup(name)
        }
    }

    pub fn catalog(&self) -> Vec<ToolInfo> {
        self.followups.iter().map(|t| describe(t.as_ref())).collect()
    }

    pub fn describe_baseline(&self) -> ToolInfo {
        describe(self.baseline.as_ref())
    }

    /// Port heuristic used whenever the oracle cannot pick follow-ups: every follow-up whose
    /// relevant ports intersect the open ones, in registry order.
    pub fn select_by_ports(&self, open_ports: &BTreeSet<u16>) -> Vec<String> {
        self.followups
            .iter()
            .filter(|t| t.relevant_ports().iter().any(|p| open_ports.contains(p)))
            .map(|t| t.name().to_string())
            .collect()
    }
}

fn describe(tool: &dyn ScanTool) -> ToolInfo {
    ToolInfo {
        name: tool.name().to_string(),
        label: tool.label().to_string(),
        description: tool.description().to_string(),
        ports: tool.relevant_ports().to_vec(),
        available: tool.is_available(),
    }
}

fn find_binary(name: &str) -> Option<String> {
    which::which(name)
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(
            Arc::new(NmapTool::new(None)),
            vec![
                Arc::new(NiktoTool::new(NiktoMode::Missing)),
                Arc::new(SslscanTool { path: None }),
                Arc::new(GobusterTool {
                    path: None,
                    wordlist: String::new(),
                }),
            ],
        )
    }

    #[test]
    fn port_heuristic_selects_intersecting_tools() {
        let reg = registry();
        assert_eq!(
            reg.select_by_ports(&BTreeSet::from([80, 443])),
            vec!["nikto", "sslscan", "gobuster"]
        );
        assert_eq!(reg.select_by_ports(&BTreeSet::from([8443])), vec!["nikto", "sslscan", "gobuster"]);
        assert_eq!(reg.select_by_ports(&BTreeSet::from([80])), vec!["nikto", "gobuster"]);
        assert!(reg.select_by_ports(&BTreeSet::from([22, 445])).is_empty());
    }

    #[test]
    fn lookup_covers_baseline_and_followups() {
        let reg = registry();
        assert_eq!(reg.get("nmap").map(|t| t.name()), Some("nmap"));
        assert!(reg.followup("nmap").is_none());
        assert_eq!(reg.followup("sslscan").map(|t| t.name()), Some("sslscan"));
        assert!(reg.get("metasploit").is_none());
        assert_eq!(reg.catalog().len(), 3);
        assert!(!reg.describe_baseline().available);
    }

    #[tokio::test]
    async fn missing_tool_yields_one_descriptive_line() {
        let nikto = NiktoTool::new(NiktoMode::Missing);
        let lines: Vec<String> = nikto.run("10.0.0.1", Duration::from_secs(1)).collect().await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Skipping web scan"));
    }

    #[test]
    fn docker_nikto_rewrites_localhost() {
        let nikto = NiktoTool::new(NiktoMode::Docker("docker".to_string()));
        let spec = nikto.command("127.0.0.1").expect("command");
        assert!(spec.args.contains(&"http://host.docker.internal:80".to_string()));
        let spec = nikto.command("10.0.0.5").expect("command");
        assert!(spec.args.contains(&"http://10.0.0.5:80".to_string()));
    }

    #[test]
    fn nikto_counts_findings_but_not_headers() {
        let out = "\
- Nikto v2.5.0
+ Target IP:          10.0.0.5
+ Target Hostname:    10.0.0.5
+ Target Port:        80
+ Start Time:         2026-10-17 10:00:00
+ Server: Apache/2.4.41 (Ubuntu)
+ /: The anti-clickjacking X-Frame-Options header is not present.
+ /: The X-Content-Type-Options header is not set.
+ /icons/: Directory indexing found.
+ 1 host(s) tested";
        assert_eq!(NiktoTool::new(NiktoMode::Missing).count_findings(out), 3);
    }

    #[test]
    fn sslscan_counts_weak_protocols() {
        let out = "  SSLv3     enabled\n  TLSv1.0   enabled\n  TLSv1.2   enabled\n  SSLv2     disabled";
        assert_eq!(SslscanTool { path: None }.count_findings(out), 2);
    }
}
