use std::fmt::Write;

use crate::{
    models::{OsFamily, RemediationFinding, RemediationReport, Severity, ToolRun},
    parser::{detect_os, parse_open_ports},
};

/// Platform whose commands are used when the target OS could not be inferred.
pub const DEFAULT_PLATFORM: OsFamily = OsFamily::Linux;

struct Remedy {
    key: &'static str,
    description: &'static str,
    severity: Severity,
    windows: &'static [&'static str],
    linux: &'static [&'static str],
}

impl Remedy {
    fn commands(&self, os: OsFamily) -> Vec<String> {
        let cmds = match os {
            OsFamily::Windows => self.windows,
            OsFamily::Linux => self.linux,
            OsFamily::Unknown => match DEFAULT_PLATFORM {
                OsFamily::Windows => self.windows,
                _ => self.linux,
            },
        };
        cmds.iter().map(ToString::to_string).collect()
    }
}

const RISKY_PORTS: &[Remedy] = &[
    Remedy {
        key: "445/tcp",
        description: "SMB (Windows File Sharing) - High risk for ransomware/lateral movement",
        severity: Severity::High,
        windows: &[
            "# Disable SMBv1 (EternalBlue mitigation)",
            "Set-SmbServerConfiguration -EnableSMB1Protocol $false -Force",
            "",
            "# Block SMB from external networks",
            "netsh advfirewall firewall add rule name=\"Block SMB Inbound\" dir=in action=block protocol=tcp localport=445",
        ],
        linux: &[
            "# Disable Samba if not needed",
            "sudo systemctl stop smbd && sudo systemctl disable smbd",
            "",
            "# Or block via firewall",
            "sudo ufw deny 445/tcp",
        ],
    },
    Remedy {
        key: "135/tcp",
        description: "MSRPC - Used for DCOM, potential for RPC exploits",
        severity: Severity::Medium,
        windows: &[
            "# Block RPC from external networks",
            "netsh advfirewall firewall add rule name=\"Block RPC Inbound\" dir=in action=block protocol=tcp localport=135",
        ],
        linux: &["# RPC typically not used on Linux", "sudo ufw deny 135/tcp"],
    },
    Remedy {
        key: "23/tcp",
        description: "Telnet - Unencrypted remote access (CRITICAL)",
        severity: Severity::Critical,
        windows: &[
            "# Disable Telnet server",
            "Stop-Service tlntsvr -Force",
            "Set-Service tlntsvr -StartupType Disabled",
        ],
        linux: &[
            "# Disable and remove telnet",
            "sudo systemctl stop telnet.socket && sudo systemctl disable telnet.socket",
            "sudo apt remove telnetd -y  # Debian/Ubuntu",
        ],
    },
    Remedy {
        key: "21/tcp",
        description: "FTP - Unencrypted file transfer",
        severity: Severity::Medium,
        windows: &[
            "# If FTP not needed, disable it",
            "Stop-Service ftpsvc -Force",
            "Set-Service ftpsvc -StartupType Disabled",
        ],
        linux: &[
            "# Switch to SFTP instead of FTP",
            "sudo systemctl stop vsftpd && sudo systemctl disable vsftpd",
        ],
    },
    Remedy {
        key: "80/tcp",
        description: "HTTP - Unencrypted web traffic",
        severity: Severity::Low,
        windows: &[
            "# Redirect HTTP to HTTPS (IIS)",
            "# Install URL Rewrite module, then add redirect rule",
            "# Or enforce HTTPS-only in application",
        ],
        linux: &[
            "# Redirect HTTP to HTTPS (Apache)",
            "sudo a2enmod rewrite",
            "# Add to .htaccess: RewriteRule ^(.*)$ https://%{HTTP_HOST}%{REQUEST_URI} [L,R=301]",
        ],
    },
];

// matched case-insensitively against web audit output
const WEB_PATTERNS: &[Remedy] = &[
    Remedy {
        key: "directory indexing",
        description: "Directory listing enabled - exposes file structure",
        severity: Severity::Medium,
        windows: &[
            "# Disable directory browsing in IIS",
            "Set-WebConfigurationProperty -pspath 'IIS:\\Sites\\Default Web Site' -filter /system.webServer/directoryBrowse -name enabled -value false",
        ],
        linux: &[
            "# Disable directory listing (Apache)",
            "echo 'Options -Indexes' | sudo tee -a /var/www/html/.htaccess",
        ],
    },
    Remedy {
        key: "x-frame-options",
        description: "Missing X-Frame-Options header - clickjacking risk",
        severity: Severity::Medium,
        windows: &[
            "# Add header in IIS via web.config",
            "# <customHeaders><add name=\"X-Frame-Options\" value=\"SAMEORIGIN\" /></customHeaders>",
        ],
        linux: &[
            "# Add header in Apache",
            "echo 'Header always set X-Frame-Options \"SAMEORIGIN\"' | sudo tee -a /etc/apache2/conf-available/security.conf",
        ],
    },
    Remedy {
        key: "x-content-type-options",
        description: "Missing X-Content-Type-Options header",
        severity: Severity::Low,
        windows: &[
            "# Add in web.config",
            "# <add name=\"X-Content-Type-Options\" value=\"nosniff\" />",
        ],
        linux: &[
            "# Add header in Apache",
            "sudo a2enmod headers",
            "echo 'Header always set X-Content-Type-Options \"nosniff\"' | sudo tee -a /etc/apache2/conf-available/security.conf",
        ],
    },
    Remedy {
        key: "osvdb",
        description: "Known vulnerability in OSVDB database",
        severity: Severity::High,
        windows: &["# Update the affected software to the latest version"],
        linux: &["sudo apt update && sudo apt upgrade -y"],
    },
];

/// Static-table findings for a finished scan. `ai_recommendations` is left empty; see
/// [`needs_ai_supplement`].
pub fn derive(baseline_tool: &str, baseline_output: &str, web_audits: &[ToolRun]) -> RemediationReport {
    let os = detect_os(baseline_output);
    let mut findings = Vec::new();

    for port in parse_open_ports(baseline_output) {
        let key = port.key();
        if let Some(remedy) = RISKY_PORTS.iter().find(|r| r.key == key) {
            findings.push(RemediationFinding {
                source: baseline_tool.to_string(),
                port: Some(key),
                finding: None,
                description: remedy.description.to_string(),
                severity: remedy.severity,
                commands: remedy.commands(os),
            });
        }
    }

    for remedy in WEB_PATTERNS {
        let hit = web_audits
            .iter()
            .find(|run| run.output.to_lowercase().contains(remedy.key));
        if let Some(run) = hit {
            findings.push(RemediationFinding {
                source: run.tool.clone(),
                port: None,
                finding: Some(remedy.key.to_string()),
                description: remedy.description.to_string(),
                severity: remedy.severity,
                commands: remedy.commands(os),
            });
        }
    }

    RemediationReport {
        os_detected: os,
        findings,
        ai_recommendations: String::new(),
    }
}

pub fn needs_ai_supplement(report: &RemediationReport) -> bool {
    report.findings.len() < 2 || report.os_detected == OsFamily::Unknown
}

/// Markdown rendering of a report, one fenced command block per finding.
pub fn format_for_display(report: &RemediationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "**Detected OS:** {}", report.os_detected.as_str().to_uppercase());
    out.push('\n');

    if report.findings.is_empty() {
        out.push_str("No specific fixes found in database. See AI recommendations below.\n");
    }

    let fence = if report.os_detected == OsFamily::Windows {
        "```powershell"
    } else {
        "```bash"
    };
    for (i, finding) in report.findings.iter().enumerate() {
        let _ = writeln!(
            out,
            "### Fix #{}: [{}] {}",
            i + 1,
            finding.severity.as_str(),
            finding.description
        );
        match (&finding.port, &finding.finding) {
            (Some(port), _) => {
                let _ = writeln!(out, "*Source: {} - Port {port}*", finding.source);
            }
            (None, pattern) => {
                let _ = writeln!(
                    out,
                    "*Source: {} - {}*",
                    finding.source,
                    pattern.as_deref().unwrap_or("Web vulnerability")
                );
            }
        }
        out.push_str(fence);
        out.push('\n');
        for cmd in &finding.commands {
            out.push_str(cmd);
            out.push('\n');
        }
        out.push_str("```\n\n");
    }

    if !report.ai_recommendations.trim().is_empty() {
        out.push_str("### Additional AI Recommendations\n");
        out.push_str(&report.ai_recommendations);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::NMAP_WEB_SAMPLE;

    fn nikto(output: &str) -> ToolRun {
        ToolRun {
            tool: "nikto".to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn windows_host_gets_powershell_commands() {
        let nmap = "135/tcp open msrpc\n445/tcp open microsoft-ds\n23/tcp open telnet\n";
        let report = derive("nmap", nmap, &[]);
        assert_eq!(report.os_detected, OsFamily::Windows);
        assert_eq!(report.findings.len(), 3);
        let smb = report
            .findings
            .iter()
            .find(|f| f.port.as_deref() == Some("445/tcp"))
            .expect("smb finding");
        assert_eq!(smb.severity, Severity::High);
        assert!(smb.commands.iter().any(|c| c.contains("Set-SmbServerConfiguration")));
        assert!(!needs_ai_supplement(&report));
        assert!(format_for_display(&report).contains("```powershell"));
    }

    #[test]
    fn unknown_os_falls_back_to_default_platform() {
        let report = derive("nmap", NMAP_WEB_SAMPLE, &[]);
        assert_eq!(report.os_detected, OsFamily::Unknown);
        assert_eq!(report.findings.len(), 1);
        assert!(report.findings[0].commands.iter().any(|c| c.contains("a2enmod")));
        assert!(needs_ai_supplement(&report));
    }

    #[test]
    fn web_patterns_match_case_insensitively_once() {
        let run = nikto(
            "+ /: The anti-clickjacking X-Frame-Options header is not present.\n\
             + /icons/: Directory indexing found.\n\
             + /images/: Directory indexing found.\n\
             + OSVDB-3233: /icons/README: Apache default file found.",
        );
        let report = derive("nmap", "22/tcp open ssh OpenSSH Ubuntu", &[run]);
        let patterns: Vec<_> = report
            .findings
            .iter()
            .filter_map(|f| f.finding.as_deref())
            .collect();
        assert_eq!(patterns, vec!["directory indexing", "x-frame-options", "osvdb"]);
        assert!(report.findings.iter().all(|f| f.source == "nikto"));
    }

    #[test]
    fn display_lists_sources_and_ai_section() {
        let run = nikto("X-Content-Type-Options header is not set");
        let mut report = derive("nmap", NMAP_WEB_SAMPLE, &[run]);
        report.ai_recommendations = "1. Enable HSTS".to_string();
        let text = format_for_display(&report);
        assert!(text.starts_with("**Detected OS:** UNKNOWN"));
        assert!(text.contains("### Fix #1: [LOW] HTTP - Unencrypted web traffic"));
        assert!(text.contains("*Source: nmap - Port 80/tcp*"));
        assert!(text.contains("*Source: nikto - x-content-type-options*"));
        assert!(text.contains("### Additional AI Recommendations\n1. Enable HSTS"));
    }

    #[test]
    fn empty_report_points_at_ai_recommendations() {
        let report = derive("nmap", "", &[]);
        assert!(report.findings.is_empty());
        assert!(format_for_display(&report).contains("No specific fixes found"));
    }
}
