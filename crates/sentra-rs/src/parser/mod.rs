use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;

use crate::models::OsFamily;

static PORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{1,5})/(tcp|udp)\s+open(?:\s+(\S+))?(?:\s|$)").expect("static regex")
});

const WINDOWS_HINTS: &[&str] = &["microsoft", "windows", "msrpc", "microsoft-ds", "netbios"];
const LINUX_HINTS: &[&str] = &["ubuntu", "debian", "centos", "linux", "openssh", "apache"];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub service: Option<String>,
}

impl OpenPort {
    /// `445/tcp` style key used by the remediation tables.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

/// Open ports from nmap's normal output (`22/tcp  open  ssh`). Filtered and closed rows are skipped.
pub fn parse_open_ports(output: &str) -> Vec<OpenPort> {
    let mut seen = BTreeSet::new();
    output
        .lines()
        .filter_map(|line| {
            let caps = PORT_LINE.captures(line)?;
            let port: u16 = caps.get(1)?.as_str().parse().ok()?;
            let protocol = caps.get(2)?.as_str().to_string();
            if !seen.insert((port, protocol.clone())) {
                return None;
            }
            Some(OpenPort {
                port,
                protocol,
                service: caps.get(3).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}

pub fn open_port_numbers(output: &str) -> BTreeSet<u16> {
    parse_open_ports(output).into_iter().map(|p| p.port).collect()
}

/// Keyword heuristic over the baseline output. Windows markers win over Linux ones.
pub fn detect_os(output: &str) -> OsFamily {
    let lower = output.to_lowercase();
    if WINDOWS_HINTS.iter().any(|hint| lower.contains(hint)) {
        OsFamily::Windows
    } else if LINUX_HINTS.iter().any(|hint| lower.contains(hint)) {
        OsFamily::Linux
    } else {
        OsFamily::Unknown
    }
}

#[cfg(test)]
pub(crate) const NMAP_WEB_SAMPLE: &str = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2026-10-17 10:00 UTC
Nmap scan report for demo.local (192.168.1.10)
Host is up (0.00042s latency).
Not shown: 98 closed tcp ports (conn-refused)
PORT    STATE SERVICE
80/tcp  open  http
443/tcp open  https
Nmap done: 1 IP address (1 host up) scanned in 0.12 seconds
";
