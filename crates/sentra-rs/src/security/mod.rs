use std::{net::IpAddr, str::FromStr, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{info, warn};

use crate::config::AppConfig;

static PRIVATE_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    ["127.0.0.0/8", "10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "::1/128"]
        .iter()
        .filter_map(|net| IpNet::from_str(net).ok())
        .collect()
});

/// Decides whether a target may be scanned at all. Consulted once per scan start.
#[async_trait]
pub trait OwnershipVerifier: Send + Sync {
    async fn verify(&self, target: &str) -> bool;
}

pub fn is_private_target(target: &str) -> bool {
    if target.eq_ignore_ascii_case("localhost") {
        return true;
    }
    IpAddr::from_str(target)
        .map(|ip| PRIVATE_NETS.iter().any(|net| net.contains(&ip)))
        .unwrap_or(false)
}

/// Exact (case-insensitive) host match, or membership in an allow-listed CIDR block.
pub fn in_allowlist(target: &str, allowlist: &[String]) -> bool {
    if allowlist
        .iter()
        .any(|item| item.eq_ignore_ascii_case(target))
    {
        return true;
    }

    if let Ok(ip) = IpAddr::from_str(target) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry)
                .map(|net| net.contains(&ip))
                .unwrap_or(false)
        });
    }

    false
}

/// Private and allow-listed targets pass; anything else must serve the marker file over HTTP.
pub struct HttpOwnershipVerifier {
    client: reqwest::Client,
    allowlist: Vec<String>,
    marker: String,
}

impl HttpOwnershipVerifier {
    pub fn new(allowlist: Vec<String>, marker: String, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            allowlist,
            marker,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> reqwest::Result<Self> {
        Self::new(
            cfg.verify_allowlist.clone(),
            cfg.verify_marker.clone(),
            Duration::from_secs(cfg.verify_timeout_secs),
        )
    }

    async fn marker_present(&self, base_url: &str) -> bool {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), self.marker);
        info!(%url, "checking for ownership marker");
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(%url, status = %resp.status(), "ownership marker missing");
                false
            }
            Err(e) => {
                warn!(%url, error = %e, "ownership check failed");
                false
            }
        }
    }
}

#[async_trait]
impl OwnershipVerifier for HttpOwnershipVerifier {
    async fn verify(&self, target: &str) -> bool {
        if is_private_target(target) {
            info!(target, "private or local target, verification bypassed");
            return true;
        }
        if in_allowlist(target, &self.allowlist) {
            info!(target, "allow-listed target");
            return true;
        }
        let base = if target.starts_with("http") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        self.marker_present(&base).await
    }
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Router};

    use super::*;

    fn verifier(allowlist: &[&str]) -> HttpOwnershipVerifier {
        HttpOwnershipVerifier::new(
            allowlist.iter().map(ToString::to_string).collect(),
            "sentra-verify.txt".to_string(),
            Duration::from_secs(2),
        )
        .expect("client")
    }

    #[test]
    fn private_ranges_and_localhost_bypass() {
        for target in ["127.0.0.1", "10.1.2.3", "172.16.0.1", "172.31.255.1", "192.168.1.10", "::1", "LOCALHOST"] {
            assert!(is_private_target(target), "{target}");
        }
        for target in ["172.32.0.1", "8.8.8.8", "example.com", "192.169.0.1"] {
            assert!(!is_private_target(target), "{target}");
        }
    }

    #[test]
    fn allowlist_matches_hosts_and_cidrs() {
        let list = vec!["scanme.nmap.org".to_string(), "203.0.113.0/24".to_string()];
        assert!(in_allowlist("ScanMe.Nmap.org", &list));
        assert!(in_allowlist("203.0.113.7", &list));
        assert!(!in_allowlist("198.51.100.1", &list));
        assert!(!in_allowlist("nmap.org", &list));
    }

    #[tokio::test]
    async fn allowlisted_target_skips_http() {
        assert!(verifier(&["scanme.nmap.org"]).verify("scanme.nmap.org").await);
    }

    #[tokio::test]
    async fn marker_file_decides_public_targets() {
        let app = Router::new().route("/sentra-verify.txt", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let v = verifier(&[]);
        assert!(v.marker_present(&format!("http://{addr}")).await);
        assert!(!v.marker_present(&format!("http://{addr}/nested")).await);
    }

    #[tokio::test]
    async fn unreachable_target_is_rejected() {
        let v = verifier(&[]);
        // nothing listens on the discard port
        assert!(!v.marker_present("http://127.0.0.1:9").await);
    }
}
