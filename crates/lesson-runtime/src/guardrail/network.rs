//! Network guardrail: domain allowlist plus a per-activity call quota.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use reqwest::Url;
use tracing::debug;

use super::GuardrailViolation;
use crate::fetch::BundleFetcher;
use crate::module::ActivityError;

pub struct NetworkGuard {
    allowed_domains: Vec<String>,
    max_api_calls: u32,
    calls: AtomicU32,
    fetcher: Arc<dyn BundleFetcher>,
}

impl fmt::Debug for NetworkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkGuard")
            .field("allowed_domains", &self.allowed_domains)
            .field("max_api_calls", &self.max_api_calls)
            .field("calls", &self.request_count())
            .finish()
    }
}

/// Whether a request to `url` leaves the local machine.
enum Target {
    /// `file:`, `blob:`, `data:`; never counted.
    Local,
    Loopback,
    Remote(String),
}

impl NetworkGuard {
    pub fn new(
        allowed_domains: &[String],
        max_api_calls: u32,
        fetcher: Arc<dyn BundleFetcher>,
    ) -> Self {
        Self {
            allowed_domains: allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            max_api_calls,
            calls: AtomicU32::new(0),
            fetcher,
        }
    }

    fn classify(url: &Url) -> Result<Target, GuardrailViolation> {
        match url.scheme() {
            "file" | "blob" | "data" => return Ok(Target::Local),
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(GuardrailViolation::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unsupported scheme {other}"),
                })
            }
        }
        let Some(host) = url.host_str() else {
            return Err(GuardrailViolation::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".into(),
            });
        };
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        if host == "localhost" {
            return Ok(Target::Loopback);
        }
        match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => Ok(Target::Loopback),
            _ => Ok(Target::Remote(host)),
        }
    }

    fn domain_allowed(&self, host: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|d| host == d || host.strip_suffix(d.as_str()).is_some_and(|p| p.ends_with('.')))
    }

    /// Admit or refuse one request. Admitted non-local requests consume
    /// quota.
    pub fn check_request(&self, raw: &str) -> Result<Url, GuardrailViolation> {
        let url = Url::parse(raw).map_err(|e| GuardrailViolation::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        match Self::classify(&url)? {
            Target::Local => return Ok(url),
            Target::Loopback => {}
            Target::Remote(host) => {
                if !self.domain_allowed(&host) {
                    return Err(GuardrailViolation::DomainNotAllowed { host });
                }
            }
        }
        let limit = self.max_api_calls;
        self.calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| GuardrailViolation::QuotaExceeded { limit })?;
        debug!(url = %url, calls = self.request_count(), limit, "network request admitted");
        Ok(url)
    }

    /// Check, then fetch through the configured fetcher.
    pub async fn fetch(&self, raw: &str) -> Result<Vec<u8>, ActivityError> {
        let url = self.check_request(raw)?;
        Ok(self.fetcher.fetch(&url).await?)
    }

    pub fn request_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_api_calls(&self) -> u32 {
        self.max_api_calls
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}
