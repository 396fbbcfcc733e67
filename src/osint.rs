use crate::config::OsintConfig;
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::time::{Duration, Instant};

lazy_static! {
    static ref PRESENCE_HREF_RX: Regex = Regex::new(
        r#"(?i)href=["']([^"']*linkedin\.com/(?:company|school|showcase)/[^"']*)["']"#
    )
    .unwrap();
}

/// Soft wall-clock budget for one probe pass.
///
/// Checked cooperatively before each optional lookup; once the remainder
/// drops below a probe's minimum cost the probe is skipped and its feature
/// stays unknown. Cancellation is cooperative, never preemptive.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn from_millis(budget_ms: u64) -> Self {
        Self::new(Duration::from_millis(budget_ms))
    }

    /// An already-exhausted budget, for forcing the degraded path in tests.
    pub fn expired() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Is there at least `min_cost` of budget left?
    pub fn allows(&self, min_cost: Duration) -> bool {
        self.remaining() >= min_cost
    }
}

/// Registration metadata from an RDAP lookup.
#[derive(Debug, Clone, Default)]
pub struct RdapMeta {
    pub registered_iso: Option<String>,
    pub registrant_name: Option<String>,
}

/// Result of the professional-presence homepage scan.
#[derive(Debug, Clone, Default)]
pub struct PresenceProbe {
    pub present: Option<bool>,
    pub url: String,
    pub probed_page: String,
}

/// Thin HTTP client over the external OSINT sources.
///
/// Every lookup is a pass-through: no scoring happens here, and every
/// failure or timeout degrades to "unknown" with a debug log. Nothing in
/// this module returns an error to the caller.
#[derive(Debug, Clone)]
pub struct ProbeClient {
    client: reqwest::Client,
    urlscan_key: Option<String>,
    abuseipdb_key: Option<String>,
}

impl ProbeClient {
    pub fn new(config: &OsintConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.total_timeout_ms))
            .user_agent("mailshield-intel/0.1")
            .build()?;
        Ok(Self {
            client,
            urlscan_key: config.urlscan_api_key.clone(),
            abuseipdb_key: config.abuseipdb_api_key.clone(),
        })
    }

    /// Count of certificate-transparency issuances seen for the domain.
    pub async fn crtsh_count(&self, domain: &str, deadline: &Deadline) -> Option<i64> {
        if !deadline.allows(Duration::from_millis(1000)) {
            log::debug!("crt.sh probe skipped for {domain}: budget exhausted");
            return None;
        }
        let url = format!("https://crt.sh/?q=%25.{domain}&output=json");
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().as_u16() == 404 => Some(0),
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<serde_json::Value>().await {
                    Ok(serde_json::Value::Array(items)) => Some(items.len() as i64),
                    Ok(_) => None,
                    Err(e) => {
                        log::debug!("crt.sh parse failed for {domain}: {e}");
                        None
                    }
                }
            }
            Ok(resp) => {
                log::debug!("crt.sh returned {} for {domain}", resp.status());
                None
            }
            Err(e) => {
                log::debug!("crt.sh probe failed for {domain}: {e}");
                None
            }
        }
    }

    /// Does the domain publish a security-contact policy file?
    pub async fn securitytxt_present(&self, domain: &str, deadline: &Deadline) -> Option<bool> {
        if !deadline.allows(Duration::from_millis(150)) {
            log::debug!("security.txt probe skipped for {domain}: budget exhausted");
            return None;
        }
        for path in ["/.well-known/security.txt", "/security.txt"] {
            let url = format!("https://{domain}{path}");
            if let Ok(resp) = self.client.get(&url).send().await {
                if resp.status().is_success() {
                    if let Ok(text) = resp.text().await {
                        if !text.is_empty() {
                            return Some(true);
                        }
                    }
                }
            }
        }
        Some(false)
    }

    /// How often the domain appears in urlscan.io submissions.
    pub async fn urlscan_total(&self, domain: &str, deadline: &Deadline) -> Option<i64> {
        let key = self.urlscan_key.as_deref()?;
        if !deadline.allows(Duration::from_millis(200)) {
            log::debug!("urlscan probe skipped for {domain}: budget exhausted");
            return None;
        }
        let result = self
            .client
            .get("https://urlscan.io/api/v1/search/")
            .header("API-Key", key)
            .query(&[("q", format!("domain:{domain}"))])
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .map(|v| v.get("total").and_then(|t| t.as_i64()).unwrap_or(0)),
            Ok(resp) => {
                log::debug!("urlscan returned {} for {domain}", resp.status());
                None
            }
            Err(e) => {
                log::debug!("urlscan probe failed for {domain}: {e}");
                None
            }
        }
    }

    /// Registration date and registrant name via RDAP.
    pub async fn rdap_domain_meta(&self, domain: &str, deadline: &Deadline) -> RdapMeta {
        if !deadline.allows(Duration::from_millis(200)) {
            log::debug!("RDAP probe skipped for {domain}: budget exhausted");
            return RdapMeta::default();
        }
        let url = format!("https://rdap.org/domain/{domain}");
        let data = match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<serde_json::Value>().await {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("RDAP parse failed for {domain}: {e}");
                        return RdapMeta::default();
                    }
                }
            }
            Ok(resp) => {
                log::debug!("RDAP returned {} for {domain}", resp.status());
                return RdapMeta::default();
            }
            Err(e) => {
                log::debug!("RDAP probe failed for {domain}: {e}");
                return RdapMeta::default();
            }
        };
        RdapMeta {
            registered_iso: Self::rdap_registration_date(&data),
            registrant_name: Self::rdap_registrant_name(&data),
        }
    }

    fn rdap_registration_date(data: &serde_json::Value) -> Option<String> {
        data.get("events")?
            .as_array()?
            .iter()
            .find(|e| {
                matches!(
                    e.get("eventAction").and_then(|a| a.as_str()),
                    Some("registration") | Some("registered")
                )
            })?
            .get("eventDate")?
            .as_str()
            .map(str::to_string)
    }

    fn rdap_registrant_name(data: &serde_json::Value) -> Option<String> {
        // vcardArray is ["vcard", [["fn", {}, "text", "Name"], ...]]
        for entity in data.get("entities")?.as_array()? {
            let Some(rows) = entity
                .get("vcardArray")
                .and_then(|v| v.as_array())
                .filter(|v| v.len() == 2)
                .and_then(|v| v[1].as_array())
            else {
                continue;
            };
            for row in rows {
                let Some(cells) = row.as_array().filter(|c| c.len() >= 4) else {
                    continue;
                };
                if cells[0].as_str() == Some("fn") {
                    if let Some(name) = cells[3].as_str() {
                        let name = name.trim();
                        if !name.is_empty() {
                            return Some(name.to_string());
                        }
                    }
                }
            }
        }
        None
    }

    /// IP abuse confidence score (0-100), when a key is configured.
    pub async fn abuse_ip_score(&self, ip: &str, deadline: &Deadline) -> Option<i64> {
        let key = self.abuseipdb_key.as_deref()?;
        if ip.is_empty() || !deadline.allows(Duration::from_millis(200)) {
            return None;
        }
        let result = self
            .client
            .get("https://api.abuseipdb.com/api/v2/check")
            .header("Key", key)
            .header("Accept", "application/json")
            .query(&[("ipAddress", ip), ("maxAgeInDays", "90")])
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                let payload = resp.json::<serde_json::Value>().await.ok()?;
                Some(
                    payload
                        .get("data")
                        .and_then(|d| d.get("abuseConfidenceScore"))
                        .and_then(|s| s.as_i64())
                        .unwrap_or(0),
                )
            }
            Ok(resp) => {
                log::debug!("abuseipdb returned {} for {ip}", resp.status());
                None
            }
            Err(e) => {
                log::debug!("abuseipdb probe failed for {ip}: {e}");
                None
            }
        }
    }

    /// Scan likely homepage paths for a professional-presence page link.
    ///
    /// Stops early when the remaining budget cannot cover another fetch.
    pub async fn presence_page(&self, domain: &str, deadline: &Deadline) -> PresenceProbe {
        if domain.is_empty() {
            return PresenceProbe::default();
        }
        let pages = [
            format!("https://{domain}/"),
            format!("https://www.{domain}/"),
            format!("https://{domain}/about"),
            format!("https://{domain}/contact"),
            format!("https://{domain}/company"),
            format!("https://{domain}/careers"),
        ];
        let mut probed_any = false;
        for page in &pages {
            if !deadline.allows(Duration::from_millis(200)) {
                break;
            }
            probed_any = true;
            let Some(html) = self.fetch_html(page).await else {
                continue;
            };
            if let Some(captures) = PRESENCE_HREF_RX.captures(&html) {
                return PresenceProbe {
                    present: Some(true),
                    url: captures[1].to_string(),
                    probed_page: page.clone(),
                };
            }
        }
        if probed_any {
            PresenceProbe {
                present: Some(false),
                url: String::new(),
                probed_page: String::new(),
            }
        } else {
            log::debug!("presence probe skipped for {domain}: budget exhausted");
            PresenceProbe::default()
        }
    }

    async fn fetch_html(&self, url: &str) -> Option<String> {
        let resp = self.client.get(url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let is_html = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        if !is_html {
            return None;
        }
        let text = resp.text().await.ok()?;
        // Cap what we scan; a presence link sits near the top when it exists.
        let cap = text
            .char_indices()
            .nth(300_000)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        Some(text[..cap].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsintConfig;

    fn client() -> ProbeClient {
        ProbeClient::new(&OsintConfig::default()).unwrap()
    }

    #[test]
    fn test_deadline_countdown() {
        let deadline = Deadline::from_millis(5000);
        assert!(deadline.allows(Duration::from_millis(1000)));
        assert!(!deadline.allows(Duration::from_secs(10)));
        assert!(!Deadline::expired().allows(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_probes() {
        let client = client();
        let deadline = Deadline::expired();
        assert_eq!(client.crtsh_count("example.com", &deadline).await, None);
        assert_eq!(
            client.securitytxt_present("example.com", &deadline).await,
            None
        );
        let meta = client.rdap_domain_meta("example.com", &deadline).await;
        assert!(meta.registered_iso.is_none());
        let presence = client.presence_page("example.com", &deadline).await;
        assert_eq!(presence.present, None);
    }

    #[tokio::test]
    async fn test_keyed_probes_require_keys() {
        // No API keys configured: these are unknown regardless of budget.
        let client = client();
        let deadline = Deadline::from_millis(10_000);
        assert_eq!(client.urlscan_total("example.com", &deadline).await, None);
        assert_eq!(client.abuse_ip_score("203.0.113.9", &deadline).await, None);
    }

    #[test]
    fn test_rdap_registration_date_extraction() {
        let data = serde_json::json!({
            "events": [
                {"eventAction": "expiration", "eventDate": "2030-01-01T00:00:00Z"},
                {"eventAction": "registration", "eventDate": "2015-06-01T00:00:00Z"}
            ]
        });
        assert_eq!(
            ProbeClient::rdap_registration_date(&data),
            Some("2015-06-01T00:00:00Z".to_string())
        );
        assert_eq!(
            ProbeClient::rdap_registration_date(&serde_json::json!({})),
            None
        );
    }

    #[test]
    fn test_rdap_registrant_name_extraction() {
        let data = serde_json::json!({
            "entities": [{
                "vcardArray": ["vcard", [
                    ["version", {}, "text", "4.0"],
                    ["fn", {}, "text", "Example Registrar LLC"]
                ]]
            }]
        });
        assert_eq!(
            ProbeClient::rdap_registrant_name(&data),
            Some("Example Registrar LLC".to_string())
        );
    }

    #[test]
    fn test_presence_regex() {
        let html = r#"<a href="https://www.linkedin.com/company/example-co/">Follow us</a>"#;
        let captures = PRESENCE_HREF_RX.captures(html).unwrap();
        assert!(captures[1].contains("linkedin.com/company/example-co"));
        assert!(PRESENCE_HREF_RX
            .captures(r#"<a href="https://example.com/about">About</a>"#)
            .is_none());
    }
}
