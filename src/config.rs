use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration, loaded once at startup and passed by reference
/// into the pipeline components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Organizations whose identity this deployment protects.
    #[serde(default)]
    pub organizations: Vec<OrgPattern>,
    /// Additional brand domains to guard against typosquatting.
    #[serde(default)]
    pub brand_domains: Vec<String>,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
    #[serde(default)]
    pub account_status: AccountStatusConfig,
    /// Known internal staff / vendor contacts, keyed by email address.
    /// Explanatory only; roster hits never move the risk score.
    #[serde(default)]
    pub roster: HashMap<String, RosterEntry>,
    #[serde(default)]
    pub osint: OsintConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgPattern {
    pub name: String,
    pub domains: Vec<String>,
    /// Pattern a legitimate sender address for this org must match.
    /// Falls back to a domain-suffix check when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_regex: Option<String>,
    #[serde(skip)]
    pub compiled_email_regex: Option<Regex>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowlistConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Explicit per-account and per-domain dispositions maintained by IT.
/// Values: "blocked" / "deny" force-quarantine territory, "allow" / "ok"
/// near-zero risk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountStatusConfig {
    #[serde(default)]
    pub emails: HashMap<String, String>,
    #[serde(default)]
    pub domains: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsintConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urlscan_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abuseipdb_api_key: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    /// Soft wall-clock budget for the whole probe pass; optional probes are
    /// skipped once the remainder drops below their minimum cost.
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    1200
}

fn default_total_timeout_ms() -> u64 {
    1500
}

fn default_budget_ms() -> u64 {
    2200
}

impl Default for OsintConfig {
    fn default() -> Self {
        Self {
            urlscan_api_key: None,
            abuseipdb_api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            total_timeout_ms: default_total_timeout_ms(),
            budget_ms: default_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Domain reputation changes slowly; cache for days.
    #[serde(default = "default_domain_ttl")]
    pub domain_ttl_seconds: u64,
    /// Bot infrastructure churns; keep IP facts for hours only.
    #[serde(default = "default_ip_ttl")]
    pub ip_ttl_seconds: u64,
}

fn default_domain_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_ip_ttl() -> u64 {
    24 * 3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            domain_ttl_seconds: default_domain_ttl(),
            ip_ttl_seconds: default_ip_ttl(),
        }
    }
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.compile_patterns()?;
        Ok(config)
    }

    /// Pre-compile org email patterns; an invalid pattern is a startup error,
    /// not a per-email one.
    pub fn compile_patterns(&mut self) -> Result<()> {
        for org in &mut self.organizations {
            if let Some(pattern) = &org.email_regex {
                let rx = Regex::new(&format!("(?i){pattern}"))
                    .with_context(|| format!("Invalid email_regex for org '{}'", org.name))?;
                org.compiled_email_regex = Some(rx);
            }
        }
        Ok(())
    }

    /// Find the protected org a claimed domain belongs to, if any.
    /// Subdomains of an org domain count as that org.
    pub fn org_for_domain(&self, domain: &str) -> Option<&OrgPattern> {
        let domain = domain.to_lowercase();
        self.organizations.iter().find(|org| {
            org.domains.iter().any(|d| {
                let d = d.to_lowercase();
                domain == d || domain.ends_with(&format!(".{d}"))
            })
        })
    }

    /// True when the address or its domain is explicitly allowlisted.
    pub fn allowlist_hit(&self, addr: Option<&str>, domain: Option<&str>) -> bool {
        if let Some(a) = addr.map(str::to_lowercase) {
            if self.allowlist.addresses.iter().any(|x| x.to_lowercase() == a) {
                return true;
            }
        }
        if let Some(d) = domain.map(str::to_lowercase) {
            if self.allowlist.domains.iter().any(|x| x.to_lowercase() == d) {
                return true;
            }
        }
        false
    }

    /// Explicit account disposition for the address or its domain.
    /// Address entries take precedence over domain entries.
    pub fn account_status(&self, addr: Option<&str>, domain: Option<&str>) -> Option<String> {
        if let Some(a) = addr {
            if let Some(status) = self.account_status.emails.get(&a.to_lowercase()) {
                return Some(status.clone());
            }
        }
        if let Some(d) = domain {
            if let Some(status) = self.account_status.domains.get(&d.to_lowercase()) {
                return Some(status.clone());
            }
        }
        None
    }

    pub fn roster_entry(&self, addr: &str) -> Option<&RosterEntry> {
        self.roster.get(&addr.to_lowercase())
    }
}

impl OrgPattern {
    /// Does this sender address pass the org's identity check?
    pub fn email_matches(&self, email: &str) -> bool {
        let email = email.to_lowercase();
        if let Some(rx) = &self.compiled_email_regex {
            return rx.is_match(&email);
        }
        // No pattern configured: accept addresses on the org's own domains.
        let addr_domain = email.split('@').next_back().unwrap_or("");
        self.domains.iter().any(|d| {
            let d = d.to_lowercase();
            addr_domain == d || addr_domain.ends_with(&format!(".{d}"))
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            organizations: vec![OrgPattern {
                name: "Example Clinic".to_string(),
                domains: vec!["example-clinic.com".to_string()],
                email_regex: Some(
                    r"^[a-z0-9._%+-]+@([a-z0-9-]+\.)?example-clinic\.com$".to_string(),
                ),
                compiled_email_regex: None,
            }],
            brand_domains: vec!["paypal.com".to_string(), "docusign.com".to_string()],
            allowlist: AllowlistConfig {
                addresses: vec!["newsletter@trusted-vendor.example".to_string()],
                domains: vec!["trusted-vendor.example".to_string()],
            },
            account_status: AccountStatusConfig {
                emails: HashMap::from([(
                    "spammer@known-bad.example".to_string(),
                    "blocked".to_string(),
                )]),
                domains: HashMap::from([("known-bad.example".to_string(), "blocked".to_string())]),
            },
            roster: HashMap::from([(
                "frontdesk@example-clinic.com".to_string(),
                RosterEntry {
                    display_name: Some("Front Desk".to_string()),
                    company: Some("Example Clinic".to_string()),
                    category: Some("internal_staff".to_string()),
                    trust_tier: Some("high".to_string()),
                },
            )]),
            osint: OsintConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}
