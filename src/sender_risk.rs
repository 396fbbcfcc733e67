use crate::config::Config;
use crate::email::CompactEmail;
use crate::osint::{Deadline, ProbeClient};
use crate::store::{FeatureStore, SenderGraph};
use crate::typosquat::{ProtectedDomains, TyposquatReason, TyposquatVerdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One observed (or unknown) fact about a sender.
///
/// `Null` means "we could not find out" and must never score as a measured
/// zero; every rule below skips unknowns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Null,
}

impl FeatureValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FeatureValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Text(v) => Some(v),
            _ => None,
        }
    }

    fn from_opt_int(v: Option<i64>) -> Self {
        v.map(FeatureValue::Int).unwrap_or(FeatureValue::Null)
    }

    fn from_opt_bool(v: Option<bool>) -> Self {
        v.map(FeatureValue::Bool).unwrap_or(FeatureValue::Null)
    }
}

/// Accumulated sender facts, keyed by dotted feature name.
pub type FeatureBag = BTreeMap<String, FeatureValue>;

/// Identity fields echoed alongside the features.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderIds {
    pub from_addr: Option<String>,
    pub from_domain: Option<String>,
    pub claimed_org_domain: Option<String>,
    pub message_id: Option<String>,
    pub date_iso: Option<String>,
    pub envelope_mail_from: Option<String>,
    pub envelope_client_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSummary {
    pub score: i64,
    pub notes: Vec<String>,
}

/// Full sender-intel output for one email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderIntel {
    pub features: FeatureBag,
    pub risk: RiskSummary,
    pub typosquatting: TyposquatVerdict,
    pub whitelist_hit: Option<bool>,
    pub account_status: Option<String>,
    pub ids: SenderIds,
    pub flat_kv: String,
    pub table_md: String,
}

impl SenderIntel {
    /// Neutral output used when the aggregator itself fails: no features,
    /// zero risk, one explanatory note.
    pub fn empty_with_note(note: &str) -> Self {
        Self {
            features: FeatureBag::new(),
            risk: RiskSummary {
                score: 0,
                notes: vec![note.to_string()],
            },
            typosquatting: TyposquatVerdict {
                suspect: false,
                closest_to: String::new(),
                reason: TyposquatReason::None,
            },
            whitelist_hit: None,
            account_status: None,
            ids: SenderIds::default(),
            flat_kv: String::new(),
            table_md: String::new(),
        }
    }

    /// Wire shape: features map with the nested risk / typosquatting /
    /// whitelist / account blocks, plus the ids block.
    pub fn to_value(&self) -> serde_json::Value {
        let mut features = serde_json::Map::new();
        for (key, value) in &self.features {
            features.insert(key.clone(), serde_json::to_value(value).unwrap_or_default());
        }
        features.insert(
            "risk".to_string(),
            serde_json::json!({"score": self.risk.score, "notes": self.risk.notes}),
        );
        features.insert(
            "typosquatting".to_string(),
            serde_json::json!({
                "suspect": self.typosquatting.suspect,
                "closest_to": self.typosquatting.closest_to,
                "reason": self.typosquatting.reason.as_str(),
            }),
        );
        features.insert(
            "whitelist".to_string(),
            serde_json::json!({"hit": self.whitelist_hit}),
        );
        features.insert(
            "account".to_string(),
            serde_json::json!({"status": self.account_status}),
        );
        serde_json::json!({
            "features": serde_json::Value::Object(features),
            "ids": self.ids,
            "flat_kv": self.flat_kv,
            "table_md": self.table_md,
        })
    }
}

/// Additive risk scoring with hard overrides, clamped to [0, 100].
///
/// Rules run in a fixed order, each contributing a delta and a note; notes
/// accumulate in rule order and are never deduplicated. Unknown features
/// contribute nothing.
pub fn risk_score(features: &FeatureBag) -> RiskSummary {
    let mut score: i64 = 0;
    let mut notes: Vec<String> = Vec::new();
    let int = |key: &str| features.get(key).and_then(FeatureValue::as_int);
    let boolean = |key: &str| features.get(key).and_then(FeatureValue::as_bool);
    let text = |key: &str| features.get(key).and_then(FeatureValue::as_str);

    if let Some(abuse) = int("abuseipdb.score") {
        if abuse >= 50 {
            score += 40;
            notes.push("high abuseipdb".to_string());
        } else if abuse > 0 {
            score += abuse / 2;
            notes.push("some abuse reports".to_string());
        }
    }

    if boolean("graph.first_time_domain") == Some(true) {
        score += 20;
        notes.push("first-time domain".to_string());
    }
    if boolean("graph.first_time_addr") == Some(true) {
        score += 10;
        notes.push("first-time address".to_string());
    }
    if let Some(seen) = int("graph.domain_seen") {
        if seen >= 10 {
            score -= 5;
            notes.push("domain seen often".to_string());
        }
    }

    if boolean("securitytxt.present") == Some(false) {
        score += 5;
        notes.push("no security.txt".to_string());
    }

    if let Some(certs) = int("crtsh.count") {
        if certs < 5 {
            score += 10;
            notes.push("few certificates".to_string());
        }
    }

    if boolean("linkedin.presence") == Some(false) {
        score += 5;
        notes.push("no LinkedIn org page".to_string());
    }

    if boolean("org.match") == Some(false) {
        let reason = text("org.reason").unwrap_or("");
        if reason == "email_regex_fail" || reason == "missing_email" {
            score += 20;
            notes.push("org identity mismatch".to_string());
        }
    }

    // Roster hits are explanatory only; they annotate, never move the score.
    if features.keys().any(|k| k.starts_with("roster.")) {
        let mut label_parts: Vec<String> = Vec::new();
        if let Some(category) = text("roster.category") {
            label_parts.push(category.replace('_', " "));
        }
        if let Some(company) = text("roster.company") {
            label_parts.push(company.to_string());
        }
        let label = if label_parts.is_empty() {
            "contact".to_string()
        } else {
            label_parts.join(" ")
        };
        let mut note = format!("Known {label}");
        if let Some(display_name) = text("roster.display_name") {
            note.push_str(&format!(": {display_name}"));
        }
        if let Some(trust) = text("roster.trust_tier") {
            note.push_str(&format!(" (trust={trust})"));
        }
        notes.push(note);
    }

    if boolean("typosquatting.suspect") == Some(true) {
        score += 30;
        notes.push("typosquatting suspected".to_string());
    }

    if boolean("whitelist.hit") == Some(true) {
        score = 0;
        notes.push("whitelisted".to_string());
    }

    let account = text("account.status").unwrap_or("").to_lowercase();
    if account == "blocked" || account == "deny" {
        // Block outranks the allowlist when both somehow apply.
        score = score.max(90);
        notes.push("account blocked".to_string());
    } else if account == "allow" || account == "ok" {
        score = score.min(5);
        notes.push("account ok".to_string());
    }

    RiskSummary {
        score: score.clamp(0, 100),
        notes,
    }
}

fn yn(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "yes",
        Some(false) => "no",
        None => "n/a",
    }
}

/// Compact key/value rendering of the headline features.
fn render_flat_kv(intel: &SenderIntel) -> String {
    let mut lines: Vec<String> = Vec::new();
    let boolean = |key: &str| intel.features.get(key).and_then(FeatureValue::as_bool);
    let int = |key: &str| intel.features.get(key).and_then(FeatureValue::as_int);
    let text = |key: &str| intel.features.get(key).and_then(FeatureValue::as_str);

    lines.push(format!("risk: {}", intel.risk.score));
    lines.push(format!("typosquatting: {}", yn(Some(intel.typosquatting.suspect))));
    if !intel.typosquatting.closest_to.is_empty() {
        lines.push(format!("closest: {}", intel.typosquatting.closest_to));
    }
    lines.push(format!("whitelist: {}", yn(intel.whitelist_hit)));
    if let Some(org_match) = boolean("org.match") {
        lines.push(format!("org.match: {}", yn(Some(org_match))));
    }
    if let Some(name) = text("org.name").filter(|n| !n.is_empty()) {
        lines.push(format!("org.name: {name}"));
    }
    if let Some(status) = &intel.account_status {
        lines.push(format!("account.status: {status}"));
    }
    lines.push(format!("securitytxt: {}", yn(boolean("securitytxt.present"))));
    lines.push(format!("list.unsubscribe: {}", yn(boolean("list.unsubscribe"))));
    lines.push(format!("mime.has_ics: {}", yn(boolean("mime.has_ics"))));
    if let Some(abuse) = int("abuseipdb.score") {
        lines.push(format!("abuseipdb: {abuse}"));
    }
    if let Some(presence) = boolean("linkedin.presence") {
        lines.push(format!("linkedin: {}", yn(Some(presence))));
    }
    if let Some(certs) = int("crtsh.count") {
        lines.push(format!("crtsh.count: {certs}"));
    }
    if let Some(total) = int("urlscan.total") {
        lines.push(format!("urlscan.total: {total}"));
    }
    if let Some(first) = boolean("graph.first_time_domain") {
        lines.push(format!("first_time_domain: {}", yn(Some(first))));
    }
    if let Some(first) = boolean("graph.first_time_addr") {
        lines.push(format!("first_time_addr: {}", yn(Some(first))));
    }
    if let Some(seen) = int("graph.domain_seen") {
        lines.push(format!("domain_seen: {seen}"));
    }
    lines.join("\n")
}

/// Markdown table over every accumulated feature, for review UIs.
fn render_table_md(features: &FeatureBag) -> String {
    let mut rows = vec!["| Check | Value |".to_string(), "|---|---|".to_string()];
    for (key, value) in features {
        let rendered = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        rows.push(format!("| {key} | {rendered} |"));
    }
    rows.join("\n")
}

/// Everything the fresh domain probe pass produced.
struct DomainFacts {
    snapshot: FeatureBag,
    /// Only a complete pass may be cached; a partial one (budget ran out or
    /// a probe failed) would poison the cache with unknowns.
    complete: bool,
}

/// Assembles the per-sender feature bag and scores it.
pub struct SenderRiskAggregator {
    config: Arc<Config>,
    protected: ProtectedDomains,
    probes: ProbeClient,
    domain_cache: Arc<dyn FeatureStore>,
    ip_cache: Arc<dyn FeatureStore>,
    graph: Arc<dyn SenderGraph>,
}

impl SenderRiskAggregator {
    pub fn new(
        config: Arc<Config>,
        probes: ProbeClient,
        domain_cache: Arc<dyn FeatureStore>,
        ip_cache: Arc<dyn FeatureStore>,
        graph: Arc<dyn SenderGraph>,
    ) -> Self {
        let protected = ProtectedDomains::from_config(&config);
        Self {
            config,
            protected,
            probes,
            domain_cache,
            ip_cache,
            graph,
        }
    }

    /// Assess one email's sender. Never fails: unknown stays unknown.
    pub async fn assess(&self, email: &CompactEmail) -> SenderIntel {
        let deadline = Deadline::from_millis(self.config.osint.budget_ms);
        let from_addr = email.from_addr.clone();
        let from_domain = email.from_domain();
        let client_ip = email.envelope_client_ip.clone();
        // The claimed org identity rides on the sender's own domain.
        let claimed_org_domain = from_domain.clone();

        let mut features = FeatureBag::new();

        self.org_identity_features(
            &mut features,
            from_addr.as_deref(),
            claimed_org_domain.as_deref(),
        );

        let typosquatting = claimed_org_domain
            .as_deref()
            .map(|d| self.protected.check(d))
            .unwrap_or(TyposquatVerdict {
                suspect: false,
                closest_to: String::new(),
                reason: TyposquatReason::None,
            });
        features.insert(
            "typosquatting.suspect".to_string(),
            FeatureValue::Bool(typosquatting.suspect),
        );
        if !typosquatting.closest_to.is_empty() {
            features.insert(
                "typosquatting.closest_to".to_string(),
                FeatureValue::Text(typosquatting.closest_to.clone()),
            );
        }

        if let Some(addr) = &from_addr {
            if let Some(entry) = self.config.roster_entry(addr) {
                let mut put = |key: &str, value: &Option<String>| {
                    if let Some(v) = value {
                        features.insert(format!("roster.{key}"), FeatureValue::Text(v.clone()));
                    }
                };
                put("display_name", &entry.display_name);
                put("company", &entry.company);
                put("category", &entry.category);
                put("trust_tier", &entry.trust_tier);
            }
        }

        let whitelist_hit = if from_addr.is_some() || from_domain.is_some() {
            let hit = self
                .config
                .allowlist_hit(from_addr.as_deref(), from_domain.as_deref());
            features.insert("whitelist.hit".to_string(), FeatureValue::Bool(hit));
            Some(hit)
        } else {
            None
        };
        let account_status = self
            .config
            .account_status(from_addr.as_deref(), from_domain.as_deref());
        if let Some(status) = &account_status {
            features.insert(
                "account.status".to_string(),
                FeatureValue::Text(status.clone()),
            );
        }

        if let Some(domain) = &from_domain {
            self.domain_features(&mut features, domain, &deadline).await;
        }
        if let Some(ip) = &client_ip {
            self.ip_features(&mut features, ip, &deadline).await;
        }

        let observation = self.graph.observe(
            from_domain.as_deref().unwrap_or(""),
            from_addr.as_deref(),
        );
        features.insert(
            "graph.first_time_domain".to_string(),
            FeatureValue::from_opt_bool(observation.first_time_domain),
        );
        features.insert(
            "graph.first_time_addr".to_string(),
            FeatureValue::from_opt_bool(observation.first_time_addr),
        );
        features.insert(
            "graph.domain_seen".to_string(),
            FeatureValue::from_opt_int(observation.domain_seen),
        );

        features.insert(
            "list.unsubscribe".to_string(),
            FeatureValue::Bool(email.list_unsubscribe_present),
        );
        features.insert(
            "mime.has_ics".to_string(),
            FeatureValue::Bool(email.has_calendar_ics),
        );

        let risk = risk_score(&features);
        log::info!(
            "sender intel: dom={} ip={} score={}",
            from_domain.as_deref().unwrap_or("-"),
            client_ip.as_deref().unwrap_or("-"),
            risk.score
        );

        let ids = SenderIds {
            from_addr: from_addr.clone(),
            from_domain: from_domain.clone(),
            claimed_org_domain,
            message_id: email.message_id.clone(),
            date_iso: email.date_iso.clone(),
            envelope_mail_from: email.envelope_mail_from.clone(),
            envelope_client_ip: client_ip,
        };

        let mut intel = SenderIntel {
            features,
            risk,
            typosquatting,
            whitelist_hit,
            account_status,
            ids,
            flat_kv: String::new(),
            table_md: String::new(),
        };
        intel.flat_kv = render_flat_kv(&intel);
        intel.table_md = render_table_md(&intel.features);
        intel
    }

    /// Does the sender's address pass the claimed organization's identity
    /// check? `org.match` stays unknown when there is nothing to check.
    fn org_identity_features(
        &self,
        features: &mut FeatureBag,
        email: Option<&str>,
        claimed_domain: Option<&str>,
    ) {
        let mut put = |m: FeatureValue, name: &str, reason: &str| {
            features.insert("org.match".to_string(), m);
            features.insert("org.name".to_string(), FeatureValue::Text(name.to_string()));
            features.insert(
                "org.reason".to_string(),
                FeatureValue::Text(reason.to_string()),
            );
        };

        if self.config.organizations.is_empty() {
            put(FeatureValue::Null, "", "no_patterns");
            return;
        }
        let Some(domain) = claimed_domain.filter(|d| !d.is_empty()) else {
            put(FeatureValue::Null, "", "no_domain");
            return;
        };
        let Some(org) = self.config.org_for_domain(domain) else {
            put(FeatureValue::Bool(false), "", "domain_not_in_org");
            return;
        };
        let name = org.name.clone();
        let Some(email) = email.filter(|e| !e.is_empty()) else {
            put(FeatureValue::Bool(false), &name, "missing_email");
            return;
        };
        if org.email_matches(email) {
            put(FeatureValue::Bool(true), &name, "");
        } else {
            put(FeatureValue::Bool(false), &name, "email_regex_fail");
        }
    }

    /// Domain facts: cache hit, or a fresh probe pass under the deadline.
    async fn domain_features(&self, features: &mut FeatureBag, domain: &str, deadline: &Deadline) {
        if let Some(snapshot) = self.domain_cache.get(domain) {
            log::debug!("domain cache hit for {domain}");
            for (key, value) in snapshot {
                features.insert(key, value);
            }
            features.insert("cache.domain_hit".to_string(), FeatureValue::Bool(true));
            return;
        }
        features.insert("cache.domain_hit".to_string(), FeatureValue::Bool(false));

        let facts = self.fresh_domain_facts(domain, deadline).await;
        for (key, value) in &facts.snapshot {
            features.insert(key.clone(), value.clone());
        }
        if facts.complete {
            self.domain_cache.put(
                domain,
                facts.snapshot,
                self.config.cache.domain_ttl_seconds,
            );
        } else {
            log::debug!("domain probe pass for {domain} was partial; not cached");
        }
    }

    async fn fresh_domain_facts(&self, domain: &str, deadline: &Deadline) -> DomainFacts {
        let mut snapshot = FeatureBag::new();

        let rdap = self.probes.rdap_domain_meta(domain, deadline).await;
        if let Some(registered) = &rdap.registered_iso {
            snapshot.insert(
                "domain.registered_iso".to_string(),
                FeatureValue::Text(registered.clone()),
            );
        }
        if let Some(name) = &rdap.registrant_name {
            snapshot.insert(
                "domain.rdap_name".to_string(),
                FeatureValue::Text(name.clone()),
            );
        }

        let presence = self.probes.presence_page(domain, deadline).await;
        if let Some(present) = presence.present {
            snapshot.insert(
                "linkedin.presence".to_string(),
                FeatureValue::Bool(present),
            );
            snapshot.insert(
                "linkedin.url".to_string(),
                FeatureValue::Text(presence.url.clone()),
            );
        }

        let securitytxt = self.probes.securitytxt_present(domain, deadline).await;
        if let Some(present) = securitytxt {
            snapshot.insert(
                "securitytxt.present".to_string(),
                FeatureValue::Bool(present),
            );
        }

        // urlscan needs a key; keyless deployments simply never learn this.
        let urlscan = self.probes.urlscan_total(domain, deadline).await;
        if let Some(total) = urlscan {
            snapshot.insert("urlscan.total".to_string(), FeatureValue::Int(total));
        }

        let crtsh = self.probes.crtsh_count(domain, deadline).await;
        if let Some(count) = crtsh {
            snapshot.insert("crtsh.count".to_string(), FeatureValue::Int(count));
        }

        // Complete means every probe we were equipped to run came back.
        let complete = presence.present.is_some()
            && securitytxt.is_some()
            && crtsh.is_some()
            && (self.config.osint.urlscan_api_key.is_none() || urlscan.is_some());
        DomainFacts { snapshot, complete }
    }

    /// IP facts: cache hit, or one abuse lookup; cached only on success.
    async fn ip_features(&self, features: &mut FeatureBag, ip: &str, deadline: &Deadline) {
        if let Some(snapshot) = self.ip_cache.get(ip) {
            log::debug!("ip cache hit for {ip}");
            for (key, value) in snapshot {
                features.insert(key, value);
            }
            features.insert("cache.ip_hit".to_string(), FeatureValue::Bool(true));
            return;
        }
        features.insert("cache.ip_hit".to_string(), FeatureValue::Bool(false));

        match self.probes.abuse_ip_score(ip, deadline).await {
            Some(score) => {
                let snapshot =
                    FeatureBag::from([("abuseipdb.score".to_string(), FeatureValue::Int(score))]);
                features.insert("abuseipdb.score".to_string(), FeatureValue::Int(score));
                self.ip_cache
                    .put(ip, snapshot, self.config.cache.ip_ttl_seconds);
            }
            None => {
                features.insert("abuseipdb.score".to_string(), FeatureValue::Null);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OsintConfig};
    use crate::store::{MemoryFeatureStore, MemorySenderGraph};

    fn bag(entries: &[(&str, FeatureValue)]) -> FeatureBag {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_abuse_score_tiers() {
        let high = risk_score(&bag(&[("abuseipdb.score", FeatureValue::Int(72))]));
        assert_eq!(high.score, 40);
        assert_eq!(high.notes, vec!["high abuseipdb".to_string()]);

        let some = risk_score(&bag(&[("abuseipdb.score", FeatureValue::Int(31))]));
        assert_eq!(some.score, 15); // floor(31 / 2)
        assert_eq!(some.notes, vec!["some abuse reports".to_string()]);

        let zero = risk_score(&bag(&[("abuseipdb.score", FeatureValue::Int(0))]));
        assert_eq!(zero.score, 0);
        assert!(zero.notes.is_empty());
    }

    #[test]
    fn test_unknown_is_not_zero() {
        // A null abuse score contributes nothing and leaves no note; the
        // same bag with a measured value does.
        let unknown = risk_score(&bag(&[
            ("abuseipdb.score", FeatureValue::Null),
            ("securitytxt.present", FeatureValue::Null),
            ("crtsh.count", FeatureValue::Null),
        ]));
        assert_eq!(unknown.score, 0);
        assert!(unknown.notes.is_empty());
    }

    #[test]
    fn test_graph_and_hygiene_rules() {
        let summary = risk_score(&bag(&[
            ("graph.first_time_domain", FeatureValue::Bool(true)),
            ("graph.first_time_addr", FeatureValue::Bool(true)),
            ("securitytxt.present", FeatureValue::Bool(false)),
            ("crtsh.count", FeatureValue::Int(2)),
            ("linkedin.presence", FeatureValue::Bool(false)),
        ]));
        assert_eq!(summary.score, 20 + 10 + 5 + 10 + 5);
        assert_eq!(
            summary.notes,
            vec![
                "first-time domain",
                "first-time address",
                "no security.txt",
                "few certificates",
                "no LinkedIn org page",
            ]
        );
    }

    #[test]
    fn test_familiarity_discount() {
        let summary = risk_score(&bag(&[
            ("graph.first_time_domain", FeatureValue::Bool(false)),
            ("graph.domain_seen", FeatureValue::Int(37)),
            ("securitytxt.present", FeatureValue::Bool(false)),
        ]));
        assert_eq!(summary.score, 0); // -5 + 5, clamped at 0
        assert_eq!(summary.notes, vec!["domain seen often", "no security.txt"]);
    }

    #[test]
    fn test_org_mismatch_reasons() {
        let mismatch = risk_score(&bag(&[
            ("org.match", FeatureValue::Bool(false)),
            ("org.reason", FeatureValue::Text("email_regex_fail".to_string())),
        ]));
        assert_eq!(mismatch.score, 20);

        // A domain outside every org is not an identity mismatch.
        let outside = risk_score(&bag(&[
            ("org.match", FeatureValue::Bool(false)),
            ("org.reason", FeatureValue::Text("domain_not_in_org".to_string())),
        ]));
        assert_eq!(outside.score, 0);
    }

    #[test]
    fn test_allowlist_forces_zero() {
        let summary = risk_score(&bag(&[
            ("abuseipdb.score", FeatureValue::Int(90)),
            ("typosquatting.suspect", FeatureValue::Bool(true)),
            ("graph.first_time_domain", FeatureValue::Bool(true)),
            ("whitelist.hit", FeatureValue::Bool(true)),
        ]));
        assert_eq!(summary.score, 0);
        assert_eq!(summary.notes.last().unwrap(), "whitelisted");
    }

    #[test]
    fn test_blocked_account_floors_at_ninety() {
        let summary = risk_score(&bag(&[(
            "account.status",
            FeatureValue::Text("blocked".to_string()),
        )]));
        assert_eq!(summary.score, 90);
        assert_eq!(summary.notes, vec!["account blocked"]);
    }

    #[test]
    fn test_block_outranks_allowlist() {
        let summary = risk_score(&bag(&[
            ("whitelist.hit", FeatureValue::Bool(true)),
            ("account.status", FeatureValue::Text("deny".to_string())),
        ]));
        assert_eq!(summary.score, 90);
    }

    #[test]
    fn test_allowed_account_caps_at_five() {
        let summary = risk_score(&bag(&[
            ("abuseipdb.score", FeatureValue::Int(90)),
            ("account.status", FeatureValue::Text("ok".to_string())),
        ]));
        assert_eq!(summary.score, 5);
    }

    #[test]
    fn test_roster_note_is_explanatory_only() {
        let summary = risk_score(&bag(&[
            ("roster.category", FeatureValue::Text("internal_staff".to_string())),
            ("roster.company", FeatureValue::Text("Example Clinic".to_string())),
            ("roster.display_name", FeatureValue::Text("Front Desk".to_string())),
            ("roster.trust_tier", FeatureValue::Text("high".to_string())),
        ]));
        assert_eq!(summary.score, 0);
        assert_eq!(
            summary.notes,
            vec!["Known internal staff Example Clinic: Front Desk (trust=high)"]
        );
    }

    #[test]
    fn test_score_clamped_to_hundred() {
        let summary = risk_score(&bag(&[
            ("abuseipdb.score", FeatureValue::Int(99)),
            ("graph.first_time_domain", FeatureValue::Bool(true)),
            ("graph.first_time_addr", FeatureValue::Bool(true)),
            ("securitytxt.present", FeatureValue::Bool(false)),
            ("crtsh.count", FeatureValue::Int(0)),
            ("linkedin.presence", FeatureValue::Bool(false)),
            ("typosquatting.suspect", FeatureValue::Bool(true)),
        ]));
        assert_eq!(summary.score, 100);
    }

    fn offline_aggregator(config: Config) -> SenderRiskAggregator {
        let config = Arc::new(config);
        SenderRiskAggregator::new(
            config.clone(),
            ProbeClient::new(&OsintConfig::default()).unwrap(),
            Arc::new(MemoryFeatureStore::new()),
            Arc::new(MemoryFeatureStore::new()),
            Arc::new(MemorySenderGraph::new()),
        )
    }

    fn offline_email(addr: &str) -> CompactEmail {
        CompactEmail {
            from_addr: Some(addr.to_string()),
            subject: "hello".to_string(),
            body: "world".to_string(),
            ..Default::default()
        }
    }

    fn zero_budget_config() -> Config {
        let mut config = Config::default();
        config.compile_patterns().unwrap();
        // Zero probe budget: every external lookup degrades to unknown.
        config.osint.budget_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_assess_offline_first_time_sender() {
        let aggregator = offline_aggregator(zero_budget_config());
        let intel = aggregator
            .assess(&offline_email("stranger@nowhere.example"))
            .await;
        // Graph sees a first-time domain and address; every probe is unknown.
        assert_eq!(intel.risk.score, 30);
        assert_eq!(
            intel.features.get("abuseipdb.score"),
            None // no client IP, so the IP block never ran
        );
        assert_eq!(
            intel.features.get("cache.domain_hit"),
            Some(&FeatureValue::Bool(false))
        );
        assert!(intel.flat_kv.contains("risk: 30"));
        assert!(intel.table_md.starts_with("| Check | Value |"));
    }

    #[tokio::test]
    async fn test_assess_allowlisted_sender_scores_zero() {
        let aggregator = offline_aggregator(zero_budget_config());
        let intel = aggregator
            .assess(&offline_email("newsletter@trusted-vendor.example"))
            .await;
        assert_eq!(intel.risk.score, 0);
        assert_eq!(intel.whitelist_hit, Some(true));
        assert!(intel.risk.notes.iter().any(|n| n == "whitelisted"));
    }

    #[tokio::test]
    async fn test_assess_blocked_domain() {
        let aggregator = offline_aggregator(zero_budget_config());
        let intel = aggregator
            .assess(&offline_email("anyone@known-bad.example"))
            .await;
        assert!(intel.risk.score >= 90);
        assert_eq!(intel.account_status.as_deref(), Some("blocked"));
    }

    #[tokio::test]
    async fn test_assess_typosquat_of_protected_org() {
        let aggregator = offline_aggregator(zero_budget_config());
        let intel = aggregator
            .assess(&offline_email("billing@exampl3-clinic.com"))
            .await;
        assert!(intel.typosquatting.suspect);
        assert!(intel
            .risk
            .notes
            .iter()
            .any(|n| n == "typosquatting suspected"));
    }

    #[tokio::test]
    async fn test_assess_org_identity_mismatch_unknown_without_org() {
        let aggregator = offline_aggregator(zero_budget_config());
        let intel = aggregator.assess(&offline_email("a@unrelated.example")).await;
        assert_eq!(
            intel.features.get("org.match"),
            Some(&FeatureValue::Bool(false))
        );
        assert_eq!(
            intel.features.get("org.reason").and_then(FeatureValue::as_str),
            Some("domain_not_in_org")
        );
        // domain_not_in_org is not a mismatch penalty
        assert!(!intel.risk.notes.iter().any(|n| n == "org identity mismatch"));
    }

    #[tokio::test]
    async fn test_assess_partial_probe_pass_is_not_cached() {
        let config = Arc::new(zero_budget_config());
        let domain_cache = Arc::new(MemoryFeatureStore::new());
        let aggregator = SenderRiskAggregator::new(
            config,
            ProbeClient::new(&OsintConfig::default()).unwrap(),
            domain_cache.clone(),
            Arc::new(MemoryFeatureStore::new()),
            Arc::new(MemorySenderGraph::new()),
        );
        aggregator.assess(&offline_email("a@nowhere.example")).await;
        // The zero-budget pass produced nothing cacheable.
        assert!(domain_cache.get("nowhere.example").is_none());
    }

    #[tokio::test]
    async fn test_assess_uses_cached_domain_snapshot() {
        let config = Arc::new(zero_budget_config());
        let domain_cache = Arc::new(MemoryFeatureStore::new());
        domain_cache.put(
            "nowhere.example",
            FeatureBag::from([
                ("crtsh.count".to_string(), FeatureValue::Int(2)),
                ("securitytxt.present".to_string(), FeatureValue::Bool(false)),
            ]),
            3600,
        );
        let aggregator = SenderRiskAggregator::new(
            config,
            ProbeClient::new(&OsintConfig::default()).unwrap(),
            domain_cache,
            Arc::new(MemoryFeatureStore::new()),
            Arc::new(MemorySenderGraph::new()),
        );
        let intel = aggregator.assess(&offline_email("a@nowhere.example")).await;
        assert_eq!(
            intel.features.get("cache.domain_hit"),
            Some(&FeatureValue::Bool(true))
        );
        // 20 first domain + 10 first addr + 5 securitytxt + 10 few certs
        assert_eq!(intel.risk.score, 45);
    }

    #[test]
    fn test_feature_value_untagged_serialization() {
        assert_eq!(
            serde_json::to_string(&FeatureValue::Int(7)).unwrap(),
            "7"
        );
        assert_eq!(
            serde_json::to_string(&FeatureValue::Bool(true)).unwrap(),
            "true"
        );
        assert_eq!(
            serde_json::to_string(&FeatureValue::Null).unwrap(),
            "null"
        );
        let parsed: FeatureValue = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, FeatureValue::Null);
    }

    #[test]
    fn test_intel_wire_shape() {
        let intel = SenderIntel::empty_with_note("probe failure");
        let value = intel.to_value();
        assert_eq!(value["features"]["risk"]["score"], 0);
        assert_eq!(value["features"]["risk"]["notes"][0], "probe failure");
        assert_eq!(value["features"]["typosquatting"]["suspect"], false);
    }
}
