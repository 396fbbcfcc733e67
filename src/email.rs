use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized email record consumed by the scoring pipeline.
///
/// Upstream extraction produces many envelope variants for the same logical
/// fields; everything is funneled through [`CompactEmail::from_value`] so the
/// scorers only ever see this shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactEmail {
    #[serde(default)]
    pub from_addr: Option<String>,
    #[serde(default)]
    pub envelope_client_ip: Option<String>,
    #[serde(default)]
    pub envelope_mail_from: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub date_iso: Option<String>,
    #[serde(default)]
    pub list_unsubscribe_present: bool,
    #[serde(default)]
    pub has_calendar_ics: bool,
    #[serde(default)]
    pub provenance: String,
}

impl CompactEmail {
    /// Build a canonical record from a loosely-shaped JSON envelope.
    ///
    /// Accepts the wrapper form `{"compact": {...}}`, nested `from.addr` /
    /// `from.email`, flat `from_addr`, and `envelope.client_ip` or top-level
    /// `ip` for the connecting address. Missing text fields become empty
    /// strings, never errors.
    pub fn from_value(value: &Value) -> Self {
        // Unwrap {"compact": {...}} once; deeper nesting is not a real shape.
        let obj = match value.get("compact") {
            Some(inner) if inner.is_object() => inner,
            _ => value,
        };

        let from_addr = obj
            .get("from")
            .and_then(|f| f.get("addr").or_else(|| f.get("email")))
            .and_then(Value::as_str)
            .or_else(|| obj.get("from_addr").and_then(Value::as_str))
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let envelope = obj.get("envelope");
        let envelope_client_ip = envelope
            .and_then(|e| e.get("client_ip"))
            .and_then(Value::as_str)
            .or_else(|| obj.get("ip").and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let envelope_mail_from = envelope
            .and_then(|e| e.get("mail_from"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .or_else(|| from_addr.clone());

        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let opt_text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };

        CompactEmail {
            from_addr,
            envelope_client_ip,
            envelope_mail_from,
            subject: text("subject"),
            body: text("body"),
            message_id: opt_text("message_id"),
            date_iso: opt_text("date_iso"),
            list_unsubscribe_present: obj
                .get("list_unsubscribe_present")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            has_calendar_ics: obj
                .get("has_calendar_ics")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            provenance: text("provenance"),
        }
    }

    /// Sender domain, lowercased, if the address has one.
    pub fn from_domain(&self) -> Option<String> {
        self.from_addr.as_deref().and_then(extract_domain)
    }
}

/// Extract the domain part of an email address.
pub fn extract_domain(email: &str) -> Option<String> {
    let at_pos = email.rfind('@')?;
    if at_pos == 0 {
        return None;
    }
    let domain = email[at_pos + 1..].trim();
    if domain.is_empty() || !domain.contains('.') || domain.len() >= 255 {
        return None;
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return None;
    }
    Some(domain.to_lowercase())
}

/// Reduce a domain to its registrable (eTLD+1) form.
///
/// e.g. "mail.example.com" -> "example.com", "mail.example.co.uk" ->
/// "example.co.uk".
pub fn registrable_domain(domain: &str) -> String {
    let domain = domain.to_lowercase();
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() < 2 {
        return domain;
    }

    // Common two-part TLDs where eTLD+1 spans three labels.
    const TWO_PART_TLDS: &[&str] = &[
        "co.uk", "com.au", "co.jp", "co.kr", "com.br", "co.za", "com.mx", "co.in", "com.sg",
        "co.nz", "com.ar", "co.il", "org.uk", "net.au", "gov.uk", "ac.uk", "edu.au",
    ];

    let last_two = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
    if parts.len() >= 3 && TWO_PART_TLDS.contains(&last_two.as_str()) {
        return format!(
            "{}.{}.{}",
            parts[parts.len() - 3],
            parts[parts.len() - 2],
            parts[parts.len() - 1]
        );
    }
    last_two
}
