use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum risk contribution of each signal category.
const WEIGHT_CREDENTIAL: f64 = 0.35;
const WEIGHT_SUSPICIOUS_LINK: f64 = 0.40;
const WEIGHT_URGENCY: f64 = 0.20;
const WEIGHT_MANIPULATIVE: f64 = 0.20;
const WEIGHT_ATTACHMENT: f64 = 0.15;

/// Content risk at or above this classifies as phishing.
pub const PHISHING_THRESHOLD: f64 = 0.5;

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid content pattern"))
        .collect()
}

lazy_static! {
    static ref SUSPICIOUS_TERMS: Vec<Regex> = compile(&[
        r"\bconfirm\b",
        r"\bverify\b",
        r"\bupdate\b",
        r"\bcredential(s)?\b",
        r"\bpassword\b",
        r"\bbank( account)?\b",
        r"\bsecure\b",
        r"\bportal\b",
        r"\bclick\b.*\blink\b",
        r"\bfollow\b.*\blink\b",
        r"\buse\b.*\blink\b",
        r"\blink below\b",
        r"\blink provided\b",
        r"\bvia the link\b",
    ]);
    static ref URGENCY_TERMS: Vec<Regex> = compile(&[
        r"\burgent\b",
        r"\baction required\b",
        r"\bimmediately\b",
        r"\basap\b",
        r"\bavoid delay(s)?\b",
        r"\bfinal notice\b",
        r"\bmust\b",
        r"\brequired\b",
        r"\bprevent\b.*\b(interruption|suspension|lockout)\b",
        r"\bimmediate processing\b",
        r"\bdelay(ed)? payment(s)?\b",
    ]);
    static ref MANIPULATIVE_TONE_TERMS: Vec<Regex> = compile(&[
        r"\bto avoid\b.*\b(delay|suspension|termination)\b",
        r"\bfailure to\b.*\bwill result\b",
        r"\bfailure to\b.*\b(delay|issue|penalt(y|ies)|suspension|lockout|cancel)\b",
        r"\bwithout\b.*\b(confirmation|response|action)\b.*\b(delay|hold|impact)\b",
    ]);
    static ref CREDENTIAL_INTENT_TERMS: Vec<Regex> = compile(&[
        r"\blogin\b",
        r"\bsign in\b",
        r"\bverify (?:your )?account\b",
        r"\benter (?:your )?(?:details|credentials|password)\b",
        r"\bconfirm (?:bank|account|details)\b",
        r"\breactivate\b",
    ]);
    static ref FINANCIAL_TERMS: Vec<Regex> = compile(&[
        r"\bpayment\b",
        r"\binvoice\b",
        r"\brefund\b",
        r"\btransfer\b",
        r"\bbilling\b",
    ]);
    static ref SUPPORT_TERMS: Vec<Regex> =
        compile(&[r"\bsupport\b", r"\bhelp\b", r"\bassist\b", r"\bissue\b", r"\bticket\b"]);
    static ref SCHEDULING_TERMS: Vec<Regex> = compile(&[
        r"\bmeeting\b",
        r"\bappointment\b",
        r"\bcalendar\b",
        r"\breschedule\b",
    ]);
    static ref ATTACHMENT_TERMS: Vec<Regex> = compile(&[
        r"\bsee attached\b",
        r"\bopen the attachment\b",
        r"\battached file\b",
        r"\battachment\b",
        r"\battached document\b",
        r"\battached payroll\b",
    ]);
    static ref URL_RX: Regex = Regex::new(r"(?i)https?://[^\s)>\]]+").unwrap();
    static ref FRIENDLY_RX: Regex = Regex::new(r"(?i)\bthank(s| you)\b").unwrap();
    static ref PROFESSIONAL_RX: Regex =
        Regex::new(r"(?i)\bregards\b|\bbest\b|\bsincerely\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Phishing,
    Safe,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Phishing => "phishing",
            Classification::Safe => "safe",
        }
    }

    pub fn is_phishing(&self) -> bool {
        matches!(self, Classification::Phishing)
    }
}

/// Per-category distinct-match counts for one email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalVector {
    pub credential_language: usize,
    pub suspicious_link: usize,
    pub urgency_language: usize,
    pub manipulative_tone: usize,
    pub attachment_reference: usize,
}

/// Full content analysis result for one email.
#[derive(Debug, Clone)]
pub struct ContentVerdict {
    pub classification: Classification,
    pub confidence: f64,
    pub total_risk: f64,
    pub intent: &'static str,
    pub tone: &'static str,
    pub urgency: &'static str,
    pub signals: SignalVector,
    pub scores: BTreeMap<&'static str, f64>,
    pub reasoning: Vec<String>,
}

/// Wire form: `{confidence_final, notes: [{...}]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub confidence_final: f64,
    pub notes: Vec<ContentNote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentNote {
    pub intent: String,
    pub tone: String,
    pub urgency: String,
    pub classification: String,
    pub reasoning: Vec<String>,
    pub signals: BTreeMap<String, bool>,
    pub scores: BTreeMap<String, f64>,
}

impl ContentVerdict {
    pub fn to_analysis(&self) -> ContentAnalysis {
        let signals = BTreeMap::from([
            (
                "credential_language".to_string(),
                self.signals.credential_language > 0,
            ),
            ("suspicious_link".to_string(), self.signals.suspicious_link > 0),
            ("urgency_language".to_string(), self.signals.urgency_language > 0),
            (
                "manipulative_tone".to_string(),
                self.signals.manipulative_tone > 0,
            ),
            (
                "attachment_reference".to_string(),
                self.signals.attachment_reference > 0,
            ),
        ]);
        ContentAnalysis {
            confidence_final: self.confidence,
            notes: vec![ContentNote {
                intent: self.intent.to_string(),
                tone: self.tone.to_string(),
                urgency: self.urgency.to_string(),
                classification: self.classification.as_str().to_string(),
                reasoning: self.reasoning.clone(),
                signals,
                scores: self
                    .scores
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            }],
        }
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn clamp01(x: f64) -> f64 {
    round3(x).clamp(0.0, 1.0)
}

/// Count distinct matched texts across a pattern set.
///
/// Two patterns matching the same literal text count once; repeated
/// occurrences of one term count once.
fn distinct_matches(patterns: &[Regex], text: &str) -> usize {
    let mut seen = std::collections::HashSet::new();
    for rx in patterns {
        if let Some(m) = rx.find(text) {
            seen.insert(m.as_str().to_string());
        }
    }
    seen.len()
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|rx| rx.is_match(text))
}

/// Intensity curve: one match yields 60% of the category weight, two 90%,
/// three or more the full weight.
fn category_score(weight: f64, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let impact = (0.6 + 0.3 * (count as f64 - 1.0)).min(1.0);
    round3(weight * impact)
}

/// Deterministic lexical phishing scorer over subject + body text.
pub struct ContentScorer;

impl ContentScorer {
    /// Run the full scoring pipeline on one email's text.
    pub fn analyze(subject: &str, body: &str) -> ContentVerdict {
        let text = format!("{subject} {body}");

        let mut signals = SignalVector {
            credential_language: {
                // Credential language draws on both the intent terms and the
                // broader suspicious vocabulary.
                let mut seen = std::collections::HashSet::new();
                for rx in CREDENTIAL_INTENT_TERMS.iter().chain(SUSPICIOUS_TERMS.iter()) {
                    if let Some(m) = rx.find(&text) {
                        seen.insert(m.as_str().to_string());
                    }
                }
                seen.len()
            },
            suspicious_link: URL_RX.find_iter(&text).count(),
            urgency_language: distinct_matches(&URGENCY_TERMS, &text),
            manipulative_tone: distinct_matches(&MANIPULATIVE_TONE_TERMS, &text),
            attachment_reference: distinct_matches(&ATTACHMENT_TERMS, &text),
        };
        let raw_signals = signals.clone();

        // A credential ask combined with a link must never score low: force
        // the credential count to at least 2 before the curve is applied.
        if signals.credential_language > 0 && signals.suspicious_link > 0 {
            signals.credential_language = signals.credential_language.max(2);
        }

        let scores = BTreeMap::from([
            (
                "credential_language",
                category_score(WEIGHT_CREDENTIAL, signals.credential_language),
            ),
            (
                "suspicious_link",
                category_score(WEIGHT_SUSPICIOUS_LINK, signals.suspicious_link),
            ),
            (
                "urgency_language",
                category_score(WEIGHT_URGENCY, signals.urgency_language),
            ),
            (
                "manipulative_tone",
                category_score(WEIGHT_MANIPULATIVE, signals.manipulative_tone),
            ),
            (
                "attachment_reference",
                category_score(WEIGHT_ATTACHMENT, signals.attachment_reference),
            ),
        ]);

        let total_risk = clamp01(scores.values().sum());
        let classification = if total_risk >= PHISHING_THRESHOLD {
            Classification::Phishing
        } else {
            Classification::Safe
        };
        let confidence = Self::confidence(total_risk, classification);
        let reasoning = Self::reasoning(&signals, body);

        ContentVerdict {
            classification,
            confidence,
            total_risk,
            intent: Self::infer_intent(body),
            tone: Self::classify_tone(body),
            urgency: Self::classify_urgency(body),
            signals: raw_signals,
            scores,
            reasoning,
        }
    }

    /// Non-linear confidence mapping anchored at the phishing threshold.
    ///
    /// The sub-unit exponent front-loads confidence growth near the
    /// threshold; both curves are monotonic and bounded to [0, 1].
    fn confidence(total_risk: f64, classification: Classification) -> f64 {
        match classification {
            Classification::Phishing => {
                // risk 0.50 -> 0.60, risk 1.00 -> 0.99
                let dist = (total_risk - PHISHING_THRESHOLD) / (1.0 - PHISHING_THRESHOLD);
                clamp01(0.60 + 0.39 * dist.powf(0.8))
            }
            Classification::Safe => {
                // risk 0.00 -> 0.99, risk 0.49 -> ~0.55
                let dist = (PHISHING_THRESHOLD - total_risk) / PHISHING_THRESHOLD;
                clamp01(0.55 + 0.44 * dist.powf(0.8))
            }
        }
    }

    fn infer_intent(body: &str) -> &'static str {
        if any_match(&CREDENTIAL_INTENT_TERMS, body) {
            "credential_request"
        } else if any_match(&FINANCIAL_TERMS, body) {
            "financial_action"
        } else if any_match(&SUPPORT_TERMS, body) {
            "support_request"
        } else if any_match(&SCHEDULING_TERMS, body) {
            "scheduling"
        } else {
            "informational"
        }
    }

    fn classify_tone(body: &str) -> &'static str {
        if any_match(&MANIPULATIVE_TONE_TERMS, body) {
            "manipulative"
        } else if FRIENDLY_RX.is_match(body) || body.to_lowercase().contains("appreciate") {
            "friendly"
        } else if PROFESSIONAL_RX.is_match(body) {
            "professional"
        } else {
            "neutral"
        }
    }

    fn classify_urgency(body: &str) -> &'static str {
        if any_match(&URGENCY_TERMS, body) {
            "urgent"
        } else {
            "routine"
        }
    }

    /// Short explanatory trace of which signal combinations fired.
    /// Purely informational; never feeds back into the score.
    fn reasoning(signals: &SignalVector, body: &str) -> Vec<String> {
        let mut trace = Vec::new();
        let cred = signals.credential_language;
        let links = signals.suspicious_link;
        let urgency = signals.urgency_language;

        if cred > 0 && links > 0 {
            trace.push(
                "CRITICAL: Detected credential request combined with external links - highly indicative of phishing."
                    .to_string(),
            );
        }
        if cred > 0 && links == 0 {
            trace.push(
                "Detected credential request language without links (potential reply-chain phishing)."
                    .to_string(),
            );
        }
        if urgency > 0 {
            trace.push(format!("Detected urgency terminology ({urgency} instance(s))."));
        }
        if links > 2 {
            trace.push(format!(
                "High density of links detected ({links}), common in mass-scatter phishing."
            ));
        } else if links > 0 {
            trace.push("Contains external links.".to_string());
        }
        if any_match(&FINANCIAL_TERMS, body) {
            trace.push("Financial terminology detected.".to_string());
        }
        if trace.is_empty() {
            trace.push("No significant phishing patterns detected.".to_string());
        }
        trace
    }
}
