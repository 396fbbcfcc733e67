use crate::content::Classification;
use crate::store::TrustTier;
use serde::{Deserialize, Serialize};

// Rule thresholds. Deliberately rule-local constants, not configuration.
const AUTO_QUARANTINE_CONFIDENCE: f64 = 0.85;
const COMPROMISE_CONFIDENCE: f64 = 0.90;
const GRAY_ZONE_FLOOR: f64 = 0.50;
const CRITICAL_SENDER_RISK: f64 = 85.0;
const ELEVATED_SENDER_RISK: f64 = 60.0;
const MODERATE_SENDER_RISK: f64 = 50.0;
const PHI_SAFE_CONFIDENCE: f64 = 0.75;
const AUTO_ALLOW_CONFIDENCE: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "QUARANTINE")]
    Quarantine,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::Quarantine => "QUARANTINE",
        }
    }
}

/// Whether the decision needs a human in the loop.
///
/// `Pending` is reserved for queued-but-unactioned entries and is assigned
/// downstream, never by [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlStatus {
    Skipped,
    Required,
    Pending,
}

impl HitlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitlStatus::Skipped => "skipped",
            HitlStatus::Required => "required",
            HitlStatus::Pending => "pending",
        }
    }
}

/// HITL bookkeeping attached to every decision. Actor, verdict, notes and
/// timestamp are filled in by the reviewer workflow downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlRecord {
    pub status: HitlStatus,
    pub actor: String,
    pub verdict: String,
    pub notes: String,
    pub ts: Option<u64>,
}

impl HitlRecord {
    fn new(status: HitlStatus) -> Self {
        Self {
            status,
            actor: String::new(),
            verdict: String::new(),
            notes: String::new(),
            ts: None,
        }
    }
}

/// Everything the decision engine looks at for one email.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionInputs {
    pub classification: Classification,
    pub confidence: f64,
    pub sender_risk: f64,
    pub phi_entities: u32,
    #[serde(skip)]
    pub prior_decision: Verdict,
    pub trust_tier: Option<TrustTier>,
}

impl Default for DecisionInputs {
    fn default() -> Self {
        Self {
            classification: Classification::Safe,
            confidence: 0.0,
            sender_risk: 0.0,
            phi_entities: 0,
            prior_decision: Verdict::Allow,
            trust_tier: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision: Verdict,
    pub risk: f64,
    pub reasons: Vec<String>,
    pub hitl: HitlRecord,
    pub signals: serde_json::Value,
}

fn package(inputs: &DecisionInputs, verdict: Verdict, status: HitlStatus, reason: String) -> Decision {
    Decision {
        decision: verdict,
        risk: inputs.sender_risk,
        reasons: vec![reason],
        hitl: HitlRecord::new(status),
        signals: serde_json::to_value(inputs).unwrap_or_default(),
    }
}

/// Decide the disposition of one email.
///
/// An ordered rule cascade; the first matching rule wins and contributes
/// exactly one reason carrying the numbers that triggered it. Human feedback
/// is consulted first so repeat verdicts stop generating alerts, and the
/// default path allows with a logged reason: an undecidable email must never
/// silently block legitimate mail.
pub fn decide(inputs: &DecisionInputs) -> Decision {
    let confidence = inputs.confidence;
    let sender_risk = inputs.sender_risk;
    let is_phish = inputs.classification.is_phishing();
    let is_safe = !is_phish;

    // Rule 0: a human already blocked this sender. Terminal.
    if inputs.trust_tier == Some(TrustTier::Blocked) {
        return package(
            inputs,
            Verdict::Quarantine,
            HitlStatus::Skipped,
            "Sender is explicitly blocked by previous IT verdict. Auto-quarantined.".to_string(),
        );
    }

    // Rule 1: trusted senders skip review, unless the content is blatant
    // enough to suggest a compromised account.
    if inputs.trust_tier == Some(TrustTier::Trusted) {
        if is_phish && confidence > COMPROMISE_CONFIDENCE {
            return package(
                inputs,
                Verdict::Quarantine,
                HitlStatus::Required,
                "Sender is normally trusted, but content is high-confidence phishing. Account compromise suspected."
                    .to_string(),
            );
        }
        if is_safe {
            return package(
                inputs,
                Verdict::Allow,
                HitlStatus::Skipped,
                format!(
                    "Sender is trusted by IT history. Auto-allowed despite risk score {sender_risk:.1}."
                ),
            );
        }
        // Trusted but phishing below the compromise bar: general rules apply.
    }

    // Rule 2: high-confidence phishing auto-quarantines without an alert.
    if is_phish && confidence >= AUTO_QUARANTINE_CONFIDENCE {
        return package(
            inputs,
            Verdict::Quarantine,
            HitlStatus::Skipped,
            format!(
                "High-confidence phishing detection ({confidence:.2}). Auto-quarantined to reduce alert fatigue."
            ),
        );
    }

    // Rule 3: critical sender risk auto-quarantines regardless of content.
    if sender_risk >= CRITICAL_SENDER_RISK {
        return package(
            inputs,
            Verdict::Quarantine,
            HitlStatus::Skipped,
            format!("Sender risk is critical ({sender_risk:.1}). Auto-quarantined."),
        );
    }

    // Rule 4: the genuine gray zone needs a human.
    if is_phish && (GRAY_ZONE_FLOOR..AUTO_QUARANTINE_CONFIDENCE).contains(&confidence) {
        return package(
            inputs,
            Verdict::Quarantine,
            HitlStatus::Required,
            format!(
                "Suspected phishing with moderate confidence ({confidence:.2}). Requires human verification."
            ),
        );
    }

    // Rule 5: clean content from a risky sender still needs a look.
    if is_safe && sender_risk >= ELEVATED_SENDER_RISK {
        return package(
            inputs,
            Verdict::Quarantine,
            HitlStatus::Required,
            format!(
                "Content appears safe, but sender risk is high ({sender_risk:.1}). IT review required."
            ),
        );
    }

    // Rule 6: PHI compliance hold. The message is delivered either way;
    // only the review requirement varies.
    if inputs.phi_entities > 0 {
        return if is_safe
            && confidence >= PHI_SAFE_CONFIDENCE
            && sender_risk < MODERATE_SENDER_RISK
        {
            package(
                inputs,
                Verdict::Allow,
                HitlStatus::Skipped,
                format!(
                    "Contains PHI ({} entities), but sender/content confidence is high. Allowed.",
                    inputs.phi_entities
                ),
            )
        } else {
            package(
                inputs,
                Verdict::Allow,
                HitlStatus::Required,
                format!(
                    "Contains PHI with lower confidence ({confidence:.2}) or elevated risk. Compliance review required."
                ),
            )
        };
    }

    // Rule 7: high-confidence safe email auto-allows.
    if is_safe && confidence >= AUTO_ALLOW_CONFIDENCE && sender_risk < MODERATE_SENDER_RISK {
        return package(
            inputs,
            Verdict::Allow,
            HitlStatus::Skipped,
            format!("High-confidence safe email ({confidence:.2})."),
        );
    }

    // Default: keep an upstream quarantine (with confirmation), otherwise
    // fail open and allow.
    if inputs.prior_decision == Verdict::Quarantine {
        package(
            inputs,
            Verdict::Quarantine,
            HitlStatus::Required,
            "Baseline logic quarantined message; requiring HITL confirmation.".to_string(),
        )
    } else {
        package(
            inputs,
            Verdict::Allow,
            HitlStatus::Skipped,
            "Routine email; no high-risk signals detected.".to_string(),
        )
    }
}
