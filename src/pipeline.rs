use crate::config::Config;
use crate::content::{ContentAnalysis, ContentScorer, ContentVerdict, SignalVector};
use crate::decision::{decide, Decision, DecisionInputs, Verdict};
use crate::email::CompactEmail;
use crate::osint::ProbeClient;
use crate::sender_risk::{SenderIntel, SenderRiskAggregator};
use crate::store::{trust_feedback, FeatureStore, FeedbackStore, SenderGraph, TrustFeedback};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Headline numbers for dashboards and the audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub classification: String,
    pub confidence: f64,
    pub sender_risk: i64,
    pub sender_risk_notes: Vec<String>,
    pub intent: String,
    pub tone: String,
    pub urgency: String,
    pub has_phi: bool,
}

/// Everything one evaluation produced.
#[derive(Debug, Clone)]
pub struct EmailAssessment {
    pub content: ContentAnalysis,
    pub sender: SenderIntel,
    pub trust: TrustFeedback,
    pub decision: Decision,
    pub summary: RunSummary,
}

impl EmailAssessment {
    /// Assemble the run document persisted downstream.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "decision": self.decision.decision.as_str(),
            "risk": self.decision.risk,
            "decision_reasons": self.decision.reasons,
            "hitl": self.decision.hitl,
            "signals": self.decision.signals,
            "summary": self.summary,
            "content": self.content,
            "sender_intel": self.sender.to_value(),
            "trust": self.trust,
        })
    }
}

/// The full per-email evaluation: content scoring and sender aggregation run
/// concurrently, then the trust lookup and the decision engine.
pub struct Pipeline {
    aggregator: Arc<SenderRiskAggregator>,
    feedback: Arc<dyn FeedbackStore>,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        domain_cache: Arc<dyn FeatureStore>,
        ip_cache: Arc<dyn FeatureStore>,
        graph: Arc<dyn SenderGraph>,
        feedback: Arc<dyn FeedbackStore>,
    ) -> Result<Self> {
        let probes = ProbeClient::new(&config.osint)?;
        let aggregator = Arc::new(SenderRiskAggregator::new(
            config,
            probes,
            domain_cache,
            ip_cache,
            graph,
        ));
        Ok(Self {
            aggregator,
            feedback,
        })
    }

    /// Evaluate one email. `phi_entities` comes from the upstream redaction
    /// step; `prior_decision` from any baseline logic that ran before us.
    ///
    /// Never fails and never panics outward: a component that blows up is
    /// replaced by its neutral output and the email fails open.
    pub async fn analyze(
        &self,
        email: &CompactEmail,
        phi_entities: u32,
        prior_decision: Verdict,
    ) -> EmailAssessment {
        // Sender intel runs on its own task while content scoring runs here;
        // the spawn boundary also contains any panic in the aggregator.
        let aggregator = self.aggregator.clone();
        let email_for_intel = email.clone();
        let intel_task =
            tokio::spawn(async move { aggregator.assess(&email_for_intel).await });

        let subject = email.subject.clone();
        let body = email.body.clone();
        let content = catch_unwind(AssertUnwindSafe(|| ContentScorer::analyze(&subject, &body)))
            .unwrap_or_else(|_| {
                log::error!("content scorer panicked; using neutral verdict");
                neutral_content_verdict()
            });

        let sender = match intel_task.await {
            Ok(intel) => intel,
            Err(e) => {
                log::error!("sender aggregation task failed: {e}");
                SenderIntel::empty_with_note("sender intel unavailable; treated as unknown")
            }
        };

        let trust = trust_feedback(
            self.feedback.as_ref(),
            sender.ids.from_domain.as_deref().unwrap_or(""),
        );

        let inputs = DecisionInputs {
            classification: content.classification,
            confidence: content.confidence,
            sender_risk: sender.risk.score as f64,
            phi_entities,
            prior_decision,
            trust_tier: trust.tier,
        };
        let decision = catch_unwind(AssertUnwindSafe(|| decide(&inputs))).unwrap_or_else(|_| {
            log::error!("decision engine panicked; failing open");
            fail_open_decision(&inputs)
        });

        let summary = RunSummary {
            classification: content.classification.as_str().to_string(),
            confidence: content.confidence,
            sender_risk: sender.risk.score,
            sender_risk_notes: sender.risk.notes.clone(),
            intent: content.intent.to_string(),
            tone: content.tone.to_string(),
            urgency: content.urgency.to_string(),
            has_phi: phi_entities > 0,
        };

        log::info!(
            "decision={} hitl={} risk={} classification={} confidence={:.2}",
            decision.decision.as_str(),
            decision.hitl.status.as_str(),
            sender.risk.score,
            summary.classification,
            content.confidence
        );

        EmailAssessment {
            content: content.to_analysis(),
            sender,
            trust,
            decision,
            summary,
        }
    }
}

/// Zero-signal verdict used when the content scorer itself fails.
fn neutral_content_verdict() -> ContentVerdict {
    ContentVerdict {
        classification: crate::content::Classification::Safe,
        confidence: 0.0,
        total_risk: 0.0,
        intent: "informational",
        tone: "neutral",
        urgency: "routine",
        signals: SignalVector::default(),
        scores: BTreeMap::new(),
        reasoning: vec!["Content analysis failed; treating as neutral.".to_string()],
    }
}

/// Last-ditch decision when the engine itself fails: allow, say why.
fn fail_open_decision(inputs: &DecisionInputs) -> Decision {
    Decision {
        decision: Verdict::Allow,
        risk: inputs.sender_risk,
        reasons: vec!["Decision engine error; failing open to allow.".to_string()],
        hitl: crate::decision::HitlRecord {
            status: crate::decision::HitlStatus::Skipped,
            actor: String::new(),
            verdict: String::new(),
            notes: String::new(),
            ts: None,
        },
        signals: serde_json::to_value(inputs).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::HitlStatus;
    use crate::store::{
        FeedbackVerdict, MemoryFeatureStore, MemoryFeedbackStore, MemorySenderGraph,
    };

    fn offline_pipeline() -> (Pipeline, Arc<MemoryFeedbackStore>) {
        let mut config = Config::default();
        config.compile_patterns().unwrap();
        config.osint.budget_ms = 0; // probes degrade to unknown
        let feedback = Arc::new(MemoryFeedbackStore::new());
        let pipeline = Pipeline::new(
            Arc::new(config),
            Arc::new(MemoryFeatureStore::new()),
            Arc::new(MemoryFeatureStore::new()),
            Arc::new(MemorySenderGraph::new()),
            feedback.clone(),
        )
        .unwrap();
        (pipeline, feedback)
    }

    fn email(addr: &str, subject: &str, body: &str) -> CompactEmail {
        CompactEmail {
            from_addr: Some(addr.to_string()),
            subject: subject.to_string(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_credential_phishing_is_quarantined() {
        let (pipeline, _) = offline_pipeline();
        let assessment = pipeline
            .analyze(
                &email(
                    "billing@suspicious.example",
                    "Action required",
                    "Please verify your account credentials, click the link http://example.com/x",
                ),
                0,
                Verdict::Allow,
            )
            .await;
        assert_eq!(assessment.decision.decision, Verdict::Quarantine);
        assert_eq!(assessment.summary.classification, "phishing");
        assert!(assessment.summary.confidence >= 0.5);
    }

    #[tokio::test]
    async fn test_benign_note_from_known_sender_is_allowed() {
        let (pipeline, feedback) = offline_pipeline();
        // Build allow history so the tier is trusted.
        for _ in 0..3 {
            feedback.record("example-clinic.com", FeedbackVerdict::Allow);
        }
        let assessment = pipeline
            .analyze(
                &email(
                    "frontdesk@example-clinic.com",
                    "Schedule",
                    "Your appointment is confirmed for Tuesday. Thanks!",
                ),
                0,
                Verdict::Allow,
            )
            .await;
        assert_eq!(assessment.decision.decision, Verdict::Allow);
        assert_eq!(assessment.decision.hitl.status, HitlStatus::Skipped);
        assert_eq!(assessment.trust.tier, Some(crate::store::TrustTier::Trusted));
    }

    #[tokio::test]
    async fn test_blocked_feedback_short_circuits() {
        let (pipeline, feedback) = offline_pipeline();
        feedback.record("shady.example", FeedbackVerdict::Block);
        let assessment = pipeline
            .analyze(
                &email("any@shady.example", "hello", "perfectly harmless text"),
                0,
                Verdict::Allow,
            )
            .await;
        assert_eq!(assessment.decision.decision, Verdict::Quarantine);
        assert_eq!(assessment.decision.hitl.status, HitlStatus::Skipped);
        assert!(assessment.decision.reasons[0].contains("blocked"));
    }

    #[tokio::test]
    async fn test_phi_compliance_hold() {
        let (pipeline, _) = offline_pipeline();
        // First-time sender carries risk 30; safe classification with high
        // confidence and moderate risk, PHI present: allowed but reviewed.
        let assessment = pipeline
            .analyze(
                &email(
                    "records@partner-lab.example",
                    "Results",
                    "Attached are the requested records. Regards, Lab",
                ),
                4,
                Verdict::Allow,
            )
            .await;
        assert_eq!(assessment.decision.decision, Verdict::Allow);
        assert!(assessment.summary.has_phi);
    }

    #[tokio::test]
    async fn test_missing_text_fails_open() {
        let (pipeline, _) = offline_pipeline();
        let assessment = pipeline
            .analyze(&CompactEmail::default(), 0, Verdict::Allow)
            .await;
        // No sender, no text: neutral signals, allow.
        assert_eq!(assessment.decision.decision, Verdict::Allow);
        assert_eq!(assessment.summary.classification, "safe");
        assert_eq!(assessment.summary.sender_risk, 0);
    }

    #[tokio::test]
    async fn test_prior_quarantine_is_preserved_in_default_path() {
        let (pipeline, _) = offline_pipeline();
        // Safe but below the auto-allow confidence bar, risk below every
        // threshold: no rule fires, so the upstream quarantine sticks.
        let body = "The required permit must be renewed, see attached form.";
        let assessment = pipeline
            .analyze(
                &email("odd@greyzone.example", "note", body),
                0,
                Verdict::Quarantine,
            )
            .await;
        assert_eq!(assessment.summary.classification, "safe");
        assert!(assessment.summary.confidence < 0.80);
        assert_eq!(assessment.decision.decision, Verdict::Quarantine);
        assert_eq!(assessment.decision.hitl.status, HitlStatus::Required);

        // The same email without the upstream quarantine fails open.
        let assessment = pipeline
            .analyze(
                &email("odd2@greyzone2.example", "note", body),
                0,
                Verdict::Allow,
            )
            .await;
        assert_eq!(assessment.decision.decision, Verdict::Allow);
        assert_eq!(assessment.decision.hitl.status, HitlStatus::Skipped);
    }

    #[tokio::test]
    async fn test_run_document_shape() {
        let (pipeline, _) = offline_pipeline();
        let assessment = pipeline
            .analyze(
                &email("a@b.example", "hi", "hello there"),
                0,
                Verdict::Allow,
            )
            .await;
        let doc = assessment.to_value();
        assert!(doc["decision"].is_string());
        assert!(doc["hitl"]["status"].is_string());
        assert!(doc["summary"]["sender_risk"].is_i64());
        assert!(doc["sender_intel"]["features"]["risk"]["score"].is_i64());
        assert!(doc["content"]["confidence_final"].is_f64());
    }
}
