pub mod config;
pub mod content;
pub mod decision;
pub mod email;
pub mod osint;
pub mod pipeline;
pub mod sender_risk;
pub mod store;
pub mod typosquat;

pub use config::Config;
pub use content::{Classification, ContentScorer, ContentVerdict};
pub use decision::{decide, Decision, DecisionInputs, HitlStatus, Verdict};
pub use email::CompactEmail;
pub use pipeline::{EmailAssessment, Pipeline};
pub use sender_risk::{SenderIntel, SenderRiskAggregator};
pub use store::{TrustFeedback, TrustTier};
pub use typosquat::{ProtectedDomains, TyposquatVerdict};
