use crate::sender_risk::{FeatureBag, FeatureValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch seconds.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A cached feature snapshot with an absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub snapshot: FeatureBag,
    /// Absolute expiry, epoch seconds. The entry is a miss once `now >= ttl`.
    pub ttl: u64,
}

/// Read-through snapshot cache keyed by domain or IP.
///
/// Writes are wholesale overwrites (last write wins); there is no in-place
/// mutation. Expired entries are indistinguishable from misses.
pub trait FeatureStore: Send + Sync {
    fn get(&self, key: &str) -> Option<FeatureBag>;
    fn put(&self, key: &str, snapshot: FeatureBag, ttl_seconds: u64);
}

/// In-process store for tests and offline analysis.
#[derive(Debug, Default)]
pub struct MemoryFeatureStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn put_with_expiry(&self, key: &str, snapshot: FeatureBag, ttl: u64) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key.to_string(), CacheEntry { snapshot, ttl });
    }
}

impl FeatureStore for MemoryFeatureStore {
    fn get(&self, key: &str) -> Option<FeatureBag> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if epoch_now() >= entry.ttl {
            return None;
        }
        Some(entry.snapshot.clone())
    }

    fn put(&self, key: &str, snapshot: FeatureBag, ttl_seconds: u64) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.to_string(),
                CacheEntry {
                    snapshot,
                    ttl: epoch_now() + ttl_seconds,
                },
            );
        }
    }
}

/// What the sender-frequency graph reports after recording one sighting.
/// `None` means the graph was unreachable, not "never seen".
#[derive(Debug, Clone, Default)]
pub struct GraphObservation {
    pub first_time_domain: Option<bool>,
    pub first_time_addr: Option<bool>,
    pub domain_seen: Option<i64>,
}

/// Sender-frequency graph with atomic increment-and-read semantics.
pub trait SenderGraph: Send + Sync {
    /// Record one sighting of `domain` (and optionally the full address)
    /// and return the updated counters in the same operation.
    fn observe(&self, domain: &str, addr: Option<&str>) -> GraphObservation;
}

#[derive(Debug, Clone)]
struct GraphNode {
    seen_count: i64,
    first_seen: u64,
    last_seen: u64,
}

/// In-process graph. A single lock covers the add-if-absent-else-increment
/// so concurrent senders from the same domain cannot lose updates.
#[derive(Debug, Default)]
pub struct MemorySenderGraph {
    nodes: Mutex<HashMap<String, GraphNode>>,
}

impl MemorySenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(nodes: &mut HashMap<String, GraphNode>, key: String) -> (bool, i64) {
        let now = epoch_now();
        match nodes.get_mut(&key) {
            Some(node) => {
                node.seen_count += 1;
                node.last_seen = now;
                (false, node.seen_count)
            }
            None => {
                nodes.insert(
                    key,
                    GraphNode {
                        seen_count: 1,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                (true, 1)
            }
        }
    }
}

impl SenderGraph for MemorySenderGraph {
    fn observe(&self, domain: &str, addr: Option<&str>) -> GraphObservation {
        if domain.is_empty() {
            return GraphObservation::default();
        }
        let mut nodes = match self.nodes.lock() {
            Ok(nodes) => nodes,
            Err(_) => return GraphObservation::default(),
        };
        let (first_domain, domain_seen) = Self::bump(&mut nodes, format!("dom#{domain}"));
        let first_addr = addr
            .filter(|a| !a.is_empty())
            .map(|a| Self::bump(&mut nodes, format!("dom#{domain}|addr#{a}")).0);
        GraphObservation {
            first_time_domain: Some(first_domain),
            first_time_addr: first_addr,
            domain_seen: Some(domain_seen),
        }
    }
}

/// Sender-domain reputation bucket derived from human verdict history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Blocked,
    Trusted,
}

/// One recorded human verdict for a sender domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackVerdict {
    Allow,
    Block,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustFeedback {
    pub tier: Option<TrustTier>,
    pub allows: u32,
    pub blocks: u32,
}

/// History of human verdicts per sender domain, newest first.
pub trait FeedbackStore: Send + Sync {
    fn recent_verdicts(&self, domain: &str) -> Vec<FeedbackVerdict>;
}

/// Derive the trust tier from the ten most recent human verdicts:
/// even one recent block flags the domain; three or more allows with no
/// blocks earn trust; anything else stays neutral.
pub fn trust_feedback(store: &dyn FeedbackStore, domain: &str) -> TrustFeedback {
    if domain.is_empty() {
        return TrustFeedback::default();
    }
    let verdicts = store.recent_verdicts(domain);
    let mut allows = 0u32;
    let mut blocks = 0u32;
    for verdict in verdicts.iter().take(10) {
        match verdict {
            FeedbackVerdict::Allow => allows += 1,
            FeedbackVerdict::Block => blocks += 1,
        }
    }
    let tier = if blocks > 0 {
        Some(TrustTier::Blocked)
    } else if allows >= 3 {
        Some(TrustTier::Trusted)
    } else {
        None
    };
    TrustFeedback { tier, allows, blocks }
}

/// In-process verdict history for tests and offline analysis.
#[derive(Debug, Default)]
pub struct MemoryFeedbackStore {
    history: Mutex<HashMap<String, Vec<FeedbackVerdict>>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, domain: &str, verdict: FeedbackVerdict) {
        if let Ok(mut history) = self.history.lock() {
            // Newest first, mirroring a descending index scan.
            history.entry(domain.to_lowercase()).or_default().insert(0, verdict);
        }
    }
}

impl FeedbackStore for MemoryFeedbackStore {
    fn recent_verdicts(&self, domain: &str) -> Vec<FeedbackVerdict> {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.get(&domain.to_lowercase()).cloned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_miss_then_hit() {
        let store = MemoryFeatureStore::new();
        assert!(store.get("example.com").is_none());
        store.put(
            "example.com",
            FeatureBag::from([("crtsh.count".to_string(), FeatureValue::Int(12))]),
            3600,
        );
        let snapshot = store.get("example.com").unwrap();
        assert_eq!(snapshot.get("crtsh.count"), Some(&FeatureValue::Int(12)));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let store = MemoryFeatureStore::new();
        store.put_with_expiry(
            "stale.example",
            FeatureBag::from([("crtsh.count".to_string(), FeatureValue::Int(3))]),
            epoch_now().saturating_sub(1),
        );
        assert!(store.get("stale.example").is_none());
    }

    #[test]
    fn test_put_overwrites_wholesale() {
        let store = MemoryFeatureStore::new();
        store.put(
            "k",
            FeatureBag::from([
                ("a".to_string(), FeatureValue::Int(1)),
                ("b".to_string(), FeatureValue::Int(2)),
            ]),
            3600,
        );
        store.put("k", FeatureBag::from([("a".to_string(), FeatureValue::Int(9))]), 3600);
        let snapshot = store.get("k").unwrap();
        assert_eq!(snapshot.get("a"), Some(&FeatureValue::Int(9)));
        assert!(snapshot.get("b").is_none()); // old keys do not survive
    }

    #[test]
    fn test_graph_first_time_then_repeat() {
        let graph = MemorySenderGraph::new();
        let first = graph.observe("example.com", Some("a@example.com"));
        assert_eq!(first.first_time_domain, Some(true));
        assert_eq!(first.first_time_addr, Some(true));
        assert_eq!(first.domain_seen, Some(1));

        let second = graph.observe("example.com", Some("b@example.com"));
        assert_eq!(second.first_time_domain, Some(false));
        assert_eq!(second.first_time_addr, Some(true)); // new address, known domain
        assert_eq!(second.domain_seen, Some(2));

        let third = graph.observe("example.com", Some("a@example.com"));
        assert_eq!(third.first_time_addr, Some(false));
        assert_eq!(third.domain_seen, Some(3));
    }

    #[test]
    fn test_graph_without_address() {
        let graph = MemorySenderGraph::new();
        let obs = graph.observe("example.com", None);
        assert_eq!(obs.first_time_domain, Some(true));
        assert_eq!(obs.first_time_addr, None);
    }

    #[test]
    fn test_graph_empty_domain_is_unknown() {
        let graph = MemorySenderGraph::new();
        let obs = graph.observe("", Some("a@b.example"));
        assert_eq!(obs.first_time_domain, None);
        assert_eq!(obs.domain_seen, None);
    }

    #[test]
    fn test_trust_tier_blocked_wins() {
        let store = MemoryFeedbackStore::new();
        for _ in 0..5 {
            store.record("example.com", FeedbackVerdict::Allow);
        }
        store.record("example.com", FeedbackVerdict::Block);
        let feedback = trust_feedback(&store, "example.com");
        assert_eq!(feedback.tier, Some(TrustTier::Blocked));
        assert_eq!(feedback.blocks, 1);
        assert_eq!(feedback.allows, 5);
    }

    #[test]
    fn test_trust_tier_trusted_needs_three_allows() {
        let store = MemoryFeedbackStore::new();
        store.record("example.com", FeedbackVerdict::Allow);
        store.record("example.com", FeedbackVerdict::Allow);
        assert_eq!(trust_feedback(&store, "example.com").tier, None);
        store.record("example.com", FeedbackVerdict::Allow);
        assert_eq!(
            trust_feedback(&store, "example.com").tier,
            Some(TrustTier::Trusted)
        );
    }

    #[test]
    fn test_trust_tier_window_is_ten_verdicts() {
        let store = MemoryFeedbackStore::new();
        store.record("example.com", FeedbackVerdict::Block);
        // Ten newer allows push the old block out of the window.
        for _ in 0..10 {
            store.record("example.com", FeedbackVerdict::Allow);
        }
        let feedback = trust_feedback(&store, "example.com");
        assert_eq!(feedback.blocks, 0);
        assert_eq!(feedback.tier, Some(TrustTier::Trusted));
    }

    #[test]
    fn test_trust_tier_unknown_domain() {
        let store = MemoryFeedbackStore::new();
        let feedback = trust_feedback(&store, "never-seen.example");
        assert_eq!(feedback.tier, None);
        assert_eq!(feedback.allows, 0);
    }
}
