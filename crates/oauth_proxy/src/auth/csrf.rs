use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::warn;

use super::crypto::generate_token;
use super::identity::ProviderKind;

/// Login attempts older than this are rejected at the callback.
pub const DEFAULT_FLOW_TTL_SECS: i64 = 600;

/// Upper bound on concurrently pending logins; the oldest are dropped first.
pub const DEFAULT_MAX_FLOWS: usize = 10_000;

/// An authorization redirect that has been issued but not yet completed.
#[derive(Debug, Clone)]
pub struct PendingFlow {
    pub state: String,
    pub provider: ProviderKind,
    /// Local path the user should land on after login
    pub return_to: String,
    pub created_at: DateTime<Utc>,
}

/// Single-use CSRF states for in-flight logins.
pub struct PendingFlows {
    flows: DashMap<String, PendingFlow>,
    ttl: Duration,
    max_flows: usize,
}

impl PendingFlows {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flows: DashMap::new(),
            ttl,
            max_flows: DEFAULT_MAX_FLOWS,
        }
    }

    pub fn with_max_flows(mut self, max_flows: usize) -> Self {
        self.max_flows = max_flows.max(1);
        self
    }

    /// Record a new login attempt and return it with a fresh state value.
    pub fn begin(&self, provider: ProviderKind, return_to: impl Into<String>) -> PendingFlow {
        let flow = PendingFlow {
            state: generate_token(32),
            provider,
            return_to: return_to.into(),
            created_at: Utc::now(),
        };
        self.make_room();
        self.flows.insert(flow.state.clone(), flow.clone());
        flow
    }

    fn make_room(&self) {
        if self.flows.len() < self.max_flows {
            return;
        }
        self.purge_expired();

        let mut evicted = 0usize;
        while self.flows.len() >= self.max_flows {
            let oldest = self
                .flows
                .iter()
                .min_by_key(|entry| entry.created_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(state) => {
                    self.flows.remove(&state);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            warn!(evicted, "pending login limit reached, dropped oldest flows");
        }
    }

    /// Consume the flow for `state`. A state can be taken at most once.
    pub fn take(&self, state: &str) -> Option<PendingFlow> {
        let (_, flow) = self.flows.remove(state)?;
        if Utc::now() - flow.created_at > self.ttl {
            return None;
        }
        Some(flow)
    }

    /// Drop flows that were never completed.
    pub fn purge_expired(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.created_at >= cutoff);
        before.saturating_sub(self.flows.len())
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl Default for PendingFlows {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_FLOW_TTL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_single_use() {
        let flows = PendingFlows::default();
        let flow = flows.begin(ProviderKind::GitHub, "/dashboard");

        let taken = flows.take(&flow.state).unwrap();
        assert_eq!(taken.provider, ProviderKind::GitHub);
        assert_eq!(taken.return_to, "/dashboard");
        assert!(flows.take(&flow.state).is_none());
    }

    #[test]
    fn test_unknown_state() {
        let flows = PendingFlows::default();
        assert!(flows.take("forged").is_none());
    }

    #[test]
    fn test_expired_flows() {
        let flows = PendingFlows::new(Duration::seconds(-1));
        let first = flows.begin(ProviderKind::GitLab, "/");
        flows.begin(ProviderKind::GitLab, "/");

        assert!(flows.take(&first.state).is_none());
        assert_eq!(flows.purge_expired(), 1);
        assert!(flows.is_empty());
    }

    #[test]
    fn test_oldest_flows_evicted_at_capacity() {
        let flows = PendingFlows::default().with_max_flows(2);
        let first = flows.begin(ProviderKind::GitHub, "/a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = flows.begin(ProviderKind::GitHub, "/b");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let third = flows.begin(ProviderKind::GitHub, "/c");

        assert_eq!(flows.len(), 2);
        assert!(flows.take(&first.state).is_none());
        assert_eq!(flows.take(&second.state).unwrap().return_to, "/b");
        assert_eq!(flows.take(&third.state).unwrap().return_to, "/c");
    }
}
