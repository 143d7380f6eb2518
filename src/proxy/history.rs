//! Proxy exchange history
//!
//! The proxy hands every completed exchange and every attack result to a
//! [`RecordStore`]. The in-memory [`ProxyHistory`] is the default store.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::exchange::{Exchange, ExchangeId};
use crate::intruder::AttackResult;

/// Persistence boundary for captured traffic
pub trait RecordStore: Send + Sync {
    /// Insert or replace an exchange
    fn save_exchange(&self, exchange: &Exchange);

    fn exchange(&self, id: ExchangeId) -> Option<Exchange>;

    fn query(&self, filter: &HistoryFilter) -> Vec<Exchange>;

    fn save_attack_result(&self, attack_id: &str, result: &AttackResult);

    fn attack_results(&self, attack_id: &str) -> Vec<AttackResult>;
}

/// Criteria for [`RecordStore::query`]. Empty criteria match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryFilter {
    /// Substring of the host
    pub host: Option<String>,

    /// Exact response status
    pub status: Option<u16>,

    /// Case-insensitive search over URL and bodies
    pub search: Option<String>,

    /// Most recent N entries
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn matches(&self, exchange: &Exchange) -> bool {
        if let Some(host) = &self.host {
            if !exchange.host.to_lowercase().contains(&host.to_lowercase()) {
                return false;
            }
        }

        if let Some(status) = self.status {
            if exchange.response.as_ref().map(|r| r.status) != Some(status) {
                return false;
            }
        }

        if let Some(query) = &self.search {
            let query = query.to_lowercase();
            let in_body = |text: Option<&str>| text.map(|t| t.to_lowercase().contains(&query)).unwrap_or(false);
            if !(exchange.url.to_lowercase().contains(&query)
                || in_body(exchange.body.as_text())
                || in_body(exchange.response.as_ref().and_then(|r| r.body.as_text())))
            {
                return false;
            }
        }

        true
    }
}

/// Bounded in-memory history
pub struct ProxyHistory {
    /// Exchanges in arrival order
    entries: RwLock<VecDeque<Exchange>>,

    /// Attack results keyed by attack id
    attacks: RwLock<AttackResults>,

    /// Maximum number of exchanges, and of attack results, to keep
    max_entries: usize,
}

/// Attack results with the oldest evicted first across all attacks
#[derive(Default)]
struct AttackResults {
    by_attack: HashMap<String, VecDeque<AttackResult>>,
    /// Owning attack of each stored result, oldest first
    order: VecDeque<String>,
}

impl AttackResults {
    fn push(&mut self, attack_id: &str, result: AttackResult, max: usize) {
        self.by_attack
            .entry(attack_id.to_string())
            .or_default()
            .push_back(result);
        self.order.push_back(attack_id.to_string());

        while self.order.len() > max {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(results) = self.by_attack.get_mut(&oldest) {
                results.pop_front();
                if results.is_empty() {
                    self.by_attack.remove(&oldest);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.by_attack.clear();
        self.order.clear();
    }
}

impl ProxyHistory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            attacks: RwLock::new(AttackResults::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clear all history
    pub fn clear(&self) {
        self.entries.write().clear();
        self.attacks.write().clear();
    }
}

impl Default for ProxyHistory {
    fn default() -> Self {
        Self::new(10000)
    }
}

impl RecordStore for ProxyHistory {
    fn save_exchange(&self, exchange: &Exchange) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().rev().find(|e| e.id == exchange.id) {
            *existing = exchange.clone();
            return;
        }

        entries.push_back(exchange.clone());
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    fn exchange(&self, id: ExchangeId) -> Option<Exchange> {
        self.entries.read().iter().find(|e| e.id == id).cloned()
    }

    fn query(&self, filter: &HistoryFilter) -> Vec<Exchange> {
        let entries = self.entries.read();
        let mut matched: Vec<_> = entries.iter().filter(|e| filter.matches(e)).cloned().collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    fn save_attack_result(&self, attack_id: &str, result: &AttackResult) {
        self.attacks.write().push(attack_id, result.clone(), self.max_entries);
    }

    fn attack_results(&self, attack_id: &str) -> Vec<AttackResult> {
        self.attacks
            .read()
            .by_attack
            .get(attack_id)
            .map(|results| results.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Headers};
    use crate::proxy::exchange::ExchangeResponse;

    fn exchange(id: u64, url: &str, status: u16, body: &str) -> Exchange {
        let mut ex = Exchange::new(id, "GET", url, Headers::new(), Body::default());
        ex.set_response(ExchangeResponse {
            status,
            reason: String::new(),
            headers: Headers::new(),
            body: Body::text(body),
            duration_ms: 1,
        });
        ex
    }

    #[test]
    fn test_save_replaces_by_id() {
        let history = ProxyHistory::new(10);
        let mut ex = exchange(1, "http://a.example/", 200, "one");
        history.save_exchange(&ex);
        ex.modified = true;
        history.save_exchange(&ex);

        assert_eq!(history.len(), 1);
        assert!(history.exchange(1).unwrap().modified);
    }

    #[test]
    fn test_bounded() {
        let history = ProxyHistory::new(2);
        for id in 1..=3 {
            history.save_exchange(&exchange(id, "http://a.example/", 200, ""));
        }
        assert_eq!(history.len(), 2);
        assert!(history.exchange(1).is_none());
    }

    #[test]
    fn test_attack_results_share_the_cap() {
        use crate::http::HttpRequest;
        use crate::intruder::Variation;

        let result = |index: usize| {
            AttackResult::new(&Variation {
                index,
                payloads: vec![Some(format!("p{}", index))],
                request: HttpRequest::new("GET", "http://t.example/"),
            })
        };

        let history = ProxyHistory::new(3);
        history.save_attack_result("first", &result(0));
        history.save_attack_result("first", &result(1));
        history.save_attack_result("second", &result(0));
        history.save_attack_result("second", &result(1));

        let first: Vec<_> = history.attack_results("first").iter().map(|r| r.index).collect();
        assert_eq!(first, vec![1]);
        assert_eq!(history.attack_results("second").len(), 2);

        history.save_attack_result("second", &result(2));
        assert!(history.attack_results("first").is_empty());
        assert_eq!(history.attack_results("second").len(), 3);

        history.clear();
        assert!(history.attack_results("second").is_empty());
    }

    #[test]
    fn test_query_filters() {
        let history = ProxyHistory::new(10);
        history.save_exchange(&exchange(1, "http://api.example/users", 200, "alice"));
        history.save_exchange(&exchange(2, "http://cdn.example/logo", 404, ""));
        history.save_exchange(&exchange(3, "http://api.example/admin", 403, "Forbidden"));

        let by_host = history.query(&HistoryFilter {
            host: Some("API".into()),
            ..Default::default()
        });
        assert_eq!(by_host.len(), 2);

        let by_status = history.query(&HistoryFilter {
            status: Some(404),
            ..Default::default()
        });
        assert_eq!(by_status[0].id, 2);

        let by_text = history.query(&HistoryFilter {
            search: Some("forbidden".into()),
            ..Default::default()
        });
        assert_eq!(by_text.len(), 1);

        let recent = history.query(&HistoryFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(recent[0].id, 3);
    }
}
