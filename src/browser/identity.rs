// src/browser/identity.rs
//! `{user_agent, proxy}` identities, handed out round-robin with per-fetch exclusion and a
//! time-boxed quarantine for identities that were just blocked.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            BrowserEngine::Chromium => "chromium",
            BrowserEngine::Firefox => "firefox",
            BrowserEngine::Webkit => "webkit",
        }
    }

    /// Built-in desktop user agents matching the engine's fingerprint.
    pub fn default_user_agents(self) -> &'static [&'static str] {
        match self {
            BrowserEngine::Chromium => &[
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
            ],
            BrowserEngine::Firefox => &[
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
                "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
            ],
            BrowserEngine::Webkit => &[
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.3 Safari/605.1.15",
            ],
        }
    }
}

impl fmt::Display for BrowserEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    /// Position in the pool; stable for the pool's lifetime.
    pub id: usize,
    pub engine: BrowserEngine,
    pub user_agent: String,
    pub proxy: Option<String>,
}

#[derive(Debug, Default)]
struct PoolState {
    cursor: usize,
    quarantined_until: HashMap<usize, Instant>,
}

#[derive(Debug)]
pub struct IdentityPool {
    identities: Vec<Identity>,
    quarantine_for: Duration,
    state: Mutex<PoolState>,
}

impl IdentityPool {
    /// Pair user agents with proxies. Identity `i` gets user agent `i % uas` and proxy
    /// `i % proxies`, over `max(uas, proxies)` identities, so both lists rotate together
    /// ("next proxy, next UA").
    pub fn new(
        engine: BrowserEngine,
        user_agents: Vec<String>,
        proxies: Vec<String>,
        quarantine_for: Duration,
    ) -> Self {
        let user_agents = if user_agents.is_empty() {
            engine
                .default_user_agents()
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            user_agents
        };
        let n = user_agents.len().max(proxies.len());
        let identities = (0..n)
            .map(|i| Identity {
                id: i,
                engine,
                user_agent: user_agents[i % user_agents.len()].clone(),
                proxy: (!proxies.is_empty()).then(|| proxies[i % proxies.len()].clone()),
            })
            .collect();
        Self {
            identities,
            quarantine_for,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Next identity in round-robin order that is neither in `exclude` nor quarantined.
    pub fn next(&self, exclude: &HashSet<usize>) -> Option<Identity> {
        let mut st = self.state.lock().ok()?;
        let now = Instant::now();
        st.quarantined_until.retain(|_, until| *until > now);

        let n = self.identities.len();
        for step in 0..n {
            let idx = (st.cursor + step) % n;
            if exclude.contains(&idx) || st.quarantined_until.contains_key(&idx) {
                continue;
            }
            st.cursor = (idx + 1) % n;
            return Some(self.identities[idx].clone());
        }
        None
    }

    /// Keep `id` out of rotation for the quarantine window.
    pub fn quarantine(&self, id: usize) {
        if let Ok(mut st) = self.state.lock() {
            st.quarantined_until
                .insert(id, Instant::now() + self.quarantine_for);
        }
    }

    pub fn is_quarantined(&self, id: usize) -> bool {
        self.state
            .lock()
            .map(|st| {
                st.quarantined_until
                    .get(&id)
                    .is_some_and(|until| *until > Instant::now())
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(uas: &[&str], proxies: &[&str]) -> IdentityPool {
        IdentityPool::new(
            BrowserEngine::Chromium,
            uas.iter().map(|s| s.to_string()).collect(),
            proxies.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn rotates_user_agent_and_proxy_together() {
        let p = pool(&["ua1", "ua2"], &["p1", "p2", "p3"]);
        assert_eq!(p.len(), 3);
        let none = HashSet::new();
        let a = p.next(&none).unwrap();
        let b = p.next(&none).unwrap();
        let c = p.next(&none).unwrap();
        let d = p.next(&none).unwrap();
        assert_eq!((a.user_agent.as_str(), a.proxy.as_deref()), ("ua1", Some("p1")));
        assert_eq!((b.user_agent.as_str(), b.proxy.as_deref()), ("ua2", Some("p2")));
        assert_eq!((c.user_agent.as_str(), c.proxy.as_deref()), ("ua1", Some("p3")));
        assert_eq!(d.id, a.id);
    }

    #[test]
    fn exclusion_and_quarantine_skip_identities() {
        let p = pool(&["ua1", "ua2", "ua3"], &[]);
        p.quarantine(1);
        assert!(p.is_quarantined(1));
        let exclude: HashSet<usize> = [0].into_iter().collect();
        assert_eq!(p.next(&exclude).unwrap().id, 2);
        let all: HashSet<usize> = [0, 2].into_iter().collect();
        assert!(p.next(&all).is_none());
    }

    #[test]
    fn empty_user_agent_list_uses_engine_defaults() {
        let p = IdentityPool::new(BrowserEngine::Firefox, vec![], vec![], Duration::ZERO);
        assert_eq!(p.len(), BrowserEngine::Firefox.default_user_agents().len());
        assert!(p.next(&HashSet::new()).unwrap().user_agent.contains("Firefox"));
    }
}
