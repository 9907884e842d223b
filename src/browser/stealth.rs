// src/browser/stealth.rs
//! Anti-fingerprinting init script, context headers and the randomized human interaction
//! plan replayed after a page loads.

use std::collections::BTreeMap;

use rand::Rng;
use serde::Serialize;

use super::identity::BrowserEngine;

/// Injected before any page script runs.
pub const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', {
  get: () => [
    { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
    { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
  ]
});
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
window.chrome = window.chrome || {};
window.chrome.runtime = window.chrome.runtime || {};
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
  window.navigator.permissions.query = (parameters) =>
    parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters);
}
delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

const VIEWPORTS: &[Viewport] = &[
    Viewport { width: 1920, height: 1080 },
    Viewport { width: 1536, height: 864 },
    Viewport { width: 1440, height: 900 },
    Viewport { width: 1366, height: 768 },
];

pub fn random_viewport() -> Viewport {
    let mut rng = rand::rng();
    VIEWPORTS[rng.random_range(0..VIEWPORTS.len())]
}

/// Browser-like request headers for a new context.
pub fn context_headers(engine: BrowserEngine) -> BTreeMap<String, String> {
    let mut h = BTreeMap::new();
    h.insert(
        "Accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
    );
    h.insert("Accept-Language".to_string(), "en-US,en;q=0.9".to_string());
    h.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
    if engine == BrowserEngine::Chromium {
        h.insert("Sec-Fetch-Dest".to_string(), "document".to_string());
        h.insert("Sec-Fetch-Mode".to_string(), "navigate".to_string());
        h.insert("Sec-Fetch-Site".to_string(), "none".to_string());
    }
    h
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InteractionStep {
    Move { x: u32, y: u32, steps: u32 },
    Scroll { dy: i32 },
    Pause { ms: u64 },
}

/// Sequence of simulated user actions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionPlan {
    pub steps: Vec<InteractionStep>,
}

impl InteractionPlan {
    /// 3–6 pointer moves, 2–4 downward scrolls, a scroll back up 30% of the time, then
    /// back to the top. Pauses between actions keep the cadence human.
    pub fn random(viewport: Viewport) -> Self {
        let mut rng = rand::rng();
        let mut steps = Vec::new();

        for _ in 0..rng.random_range(3..=6) {
            steps.push(InteractionStep::Move {
                x: rng.random_range(100..viewport.width.saturating_sub(100).max(101)),
                y: rng.random_range(100..viewport.height.saturating_sub(100).max(101)),
                steps: rng.random_range(10..=25),
            });
            steps.push(InteractionStep::Pause {
                ms: rng.random_range(100..=300),
            });
        }

        let mut scrolled = 0i32;
        for _ in 0..rng.random_range(2..=4) {
            let dy = rng.random_range(300..=700);
            scrolled += dy;
            steps.push(InteractionStep::Scroll { dy });
            steps.push(InteractionStep::Pause {
                ms: rng.random_range(500..=1500),
            });
        }

        if rng.random_bool(0.3) {
            let back = rng.random_range(100..=300).min(scrolled);
            scrolled -= back;
            steps.push(InteractionStep::Scroll { dy: -back });
            steps.push(InteractionStep::Pause {
                ms: rng.random_range(300..=800),
            });
        }

        if scrolled > 0 {
            steps.push(InteractionStep::Scroll { dy: -scrolled });
        }
        Self { steps }
    }

    pub fn none() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn move_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, InteractionStep::Move { .. }))
            .count()
    }

    /// Net vertical offset after the plan runs.
    pub fn net_scroll(&self) -> i32 {
        self.steps
            .iter()
            .map(|s| match s {
                InteractionStep::Scroll { dy } => *dy,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_shape_stays_in_bounds_and_returns_to_top() {
        for _ in 0..200 {
            let plan = InteractionPlan::random(Viewport { width: 1366, height: 768 });
            let moves = plan.move_count();
            assert!((3..=6).contains(&moves), "moves = {moves}");
            let downs = plan
                .steps
                .iter()
                .filter(|s| matches!(s, InteractionStep::Scroll { dy } if *dy > 0))
                .count();
            assert!((2..=4).contains(&downs), "downs = {downs}");
            assert_eq!(plan.net_scroll(), 0);
        }
    }

    #[test]
    fn stealth_script_hides_webdriver() {
        assert!(STEALTH_SCRIPT.contains("navigator, 'webdriver'"));
        assert!(STEALTH_SCRIPT.contains("chrome.runtime"));
    }

    #[test]
    fn chromium_gets_fetch_metadata_headers() {
        assert!(context_headers(BrowserEngine::Chromium).contains_key("Sec-Fetch-Mode"));
        assert!(!context_headers(BrowserEngine::Firefox).contains_key("Sec-Fetch-Mode"));
    }
}
