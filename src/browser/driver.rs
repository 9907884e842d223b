// src/browser/driver.rs
//! Automation driver seam. The session manager only knows contexts and page loads; the
//! production driver talks to a Browserless instance over HTTP.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::identity::Identity;
use super::stealth::{InteractionPlan, Viewport};
use crate::error::FetchError;

/// Everything needed to create an isolated browser context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSpec {
    pub identity: Identity,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
    pub headers: BTreeMap<String, String>,
    pub init_script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    pub id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageRequest {
    pub url: String,
    pub timeout: Duration,
    pub interaction: InteractionPlan,
}

/// What the driver saw after navigation and interaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageSnapshot {
    pub status: u16,
    #[serde(default)]
    pub html: String,
    /// Rendered `innerText` of the body, when the driver provides it.
    #[serde(default)]
    pub text: String,
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn open_context(&self, spec: &ContextSpec) -> Result<ContextHandle, FetchError>;
    async fn load(
        &self,
        ctx: &ContextHandle,
        request: &PageRequest,
    ) -> Result<PageSnapshot, FetchError>;
    /// Destroy the context. Must be safe to call for an already closed context.
    async fn close_context(&self, ctx: &ContextHandle);
    fn name(&self) -> &'static str;
}

const FUNCTION_SOURCE: &str = r#"
export default async function ({ page, context }) {
  await page.setViewport(context.viewport);
  await page.setUserAgent(context.userAgent);
  await page.setExtraHTTPHeaders(context.headers);
  await page.evaluateOnNewDocument(context.initScript);
  await page.emulateTimezone(context.timezone);
  const resp = await page.goto(context.url, { waitUntil: 'domcontentloaded', timeout: context.timeoutMs });
  const sleep = (ms) => new Promise((r) => setTimeout(r, ms));
  for (const step of context.interaction.steps) {
    if (step.action === 'move') await page.mouse.move(step.x, step.y, { steps: step.steps });
    else if (step.action === 'scroll') await page.evaluate((dy) => window.scrollBy(0, dy), step.dy);
    else if (step.action === 'pause') await sleep(step.ms);
  }
  const html = await page.content();
  const text = await page.evaluate(() => document.body ? document.body.innerText : '');
  return { data: { status: resp ? resp.status() : 0, html, text }, type: 'application/json' };
}
"#;

/// Browserless `/function` driver. Each load is one stateless call; the context spec is
/// replayed inside the remote function.
pub struct BrowserlessDriver {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    next_id: AtomicU64,
    contexts: std::sync::Mutex<std::collections::HashMap<u64, ContextSpec>>,
}

impl BrowserlessDriver {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            next_id: AtomicU64::new(1),
            contexts: Default::default(),
        })
    }

    fn endpoint(&self, proxy: Option<&str>) -> String {
        let mut url = format!("{}/function", self.base_url);
        let mut params = Vec::new();
        if let Some(t) = &self.token {
            params.push(format!("token={t}"));
        }
        if let Some(p) = proxy {
            params.push(format!("--proxy-server={p}"));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }
}

#[derive(Debug, Deserialize)]
struct FunctionResponse {
    data: PageSnapshot,
}

#[async_trait]
impl AutomationDriver for BrowserlessDriver {
    async fn open_context(&self, spec: &ContextSpec) -> Result<ContextHandle, FetchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.contexts
            .lock()
            .map_err(|_| FetchError::network("", "browser context registry poisoned"))?
            .insert(id, spec.clone());
        Ok(ContextHandle { id })
    }

    async fn load(
        &self,
        ctx: &ContextHandle,
        request: &PageRequest,
    ) -> Result<PageSnapshot, FetchError> {
        let spec = self
            .contexts
            .lock()
            .ok()
            .and_then(|m| m.get(&ctx.id).cloned())
            .ok_or_else(|| FetchError::network(&request.url, "browser context closed"))?;

        let body = json!({
            "code": FUNCTION_SOURCE,
            "context": {
                "url": request.url,
                "timeoutMs": request.timeout.as_millis() as u64,
                "userAgent": spec.identity.user_agent,
                "viewport": spec.viewport,
                "headers": spec.headers,
                "initScript": spec.init_script,
                "timezone": spec.timezone,
                "locale": spec.locale,
                "interaction": request.interaction,
            }
        });

        let resp = self
            .client
            .post(self.endpoint(spec.identity.proxy.as_deref()))
            .timeout(request.timeout + Duration::from_secs(15))
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&request.url, &e))?;

        if !resp.status().is_success() {
            return Err(FetchError::network(
                &request.url,
                format!("browserless returned HTTP {}", resp.status().as_u16()),
            ));
        }
        let parsed: FunctionResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::network(&request.url, format!("browserless payload: {e}")))?;
        Ok(parsed.data)
    }

    async fn close_context(&self, ctx: &ContextHandle) {
        if let Ok(mut m) = self.contexts.lock() {
            m.remove(&ctx.id);
        }
    }

    fn name(&self) -> &'static str {
        "browserless"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_carries_token_and_proxy() {
        let d = BrowserlessDriver::new("http://chrome:3000/", Some("t0k".into())).unwrap();
        assert_eq!(d.endpoint(None), "http://chrome:3000/function?token=t0k");
        assert_eq!(
            d.endpoint(Some("http://p1:8080")),
            "http://chrome:3000/function?token=t0k&--proxy-server=http://p1:8080"
        );
    }
}
