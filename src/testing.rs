//! Test doubles shared by the unit tests.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::enrich::Summarizer;
use crate::error::{EnrichError, FetchError};
use crate::fetch::{PageFetcher, SessionTracker};
use crate::models::RawPage;

/// Canned responses per URL.
///
/// Responses are consumed in order; the last one repeats once the script for
/// a URL runs out. Unknown URLs fail with a network error.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, FetchError>>>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<HashMap<String, usize>>,
    sessions: SessionTracker,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, url: &str, response: Result<String, FetchError>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn page(self, url: &str, body: &str) -> Self {
        self.push(url, Ok(body.to_string()))
    }

    pub fn fail(self, url: &str, error: FetchError) -> Self {
        self.push(url, Err(error))
    }

    pub fn always_fail(self, url: &str, error: FetchError) -> Self {
        self.fail(url, error)
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    fn next_response(&self, url: &str) -> Result<String, FetchError> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(FetchError::NetworkFailure("empty script".into()))),
            None => Err(FetchError::NetworkFailure(format!("no script for {url}"))),
        }
    }
}

impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<RawPage, FetchError> {
        let _session = self.sessions.acquire();
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }

        let body = self.next_response(url)?;
        Ok(RawPage {
            url: url.to_string(),
            body,
            fetched_at: Utc::now(),
            status: 200,
        })
    }
}

/// Summarizer returning a fixed answer, or failing every call.
#[derive(Debug)]
pub struct FixedSummarizer(pub Option<String>);

impl Summarizer for FixedSummarizer {
    async fn summarize(&self, _text: &str) -> Result<Option<String>, EnrichError> {
        match &self.0 {
            Some(summary) => Ok(Some(summary.clone())),
            None => Err(EnrichError::Failed("model offline".into())),
        }
    }
}

/// Minimal page with a title, a description and optional extra head markup.
pub fn html_page(title: &str, description: &str, extra_head: &str) -> String {
    format!(
        "<!doctype html><html><head><title>{title}</title>\
         <meta name=\"description\" content=\"{description}\">{extra_head}</head>\
         <body><h1>{title}</h1></body></html>"
    )
}
