use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use manuscript_core::Fetcher;
use manuscript_core::fetch::{FetchError, FetchOptions, FetchResponse};

/// In-process [`Fetcher`] with scripted replies per URL.
///
/// The last reply in a sequence repeats; unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, VecDeque<(u16, Vec<u8>)>>>,
    latency: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

#[allow(clippy::unwrap_used)]
impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.serve_sequence(url, vec![(200, body.into())]);
    }

    pub fn serve_json(&self, url: &str, value: &serde_json::Value) {
        self.serve(url, value.to_string());
    }

    pub fn serve_sequence(&self, url: &str, replies: Vec<(u16, Vec<u8>)>) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
    }

    pub fn delay(&self, url: &str, latency: Duration) {
        self.latency
            .lock()
            .unwrap()
            .insert(url.to_string(), latency);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn next_reply(&self, url: &str) -> (u16, Vec<u8>) {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
            Some(replies) => replies.front().cloned().unwrap_or((404, Vec::new())),
            None => (404, Vec::new()),
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    #[allow(clippy::unwrap_used)]
    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_insert(0) += 1;

        let latency = self.latency.lock().unwrap().get(url).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let (status, body) = self.next_reply(url);
        Ok(FetchResponse::new(status, HashMap::new(), body))
    }
}
