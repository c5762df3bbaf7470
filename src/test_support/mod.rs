//! Test helpers shared by unit tests.

pub mod socket_guard;

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::fetch::{FetchError, FetchOptions, FetchResponse, Fetcher};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(FetchResponse),
    Error(FetchError),
}

/// Scripted [`Fetcher`]: per-URL reply queues (the last reply repeats),
/// call counting, and optional artificial latency. Unknown URLs get a 404.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    calls: Mutex<HashMap<String, usize>>,
    latency: Mutex<HashMap<String, Duration>>,
}

#[allow(clippy::unwrap_used)]
impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(status: u16) -> MockReply {
        MockReply::Response(FetchResponse::new(status, HashMap::new(), Bytes::new()))
    }

    pub fn bytes(body: Vec<u8>) -> MockReply {
        MockReply::Response(FetchResponse::new(200, HashMap::new(), body))
    }

    pub fn typed(body: &[u8], content_type: &str) -> MockReply {
        let headers = HashMap::from([("Content-Type".to_string(), content_type.to_string())]);
        MockReply::Response(FetchResponse::new(200, headers, body.to_vec()))
    }

    pub fn text(body: &str) -> MockReply {
        Self::bytes(body.as_bytes().to_vec())
    }

    pub fn json(value: &serde_json::Value) -> MockReply {
        Self::text(&value.to_string())
    }

    pub fn respond(&self, url: &str, reply: MockReply) {
        self.respond_sequence(url, vec![reply]);
    }

    pub fn respond_sequence(&self, url: &str, replies: Vec<MockReply>) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
    }

    pub fn set_latency(&self, url: &str, latency: Duration) {
        self.latency
            .lock()
            .unwrap()
            .insert(url.to_string(), latency);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn next_reply(&self, url: &str) -> MockReply {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Self::status(404)),
            None => Self::status(404),
        }
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
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

        match self.next_reply(url) {
            MockReply::Response(response) => Ok(response),
            MockReply::Error(error) => Err(error),
        }
    }
}

/// Encodes a solid-colour JPEG of the given size.
#[allow(clippy::unwrap_used)]
pub fn jpeg_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}
