//! Scripted fetcher shared by the streaming tests

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::streaming::fetch::{FetchError, FetchFuture, TileFetcher};

/// A small valid PNG
pub(crate) fn tiny_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([128, 64, 32]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

#[derive(Default)]
struct Script {
    calls: HashMap<String, u32>,
    failures: HashMap<String, u32>,
    corruptions: HashMap<String, u32>,
}

/// Serves a PNG for every URL, except for scripted failures. Counts calls per URL.
pub(crate) struct ScriptedFetcher {
    png: Vec<u8>,
    script: Mutex<Script>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self { png: tiny_png(), script: Mutex::new(Script::default()), gate: None }
    }

    /// Every fetch waits for one permit of the returned semaphore
    pub(crate) fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Self { gate: Some(Arc::clone(&gate)), ..Self::new() };
        (fetcher, gate)
    }

    /// Fail the next `n` fetches of `url`
    pub(crate) fn fail_times(&self, url: &str, n: u32) {
        self.script.lock().unwrap().failures.insert(url.to_string(), n);
    }

    /// Serve undecodable bytes for the next `n` fetches of `url`
    pub(crate) fn corrupt_times(&self, url: &str, n: u32) {
        self.script.lock().unwrap().corruptions.insert(url.to_string(), n);
    }

    pub(crate) fn calls(&self, url: &str) -> u32 {
        self.script.lock().unwrap().calls.get(url).copied().unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> u32 {
        self.script.lock().unwrap().calls.values().sum()
    }
}

fn take_one(counter: &mut HashMap<String, u32>, url: &str) -> bool {
    match counter.get_mut(url) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl TileFetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }

            let mut script = self.script.lock().unwrap();
            *script.calls.entry(url.to_string()).or_default() += 1;

            if take_one(&mut script.failures, url) {
                return Err(FetchError::Other(format!("scripted failure for {url}")));
            }
            if take_one(&mut script.corruptions, url) {
                return Ok(b"not an image".to_vec());
            }
            Ok(self.png.clone())
        })
    }
}
