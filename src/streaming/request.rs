//! Layer-stack request for a single tile
//!
//! A tile is made of one image per data layer. All layers are fetched
//! concurrently; each one retries independently under a [`RetryPolicy`].
//! The stack settles once every layer has either decoded or exhausted its
//! attempts.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;

use crate::streaming::fetch::{FetchError, TileFetcher};

/// Bounded retry with a fixed delay between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before each retry
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// First attempt plus retries
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 4, delay: Duration::from_millis(250) }
    }
}

/// One decoded data layer of a tile
#[derive(Clone, Debug)]
pub struct LayerImage {
    /// Layer index, matching the order of the configured base URLs
    pub layer: usize,
    pub url: String,
    pub image: image::DynamicImage,
}

/// A layer that could not be fetched within the retry budget
#[derive(Debug, Error)]
#[error("layer {layer} ({url}) failed after {attempts} attempts: {source}")]
pub struct LayerError {
    pub layer: usize,
    pub url: String,
    pub attempts: u32,
    #[source]
    pub source: FetchError,
}

/// Settled result of a layer-stack request
#[derive(Debug, Default)]
pub struct LayerStack {
    /// Decoded layers by index; `None` where the layer failed
    pub layers: Vec<Option<LayerImage>>,
    pub errors: Vec<LayerError>,
}

impl LayerStack {
    /// Every layer decoded
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.layers.iter().all(Option::is_some)
    }
}

/// Fetch and decode every layer of a tile concurrently
pub async fn fetch_layer_stack(
    fetcher: Arc<dyn TileFetcher>,
    urls: Vec<String>,
    policy: RetryPolicy,
) -> LayerStack {
    let mut stack = LayerStack {
        layers: (0..urls.len()).map(|_| None).collect(),
        errors: Vec::new(),
    };

    let mut tasks = JoinSet::new();
    for (layer, url) in urls.iter().cloned().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        tasks.spawn(async move { fetch_layer(fetcher, layer, url, policy).await });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(image)) => {
                let layer = image.layer;
                stack.layers[layer] = Some(image);
            }
            Ok(Err(error)) => stack.errors.push(error),
            Err(e) => log::error!("Layer fetch task panicked: {}", e),
        }
    }

    // Layers lost to a panicked task are reported as failures too
    for (layer, url) in urls.into_iter().enumerate() {
        let reported = stack.errors.iter().any(|e| e.layer == layer);
        if stack.layers[layer].is_none() && !reported {
            stack.errors.push(LayerError {
                layer,
                url,
                attempts: 0,
                source: FetchError::Other("layer task aborted".into()),
            });
        }
    }
    stack.errors.sort_by_key(|e| e.layer);

    stack
}

/// Fetch one layer, retrying failed fetches and undecodable payloads
async fn fetch_layer(
    fetcher: Arc<dyn TileFetcher>,
    layer: usize,
    url: String,
    policy: RetryPolicy,
) -> Result<LayerImage, LayerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let outcome = match fetcher.fetch(&url).await {
            Ok(bytes) => image::load_from_memory(&bytes)
                .map_err(|source| FetchError::Decode { url: url.clone(), source }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(image) => {
                log::debug!("Loaded layer {} from {}", layer, url);
                return Ok(LayerImage { layer, url, image });
            }
            Err(e) if attempt <= policy.max_retries => {
                log::warn!(
                    "Unable to load {} (attempt {}/{}): {}. Trying again...",
                    url, attempt, policy.max_attempts(), e
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(source) => {
                log::error!("Unable to load {}: {}", url, source);
                return Err(LayerError { layer, url, attempts: attempt, source });
            }
        }
    }
}
