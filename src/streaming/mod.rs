//! Tile streaming: configuration, addressing, fetching and scheduling

pub mod config;
pub mod addressing;
pub mod fetch;
pub mod request;
pub mod loader;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ViewerConfig;
pub use addressing::{IndexType, TileAddressing};
pub use fetch::{FetchError, FileFetcher, HttpFetcher, TileFetcher, UrlFetcher};
pub use request::{LayerError, LayerImage, RetryPolicy};
pub use loader::{TileLoader, TileRequest, TileResponse};
pub use scheduler::{PreloadStatus, RenderSelection, RequestMode, SchedulerStats, TileScheduler};
