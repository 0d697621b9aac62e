//! rtiview - streams the tile pyramid of one multiresolution RTI object.
//!
//! Usage: cargo run --release -- <CONFIG> [OPTIONS]
//!
//! Options:
//!   --mode <MODE>       `stream` (view-driven, default) or `preload` (every tile)
//!   --root <DIR>        Directory relative tile URLs resolve against
//!                       (default: the config file's directory)
//!   --prefix <PREFIX>   Override the URL prefix from the config
//!   --width <PX>        Viewport width (default: 1280)
//!   --height <PX>       Viewport height (default: 720)
//!   --distance <D>      Camera distance from the surface (default: 1.5)
//!   --fov <DEG>         Vertical field of view (default: 45)

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use glam::{Vec2, Vec3};

use rtiview::core::{logging, Camera, Error, Result};
use rtiview::multires::DeviceCaps;
use rtiview::streaming::{PreloadStatus, TileScheduler, UrlFetcher, ViewerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<()> {
    let config_path = args
        .get(1)
        .filter(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config("usage: rtiview <CONFIG> [--mode stream|preload] [OPTIONS]".into()))?;

    let mode = parse_str_arg(args, "--mode").unwrap_or_else(|| "stream".to_string());
    let width = parse_f32_arg(args, "--width").unwrap_or(1280.0);
    let height = parse_f32_arg(args, "--height").unwrap_or(720.0);
    let distance = parse_f32_arg(args, "--distance").unwrap_or(1.5);
    let fov = parse_f32_arg(args, "--fov").unwrap_or(45.0);
    let root = parse_str_arg(args, "--root")
        .map(PathBuf::from)
        .unwrap_or_else(|| config_path.parent().map(Path::to_path_buf).unwrap_or_default());

    let mut config = ViewerConfig::load(&config_path)?;
    if let Some(prefix) = parse_str_arg(args, "--prefix") {
        config.texture_access.prefix = Some(prefix);
    }

    println!("=== rtiview ===");
    println!("Config:   {}", config_path.display());
    println!("Levels:   {}", config.num_levels()?);
    println!("Layers:   {}", config.texture_access.urls.len());
    println!("Viewport: {}x{}", width, height);
    println!();

    let fetcher = Arc::new(UrlFetcher::new(root)?);
    let mut scheduler = TileScheduler::from_config_with_current_runtime(&config, fetcher, &DeviceCaps::default())?;

    let start = Instant::now();
    match mode.as_str() {
        "stream" => {
            let camera = Camera::new(Vec3::new(0.0, 0.0, distance), fov, width / height);
            stream(&mut scheduler, &camera, Vec2::new(width, height)).await;
        }
        "preload" => preload(&mut scheduler).await,
        other => return Err(Error::Config(format!("unknown mode {other:?} (expected stream or preload)"))),
    }

    print_summary(&scheduler);
    println!("Elapsed: {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Drive the incremental scheduling loop until the required level is on screen
async fn stream(scheduler: &mut TileScheduler, camera: &Camera, viewport: Vec2) {
    let required = scheduler.required_level(camera, viewport);
    println!("Required level: {}", required);

    while let Some(level) = scheduler.request_multires_texture_data(camera, viewport) {
        // Nothing new was dispatched, so only failed tiles stand in the way
        if scheduler.stats().in_flight == 0 {
            log::warn!("Level {} cannot be completed; failed tiles are not retried", level);
            break;
        }
        while scheduler.settle_next().await.is_some() {}

        if let Some(selection) = scheduler.select_render_level(camera, viewport) {
            println!("  rendering level {} ({} tiles)", selection.level, selection.tiles.len());
        }
    }
}

/// Request every tile and wait for the completion callback
async fn preload(scheduler: &mut TileScheduler) {
    let done = Rc::new(Cell::new(false));
    let done_cb = Rc::clone(&done);

    match scheduler.request_all_texture_data(move || done_cb.set(true)) {
        PreloadStatus::Started => {
            let mut settled = 0usize;
            while scheduler.settle_next().await.is_some() {
                settled += 1;
                if settled % 64 == 0 {
                    println!("  {} tiles settled", settled);
                }
            }
        }
        PreloadStatus::Completed => println!("Nothing to fetch"),
        PreloadStatus::Rejected => log::warn!("Preload already running"),
    }

    if done.get() {
        println!("Preload complete");
    }
}

fn print_summary(scheduler: &TileScheduler) {
    let stats = scheduler.stats();
    println!();
    println!("Level  settled/total  content");
    for level in &stats.levels {
        println!("{:>5}  {:>7}/{:<5}  {:>7}", level.level, level.settled, level.total, level.content_tiles);
    }
    println!("Settled levels: {}/{}", stats.settled_levels, stats.levels.len());
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
