//! Tile scheduler
//!
//! Decides which tiles to fetch for the current view, tracks their load
//! state and reports the best level that is ready to render. The scheduler
//! is the only writer of tile load state: the loader works on its own
//! runtime and hands back responses, which are applied here in
//! [`TileScheduler::poll`] or [`TileScheduler::settle_next`].
//!
//! Request modes:
//! - `Incremental`: request the visible tiles of one level above the best
//!   available level, climbing toward the required level one step per settle
//! - `Direct`: request the visible tiles of the required level immediately

use std::str::FromStr;
use std::sync::Arc;

use crate::core::camera::Camera;
use crate::core::error::Error;
use crate::core::types::{Result, Vec2, Vec3};
use crate::multires::geometry::{create_visibility_helper, VisibilityHelper};
use crate::multires::texture_settings::DeviceCaps;
use crate::multires::tree::{LoadState, MultiresTree, TileId};
use crate::streaming::addressing::TileAddressing;
use crate::streaming::config::ViewerConfig;
use crate::streaming::fetch::TileFetcher;
use crate::streaming::loader::{TileLoader, TileRequest, TileResponse};
use crate::streaming::request::LayerImage;

/// How the scheduler approaches the required level
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestMode {
    #[default]
    Incremental,
    Direct,
}

impl FromStr for RequestMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INCREMENTAL" => Ok(Self::Incremental),
            "DIRECT" => Ok(Self::Direct),
            other => Err(Error::UnknownRequestMode(other.to_string())),
        }
    }
}

/// Invoked once per tile that becomes loaded, with its layers in order
pub type TileReadyCallback = Box<dyn FnMut(TileId, Vec<LayerImage>)>;

/// Outcome of [`TileScheduler::request_all_texture_data`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreloadStatus {
    /// Requests dispatched; the callback fires once every level settles
    Started,
    /// Everything was already settled; the callback has been invoked
    Completed,
    /// Another bulk preload is still in flight; the callback was dropped
    Rejected,
}

/// Level and tiles the renderer should display
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderSelection {
    pub level: u32,
    pub tiles: Vec<TileId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelStats {
    pub level: u32,
    /// Settled tiles, content-less tiles included
    pub settled: u32,
    pub total: u32,
    pub content_tiles: u32,
}

#[derive(Clone, Debug)]
pub struct SchedulerStats {
    pub levels: Vec<LevelStats>,
    /// Tiles currently `Pending`
    pub pending_tiles: usize,
    /// Responses the loader still owes, stale ones included
    pub in_flight: usize,
    pub settled_levels: u32,
    pub epoch: u64,
}

/// Multiresolution tile scheduler for one RTI object
pub struct TileScheduler {
    tree: MultiresTree,
    helper: Box<dyn VisibilityHelper>,
    addressing: TileAddressing,
    loader: TileLoader,
    mode: RequestMode,
    /// Bumped by `reset`; responses from older epochs are ignored
    epoch: u64,
    /// Last computed required level, reused when sampling fails
    required_level: u32,
    /// Level last handed to the renderer
    active_level: Option<u32>,
    on_tile_ready: Option<TileReadyCallback>,
    /// Levels whose every tile has settled
    settled_levels: u32,
    bulk_started: bool,
    bulk_callback: Option<Box<dyn FnOnce()>>,
    sampling_failed: bool,
}

impl TileScheduler {
    pub fn new(
        tree: MultiresTree,
        helper: Box<dyn VisibilityHelper>,
        addressing: TileAddressing,
        loader: TileLoader,
        mode: RequestMode,
    ) -> Self {
        let settled_levels = count_settled_levels(&tree);
        Self {
            tree,
            helper,
            addressing,
            loader,
            mode,
            epoch: 0,
            required_level: 0,
            active_level: None,
            on_tile_ready: None,
            settled_levels,
            bulk_started: false,
            bulk_callback: None,
            sampling_failed: false,
        }
    }

    /// Build from a config, with the loader on its own runtime
    pub fn from_config(config: &ViewerConfig, fetcher: Arc<dyn TileFetcher>, caps: &DeviceCaps) -> Result<Self> {
        let loader = TileLoader::new(fetcher, config.max_concurrent(), config.retry_policy())?;
        Self::with_loader(config, caps, loader)
    }

    /// Build from a config, with the loader on the current tokio runtime
    pub fn from_config_with_current_runtime(
        config: &ViewerConfig,
        fetcher: Arc<dyn TileFetcher>,
        caps: &DeviceCaps,
    ) -> Result<Self> {
        let loader = TileLoader::new_with_current_runtime(fetcher, config.max_concurrent(), config.retry_policy());
        Self::with_loader(config, caps, loader)
    }

    fn with_loader(config: &ViewerConfig, caps: &DeviceCaps, loader: TileLoader) -> Result<Self> {
        config.validate()?;

        let settings = config.build_texture_settings(caps);
        let mut tree = MultiresTree::new(&settings, config.num_levels()?)?;
        let helper = create_visibility_helper(config.geometry_kind()?, config.build_mesh()?, &settings, &mut tree)?;
        let addressing = TileAddressing::new(
            config.index_type()?,
            config.texture_access.urls.clone(),
            config.texture_access.prefix.clone(),
            config.texture_access.suffix.clone(),
            &tree,
        );

        Ok(Self::new(tree, helper, addressing, loader, config.request_mode()?))
    }

    pub fn tree(&self) -> &MultiresTree {
        &self.tree
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RequestMode) {
        self.mode = mode;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Level last returned by [`select_render_level`](Self::select_render_level)
    pub fn active_level(&self) -> Option<u32> {
        self.active_level
    }

    /// Change the path prefix used for tiles requested from now on
    pub fn set_url_prefix(&mut self, prefix: Option<String>) {
        self.addressing.set_prefix(prefix);
    }

    pub fn set_on_tile_ready(&mut self, callback: impl FnMut(TileId, Vec<LayerImage>) + 'static) {
        self.on_tile_ready = Some(Box::new(callback));
    }

    /// Replace the surface vertex positions; bounds are rebuilt before the next visibility query.
    ///
    /// Fails with [`Error::Geometry`] if the vertex count differs from the mesh's.
    pub fn update_mesh_positions(&mut self, positions: Vec<Vec3>) -> Result<()> {
        self.helper.mesh_mut().set_positions(positions)
    }

    fn refresh_bounds(&mut self) {
        if self.helper.bounds_outdated() {
            log::trace!("Rebuilding tile bounds after mesh deformation");
            self.helper.update_bounds(&mut self.tree);
        }
    }

    /// Smallest level whose resolution covers the on-screen demand.
    ///
    /// When no sample triangle can be measured the previous required level
    /// is kept (0 before the first successful measurement).
    pub fn required_level(&mut self, camera: &Camera, viewport: Vec2) -> u32 {
        match self.helper.required_resolution(camera, viewport) {
            Some(resolution) => {
                self.sampling_failed = false;
                self.required_level = self.tree.level_for_resolution(resolution);
            }
            None => {
                if !self.sampling_failed {
                    log::error!(
                        "Unable to sample required resolution; keeping level {}",
                        self.required_level
                    );
                    self.sampling_failed = true;
                }
            }
        }
        self.required_level
    }

    /// Content tiles of `level` visible from `camera`
    pub fn visible_tiles(&mut self, camera: &Camera, level: u32) -> Vec<TileId> {
        self.refresh_bounds();
        self.helper.visible_tiles(&self.tree, camera, level)
    }

    /// Per-frame scheduling step. Returns the level whose visible tiles
    /// were requested, or `None` when the required level is already available.
    pub fn request_multires_texture_data(&mut self, camera: &Camera, viewport: Vec2) -> Option<u32> {
        self.refresh_bounds();
        let required = self.required_level(camera, viewport);

        let available = self.find_available(required, camera).map(|(level, _)| level);
        if available.is_some_and(|level| level >= required) {
            return None;
        }
        let level = match self.mode {
            RequestMode::Direct => required,
            RequestMode::Incremental => available.map_or(0, |level| level + 1),
        };

        let visible = self.helper.visible_tiles(&self.tree, camera, level);
        let dispatched = visible.iter().filter(|&&id| self.request_tile(id)).count();
        if dispatched > 0 {
            log::debug!(
                "Requested {} of {} visible tiles at level {} (required {})",
                dispatched, visible.len(), level, required
            );
        }
        Some(level)
    }

    /// Finest level at or below `required` whose visible tiles are all loaded
    fn find_available(&self, required: u32, camera: &Camera) -> Option<(u32, Vec<TileId>)> {
        (0..=required).rev().find_map(|level| {
            let visible = self.helper.visible_tiles(&self.tree, camera, level);
            let ready = !visible.is_empty()
                && visible.iter().all(|&id| {
                    self.tree.tile(id).is_some_and(|t| t.load_state == LoadState::Loaded)
                });
            ready.then_some((level, visible))
        })
    }

    /// Best renderable level and its visible tiles, if any
    pub fn available_tiles(&mut self, camera: &Camera, viewport: Vec2) -> Option<(u32, Vec<TileId>)> {
        self.refresh_bounds();
        let required = self.required_level(camera, viewport);
        self.find_available(required, camera)
    }

    /// Best renderable level; `None` when nothing visible is loaded yet
    pub fn available_level(&mut self, camera: &Camera, viewport: Vec2) -> Option<u32> {
        self.available_tiles(camera, viewport).map(|(level, _)| level)
    }

    /// Pick the level to render and remember it as the active level
    pub fn select_render_level(&mut self, camera: &Camera, viewport: Vec2) -> Option<RenderSelection> {
        let selection = self
            .available_tiles(camera, viewport)
            .map(|(level, tiles)| RenderSelection { level, tiles });

        let level = selection.as_ref().map(|s| s.level);
        if level != self.active_level {
            log::info!("Active level changed: {:?} -> {:?}", self.active_level, level);
            self.active_level = level;
        }
        selection
    }

    /// Dispatch a fetch for one tile. No-op (returns `false`) unless the tile
    /// has content and has never been requested.
    pub fn request_tile(&mut self, id: TileId) -> bool {
        let Some(num_tiles) = self.tree.level(id.level).map(|l| l.num_tiles) else {
            return false;
        };
        match self.tree.tile_mut(id) {
            Some(tile) if tile.has_content && tile.load_state == LoadState::Unrequested => {
                tile.load_state = LoadState::Pending;
            }
            _ => return false,
        }

        let urls = self.addressing.urls(id, num_tiles);
        log::trace!("Requesting tile {}", id);

        if !self.loader.request(TileRequest { id, urls, epoch: self.epoch }) {
            log::error!("Tile {} could not be dispatched", id);
            self.mark_settled(id, LoadState::Failed);
        }
        true
    }

    /// Request every tile of one level; returns the number dispatched
    pub fn request_texture_level(&mut self, level: u32) -> usize {
        let ids: Vec<TileId> = match self.tree.level(level) {
            Some(l) => l.content_tiles().map(|t| t.id).collect(),
            None => return 0,
        };
        ids.into_iter().filter(|&id| self.request_tile(id)).count()
    }

    /// Request the coarsest level
    pub fn request_texture_data(&mut self) -> usize {
        self.request_texture_level(0)
    }

    /// Request every tile of every level. `on_complete` fires once, after
    /// every level has settled.
    pub fn request_all_texture_data(&mut self, on_complete: impl FnOnce() + 'static) -> PreloadStatus {
        if self.bulk_started {
            if self.all_levels_settled() {
                on_complete();
                return PreloadStatus::Completed;
            }
            log::warn!("Bulk preload already in progress; ignoring concurrent request");
            return PreloadStatus::Rejected;
        }
        self.bulk_started = true;

        if self.all_levels_settled() {
            on_complete();
            return PreloadStatus::Completed;
        }

        self.bulk_callback = Some(Box::new(on_complete));
        let dispatched: usize = (0..self.tree.num_levels())
            .map(|level| self.request_texture_level(level))
            .sum();
        log::info!("Bulk preload: requested {} tiles", dispatched);

        // A dispatch failure may already have settled the last level
        if self.all_levels_settled() {
            if let Some(callback) = self.bulk_callback.take() {
                callback();
                return PreloadStatus::Completed;
            }
        }
        PreloadStatus::Started
    }

    fn all_levels_settled(&self) -> bool {
        self.settled_levels == self.tree.num_levels()
    }

    /// Apply every response available right now; returns how many tiles settled
    pub fn poll(&mut self) -> usize {
        let responses = self.loader.poll_results();
        responses
            .into_iter()
            .filter_map(|response| self.apply_response(response))
            .count()
    }

    /// Wait until one more tile settles. Returns `None` when nothing is in flight.
    pub async fn settle_next(&mut self) -> Option<TileId> {
        loop {
            let response = self.loader.next_result().await?;
            if let Some(id) = self.apply_response(response) {
                return Some(id);
            }
        }
    }

    fn apply_response(&mut self, response: TileResponse) -> Option<TileId> {
        let id = response.id;
        if response.epoch != self.epoch {
            log::debug!("Ignoring response for tile {} from epoch {}", id, response.epoch);
            return None;
        }
        if self.tree.tile(id).map(|t| t.load_state) != Some(LoadState::Pending) {
            log::warn!("Ignoring response for tile {} that is not pending", id);
            return None;
        }

        if response.is_failed() {
            for error in &response.errors {
                log::debug!("Tile {}: {}", id, error);
            }
            log::error!("Response error, {}", id);
            self.mark_settled(id, LoadState::Failed);
        } else {
            log::info!("Response success, {}", id);
            self.mark_settled(id, LoadState::Loaded);
            let layers: Vec<LayerImage> = response.layers.into_iter().flatten().collect();
            if let Some(callback) = self.on_tile_ready.as_mut() {
                callback(id, layers);
            }
        }
        Some(id)
    }

    fn mark_settled(&mut self, id: TileId, state: LoadState) {
        if let Some(tile) = self.tree.tile_mut(id) {
            tile.load_state = state;
        }
        let completed = self
            .tree
            .level_mut(id.level)
            .is_some_and(|level| level.record_settled());
        if !completed {
            return;
        }

        self.settled_levels += 1;
        log::info!("Level {} settled ({}/{})", id.level, self.settled_levels, self.tree.num_levels());
        if self.all_levels_settled() {
            if let Some(callback) = self.bulk_callback.take() {
                log::info!("Bulk preload complete");
                callback();
            }
        }
    }

    /// Forget every tile's load state, e.g. after the renderer lost its textures.
    ///
    /// Responses still in flight are ignored when they arrive, and an
    /// unfinished bulk preload is abandoned without invoking its callback.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.tree.reset();
        self.settled_levels = count_settled_levels(&self.tree);
        self.active_level = None;
        self.bulk_started = false;
        if self.bulk_callback.take().is_some() {
            log::warn!("Bulk preload abandoned by reset");
        }
        log::info!("Tile states reset (epoch {})", self.epoch);
    }

    pub fn stats(&self) -> SchedulerStats {
        let levels = self
            .tree
            .levels()
            .iter()
            .map(|level| LevelStats {
                level: level.index,
                settled: level.loaded_tiles(),
                total: level.total_tiles(),
                content_tiles: level.content_tiles().count() as u32,
            })
            .collect();
        let pending_tiles = self
            .tree
            .levels()
            .iter()
            .flat_map(|level| level.tiles())
            .filter(|tile| tile.load_state == LoadState::Pending)
            .count();

        SchedulerStats {
            levels,
            pending_tiles,
            in_flight: self.loader.in_flight(),
            settled_levels: self.settled_levels,
            epoch: self.epoch,
        }
    }
}

fn count_settled_levels(tree: &MultiresTree) -> u32 {
    tree.levels().iter().filter(|level| level.is_settled()).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    use crate::core::types::UVec2;
    use crate::mesh::SurfaceMesh;
    use crate::multires::geometry::GeometryKind;
    use crate::multires::texture_settings::TextureSettings;
    use crate::streaming::addressing::IndexType;
    use crate::streaming::request::RetryPolicy;
    use crate::streaming::test_support::ScriptedFetcher;

    const ROOT: TileId = TileId { level: 0, x: 0, y: 0 };

    fn full_settings() -> TextureSettings {
        TextureSettings::new(Vec2::splat(1024.0), Vec2::splat(1024.0))
    }

    fn build(settings: &TextureSettings, fetcher: Arc<ScriptedFetcher>, mode: RequestMode) -> TileScheduler {
        let mut tree = MultiresTree::new(settings, 3).unwrap();
        let mesh = SurfaceMesh::plane(Vec2::splat(2.0), UVec2::splat(4), Vec3::ZERO);
        let helper = create_visibility_helper(GeometryKind::TileAlignedGrid, mesh, settings, &mut tree).unwrap();
        let addressing = TileAddressing::new(
            IndexType::SlippyMap,
            vec!["a/".into(), "b/".into()],
            None,
            "png",
            &tree,
        );
        let loader = TileLoader::new_with_current_runtime(fetcher, 4, RetryPolicy::new(4, Duration::from_millis(1)));
        TileScheduler::new(tree, helper, addressing, loader, mode)
    }

    fn scheduler(fetcher: Arc<ScriptedFetcher>, mode: RequestMode) -> TileScheduler {
        build(&full_settings(), fetcher, mode)
    }

    /// Sees the whole plane; level 0, 1 and 2 are 256, 512 and 1024 px wide
    fn camera() -> Camera {
        Camera::orthographic(Vec3::new(0.0, 0.0, 5.0), 1.0, 1.0)
    }

    const FINEST_VIEWPORT: Vec2 = Vec2::splat(1024.0);
    const MIDDLE_VIEWPORT: Vec2 = Vec2::splat(400.0);

    async fn settle_all(scheduler: &mut TileScheduler) -> usize {
        let mut settled = 0;
        while scheduler.settle_next().await.is_some() {
            settled += 1;
        }
        settled
    }

    fn state(scheduler: &TileScheduler, id: TileId) -> LoadState {
        scheduler.tree().tile(id).unwrap().load_state
    }

    fn level_states(scheduler: &TileScheduler, level: u32) -> Vec<LoadState> {
        scheduler.tree().level(level).unwrap().tiles().map(|t| t.load_state).collect()
    }

    #[test]
    fn test_parse_request_mode() {
        assert_eq!("DIRECT".parse::<RequestMode>().unwrap(), RequestMode::Direct);
        assert!(matches!("LAZY".parse::<RequestMode>(), Err(Error::UnknownRequestMode(_))));
    }

    #[tokio::test]
    async fn test_required_level() {
        let mut s = scheduler(Arc::new(ScriptedFetcher::new()), RequestMode::Incremental);
        assert_eq!(s.required_level(&camera(), Vec2::splat(100.0)), 0);
        assert_eq!(s.required_level(&camera(), MIDDLE_VIEWPORT), 1);
        assert_eq!(s.required_level(&camera(), FINEST_VIEWPORT), 2);
        // Beyond the finest level clamps to it
        assert_eq!(s.required_level(&camera(), Vec2::splat(8000.0)), 2);
    }

    #[tokio::test]
    async fn test_request_is_idempotent() {
        let (fetcher, gate) = ScriptedFetcher::gated();
        let fetcher = Arc::new(fetcher);
        let mut s = scheduler(fetcher.clone(), RequestMode::Incremental);

        assert!(s.request_tile(ROOT));
        assert!(!s.request_tile(ROOT));
        assert_eq!(s.request_multires_texture_data(&camera(), FINEST_VIEWPORT), Some(0));
        assert_eq!(state(&s, ROOT), LoadState::Pending);
        assert_eq!(s.stats().in_flight, 1);

        gate.add_permits(2);
        assert_eq!(s.settle_next().await, Some(ROOT));
        assert_eq!(state(&s, ROOT), LoadState::Loaded);
        assert!(!s.request_tile(ROOT));

        assert_eq!(fetcher.calls("a/0/0/0.png"), 1);
        assert_eq!(fetcher.calls("b/0/0/0.png"), 1);
    }

    #[tokio::test]
    async fn test_incremental_advances_one_level_at_a_time() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let mut s = scheduler(fetcher.clone(), RequestMode::Incremental);
        let (cam, viewport) = (camera(), FINEST_VIEWPORT);

        assert_eq!(s.request_multires_texture_data(&cam, viewport), Some(0));
        // Nothing settled yet: the next pass stays on level 0
        assert_eq!(s.request_multires_texture_data(&cam, viewport), Some(0));
        assert!(level_states(&s, 1).iter().all(|&st| st == LoadState::Unrequested));
        settle_all(&mut s).await;

        assert_eq!(s.request_multires_texture_data(&cam, viewport), Some(1));
        assert_eq!(s.request_multires_texture_data(&cam, viewport), Some(1));
        assert!(level_states(&s, 1).iter().all(|&st| st == LoadState::Pending));
        assert!(level_states(&s, 2).iter().all(|&st| st == LoadState::Unrequested));
        settle_all(&mut s).await;

        assert_eq!(s.request_multires_texture_data(&cam, viewport), Some(2));
        settle_all(&mut s).await;

        // Required level reached: nothing left to request
        assert_eq!(s.request_multires_texture_data(&cam, viewport), None);
        assert_eq!(fetcher.total_calls(), 2 * (1 + 4 + 16));
    }

    #[tokio::test]
    async fn test_direct_mode_requests_required_level() {
        let mut s = scheduler(Arc::new(ScriptedFetcher::new()), RequestMode::Direct);

        assert_eq!(s.request_multires_texture_data(&camera(), FINEST_VIEWPORT), Some(2));
        assert!(level_states(&s, 2).iter().all(|&st| st == LoadState::Pending));
        assert_eq!(state(&s, ROOT), LoadState::Unrequested);

        assert_eq!(settle_all(&mut s).await, 16);
        assert_eq!(s.available_level(&camera(), FINEST_VIEWPORT), Some(2));

        // Required level ready: nothing left to request
        assert_eq!(s.request_multires_texture_data(&camera(), FINEST_VIEWPORT), None);
        assert_eq!(s.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_available_level_progression() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let mut s = scheduler(fetcher, RequestMode::Incremental);
        let (cam, viewport) = (camera(), FINEST_VIEWPORT);

        let ready = Rc::new(RefCell::new(Vec::new()));
        let ready_cb = Rc::clone(&ready);
        s.set_on_tile_ready(move |id, layers| ready_cb.borrow_mut().push((id, layers.len())));

        assert_eq!(s.available_level(&cam, viewport), None);

        let mut progression = Vec::new();
        while s.request_multires_texture_data(&cam, viewport).is_some() {
            settle_all(&mut s).await;
            let available = s.available_level(&cam, viewport).unwrap();
            if let Some(&last) = progression.last() {
                assert!(available >= last, "available level regressed");
            }
            progression.push(available);
        }

        assert_eq!(progression, vec![0, 1, 2]);
        let ready = ready.borrow();
        assert_eq!(ready.len(), 1 + 4 + 16);
        assert!(ready.iter().all(|&(_, layers)| layers == 2));
        assert_eq!(ready.iter().filter(|(id, _)| *id == ROOT).count(), 1);
    }

    #[tokio::test]
    async fn test_layer_failing_five_times_fails_tile() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.fail_times("b/0/0/0.png", 5);
        let mut s = scheduler(fetcher.clone(), RequestMode::Incremental);

        let ready = Rc::new(Cell::new(0));
        let ready_cb = Rc::clone(&ready);
        s.set_on_tile_ready(move |_, _| ready_cb.set(ready_cb.get() + 1));

        s.request_multires_texture_data(&camera(), FINEST_VIEWPORT);
        settle_all(&mut s).await;

        assert_eq!(state(&s, ROOT), LoadState::Failed);
        assert_eq!(fetcher.calls("b/0/0/0.png"), 5);
        assert_eq!(ready.get(), 0);

        // Settled for counting, never renderable, never retried
        assert!(s.tree().level(0).unwrap().is_settled());
        assert_eq!(s.available_level(&camera(), FINEST_VIEWPORT), None);
        assert_eq!(s.request_multires_texture_data(&camera(), FINEST_VIEWPORT), Some(0));
        assert_eq!(s.stats().in_flight, 0);
        assert_eq!(fetcher.calls("b/0/0/0.png"), 5);
        assert!(level_states(&s, 1).iter().all(|&st| st == LoadState::Unrequested));
    }

    #[tokio::test]
    async fn test_layer_failing_four_times_still_loads() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.fail_times("b/0/0/0.png", 4);
        let mut s = scheduler(fetcher.clone(), RequestMode::Incremental);

        s.request_multires_texture_data(&camera(), FINEST_VIEWPORT);
        settle_all(&mut s).await;

        assert_eq!(state(&s, ROOT), LoadState::Loaded);
        assert_eq!(fetcher.calls("b/0/0/0.png"), 5);
        assert_eq!(s.available_level(&camera(), FINEST_VIEWPORT), Some(0));
    }

    #[tokio::test]
    async fn test_bulk_preload_completes_once() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        // One finest tile fails; the preload still completes
        fetcher.fail_times("a/2/3/0.png", u32::MAX);
        let mut s = scheduler(fetcher, RequestMode::Incremental);

        let fired = Rc::new(Cell::new(0));
        let first = Rc::clone(&fired);
        assert_eq!(s.request_all_texture_data(move || first.set(first.get() + 1)), PreloadStatus::Started);

        let rejected = Rc::new(Cell::new(false));
        let second = Rc::clone(&rejected);
        assert_eq!(s.request_all_texture_data(move || second.set(true)), PreloadStatus::Rejected);

        let mut settled = 0;
        while s.settle_next().await.is_some() {
            settled += 1;
            if settled < 21 {
                assert_eq!(fired.get(), 0, "fired before every level settled");
            }
        }
        assert_eq!(settled, 21);
        assert_eq!(fired.get(), 1);
        assert!(!rejected.get());
        assert_eq!(state(&s, TileId::new(2, 3, 3)), LoadState::Failed);

        // Asking again after completion answers immediately
        let third = Rc::clone(&fired);
        assert_eq!(s.request_all_texture_data(move || third.set(third.get() + 1)), PreloadStatus::Completed);
        assert_eq!(fired.get(), 2);
    }

    #[tokio::test]
    async fn test_bulk_preload_without_content_completes_immediately() {
        let empty = TextureSettings::with_content_limits(Vec2::splat(1024.0), Vec2::new(2.0, 3.0), Vec2::new(2.0, 3.0));
        let fetcher = Arc::new(ScriptedFetcher::new());
        let mut s = build(&empty, fetcher.clone(), RequestMode::Incremental);

        let fired = Rc::new(Cell::new(false));
        let cb = Rc::clone(&fired);
        assert_eq!(s.request_all_texture_data(move || cb.set(true)), PreloadStatus::Completed);
        assert!(fired.get());
        assert_eq!(fetcher.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_content_less_tiles_never_fetched() {
        let left_quarter = TextureSettings::with_content_limits(Vec2::splat(1024.0), Vec2::new(0.0, 0.2), Vec2::new(0.0, 1.0));
        let fetcher = Arc::new(ScriptedFetcher::new());
        let mut s = build(&left_quarter, fetcher.clone(), RequestMode::Incremental);

        assert_eq!(s.request_texture_level(2), 4);
        assert_eq!(settle_all(&mut s).await, 4);
        assert!(s.tree().level(2).unwrap().is_settled());
        assert_eq!(fetcher.total_calls(), 8);

        let stats = s.stats();
        assert_eq!(stats.levels[2], LevelStats { level: 2, settled: 16, total: 16, content_tiles: 4 });
    }

    #[tokio::test]
    async fn test_reset_ignores_stale_responses() {
        let (fetcher, gate) = ScriptedFetcher::gated();
        let mut s = scheduler(Arc::new(fetcher), RequestMode::Incremental);

        assert_eq!(s.request_texture_data(), 1);
        s.reset();
        assert_eq!(s.epoch(), 1);
        assert_eq!(state(&s, ROOT), LoadState::Unrequested);

        gate.add_permits(2);
        // The only response belongs to the old epoch
        assert_eq!(s.settle_next().await, None);
        assert_eq!(state(&s, ROOT), LoadState::Unrequested);
        assert_eq!(s.tree().level(0).unwrap().loaded_tiles(), 0);

        gate.add_permits(2);
        assert_eq!(s.request_texture_data(), 1);
        assert_eq!(s.settle_next().await, Some(ROOT));
        assert_eq!(state(&s, ROOT), LoadState::Loaded);
    }

    #[tokio::test]
    async fn test_reset_abandons_bulk_preload() {
        let mut s = scheduler(Arc::new(ScriptedFetcher::new()), RequestMode::Incremental);

        let fired = Rc::new(Cell::new(false));
        let cb = Rc::clone(&fired);
        assert_eq!(s.request_all_texture_data(move || cb.set(true)), PreloadStatus::Started);
        s.reset();
        settle_all(&mut s).await;
        assert!(!fired.get());

        // A new preload may start after the reset
        assert_eq!(s.request_all_texture_data(|| {}), PreloadStatus::Started);
    }

    #[tokio::test]
    async fn test_select_render_level_tracks_active_level() {
        let mut s = scheduler(Arc::new(ScriptedFetcher::new()), RequestMode::Incremental);
        assert_eq!(s.select_render_level(&camera(), FINEST_VIEWPORT), None);

        s.request_texture_data();
        settle_all(&mut s).await;

        let selection = s.select_render_level(&camera(), FINEST_VIEWPORT).unwrap();
        assert_eq!(selection, RenderSelection { level: 0, tiles: vec![ROOT] });
        assert_eq!(s.active_level(), Some(0));

        // Only level 1 needed and nothing finer loaded: still level 0
        assert_eq!(s.select_render_level(&camera(), MIDDLE_VIEWPORT).map(|r| r.level), Some(0));
    }

    #[tokio::test]
    async fn test_deformed_mesh_rebuilds_visibility() {
        let mut s = scheduler(Arc::new(ScriptedFetcher::new()), RequestMode::Incremental);
        assert_eq!(s.visible_tiles(&camera(), 1).len(), 4);

        let shifted = SurfaceMesh::plane(Vec2::splat(2.0), UVec2::splat(4), Vec3::new(100.0, 0.0, 0.0));
        s.update_mesh_positions(shifted.positions).unwrap();
        assert!(s.visible_tiles(&camera(), 1).is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_mesh_positions_are_rejected() {
        let mut s = scheduler(Arc::new(ScriptedFetcher::new()), RequestMode::Incremental);

        let result = s.update_mesh_positions(vec![Vec3::ZERO; 3]);
        assert!(matches!(result, Err(Error::Geometry(_))));

        // The mesh is untouched, so visibility and sampling keep working
        assert_eq!(s.visible_tiles(&camera(), 1).len(), 4);
        assert_eq!(s.required_level(&camera(), FINEST_VIEWPORT), 2);
    }

    struct ScriptedHelper {
        resolution: Rc<Cell<Option<Vec2>>>,
        mesh: SurfaceMesh,
    }

    impl VisibilityHelper for ScriptedHelper {
        fn required_resolution(&self, _camera: &Camera, _viewport: Vec2) -> Option<Vec2> {
            self.resolution.get()
        }

        fn visible_tiles(&self, tree: &MultiresTree, _camera: &Camera, level: u32) -> Vec<TileId> {
            tree.level(level)
                .map(|l| l.content_tiles().map(|t| t.id).collect())
                .unwrap_or_default()
        }

        fn mesh_mut(&mut self) -> &mut SurfaceMesh {
            &mut self.mesh
        }
    }

    #[tokio::test]
    async fn test_sampling_failure_keeps_last_required_level() {
        let settings = full_settings();
        let tree = MultiresTree::new(&settings, 3).unwrap();
        let resolution = Rc::new(Cell::new(None));
        let helper = ScriptedHelper {
            resolution: Rc::clone(&resolution),
            mesh: SurfaceMesh::plane(Vec2::ONE, UVec2::ONE, Vec3::ZERO),
        };
        let addressing = TileAddressing::new(IndexType::MortonSum, vec!["t/".into()], None, "jpg", &tree);
        let loader = TileLoader::new_with_current_runtime(
            Arc::new(ScriptedFetcher::new()),
            4,
            RetryPolicy::default(),
        );
        let mut s = TileScheduler::new(tree, Box::new(helper), addressing, loader, RequestMode::Direct);

        // Never measured: level 0
        assert_eq!(s.required_level(&camera(), FINEST_VIEWPORT), 0);

        resolution.set(Some(Vec2::splat(600.0)));
        assert_eq!(s.required_level(&camera(), FINEST_VIEWPORT), 2);

        resolution.set(None);
        assert_eq!(s.required_level(&camera(), FINEST_VIEWPORT), 2);
        assert_eq!(s.request_multires_texture_data(&camera(), FINEST_VIEWPORT), Some(2));
    }
}
