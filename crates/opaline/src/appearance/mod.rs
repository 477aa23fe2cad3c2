//! The agent-appearance pipeline: outfit composition, the cache-check
//! round trip, client-side baking with bounded-parallel asset fetches,
//! the server-side-bake capability path, and outfit editing with the
//! coalescing rebake timer.

pub mod bakes;
pub mod color;
pub mod params;
pub mod server_bake;
pub mod wearables;

use crate::error::{AppearanceError, Result};
use crate::services::{AssetService, BakeJob, InventoryService, ObjectCache, TextureBaker};
use bakes::{AVATAR_TEXTURE_COUNT, BAKE_COUNT, BakeLayer, agent_size, bake_hash, is_real_texture};
use bytes::Bytes;
use circuline::Circuit;
use circuline::events::{EventHub, Subscription};
use circuline::protocol::messages::{
    AgentCachedTexture, AgentIsNowWearing, AgentSetAppearance, AgentWearablesRequest,
    CachedTextureBlock, Message, WornItemBlock,
};
use color::{Color4, apply_operation, color_param_whitelist, param_color};
use log::{debug, info, trace, warn};
use opaline_binary::io::BinaryWriter;
use params::ParamCatalog;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wearables::{DecodedWearable, WearableData, WearableSet, WearableType, decode_wearable};

/// Tunables for the appearance pipeline.
#[derive(Debug, Clone)]
pub struct AppearanceConfig {
    pub max_concurrent_downloads: usize,
    pub wearable_timeout: Duration,
    pub texture_timeout: Duration,
    pub upload_timeout: Duration,
    pub upload_retries: u32,
    pub rebake_delay: Duration,
    /// Server-side-bake attempts before giving up.
    pub total_retries: u32,
    pub avatar_poll_interval: Duration,
    pub avatar_poll_limit: u32,
    /// Whether peer-initiated rebake requests are honored.
    pub send_appearance_updates: bool,
}

impl Default for AppearanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 5,
            wearable_timeout: Duration::from_secs(30),
            texture_timeout: Duration::from_secs(120),
            upload_timeout: Duration::from_secs(90),
            upload_retries: 2,
            rebake_delay: Duration::from_secs(5),
            total_retries: 3,
            avatar_poll_interval: Duration::from_millis(50),
            avatar_poll_limit: 1000,
            send_appearance_updates: true,
        }
    }
}

/// One avatar texture slot.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureSlot {
    pub texture_id: Uuid,
    pub alpha_masks: Vec<(u32, f32)>,
    pub color: Color4,
}

impl Default for TextureSlot {
    fn default() -> Self {
        Self {
            texture_id: Uuid::nil(),
            alpha_masks: Vec::new(),
            color: Color4::WHITE,
        }
    }
}

/// Mutable appearance state; the pipeline reads a snapshot and writes
/// results back only at phase boundaries.
#[derive(Debug, Clone)]
pub struct AppearanceState {
    pub wearables: WearableSet,
    pub attachments: HashMap<Uuid, u8>,
    pub textures: Vec<TextureSlot>,
    pub visual_params: BTreeMap<u32, f32>,
    pub packed_params: Vec<u8>,
}

impl Default for AppearanceState {
    fn default() -> Self {
        Self {
            wearables: WearableSet::new(),
            attachments: HashMap::new(),
            textures: vec![TextureSlot::default(); AVATAR_TEXTURE_COUNT],
            visual_params: BTreeMap::new(),
            packed_params: Vec::new(),
        }
    }
}

/// Completion and data events published by the pipeline.
#[derive(Debug, Clone)]
pub enum AppearanceEvent {
    /// A pipeline run ended. `success == false` covers both partial
    /// failures (some bakes missing) and aborted runs.
    AppearanceSet { success: bool },
    /// A server-side bake was applied.
    AvatarAppearanceApplied {
        visual_params: Vec<u8>,
        textures: Vec<Uuid>,
        cof_version: i32,
    },
}

struct Inner<A, I, B> {
    cfg: AppearanceConfig,
    circuit: Arc<Circuit>,
    assets: Arc<A>,
    inventory: Arc<I>,
    baker: Arc<B>,
    catalog: Arc<ParamCatalog>,
    objects: Arc<ObjectCache>,
    http: reqwest::Client,

    state: Mutex<AppearanceState>,
    pipeline_running: AtomicBool,
    first_run_done: AtomicBool,
    server_baking_done: AtomicBool,
    cache_check_serial: AtomicI32,
    set_appearance_serial: AtomicU32,
    cof_version: AtomicI32,
    bake_url: Mutex<Option<String>>,

    rebake_timer: Mutex<Option<JoinHandle<()>>>,
    run_cancel: Mutex<Option<CancellationToken>>,
    events: EventHub<AppearanceEvent>,
}

/// Drives the avatar's appearance over one circuit. Exactly one pipeline
/// run is in flight at a time; extra requests are rejected at the gate.
pub struct AppearanceManager<A, I, B> {
    inner: Arc<Inner<A, I, B>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<A, I, B> AppearanceManager<A, I, B>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    pub fn new(
        cfg: AppearanceConfig,
        circuit: Arc<Circuit>,
        assets: Arc<A>,
        inventory: Arc<I>,
        baker: Arc<B>,
        catalog: Arc<ParamCatalog>,
        objects: Arc<ObjectCache>,
    ) -> Self {
        let inner = Arc::new(Inner {
            cfg,
            circuit,
            assets,
            inventory,
            baker,
            catalog,
            objects,
            http: reqwest::Client::new(),
            state: Mutex::new(AppearanceState::default()),
            pipeline_running: AtomicBool::new(false),
            first_run_done: AtomicBool::new(false),
            server_baking_done: AtomicBool::new(false),
            cache_check_serial: AtomicI32::new(0),
            set_appearance_serial: AtomicU32::new(0),
            cof_version: AtomicI32::new(0),
            bake_url: Mutex::new(None),
            rebake_timer: Mutex::new(None),
            run_cancel: Mutex::new(None),
            events: EventHub::new(),
        });
        let listener = tokio::spawn(inbound_loop(Arc::clone(&inner)));
        Self {
            inner,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Region capability for server-side baking; `None` selects the
    /// classic client-side path.
    pub fn set_bake_capability(&self, url: Option<String>) {
        *self.inner.bake_url.lock().unwrap() = url;
    }

    pub fn subscribe(&self) -> Subscription<AppearanceEvent> {
        self.inner.events.subscribe()
    }

    pub fn server_baking_done(&self) -> bool {
        self.inner.server_baking_done.load(Ordering::Acquire)
    }

    pub fn set_appearance_serial(&self) -> u32 {
        self.inner.set_appearance_serial.load(Ordering::Acquire)
    }

    /// Snapshot of the current appearance state.
    pub fn state(&self) -> AppearanceState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Fire-and-forget entry point. Completion is observed through
    /// [`AppearanceEvent::AppearanceSet`].
    pub fn request_set_appearance(&self, forced: bool) {
        spawn_pipeline(Arc::clone(&self.inner), forced);
    }

    /// Adds wearables to the outfit. With `replace`, other items of the
    /// same slots come off first; body parts always replace.
    pub async fn add_to_outfit(&self, additions: Vec<WearableData>, replace: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            apply_add(&mut state, additions, replace);
        }
        self.send_wearing_snapshot().await?;
        self.schedule_rebake();
        Ok(())
    }

    /// Takes items off by item ID. Body parts are refused; attachments
    /// with matching item IDs are detached.
    pub async fn remove_from_outfit(&self, item_ids: &[Uuid]) -> Result<bool> {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            apply_remove(&mut state, item_ids)
        };
        if changed {
            self.send_wearing_snapshot().await?;
            self.schedule_rebake();
        }
        Ok(changed)
    }

    /// Replaces the whole outfit. Body parts missing from the new list
    /// are retained from the previous set; if even then one is missing
    /// the previous outfit is preserved and the call fails. With `safe`,
    /// the current wearables are refreshed from the COF first.
    pub async fn replace_outfit(
        &self,
        replacement: Vec<WearableData>,
        attachments: HashMap<Uuid, u8>,
        safe: bool,
    ) -> Result<()> {
        if safe {
            match self.inner.inventory.current_outfit().await {
                Ok(outfit) => {
                    let refreshed = outfit_to_wearables(&outfit);
                    self.inner
                        .cof_version
                        .store(outfit.version, Ordering::Release);
                    let mut state = self.inner.state.lock().unwrap();
                    state.wearables = refreshed;
                }
                Err(e) => warn!("Safe replace could not refresh the COF: {}", e),
            }
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            apply_replace(&mut state, replacement, attachments)?;
        }
        self.inner
            .set_appearance_serial
            .fetch_add(1, Ordering::AcqRel);
        self.send_wearing_snapshot().await?;
        self.schedule_rebake();
        Ok(())
    }

    /// Cancels any in-flight run and stops background tasks. Called on
    /// session disconnect.
    pub fn shutdown(&self) {
        if let Some(cancel) = self.inner.run_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
        if let Some(timer) = self.inner.rebake_timer.lock().unwrap().take() {
            timer.abort();
        }
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
    }

    async fn send_wearing_snapshot(&self) -> Result<()> {
        let snapshot = {
            let state = self.inner.state.lock().unwrap();
            wearing_snapshot(&state.wearables)
        };
        self.inner
            .circuit
            .send(
                Message::AgentIsNowWearing(AgentIsNowWearing {
                    agent_id: self.inner.circuit.agent_id(),
                    session_id: self.inner.circuit.session_id(),
                    wearables: snapshot,
                }),
                true,
                false,
            )
            .await?;
        Ok(())
    }

    /// (Re)arms the single-shot rebake timer; repeated edits coalesce by
    /// pushing it out.
    fn schedule_rebake(&self) {
        let mut timer = self.inner.rebake_timer.lock().unwrap();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.cfg.rebake_delay).await;
            trace!("Delayed rebake firing");
            spawn_pipeline(inner, true);
        }));
    }
}

impl<A, I, B> Drop for AppearanceManager<A, I, B> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
        if let Some(timer) = self.inner.rebake_timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}

/// CAS gate + task spawn shared by the public entry point, the rebake
/// timer and peer-initiated rebakes.
fn spawn_pipeline<A, I, B>(inner: Arc<Inner<A, I, B>>, forced: bool)
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    if inner
        .pipeline_running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        warn!("Appearance pipeline already running, request ignored");
        return;
    }
    let cancel = CancellationToken::new();
    *inner.run_cancel.lock().unwrap() = Some(cancel.clone());

    tokio::spawn(async move {
        let success = match run_pipeline(&inner, forced, &cancel).await {
            Ok(success) => success,
            Err(AppearanceError::Cancelled) => {
                debug!("Appearance pipeline cancelled");
                false
            }
            Err(e) => {
                warn!("Appearance pipeline failed: {}", e);
                false
            }
        };
        inner
            .events
            .publish(AppearanceEvent::AppearanceSet { success });
        inner.run_cancel.lock().unwrap().take();
        inner.pipeline_running.store(false, Ordering::Release);
    });
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(AppearanceError::Cancelled)
    } else {
        Ok(())
    }
}

async fn run_pipeline<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    forced: bool,
    cancel: &CancellationToken,
) -> Result<bool>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    // Phase 1: gather attachments from the live object set.
    let attachments = inner.objects.gather_attachments();
    debug!("Gathered {} attachments", attachments.len());
    {
        let mut state = inner.state.lock().unwrap();
        state.attachments = attachments;
    }
    checkpoint(cancel)?;

    // Phase 2: make sure the wearable set is known.
    ensure_wearables(inner).await?;
    checkpoint(cancel)?;

    let bake_url = inner.bake_url.lock().unwrap().clone();
    if let Some(url) = bake_url {
        return server_bake_pipeline(inner, &url, cancel).await;
    }
    client_bake_pipeline(inner, forced, cancel).await
}

/// Mode A: ask the region to bake for us.
async fn server_bake_pipeline<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    url: &str,
    cancel: &CancellationToken,
) -> Result<bool>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    // Precondition: the circuit is up and our own avatar exists. Expiry
    // is a distinct error, not a silent fall-through.
    let mut polls = 0u32;
    while !(inner.circuit.is_connected() && inner.objects.self_present()) {
        polls += 1;
        if polls > inner.cfg.avatar_poll_limit {
            return Err(AppearanceError::AvatarNotPresent);
        }
        checkpoint(cancel)?;
        tokio::time::sleep(inner.cfg.avatar_poll_interval).await;
    }

    let client = server_bake::ServerBakeClient::new(inner.http.clone(), url.to_string());
    let mut cof_version = inner.cof_version.load(Ordering::Acquire);

    for attempt in 0..=inner.cfg.total_retries {
        checkpoint(cancel)?;
        if attempt > 0 {
            tokio::time::sleep(inner.cfg.rebake_delay).await;
            checkpoint(cancel)?;
        }
        match client.update_avatar_appearance(cof_version).await {
            Ok(server_bake::BakeReply::Applied(applied)) => {
                info!(
                    "Server-side bake applied (COF version {})",
                    applied.cof_version
                );
                inner.cof_version.store(applied.cof_version, Ordering::Release);
                {
                    let mut state = inner.state.lock().unwrap();
                    for (index, texture_id) in applied.textures.iter().enumerate() {
                        if index < state.textures.len() {
                            state.textures[index].texture_id = if is_real_texture(*texture_id) {
                                *texture_id
                            } else {
                                Uuid::nil()
                            };
                        }
                    }
                    state.packed_params = applied.visual_params.clone();
                }
                inner.server_baking_done.store(true, Ordering::Release);
                inner.events.publish(AppearanceEvent::AvatarAppearanceApplied {
                    visual_params: applied.visual_params,
                    textures: applied.textures,
                    cof_version: applied.cof_version,
                });
                return Ok(true);
            }
            Ok(server_bake::BakeReply::VersionMismatch { expected }) => {
                warn!(
                    "Bake capability expects COF version {}, ours was {}; retrying",
                    expected, cof_version
                );
                // Re-read the folder; the edit that bumped it may not
                // have reached us when the run started.
                match inner.inventory.current_outfit().await {
                    Ok(outfit) => cof_version = outfit.version,
                    Err(_) => cof_version = expected,
                }
            }
            Ok(server_bake::BakeReply::Refused { error }) => {
                warn!("Bake capability refused attempt {}: {}", attempt + 1, error);
            }
            Err(e) => {
                warn!("Bake capability transport failure: {}", e);
            }
        }
    }
    Ok(false)
}

/// Mode B: classic client-side baking.
async fn client_bake_pipeline<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    forced: bool,
    cancel: &CancellationToken,
) -> Result<bool>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    // Phase 3: fetch and decode wearable assets we do not hold yet.
    download_wearables(inner, cancel).await?;
    checkpoint(cancel)?;

    // Phase 4: derive texture slots, tints, alpha masks and parameters.
    let mut work = {
        let mut state = inner.state.lock().unwrap();
        populate_textures(&mut state, &inner.catalog);
        state.clone()
    };
    checkpoint(cancel)?;

    // Phase 5: ask which bakes the region already has.
    let hashes: Vec<(BakeLayer, Uuid)> = BakeLayer::ALL
        .iter()
        .map(|&layer| (layer, bake_hash(layer, &work.wearables)))
        .collect();
    let mut cached: [Option<Uuid>; BAKE_COUNT] = [None; BAKE_COUNT];
    let first_run = !inner.first_run_done.load(Ordering::Acquire);
    if first_run && !forced {
        cached = cache_check(inner, &hashes).await;
        checkpoint(cancel)?;
    }

    // Phase 6: build whatever the cache did not cover.
    let mut success = true;
    for (layer, hash) in &hashes {
        checkpoint(cancel)?;
        let layer = *layer;
        if hash.is_nil() {
            // Empty layer (e.g. no skirt worn): nothing to query or bake.
            trace!("Skipping empty bake layer {:?}", layer);
            continue;
        }
        let slot = layer.texture_slot();
        if let Some(server_texture) = cached[layer as usize] {
            debug!("Cache hit for {:?}, adopting {}", layer, server_texture);
            work.textures[slot].texture_id = server_texture;
            continue;
        }
        if !bake_layer(inner, &mut work, layer, cancel).await? {
            success = false;
        }
    }

    // Phase 7: publish the result.
    let serial = inner.set_appearance_serial.fetch_add(1, Ordering::AcqRel) + 1;
    let wearable_data: Vec<CachedTextureBlock> = hashes
        .iter()
        .map(|(layer, hash)| CachedTextureBlock {
            id: *hash,
            texture_index: *layer as u8,
        })
        .collect();
    let message = Message::AgentSetAppearance(AgentSetAppearance {
        agent_id: inner.circuit.agent_id(),
        session_id: inner.circuit.session_id(),
        serial_num: serial,
        size: agent_size(&work.visual_params),
        wearable_data,
        texture_entry: build_texture_entry(&work.textures),
        visual_params: work.packed_params.clone(),
    });
    inner.circuit.send(message, true, true).await?;
    info!("AgentSetAppearance #{} sent (success = {})", serial, success);

    // Write the run's results back; this is the only mutation point
    // after phase 4.
    {
        let mut state = inner.state.lock().unwrap();
        state.textures = work.textures;
        state.visual_params = work.visual_params;
        state.packed_params = work.packed_params;
    }
    inner.first_run_done.store(true, Ordering::Release);
    Ok(success)
}

/// Builds one missing bake: download inputs, composite, upload. Returns
/// `false` on a partial failure (the pipeline keeps going).
async fn bake_layer<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    work: &mut AppearanceState,
    layer: BakeLayer,
    cancel: &CancellationToken,
) -> Result<bool>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    let slot = layer.texture_slot();

    // Input texture IDs in bake-map order, layering order within a slot.
    let mut input_ids: Vec<Uuid> = Vec::new();
    for wearable_type in layer.wearables() {
        for worn in work.wearables.of_type(*wearable_type) {
            let Some(asset) = &worn.asset else { continue };
            for texture_id in asset.textures.values() {
                if is_real_texture(*texture_id) && !input_ids.contains(texture_id) {
                    input_ids.push(*texture_id);
                }
            }
        }
    }

    let downloaded = download_images(inner, &input_ids, cancel).await?;
    let mut complete = downloaded.len() == input_ids.len();
    let textures: Vec<Bytes> = input_ids
        .iter()
        .filter_map(|id| downloaded.get(id).cloned())
        .collect();

    let job = BakeJob {
        layer,
        textures,
        alpha_masks: work.textures[slot].alpha_masks.clone(),
        tint: work.textures[slot].color,
    };
    let baked = match inner.baker.bake(&job) {
        Ok(baked) => baked,
        Err(e) => {
            warn!("Baker failed for {:?}: {}", layer, e);
            return Ok(false);
        }
    };

    // Upload with a bounded number of retries; failure leaves the slot
    // empty but the run continues.
    let mut uploaded = None;
    for attempt in 0..=inner.cfg.upload_retries {
        checkpoint(cancel)?;
        match timeout(
            inner.cfg.upload_timeout,
            inner.assets.upload_baked_texture(baked.clone()),
        )
        .await
        {
            Ok(Ok(asset_id)) => {
                uploaded = Some(asset_id);
                break;
            }
            Ok(Err(e)) => warn!(
                "Bake upload attempt {} for {:?} failed: {}",
                attempt + 1,
                layer,
                e
            ),
            Err(_) => warn!(
                "Bake upload attempt {} for {:?} timed out",
                attempt + 1,
                layer
            ),
        }
    }
    match uploaded {
        Some(asset_id) => {
            debug!("Baked {:?} uploaded as {}", layer, asset_id);
            work.textures[slot].texture_id = asset_id;
        }
        None => complete = false,
    }
    Ok(complete)
}

/// Loads the wearable set when unknown: the COF through the inventory
/// store, or the simulator's wearable snapshot as a fallback.
async fn ensure_wearables<A, I, B>(inner: &Arc<Inner<A, I, B>>) -> Result<()>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    if !inner.state.lock().unwrap().wearables.is_empty() {
        return Ok(());
    }
    match inner.inventory.current_outfit().await {
        Ok(outfit) => {
            inner.cof_version.store(outfit.version, Ordering::Release);
            let wearables = outfit_to_wearables(&outfit);
            let attachments: HashMap<Uuid, u8> = outfit
                .links
                .iter()
                .filter(|l| l.kind == crate::services::CofLinkKind::Attachment)
                .filter_map(|l| l.attach_point.map(|p| (l.item_id, p)))
                .collect();
            let mut state = inner.state.lock().unwrap();
            state.wearables = wearables;
            for (item, point) in attachments {
                state.attachments.entry(item).or_insert(point);
            }
            debug!(
                "COF loaded: {} wearables, version {}",
                state.wearables.len(),
                outfit.version
            );
            Ok(())
        }
        Err(e) => {
            warn!("COF read failed ({}), asking the simulator", e);
            let mut sub = inner.circuit.subscribe();
            inner
                .circuit
                .send(
                    Message::AgentWearablesRequest(AgentWearablesRequest {
                        agent_id: inner.circuit.agent_id(),
                        session_id: inner.circuit.session_id(),
                    }),
                    true,
                    false,
                )
                .await?;
            let deadline = tokio::time::Instant::now() + inner.cfg.wearable_timeout;
            loop {
                let remaining = deadline
                    .checked_duration_since(tokio::time::Instant::now())
                    .ok_or(AppearanceError::Timeout("wearables"))?;
                let Ok(Some(message)) = timeout(remaining, sub.recv()).await else {
                    return Err(AppearanceError::Timeout("wearables"));
                };
                if let Message::AgentWearablesUpdate(update) = &*message {
                    seed_wearables(inner, update);
                    return Ok(());
                }
            }
        }
    }
}

/// Fetches undecoded wearable assets, at most
/// `max_concurrent_downloads` in flight, each under the wearable
/// timeout.
async fn download_wearables<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    cancel: &CancellationToken,
) -> Result<()>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    let missing: Vec<(Uuid, crate::services::AssetType)> = {
        let state = inner.state.lock().unwrap();
        state
            .wearables
            .iter()
            .filter(|w| w.asset.is_none())
            .map(|w| (w.asset_id, w.asset_type))
            .collect()
    };
    if missing.is_empty() {
        return Ok(());
    }
    debug!("Fetching {} wearable assets", missing.len());

    let semaphore = Arc::new(Semaphore::new(inner.cfg.max_concurrent_downloads));
    let mut joins = Vec::with_capacity(missing.len());
    for (asset_id, asset_type) in missing {
        let semaphore = Arc::clone(&semaphore);
        let assets = Arc::clone(&inner.assets);
        let deadline = inner.cfg.wearable_timeout;
        let cancel = cancel.clone();
        joins.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (asset_id, Err(AppearanceError::Cancelled));
            };
            if cancel.is_cancelled() {
                return (asset_id, Err(AppearanceError::Cancelled));
            }
            let fetched = timeout(deadline, assets.request_asset(asset_id, asset_type)).await;
            let result = match fetched {
                Ok(Ok(bytes)) => decode_wearable(&bytes),
                Ok(Err(e)) => Err(AppearanceError::Service(e)),
                Err(_) => Err(AppearanceError::Timeout("wearable asset")),
            };
            (asset_id, result)
        }));
    }

    let mut decoded: HashMap<Uuid, DecodedWearable> = HashMap::new();
    for join in joins {
        let Ok((asset_id, result)) = join.await else {
            continue;
        };
        match result {
            Ok(asset) => {
                decoded.insert(asset_id, asset);
            }
            Err(e) => warn!("Wearable asset {} unavailable: {}", asset_id, e),
        }
    }

    let mut state = inner.state.lock().unwrap();
    for worn in state.wearables.iter_mut() {
        if worn.asset.is_none() {
            if let Some(asset) = decoded.get(&worn.asset_id) {
                worn.asset = Some(asset.clone());
            }
        }
    }
    Ok(())
}

/// Fetches bake input rasters with the same fan-out discipline.
async fn download_images<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    texture_ids: &[Uuid],
    cancel: &CancellationToken,
) -> Result<HashMap<Uuid, Bytes>>
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    let semaphore = Arc::new(Semaphore::new(inner.cfg.max_concurrent_downloads));
    let mut joins = Vec::with_capacity(texture_ids.len());
    for &texture_id in texture_ids {
        let semaphore = Arc::clone(&semaphore);
        let assets = Arc::clone(&inner.assets);
        let deadline = inner.cfg.texture_timeout;
        let cancel = cancel.clone();
        joins.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (texture_id, None);
            };
            if cancel.is_cancelled() {
                return (texture_id, None);
            }
            match timeout(deadline, assets.request_image(texture_id)).await {
                Ok(Ok(bytes)) => (texture_id, Some(bytes)),
                Ok(Err(e)) => {
                    warn!("Bake input {} unavailable: {}", texture_id, e);
                    (texture_id, None)
                }
                Err(_) => {
                    warn!("Bake input {} timed out", texture_id);
                    (texture_id, None)
                }
            }
        }));
    }
    let mut downloaded = HashMap::new();
    for join in joins {
        if let Ok((texture_id, Some(bytes))) = join.await {
            downloaded.insert(texture_id, bytes);
        }
    }
    Ok(downloaded)
}

/// One AgentCachedTexture round trip. A timeout degrades to "no cache
/// hits" rather than failing the run.
async fn cache_check<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    hashes: &[(BakeLayer, Uuid)],
) -> [Option<Uuid>; BAKE_COUNT]
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    let mut results: [Option<Uuid>; BAKE_COUNT] = [None; BAKE_COUNT];
    let blocks: Vec<CachedTextureBlock> = hashes
        .iter()
        .filter(|(_, hash)| !hash.is_nil())
        .map(|(layer, hash)| CachedTextureBlock {
            id: *hash,
            texture_index: *layer as u8,
        })
        .collect();
    if blocks.is_empty() {
        return results;
    }

    let serial = inner.cache_check_serial.fetch_add(1, Ordering::AcqRel) + 1;
    let mut sub = inner.circuit.subscribe();
    let request = Message::AgentCachedTexture(AgentCachedTexture {
        agent_id: inner.circuit.agent_id(),
        session_id: inner.circuit.session_id(),
        serial_num: serial,
        blocks,
    });
    if let Err(e) = inner.circuit.send(request, true, false).await {
        warn!("Cache check not sent: {}", e);
        return results;
    }

    let deadline = tokio::time::Instant::now() + inner.cfg.wearable_timeout;
    loop {
        let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            warn!("Cache-check response timed out");
            return results;
        };
        match timeout(remaining, sub.recv()).await {
            Ok(Some(message)) => {
                if let Message::AgentCachedTextureResponse(response) = &*message {
                    if response.serial_num != serial {
                        continue;
                    }
                    for block in &response.blocks {
                        if block.id.is_nil() {
                            continue;
                        }
                        if let Some(layer) = BakeLayer::from_index(block.texture_index) {
                            results[layer as usize] = Some(block.id);
                        }
                    }
                    debug!(
                        "Cache check #{}: {} of {} layers cached",
                        serial,
                        results.iter().flatten().count(),
                        response.blocks.len()
                    );
                    return results;
                }
            }
            _ => {
                warn!("Cache-check response timed out");
                return results;
            }
        }
    }
}

/// Handles inbound traffic that concerns the appearance layer.
async fn inbound_loop<A, I, B>(inner: Arc<Inner<A, I, B>>)
where
    A: AssetService,
    I: InventoryService,
    B: TextureBaker,
{
    let mut sub = inner.circuit.subscribe();
    while let Some(message) = sub.recv().await {
        match &*message {
            Message::AgentWearablesUpdate(update) => {
                seed_wearables(&inner, update);
            }
            Message::RebakeAvatarTextures(_) => {
                if inner.cfg.send_appearance_updates {
                    info!("Server requested a rebake");
                    spawn_pipeline(Arc::clone(&inner), true);
                } else {
                    debug!("Ignoring server rebake request (updates disabled)");
                }
            }
            _ => {}
        }
    }
}

/// Adopts the simulator's wearable snapshot when we have nothing better.
fn seed_wearables<A, I, B>(
    inner: &Arc<Inner<A, I, B>>,
    update: &circuline::protocol::messages::AgentWearablesUpdate,
) {
    let mut state = inner.state.lock().unwrap();
    if !state.wearables.is_empty() {
        return;
    }
    for block in &update.wearables {
        let Some(wearable_type) = WearableType::from_u8(block.wearable_type) else {
            continue;
        };
        if block.item_id.is_nil() {
            continue;
        }
        state
            .wearables
            .insert(WearableData::new(block.item_id, block.asset_id, wearable_type));
    }
    debug!(
        "Seeded {} wearables from AgentWearablesUpdate #{}",
        state.wearables.len(),
        update.serial_num
    );
}

fn outfit_to_wearables(outfit: &crate::services::CurrentOutfit) -> WearableSet {
    let mut set = WearableSet::new();
    for link in &outfit.links {
        if link.kind != crate::services::CofLinkKind::Wearable {
            continue;
        }
        let Some(wearable_type) = link.wearable_type else {
            continue;
        };
        set.insert(WearableData::new(link.item_id, link.asset_id, wearable_type));
    }
    set
}

fn apply_add(state: &mut AppearanceState, additions: Vec<WearableData>, replace: bool) {
    let mut cleared: Vec<WearableType> = Vec::new();
    for wearable in &additions {
        let must_clear = replace || wearable.wearable_type.is_body_part();
        if must_clear && !cleared.contains(&wearable.wearable_type) {
            state.wearables.clear_type(wearable.wearable_type);
            cleared.push(wearable.wearable_type);
        }
    }
    for wearable in additions {
        state.wearables.insert(wearable);
    }
}

fn apply_remove(state: &mut AppearanceState, item_ids: &[Uuid]) -> bool {
    let mut changed = false;
    for &item_id in item_ids {
        let is_body_part = state
            .wearables
            .iter()
            .any(|w| w.item_id == item_id && w.wearable_type.is_body_part());
        if is_body_part {
            warn!("Refusing to remove body part item {}", item_id);
            continue;
        }
        changed |= state.wearables.remove_item(item_id);
        changed |= state.attachments.remove(&item_id).is_some();
    }
    changed
}

fn apply_replace(
    state: &mut AppearanceState,
    replacement: Vec<WearableData>,
    attachments: HashMap<Uuid, u8>,
) -> Result<()> {
    let mut next = WearableSet::new();
    for wearable in replacement {
        next.insert(wearable);
    }
    // Body parts cannot go missing: retain previous ones when the new
    // list omits them.
    for part in WearableType::REQUIRED_BODY_PARTS {
        if next.of_type(part).is_empty() {
            for previous in state.wearables.of_type(part) {
                next.insert(previous.clone());
            }
        }
    }
    if let Some(missing) = next.missing_body_part() {
        return Err(AppearanceError::MissingBodyPart(missing));
    }
    state.wearables = next;
    state.attachments = attachments;
    Ok(())
}

/// Fixed-width snapshot for AgentIsNowWearing: one block per primary
/// slot, carrying the first worn item or zero.
fn wearing_snapshot(wearables: &WearableSet) -> Vec<WornItemBlock> {
    WearableType::ALL
        .iter()
        .map(|&wearable_type| WornItemBlock {
            item_id: wearables.first_item_for_slot(wearable_type),
            wearable_type: wearable_type as u8,
        })
        .collect()
}

/// Derives texture slots, tints, alpha masks, parameter values and the
/// packed parameter bytes from the decoded wearables.
fn populate_textures(state: &mut AppearanceState, catalog: &ParamCatalog) {
    let worn: Vec<(WearableType, DecodedWearable)> = state
        .wearables
        .iter()
        .filter_map(|w| w.asset.as_ref().map(|a| (w.wearable_type, a.clone())))
        .collect();

    for slot in &mut state.textures {
        *slot = TextureSlot::default();
    }
    state.visual_params.clear();

    // Later wearables win on shared parameter IDs.
    for (_, decoded) in &worn {
        for (&param_id, &value) in &decoded.params {
            state.visual_params.insert(param_id, value);
        }
    }

    // Per-layer tint and alpha masks.
    for layer in BakeLayer::ALL {
        let slot = layer.texture_slot();
        let mut tint = Color4::ZERO;
        let mut tinted = false;
        let mut masks: Vec<(u32, f32)> = Vec::new();
        for (wearable_type, decoded) in &worn {
            if !layer.wearables().contains(wearable_type) {
                continue;
            }
            let whitelist = color_param_whitelist(*wearable_type);
            for (&param_id, &value) in &decoded.params {
                let Some(param) = catalog.get(param_id) else {
                    continue;
                };
                if param.alpha.is_some() {
                    masks.push((param_id, value));
                }
                if let Some(color_param) = &param.color {
                    if whitelist.is_none_or(|ids| ids.contains(&param_id)) {
                        let resolved =
                            param_color(color_param, param.min_value, param.max_value, value);
                        tint = apply_operation(tint, resolved, color_param.operation, value);
                        tinted = true;
                    }
                }
            }
        }
        state.textures[slot].color = if tinted { tint } else { Color4::WHITE };
        state.textures[slot].alpha_masks = masks;
    }

    // Texture IDs pinned by wearables; the sentinel reads as "none".
    for (_, decoded) in &worn {
        for (&index, &texture_id) in &decoded.textures {
            if let Some(slot) = state.textures.get_mut(index as usize) {
                slot.texture_id = if is_real_texture(texture_id) {
                    texture_id
                } else {
                    Uuid::nil()
                };
            }
        }
    }

    // Packed wire bytes, catalog order.
    state.packed_params = catalog
        .iter()
        .map(|param| {
            let value = state
                .visual_params
                .get(&param.id)
                .copied()
                .unwrap_or(param.default_value);
            param.quantize(value)
        })
        .collect();
}

/// Minimal texture-entry serialization: the default texture, then
/// explicit `{slot, id}` overrides for every populated slot.
fn build_texture_entry(textures: &[TextureSlot]) -> Bytes {
    let mut writer = BinaryWriter::new();
    let _ = writer.write_uuid(&bakes::DEFAULT_AVATAR_TEXTURE);
    let overrides: Vec<(u8, Uuid)> = textures
        .iter()
        .enumerate()
        .filter(|(_, slot)| is_real_texture(slot.texture_id))
        .map(|(index, slot)| (index as u8, slot.texture_id))
        .collect();
    let _ = writer.write_u8(overrides.len() as u8);
    for (index, texture_id) in overrides {
        let _ = writer.write_u8(index);
        let _ = writer.write_uuid(&texture_id);
    }
    writer.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::color::{ColorOperation, VisualColorParam};
    use crate::appearance::params::VisualParam;

    fn body(state: &mut AppearanceState) {
        for part in WearableType::REQUIRED_BODY_PARTS {
            state
                .wearables
                .insert(WearableData::new(Uuid::new_v4(), Uuid::new_v4(), part));
        }
    }

    #[test]
    fn add_with_replace_clears_the_slot_first() {
        let mut state = AppearanceState::default();
        let old = Uuid::new_v4();
        state
            .wearables
            .insert(WearableData::new(old, Uuid::new_v4(), WearableType::Shirt));

        let new_a = Uuid::new_v4();
        let new_b = Uuid::new_v4();
        apply_add(
            &mut state,
            vec![
                WearableData::new(new_a, Uuid::new_v4(), WearableType::Shirt),
                WearableData::new(new_b, Uuid::new_v4(), WearableType::Shirt),
            ],
            true,
        );
        let worn: Vec<Uuid> = state
            .wearables
            .of_type(WearableType::Shirt)
            .iter()
            .map(|w| w.item_id)
            .collect();
        // Both additions survive; only the old shirt went away.
        assert_eq!(worn, vec![new_a, new_b]);
    }

    #[test]
    fn body_parts_always_replace_even_without_the_flag() {
        let mut state = AppearanceState::default();
        let old_shape = Uuid::new_v4();
        state
            .wearables
            .insert(WearableData::new(old_shape, Uuid::new_v4(), WearableType::Shape));
        apply_add(
            &mut state,
            vec![WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Shape)],
            false,
        );
        assert_eq!(state.wearables.of_type(WearableType::Shape).len(), 1);
        assert!(!state.wearables.contains_item(old_shape));
    }

    #[test]
    fn remove_refuses_body_parts_and_detaches_attachments() {
        let mut state = AppearanceState::default();
        body(&mut state);
        let shape_item = state.wearables.first_item_for_slot(WearableType::Shape);
        assert!(!apply_remove(&mut state, &[shape_item]));
        assert!(state.wearables.contains_item(shape_item));

        let attachment = Uuid::new_v4();
        state.attachments.insert(attachment, 6);
        assert!(apply_remove(&mut state, &[attachment]));
        assert!(state.attachments.is_empty());
    }

    #[test]
    fn replace_keeps_previous_body_parts_when_omitted() {
        let mut state = AppearanceState::default();
        body(&mut state);
        let previous_shape = state.wearables.first_item_for_slot(WearableType::Shape);

        let replacement = vec![
            WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Skin),
            WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Eyes),
            WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Hair),
            WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Pants),
        ];
        apply_replace(&mut state, replacement, HashMap::new()).unwrap();
        // The shape was not in the new list; the previous one survives.
        assert_eq!(
            state.wearables.first_item_for_slot(WearableType::Shape),
            previous_shape
        );
        assert_eq!(state.wearables.of_type(WearableType::Pants).len(), 1);
    }

    #[test]
    fn replace_without_any_body_part_source_fails_and_preserves() {
        let mut state = AppearanceState::default();
        let shirt = Uuid::new_v4();
        state
            .wearables
            .insert(WearableData::new(shirt, Uuid::new_v4(), WearableType::Shirt));

        let result = apply_replace(
            &mut state,
            vec![WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Jacket)],
            HashMap::new(),
        );
        assert!(matches!(result, Err(AppearanceError::MissingBodyPart(_))));
        // Previous outfit untouched.
        assert!(state.wearables.contains_item(shirt));
        assert!(state.wearables.of_type(WearableType::Jacket).is_empty());
    }

    #[test]
    fn wearing_snapshot_is_fixed_width() {
        let mut state = AppearanceState::default();
        body(&mut state);
        let snapshot = wearing_snapshot(&state.wearables);
        assert_eq!(snapshot.len(), wearables::WEARABLE_SLOT_COUNT);
        assert_eq!(snapshot[0].wearable_type, WearableType::Shape as u8);
        assert!(!snapshot[0].item_id.is_nil());
        // Empty slots carry zero.
        assert!(snapshot[WearableType::Skirt as usize].item_id.is_nil());
    }

    #[test]
    fn populate_textures_accumulates_params_and_tints() {
        let catalog = ParamCatalog::new([VisualParam {
            id: 112,
            name: "hair tint".into(),
            wearable: Some(WearableType::Hair),
            min_value: 0.0,
            max_value: 1.0,
            default_value: 0.0,
            color: Some(VisualColorParam {
                colors: vec![
                    Color4::new(1.0, 0.0, 0.0, 1.0),
                    Color4::new(0.0, 0.0, 1.0, 1.0),
                ],
                operation: ColorOperation::Blend,
            }),
            alpha: None,
        }]);

        let mut state = AppearanceState::default();
        let mut hair = WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Hair);
        let texture = Uuid::new_v4();
        hair.asset = Some(DecodedWearable {
            name: "hair".into(),
            params: BTreeMap::from([(112u32, 0.25f32)]),
            textures: BTreeMap::from([(4u32, texture), (5u32, bakes::DEFAULT_AVATAR_TEXTURE)]),
        });
        state.wearables.insert(hair);

        populate_textures(&mut state, &catalog);
        assert_eq!(state.visual_params.get(&112), Some(&0.25));
        // Quantized packed byte for 0.25 over 0..1.
        assert_eq!(state.packed_params, vec![64]);
        assert_eq!(state.textures[4].texture_id, texture);
        // The sentinel normalizes to zero.
        assert!(state.textures[5].texture_id.is_nil());
        // Hair bake slot (20) picked up the blended tint.
        let tint = state.textures[BakeLayer::Hair.texture_slot()].color;
        assert!((tint.r - 0.1875).abs() < 1e-4);
        assert!((tint.b - 0.0625).abs() < 1e-4);
        assert!((tint.a - 0.25).abs() < 1e-4);
    }

    #[test]
    fn texture_entry_lists_only_real_slots() {
        let mut textures = vec![TextureSlot::default(); AVATAR_TEXTURE_COUNT];
        let head = Uuid::new_v4();
        textures[8].texture_id = head;
        textures[9].texture_id = bakes::DEFAULT_AVATAR_TEXTURE;
        let entry = build_texture_entry(&textures);
        // Default UUID, count, then exactly one override for slot 8.
        assert_eq!(entry.len(), 16 + 1 + 17);
        assert_eq!(entry[16], 1);
        assert_eq!(entry[17], 8);
        assert_eq!(&entry[18..34], head.as_bytes());
    }
}
