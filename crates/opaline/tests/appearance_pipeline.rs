//! Appearance pipeline end-to-end: stub asset/inventory/baker services,
//! a scripted simulator on a loopback socket, and a real circuit.

use bytes::Bytes;
use circuline::circuit::{Circuit, CircuitConfig, CircuitParams};
use circuline::consts::MAX_DECODED_SIZE;
use circuline::protocol::messages::{
    AgentSetAppearance, CachedTextureBlock, Message, PacketAck, RegionHandshake,
};
use circuline::protocol::{PacketHeader, acks, zerocode};
use opaline::appearance::bakes::{BakeLayer, bake_hash};
use opaline::appearance::params::ParamCatalog;
use opaline::appearance::wearables::WearableType;
use opaline::appearance::{AppearanceConfig, AppearanceEvent, AppearanceManager};
use opaline::services::{
    AssetService, AssetType, BakeJob, CofLink, CofLinkKind, CurrentOutfit, InventoryService,
    ObjectCache, ServiceError, TextureBaker,
};
use opaline_binary::io::BinaryWriter;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const WEARABLE_TEXT: &str = "LLWearable version 22\nStub Wearable\n\ttype 0\n\tparameters 0\n\ttextures 0\n";

struct StubAssets {
    image_requests: AtomicU32,
    uploads: AtomicU32,
}

impl StubAssets {
    fn new() -> Self {
        Self {
            image_requests: AtomicU32::new(0),
            uploads: AtomicU32::new(0),
        }
    }
}

impl AssetService for StubAssets {
    async fn request_asset(
        &self,
        _asset_id: Uuid,
        _asset_type: AssetType,
    ) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from_static(WEARABLE_TEXT.as_bytes()))
    }

    async fn request_image(&self, _texture_id: Uuid) -> Result<Bytes, ServiceError> {
        self.image_requests.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::from_static(b"raster"))
    }

    async fn upload_baked_texture(&self, _data: Bytes) -> Result<Uuid, ServiceError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(Uuid::new_v4())
    }
}

struct StubInventory {
    links: Vec<CofLink>,
}

impl InventoryService for StubInventory {
    async fn current_outfit(&self) -> Result<CurrentOutfit, ServiceError> {
        Ok(CurrentOutfit {
            version: 7,
            links: self.links.clone(),
        })
    }
}

struct StubBaker;

impl TextureBaker for StubBaker {
    fn bake(&self, _job: &BakeJob) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from_static(b"jp2"))
    }
}

fn body_part_links() -> Vec<CofLink> {
    WearableType::REQUIRED_BODY_PARTS
        .into_iter()
        .map(|wearable_type| CofLink {
            kind: CofLinkKind::Wearable,
            item_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            wearable_type: Some(wearable_type),
            attach_point: None,
        })
        .collect()
}

/// Scripted simulator: acks every reliable packet, answers the handshake
/// and cache checks, and forwards interesting messages to the test.
async fn run_sim(
    socket: UdpSocket,
    cache_hits: bool,
    forward: mpsc::UnboundedSender<Message>,
) {
    let mut buf = [0u8; 4096];
    let mut next_seq: u32 = 0;
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let data = &buf[..len];
        let Ok((header, body_start)) = PacketHeader::decode(data) else {
            continue;
        };
        let mut body = &data[body_start..];
        if header.has_appended_acks() {
            if let Some((stripped, _)) = acks::strip_acks(body) {
                body = stripped;
            }
        }
        let owned = if header.is_zerocoded() {
            match zerocode::zero_decode(body, MAX_DECODED_SIZE) {
                Ok(decoded) => decoded,
                Err(_) => continue,
            }
        } else {
            body.to_vec()
        };
        let Ok(message) = Message::decode(Bytes::from(owned)) else {
            continue;
        };

        let mut replies: Vec<Message> = Vec::new();
        if header.is_reliable() {
            replies.push(Message::PacketAck(PacketAck {
                ids: vec![header.sequence],
            }));
        }
        match &message {
            Message::UseCircuitCode(_) => {
                replies.push(Message::RegionHandshake(RegionHandshake {
                    region_flags: 0,
                    sim_access: 13,
                    sim_name: "Stub Region".to_string(),
                    region_id: Uuid::new_v4(),
                }));
            }
            Message::AgentCachedTexture(query) => {
                let blocks: Vec<CachedTextureBlock> = query
                    .blocks
                    .iter()
                    .map(|block| CachedTextureBlock {
                        id: if cache_hits { Uuid::new_v4() } else { Uuid::nil() },
                        texture_index: block.texture_index,
                    })
                    .collect();
                replies.push(Message::AgentCachedTextureResponse(
                    circuline::protocol::messages::AgentCachedTextureResponse {
                        agent_id: query.agent_id,
                        session_id: query.session_id,
                        serial_num: query.serial_num,
                        blocks,
                    },
                ));
            }
            _ => {}
        }
        let _ = forward.send(message);

        for reply in replies {
            next_seq += 1;
            let body = reply.encode().unwrap();
            let mut writer = BinaryWriter::new();
            PacketHeader::new(0, next_seq).encode(&mut writer).unwrap();
            writer.write_bytes(&body).unwrap();
            let _ = socket.send_to(&writer.freeze(), peer).await;
        }
    }
}

struct Harness {
    circuit: Arc<Circuit>,
    assets: Arc<StubAssets>,
    manager: AppearanceManager<StubAssets, StubInventory, StubBaker>,
    from_sim: mpsc::UnboundedReceiver<Message>,
}

async fn harness(cache_hits: bool) -> Harness {
    let sim_socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let sim_addr: SocketAddr = sim_socket.local_addr().unwrap();
    let (tx, from_sim) = mpsc::unbounded_channel();
    tokio::spawn(run_sim(sim_socket, cache_hits, tx));

    let cfg = CircuitConfig {
        network_tick: Duration::from_millis(25),
        send_pings: false,
        login_timeout: Duration::from_secs(5),
        ..CircuitConfig::default()
    };
    let circuit = Circuit::open(
        cfg,
        CircuitParams {
            remote: sim_addr,
            region_handle: 1,
            circuit_code: 99,
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        },
    )
    .await
    .unwrap();
    circuit.connect(false).await.unwrap();

    let assets = Arc::new(StubAssets::new());
    let manager = AppearanceManager::new(
        AppearanceConfig {
            rebake_delay: Duration::from_millis(100),
            wearable_timeout: Duration::from_secs(5),
            ..AppearanceConfig::default()
        },
        Arc::clone(&circuit),
        Arc::clone(&assets),
        Arc::new(StubInventory {
            links: body_part_links(),
        }),
        Arc::new(StubBaker),
        Arc::new(ParamCatalog::default()),
        Arc::new(ObjectCache::new()),
    );

    Harness {
        circuit,
        assets,
        manager,
        from_sim,
    }
}

async fn await_completion(harness: &mut Harness) -> bool {
    let mut events = harness.manager.subscribe();
    harness.manager.request_set_appearance(false);
    loop {
        let event = timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("pipeline never completed")
            .expect("event hub closed");
        if let AppearanceEvent::AppearanceSet { success } = event {
            return success;
        }
    }
}

async fn next_set_appearance(harness: &mut Harness) -> AgentSetAppearance {
    loop {
        let message = timeout(Duration::from_secs(5), harness.from_sim.recv())
            .await
            .expect("sim saw no AgentSetAppearance")
            .expect("sim channel closed");
        if let Message::AgentSetAppearance(set) = message {
            return set;
        }
    }
}

#[tokio::test]
async fn cache_hits_skip_every_bake_and_upload() {
    let mut harness = harness(true).await;
    assert!(await_completion(&mut harness).await);

    // Full cache coverage: nothing downloaded, nothing uploaded.
    assert_eq!(harness.assets.image_requests.load(Ordering::Relaxed), 0);
    assert_eq!(harness.assets.uploads.load(Ordering::Relaxed), 0);

    let set = next_set_appearance(&mut harness).await;
    assert_eq!(set.serial_num, 1);
    assert_eq!(set.wearable_data.len(), opaline::appearance::bakes::BAKE_COUNT);

    // The published cache IDs are the bake hashes of the current set.
    let state = harness.manager.state();
    for block in &set.wearable_data {
        let layer = BakeLayer::from_index(block.texture_index).unwrap();
        assert_eq!(block.id, bake_hash(layer, &state.wearables));
    }
    // No skirt worn: its hash is zero.
    let skirt = set
        .wearable_data
        .iter()
        .find(|b| b.texture_index == BakeLayer::Skirt as u8)
        .unwrap();
    assert!(skirt.id.is_nil());

    harness.manager.shutdown();
    harness.circuit.close(false).await;
}

#[tokio::test]
async fn cache_misses_bake_and_upload_each_populated_layer() {
    let mut harness = harness(false).await;
    assert!(await_completion(&mut harness).await);

    // Body parts populate head/upper/lower/eyes/hair; the skirt layer is
    // empty and never baked.
    assert_eq!(harness.assets.uploads.load(Ordering::Relaxed), 5);
    // Stub wearables carry no textures, so nothing was downloaded.
    assert_eq!(harness.assets.image_requests.load(Ordering::Relaxed), 0);

    let set = next_set_appearance(&mut harness).await;
    assert_eq!(set.serial_num, 1);

    harness.manager.shutdown();
    harness.circuit.close(false).await;
}

#[tokio::test]
async fn skirt_layer_is_never_queried_when_no_skirt_is_worn() {
    let mut harness = harness(true).await;
    assert!(await_completion(&mut harness).await);

    // Find the cache query the sim received and check the skirt layer
    // was absent from it.
    let mut query = None;
    while let Ok(message) = harness.from_sim.try_recv() {
        if let Message::AgentCachedTexture(q) = message {
            query = Some(q);
        }
    }
    let query = query.expect("sim never saw a cache query");
    assert_eq!(query.blocks.len(), 5);
    assert!(
        query
            .blocks
            .iter()
            .all(|b| b.texture_index != BakeLayer::Skirt as u8)
    );

    harness.manager.shutdown();
    harness.circuit.close(false).await;
}

#[tokio::test]
async fn concurrent_pipeline_requests_are_rejected_at_the_gate() {
    let mut harness = harness(true).await;
    let mut events = harness.manager.subscribe();

    harness.manager.request_set_appearance(false);
    // The second request hits the CAS gate and is dropped; only one
    // completion event may arrive.
    harness.manager.request_set_appearance(false);

    let mut completions = 0;
    while let Ok(Some(event)) = timeout(Duration::from_secs(8), events.recv()).await {
        if matches!(event, AppearanceEvent::AppearanceSet { .. }) {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    harness.manager.shutdown();
    harness.circuit.close(false).await;
}
