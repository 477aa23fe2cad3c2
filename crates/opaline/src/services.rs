//! Contracts for the external collaborators the appearance pipeline
//! leans on: the asset store, the inventory store, and the texture baker.
//! All are injected; nothing here talks to the network itself.

use crate::appearance::bakes::BakeLayer;
use crate::appearance::color::Color4;
use crate::appearance::wearables::WearableType;
use bytes::Bytes;
use log::warn;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("Asset {0} not found")]
    NotFound(Uuid),
    #[error("Request timed out")]
    Timeout,
    #[error("Service failure: {0}")]
    Failed(String),
}

/// Asset classes the appearance layer moves around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetType {
    Texture,
    Bodypart,
    Clothing,
}

impl AssetType {
    pub fn for_wearable(wearable_type: WearableType) -> AssetType {
        if wearable_type.is_body_part() {
            AssetType::Bodypart
        } else {
            AssetType::Clothing
        }
    }
}

/// Fetches and stores raw asset blobs by ID.
pub trait AssetService: Send + Sync + 'static {
    /// Wearable asset bytes (the text format decoded by the wearable
    /// decoder).
    fn request_asset(
        &self,
        asset_id: Uuid,
        asset_type: AssetType,
    ) -> impl Future<Output = Result<Bytes, ServiceError>> + Send;

    /// Raster bytes for one bake input texture.
    fn request_image(
        &self,
        texture_id: Uuid,
    ) -> impl Future<Output = Result<Bytes, ServiceError>> + Send;

    /// Uploads a baked JPEG-2000 blob, returning its new asset ID.
    fn upload_baked_texture(
        &self,
        data: Bytes,
    ) -> impl Future<Output = Result<Uuid, ServiceError>> + Send;
}

/// What a Current-Outfit-Folder link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CofLinkKind {
    Wearable,
    Attachment,
    Object,
}

/// One resolved COF link.
#[derive(Debug, Clone)]
pub struct CofLink {
    pub kind: CofLinkKind,
    /// The underlying item the link points to.
    pub item_id: Uuid,
    pub asset_id: Uuid,
    pub wearable_type: Option<WearableType>,
    pub attach_point: Option<u8>,
}

/// The Current Outfit Folder read through the inventory store.
#[derive(Debug, Clone)]
pub struct CurrentOutfit {
    pub version: i32,
    pub links: Vec<CofLink>,
}

pub trait InventoryService: Send + Sync + 'static {
    fn current_outfit(&self) -> impl Future<Output = Result<CurrentOutfit, ServiceError>> + Send;
}

/// Everything the compositor needs to produce one bake.
#[derive(Debug, Clone)]
pub struct BakeJob {
    pub layer: BakeLayer,
    /// Decoded input rasters, layering order preserved.
    pub textures: Vec<Bytes>,
    /// Alpha-mask directives gathered from visual params, `(param id,
    /// weight)` in application order.
    pub alpha_masks: Vec<(u32, f32)>,
    pub tint: Color4,
}

/// Pure compositor: N input textures + alpha masks + tint in, one
/// JPEG-2000 blob out. No network, no blocking.
pub trait TextureBaker: Send + Sync + 'static {
    fn bake(&self, job: &BakeJob) -> Result<Bytes, ServiceError>;
}

/// A primitive as the appearance layer sees it: enough to find our own
/// avatar and the attachments hanging off it.
#[derive(Debug, Clone)]
pub struct Primitive {
    pub local_id: u32,
    pub parent_id: u32,
    pub id: Uuid,
    /// `State` byte; attachment point for child prims of an avatar.
    pub state: u8,
    /// Raw name-value block text.
    pub name_values: String,
}

impl Primitive {
    /// Attachment point packed into the state byte.
    pub fn attachment_point(&self) -> u8 {
        ((self.state & 0xF0) >> 4) | ((self.state & 0x0F) << 4)
    }

    /// Extracts the `AttachItemID` name-value, the inventory item this
    /// attachment came from.
    pub fn attach_item_id(&self) -> Option<Uuid> {
        for line in self.name_values.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("AttachItemID") {
                // Layout: AttachItemID STRING RW SV <uuid>
                if let Some(raw) = fields.nth(3) {
                    match Uuid::parse_str(raw) {
                        Ok(id) => return Some(id),
                        Err(_) => {
                            warn!("Unparseable AttachItemID name-value: {}", line);
                            return None;
                        }
                    }
                }
            }
        }
        None
    }
}

/// Minimal live-object view: tracks primitives so the pipeline can gather
/// attachments and wait for its own avatar to exist.
#[derive(Debug, Default)]
pub struct ObjectCache {
    prims: Mutex<HashMap<u32, Primitive>>,
    self_local_id: AtomicU32,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, prim: Primitive) {
        self.prims.lock().unwrap().insert(prim.local_id, prim);
    }

    pub fn remove(&self, local_id: u32) {
        self.prims.lock().unwrap().remove(&local_id);
    }

    /// Records which primitive is our own avatar.
    pub fn set_self_local_id(&self, local_id: u32) {
        self.self_local_id.store(local_id, Ordering::Release);
    }

    pub fn self_present(&self) -> bool {
        let local_id = self.self_local_id.load(Ordering::Acquire);
        local_id != 0 && self.prims.lock().unwrap().contains_key(&local_id)
    }

    /// Attachments on our avatar: `inventory item ID → attachment point`.
    pub fn gather_attachments(&self) -> HashMap<Uuid, u8> {
        let self_id = self.self_local_id.load(Ordering::Acquire);
        let prims = self.prims.lock().unwrap();
        let mut attachments = HashMap::new();
        if self_id == 0 {
            return attachments;
        }
        for prim in prims.values() {
            if prim.parent_id != self_id {
                continue;
            }
            if let Some(item_id) = prim.attach_item_id() {
                attachments.insert(item_id, prim.attachment_point());
            }
        }
        attachments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prim(local_id: u32, parent_id: u32, item: Option<Uuid>, state: u8) -> Primitive {
        Primitive {
            local_id,
            parent_id,
            id: Uuid::new_v4(),
            state,
            name_values: match item {
                Some(id) => format!("AttachItemID STRING RW SV {}", id),
                None => String::new(),
            },
        }
    }

    #[test]
    fn attachment_point_unpacks_the_state_byte() {
        let p = prim(2, 1, None, 0x9A);
        assert_eq!(p.attachment_point(), 0xA9);
    }

    #[test]
    fn gathers_only_children_of_self() {
        let cache = ObjectCache::new();
        cache.set_self_local_id(100);
        cache.upsert(prim(100, 0, None, 0));
        let worn = Uuid::new_v4();
        cache.upsert(prim(101, 100, Some(worn), 0x30));
        cache.upsert(prim(102, 999, Some(Uuid::new_v4()), 0x30));
        cache.upsert(prim(103, 100, None, 0x30)); // no AttachItemID

        let attachments = cache.gather_attachments();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments.get(&worn), Some(&0x03));
    }

    #[test]
    fn self_present_requires_the_avatar_prim() {
        let cache = ObjectCache::new();
        assert!(!cache.self_present());
        cache.set_self_local_id(7);
        assert!(!cache.self_present());
        cache.upsert(prim(7, 0, None, 0));
        assert!(cache.self_present());
    }
}
