//! Bake layers, the wearable-bake map, the XOR-fold cache hashes and the
//! agent size derivation.

use crate::appearance::wearables::{WearableSet, WearableType};
use opaline_binary::io::Vector3;
use std::collections::BTreeMap;
use uuid::{Uuid, uuid};

/// The six composite layers the simulator caches by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BakeLayer {
    Head = 0,
    UpperBody = 1,
    LowerBody = 2,
    Eyes = 3,
    Skirt = 4,
    Hair = 5,
}

pub const BAKE_COUNT: usize = 6;

/// Avatar texture slots (bake outputs land in a fixed subset of these).
pub const AVATAR_TEXTURE_COUNT: usize = 45;

/// "No texture here" sentinel; normalized to zero throughout the
/// appearance core.
pub const DEFAULT_AVATAR_TEXTURE: Uuid = uuid!("c228d1cf-4b5d-4ba8-84f4-899a0796aa97");

impl BakeLayer {
    pub const ALL: [BakeLayer; BAKE_COUNT] = [
        BakeLayer::Head,
        BakeLayer::UpperBody,
        BakeLayer::LowerBody,
        BakeLayer::Eyes,
        BakeLayer::Skirt,
        BakeLayer::Hair,
    ];

    pub fn from_index(index: u8) -> Option<BakeLayer> {
        BakeLayer::ALL.get(index as usize).copied()
    }

    /// Baked texture-entry slot this layer publishes into.
    pub fn texture_slot(self) -> usize {
        const SLOTS: [usize; BAKE_COUNT] = [8, 9, 10, 11, 19, 20];
        SLOTS[self as usize]
    }

    /// The wearable-bake map row: which slots feed this layer.
    pub fn wearables(self) -> &'static [WearableType] {
        match self {
            BakeLayer::Head => &[
                WearableType::Shape,
                WearableType::Skin,
                WearableType::Tattoo,
                WearableType::Hair,
                WearableType::Alpha,
            ],
            BakeLayer::UpperBody => &[
                WearableType::Shape,
                WearableType::Skin,
                WearableType::Shirt,
                WearableType::Jacket,
                WearableType::Gloves,
                WearableType::Undershirt,
                WearableType::Tattoo,
                WearableType::Alpha,
            ],
            BakeLayer::LowerBody => &[
                WearableType::Shape,
                WearableType::Skin,
                WearableType::Pants,
                WearableType::Shoes,
                WearableType::Socks,
                WearableType::Jacket,
                WearableType::Underpants,
                WearableType::Tattoo,
                WearableType::Alpha,
            ],
            BakeLayer::Eyes => &[WearableType::Eyes, WearableType::Alpha],
            BakeLayer::Skirt => &[WearableType::Skirt],
            BakeLayer::Hair => &[WearableType::Hair, WearableType::Alpha],
        }
    }

    /// Per-layer secret folded into every non-empty cache hash.
    pub fn magic(self) -> Uuid {
        const MAGIC: [Uuid; BAKE_COUNT] = [
            uuid!("18ded8d6-bcfc-e415-8539-944c0f5ea7a6"),
            uuid!("338c29e3-3024-4dbb-998d-7c04cf4fa88f"),
            uuid!("91b4a2c7-1b1a-ba16-9a16-1f8f8dcc1c3f"),
            uuid!("b2cf28af-b840-1071-3c6a-78085d8128b5"),
            uuid!("ea800387-ea1a-14e0-56cb-24f2022f969a"),
            uuid!("0af1ef7c-ad24-11dd-8790-001f5bf833e8"),
        ];
        MAGIC[self as usize]
    }
}

pub fn xor_uuids(a: Uuid, b: Uuid) -> Uuid {
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.as_bytes()[i] ^ b.as_bytes()[i];
    }
    Uuid::from_bytes(out)
}

/// Cache key for one layer: the XOR fold of every worn asset ID the
/// layer's bake-map row touches, in insertion order, then the layer
/// MAGIC. Zero means "this bake is empty" and no cache query is made.
pub fn bake_hash(layer: BakeLayer, wearables: &WearableSet) -> Uuid {
    let mut hash = Uuid::nil();
    for slot in layer.wearables() {
        for worn in wearables.of_type(*slot) {
            hash = xor_uuids(hash, worn.asset_id);
        }
    }
    if !hash.is_nil() {
        hash = xor_uuids(hash, layer.magic());
    }
    hash
}

/// Whether an ID names an actual texture (not zero, not the default
/// sentinel).
pub fn is_real_texture(id: Uuid) -> bool {
    !id.is_nil() && id != DEFAULT_AVATAR_TEXTURE
}

// Visual params feeding the height term.
const VP_HEIGHT: u32 = 33;
const VP_HEEL_HEIGHT: u32 = 198;
const VP_PLATFORM_HEIGHT: u32 = 503;
const VP_HEAD_SIZE: u32 = 682;
const VP_LEG_LENGTH: u32 = 692;
const VP_NECK_LENGTH: u32 = 756;
const VP_HIP_LENGTH: u32 = 842;

/// Avatar bounding-box height from the current parameter settings.
/// Missing parameters contribute zero.
pub fn agent_height(params: &BTreeMap<u32, f32>) -> f32 {
    let vp = |id: u32| params.get(&id).copied().unwrap_or(0.0);
    1.706
        + 0.1918 * vp(VP_LEG_LENGTH)
        + 0.0375 * vp(VP_HIP_LENGTH)
        + 0.12022 * vp(VP_HEIGHT)
        + 0.01117 * vp(VP_HEAD_SIZE)
        + 0.038 * vp(VP_NECK_LENGTH)
        + 0.08 * vp(VP_HEEL_HEIGHT)
        + 0.07 * vp(VP_PLATFORM_HEIGHT)
}

/// The size block of AgentSetAppearance.
pub fn agent_size(params: &BTreeMap<u32, f32>) -> Vector3 {
    Vector3::new(0.45, 0.6, agent_height(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::wearables::WearableData;

    fn worn(asset_id: Uuid, wearable_type: WearableType) -> WearableData {
        WearableData::new(Uuid::new_v4(), asset_id, wearable_type)
    }

    #[test]
    fn hash_is_the_fold_of_worn_assets_and_magic() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut set = WearableSet::new();
        set.insert(worn(a, WearableType::Shape));
        set.insert(worn(b, WearableType::Skin));
        set.insert(worn(c, WearableType::Tattoo));

        let expected = xor_uuids(
            xor_uuids(xor_uuids(a, b), c),
            BakeLayer::Head.magic(),
        );
        assert_eq!(bake_hash(BakeLayer::Head, &set), expected);
    }

    #[test]
    fn hash_ignores_wearables_outside_the_layer_row() {
        let mut set = WearableSet::new();
        set.insert(worn(Uuid::new_v4(), WearableType::Eyes));
        let mut with_pants = set.clone();
        with_pants.insert(worn(Uuid::new_v4(), WearableType::Pants));
        // Pants are not part of the eyes row.
        assert_eq!(
            bake_hash(BakeLayer::Eyes, &set),
            bake_hash(BakeLayer::Eyes, &with_pants)
        );
    }

    #[test]
    fn empty_layer_hashes_to_zero() {
        let set = WearableSet::new();
        assert!(bake_hash(BakeLayer::Skirt, &set).is_nil());
        // The magic is never folded into an empty hash.
        let mut with_skirt = WearableSet::new();
        let skirt = Uuid::new_v4();
        with_skirt.insert(worn(skirt, WearableType::Skirt));
        assert_eq!(
            bake_hash(BakeLayer::Skirt, &with_skirt),
            xor_uuids(skirt, BakeLayer::Skirt.magic())
        );
    }

    #[test]
    fn paired_duplicates_cancel_out() {
        // XOR folding means the same asset worn twice vanishes from the
        // hash; the layer then reads as empty.
        let asset = Uuid::new_v4();
        let mut set = WearableSet::new();
        set.insert(worn(asset, WearableType::Tattoo));
        set.insert(worn(asset, WearableType::Tattoo));
        assert!(bake_hash(BakeLayer::Head, &set).is_nil());
    }

    #[test]
    fn sentinel_is_not_a_real_texture() {
        assert!(!is_real_texture(Uuid::nil()));
        assert!(!is_real_texture(DEFAULT_AVATAR_TEXTURE));
        assert!(is_real_texture(Uuid::new_v4()));
    }

    #[test]
    fn default_agent_height_is_about_standing() {
        let params = BTreeMap::new();
        let size = agent_size(&params);
        assert_eq!(size.x, 0.45);
        assert_eq!(size.y, 0.6);
        assert!((size.z - 1.706).abs() < 1e-6);
    }

    #[test]
    fn height_terms_use_their_mapped_params() {
        let mut params = BTreeMap::new();
        params.insert(33, 1.0);
        params.insert(198, 1.0);
        let expected = 1.706 + 0.12022 + 0.08;
        assert!((agent_height(&params) - expected).abs() < 1e-5);
    }

    #[test]
    fn bake_slots_map_to_texture_entry_indices() {
        let slots: Vec<usize> = BakeLayer::ALL.iter().map(|l| l.texture_slot()).collect();
        assert_eq!(slots, vec![8, 9, 10, 11, 19, 20]);
    }
}
