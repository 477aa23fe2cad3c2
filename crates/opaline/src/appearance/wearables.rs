//! The wearable model: slot types, the worn-item multi-map, and the
//! decoder for the text-format wearable asset.

use crate::error::AppearanceError;
use crate::services::AssetType;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Primary wearable slots. The first four are body parts and can never
/// be absent from a complete outfit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum WearableType {
    Shape = 0,
    Skin = 1,
    Hair = 2,
    Eyes = 3,
    Shirt = 4,
    Pants = 5,
    Shoes = 6,
    Socks = 7,
    Jacket = 8,
    Gloves = 9,
    Undershirt = 10,
    Underpants = 11,
    Skirt = 12,
    Alpha = 13,
    Tattoo = 14,
    Physics = 15,
}

/// Slots in an AgentIsNowWearing snapshot.
pub const WEARABLE_SLOT_COUNT: usize = 16;

impl WearableType {
    pub const ALL: [WearableType; WEARABLE_SLOT_COUNT] = [
        WearableType::Shape,
        WearableType::Skin,
        WearableType::Hair,
        WearableType::Eyes,
        WearableType::Shirt,
        WearableType::Pants,
        WearableType::Shoes,
        WearableType::Socks,
        WearableType::Jacket,
        WearableType::Gloves,
        WearableType::Undershirt,
        WearableType::Underpants,
        WearableType::Skirt,
        WearableType::Alpha,
        WearableType::Tattoo,
        WearableType::Physics,
    ];

    pub const REQUIRED_BODY_PARTS: [WearableType; 4] = [
        WearableType::Shape,
        WearableType::Skin,
        WearableType::Eyes,
        WearableType::Hair,
    ];

    pub fn from_u8(value: u8) -> Option<WearableType> {
        WearableType::ALL.get(value as usize).copied()
    }

    pub fn is_body_part(self) -> bool {
        matches!(
            self,
            WearableType::Shape | WearableType::Skin | WearableType::Hair | WearableType::Eyes
        )
    }
}

/// A decoded wearable asset: its visual-parameter settings and the
/// texture IDs it pins onto avatar texture slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedWearable {
    pub name: String,
    pub params: BTreeMap<u32, f32>,
    pub textures: BTreeMap<u32, Uuid>,
}

/// One worn item. `asset` stays `None` until the asset service has
/// delivered and the decoder has run.
#[derive(Debug, Clone)]
pub struct WearableData {
    pub item_id: Uuid,
    pub asset_id: Uuid,
    pub wearable_type: WearableType,
    pub asset_type: AssetType,
    pub asset: Option<DecodedWearable>,
}

impl WearableData {
    pub fn new(item_id: Uuid, asset_id: Uuid, wearable_type: WearableType) -> Self {
        Self {
            item_id,
            asset_id,
            wearable_type,
            asset_type: AssetType::for_wearable(wearable_type),
            asset: None,
        }
    }
}

/// Everything currently worn. A slot may hold several items; insertion
/// order within a slot is the layering order and is preserved.
#[derive(Debug, Clone, Default)]
pub struct WearableSet {
    map: BTreeMap<WearableType, Vec<WearableData>>,
}

impl WearableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, wearable: WearableData) {
        self.map
            .entry(wearable.wearable_type)
            .or_default()
            .push(wearable);
    }

    /// Drops every entry of one slot.
    pub fn clear_type(&mut self, wearable_type: WearableType) {
        self.map.remove(&wearable_type);
    }

    /// Removes one item wherever it is worn. Returns whether anything
    /// changed.
    pub fn remove_item(&mut self, item_id: Uuid) -> bool {
        let mut changed = false;
        self.map.retain(|_, items| {
            let before = items.len();
            items.retain(|w| w.item_id != item_id);
            changed |= items.len() != before;
            !items.is_empty()
        });
        changed
    }

    pub fn of_type(&self, wearable_type: WearableType) -> &[WearableData] {
        self.map
            .get(&wearable_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &WearableData> {
        self.map.values().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WearableData> {
        self.map.values_mut().flatten()
    }

    pub fn contains_item(&self, item_id: Uuid) -> bool {
        self.iter().any(|w| w.item_id == item_id)
    }

    /// First item worn in a slot, for the fixed-width AgentIsNowWearing
    /// snapshot. Zero when the slot is empty.
    pub fn first_item_for_slot(&self, wearable_type: WearableType) -> Uuid {
        self.of_type(wearable_type)
            .first()
            .map(|w| w.item_id)
            .unwrap_or_else(Uuid::nil)
    }

    pub fn missing_body_part(&self) -> Option<WearableType> {
        WearableType::REQUIRED_BODY_PARTS
            .into_iter()
            .find(|&part| self.of_type(part).is_empty())
    }

    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Decodes the text-format wearable asset into parameter and texture
/// tables. The permission and sale blocks are skipped; only the
/// `parameters` and `textures` sections matter to the appearance core.
pub fn decode_wearable(data: &[u8]) -> Result<DecodedWearable, AppearanceError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| AppearanceError::WearableParse(format!("not UTF-8: {}", e)))?;
    let mut lines = text.lines();

    let header = lines
        .next()
        .ok_or_else(|| AppearanceError::WearableParse("empty asset".into()))?;
    if !header.trim_start().starts_with("LLWearable") {
        return Err(AppearanceError::WearableParse(format!(
            "unexpected header {:?}",
            header
        )));
    }
    let name = lines.next().unwrap_or("").trim().to_string();

    let mut decoded = DecodedWearable {
        name,
        ..Default::default()
    };

    let mut remaining_params = 0usize;
    let mut remaining_textures = 0usize;
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line == "{" || line == "}" {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };

        if remaining_params > 0 {
            remaining_params -= 1;
            let Some(raw_value) = fields.next() else {
                continue;
            };
            let Ok(id) = first.parse::<i64>() else {
                continue;
            };
            // Some exporters write decimal commas.
            let value: f32 = raw_value.replace(',', ".").parse().unwrap_or(0.0);
            decoded.params.insert(id as u32, value);
            continue;
        }
        if remaining_textures > 0 {
            remaining_textures -= 1;
            let (Ok(index), Some(raw_id)) = (first.parse::<u32>(), fields.next()) else {
                continue;
            };
            if let Ok(texture_id) = Uuid::parse_str(raw_id) {
                decoded.textures.insert(index, texture_id);
            }
            continue;
        }

        match first {
            "parameters" => {
                remaining_params = fields
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
            }
            "textures" => {
                remaining_textures = fields
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
            }
            _ => {} // permissions, sale_info, type and friends
        }
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "LLWearable version 22\nRuth Skin\n\n\tpermissions 0\n\t{\n\t\tbase_mask\t7fffffff\n\t\towner_mask\t7fffffff\n\t}\n\tsale_info\t0\n\t{\n\t\tsale_type\tnot\n\t\tsale_price\t10\n\t}\n\ttype 1\n\tparameters 3\n\t108 .4\n\t110 0\n\t111 ,5\n\ttextures 2\n\t0 5a30ec94-48aa-4d46-ab05-b8a50fb801ad\n\t7 9e3b5c1e-4b71-4d3c-8af2-d3b0f94e2c11\n";

    #[test]
    fn decodes_parameters_and_textures() {
        let decoded = decode_wearable(SAMPLE.as_bytes()).unwrap();
        assert_eq!(decoded.name, "Ruth Skin");
        assert_eq!(decoded.params.len(), 3);
        assert!((decoded.params[&108] - 0.4).abs() < 1e-6);
        assert_eq!(decoded.params[&110], 0.0);
        assert!((decoded.params[&111] - 0.5).abs() < 1e-6);
        assert_eq!(decoded.textures.len(), 2);
        assert_eq!(
            decoded.textures[&0],
            Uuid::parse_str("5a30ec94-48aa-4d46-ab05-b8a50fb801ad").unwrap()
        );
    }

    #[test]
    fn rejects_non_wearable_data() {
        assert!(decode_wearable(b"JPEG2000 something").is_err());
        assert!(decode_wearable(&[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn insertion_order_within_a_slot_is_preserved() {
        let mut set = WearableSet::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        set.insert(WearableData::new(first, Uuid::new_v4(), WearableType::Tattoo));
        set.insert(WearableData::new(second, Uuid::new_v4(), WearableType::Tattoo));
        let worn: Vec<Uuid> = set
            .of_type(WearableType::Tattoo)
            .iter()
            .map(|w| w.item_id)
            .collect();
        assert_eq!(worn, vec![first, second]);
        assert_eq!(set.first_item_for_slot(WearableType::Tattoo), first);
    }

    #[test]
    fn missing_body_part_is_reported() {
        let mut set = WearableSet::new();
        for part in [WearableType::Shape, WearableType::Skin, WearableType::Eyes] {
            set.insert(WearableData::new(Uuid::new_v4(), Uuid::new_v4(), part));
        }
        assert_eq!(set.missing_body_part(), Some(WearableType::Hair));
        set.insert(WearableData::new(Uuid::new_v4(), Uuid::new_v4(), WearableType::Hair));
        assert_eq!(set.missing_body_part(), None);
    }

    #[test]
    fn remove_item_reports_changes() {
        let mut set = WearableSet::new();
        let item = Uuid::new_v4();
        set.insert(WearableData::new(item, Uuid::new_v4(), WearableType::Shirt));
        assert!(set.remove_item(item));
        assert!(!set.remove_item(item));
        assert!(set.of_type(WearableType::Shirt).is_empty());
    }
}
