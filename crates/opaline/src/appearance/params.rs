//! Visual-parameter descriptions and the catalog the embedding
//! application provides. The catalog itself is a static table outside
//! this crate; the appearance core only walks it.

use crate::appearance::color::VisualColorParam;
use crate::appearance::wearables::WearableType;
use std::collections::BTreeMap;

/// Alpha-mask directive attached to a visual parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualAlphaParam {
    pub tga_file: String,
    pub skip_if_zero: bool,
    pub multiply_blend: bool,
    pub domain: f32,
}

/// One entry of the visual-parameter table.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualParam {
    pub id: u32,
    pub name: String,
    pub wearable: Option<WearableType>,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
    pub color: Option<VisualColorParam>,
    pub alpha: Option<VisualAlphaParam>,
}

impl VisualParam {
    /// Packs a float setting into the single wire byte.
    pub fn quantize(&self, value: f32) -> u8 {
        let span = self.max_value - self.min_value;
        if span <= f32::EPSILON {
            return 0;
        }
        let normalized = ((value - self.min_value) / span).clamp(0.0, 1.0);
        (normalized * 255.0).round() as u8
    }
}

/// Lookup table over the full parameter set, ordered by ID.
#[derive(Debug, Default)]
pub struct ParamCatalog {
    by_id: BTreeMap<u32, VisualParam>,
}

impl ParamCatalog {
    pub fn new(params: impl IntoIterator<Item = VisualParam>) -> Self {
        Self {
            by_id: params.into_iter().map(|p| (p.id, p)).collect(),
        }
    }

    pub fn get(&self, id: u32) -> Option<&VisualParam> {
        self.by_id.get(&id)
    }

    /// Every parameter, ascending by ID (the wire packing order).
    pub fn iter(&self) -> impl Iterator<Item = &VisualParam> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
