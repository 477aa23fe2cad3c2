//! Tint derivation from visual color parameters: palette selection with
//! linear interpolation, and the Add/Multiply/Blend accumulator.

use crate::appearance::wearables::WearableType;

/// RGBA color, components in 0..=1 (unclamped during accumulation).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Color4 {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color4 {
    pub const ZERO: Color4 = Color4::new(0.0, 0.0, 0.0, 0.0);
    pub const WHITE: Color4 = Color4::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn lerp(from: Color4, to: Color4, t: f32) -> Color4 {
        Color4::new(
            from.r + (to.r - from.r) * t,
            from.g + (to.g - from.g) * t,
            from.b + (to.b - from.b) * t,
            from.a + (to.a - from.a) * t,
        )
    }

    fn add(self, other: Color4) -> Color4 {
        Color4::new(
            self.r + other.r,
            self.g + other.g,
            self.b + other.b,
            self.a + other.a,
        )
    }

    fn mul(self, other: Color4) -> Color4 {
        Color4::new(
            self.r * other.r,
            self.g * other.g,
            self.b * other.b,
            self.a * other.a,
        )
    }
}

/// How a color parameter folds into the accumulated tint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOperation {
    Add,
    Multiply,
    Blend,
}

/// Palette attached to one visual parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualColorParam {
    pub colors: Vec<Color4>,
    pub operation: ColorOperation,
}

const BREAKPOINT_EPSILON: f32 = 1e-5;

/// Resolves a palette against a parameter value. Single-entry palettes
/// are used directly; otherwise the palette spans `min..=max` in equal
/// steps and the value lands on or between breakpoints.
pub fn param_color(param: &VisualColorParam, min: f32, max: f32, value: f32) -> Color4 {
    let n = param.colors.len();
    match n {
        0 => Color4::ZERO,
        1 => param.colors[0],
        _ => {
            let step = (max - min) / (n as f32 - 1.0);
            let mut index = 0usize;
            let mut breakpoint = min;
            for i in 0..n {
                let candidate = min + i as f32 * step;
                if candidate <= value {
                    index = i;
                    breakpoint = candidate;
                } else {
                    break;
                }
            }
            if (value - breakpoint).abs() < BREAKPOINT_EPSILON || index == n - 1 {
                param.colors[index]
            } else {
                let fraction = (value - breakpoint) / step;
                Color4::lerp(param.colors[index], param.colors[index + 1], fraction)
            }
        }
    }
}

/// Folds a resolved color into the running tint.
pub fn apply_operation(
    accumulator: Color4,
    color: Color4,
    operation: ColorOperation,
    value: f32,
) -> Color4 {
    match operation {
        ColorOperation::Add => accumulator.add(color),
        ColorOperation::Multiply => accumulator.mul(color),
        ColorOperation::Blend => Color4::lerp(accumulator, color, value),
    }
}

/// Color-parameter IDs honored per wearable type. `None` means every
/// color param the wearable carries participates.
pub fn color_param_whitelist(wearable_type: WearableType) -> Option<&'static [u32]> {
    match wearable_type {
        WearableType::Tattoo => Some(&[1062, 1063, 1064]),
        WearableType::Jacket => Some(&[809, 810, 811]),
        WearableType::Hair => Some(&[112, 113, 114, 115]),
        WearableType::Skin => Some(&[108, 110, 111]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Color4, b: Color4) -> bool {
        (a.r - b.r).abs() < 1e-4
            && (a.g - b.g).abs() < 1e-4
            && (a.b - b.b).abs() < 1e-4
            && (a.a - b.a).abs() < 1e-4
    }

    #[test]
    fn single_entry_palette_is_used_directly() {
        let param = VisualColorParam {
            colors: vec![Color4::new(0.2, 0.4, 0.6, 1.0)],
            operation: ColorOperation::Add,
        };
        assert_eq!(param_color(&param, 0.0, 1.0, 0.77), Color4::new(0.2, 0.4, 0.6, 1.0));
    }

    #[test]
    fn two_entry_palette_interpolates() {
        let param = VisualColorParam {
            colors: vec![Color4::new(1.0, 0.0, 0.0, 1.0), Color4::new(0.0, 0.0, 1.0, 1.0)],
            operation: ColorOperation::Blend,
        };
        let resolved = param_color(&param, 0.0, 1.0, 0.25);
        assert!(close(resolved, Color4::new(0.75, 0.0, 0.25, 1.0)));
        // Exact breakpoints select the palette entry itself.
        assert_eq!(param_color(&param, 0.0, 1.0, 0.0), param.colors[0]);
        assert_eq!(param_color(&param, 0.0, 1.0, 1.0), param.colors[1]);
    }

    #[test]
    fn hair_blend_scenario() {
        // Hair palette red→blue, one Blend at 0.25 over a zero
        // accumulator: lerp(0, lerp(red, blue, .25), .25).
        let param = VisualColorParam {
            colors: vec![Color4::new(1.0, 0.0, 0.0, 1.0), Color4::new(0.0, 0.0, 1.0, 1.0)],
            operation: ColorOperation::Blend,
        };
        let resolved = param_color(&param, 0.0, 1.0, 0.25);
        let tint = apply_operation(Color4::ZERO, resolved, param.operation, 0.25);
        assert!(close(tint, Color4::new(0.1875, 0.0, 0.0625, 0.25)));
    }

    #[test]
    fn add_and_multiply_fold_componentwise() {
        let color = Color4::new(0.5, 0.25, 1.0, 1.0);
        let added = apply_operation(Color4::new(0.1, 0.1, 0.1, 0.0), color, ColorOperation::Add, 0.0);
        assert!(close(added, Color4::new(0.6, 0.35, 1.1, 1.0)));
        let multiplied =
            apply_operation(Color4::new(0.5, 0.5, 0.5, 1.0), color, ColorOperation::Multiply, 0.0);
        assert!(close(multiplied, Color4::new(0.25, 0.125, 0.5, 1.0)));
    }

    #[test]
    fn whitelists_are_exact() {
        assert_eq!(
            color_param_whitelist(WearableType::Tattoo),
            Some(&[1062, 1063, 1064][..])
        );
        assert_eq!(
            color_param_whitelist(WearableType::Hair),
            Some(&[112, 113, 114, 115][..])
        );
        assert_eq!(color_param_whitelist(WearableType::Shirt), None);
    }
}
