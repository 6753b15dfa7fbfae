// Normalized box -> screen pixel mapping.
use serde::{Deserialize, Serialize};

use crate::agent_engine::state::Factors;

/// A screen-space point. `None` components mean "do not move the pointer".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: Option<f64>,
    pub y: Option<f64>,
}

impl ScreenPoint {
    pub const NONE: ScreenPoint = ScreenPoint { x: None, y: None };

    pub fn resolved(&self) -> Option<(f64, f64)> {
        Some((self.x?, self.y?))
    }

    /// Apply a device-pixel-ratio correction.
    pub fn scaled(self, factor: f64) -> ScreenPoint {
        ScreenPoint {
            x: self.x.map(|x| x * factor),
            y: self.y.map(|y| y * factor),
        }
    }
}

/// Parse `"[x1,y1,x2,y2]"` or `"[x,y]"` (normalized to 0..1).
/// A point duplicates into a degenerate box.
pub fn parse_normalized_box(box_str: &str) -> Option<[f64; 4]> {
    let inner = box_str
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    if inner.trim().is_empty() {
        return None;
    }

    let nums = inner
        .split(',')
        .map(|s| s.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<f64>>>()?;

    match nums.as_slice() {
        [x, y] => Some([*x, *y, *x, *y]),
        [x1, y1, x2, y2] => Some([*x1, *y1, *x2, *y2]),
        _ => None,
    }
}

/// Map a normalized box to the centre pixel on a `screen_width`×`screen_height`
/// screen, quantized to the model's factor grid.
pub fn box_to_screen_coords(
    box_str: &str,
    screen_width: u32,
    screen_height: u32,
    factors: Factors,
) -> ScreenPoint {
    let Some([x1, y1, x2, y2]) = parse_normalized_box(box_str) else {
        return ScreenPoint::NONE;
    };

    let quantize = |mid: f64, dim: u32, factor: f64| (mid * f64::from(dim) * factor).round() / factor;

    ScreenPoint {
        x: Some(quantize((x1 + x2) / 2.0, screen_width, factors.width())),
        y: Some(quantize((y1 + y2) / 2.0, screen_height, factors.height())),
    }
}
