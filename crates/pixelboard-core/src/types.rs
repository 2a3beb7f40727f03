//! Identifiers and canvas geometry.

use pixelboard_protocol::ImageHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::num::{NonZeroU64, ParseIntError};
use std::str::FromStr;

/// Opaque canvas identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanvasId(pub u64);

impl fmt::Display for CanvasId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CanvasId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(CanvasId)
    }
}

impl From<u64> for CanvasId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A user credited with edits.
///
/// Zero marks a pixel that was never edited, so it is not a valid user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(NonZeroU64);

impl UserId {
    /// Returns `None` for zero.
    #[must_use]
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Upper and lower 32-bit halves, as stored in the attribution log.
    #[must_use]
    pub fn split(self) -> (u32, u32) {
        let id = self.get();
        ((id >> 32) as u32, id as u32)
    }

    /// Rebuild from stored halves. Both halves zero means "no owner".
    #[must_use]
    pub fn from_halves(high: u32, low: u32) -> Option<Self> {
        Self::new((u64::from(high) << 32) | u64::from(low))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an edit was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The credential edited this canvas too recently.
    OnCooldown,
    /// The color index is not in the canvas palette.
    OutOfRange,
    /// The coordinates are outside the canvas.
    OutOfBounds,
}

impl RejectReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::OnCooldown => "on_cooldown",
            RejectReason::OutOfRange => "out_of_range",
            RejectReason::OutOfBounds => "out_of_bounds",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of submitting an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditOutcome {
    /// Committed and published.
    Accepted,
    /// Dropped without touching the canvas.
    Rejected(RejectReason),
}

impl EditOutcome {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        matches!(self, EditOutcome::Accepted)
    }

    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EditOutcome::Accepted => "accepted",
            EditOutcome::Rejected(reason) => reason.as_str(),
        }
    }
}

/// Canvas dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u16,
    pub height: u16,
}

impl Dimensions {
    #[must_use]
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn header(self) -> ImageHeader {
        ImageHeader::new(self.width, self.height)
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

/// Dimensions for every canvas: one default plus per-canvas overrides.
#[derive(Debug, Clone, Default)]
pub struct CanvasGeometry {
    default: Dimensions,
    overrides: HashMap<CanvasId, Dimensions>,
}

impl CanvasGeometry {
    /// Every canvas has the same dimensions.
    #[must_use]
    pub fn uniform(default: Dimensions) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Give one canvas its own dimensions.
    #[must_use]
    pub fn with_override(mut self, canvas: CanvasId, dimensions: Dimensions) -> Self {
        self.overrides.insert(canvas, dimensions);
        self
    }

    /// Dimensions of `canvas`.
    #[must_use]
    pub fn dimensions(&self, canvas: CanvasId) -> Dimensions {
        self.overrides.get(&canvas).copied().unwrap_or(self.default)
    }

    /// Image header of `canvas`.
    #[must_use]
    pub fn header(&self, canvas: CanvasId) -> ImageHeader {
        self.dimensions(canvas).header()
    }
}
