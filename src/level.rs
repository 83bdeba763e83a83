// SPDX-License-Identifier: Apache-2.0 OR MIT
// Severity levels and the per-site level mask

use serde::{Deserialize, Serialize};

/// Log severity levels (0-4, lower is more severe)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Unrecoverable conditions
    Critical = 0,
    /// Operation failed
    Error = 1,
    /// Suspicious but survivable conditions
    Warning = 2,
    /// Normal operational messages
    Info = 3,
    /// High-volume diagnostic detail
    Verbose = 4,
}

impl Level {
    /// Number of distinct levels.
    pub const COUNT: usize = 5;

    /// All levels, most severe first.
    pub const ALL: [Level; Level::COUNT] = [
        Level::Critical,
        Level::Error,
        Level::Warning,
        Level::Info,
        Level::Verbose,
    ];

    /// Get level as u8 (0-4)
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Get level name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Critical => "CRITICAL",
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Verbose => "VERBOSE",
        }
    }

    /// Create from u8 value (returns None if out of range)
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Level::Critical),
            1 => Some(Level::Error),
            2 => Some(Level::Warning),
            3 => Some(Level::Info),
            4 => Some(Level::Verbose),
            _ => None,
        }
    }

    /// Render an arbitrary raw byte as a level label.
    ///
    /// Out-of-range values render as `<invalid Level(n)>` instead of
    /// failing, so stored bytes can always be serialized.
    pub const fn label(value: u8) -> LevelLabel {
        LevelLabel(value)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display adapter for possibly-invalid raw level bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelLabel(u8);

impl std::fmt::Display for LevelLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match Level::from_u8(self.0) {
            Some(level) => f.write_str(level.as_str()),
            None => write!(f, "<invalid Level({})>", self.0),
        }
    }
}

/// Bit-set over the five severity levels.
///
/// Stored as one byte so call sites can hold it in an `AtomicU8` and
/// test membership with a single mask instruction on the fast path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelSet(u8);

const ALL_BITS: u8 = (1 << Level::COUNT) - 1;

impl LevelSet {
    /// Set with no levels enabled.
    pub const fn empty() -> Self {
        LevelSet(0)
    }

    /// Set with every level enabled.
    pub const fn all() -> Self {
        LevelSet(ALL_BITS)
    }

    /// Set containing exactly one level.
    pub const fn only(level: Level) -> Self {
        LevelSet(1 << level.as_u8())
    }

    /// Copy of this set with `level` enabled.
    pub const fn with(self, level: Level) -> Self {
        LevelSet(self.0 | (1 << level.as_u8()))
    }

    /// Copy of this set with `level` disabled.
    pub const fn without(self, level: Level) -> Self {
        LevelSet(self.0 & !(1 << level.as_u8()))
    }

    /// Test membership.
    #[inline]
    pub const fn contains(self, level: Level) -> bool {
        self.0 & (1 << level.as_u8()) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bits, suitable for atomic storage.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from raw bits; out-of-range bits are masked off.
    pub const fn from_bits(bits: u8) -> Self {
        LevelSet(bits & ALL_BITS)
    }

    /// Build a set from a slice of levels.
    pub fn of(levels: &[Level]) -> Self {
        levels
            .iter()
            .fold(LevelSet::empty(), |set, &level| set.with(level))
    }
}

impl Default for LevelSet {
    fn default() -> Self {
        LevelSet::all()
    }
}

impl std::fmt::Debug for LevelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        for level in Level::ALL {
            if self.contains(level) {
                set.entry(&level);
            }
        }
        set.finish()
    }
}
