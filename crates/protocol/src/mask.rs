//! Completion bitmask carried inside every envelope.
//!
//! Bit *i* is set once stage *i* has completed. The only way to change a mask
//! is [`CompletionMask::with`], which ORs a bit in; nothing clears a bit.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stage::StageId;

/// Positional record of which stages an envelope has passed through.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CompletionMask(u32);

impl CompletionMask {
    /// Mask with no stage completed.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wrap raw bits as received on the wire.
    ///
    /// Bits beyond the known stages are kept untouched so that they survive
    /// being carried forward.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, stage: StageId) -> bool {
        self.0 & stage.bit() != 0
    }

    /// Returns a new mask with `stage` marked complete.
    pub const fn with(self, stage: StageId) -> Self {
        Self(self.0 | stage.bit())
    }

    /// Every bit set in `other` is also set in `self`.
    pub const fn is_superset_of(self, other: CompletionMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Completed stages, in pipeline order.
    pub fn stages(self) -> impl Iterator<Item = StageId> {
        StageId::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl From<u32> for CompletionMask {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

impl fmt::Display for CompletionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#05b}", self.0)
    }
}
