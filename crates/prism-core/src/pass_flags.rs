//! Frame pass selection.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

/// Set of passes to run for a camera in one frame.
///
/// Every flag occupies its own bit so that any subset can be expressed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassFlags(u32);

impl PassFlags {
    /// No passes.
    pub const NONE: Self = Self(0);
    /// Cascaded shadow depth pass.
    pub const SHADOW: Self = Self(1 << 0);
    /// Opaque scene geometry.
    pub const SCENE: Self = Self(1 << 1);
    /// Planar reflections. Reserved; the orchestrator does not render it yet.
    pub const REFLECTION: Self = Self(1 << 2);
    /// Lighting composite.
    pub const LIGHTING: Self = Self(1 << 3);
    /// Post-processing.
    pub const POST_PROCESS: Self = Self(1 << 4);
    /// Host GUI overlay.
    pub const GUI: Self = Self(1 << 5);

    /// Every pass the orchestrator knows how to run.
    pub const ALL: Self = Self(
        Self::SHADOW.0 | Self::SCENE.0 | Self::LIGHTING.0 | Self::POST_PROCESS.0 | Self::GUI.0,
    );

    /// Creates flags from raw bits, dropping unknown bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & (Self::ALL.0 | Self::REFLECTION.0))
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Sets or clears `other`.
    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl Default for PassFlags {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for PassFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PassFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PassFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for PassFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for PassFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PassFlags, &str); 6] = [
            (PassFlags::SHADOW, "SHADOW"),
            (PassFlags::SCENE, "SCENE"),
            (PassFlags::REFLECTION, "REFLECTION"),
            (PassFlags::LIGHTING, "LIGHTING"),
            (PassFlags::POST_PROCESS, "POST_PROCESS"),
            (PassFlags::GUI, "GUI"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "PassFlags(NONE)")
        } else {
            write!(f, "PassFlags({})", names.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_flags_do_not_overlap() {
        let flags = [
            PassFlags::SHADOW,
            PassFlags::SCENE,
            PassFlags::REFLECTION,
            PassFlags::LIGHTING,
            PassFlags::POST_PROCESS,
            PassFlags::GUI,
        ];
        for (i, a) in flags.iter().enumerate() {
            assert_eq!(a.bits().count_ones(), 1);
            for b in &flags[i + 1..] {
                assert!((*a & *b).is_empty(), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_set_and_contains() {
        let mut flags = PassFlags::SCENE | PassFlags::GUI;
        assert!(flags.contains(PassFlags::SCENE));
        assert!(!flags.contains(PassFlags::SHADOW));

        flags.set(PassFlags::SHADOW, true);
        flags.set(PassFlags::GUI, false);
        assert_eq!(flags, PassFlags::SCENE | PassFlags::SHADOW);
    }

    #[test]
    fn test_default_excludes_reserved_reflection() {
        assert!(!PassFlags::default().contains(PassFlags::REFLECTION));
        assert!(PassFlags::default().contains(PassFlags::SHADOW | PassFlags::SCENE));
    }

    #[test]
    fn test_serde_as_bits() {
        let json = serde_json::to_string(&(PassFlags::SCENE | PassFlags::GUI)).unwrap();
        assert_eq!(json, "34");
        let back: PassFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PassFlags::SCENE | PassFlags::GUI);
    }

    fn any_flag() -> impl Strategy<Value = PassFlags> {
        prop::sample::select(vec![
            PassFlags::SHADOW,
            PassFlags::SCENE,
            PassFlags::REFLECTION,
            PassFlags::LIGHTING,
            PassFlags::POST_PROCESS,
            PassFlags::GUI,
        ])
    }

    proptest! {
        #[test]
        fn prop_set_touches_only_its_flag(bits in any::<u32>(), flag in any_flag(), enabled: bool) {
            let before = PassFlags::from_bits_truncate(bits);
            let mut after = before;
            after.set(flag, enabled);
            prop_assert_eq!(after.contains(flag), enabled);
            prop_assert_eq!(after & !flag, before & !flag);
        }

        #[test]
        fn prop_serde_keeps_known_bits(bits in any::<u32>()) {
            let flags = PassFlags::from_bits_truncate(bits);
            let json = serde_json::to_string(&flags).unwrap();
            let back: PassFlags = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, flags);
            prop_assert_eq!(back.bits() & !(PassFlags::ALL | PassFlags::REFLECTION).bits(), 0);
        }
    }
}
