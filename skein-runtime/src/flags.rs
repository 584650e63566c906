//! # Runtime Flags
//!
//! Per-fiber bitset controlling interruptibility and cooperative yielding.
//!
//! Flags are immutable values. A region that changes them applies a
//! [`RuntimeFlagsPatch`] on entry and pushes a revert frame restoring the
//! previous flags on exit, so nesting never needs mutable globals.

use std::fmt;

/// Immutable set of runtime flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFlags(u32);

impl RuntimeFlags {
    /// No flags set.
    pub const NONE: RuntimeFlags = RuntimeFlags(0);
    /// The fiber may be interrupted.
    pub const INTERRUPTION: RuntimeFlags = RuntimeFlags(1 << 0);
    /// The fiber yields after a bounded number of steps.
    pub const COOPERATIVE_YIELDING: RuntimeFlags = RuntimeFlags(1 << 1);
    /// The fiber is winding down its scope after an interruption.
    pub const WIND_DOWN: RuntimeFlags = RuntimeFlags(1 << 2);

    /// Flags every fresh fiber starts with unless configured otherwise.
    pub const DEFAULT: RuntimeFlags =
        RuntimeFlags(Self::INTERRUPTION.0 | Self::COOPERATIVE_YIELDING.0);

    /// Build flags from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        RuntimeFlags(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every flag in `other` is set.
    pub const fn contains(self, other: RuntimeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the given flags.
    pub const fn enable(self, other: RuntimeFlags) -> Self {
        RuntimeFlags(self.0 | other.0)
    }

    /// Clear the given flags.
    pub const fn disable(self, other: RuntimeFlags) -> Self {
        RuntimeFlags(self.0 & !other.0)
    }

    /// True if interruption is enabled.
    pub const fn interruptible(self) -> bool {
        self.contains(Self::INTERRUPTION)
    }

    /// True if cooperative yielding is enabled.
    pub const fn cooperative_yielding(self) -> bool {
        self.contains(Self::COOPERATIVE_YIELDING)
    }

    /// True while the fiber winds down after an interruption.
    pub const fn wind_down(self) -> bool {
        self.contains(Self::WIND_DOWN)
    }

    /// Apply a patch.
    pub const fn patch(self, patch: RuntimeFlagsPatch) -> Self {
        patch.apply(self)
    }

    /// The patch that turns `self` into `that`.
    pub const fn diff(self, that: RuntimeFlags) -> RuntimeFlagsPatch {
        RuntimeFlagsPatch {
            active: self.0 ^ that.0,
            enabled: that.0,
        }
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Debug for RuntimeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.interruptible() {
            names.push("Interruption");
        }
        if self.cooperative_yielding() {
            names.push("CooperativeYielding");
        }
        if self.wind_down() {
            names.push("WindDown");
        }
        write!(f, "RuntimeFlags({})", names.join(" | "))
    }
}

/// A change to a set of runtime flags.
///
/// `active` selects which bits the patch touches; `enabled` gives their new
/// values. Bits outside `active` are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RuntimeFlagsPatch {
    active: u32,
    enabled: u32,
}

impl RuntimeFlagsPatch {
    /// A patch that changes nothing.
    pub const EMPTY: RuntimeFlagsPatch = RuntimeFlagsPatch {
        active: 0,
        enabled: 0,
    };

    /// Turn the given flags on.
    pub const fn enable(flags: RuntimeFlags) -> Self {
        RuntimeFlagsPatch {
            active: flags.0,
            enabled: flags.0,
        }
    }

    /// Turn the given flags off.
    pub const fn disable(flags: RuntimeFlags) -> Self {
        RuntimeFlagsPatch {
            active: flags.0,
            enabled: 0,
        }
    }

    /// True if the patch changes nothing.
    pub const fn is_empty(self) -> bool {
        self.active == 0
    }

    /// Apply `self`, then `that`.
    pub const fn both(self, that: RuntimeFlagsPatch) -> Self {
        RuntimeFlagsPatch {
            active: self.active | that.active,
            enabled: (self.enabled & !that.active) | (that.enabled & that.active),
        }
    }

    /// Apply the patch to a set of flags.
    pub const fn apply(self, flags: RuntimeFlags) -> RuntimeFlags {
        RuntimeFlags((flags.0 & !self.active) | (self.enabled & self.active))
    }

    /// The opposite patch: every touched flag is flipped.
    pub const fn invert(self) -> Self {
        RuntimeFlagsPatch {
            active: self.active,
            enabled: !self.enabled & self.active,
        }
    }

    /// True if the patch enables `flag`.
    pub const fn enables(self, flag: RuntimeFlags) -> bool {
        self.active & flag.0 == flag.0 && self.enabled & flag.0 == flag.0
    }

    /// True if the patch disables `flag`.
    pub const fn disables(self, flag: RuntimeFlags) -> bool {
        self.active & flag.0 == flag.0 && self.enabled & flag.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let flags = RuntimeFlags::default();
        assert!(flags.interruptible());
        assert!(flags.cooperative_yielding());
        assert!(!flags.wind_down());
    }

    #[test]
    fn test_patch_apply_and_invert() {
        let flags = RuntimeFlags::DEFAULT;
        let patch = RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION);
        let patched = patch.apply(flags);
        assert!(!patched.interruptible());
        assert!(patched.cooperative_yielding());
        assert_eq!(patch.invert().apply(patched), flags);
    }

    #[test]
    fn test_diff_restores() {
        let before = RuntimeFlags::DEFAULT;
        let after = before.patch(RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION));
        assert_eq!(before.diff(after).apply(before), after);
        assert_eq!(after.diff(before).apply(after), before);
    }

    #[test]
    fn test_nested_regions_restore_outer_state() {
        // uninterruptible { uninterruptible { } } must leave the outer region
        // uninterruptible when the inner one ends.
        let outer = RuntimeFlags::DEFAULT.patch(RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION));
        let inner = outer.patch(RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION));
        let revert = inner.diff(outer);
        assert!(!revert.apply(inner).interruptible());
    }

    #[test]
    fn test_both() {
        let p = RuntimeFlagsPatch::disable(RuntimeFlags::INTERRUPTION)
            .both(RuntimeFlagsPatch::enable(RuntimeFlags::INTERRUPTION));
        assert!(p.enables(RuntimeFlags::INTERRUPTION));
        assert!(RuntimeFlagsPatch::EMPTY.is_empty());
    }
}
