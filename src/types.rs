use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulation time in ticks. One tick is one nanosecond, so `fugit`
/// nanosecond durations convert losslessly via `Duration::ticks()`.
pub type Tick = u64;

/// Unique identifier of a host request. Assigned by the host layer and
/// never reused while the request is live.
pub type Tag = u64;

macro_rules! address_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            pub const INVALID: $name = $name(u64::MAX);

            #[inline]
            pub fn is_valid(self) -> bool {
                self.0 != u64::MAX
            }

            #[inline]
            pub fn invalidate(&mut self) {
                self.0 = u64::MAX;
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{:x}h", self.0)
                } else {
                    f.write_str("invalid")
                }
            }
        }
    };
}

address_type!(
    /// Logical page number, the host-visible page address.
    Lpn
);
address_type!(
    /// Logical super-page number: `LPN / superpage`.
    Lspn
);
address_type!(
    /// Physical page number, addressing one NAND page.
    Ppn
);
address_type!(
    /// Physical super-page number: one page slot striped across the
    /// superpage-many parallel dies.
    Pspn
);
address_type!(
    /// Physical super-block number: one erase unit striped across the
    /// superpage-many parallel dies.
    Psbn
);
