// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Fundamental cross-process types: the remote pointer (`Rptr`) and
//! its neighbours.
//!
//! Grounded on `RMonoTypes.h`: the original draws a hard line between
//! *public* types (always wide enough for any supported ABI) and
//! *internal* types (exactly the width the target ABI uses). We mirror
//! that split with [`Rptr`] (public, always `u64`) and [`Internal`]
//! (ABI-chosen width, produced by [`crate::abi::Abi`] converters).

use std::fmt;

/// A target-address-sized quantity, wide enough to hold a pointer for
/// any ABI this engine supports. All pointer-ish "internal" types for
/// the target are conceptually aliases of this; see `RMonoTypes.h`'s
/// `rmono_voidp` family.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Rptr(pub u64);

impl Rptr {
    pub const NULL: Rptr = Rptr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, delta: i64) -> Rptr {
        Rptr((self.0 as i64).wrapping_add(delta) as u64)
    }
}

impl fmt::Debug for Rptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rptr(0x{:x})", self.0)
    }
}

impl From<u64> for Rptr {
    fn from(v: u64) -> Self {
        Rptr(v)
    }
}

/// A Mono GC-handle integer, as returned by `mono_gchandle_new`. Always
/// 32 bits wide regardless of ABI (`RMonoTypes.h`: "no special remote
/// typedef exists").
pub type Gchandle = u32;

/// Sentinel matching `REMOTEMONO_GCHANDLE_INVALID`.
pub const GCHANDLE_INVALID: Gchandle = 0;

/// Calling conventions the assembler / backend RPC bridge must be able
/// to generate calls for.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    Fastcall,
}

/// Processor architecture of the attached target, as reported by
/// `Backend::processor_arch` and consumed by ABI selection.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ProcessorArch {
    X86,
    X86_64,
}

/// Memory protection flags for `Backend::alloc`. Values mirror the
/// Windows `PAGE_*` constants (this engine targets Windows/x86 and
/// Windows/x86_64 ABIs), re-exported from `winapi` on
/// that platform and with plain equivalents elsewhere so the type is
/// usable in portable tests.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct Protection(pub u32);

impl Protection {
    #[cfg(windows)]
    pub const READ_WRITE: Protection = Protection(winapi::um::winnt::PAGE_READWRITE);
    #[cfg(not(windows))]
    pub const READ_WRITE: Protection = Protection(0x04);

    #[cfg(windows)]
    pub const EXECUTE_READ_WRITE: Protection =
        Protection(winapi::um::winnt::PAGE_EXECUTE_READWRITE);
    #[cfg(not(windows))]
    pub const EXECUTE_READ_WRITE: Protection = Protection(0x40);
}
