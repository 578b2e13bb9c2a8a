// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! ABI layer.
//!
//! Grounded on `RMonoABITypeTraits.h` / `RMonoABIConverter.h`: each
//! supported ABI fixes the width and signedness of every Mono-internal
//! integer/pointer type, and provides lossless bidirectional converters
//! between the controller-side "public" width ([`crate::types::Rptr`],
//! always 64-bit) and the ABI-specific "internal" width.
//!
//! ABI selection is modelled
//! as a compile-time tuple of ABI marker types, discriminated at run
//! time by a small enum (`AbiKind`) rather than a flat union with a
//! manual discriminant — the latter is explicitly disallowed.

mod winx86;
mod winx86_64;

pub use winx86::WinX86;
pub use winx86_64::WinX86_64;

use crate::types::{CallingConvention, ProcessorArch, Rptr};

/// Runtime discriminant selecting which [`Abi`] implementation is
/// active. Exactly one `AbiKind` variant exists per supported ABI.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum AbiKind {
    WinX86,
    WinX86_64,
}

impl AbiKind {
    /// ABI selection during attach: match the target's probed processor
    /// architecture to the ABI whose internal pointer width agrees.
    /// Returns `None` if no ABI matches.
    pub fn for_arch(arch: ProcessorArch) -> Option<AbiKind> {
        match arch {
            ProcessorArch::X86 => Some(AbiKind::WinX86),
            ProcessorArch::X86_64 => Some(AbiKind::WinX86_64),
        }
    }

    pub fn ptr_width(self) -> usize {
        match self {
            AbiKind::WinX86 => WinX86::PTR_WIDTH,
            AbiKind::WinX86_64 => WinX86_64::PTR_WIDTH,
        }
    }
}

/// An ABI-internal integer width, wide enough to round-trip through
/// [`Rptr`] without loss as long as the value actually fits the ABI.
pub trait InternalInt: Copy + Clone + std::fmt::Debug + Send + Sync + 'static {
    fn to_u64(self) -> u64;
    fn from_u64_truncating(v: u64) -> Self;
    /// Whether `v` fits losslessly in this internal width.
    fn fits(v: u64) -> bool;
}

impl InternalInt for u32 {
    fn to_u64(self) -> u64 {
        u64::from(self)
    }
    fn from_u64_truncating(v: u64) -> Self {
        v as u32
    }
    fn fits(v: u64) -> bool {
        v <= u64::from(u32::MAX)
    }
}

impl InternalInt for u64 {
    fn to_u64(self) -> u64 {
        self
    }
    fn from_u64_truncating(v: u64) -> Self {
        v
    }
    fn fits(_v: u64) -> bool {
        true
    }
}

/// Per-ABI width, calling convention, and conversion rules. Implemented by zero-sized marker types ([`WinX86`],
/// [`WinX86_64`]) selected at compile time by generic code and at run
/// time via [`AbiKind`].
pub trait Abi: Copy + Clone + std::fmt::Debug + Send + Sync + 'static {
    const KIND: AbiKind;
    /// Width, in bytes, of `rmono_voidp` and friends under this ABI.
    const PTR_WIDTH: usize;
    /// Default calling convention used by exported Mono API functions
    /// under this ABI (cdecl on both supported ABIs: Mono's public API
    /// is declared `MONO_API` which expands to the platform default,
    /// cdecl on Windows).
    const DEFAULT_CALLING_CONVENTION: CallingConvention = CallingConvention::Cdecl;

    /// The internal (ABI-width) representation of any pointer-ish type.
    type Internal: InternalInt;

    /// Convert a controller-side remote pointer down to the ABI's
    /// internal width. Total and lossless when `p` fits; in debug
    /// builds, an out-of-range `p` is a programmer error and asserts.
    fn ptr_to_internal(p: Rptr) -> Self::Internal {
        debug_assert!(
            Self::Internal::fits(p.0),
            "remote pointer {:?} does not fit the {:?} ABI's internal width",
            p,
            Self::KIND
        );
        Self::Internal::from_u64_truncating(p.0)
    }

    /// Convert an ABI-internal pointer back up to the controller-side
    /// wide representation. Always total: the internal width can never
    /// exceed the public width.
    fn ptr_from_internal(v: Self::Internal) -> Rptr {
        Rptr(v.to_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessorArch;

    #[test]
    fn abi_kind_selection_matches_arch() {
        assert_eq!(AbiKind::for_arch(ProcessorArch::X86), Some(AbiKind::WinX86));
        assert_eq!(
            AbiKind::for_arch(ProcessorArch::X86_64),
            Some(AbiKind::WinX86_64)
        );
    }

    #[test]
    fn ptr_width_matches_abi() {
        assert_eq!(AbiKind::WinX86.ptr_width(), 4);
        assert_eq!(AbiKind::WinX86_64.ptr_width(), 8);
    }

    #[test]
    fn winx86_roundtrip_within_range() {
        let p = Rptr::from(0x1000_0000);
        let internal = WinX86::ptr_to_internal(p);
        assert_eq!(WinX86::ptr_from_internal(internal), p);
    }

    #[test]
    fn winx86_64_roundtrip_full_range() {
        let p = Rptr::from(0xDEAD_BEEF_0000_1234);
        let internal = WinX86_64::ptr_to_internal(p);
        assert_eq!(WinX86_64::ptr_from_internal(internal), p);
    }
}
