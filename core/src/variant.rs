// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Variant value.
//!
//! Grounded on `RMonoVariant_Def.h`. A [`Variant`] is the tagged
//! container used anywhere the raw Mono API takes or returns a `void*`
//! referring to a managed value: a primitive or custom value-type blob,
//! a managed reference (carried as a GC handle, never a raw pointer),
//! or a raw remote pointer passed through verbatim.

use std::rc::Rc;

use crate::abi::Abi;
use crate::handle::{HandleOwner, ManagedHandle};
use crate::types::Rptr;

/// Direction of a variant's value relative to a call, mirroring
/// `RMonoVariant::Direction`. Needed because functions like
/// `mono_runtime_invoke` require out/inout managed-reference
/// parameters to be marshalled differently than plain in-parameters.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Direction {
    /// Use whatever direction the parameter's definition-level tag
    /// specifies.
    Default,
    In,
    Out,
    InOut,
}

impl Direction {
    /// Resolve `Default` against a parameter's declared tag. Non-Default
    /// directions pass through unchanged.
    pub fn resolve(self, param_default: ParamDirection) -> Direction {
        match self {
            Direction::Default => match param_default {
                ParamDirection::In => Direction::In,
                ParamDirection::Out => Direction::Out,
                ParamDirection::InOut => Direction::InOut,
            },
            other => other,
        }
    }

    pub fn reads_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn writes_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// The direction tag a function-entry definition attaches to a
/// parameter by default.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ParamDirection {
    In,
    Out,
    InOut,
}

/// Inline-small-buffer capacity for [`ValueBuf`], chosen to cover every
/// built-in Mono value type (the widest is `decimal`-sized custom value
/// types still spill to the heap) without an allocation in the common
/// primitive case.
const INLINE_CAP: usize = 16;

/// Owns (or borrows) the bytes backing a [`VariantKind::Value`]: stored
/// size is the value's own size, alignment is the next power-of-two at
/// or above that size, capped at 16.
#[derive(Clone, Debug)]
pub enum ValueBuf {
    Inline { len: u8, bytes: [u8; INLINE_CAP] },
    Owned(Vec<u8>),
}

impl ValueBuf {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() <= INLINE_CAP {
            let mut buf = [0u8; INLINE_CAP];
            buf[..bytes.len()].copy_from_slice(bytes);
            ValueBuf::Inline {
                len: bytes.len() as u8,
                bytes: buf,
            }
        } else {
            ValueBuf::Owned(bytes.to_vec())
        }
    }

    pub fn from_pod<T: bytemuck::Pod>(value: &T) -> Self {
        Self::from_bytes(bytemuck::bytes_of(value))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ValueBuf::Inline { len, bytes } => &bytes[..*len as usize],
            ValueBuf::Owned(v) => v.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alignment required in target memory: next power of two >= size,
    /// capped at 16, matching
    /// `RMonoVariant::getMaxRequiredAlignment()`.
    pub fn alignment(&self) -> usize {
        let size = self.len().max(1);
        size.next_power_of_two().min(16)
    }

    fn overwrite(&mut self, bytes: &[u8]) {
        match self {
            ValueBuf::Inline { len, bytes: buf } => {
                debug_assert!(bytes.len() <= INLINE_CAP);
                buf[..bytes.len()].copy_from_slice(bytes);
                *len = bytes.len() as u8;
            }
            ValueBuf::Owned(v) => {
                debug_assert_eq!(bytes.len(), v.len());
                v.copy_from_slice(bytes);
            }
        }
    }
}

/// The payload of a [`Variant`], mirroring `RMonoVariant::Type`.
#[derive(Clone, Debug)]
pub enum VariantKind {
    /// Passed as a NULL pointer argument; the wrapper is called with
    /// zero for that slot.
    Invalid,
    /// A built-in or custom value-type instance kept in local memory,
    /// copied to/from target memory on each call.
    Value(ValueBuf),
    /// A managed reference. We
    /// never store the raw `MonoObject*`, only the [`ManagedHandle`].
    ManagedRef(ManagedHandle),
    /// A raw remote pointer, passed through to Mono verbatim.
    RawPointer(Rptr),
}

/// See module docs.
#[derive(Clone, Debug)]
pub struct Variant {
    kind: VariantKind,
    direction: Direction,
    auto_unbox: bool,
}

impl Variant {
    pub fn invalid() -> Self {
        Variant {
            kind: VariantKind::Invalid,
            direction: Direction::Default,
            auto_unbox: true,
        }
    }

    pub fn value(buf: ValueBuf) -> Self {
        Variant {
            kind: VariantKind::Value(buf),
            direction: Direction::Default,
            auto_unbox: true,
        }
    }

    pub fn from_pod<T: bytemuck::Pod>(value: T) -> Self {
        Self::value(ValueBuf::from_pod(&value))
    }

    pub fn managed_ref(handle: ManagedHandle) -> Self {
        Variant {
            kind: VariantKind::ManagedRef(handle),
            direction: Direction::Default,
            auto_unbox: true,
        }
    }

    pub fn raw_pointer(ptr: Rptr) -> Self {
        Variant {
            kind: VariantKind::RawPointer(ptr),
            direction: Direction::Default,
            auto_unbox: true,
        }
    }

    pub fn kind(&self) -> &VariantKind {
        &self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Builder matching `RMonoVariant::forDirection` / `in()`/`out()`/
    /// `inout()`: returns a copy tagged with an explicit direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn without_auto_unbox(mut self) -> Self {
        self.auto_unbox = false;
        self
    }

    pub fn auto_unbox(&self) -> bool {
        self.auto_unbox
    }

    /// Size this variant's payload occupies in the target-bound data
    /// block, under `A`'s ABI.
    pub fn size<A: Abi>(&self) -> usize {
        match &self.kind {
            VariantKind::Invalid => 0,
            VariantKind::Value(buf) => buf.len(),
            VariantKind::ManagedRef(_) => std::mem::size_of::<u32>(), // sizeof(rmono_gchandle)
            VariantKind::RawPointer(_) => A::PTR_WIDTH,
        }
    }

    /// Required alignment in the target-bound data block.
    pub fn alignment<A: Abi>(&self) -> usize {
        match &self.kind {
            VariantKind::Invalid => 1,
            VariantKind::Value(buf) => buf.alignment(),
            VariantKind::ManagedRef(_) => std::mem::size_of::<u32>(),
            VariantKind::RawPointer(_) => A::PTR_WIDTH,
        }
    }

    /// Serialize this variant's bytes into `dst` (exactly `self.size::<A>()`
    /// bytes), for upload into the target's data block. Null variants write nothing (handled by the caller via
    /// `size() == 0`).
    pub fn serialize<A: Abi>(&self, dst: &mut [u8]) {
        match &self.kind {
            VariantKind::Invalid => {}
            VariantKind::Value(buf) => dst.copy_from_slice(buf.as_bytes()),
            VariantKind::ManagedRef(handle) => {
                dst.copy_from_slice(&handle.gchandle().to_ne_bytes());
            }
            VariantKind::RawPointer(ptr) => {
                let internal = A::ptr_to_internal(*ptr);
                write_internal::<A>(dst, internal);
            }
        }
    }

    /// Update this variant from bytes read back out of the target's
    /// data block after the call. Only
    /// meaningful for `Out`/`InOut` directions; called unconditionally
    /// by the invocation context, which already gates on direction.
    pub fn update_from<A: Abi>(&mut self, src: &[u8], owner: &Rc<dyn HandleOwner>) {
        match &mut self.kind {
            VariantKind::Invalid | VariantKind::RawPointer(_) => {}
            VariantKind::Value(buf) => buf.overwrite(src),
            VariantKind::ManagedRef(handle) => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&src[..4]);
                let new_gchandle = u32::from_ne_bytes(raw);
                *handle = ManagedHandle::new(new_gchandle, true, owner);
            }
        }
    }
}

fn write_internal<A: Abi>(dst: &mut [u8], internal: A::Internal) {
    let v = internal.to_u64();
    dst.copy_from_slice(&v.to_ne_bytes()[..dst.len()]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::WinX86_64;

    #[test]
    fn inline_value_roundtrip() {
        let v = Variant::from_pod::<i32>(42);
        assert_eq!(v.size::<WinX86_64>(), 4);
        let mut buf = [0u8; 4];
        v.serialize::<WinX86_64>(&mut buf);
        assert_eq!(i32::from_ne_bytes(buf), 42);
    }

    #[test]
    fn alignment_caps_at_sixteen() {
        let v = Variant::value(ValueBuf::from_bytes(&[0u8; 32]));
        assert_eq!(v.alignment::<WinX86_64>(), 16);
    }

    #[test]
    fn raw_pointer_size_matches_abi_width() {
        let v = Variant::raw_pointer(Rptr::from(0x1000));
        assert_eq!(v.size::<crate::abi::WinX86>(), 4);
        assert_eq!(v.size::<WinX86_64>(), 8);
    }

    #[test]
    fn invalid_variant_has_zero_size() {
        let v = Variant::invalid();
        assert_eq!(v.size::<WinX86_64>(), 0);
    }
}
