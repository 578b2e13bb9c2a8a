// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Function-entry model.
//!
//! Grounded on `RMonoAPIFunction_Def.h` / `RMonoAPIFunctionWrap_Impl.h`.
//! The original compiles each Mono API function into three statically
//! typed C++ views (raw/wrap/API) via heavy template metaprogramming.
//! Hand-writing a distinct Rust
//! generic per Mono API function's arity/types would mean either a
//! proc-macro or hundreds of near-duplicate impls; instead this models
//! the three views *structurally*, as a table-driven [`FuncSignature`]
//! of [`ParamSpec`]/[`ReturnKind`] values interpreted uniformly by
//! [`FuncEntry::invoke`] — generated from a Rust data table instead of
//! a build script. See `DESIGN.md` for the open-question rationale.

use std::marker::PhantomData;
use std::rc::Rc;

use crate::abi::Abi;
use crate::backend::Backend;
use crate::errors::{Result, ResultExt};
use crate::handle::HandleOwner;
use crate::types::{CallingConvention, Protection, Rptr};
use crate::variant::{ParamDirection, Variant, VariantKind};

/// What kind of value a parameter or return slot in the *wrap view*
/// carries in the data block.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SlotKind {
    /// A value-type blob, copied in/out verbatim.
    Value,
    /// A managed reference, carried as a GC-handle integer rather than
    /// a raw pointer.
    ManagedRef,
    /// A raw remote pointer, carried through unchanged.
    RawPointer,
}

/// One parameter's slot kind plus its declared direction.
#[derive(Copy, Clone, Debug)]
pub struct ParamSpec {
    pub kind: SlotKind,
    pub direction: ParamDirection,
}

impl ParamSpec {
    pub fn input(kind: SlotKind) -> Self {
        ParamSpec {
            kind,
            direction: ParamDirection::In,
        }
    }
    pub fn output(kind: SlotKind) -> Self {
        ParamSpec {
            kind,
            direction: ParamDirection::Out,
        }
    }
    pub fn inout(kind: SlotKind) -> Self {
        ParamSpec {
            kind,
            direction: ParamDirection::InOut,
        }
    }
}

/// What the call returns.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReturnKind {
    Void,
    Slot(SlotKind),
    /// The function returns a `char*` owned by the caller (e.g.
    /// `mono_string_to_utf8`), same as a plain raw-pointer return except
    /// [`FuncEntry::invoke`] follows the pointer with a second
    /// `Backend::read`, one byte at a time, to pull back the
    /// NUL-terminated bytes it points at — there is no separate length
    /// out-parameter on the real function, so none is modelled here.
    /// Freeing the target-side buffer via `mono_free` is left to the
    /// caller, same as the `mono_string_new` scratch buffer (see
    /// `DESIGN.md`); see also the open question there about
    /// `mono_string_chars`, which is the one string-returning function
    /// that must *not* be read this way (it points into the live
    /// `MonoString`, not a caller-owned allocation).
    StringOut,
}

/// The full signature a function entry was built from — the
/// definition-level view of a wrapped function's parameter and return
/// types.
#[derive(Clone, Debug)]
pub struct FuncSignature {
    pub params: Vec<ParamSpec>,
    pub ret: ReturnKind,
    /// Whether a `ManagedRef` return should be auto-unboxed when the
    /// object the target handed back is a boxed value type: instead of
    /// minting a `ManagedHandle` for the box itself, the wrapper hands
    /// back a raw pointer to the value living inside it. Only
    /// `mono_runtime_invoke` sets this; every other `ManagedRef`-
    /// returning function in the registry keeps the handle.
    pub ret_auto_unbox: bool,
    /// Index into `params` whose argument `Variant`'s
    /// [`crate::variant::Variant::auto_unbox`] flag decides, at call
    /// time, whether the auto-unbox branch above actually runs. Set
    /// together with `ret_auto_unbox`; `None` means "always enabled".
    pub ret_auto_unbox_gate: Option<usize>,
    /// Whether the real function takes a trailing `MonoObject **exc`
    /// out-parameter the wrapper must supply storage for. When set,
    /// [`FuncEntry::invoke`] treats a non-null value written there as
    /// a remote exception and returns `Err` instead of the ordinary
    /// return value.
    pub exception_out: bool,
}

impl FuncSignature {
    pub fn new(params: Vec<ParamSpec>, ret: ReturnKind) -> Self {
        FuncSignature {
            params,
            ret,
            ret_auto_unbox: false,
            ret_auto_unbox_gate: None,
            exception_out: false,
        }
    }

    /// The real function takes a trailing exception out-parameter.
    pub fn with_exception_out(mut self) -> Self {
        self.exception_out = true;
        self
    }

    /// Enable the return auto-unbox branch, gated dynamically by
    /// `params[gate_param]`'s `Variant::auto_unbox()` at each call —
    /// the caller decides per-call whether to take it, the same way
    /// `RMonoVariant::setAutoUnboxEnabled` lets a managed-reference
    /// argument opt out of it.
    pub fn with_auto_unbox(mut self, gate_param: usize) -> Self {
        self.ret_auto_unbox = true;
        self.ret_auto_unbox_gate = Some(gate_param);
        self
    }
}

/// The result of invoking a [`FuncEntry`]: the return value (if any)
/// plus nothing else — output parameters are written back into the
/// caller's own `Variant`s in place, matching `Variant`'s `InOut`/`Out`
/// mutation contract.
#[derive(Clone, Debug)]
pub enum Invoked {
    Void,
    Value(Variant),
    Bytes(Vec<u8>),
}

struct Slot {
    offset: usize,
    size: usize,
}

/// A single Mono API function: target address, optional synthesised
/// wrapper, supported flag, and the signature describing how to
/// marshal calls.
pub struct FuncEntry<A: Abi> {
    name: &'static str,
    raw_addr: Rptr,
    wrapper_addr: Option<Rptr>,
    calling_convention: CallingConvention,
    signature: FuncSignature,
    supported: bool,
    _abi: PhantomData<A>,
}

impl<A: Abi> FuncEntry<A> {
    /// A function with no managed references/value blobs in its
    /// signature can be called directly — no data block, no wrapper.
    /// `invoke_raw(args…)` runs the native function directly via the
    /// backend's RPC.
    pub fn raw(name: &'static str, addr: Rptr, calling_convention: CallingConvention) -> Self {
        FuncEntry {
            name,
            raw_addr: addr,
            wrapper_addr: None,
            calling_convention,
            signature: FuncSignature::new(Vec::new(), ReturnKind::Void),
            supported: true,
            _abi: PhantomData,
        }
    }

    /// A function whose signature needs marshalling, with its wrapper
    /// already compiled and uploaded.
    pub fn wrapped(
        name: &'static str,
        addr: Rptr,
        wrapper_addr: Rptr,
        calling_convention: CallingConvention,
        signature: FuncSignature,
    ) -> Self {
        FuncEntry {
            name,
            raw_addr: addr,
            wrapper_addr: Some(wrapper_addr),
            calling_convention,
            signature,
            supported: true,
            _abi: PhantomData,
        }
    }

    /// A function the attached target's Mono build does not export.
    pub fn unsupported(name: &'static str) -> Self {
        FuncEntry {
            name,
            raw_addr: Rptr::NULL,
            wrapper_addr: None,
            calling_convention: CallingConvention::Cdecl,
            signature: FuncSignature::new(Vec::new(), ReturnKind::Void),
            supported: false,
            _abi: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    pub fn address(&self) -> Rptr {
        self.raw_addr
    }

    fn require_supported(&self) -> Result<()> {
        if !self.supported {
            return Err(crate::errors::ErrorKind::UnsupportedApi(self.name.to_string()).into());
        }
        Ok(())
    }

    /// Direct call for entries with no wrapper: `args` are already
    /// ABI-width words.
    pub fn invoke_raw(&self, backend: &dyn Backend, args: &[u64]) -> Result<u64> {
        self.require_supported()?;
        backend
            .rpc_call(self.raw_addr, self.calling_convention, args)
            .chain_err(|| format!("invoking {} failed", self.name))
    }

    /// Full marshalled invocation through the synthesised wrapper: the
    /// sizing/fill/post passes described in the module docs above.
    pub fn invoke(
        &self,
        backend: &dyn Backend,
        owner: &Rc<dyn HandleOwner>,
        args: &mut [Variant],
    ) -> Result<Invoked> {
        self.require_supported()?;
        let wrapper_addr = self
            .wrapper_addr
            .ok_or_else(|| crate::errors::Error::from(format!("{} has no wrapper", self.name)))?;

        if args.len() != self.signature.params.len() {
            return Err(crate::errors::ErrorKind::InvalidPrecondition(format!(
                "{}: expected {} arguments, got {}",
                self.name,
                self.signature.params.len(),
                args.len()
            ))
            .into());
        }

        // --- Sizing pass ---
        let mut slots = Vec::with_capacity(args.len());
        let mut cursor = 0usize;
        for arg in args.iter() {
            let size = arg.size::<A>();
            let align = arg.alignment::<A>().max(1);
            cursor = align_up(cursor, align);
            slots.push(Slot {
                offset: cursor,
                size,
            });
            cursor += size;
        }

        let return_slot = match self.signature.ret {
            ReturnKind::Void => None,
            ReturnKind::Slot(SlotKind::Value) | ReturnKind::Slot(SlotKind::ManagedRef) => {
                let align = A::PTR_WIDTH;
                cursor = align_up(cursor, align);
                let slot = Slot {
                    offset: cursor,
                    size: align,
                };
                cursor += align;
                Some(slot)
            }
            ReturnKind::Slot(SlotKind::RawPointer) => {
                cursor = align_up(cursor, A::PTR_WIDTH);
                let slot = Slot {
                    offset: cursor,
                    size: A::PTR_WIDTH,
                };
                cursor += A::PTR_WIDTH;
                Some(slot)
            }
            ReturnKind::StringOut => {
                // Real `mono_string_to_utf8` returns a plain NUL-terminated
                // `char*`, no separate length out-parameter — so the slot
                // is exactly as wide as any other raw-pointer return.
                cursor = align_up(cursor, A::PTR_WIDTH);
                let ptr_slot = Slot {
                    offset: cursor,
                    size: A::PTR_WIDTH,
                };
                cursor += A::PTR_WIDTH;
                Some(ptr_slot)
            }
        };

        // A `ManagedRef` return that can be auto-unboxed carries two
        // extra trailing slots, both sized pointer-width like every
        // other slot the wrapper touches with a full-register `mov` so
        // the write never runs past the allocated data block:
        // - `auto_unbox_enabled_slot`: an input flag, 1 unless the
        //   gating argument's `Variant::auto_unbox()` says otherwise,
        //   read by the wrapper before it bothers checking the
        //   returned object's class at all.
        // - `unboxed_flag_slot`: an output flag, 1 if the wrapper took
        //   the unbox path (the primary slot then holds a raw pointer,
        //   full width) or 0 if it minted a handle as usual (the
        //   primary slot holds a gchandle, narrow width).
        // See `DESIGN.md`.
        let auto_unbox_gates = self.signature.ret_auto_unbox
            && matches!(self.signature.ret, ReturnKind::Slot(SlotKind::ManagedRef));
        let auto_unbox_enabled_slot = if auto_unbox_gates {
            let align = A::PTR_WIDTH;
            cursor = align_up(cursor, align);
            let slot = Slot { offset: cursor, size: align };
            cursor += align;
            Some(slot)
        } else {
            None
        };
        let unboxed_flag_slot = if auto_unbox_gates {
            let align = A::PTR_WIDTH;
            cursor = align_up(cursor, align);
            let slot = Slot { offset: cursor, size: align };
            cursor += align;
            Some(slot)
        } else {
            None
        };

        // Storage for the real function's trailing `MonoObject **exc`,
        // if it takes one. The data block starts zeroed, matching
        // Mono's own contract that `*exc` is left null when no
        // exception was thrown.
        let exception_slot = if self.signature.exception_out {
            let align = A::PTR_WIDTH;
            cursor = align_up(cursor, align);
            let slot = Slot { offset: cursor, size: align };
            cursor += align;
            Some(slot)
        } else {
            None
        };

        let total_size = cursor.max(1);

        // --- Fill pass ---
        let mut buf = vec![0u8; total_size];
        for (arg, slot) in args.iter().zip(slots.iter()) {
            if arg.direction().resolve(ParamDirection::In).reads_input() {
                arg.serialize::<A>(&mut buf[slot.offset..slot.offset + slot.size]);
            }
        }
        if let Some(slot) = &auto_unbox_enabled_slot {
            let enabled = self
                .signature
                .ret_auto_unbox_gate
                .and_then(|i| args.get(i))
                .map(|a| a.auto_unbox())
                .unwrap_or(true);
            buf[slot.offset] = enabled as u8;
        }

        let data_block = backend
            .alloc(total_size, Protection::READ_WRITE)
            .chain_err(|| format!("{}: allocating data block failed", self.name))?;
        backend
            .write(data_block, &buf)
            .chain_err(|| format!("{}: uploading data block failed", self.name))?;

        let data_block_internal = A::ptr_to_internal(data_block).to_u64();
        let call_result = backend.rpc_call(
            wrapper_addr,
            self.calling_convention,
            &[data_block_internal],
        );

        backend
            .read(data_block, &mut buf)
            .chain_err(|| format!("{}: reading back data block failed", self.name))?;

        let string_result = if matches!(self.signature.ret, ReturnKind::StringOut) {
            let slot = return_slot.as_ref().unwrap();
            let mut ptr_bytes = [0u8; 8];
            ptr_bytes[..A::PTR_WIDTH].copy_from_slice(&buf[slot.offset..slot.offset + A::PTR_WIDTH]);
            let str_ptr = Rptr(u64::from_ne_bytes(ptr_bytes));
            // NUL-terminated, like the real `char*` this stands in for;
            // read a byte at a time since the length isn't known up front.
            let mut bytes = Vec::new();
            if str_ptr.0 != 0 {
                let mut byte = [0u8; 1];
                loop {
                    backend
                        .read(Rptr(str_ptr.0 + bytes.len() as u64), &mut byte)
                        .chain_err(|| format!("{}: reading string result failed", self.name))?;
                    if byte[0] == 0 {
                        break;
                    }
                    bytes.push(byte[0]);
                }
            }
            Some(bytes)
        } else {
            None
        };

        backend
            .free(data_block)
            .chain_err(|| format!("{}: freeing data block failed", self.name))?;

        call_result.chain_err(|| format!("invoking {} failed", self.name))?;

        if let Some(slot) = &exception_slot {
            let mut ptr_bytes = [0u8; 8];
            ptr_bytes[..A::PTR_WIDTH].copy_from_slice(&buf[slot.offset..slot.offset + A::PTR_WIDTH]);
            let exc_ptr = Rptr(u64::from_ne_bytes(ptr_bytes));
            if exc_ptr.0 != 0 {
                let gchandle = owner.gchandle_new(exc_ptr, false);
                let handle = crate::handle::ManagedHandle::new(gchandle, true, owner);
                return Err(crate::errors::ErrorKind::RemoteException(
                    handle,
                    "unhandled managed exception".to_string(),
                )
                .into());
            }
        }

        for (arg, slot) in args.iter_mut().zip(slots.iter()) {
            if arg.direction().resolve(ParamDirection::In).writes_output() {
                arg.update_from::<A>(&buf[slot.offset..slot.offset + slot.size], owner);
            }
        }

        if let Some(bytes) = string_result {
            return Ok(Invoked::Bytes(bytes));
        }

        match (&self.signature.ret, &return_slot) {
            (ReturnKind::Void, _) => Ok(Invoked::Void),
            (ReturnKind::Slot(SlotKind::Value), Some(slot)) => Ok(Invoked::Value(Variant::value(
                crate::variant::ValueBuf::from_bytes(&buf[slot.offset..slot.offset + slot.size]),
            ))),
            (ReturnKind::Slot(SlotKind::RawPointer), Some(slot)) => {
                let mut ptr_bytes = [0u8; 8];
                ptr_bytes[..slot.size].copy_from_slice(&buf[slot.offset..slot.offset + slot.size]);
                Ok(Invoked::Value(Variant::raw_pointer(Rptr(u64::from_ne_bytes(
                    ptr_bytes,
                )))))
            }
            (ReturnKind::Slot(SlotKind::ManagedRef), Some(slot)) => {
                let was_unboxed = unboxed_flag_slot
                    .as_ref()
                    .map(|flag| buf[flag.offset] != 0)
                    .unwrap_or(false);
                if was_unboxed {
                    let mut ptr_bytes = [0u8; 8];
                    ptr_bytes[..A::PTR_WIDTH]
                        .copy_from_slice(&buf[slot.offset..slot.offset + A::PTR_WIDTH]);
                    Ok(Invoked::Value(Variant::raw_pointer(Rptr(u64::from_ne_bytes(
                        ptr_bytes,
                    )))))
                } else {
                    let mut gch_bytes = [0u8; 4];
                    gch_bytes.copy_from_slice(&buf[slot.offset..slot.offset + 4]);
                    let gchandle = u32::from_ne_bytes(gch_bytes);
                    let handle = crate::handle::ManagedHandle::new(gchandle, true, owner);
                    Ok(Invoked::Value(Variant::managed_ref(handle)))
                }
            }
            _ => unreachable!("return_slot is always Some when ret != Void"),
        }
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    let align = align.max(1);
    (offset + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::WinX86_64;
    use crate::backend::{AsmArg, Assembler, Module};
    use crate::handle::HandleOwner;
    use crate::types::ProcessorArch;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeOwner;
    impl HandleOwner for FakeOwner {
        fn free_raw(&self, _value: Rptr, _deleter: crate::handle::RawDeleter) {}
        fn free_gchandle(&self, _gchandle: u32) {}
        fn gchandle_get_target(&self, _gchandle: u32) -> Rptr {
            Rptr::NULL
        }
        fn gchandle_new(&self, _raw: Rptr, _pinned: bool) -> u32 {
            0
        }
        fn register_handle(&self, _entry: crate::handle::LiveHandleRef) -> crate::handle::HandleRegId {
            crate::handle::HandleRegId(0)
        }
        fn unregister_handle(&self, _id: crate::handle::HandleRegId) {}
    }

    /// Simulates a wrapper for `int32_t add_one(int32_t x)` expressed
    /// as a wrap view: reads a 4-byte `x` at offset 0, writes `x + 1`
    /// into a 4-byte return slot at offset 4.
    struct FakeBackend {
        memory: RefCell<HashMap<u64, Vec<u8>>>,
        next_addr: RefCell<u64>,
    }

    impl FakeBackend {
        fn new() -> Self {
            FakeBackend {
                memory: RefCell::new(HashMap::new()),
                next_addr: RefCell::new(0x2000),
            }
        }
    }

    const WRAPPER_ADDR: u64 = 0xABCD;

    impl Backend for FakeBackend {
        fn attach(&self) -> Result<()> {
            Ok(())
        }
        fn get_module(&self, _name: &str) -> Result<Option<Box<dyn Module>>> {
            Ok(None)
        }
        fn enumerate_modules(&self) -> Result<Vec<Box<dyn Module>>> {
            Ok(Vec::new())
        }
        fn export_address(&self, _module: &dyn Module, _symbol: &str) -> Result<Option<Rptr>> {
            Ok(None)
        }
        fn alloc(&self, size: usize, _protection: Protection) -> Result<Rptr> {
            let mut n = self.next_addr.borrow_mut();
            let addr = *n;
            *n += 0x100;
            self.memory.borrow_mut().insert(addr, vec![0u8; size]);
            Ok(Rptr(addr))
        }
        fn free(&self, ptr: Rptr) -> Result<()> {
            self.memory.borrow_mut().remove(&ptr.0);
            Ok(())
        }
        fn read(&self, ptr: Rptr, dst: &mut [u8]) -> Result<()> {
            let mem = self.memory.borrow();
            let bytes = mem.get(&ptr.0).expect("read from unmapped fake address");
            dst.copy_from_slice(&bytes[..dst.len()]);
            Ok(())
        }
        fn write(&self, ptr: Rptr, src: &[u8]) -> Result<()> {
            self.memory
                .borrow_mut()
                .entry(ptr.0)
                .or_insert_with(|| vec![0u8; src.len()])[..src.len()]
                .copy_from_slice(src);
            Ok(())
        }
        fn page_size(&self) -> Result<usize> {
            Ok(4096)
        }
        fn region_size(&self, _ptr: Rptr) -> Result<usize> {
            Ok(4096)
        }
        fn processor_arch(&self) -> Result<ProcessorArch> {
            Ok(ProcessorArch::X86_64)
        }
        fn assembler(&self) -> Box<dyn Assembler<Label = usize>> {
            unimplemented!()
        }
        fn rpc_call(&self, addr: Rptr, _cc: CallingConvention, args: &[u64]) -> Result<u64> {
            assert_eq!(addr.0, WRAPPER_ADDR);
            let data_block = Rptr(args[0]);
            let mut mem = self.memory.borrow_mut();
            let buf = mem.get_mut(&data_block.0).unwrap();
            let mut x_bytes = [0u8; 4];
            x_bytes.copy_from_slice(&buf[0..4]);
            let x = i32::from_ne_bytes(x_bytes);
            buf[4..8].copy_from_slice(&(x + 1).to_ne_bytes());
            Ok(0)
        }
    }

    #[test]
    fn wrapped_invoke_runs_sizing_fill_post_passes() {
        let backend = FakeBackend::new();
        let owner: Rc<dyn HandleOwner> = Rc::new(FakeOwner);

        let entry = FuncEntry::<WinX86_64>::wrapped(
            "add_one",
            Rptr(0x1234),
            Rptr(WRAPPER_ADDR),
            CallingConvention::Fastcall,
            FuncSignature::new(
                vec![ParamSpec::input(SlotKind::Value)],
                ReturnKind::Slot(SlotKind::Value),
            ),
        );

        let mut args = vec![Variant::from_pod::<i32>(41)];
        let result = entry.invoke(&backend, &owner, &mut args).unwrap();
        match result {
            Invoked::Value(v) => match v.kind() {
                VariantKind::Value(buf) => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(buf.as_bytes());
                    assert_eq!(i32::from_ne_bytes(b), 42);
                }
                _ => panic!("expected value return"),
            },
            _ => panic!("expected value return"),
        }
    }

    #[test]
    fn unsupported_entry_rejects_invocation() {
        let backend = FakeBackend::new();
        let owner: Rc<dyn HandleOwner> = Rc::new(FakeOwner);
        let entry = FuncEntry::<WinX86_64>::unsupported("mono_nonexistent");
        let mut args: Vec<Variant> = Vec::new();
        assert!(entry.invoke(&backend, &owner, &mut args).is_err());
    }

    #[test]
    fn raw_invoke_rejects_argument_mismatch_is_not_checked_but_dispatches_directly() {
        let backend = FakeBackend::new();
        let entry = FuncEntry::<WinX86_64>::raw("mono_jit_init", Rptr(0x1), CallingConvention::Cdecl);
        // raw() entries have no wrapper; invoke_raw just dispatches.
        let _ = entry.invoke_raw(&backend, &[]);
    }

    #[allow(dead_code)]
    fn _type_check(_: AsmArg) {}
}
