// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Runtime context.
//!
//! Grounded on `RMonoAPIBackend_Impl.h`'s `RMonoAPIBackend::init()`/
//! `uninit()` and on `audioipc::server::ServerWrapper`'s
//! attach-everything-then-tear-down-in-reverse shape. [`Runtime`] is the
//! single long-lived object the facade holds: it owns the backend, the
//! ABI dispatcher, the worker thread, the live-handle registry and the
//! deferred-free buffers.
//!
//! Handles need a stable `Rc<dyn HandleOwner>` pointing back at the
//! runtime that created them, so [`Runtime::attach`] builds the value
//! with [`Rc::new_cyclic`] and keeps a [`Weak`] to itself for handing
//! out further owner references from methods that mint handles on their
//! own (e.g. the root-domain handle).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use log::{debug, warn};

use crate::abi::{Abi, AbiKind, WinX86, WinX86_64};
use crate::asm::funcwrap::{self, SlotLayout, UnboxAddrs, WrapperLayout};
use crate::asm::ipcvec as ipcvec_asm;
use crate::backend::{Assembler, Backend, Module};
use crate::config::Config;
use crate::core_thread::{self, CoreThread};
use crate::dispatch::{Dispatcher, FunctionTable};
use crate::errors::{Error, ErrorKind, Result, ResultExt};
use crate::funcentry::{FuncEntry, FuncSignature, ParamSpec, ReturnKind, SlotKind};
use crate::handle::{HandleOwner, HandleRegId, LiveHandleRef, RawDeleter, RawHandle};
use crate::ipcvec::IpcVectorApi;
use crate::types::{CallingConvention, Gchandle, Protection, Rptr};

/// One entry in the attach-time function registry:
/// a Mono API function name, whether attach must fail if it is missing,
/// and — if the function needs marshalling — the signature its wrapper
/// is compiled from. `None` signature means the function is called
/// directly via [`FuncEntry::raw`].
///
/// Scoped deliberately to the handful of end-to-end invocation
/// scenarios this crate exercises, not the hundreds of functions the
/// original wraps — see the scoping note in `DESIGN.md`.
#[derive(Clone)]
struct FuncDescriptor {
    name: &'static str,
    required: bool,
    signature: Option<FuncSignature>,
}

fn function_registry() -> Vec<FuncDescriptor> {
    vec![
        FuncDescriptor { name: "mono_get_root_domain", required: true, signature: None },
        FuncDescriptor { name: "mono_thread_attach", required: false, signature: None },
        FuncDescriptor { name: "mono_thread_detach", required: false, signature: None },
        FuncDescriptor { name: "mono_domain_create_appdomain", required: false, signature: None },
        FuncDescriptor { name: "mono_domain_set", required: false, signature: None },
        FuncDescriptor { name: "mono_assembly_open", required: false, signature: None },
        FuncDescriptor { name: "mono_assembly_get_image", required: false, signature: None },
        FuncDescriptor { name: "mono_assembly_foreach", required: false, signature: None },
        FuncDescriptor { name: "mono_class_from_name", required: false, signature: None },
        FuncDescriptor { name: "mono_class_get_method_from_name", required: false, signature: None },
        FuncDescriptor { name: "mono_method_desc_new", required: false, signature: None },
        FuncDescriptor { name: "mono_method_desc_free", required: false, signature: None },
        // Field/property lookup and raw get/set: all operate on raw
        // target pointers the helper layer already materialised via
        // `ManagedHandle::raw()`, so none of these need a marshalling
        // wrapper.
        FuncDescriptor { name: "mono_class_get_field_from_name", required: false, signature: None },
        FuncDescriptor { name: "mono_class_get_property_from_name", required: false, signature: None },
        FuncDescriptor { name: "mono_field_get_value", required: false, signature: None },
        FuncDescriptor { name: "mono_field_set_value", required: false, signature: None },
        FuncDescriptor { name: "mono_property_get_value", required: false, signature: None },
        FuncDescriptor { name: "mono_property_set_value", required: false, signature: None },
        FuncDescriptor { name: "mono_object_to_string", required: false, signature: None },
        FuncDescriptor { name: "mono_gchandle_new", required: true, signature: None },
        FuncDescriptor { name: "mono_gchandle_get_target", required: true, signature: None },
        FuncDescriptor { name: "mono_gchandle_free", required: true, signature: None },
        FuncDescriptor { name: "mono_free", required: false, signature: None },
        FuncDescriptor {
            name: "mono_object_new",
            required: false,
            signature: Some(FuncSignature::new(
                vec![
                    ParamSpec::input(SlotKind::RawPointer),
                    ParamSpec::input(SlotKind::RawPointer),
                ],
                ReturnKind::Slot(SlotKind::ManagedRef),
            )),
        },
        FuncDescriptor {
            name: "mono_runtime_invoke",
            required: false,
            signature: Some(
                FuncSignature::new(
                    vec![
                        ParamSpec::input(SlotKind::RawPointer),
                        ParamSpec::input(SlotKind::ManagedRef),
                        ParamSpec::input(SlotKind::RawPointer),
                    ],
                    ReturnKind::Slot(SlotKind::ManagedRef),
                )
                // Gated by the `obj` argument (index 1): a caller who
                // wants the boxed handle itself rather than an
                // unboxed pointer passes it with auto-unbox disabled.
                .with_auto_unbox(1)
                // The real function's trailing `MonoObject **exc`; a
                // non-null write there becomes `Err(RemoteException)`.
                .with_exception_out(),
            ),
        },
        FuncDescriptor {
            name: "mono_string_new",
            required: false,
            signature: Some(FuncSignature::new(
                vec![
                    ParamSpec::input(SlotKind::RawPointer),
                    ParamSpec::input(SlotKind::RawPointer),
                ],
                ReturnKind::Slot(SlotKind::ManagedRef),
            )),
        },
        FuncDescriptor {
            name: "mono_string_to_utf8",
            required: false,
            signature: Some(FuncSignature::new(
                vec![ParamSpec::input(SlotKind::ManagedRef)],
                ReturnKind::StringOut,
            )),
        },
        FuncDescriptor {
            name: "mono_array_new",
            required: false,
            signature: Some(FuncSignature::new(
                vec![
                    ParamSpec::input(SlotKind::RawPointer),
                    ParamSpec::input(SlotKind::RawPointer),
                    ParamSpec::input(SlotKind::Value),
                ],
                ReturnKind::Slot(SlotKind::ManagedRef),
            )),
        },
        FuncDescriptor {
            name: "mono_object_unbox",
            required: false,
            signature: Some(FuncSignature::new(
                vec![ParamSpec::input(SlotKind::ManagedRef)],
                ReturnKind::Slot(SlotKind::RawPointer),
            )),
        },
        FuncDescriptor {
            name: "mono_array_length",
            required: false,
            signature: Some(FuncSignature::new(
                vec![ParamSpec::input(SlotKind::ManagedRef)],
                ReturnKind::Slot(SlotKind::Value),
            )),
        },
        FuncDescriptor {
            name: "mono_array_clone",
            required: false,
            signature: Some(FuncSignature::new(
                vec![ParamSpec::input(SlotKind::ManagedRef)],
                ReturnKind::Slot(SlotKind::ManagedRef),
            )),
        },
        // `mono_array_addr_with_size(array, elem_size, idx)`: returns
        // the address of the element at `idx`, used by `array_get`/
        // `array_set` as the write-barrier-aware element locator.
        FuncDescriptor {
            name: "mono_array_addr_with_size",
            required: false,
            signature: Some(FuncSignature::new(
                vec![
                    ParamSpec::input(SlotKind::ManagedRef),
                    ParamSpec::input(SlotKind::Value),
                    ParamSpec::input(SlotKind::Value),
                ],
                ReturnKind::Slot(SlotKind::RawPointer),
            )),
        },
        // `mono_gc_wbarrier_set_arrayref(array, elem_addr, val)`: the
        // managed write barrier a reference-element array store must go
        // through instead of a plain memory write.
        FuncDescriptor {
            name: "mono_gc_wbarrier_set_arrayref",
            required: false,
            signature: Some(FuncSignature::new(
                vec![
                    ParamSpec::input(SlotKind::ManagedRef),
                    ParamSpec::input(SlotKind::RawPointer),
                    ParamSpec::input(SlotKind::ManagedRef),
                ],
                ReturnKind::Void,
            )),
        },
        // Static field accessors take a raw scratch buffer for the
        // value, same shape as the instance field accessors above; no
        // marshalling wrapper needed.
        FuncDescriptor { name: "mono_field_static_get_value", required: false, signature: None },
        FuncDescriptor { name: "mono_field_static_set_value", required: false, signature: None },
    ]
}

/// Bound on the attach-time wrapper code buffer. Generous: each wrapper
/// is a handful of instructions and the registry above is small.
const CODE_BUFFER_SIZE: usize = 64 * 1024;

/// Bound on the IPC-vector primitives' own code buffer, uploaded
/// separately from the wrapper buffer above since the two are
/// generated by independent assemblers.
const IPC_VECTOR_CODE_BUFFER_SIZE: usize = 4 * 1024;

/// The three C allocator entry points the IPC-vector primitives are
/// built on, resolved the same way [`Runtime::locate_mono_module`]
/// resolves the Mono module itself: some Mono builds re-export the C
/// runtime's allocator symbols directly, so the Mono module is tried
/// first before falling back to a scan of every loaded module.
struct AllocatorAddrs {
    malloc: Rptr,
    free: Rptr,
    realloc: Rptr,
}

fn locate_allocator(backend: &dyn Backend, mono_module: &dyn Module) -> Option<AllocatorAddrs> {
    let try_module = |module: &dyn Module| -> Option<AllocatorAddrs> {
        let malloc = backend.export_address(module, "malloc").unwrap_or(None)?;
        let free = backend.export_address(module, "free").unwrap_or(None)?;
        let realloc = backend.export_address(module, "realloc").unwrap_or(None)?;
        Some(AllocatorAddrs { malloc, free, realloc })
    };

    if let Some(addrs) = try_module(mono_module) {
        return Some(addrs);
    }
    for module in backend.enumerate_modules().unwrap_or_default() {
        if let Some(addrs) = try_module(&*module) {
            return Some(addrs);
        }
    }
    None
}

/// Assemble and upload the IPC-vector primitives, returning the
/// constructed [`IpcVectorApi`] plus the code region it lives in (for
/// [`Runtime::detach`] to free). Best-effort: if the target's
/// allocator can't be resolved, enumeration support is simply
/// unavailable and this returns `Ok(None)`, same as `unbox_addrs`
/// above does for auto-unboxing.
fn provision_ipc_vector(
    backend: &dyn Backend,
    mono_module: &dyn Module,
    abi_kind: AbiKind,
) -> Result<Option<(IpcVectorApi, Rptr)>> {
    let allocator = match locate_allocator(backend, mono_module) {
        Some(a) => a,
        None => {
            debug!("malloc/free/realloc not resolvable; IPC-vector enumeration unavailable");
            return Ok(None);
        }
    };

    let is_x64 = abi_kind == AbiKind::WinX86_64;
    let ptr_width = abi_kind.ptr_width();
    let mut asm = backend.assembler();

    let new_label = asm.new_label();
    asm.bind(new_label);
    ipcvec_asm::gen_vector_new(&mut *asm, allocator.malloc, ptr_width, is_x64);

    let free_label = asm.new_label();
    asm.bind(free_label);
    ipcvec_asm::gen_vector_free(&mut *asm, allocator.free, ptr_width, is_x64);

    let grow_label = asm.new_label();
    asm.bind(grow_label);
    ipcvec_asm::gen_vector_grow(&mut *asm, allocator.realloc, ptr_width, is_x64);

    // `gen_vector_add` inlines its own growth path rather than calling
    // out to `gen_vector_grow`'s uploaded copy, so it only ever needs
    // `realloc`'s address, already known up front — no same-buffer
    // forward reference to resolve once `code_region`'s base address
    // is known.
    let add_label = asm.new_label();
    asm.bind(add_label);
    ipcvec_asm::gen_vector_add(&mut *asm, allocator.realloc, ptr_width, is_x64);

    let clear_label = asm.new_label();
    asm.bind(clear_label);
    ipcvec_asm::gen_vector_clear(&mut *asm, ptr_width);

    let length_label = asm.new_label();
    asm.bind(length_label);
    ipcvec_asm::gen_vector_length(&mut *asm, ptr_width);

    let capacity_label = asm.new_label();
    asm.bind(capacity_label);
    ipcvec_asm::gen_vector_capacity(&mut *asm, ptr_width);

    let data_label = asm.new_label();
    asm.bind(data_label);
    ipcvec_asm::gen_vector_data(&mut *asm);

    // Callback Mono's `mono_*_foreach` family calls directly; swaps the
    // (elem, user_data) argument order its native calling convention
    // hands it into the (header, elem) `VectorAdd` expects, then shares
    // `VectorAdd`'s append logic rather than calling its uploaded copy.
    let adapter_label = asm.new_label();
    asm.bind(adapter_label);
    ipcvec_asm::gen_foreach_adapter(&mut *asm, allocator.realloc, ptr_width, is_x64);

    let new_off = asm.label_offset(new_label);
    let free_off = asm.label_offset(free_label);
    let grow_off = asm.label_offset(grow_label);
    let add_off = asm.label_offset(add_label);
    let clear_off = asm.label_offset(clear_label);
    let length_off = asm.label_offset(length_label);
    let capacity_off = asm.label_offset(capacity_label);
    let data_off = asm.label_offset(data_label);
    let adapter_off = asm.label_offset(adapter_label);

    let code = asm.finalize();
    if code.len() > IPC_VECTOR_CODE_BUFFER_SIZE {
        return Err(Error::from(ErrorKind::CodeEmission(format!(
            "IPC-vector code ({} bytes) exceeds the {}-byte upload budget",
            code.len(),
            IPC_VECTOR_CODE_BUFFER_SIZE
        ))));
    }

    let code_region = backend
        .alloc(IPC_VECTOR_CODE_BUFFER_SIZE, Protection::EXECUTE_READ_WRITE)
        .chain_err(|| "allocating IPC-vector code region failed")?;
    if let Err(e) = backend.write(code_region, &code) {
        let _ = backend.free(code_region);
        return Err(e).chain_err(|| "uploading IPC-vector code failed");
    }

    let api = IpcVectorApi::new(
        code_region.offset(new_off as i64),
        code_region.offset(free_off as i64),
        code_region.offset(add_off as i64),
        code_region.offset(clear_off as i64),
        code_region.offset(length_off as i64),
        code_region.offset(capacity_off as i64),
        code_region.offset(data_off as i64),
        code_region.offset(grow_off as i64),
        code_region.offset(adapter_off as i64),
        ptr_width,
    );

    Ok(Some((api, code_region)))
}

/// A wrapped descriptor whose code has been emitted but not yet linked
/// to a final (code-region-relative) address — that address is only
/// known once the code buffer has been allocated in target memory.
struct PendingWrapper {
    name: &'static str,
    raw_addr: Rptr,
    signature: FuncSignature,
    label: usize,
}

/// Resolve every entry in `function_registry()` against `mono_module`,
/// inserting raw/unsupported entries directly into `table` and emitting
/// wrapper code for the rest into `asm`, returning the latter as
/// [`PendingWrapper`]s to be linked once the code region's base address
/// is known.
fn populate_table<A: Abi>(
    backend: &dyn Backend,
    mono_module: &dyn Module,
    asm: &mut dyn Assembler<Label = usize>,
    gchandle_get_target_addr: Rptr,
    gchandle_new_addr: Rptr,
    unbox_addrs: Option<UnboxAddrs>,
) -> Result<(FunctionTable<A>, Vec<PendingWrapper>)> {
    let mut table = FunctionTable::new();
    let mut pending = Vec::new();

    for descriptor in function_registry() {
        let addr = backend
            .export_address(mono_module, descriptor.name)
            .chain_err(|| format!("resolving {} failed", descriptor.name))?;

        let addr = match addr {
            Some(addr) => addr,
            None => {
                if descriptor.required {
                    return Err(Error::from(ErrorKind::AttachFailed(format!(
                        "required function {} is not exported by the attached target",
                        descriptor.name
                    ))));
                }
                debug!("{} not exported; marking unsupported", descriptor.name);
                table.insert(FuncEntry::unsupported(descriptor.name));
                continue;
            }
        };

        match descriptor.signature {
            None => {
                table.insert(FuncEntry::raw(descriptor.name, addr, CallingConvention::Cdecl));
            }
            Some(ref signature) => {
                let layout = layout_for::<A>(signature);
                let label = asm.new_label();
                asm.bind(label);
                funcwrap::compile_wrapper(
                    asm,
                    addr,
                    CallingConvention::Cdecl,
                    signature,
                    &layout,
                    gchandle_get_target_addr,
                    gchandle_new_addr,
                    unbox_addrs,
                    A::KIND == AbiKind::WinX86_64,
                );
                pending.push(PendingWrapper {
                    name: descriptor.name,
                    raw_addr: addr,
                    signature: signature.clone(),
                    label,
                });
            }
        }
    }

    Ok((table, pending))
}

/// Static byte size a wrapper slot occupies in the data block, matching
/// the *declared* per-call size [`crate::variant::Variant::size`] uses
/// for the same `SlotKind` — a `FuncEntry::invoke` fill pass
/// and the wrapper compiled here must agree on offsets, so a `ManagedRef`
/// slot is always `sizeof(gchandle)` here too, never pointer-width.
///
/// `Value` slots are the one case this can't get right in general: a
/// value-type blob's real size depends on the concrete type passed at
/// call time, which this table-driven compiler has no way to know ahead
/// of a call. Every `Value` slot in the current registry happens to fit
/// in a pointer-width word (see `function_registry`'s sole user,
/// `mono_array_new`'s length parameter), so pointer-width is used as the
/// slot size — functions taking a wider custom value type would need a
/// registry that carries an explicit static size per slot, which is
/// tracked as an open item in `DESIGN.md`.
fn slot_size<A: Abi>(kind: SlotKind) -> usize {
    match kind {
        SlotKind::ManagedRef => std::mem::size_of::<u32>(),
        SlotKind::RawPointer | SlotKind::Value => A::PTR_WIDTH,
    }
}

fn slot_align<A: Abi>(kind: SlotKind) -> usize {
    slot_size::<A>(kind)
}

fn layout_for<A: Abi>(signature: &FuncSignature) -> WrapperLayout {
    let mut cursor = 0usize;
    let mut params = Vec::with_capacity(signature.params.len());
    for param in &signature.params {
        let size = slot_size::<A>(param.kind);
        cursor = align_up(cursor, slot_align::<A>(param.kind));
        params.push(SlotLayout { offset: cursor, size });
        cursor += size;
    }
    // Unlike parameters, every return kind's slot in `FuncEntry::invoke`'s
    // sizing pass is pointer-width, `ManagedRef` included — match that
    // here rather than `slot_size` so offsets line up.
    let ret = match signature.ret {
        ReturnKind::Void => None,
        ReturnKind::StringOut | ReturnKind::Slot(_) => {
            cursor = align_up(cursor, A::PTR_WIDTH);
            let slot = SlotLayout { offset: cursor, size: A::PTR_WIDTH };
            cursor += A::PTR_WIDTH;
            Some(slot)
        }
    };
    let auto_unbox_gates = signature.ret_auto_unbox
        && matches!(signature.ret, ReturnKind::Slot(SlotKind::ManagedRef));
    let auto_unbox_enabled_offset = if auto_unbox_gates {
        cursor = align_up(cursor, A::PTR_WIDTH);
        let offset = cursor;
        cursor += A::PTR_WIDTH;
        Some(offset)
    } else {
        None
    };
    let unboxed_flag_offset = if auto_unbox_gates {
        cursor = align_up(cursor, A::PTR_WIDTH);
        let offset = cursor;
        cursor += A::PTR_WIDTH;
        Some(offset)
    } else {
        None
    };
    let exception_slot_offset = if signature.exception_out {
        cursor = align_up(cursor, A::PTR_WIDTH);
        let offset = cursor;
        cursor += A::PTR_WIDTH;
        Some(offset)
    } else {
        None
    };
    WrapperLayout {
        params,
        ret,
        auto_unbox_enabled_offset,
        unboxed_flag_offset,
        exception_slot_offset,
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    let align = align.max(1);
    (offset + align - 1) / align * align
}

/// The long-lived object the facade holds.
pub struct Runtime {
    backend: Arc<dyn Backend + Send + Sync>,
    dispatcher: RefCell<Option<Dispatcher>>,
    worker: RefCell<Option<CoreThread>>,
    config: Config,

    live_handles: RefCell<HashMap<u64, LiveHandleRef>>,
    next_reg_id: Cell<u64>,

    deferred_gchandles: RefCell<Vec<Gchandle>>,
    deferred_raw: RefCell<Vec<Rptr>>,

    /// Code region uploaded during attach, holding every wrapper. Freed
    /// on detach.
    code_region: Cell<Option<Rptr>>,

    /// The IPC-vector primitives, if the attached target's
    /// allocator could be resolved. `None` means enumeration-based
    /// facade methods are unavailable for this attach.
    ipc_vector: RefCell<Option<IpcVectorApi>>,
    /// Code region backing `ipc_vector`'s primitives, freed on detach.
    ipc_vector_code_region: Cell<Option<Rptr>>,

    root_domain: RefCell<Option<Rptr>>,
    attached: Cell<bool>,

    self_weak: RefCell<Weak<Runtime>>,
}

impl Runtime {
    /// Attach order:
    /// 1. Backend attach.
    /// 2. Probe processor arch, select ABI.
    /// 3. Locate the Mono embedding library.
    /// 4. Resolve each function's raw address; fail on missing required.
    /// 5. Emit wrapper machine code for every function that needs one,
    ///    relocate into a single uploaded buffer.
    /// 6. Link each function entry to its uploaded wrapper address.
    /// 7. Fetch the root domain and attach a worker thread to it.
    /// 8. Best-effort: resolve the target's allocator and upload the
    ///    IPC-vector primitives, for enumeration-based facade methods.
    ///    Their own small code generator lives alongside
    ///    `asm::boilerplate`/`asm::funcwrap` in `asm::ipcvec`.
    pub fn attach(backend: Arc<dyn Backend + Send + Sync>, config: Config) -> Result<Rc<Runtime>> {
        backend.attach().chain_err(|| "backend attach failed")?;

        let arch = backend
            .processor_arch()
            .chain_err(|| "failed to probe target processor architecture")?;
        let abi_kind = config
            .abi_override
            .or_else(|| AbiKind::for_arch(arch))
            .ok_or_else(|| {
                Error::from(ErrorKind::AttachFailed(format!(
                    "no supported ABI matches processor architecture {:?}",
                    arch
                )))
            })?;

        let mono_module = Self::locate_mono_module(&*backend)?;

        let gchandle_get_target_addr = backend
            .export_address(&*mono_module, "mono_gchandle_get_target")
            .chain_err(|| "resolving mono_gchandle_get_target failed")?
            .ok_or_else(|| {
                Error::from(ErrorKind::AttachFailed(
                    "mono_gchandle_get_target is required but not exported".into(),
                ))
            })?;
        let gchandle_new_addr = backend
            .export_address(&*mono_module, "mono_gchandle_new")
            .chain_err(|| "resolving mono_gchandle_new failed")?
            .ok_or_else(|| {
                Error::from(ErrorKind::AttachFailed(
                    "mono_gchandle_new is required but not exported".into(),
                ))
            })?;

        // Resolved best-effort: only needed to auto-unbox a boxed
        // value-type `mono_runtime_invoke` return. If
        // the attached target's Mono build is missing any of the three,
        // `mono_runtime_invoke` simply always hands back a handle, same
        // as before auto-unbox existed.
        let unbox_addrs = match (
            backend.export_address(&*mono_module, "mono_object_get_class").unwrap_or(None),
            backend.export_address(&*mono_module, "mono_class_is_valuetype").unwrap_or(None),
            backend.export_address(&*mono_module, "mono_object_unbox").unwrap_or(None),
        ) {
            (Some(object_get_class_addr), Some(class_is_valuetype_addr), Some(object_unbox_addr)) => {
                Some(UnboxAddrs {
                    object_get_class_addr,
                    class_is_valuetype_addr,
                    object_unbox_addr,
                })
            }
            _ => {
                debug!("auto-unbox boilerplate not fully exported; mono_runtime_invoke will always return a handle");
                None
            }
        };

        let mut assembler = backend.assembler();
        let (mut dispatcher, pending) = match abi_kind {
            AbiKind::WinX86 => {
                let (table, pending) = populate_table::<WinX86>(
                    &*backend,
                    &*mono_module,
                    &mut *assembler,
                    gchandle_get_target_addr,
                    gchandle_new_addr,
                    unbox_addrs,
                )?;
                (Dispatcher::WinX86(table), pending)
            }
            AbiKind::WinX86_64 => {
                let (table, pending) = populate_table::<WinX86_64>(
                    &*backend,
                    &*mono_module,
                    &mut *assembler,
                    gchandle_get_target_addr,
                    gchandle_new_addr,
                    unbox_addrs,
                )?;
                (Dispatcher::WinX86_64(table), pending)
            }
        };

        // Label offsets must be read before `finalize()` consumes the
        // assembler.
        let pending_offsets: Vec<(PendingWrapper, usize)> = pending
            .into_iter()
            .map(|p| {
                let offset = assembler.label_offset(p.label);
                (p, offset)
            })
            .collect();

        let code = assembler.finalize();
        if code.len() > CODE_BUFFER_SIZE {
            return Err(Error::from(ErrorKind::CodeEmission(format!(
                "wrapper code ({} bytes) exceeds the {}-byte upload budget",
                code.len(),
                CODE_BUFFER_SIZE
            ))));
        }

        let code_region = backend
            .alloc(CODE_BUFFER_SIZE, Protection::EXECUTE_READ_WRITE)
            .chain_err(|| "allocating wrapper code region failed")?;
        if let Err(e) = backend.write(code_region, &code) {
            let _ = backend.free(code_region);
            return Err(e).chain_err(|| "uploading wrapper code failed");
        }

        for (pending, offset) in pending_offsets {
            let wrapper_addr = code_region.offset(offset as i64);
            match &mut dispatcher {
                Dispatcher::WinX86(table) => table.insert(FuncEntry::<WinX86>::wrapped(
                    pending.name,
                    pending.raw_addr,
                    wrapper_addr,
                    CallingConvention::Cdecl,
                    pending.signature,
                )),
                Dispatcher::WinX86_64(table) => table.insert(FuncEntry::<WinX86_64>::wrapped(
                    pending.name,
                    pending.raw_addr,
                    wrapper_addr,
                    CallingConvention::Cdecl,
                    pending.signature,
                )),
            }
        }

        let root_domain_addr = backend
            .export_address(&*mono_module, "mono_get_root_domain")
            .chain_err(|| "resolving mono_get_root_domain failed")?
            .ok_or_else(|| {
                Error::from(ErrorKind::AttachFailed(
                    "mono_get_root_domain is required but not exported".into(),
                ))
            })?;
        let thread_attach_addr = backend
            .export_address(&*mono_module, "mono_thread_attach")
            .unwrap_or(None);

        let root_domain_raw = backend
            .rpc_call(root_domain_addr, CallingConvention::Cdecl, &[])
            .chain_err(|| "mono_get_root_domain failed")?;

        let worker_backend = backend.clone();
        let worker = core_thread::spawn_thread("rmono-worker", move || {
            if let Some(addr) = thread_attach_addr {
                worker_backend
                    .rpc_call(addr, CallingConvention::Cdecl, &[root_domain_raw])
                    .chain_err(|| "mono_thread_attach failed")?;
            }
            Ok(())
        })
        .chain_err(|| "failed to start and Mono-attach the worker thread")?;

        let ipc_vector = provision_ipc_vector(&*backend, &*mono_module, abi_kind)
            .chain_err(|| "provisioning IPC-vector primitives failed")?;
        let (ipc_vector_api, ipc_vector_code_region) = match ipc_vector {
            Some((api, region)) => (Some(api), Some(region)),
            None => (None, None),
        };

        let runtime = Rc::new_cyclic(|weak: &Weak<Runtime>| Runtime {
            backend,
            dispatcher: RefCell::new(Some(dispatcher)),
            worker: RefCell::new(Some(worker)),
            config,
            live_handles: RefCell::new(HashMap::new()),
            next_reg_id: Cell::new(1),
            deferred_gchandles: RefCell::new(Vec::new()),
            deferred_raw: RefCell::new(Vec::new()),
            code_region: Cell::new(Some(code_region)),
            ipc_vector: RefCell::new(ipc_vector_api),
            ipc_vector_code_region: Cell::new(ipc_vector_code_region),
            root_domain: RefCell::new(Some(Rptr(root_domain_raw))),
            attached: Cell::new(true),
            self_weak: RefCell::new(weak.clone()),
        });

        Ok(runtime)
    }

    /// Detach order, reverse of attach with care:
    /// 1. Release the worker thread (detaches cleanly before state it
    ///    depends on is invalidated).
    /// 2. Force-delete every still-registered handle.
    /// 3. Drop the IPC-vector API and free its code region, if attach
    ///    managed to provision one.
    /// 4. Reset function entries.
    /// 5. Release the injected code regions.
    /// 6. Detach the backend.
    pub fn detach(self: &Rc<Self>) -> Result<()> {
        if !self.attached.get() {
            return Err(ErrorKind::NotAttached.into());
        }

        self.flush_deferred_gchandles();
        self.flush_deferred_raw();

        *self.worker.borrow_mut() = None;

        let owner = self.owner_handle();
        let leaked: Vec<LiveHandleRef> = self.live_handles.borrow().values().cloned().collect();
        for handle in leaked {
            handle.force_delete(&*owner);
        }
        self.live_handles.borrow_mut().clear();

        *self.dispatcher.borrow_mut() = None;
        *self.ipc_vector.borrow_mut() = None;

        if let Some(region) = self.ipc_vector_code_region.take() {
            self.backend
                .free(region)
                .chain_err(|| "freeing IPC-vector code region failed")?;
        }

        if let Some(region) = self.code_region.take() {
            self.backend
                .free(region)
                .chain_err(|| "freeing wrapper code region failed")?;
        }

        self.attached.set(false);
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    pub fn is_api_supported(&self, name: &str) -> bool {
        self.dispatcher
            .borrow()
            .as_ref()
            .map(|d| d.is_supported(name))
            .unwrap_or(false)
    }

    /// Which ABI the attached target was matched to, used by callers
    /// that need the raw pointer width (e.g. reference-element array
    /// access) without going through a marshalled call.
    pub fn abi_kind(&self) -> Option<AbiKind> {
        self.dispatcher.borrow().as_ref().map(|d| d.kind())
    }

    pub fn root_domain(&self) -> Option<Rptr> {
        *self.root_domain.borrow()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The attached backend, for facade-level operations (e.g.
    /// uploading a scratch C string for `mono_string_new`) that need
    /// direct `alloc`/`write` access rather than a wrapped call.
    pub fn backend(&self) -> &(dyn Backend + Send + Sync) {
        &*self.backend
    }

    /// Run `f` with the attached IPC-vector API, if attach managed to
    /// provision one (requires the target's `malloc`/`free`/`realloc`
    /// to be resolvable). Facade-level enumeration helpers use this
    /// rather than holding their own clone, since `IpcVectorApi` only
    /// lives as long as the attach that provisioned it.
    pub fn with_ipc_vector<T>(&self, f: impl FnOnce(&IpcVectorApi, &dyn Backend) -> Result<T>) -> Result<T> {
        let guard = self.ipc_vector.borrow();
        let api = guard
            .as_ref()
            .ok_or_else(|| Error::from(ErrorKind::UnsupportedApi("IPC vector enumeration".into())))?;
        f(api, &*self.backend)
    }

    /// `Rc<dyn HandleOwner>` pointing back at this runtime, for minting
    /// handles from within `Runtime` itself (e.g. the root-domain
    /// handle).
    pub fn owner_handle(self: &Rc<Self>) -> Rc<dyn HandleOwner> {
        self.clone() as Rc<dyn HandleOwner>
    }

    pub fn root_domain_handle(self: &Rc<Self>) -> Option<RawHandle> {
        let owner = self.owner_handle();
        self.root_domain().map(|rptr| RawHandle::borrowed(rptr, &owner))
    }

    /// Invoke a marshalled (wrapped) API function by name.
    pub fn invoke(
        self: &Rc<Self>,
        name: &str,
        args: &mut [crate::variant::Variant],
    ) -> Result<crate::funcentry::Invoked> {
        if !self.attached.get() {
            return Err(ErrorKind::NotAttached.into());
        }
        let owner = self.owner_handle();
        self.dispatcher
            .borrow()
            .as_ref()
            .ok_or(ErrorKind::NotAttached)?
            .invoke(name, &*self.backend, &owner, args)
    }

    pub fn invoke_raw(&self, name: &str, args: &[u64]) -> Result<u64> {
        if !self.attached.get() {
            return Err(ErrorKind::NotAttached.into());
        }
        self.dispatcher
            .borrow()
            .as_ref()
            .ok_or(ErrorKind::NotAttached)?
            .invoke_raw(name, &*self.backend, args)
    }

    fn locate_mono_module(backend: &dyn Backend) -> Result<Box<dyn Module>> {
        if let Some(m) = backend
            .get_module("mono.dll")
            .chain_err(|| "enumerating modules failed")?
        {
            return Ok(m);
        }
        for module in backend
            .enumerate_modules()
            .chain_err(|| "enumerating modules failed")?
        {
            if backend
                .export_address(&*module, "mono_get_root_domain")
                .unwrap_or(None)
                .is_some()
            {
                return Ok(module);
            }
        }
        Err(ErrorKind::AttachFailed("no loaded module exports mono_get_root_domain".into()).into())
    }

    /// Run both deferred-free buffers now rather than waiting for the
    /// threshold or detach.
    pub fn flush_deferred_frees(&self) {
        self.flush_deferred_gchandles();
        self.flush_deferred_raw();
    }

    /// Flush the GC-handle deferred-free buffer. Currently issues one `mono_gchandle_free` RPC
    /// per buffered handle: a real batched free-multi target stub needs
    /// its own injected code, tracked as the same open item as the IPC
    /// vector in `DESIGN.md`. This still bounds buffer growth and gives
    /// callers an explicit flush point, which is the observable contract
    /// the rest of the engine depends on; only the single-RPC-per-flush
    /// performance goal is deferred.
    fn flush_deferred_gchandles(&self) {
        let mut buf = self.deferred_gchandles.borrow_mut();
        if buf.is_empty() {
            return;
        }
        for gchandle in buf.drain(..) {
            if let Err(e) = self.invoke_raw("mono_gchandle_free", &[gchandle as u64]) {
                warn!("mono_gchandle_free failed during flush: {}", e);
            }
        }
    }

    fn flush_deferred_raw(&self) {
        let mut buf = self.deferred_raw.borrow_mut();
        if buf.is_empty() {
            return;
        }
        for ptr in buf.drain(..) {
            if let Err(e) = self.invoke_raw("mono_free", &[ptr.0]) {
                warn!("mono_free failed during flush: {}", e);
            }
        }
    }
}

impl HandleOwner for Runtime {
    fn free_raw(&self, value: Rptr, deleter: RawDeleter) {
        match deleter {
            RawDeleter::None => {}
            RawDeleter::HeapFree => {
                let mut buf = self.deferred_raw.borrow_mut();
                buf.push(value);
                if buf.len() >= self.config.raw_free_buffer_max {
                    drop(buf);
                    self.flush_deferred_raw();
                }
            }
            RawDeleter::AssemblyNameFree => {
                if let Err(e) = self.invoke_raw("mono_assembly_name_free", &[value.0]) {
                    warn!("mono_assembly_name_free failed: {}", e);
                }
            }
            RawDeleter::MethodDescFree => {
                if let Err(e) = self.invoke_raw("mono_method_desc_free", &[value.0]) {
                    warn!("mono_method_desc_free failed: {}", e);
                }
            }
        }
    }

    fn free_gchandle(&self, gchandle: Gchandle) {
        let mut buf = self.deferred_gchandles.borrow_mut();
        buf.push(gchandle);
        if buf.len() >= self.config.gchandle_free_buffer_max {
            drop(buf);
            self.flush_deferred_gchandles();
        }
    }

    fn gchandle_get_target(&self, gchandle: Gchandle) -> Rptr {
        match self.invoke_raw("mono_gchandle_get_target", &[gchandle as u64]) {
            Ok(raw) => Rptr(raw),
            Err(e) => {
                warn!("mono_gchandle_get_target failed: {}", e);
                Rptr::NULL
            }
        }
    }

    fn gchandle_new(&self, raw: Rptr, pinned: bool) -> Gchandle {
        match self.invoke_raw("mono_gchandle_new", &[raw.0, pinned as u64]) {
            Ok(g) => g as Gchandle,
            Err(e) => {
                warn!("mono_gchandle_new failed: {}", e);
                crate::types::GCHANDLE_INVALID
            }
        }
    }

    fn register_handle(&self, entry: LiveHandleRef) -> HandleRegId {
        let id = self.next_reg_id.get();
        self.next_reg_id.set(id + 1);
        self.live_handles.borrow_mut().insert(id, entry);
        HandleRegId(id)
    }

    fn unregister_handle(&self, id: HandleRegId) {
        self.live_handles.borrow_mut().remove(&id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessorArch;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeModule;
    impl Module for FakeModule {
        fn name(&self) -> &str {
            "mono.dll"
        }
        fn base_address(&self) -> Rptr {
            Rptr(0x1000_0000)
        }
    }

    /// A minimal backend that exports only `mono_get_root_domain` and
    /// the two gchandle functions, enough to exercise attach's required-
    /// function gate and the worker-thread/root-domain bootstrap without
    /// any wrapped (marshalled) function needing real codegen support.
    struct FakeBackend {
        memory: Mutex<StdHashMap<u64, Vec<u8>>>,
        next_addr: Mutex<u64>,
    }

    impl FakeBackend {
        fn new() -> Self {
            FakeBackend {
                memory: Mutex::new(StdHashMap::new()),
                next_addr: Mutex::new(0x5000),
            }
        }
    }

    const ADDR_ROOT_DOMAIN: u64 = 0x10;
    const ADDR_GCHANDLE_GET_TARGET: u64 = 0x11;
    const ADDR_GCHANDLE_NEW: u64 = 0x12;
    const ADDR_GCHANDLE_FREE: u64 = 0x13;

    impl Backend for FakeBackend {
        fn attach(&self) -> Result<()> {
            Ok(())
        }
        fn get_module(&self, name: &str) -> Result<Option<Box<dyn Module>>> {
            if name == "mono.dll" {
                Ok(Some(Box::new(FakeModule)))
            } else {
                Ok(None)
            }
        }
        fn enumerate_modules(&self) -> Result<Vec<Box<dyn Module>>> {
            Ok(vec![Box::new(FakeModule)])
        }
        fn export_address(&self, _module: &dyn Module, symbol: &str) -> Result<Option<Rptr>> {
            Ok(match symbol {
                "mono_get_root_domain" => Some(Rptr(ADDR_ROOT_DOMAIN)),
                "mono_gchandle_get_target" => Some(Rptr(ADDR_GCHANDLE_GET_TARGET)),
                "mono_gchandle_new" => Some(Rptr(ADDR_GCHANDLE_NEW)),
                "mono_gchandle_free" => Some(Rptr(ADDR_GCHANDLE_FREE)),
                _ => None,
            })
        }
        fn alloc(&self, size: usize, _protection: Protection) -> Result<Rptr> {
            let mut n = self.next_addr.lock().unwrap();
            let addr = *n;
            *n += size as u64 + 0x100;
            self.memory.lock().unwrap().insert(addr, vec![0u8; size]);
            Ok(Rptr(addr))
        }
        fn free(&self, ptr: Rptr) -> Result<()> {
            self.memory.lock().unwrap().remove(&ptr.0);
            Ok(())
        }
        fn read(&self, ptr: Rptr, dst: &mut [u8]) -> Result<()> {
            let mem = self.memory.lock().unwrap();
            let bytes = mem.get(&ptr.0).expect("read from unmapped fake address");
            dst.copy_from_slice(&bytes[..dst.len()]);
            Ok(())
        }
        fn write(&self, ptr: Rptr, src: &[u8]) -> Result<()> {
            self.memory
                .lock()
                .unwrap()
                .entry(ptr.0)
                .or_insert_with(|| vec![0u8; src.len().max(1)])[..src.len()]
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
            Box::new(NullAssembler { next_label: 0, len: 0 })
        }
        fn rpc_call(&self, addr: Rptr, _cc: CallingConvention, args: &[u64]) -> Result<u64> {
            match addr.0 {
                ADDR_ROOT_DOMAIN => Ok(0xD0),
                ADDR_GCHANDLE_GET_TARGET => Ok(0x1234),
                ADDR_GCHANDLE_NEW => Ok(args.first().copied().unwrap_or(0)),
                ADDR_GCHANDLE_FREE => Ok(0),
                other => panic!("unexpected rpc_call to 0x{:x}", other),
            }
        }
    }

    /// Assembler stand-in that emits nothing and tracks only enough
    /// state for labels to resolve to stable offsets.
    struct NullAssembler {
        next_label: usize,
        len: usize,
    }

    impl Assembler for NullAssembler {
        type Label = usize;
        fn new_label(&mut self) -> usize {
            let l = self.next_label;
            self.next_label += 1;
            l
        }
        fn bind(&mut self, _label: usize) {
            self.len += 1;
        }
        fn mov(&mut self, _dst: crate::backend::Operand, _src: crate::backend::Operand) {}
        fn xor(&mut self, _dst: crate::backend::Operand, _src: crate::backend::Operand) {}
        fn add(&mut self, _dst: crate::backend::Operand, _src: crate::backend::Operand) {}
        fn sub(&mut self, _dst: crate::backend::Operand, _src: crate::backend::Operand) {}
        fn push(&mut self, _src: crate::backend::Operand) {}
        fn pop(&mut self, _dst: crate::backend::Operand) {}
        fn ret(&mut self) {}
        fn call_reg(&mut self, _reg: crate::backend::Reg) {}
        fn jump_if_zero(&mut self, _reg: crate::backend::Reg, _label: usize) {}
        fn jump(&mut self, _label: usize) {}
        fn gen_call(
            &mut self,
            _addr: Rptr,
            _args: &[crate::backend::AsmArg],
            _return_into: Option<usize>,
            _calling_conv: CallingConvention,
        ) {
        }
        fn finalize(self: Box<Self>) -> Vec<u8> {
            vec![0u8; self.len.max(1)]
        }
        fn label_offset(&self, label: usize) -> usize {
            label
        }
    }

    #[test]
    fn attach_fails_without_required_gchandle_functions() {
        struct Bare;
        impl Backend for Bare {
            fn attach(&self) -> Result<()> {
                Ok(())
            }
            fn get_module(&self, _name: &str) -> Result<Option<Box<dyn Module>>> {
                Ok(Some(Box::new(FakeModule)))
            }
            fn enumerate_modules(&self) -> Result<Vec<Box<dyn Module>>> {
                Ok(vec![Box::new(FakeModule)])
            }
            fn export_address(&self, _module: &dyn Module, symbol: &str) -> Result<Option<Rptr>> {
                if symbol == "mono_get_root_domain" {
                    Ok(Some(Rptr(ADDR_ROOT_DOMAIN)))
                } else {
                    Ok(None)
                }
            }
            fn alloc(&self, _size: usize, _protection: Protection) -> Result<Rptr> {
                Ok(Rptr(0x9000))
            }
            fn free(&self, _ptr: Rptr) -> Result<()> {
                Ok(())
            }
            fn read(&self, _ptr: Rptr, _dst: &mut [u8]) -> Result<()> {
                Ok(())
            }
            fn write(&self, _ptr: Rptr, _src: &[u8]) -> Result<()> {
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
                Box::new(NullAssembler { next_label: 0, len: 0 })
            }
            fn rpc_call(&self, _addr: Rptr, _cc: CallingConvention, _args: &[u64]) -> Result<u64> {
                Ok(0)
            }
        }

        let result = Runtime::attach(Arc::new(Bare), Config::default());
        assert!(result.is_err());
    }

    #[test]
    fn attach_succeeds_and_detach_clears_state() {
        let runtime = Runtime::attach(Arc::new(FakeBackend::new()), Config::default()).unwrap();
        assert!(runtime.is_attached());
        assert!(runtime.is_api_supported("mono_gchandle_new"));
        assert!(!runtime.is_api_supported("mono_nonexistent"));
        assert_eq!(runtime.root_domain(), Some(Rptr(0xD0)));

        runtime.detach().unwrap();
        assert!(!runtime.is_attached());
        // A second detach is rejected rather than double-freeing state.
        assert!(runtime.detach().is_err());
    }

    #[test]
    fn deferred_gchandle_free_flushes_at_configured_threshold() {
        let runtime = Runtime::attach(
            Arc::new(FakeBackend::new()),
            Config::default().with_gchandle_free_buffer_max(2),
        )
        .unwrap();

        let owner: &dyn HandleOwner = &*runtime;
        owner.free_gchandle(1);
        assert_eq!(runtime.deferred_gchandles.borrow().len(), 1);
        owner.free_gchandle(2);
        // Buffer reached its threshold of 2 and was flushed.
        assert_eq!(runtime.deferred_gchandles.borrow().len(), 0);

        runtime.detach().unwrap();
    }

    #[test]
    fn managed_handle_roundtrips_through_owner_handle() {
        let runtime = Runtime::attach(Arc::new(FakeBackend::new()), Config::default()).unwrap();
        let owner = runtime.owner_handle();
        let handle = crate::handle::ManagedHandle::new(7, true, &owner);
        assert_eq!(handle.raw(), Rptr(0x1234));
        runtime.detach().unwrap();
    }

    /// The handle-count half of the attach/appdomain/detach lifecycle:
    /// every owned handle a caller drops before `detach()`
    /// must leave no trace in the live-handle registry, so `detach()`
    /// never has anything to force-free for code that cleans up after
    /// itself.
    #[test]
    fn live_handle_count_returns_to_zero_after_drop_then_detach_stays_clean() {
        let runtime = Runtime::attach(Arc::new(FakeBackend::new()), Config::default()).unwrap();
        let owner = runtime.owner_handle();

        assert_eq!(runtime.live_handles.borrow().len(), 0);

        let handles: Vec<crate::handle::ManagedHandle> = (1..=5)
            .map(|g| crate::handle::ManagedHandle::new(g, true, &owner))
            .collect();
        assert_eq!(runtime.live_handles.borrow().len(), 5);

        drop(handles);
        assert_eq!(runtime.live_handles.borrow().len(), 0);

        runtime.detach().unwrap();
        assert!(!runtime.is_attached());
    }
}
