// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Method-per-API facade.
//!
//! Grounded on `audioipc-client`'s `ClientContext`: a thin owner of the
//! core crate's long-lived object (`Rc<Runtime>` here, the client
//! crate's RPC sender there) with one method per operation a caller
//! actually wants, translating core error/return shapes into whatever
//! is most convenient at this layer (`String` instead of raw UTF-8
//! bytes, `Vec<ManagedHandle>` instead of a raw array handle, etc).

use std::rc::Rc;

use rmono_core::errors::ResultExt;
use rmono_core::funcentry::Invoked;
use rmono_core::handle::{HandleOwner, ManagedHandle};
use rmono_core::variant::{Variant, ValueBuf, VariantKind};
use rmono_core::{Config, Error, ErrorKind, Result, Rptr, Runtime};

/// Which shape a static field's raw value buffer takes. Needed by
/// [`Facade::field_static_get_value`] since, unlike an instance field
/// read through `FieldHelper`, the call carries no type information of
/// its own to size the scratch buffer from.
pub enum StaticFieldShape {
    /// A value-type field, `size` bytes wide.
    Value(usize),
    /// A reference-type field: one pointer-width slot holding a
    /// `MonoObject*`.
    ManagedRef,
}

/// Owns the attached [`Runtime`] and exposes one method per wrapped
/// Mono API function plus a handful of convenience utilities: array
/// <-> `Vec` conversion, array element get/set, static field access,
/// and explicit deferred-free flush control.
///
/// `Clone` is cheap (an `Rc` bump) so `helper::HelperContext` can hold
/// its own owned copy rather than a borrow.
#[derive(Clone)]
pub struct Facade {
    runtime: Rc<Runtime>,
}

impl Facade {
    pub fn attach(backend: std::sync::Arc<dyn rmono_core::backend::Backend + Send + Sync>, config: Config) -> Result<Self> {
        let runtime = Runtime::attach(backend, config)?;
        debug!("facade attached to target, root domain {:?}", runtime.root_domain());
        Ok(Facade { runtime })
    }

    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    pub fn detach(&self) -> Result<()> {
        debug!("facade detaching");
        self.runtime.detach()
    }

    pub fn is_attached(&self) -> bool {
        self.runtime.is_attached()
    }

    /// Whether the attached target's Mono build exports `name`.
    pub fn is_api_supported(&self, name: &str) -> bool {
        self.runtime.is_api_supported(name)
    }

    pub fn root_domain(&self) -> Option<Rptr> {
        self.runtime.root_domain()
    }

    /// Passthrough to the dispatcher's raw view, for the handful of
    /// lookup functions (`mono_class_from_name`,
    /// `mono_class_get_method_from_name`, ...) that need no data-block
    /// marshalling at all — used by `helper::HelperContext`.
    pub fn invoke_raw(&self, name: &str, args: &[u64]) -> Result<u64> {
        self.runtime.invoke_raw(name, args)
    }

    /// `mono_object_new(domain, klass)`.
    pub fn object_new(&self, domain: Rptr, klass: Rptr) -> Result<ManagedHandle> {
        let mut args = [Variant::raw_pointer(domain), Variant::raw_pointer(klass)];
        expect_managed_ref(self.runtime.invoke("mono_object_new", &mut args)?, "mono_object_new")
    }

    /// `mono_string_new(domain, text)`: allocates the managed string in
    /// the target from a local `&str`.
    pub fn string_new(&self, domain: Rptr, text: &str) -> Result<ManagedHandle> {
        let cstr = std::ffi::CString::new(text)
            .map_err(|_| Error::from(ErrorKind::InvalidPrecondition("string contains an interior NUL".into())))?;
        // The raw C string has to live somewhere the target can read it
        // from; `mono_string_new` itself is only resolved/wrapped, it
        // does not also own allocating that scratch buffer — the facade
        // asks the dispatcher's raw view for `mono_free`-style target
        // scratch only where the wrapped signature already expects a
        // `RawPointer` argument, so the bytes are passed by value
        // through the data block instead, matching `SlotKind::RawPointer`'s
        // verbatim pass-through contract.
        let ptr = self.upload_cstring(&cstr)?;
        let mut args = [Variant::raw_pointer(domain), Variant::raw_pointer(ptr)];
        expect_managed_ref(self.runtime.invoke("mono_string_new", &mut args)?, "mono_string_new")
    }

    /// `mono_string_to_utf8`: returns an owned, UTF-8-validated `String`.
    pub fn string_to_utf8(&self, string: &ManagedHandle) -> Result<String> {
        let mut args = [Variant::managed_ref(string.clone())];
        match self.runtime.invoke("mono_string_to_utf8", &mut args)? {
            Invoked::Bytes(bytes) => String::from_utf8(bytes)
                .map_err(|_| Error::from(ErrorKind::InvalidPrecondition("target string is not valid UTF-8".into()))),
            other => Err(unexpected_result("mono_string_to_utf8", &other)),
        }
    }

    /// `mono_runtime_invoke(method, obj, params)`. `params` is `None`
    /// for a null parameter array.
    pub fn runtime_invoke(
        &self,
        method: Rptr,
        obj: &ManagedHandle,
        params: Option<Rptr>,
    ) -> Result<Invoked> {
        let mut args = [
            Variant::raw_pointer(method),
            Variant::managed_ref(obj.clone()),
            Variant::raw_pointer(params.unwrap_or(Rptr::NULL)),
        ];
        match self.runtime.invoke("mono_runtime_invoke", &mut args) {
            Err(err) => match err.kind() {
                ErrorKind::RemoteException(exception, _) => {
                    let message = self.describe_exception(exception);
                    Err(Error::from(ErrorKind::RemoteException(exception.clone(), message)))
                }
                _ => Err(err),
            },
            ok => ok,
        }
    }

    /// `mono_array_new(domain, element_class, length)`.
    pub fn array_new(&self, domain: Rptr, element_class: Rptr, length: u64) -> Result<ManagedHandle> {
        let mut args = [
            Variant::raw_pointer(domain),
            Variant::raw_pointer(element_class),
            Variant::from_pod::<u64>(length),
        ];
        expect_managed_ref(self.runtime.invoke("mono_array_new", &mut args)?, "mono_array_new")
    }

    /// `mono_object_unbox`: returns the raw pointer to the boxed
    /// value's payload.
    pub fn object_unbox(&self, obj: &ManagedHandle) -> Result<Rptr> {
        let mut args = [Variant::managed_ref(obj.clone())];
        match self.runtime.invoke("mono_object_unbox", &mut args)? {
            Invoked::Value(v) => match v.kind() {
                VariantKind::RawPointer(ptr) => Ok(*ptr),
                _ => Err(unexpected_result("mono_object_unbox", &Invoked::Value(v.clone()))),
            },
            other => Err(unexpected_result("mono_object_unbox", &other)),
        }
    }

    /// `mono_gchandle_new`/`mono_gchandle_free` thin wrapper for callers
    /// that want a handle to an already-known raw object pointer
    /// without going through a constructing API call.
    pub fn wrap_raw_object(&self, raw: Rptr, pinned: bool) -> ManagedHandle {
        let owner = self.runtime.owner_handle();
        let gchandle = owner.gchandle_new(raw, pinned);
        ManagedHandle::new(gchandle, true, &owner)
    }

    /// Explicit deferred-free flush, for callers who want buffered frees to run now
    /// rather than waiting for the threshold or detach.
    pub fn flush_deferred_frees(&self) -> Result<()> {
        self.runtime.flush_deferred_frees();
        Ok(())
    }

    /// `mono_assembly_foreach`, collected into a `Vec<Rptr>` of
    /// `MonoAssembly*` rather than handed back one callback at a time.
    /// Drives the attached target's IPC vector: the vector's own
    /// foreach-adapter trampoline is passed as `mono_assembly_foreach`'s
    /// callback, with the vector itself as that call's `user_data`, the
    /// same role `RMonoAPIBackend::assemblyForeach` hands its IPCVector
    /// instance in the original.
    pub fn enumerate_assemblies(&self) -> Result<Vec<Rptr>> {
        self.runtime.with_ipc_vector(|ipc_vector, backend| {
            let v = ipc_vector.create(backend, rmono_core::ipcvec::DEFAULT_CAPACITY)?;
            let result = ipc_vector.drain_enumeration(backend, v, || {
                self.runtime
                    .invoke_raw("mono_assembly_foreach", &[ipc_vector.adapter().0, v.0])
                    .map(|_| ())
            });
            let _ = ipc_vector.free(backend, v);
            result
        })
    }

    /// `mono_array_length(array)`.
    pub fn array_length(&self, array: &ManagedHandle) -> Result<u64> {
        let mut args = [Variant::managed_ref(array.clone())];
        match self.runtime.invoke("mono_array_length", &mut args)? {
            Invoked::Value(v) => match v.kind() {
                VariantKind::Value(buf) => {
                    let bytes = buf.as_bytes();
                    let mut widened = [0u8; 8];
                    widened[..bytes.len()].copy_from_slice(bytes);
                    Ok(u64::from_ne_bytes(widened))
                }
                _ => Err(unexpected_result("mono_array_length", &Invoked::Value(v.clone()))),
            },
            other => Err(unexpected_result("mono_array_length", &other)),
        }
    }

    /// `mono_array_addr_with_size(array, elem_size, idx)`: the address
    /// of the element at `idx`, used as the element locator by every
    /// array element accessor below.
    fn array_addr_with_size(&self, array: &ManagedHandle, elem_size: i32, idx: u64) -> Result<Rptr> {
        let mut args = [
            Variant::managed_ref(array.clone()),
            Variant::from_pod::<i32>(elem_size),
            Variant::from_pod::<u64>(idx),
        ];
        match self.runtime.invoke("mono_array_addr_with_size", &mut args)? {
            Invoked::Value(v) => match v.kind() {
                VariantKind::RawPointer(ptr) => Ok(*ptr),
                _ => Err(unexpected_result("mono_array_addr_with_size", &Invoked::Value(v.clone()))),
            },
            other => Err(unexpected_result("mono_array_addr_with_size", &other)),
        }
    }

    /// Reads the value-type element at `idx` directly out of target
    /// memory. Value-type elements are copied in and out, never
    /// referenced, so no write barrier is involved.
    pub fn array_get_value<T: bytemuck::Pod>(&self, array: &ManagedHandle, idx: u64) -> Result<T> {
        let elem_size = std::mem::size_of::<T>();
        let addr = self.array_addr_with_size(array, elem_size as i32, idx)?;
        let mut bytes = vec![0u8; elem_size];
        self.runtime
            .backend()
            .read(addr, &mut bytes)
            .chain_err(|| "reading array element failed")?;
        Ok(*bytemuck::from_bytes::<T>(&bytes))
    }

    /// Writes the value-type element at `idx` directly into target
    /// memory.
    pub fn array_set_value<T: bytemuck::Pod>(&self, array: &ManagedHandle, idx: u64, value: T) -> Result<()> {
        let elem_size = std::mem::size_of::<T>();
        let addr = self.array_addr_with_size(array, elem_size as i32, idx)?;
        self.runtime
            .backend()
            .write(addr, bytemuck::bytes_of(&value))
            .chain_err(|| "writing array element failed")
    }

    /// Reads the reference-typed element at `idx`: the element address
    /// holds a raw `MonoObject*`, read directly and wrapped in a fresh
    /// handle. No write barrier is needed for a read.
    pub fn array_get_ref(&self, array: &ManagedHandle, idx: u64) -> Result<ManagedHandle> {
        let width = self.ptr_width()?;
        let addr = self.array_addr_with_size(array, width as i32, idx)?;
        let mut bytes = vec![0u8; width];
        self.runtime
            .backend()
            .read(addr, &mut bytes)
            .chain_err(|| "reading array element failed")?;
        let mut widened = [0u8; 8];
        widened[..width].copy_from_slice(&bytes);
        Ok(self.wrap_raw_object(Rptr(u64::from_ne_bytes(widened)), false))
    }

    /// Stores a reference-typed element at `idx` through
    /// `mono_gc_wbarrier_set_arrayref`, the managed write barrier a
    /// reference-element array store has to go through instead of a
    /// plain memory write.
    pub fn array_set_ref(&self, array: &ManagedHandle, idx: u64, value: &ManagedHandle) -> Result<()> {
        let width = self.ptr_width()?;
        let addr = self.array_addr_with_size(array, width as i32, idx)?;
        let mut args = [
            Variant::managed_ref(array.clone()),
            Variant::raw_pointer(addr),
            Variant::managed_ref(value.clone()),
        ];
        self.runtime.invoke("mono_gc_wbarrier_set_arrayref", &mut args)?;
        Ok(())
    }

    /// Allocates a managed array sized to `values.len()` and copies
    /// each element in via [`Facade::array_set_value`]. The inverse of
    /// [`Facade::array_as_vector`].
    pub fn array_from_vector<T: bytemuck::Pod>(
        &self,
        domain: Rptr,
        element_class: Rptr,
        values: &[T],
    ) -> Result<ManagedHandle> {
        let array = self.array_new(domain, element_class, values.len() as u64)?;
        for (idx, value) in values.iter().enumerate() {
            self.array_set_value(&array, idx as u64, *value)?;
        }
        Ok(array)
    }

    /// Reads every element of a value-typed managed array back into a
    /// local `Vec`. The inverse of [`Facade::array_from_vector`].
    pub fn array_as_vector<T: bytemuck::Pod>(&self, array: &ManagedHandle) -> Result<Vec<T>> {
        let len = self.array_length(array)?;
        let mut values = Vec::with_capacity(len as usize);
        for idx in 0..len {
            values.push(self.array_get_value::<T>(array, idx)?);
        }
        Ok(values)
    }

    /// `mono_field_static_set_value(vtable, field, value)`. `value`'s
    /// bytes (or, for a managed reference, its raw pointer) are
    /// uploaded into a scratch buffer the call reads from, the same
    /// shape `RMonoAPI::fieldStaticSetValue` passes through an
    /// `RMonoVariant`.
    pub fn field_static_set_value(&self, vtable: Rptr, field: Rptr, value: &Variant) -> Result<()> {
        let backend = self.runtime.backend();
        let bytes: Vec<u8> = match value.kind() {
            VariantKind::Value(buf) => buf.as_bytes().to_vec(),
            VariantKind::ManagedRef(handle) => {
                let width = self.ptr_width()?;
                handle.raw().0.to_ne_bytes()[..width].to_vec()
            }
            VariantKind::RawPointer(ptr) => {
                let width = self.ptr_width()?;
                ptr.0.to_ne_bytes()[..width].to_vec()
            }
            VariantKind::Invalid => {
                return Err(Error::from(ErrorKind::InvalidPrecondition(
                    "static field value must not be Invalid".into(),
                )))
            }
        };
        let scratch = backend
            .alloc(bytes.len().max(1), rmono_core::types::Protection::READ_WRITE)
            .chain_err(|| "allocating static field scratch buffer failed")?;
        backend
            .write(scratch, &bytes)
            .chain_err(|| "uploading static field value failed")?;
        let result = self.invoke_raw("mono_field_static_set_value", &[vtable.0, field.0, scratch.0]);
        let _ = backend.free(scratch);
        result.map(|_| ())
    }

    /// `mono_field_static_get_value(vtable, field, out)`, where `out`
    /// is a scratch buffer sized/typed by `shape` since the call
    /// itself carries no type information to size it from.
    pub fn field_static_get_value(&self, vtable: Rptr, field: Rptr, shape: StaticFieldShape) -> Result<Variant> {
        let backend = self.runtime.backend();
        let size = match shape {
            StaticFieldShape::Value(size) => size.max(1),
            StaticFieldShape::ManagedRef => self.ptr_width()?,
        };
        let scratch = backend
            .alloc(size, rmono_core::types::Protection::READ_WRITE)
            .chain_err(|| "allocating static field scratch buffer failed")?;
        let invoke_result = self.invoke_raw("mono_field_static_get_value", &[vtable.0, field.0, scratch.0]);
        let read_result = invoke_result.and_then(|_| {
            let mut bytes = vec![0u8; size];
            backend
                .read(scratch, &mut bytes)
                .chain_err(|| "reading static field value failed")?;
            match shape {
                StaticFieldShape::Value(_) => Ok(Variant::value(ValueBuf::from_bytes(&bytes))),
                StaticFieldShape::ManagedRef => {
                    let mut widened = [0u8; 8];
                    widened[..bytes.len()].copy_from_slice(&bytes);
                    let raw = Rptr(u64::from_ne_bytes(widened));
                    Ok(Variant::managed_ref(self.wrap_raw_object(raw, false)))
                }
            }
        });
        let _ = backend.free(scratch);
        read_result
    }

    /// Raw pointer width of the attached target's ABI, needed by the
    /// reference-element array accessors and static-field accessors to
    /// size a pointer-typed scratch slot without a marshalled call.
    fn ptr_width(&self) -> Result<usize> {
        self.runtime
            .abi_kind()
            .map(|kind| kind.ptr_width())
            .ok_or_else(|| Error::from(ErrorKind::NotAttached))
    }

    /// Fetch a human-readable description of a remote exception via
    /// `mono_object_to_string`, fetched lazily so the common
    /// no-exception path never pays for it. Falls back to a generic
    /// message if the stringify call itself fails (e.g. the target's
    /// `ToString` override throws too).
    fn describe_exception(&self, exception: &ManagedHandle) -> String {
        let raw = exception.raw();
        self.invoke_raw("mono_object_to_string", &[raw.0, 0])
            .map(|result| self.wrap_raw_object(Rptr(result), false))
            .and_then(|string_obj| self.string_to_utf8(&string_obj))
            .unwrap_or_else(|_| "unhandled managed exception".to_string())
    }

    fn upload_cstring(&self, cstr: &std::ffi::CStr) -> Result<Rptr> {
        let bytes = cstr.to_bytes_with_nul();
        let backend = self.runtime.backend();
        let ptr = backend
            .alloc(bytes.len(), rmono_core::types::Protection::READ_WRITE)
            .chain_err(|| "allocating scratch string failed")?;
        backend
            .write(ptr, bytes)
            .chain_err(|| "uploading scratch string failed")?;
        Ok(ptr)
    }
}

fn expect_managed_ref(invoked: Invoked, name: &'static str) -> Result<ManagedHandle> {
    match invoked {
        Invoked::Value(v) => match v.kind() {
            VariantKind::ManagedRef(handle) => Ok(handle.clone()),
            _ => Err(unexpected_result(name, &Invoked::Value(v.clone()))),
        },
        other => Err(unexpected_result(name, &other)),
    }
}

fn unexpected_result(name: &'static str, invoked: &Invoked) -> Error {
    Error::from(ErrorKind::InvalidPrecondition(format!(
        "{}: unexpected result shape {:?}",
        name, invoked
    )))
}
