// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Fluent helper layer, supplemented from
//! `remotemono`'s `helper/impl/RMonoClass_*.h`/`RMonoField_*.h`/
//! `RMonoMethod_*.h`/`RMonoObject_*.h`/`RMonoProperty_*.h`.
//!
//! This is a thin convenience wrapper, not a second marshalling layer:
//! every method here resolves a name to a target address (caching the
//! result in [`HelperContext`]) and then calls straight through to
//! [`Facade`]/[`rmono_core::Runtime::invoke_raw`]. No new wire format,
//! no independent caching policy beyond plain by-name memoisation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;

use rmono_core::errors::ResultExt;
use rmono_core::funcentry::Invoked;
use rmono_core::handle::ManagedHandle;
use rmono_core::types::Protection;
use rmono_core::{Error, ErrorKind, Result, Rptr};

use crate::facade::Facade;

/// Holds the attached [`Facade`] plus by-name lookup caches for
/// classes/methods/fields/properties resolved so far this session
///. The cache is a plain `Rptr` table
/// rather than anything GC-handle-backed: classes, methods, fields and
/// properties are metadata objects the target itself keeps alive for
/// the process lifetime, never collected, so there is nothing to pin
/// or re-validate.
#[derive(Clone)]
pub struct HelperContext {
    facade: Facade,
    classes: std::rc::Rc<RefCell<HashMap<(String, String), Rptr>>>,
    methods: std::rc::Rc<RefCell<HashMap<(u64, String, i32), Rptr>>>,
}

impl HelperContext {
    pub fn new(facade: Facade) -> Self {
        HelperContext {
            facade,
            classes: std::rc::Rc::new(RefCell::new(HashMap::new())),
            methods: std::rc::Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn facade(&self) -> &Facade {
        &self.facade
    }

    /// `mono_class_from_name(image, namespace, name)`, cached by
    /// `(namespace, name)` within this `image`'s lookups.
    pub fn class(&self, image: Rptr, namespace: &str, name: &str) -> Result<ClassHelper> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(&class) = self.classes.borrow().get(&key) {
            return Ok(ClassHelper { ctx: self.clone(), class });
        }

        let ns_ptr = self.upload_cstring(namespace)?;
        let name_ptr = self.upload_cstring(name)?;
        let result = self
            .facade
            .invoke_raw("mono_class_from_name", &[image.0, ns_ptr.0, name_ptr.0])
            .chain_err(|| format!("mono_class_from_name({}.{}) failed", namespace, name))?;
        if result == 0 {
            return Err(Error::from(ErrorKind::InvalidPrecondition(format!(
                "class {}.{} not found",
                namespace, name
            ))));
        }
        let class = Rptr(result);
        debug!("resolved class {}.{} to {:?}", namespace, name, class);
        self.classes.borrow_mut().insert(key, class);
        Ok(ClassHelper { ctx: self.clone(), class })
    }

    fn upload_cstring(&self, s: &str) -> Result<Rptr> {
        let cstr = CString::new(s)
            .map_err(|_| Error::from(ErrorKind::InvalidPrecondition("string contains an interior NUL".into())))?;
        let bytes = cstr.as_bytes_with_nul();
        let backend = self.facade.runtime().backend();
        let ptr = backend
            .alloc(bytes.len(), Protection::READ_WRITE)
            .chain_err(|| "allocating scratch string failed")?;
        backend.write(ptr, bytes).chain_err(|| "uploading scratch string failed")?;
        Ok(ptr)
    }
}

/// A resolved `MonoClass*`, bound to the [`HelperContext`] it was
/// looked up through (`class.field("x").get_value(obj)`).
#[derive(Clone)]
pub struct ClassHelper {
    ctx: HelperContext,
    class: Rptr,
}

impl ClassHelper {
    pub fn raw(&self) -> Rptr {
        self.class
    }

    /// `mono_object_new(domain, self)`.
    pub fn new_instance(&self, domain: Rptr) -> Result<ManagedHandle> {
        self.ctx.facade.object_new(domain, self.class)
    }

    /// `mono_class_get_method_from_name(self, name, param_count)`,
    /// cached by `(class, name, param_count)`.
    pub fn method(&self, name: &str, param_count: i32) -> Result<MethodHelper> {
        let key = (self.class.0, name.to_string(), param_count);
        if let Some(&method) = self.ctx.methods.borrow().get(&key) {
            return Ok(MethodHelper { ctx: self.ctx.clone(), method });
        }
        let name_ptr = self.ctx.upload_cstring(name)?;
        let result = self
            .ctx
            .facade
            .invoke_raw(
                "mono_class_get_method_from_name",
                &[self.class.0, name_ptr.0, param_count as u64],
            )
            .chain_err(|| format!("mono_class_get_method_from_name({}) failed", name))?;
        if result == 0 {
            return Err(Error::from(ErrorKind::InvalidPrecondition(format!(
                "method {} (arity {}) not found",
                name, param_count
            ))));
        }
        let method = Rptr(result);
        self.ctx.methods.borrow_mut().insert(key, method);
        Ok(MethodHelper { ctx: self.ctx.clone(), method })
    }

    /// `mono_class_get_field_from_name(self, name)`. Not cached: field
    /// tokens are cheap to re-resolve and, unlike classes/methods, a
    /// field lookup by name has no arity key worth memoising on.
    pub fn field(&self, name: &str) -> Result<FieldHelper> {
        let name_ptr = self.ctx.upload_cstring(name)?;
        let result = self
            .ctx
            .facade
            .invoke_raw("mono_class_get_field_from_name", &[self.class.0, name_ptr.0])
            .chain_err(|| format!("mono_class_get_field_from_name({}) failed", name))?;
        if result == 0 {
            return Err(Error::from(ErrorKind::InvalidPrecondition(format!(
                "field {} not found",
                name
            ))));
        }
        Ok(FieldHelper { ctx: self.ctx.clone(), field: Rptr(result) })
    }

    pub fn property(&self, name: &str) -> Result<PropertyHelper> {
        let name_ptr = self.ctx.upload_cstring(name)?;
        let result = self
            .ctx
            .facade
            .invoke_raw("mono_class_get_property_from_name", &[self.class.0, name_ptr.0])
            .chain_err(|| format!("mono_class_get_property_from_name({}) failed", name))?;
        if result == 0 {
            return Err(Error::from(ErrorKind::InvalidPrecondition(format!(
                "property {} not found",
                name
            ))));
        }
        Ok(PropertyHelper { ctx: self.ctx.clone(), property: Rptr(result) })
    }
}

/// A resolved `MonoMethod*`.
#[derive(Clone)]
pub struct MethodHelper {
    ctx: HelperContext,
    method: Rptr,
}

impl MethodHelper {
    pub fn raw(&self) -> Rptr {
        self.method
    }

    /// `mono_runtime_invoke(self, obj, params)`.
    pub fn invoke(&self, obj: &ManagedHandle, params: Option<Rptr>) -> Result<Invoked> {
        self.ctx.facade.runtime_invoke(self.method, obj, params)
    }
}

/// A resolved `MonoClassField*`. Bound to a class, unbound to any one
/// object instance — `get_value`/`set_value` take the target object
/// explicitly, matching `class.field("x").get_value(obj)`.
#[derive(Clone)]
pub struct FieldHelper {
    ctx: HelperContext,
    field: Rptr,
}

impl FieldHelper {
    pub fn raw(&self) -> Rptr {
        self.field
    }

    /// `mono_field_get_value(obj, self, out)`, where `out` is a scratch
    /// buffer of `value_size` bytes this call allocates, reads back,
    /// and frees. `obj`'s raw pointer is materialised only for the
    /// duration of this one call.
    pub fn get_value(&self, obj: &ManagedHandle, value_size: usize) -> Result<Vec<u8>> {
        let backend = self.ctx.facade.runtime().backend();
        let out = backend
            .alloc(value_size.max(1), Protection::READ_WRITE)
            .chain_err(|| "allocating field-value scratch buffer failed")?;
        let obj_raw = obj.raw();
        let invoke_result = self
            .ctx
            .facade
            .invoke_raw("mono_field_get_value", &[obj_raw.0, self.field.0, out.0]);
        let read_result = invoke_result.and_then(|_| {
            let mut bytes = vec![0u8; value_size];
            backend.read(out, &mut bytes).chain_err(|| "reading field value failed")?;
            Ok(bytes)
        });
        let _ = backend.free(out);
        read_result
    }

    /// `mono_field_set_value(obj, self, value_ptr)`, where `value_ptr`
    /// is a scratch buffer holding `value`'s bytes, uploaded and freed
    /// around the call.
    pub fn set_value(&self, obj: &ManagedHandle, value: &[u8]) -> Result<()> {
        let backend = self.ctx.facade.runtime().backend();
        let scratch = backend
            .alloc(value.len().max(1), Protection::READ_WRITE)
            .chain_err(|| "allocating field-value scratch buffer failed")?;
        backend.write(scratch, value).chain_err(|| "uploading field value failed")?;
        let obj_raw = obj.raw();
        let result = self
            .ctx
            .facade
            .invoke_raw("mono_field_set_value", &[obj_raw.0, self.field.0, scratch.0]);
        let _ = backend.free(scratch);
        result.map(|_| ())
    }
}

/// A resolved `MonoProperty*`.
#[derive(Clone)]
pub struct PropertyHelper {
    ctx: HelperContext,
    property: Rptr,
}

impl PropertyHelper {
    pub fn raw(&self) -> Rptr {
        self.property
    }

    /// `mono_property_get_value(self, obj, params, exc)`. The boxed
    /// result (always a `MonoObject*`, even for value-typed properties)
    /// is wrapped in an owned [`ManagedHandle`] immediately — the raw
    /// pointer this call returns is never retained unwrapped.
    ///
    /// The trailing `exc` out-parameter is passed as null, same
    /// simplification as `Facade::runtime_invoke` (see `DESIGN.md`):
    /// a thrown exception currently surfaces however the attached
    /// Mono build handles a null exception pointer rather than as
    /// `ErrorKind::RemoteException`.
    pub fn get_value(&self, obj: &ManagedHandle, params: Option<Rptr>) -> Result<ManagedHandle> {
        let obj_raw = obj.raw();
        let result = self.ctx.facade.invoke_raw(
            "mono_property_get_value",
            &[self.property.0, obj_raw.0, params.unwrap_or(Rptr::NULL).0, 0],
        )?;
        Ok(self.ctx.facade.wrap_raw_object(Rptr(result), false))
    }

    /// `mono_property_set_value(self, obj, params, exc)`.
    pub fn set_value(&self, obj: &ManagedHandle, params: Option<Rptr>) -> Result<()> {
        let obj_raw = obj.raw();
        self.ctx.facade.invoke_raw(
            "mono_property_set_value",
            &[self.property.0, obj_raw.0, params.unwrap_or(Rptr::NULL).0, 0],
        )?;
        Ok(())
    }
}

/// A resolved managed-object instance paired back with the
/// [`ClassHelper`] that created/describes it, so `field`/`property`/
/// `method` lookups can be chained straight off the object.
#[derive(Clone)]
pub struct ObjectHelper {
    class: ClassHelper,
    handle: ManagedHandle,
}

impl ObjectHelper {
    pub fn new(class: ClassHelper, handle: ManagedHandle) -> Self {
        ObjectHelper { class, handle }
    }

    pub fn handle(&self) -> &ManagedHandle {
        &self.handle
    }

    pub fn class(&self) -> &ClassHelper {
        &self.class
    }

    pub fn field(&self, name: &str) -> Result<BoundField> {
        Ok(BoundField { field: self.class.field(name)?, object: self.handle.clone() })
    }

    pub fn property(&self, name: &str) -> Result<BoundProperty> {
        Ok(BoundProperty { property: self.class.property(name)?, object: self.handle.clone() })
    }

    pub fn call(&self, method_name: &str, param_count: i32, params: Option<Rptr>) -> Result<Invoked> {
        self.class.method(method_name, param_count)?.invoke(&self.handle, params)
    }

    /// `mono_object_to_string(self, exc)`.
    pub fn to_string_managed(&self) -> Result<ManagedHandle> {
        let obj_raw = self.handle.raw();
        let result = self
            .class
            .ctx
            .facade
            .invoke_raw("mono_object_to_string", &[obj_raw.0, 0])?;
        Ok(self.class.ctx.facade.wrap_raw_object(Rptr(result), false))
    }
}

/// A [`FieldHelper`] already bound to one object, for the common case
/// of repeated access to the same instance's field.
#[derive(Clone)]
pub struct BoundField {
    field: FieldHelper,
    object: ManagedHandle,
}

impl BoundField {
    pub fn get_value(&self, value_size: usize) -> Result<Vec<u8>> {
        self.field.get_value(&self.object, value_size)
    }

    pub fn set_value(&self, value: &[u8]) -> Result<()> {
        self.field.set_value(&self.object, value)
    }
}

/// A [`PropertyHelper`] already bound to one object.
#[derive(Clone)]
pub struct BoundProperty {
    property: PropertyHelper,
    object: ManagedHandle,
}

impl BoundProperty {
    pub fn get_value(&self, params: Option<Rptr>) -> Result<ManagedHandle> {
        self.property.get_value(&self.object, params)
    }

    pub fn set_value(&self, params: Option<Rptr>) -> Result<()> {
        self.property.set_value(&self.object, params)
    }
}
