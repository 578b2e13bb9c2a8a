// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Handle system.
//!
//! Grounded on `RMonoHandle_Def.h`/`RMonoHandle_Impl.h`, translated from
//! C++ intrusive ref-counting to idiomatic Rust `Rc`-shared interior
//! state with `Drop`-driven deletion (the same idiom `audioipc` uses for
//! `PlatformHandle`, just shared rather than uniquely owned, because
//! many facade call sites alias the same target-side resource).
//!
//! Two disciplines exist:
//!
//! * [`RawHandle`] — an [`Rptr`] to a target-allocated artefact. Most
//!   have no deleter; a few ([`RawDeleter::AssemblyNameFree`],
//!   [`RawDeleter::MethodDescFree`]) call a specific Mono API to free
//!   on last-owner-drop.
//! * [`ManagedHandle`] — a GC-handle integer. Deleter is always
//!   `mono_gchandle_free`. The raw managed pointer is *never* stored;
//!   it is materialised via `HandleOwner::gchandle_get_target` only at
//!   call sites that need it, and discarded immediately.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::types::{Gchandle, Rptr, GCHANDLE_INVALID};

/// Opaque id returned by [`HandleOwner::register_handle`], used to
/// unregister on destruction. Backed by a monotonically increasing
/// counter on the owning runtime, not an index, so registration order
/// never shifts under removal.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct HandleRegId(pub u64);

/// Which specific Mono API (if any) a [`RawHandle`]'s value must be
/// passed to when the last owner drops. Most raw handles have no
/// deleter; a few call a specific Mono API to free on last-owner-drop.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum RawDeleter {
    /// No remote free action; the target retains ownership of the
    /// underlying artefact (e.g. `MonoClass*`, `MonoMethod*`).
    None,
    /// `mono_assembly_name_free` (and, pre-generation-detection, a
    /// plain heap free of the `MonoAssemblyName` struct memory).
    AssemblyNameFree,
    /// `mono_method_desc_free`.
    MethodDescFree,
    /// A plain target-heap free (`g_free`), used for controller-
    /// allocated scratch blocks that outlive a single call.
    HeapFree,
}

/// Abstracts the single long-lived object (the [`crate::runtime::Runtime`])
/// that every handle needs to reach in order to (a) run its deleter and
/// (b) register/unregister itself in the live-handle list. Kept as a
/// trait, rather than a direct `Rc<Runtime>` field, purely to break the
/// module cycle between `handle` and `runtime` — there is exactly one
/// production implementor.
pub trait HandleOwner {
    /// Free a raw handle's target resource according to `deleter`. Only
    /// called when `deleter != RawDeleter::None`. Failures are logged
    /// and swallowed: by the time a deleter runs, the caller that could
    /// observe an error (the one that dropped the handle) is gone.
    fn free_raw(&self, value: Rptr, deleter: RawDeleter);

    /// Enqueue (or immediately run, backend's choice) `mono_gchandle_free`
    /// for `gchandle`. In the common path this pushes onto a deferred-
    /// free buffer rather than issuing one RPC per handle.
    fn free_gchandle(&self, gchandle: Gchandle);

    /// Materialise the raw managed pointer currently referred to by
    /// `gchandle`. The caller must not hold the result across any
    /// further call into Mono.
    fn gchandle_get_target(&self, gchandle: Gchandle) -> Rptr;

    /// Create a new GC handle (optionally pinned) for `raw`.
    fn gchandle_new(&self, raw: Rptr, pinned: bool) -> Gchandle;

    fn register_handle(&self, entry: LiveHandleRef) -> HandleRegId;
    fn unregister_handle(&self, id: HandleRegId);
}

/// What the live-handle list stores per registered handle: a weak
/// back-reference so `detach()` can force-free handles the caller
/// leaked, without keeping them alive itself.
#[derive(Clone)]
pub enum LiveHandleRef {
    Raw(Weak<RefCell<RawHandleInner>>),
    Managed(Weak<RefCell<ManagedHandleInner>>),
}

impl LiveHandleRef {
    /// Force-free the still-reachable handle this entry refers to, if
    /// it has not already been dropped. Called only from
    /// `Runtime::detach`, which walks the live-handle registry to
    /// force-free leaked owned handles.
    pub fn force_delete(&self, owner: &dyn HandleOwner) {
        match self {
            LiveHandleRef::Raw(weak) => {
                if let Some(inner) = weak.upgrade() {
                    RawHandleInner::force_delete(&inner, owner);
                }
            }
            LiveHandleRef::Managed(weak) => {
                if let Some(inner) = weak.upgrade() {
                    ManagedHandleInner::force_delete(&inner, owner);
                }
            }
        }
    }
}

pub struct RawHandleInner {
    value: Rptr,
    owned: bool,
    deleter: RawDeleter,
    owner: Weak<dyn HandleOwner>,
    reg_id: Option<HandleRegId>,
}

impl RawHandleInner {
    fn force_delete(this: &Rc<RefCell<Self>>, owner: &dyn HandleOwner) {
        let mut inner = this.borrow_mut();
        if inner.owned {
            if inner.deleter != RawDeleter::None {
                owner.free_raw(inner.value, inner.deleter);
            }
            inner.owned = false;
        }
    }
}

impl Drop for RawHandleInner {
    fn drop(&mut self) {
        if let Some(id) = self.reg_id.take() {
            if let Some(owner) = self.owner.upgrade() {
                owner.unregister_handle(id);
            }
        }
        if self.owned && self.deleter != RawDeleter::None {
            if let Some(owner) = self.owner.upgrade() {
                owner.free_raw(self.value, self.deleter);
            }
        }
    }
}

/// Shared-ownership wrapper around a target-allocated artefact. `INVALID` is the null [`Rptr`].
#[derive(Clone)]
pub struct RawHandle {
    inner: Rc<RefCell<RawHandleInner>>,
}

impl RawHandle {
    pub const fn invalid_value() -> Rptr {
        Rptr::NULL
    }

    /// Wrap `value`, registering it as owned in `owner`'s live-handle
    /// list when `owned` is true.
    pub fn new(value: Rptr, owned: bool, deleter: RawDeleter, owner: &Rc<dyn HandleOwner>) -> Self {
        let inner = Rc::new(RefCell::new(RawHandleInner {
            value,
            owned,
            deleter,
            owner: Rc::downgrade(owner),
            reg_id: None,
        }));
        if owned {
            let reg_id = owner.register_handle(LiveHandleRef::Raw(Rc::downgrade(&inner)));
            inner.borrow_mut().reg_id = Some(reg_id);
        }
        RawHandle { inner }
    }

    /// A non-owning handle to an already-known value, used for handles
    /// the target itself retains ownership of (no deleter, nothing to
    /// register).
    pub fn borrowed(value: Rptr, owner: &Rc<dyn HandleOwner>) -> Self {
        Self::new(value, false, RawDeleter::None, owner)
    }

    pub fn value(&self) -> Rptr {
        self.inner.borrow().value
    }

    pub fn is_valid(&self) -> bool {
        !self.value().is_null()
    }

    pub fn is_owned(&self) -> bool {
        self.inner.borrow().owned
    }

    /// Move ownership out of this handle: clears the owned flag (so
    /// `Drop` no longer frees it) and unregisters from the live-handle
    /// list. Returns `None` if this handle did not own its value.
    pub fn take_ownership(&self) -> Option<Rptr> {
        let mut inner = self.inner.borrow_mut();
        if !inner.owned {
            return None;
        }
        inner.owned = false;
        if let Some(id) = inner.reg_id.take() {
            if let Some(owner) = inner.owner.upgrade() {
                owner.unregister_handle(id);
            }
        }
        Some(inner.value)
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("RawHandle")
            .field("value", &inner.value)
            .field("owned", &inner.owned)
            .finish()
    }
}

impl PartialEq for RawHandle {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}
impl Eq for RawHandle {}

pub struct ManagedHandleInner {
    gchandle: Gchandle,
    owned: bool,
    owner: Weak<dyn HandleOwner>,
    reg_id: Option<HandleRegId>,
}

impl ManagedHandleInner {
    fn force_delete(this: &Rc<RefCell<Self>>, owner: &dyn HandleOwner) {
        let mut inner = this.borrow_mut();
        if inner.owned {
            owner.free_gchandle(inner.gchandle);
            inner.owned = false;
        }
    }
}

impl Drop for ManagedHandleInner {
    fn drop(&mut self) {
        if let Some(id) = self.reg_id.take() {
            if let Some(owner) = self.owner.upgrade() {
                owner.unregister_handle(id);
            }
        }
        if self.owned {
            if let Some(owner) = self.owner.upgrade() {
                owner.free_gchandle(self.gchandle);
            }
        }
    }
}

/// A GC-handle-backed reference to a managed object. The raw `MonoObject*` is never stored;
/// see [`ManagedHandle::raw`].
#[derive(Clone)]
pub struct ManagedHandle {
    inner: Rc<RefCell<ManagedHandleInner>>,
}

impl ManagedHandle {
    pub fn new(gchandle: Gchandle, owned: bool, owner: &Rc<dyn HandleOwner>) -> Self {
        let inner = Rc::new(RefCell::new(ManagedHandleInner {
            gchandle,
            owned,
            owner: Rc::downgrade(owner),
            reg_id: None,
        }));
        if owned {
            let reg_id = owner.register_handle(LiveHandleRef::Managed(Rc::downgrade(&inner)));
            inner.borrow_mut().reg_id = Some(reg_id);
        }
        ManagedHandle { inner }
    }

    pub fn invalid(owner: &Rc<dyn HandleOwner>) -> Self {
        Self::new(GCHANDLE_INVALID, false, owner)
    }

    pub fn gchandle(&self) -> Gchandle {
        self.inner.borrow().gchandle
    }

    pub fn is_valid(&self) -> bool {
        self.gchandle() != GCHANDLE_INVALID
    }

    pub fn is_owned(&self) -> bool {
        self.inner.borrow().owned
    }

    pub fn take_ownership(&self) -> Option<Gchandle> {
        let mut inner = self.inner.borrow_mut();
        if !inner.owned {
            return None;
        }
        inner.owned = false;
        if let Some(id) = inner.reg_id.take() {
            if let Some(owner) = inner.owner.upgrade() {
                owner.unregister_handle(id);
            }
        }
        Some(inner.gchandle)
    }

    /// `mono_gchandle_get_target`: materialise the raw pointer this
    /// handle currently refers to. Only safe until the next GC
    /// interaction — callers must not retain the
    /// result across any further call into Mono.
    pub fn raw(&self) -> Rptr {
        let inner = self.inner.borrow();
        let owner = inner
            .owner
            .upgrade()
            .expect("ManagedHandle::raw() called after its runtime was dropped");
        if inner.gchandle == GCHANDLE_INVALID {
            return Rptr::NULL;
        }
        owner.gchandle_get_target(inner.gchandle)
    }

    /// Create a new, owned, pinned [`ManagedHandle`] for the same
    /// underlying object: returns a new managed-object handle created
    /// from a pinned GC handle on the same raw pointer.
    pub fn pin(&self) -> ManagedHandle {
        let owner = {
            let inner = self.inner.borrow();
            inner
                .owner
                .upgrade()
                .expect("ManagedHandle::pin() called after its runtime was dropped")
        };
        let raw = self.raw();
        let pinned_gchandle = owner.gchandle_new(raw, true);
        ManagedHandle::new(pinned_gchandle, true, &owner)
    }
}

impl fmt::Debug for ManagedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ManagedHandle")
            .field("gchandle", &inner.gchandle)
            .field("owned", &inner.owned)
            .finish()
    }
}

/// Equality for managed-object handles is by underlying raw pointer
/// (pin, compare, discard), not by GC-handle identity.
impl PartialEq for ManagedHandle {
    fn eq(&self, other: &Self) -> bool {
        if self.gchandle() == GCHANDLE_INVALID || other.gchandle() == GCHANDLE_INVALID {
            return self.gchandle() == other.gchandle();
        }
        self.raw() == other.raw()
    }
}
impl Eq for ManagedHandle {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Minimal [`HandleOwner`] fake: tracks freed raws/gchandles and a
    /// monotonically-increasing live-handle registry, enough to
    /// exercise the reference-counting and force-delete behaviour
    /// without a real backend.
    struct FakeOwner {
        next_id: Cell<u64>,
        live: RefCell<HashMap<u64, LiveHandleRef>>,
        freed_raw: RefCell<Vec<(Rptr, RawDeleter)>>,
        freed_gchandle: RefCell<Vec<Gchandle>>,
        targets: RefCell<HashMap<Gchandle, Rptr>>,
        next_gchandle: Cell<Gchandle>,
    }

    impl FakeOwner {
        fn new() -> Rc<dyn HandleOwner> {
            Rc::new(FakeOwner {
                next_id: Cell::new(1),
                live: RefCell::new(HashMap::new()),
                freed_raw: RefCell::new(Vec::new()),
                freed_gchandle: RefCell::new(Vec::new()),
                targets: RefCell::new(HashMap::new()),
                next_gchandle: Cell::new(1),
            })
        }
    }

    impl HandleOwner for FakeOwner {
        fn free_raw(&self, value: Rptr, deleter: RawDeleter) {
            self.freed_raw.borrow_mut().push((value, deleter));
        }
        fn free_gchandle(&self, gchandle: Gchandle) {
            self.freed_gchandle.borrow_mut().push(gchandle);
        }
        fn gchandle_get_target(&self, gchandle: Gchandle) -> Rptr {
            *self.targets.borrow().get(&gchandle).unwrap_or(&Rptr::NULL)
        }
        fn gchandle_new(&self, raw: Rptr, _pinned: bool) -> Gchandle {
            let g = self.next_gchandle.get();
            self.next_gchandle.set(g + 1);
            self.targets.borrow_mut().insert(g, raw);
            g
        }
        fn register_handle(&self, entry: LiveHandleRef) -> HandleRegId {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            self.live.borrow_mut().insert(id, entry);
            HandleRegId(id)
        }
        fn unregister_handle(&self, id: HandleRegId) {
            self.live.borrow_mut().remove(&id.0);
        }
    }

    fn downcast(owner: &Rc<dyn HandleOwner>) -> &FakeOwner {
        // Safe within this test module: the only implementor is FakeOwner.
        unsafe { &*(Rc::as_ptr(owner) as *const FakeOwner) }
    }

    #[test]
    fn owned_raw_handle_frees_on_last_drop() {
        let owner = FakeOwner::new();
        {
            let h1 = RawHandle::new(Rptr::from(0x1234), true, RawDeleter::AssemblyNameFree, &owner);
            let h2 = h1.clone();
            drop(h1);
            assert!(downcast(&owner).freed_raw.borrow().is_empty());
            drop(h2);
        }
        assert_eq!(
            downcast(&owner).freed_raw.borrow().as_slice(),
            &[(Rptr::from(0x1234), RawDeleter::AssemblyNameFree)]
        );
        assert!(downcast(&owner).live.borrow().is_empty());
    }

    #[test]
    fn take_ownership_prevents_free() {
        let owner = FakeOwner::new();
        let h = RawHandle::new(Rptr::from(0x42), true, RawDeleter::MethodDescFree, &owner);
        let taken = h.take_ownership();
        assert_eq!(taken, Some(Rptr::from(0x42)));
        drop(h);
        assert!(downcast(&owner).freed_raw.borrow().is_empty());
    }

    #[test]
    fn managed_handle_equality_is_by_raw_pointer() {
        let owner = FakeOwner::new();
        let h = ManagedHandle::new(1, true, &owner);
        downcast(&owner)
            .targets
            .borrow_mut()
            .insert(1, Rptr::from(0x9999));

        // h == h.clone(): trivially the same underlying gchandle.
        let clone = h.clone();
        assert_eq!(h, clone);

        // A second, independently-created handle whose gchandle differs
        // but whose raw pointer is the same object compares equal too.
        let other_gchandle = downcast(&owner).gchandle_new(Rptr::from(0x9999), false);
        let other = ManagedHandle::new(other_gchandle, true, &owner);
        assert_ne!(h.gchandle(), other.gchandle());
        assert_eq!(h, other);
    }

    #[test]
    fn pin_raw_matches_get_target_at_pin_time() {
        let owner = FakeOwner::new();
        let h = ManagedHandle::new(1, true, &owner);
        downcast(&owner)
            .targets
            .borrow_mut()
            .insert(1, Rptr::from(0xABCD));
        let pinned = h.pin();
        assert_eq!(pinned.raw(), downcast(&owner).gchandle_get_target(1));
    }

    #[test]
    fn force_delete_during_detach_prevents_double_free() {
        let owner = FakeOwner::new();
        let h = ManagedHandle::new(1, true, &owner);
        let weak = LiveHandleRef::Managed(Rc::downgrade(&h.inner));
        weak.force_delete(&*owner);
        assert_eq!(downcast(&owner).freed_gchandle.borrow().as_slice(), &[1]);
        drop(h);
        // Drop must not free a second time: force_delete cleared `owned`.
        assert_eq!(downcast(&owner).freed_gchandle.borrow().as_slice(), &[1]);
    }
}
