// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! API dispatcher.
//!
//! Grounded on `RMonoAPIBackend_Def.h`, which holds one strongly-typed
//! function-entry table per ABI and switches between them with a
//! runtime index. [`Dispatcher`] favors a variant enum with a method
//! per call over a flat union of per-ABI types with a manual
//! discriminant; it is the variant-enum form of that, one arm per
//! [`AbiKind`], each arm a [`FunctionTable`] specialised over its
//! [`Abi`] marker type.

use std::collections::HashMap;
use std::rc::Rc;

use crate::abi::{Abi, AbiKind, WinX86, WinX86_64};
use crate::backend::Backend;
use crate::errors::{Result, ErrorKind};
use crate::funcentry::{FuncEntry, Invoked};
use crate::handle::HandleOwner;
use crate::variant::Variant;

/// All [`FuncEntry`]s for one ABI, keyed by Mono API function name.
/// Built once during attach and never mutated afterwards.
pub struct FunctionTable<A: Abi> {
    entries: HashMap<&'static str, FuncEntry<A>>,
}

impl<A: Abi> FunctionTable<A> {
    pub fn new() -> Self {
        FunctionTable {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entry: FuncEntry<A>) {
        self.entries.insert(entry.name(), entry);
    }

    pub fn get(&self, name: &str) -> Result<&FuncEntry<A>> {
        self.entries
            .get(name)
            .ok_or_else(|| ErrorKind::UnsupportedApi(name.to_string()).into())
    }
}

impl<A: Abi> Default for FunctionTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// The single entry point the runtime context calls through: selects
/// the active ABI's table and invokes its stubs.
pub enum Dispatcher {
    WinX86(FunctionTable<WinX86>),
    WinX86_64(FunctionTable<WinX86_64>),
}

impl Dispatcher {
    pub fn new(kind: AbiKind) -> Self {
        match kind {
            AbiKind::WinX86 => Dispatcher::WinX86(FunctionTable::new()),
            AbiKind::WinX86_64 => Dispatcher::WinX86_64(FunctionTable::new()),
        }
    }

    pub fn kind(&self) -> AbiKind {
        match self {
            Dispatcher::WinX86(_) => AbiKind::WinX86,
            Dispatcher::WinX86_64(_) => AbiKind::WinX86_64,
        }
    }

    pub fn insert_x86(&mut self, entry: FuncEntry<WinX86>) {
        if let Dispatcher::WinX86(table) = self {
            table.insert(entry);
        }
    }

    pub fn insert_x86_64(&mut self, entry: FuncEntry<WinX86_64>) {
        if let Dispatcher::WinX86_64(table) = self {
            table.insert(entry);
        }
    }

    /// Call the marshalled wrapper for `name` with `args`, regardless
    /// of which ABI is active.
    pub fn invoke(
        &self,
        name: &str,
        backend: &dyn Backend,
        owner: &Rc<dyn HandleOwner>,
        args: &mut [Variant],
    ) -> Result<Invoked> {
        match self {
            Dispatcher::WinX86(table) => table.get(name)?.invoke(backend, owner, args),
            Dispatcher::WinX86_64(table) => table.get(name)?.invoke(backend, owner, args),
        }
    }

    /// Call the raw (unmarshalled) stub for `name` with `args`, for
    /// functions whose signature needs no data block.
    pub fn invoke_raw(&self, name: &str, backend: &dyn Backend, args: &[u64]) -> Result<u64> {
        match self {
            Dispatcher::WinX86(table) => table.get(name)?.invoke_raw(backend, args),
            Dispatcher::WinX86_64(table) => table.get(name)?.invoke_raw(backend, args),
        }
    }

    pub fn is_supported(&self, name: &str) -> bool {
        match self {
            Dispatcher::WinX86(table) => table.get(name).map(FuncEntry::is_supported).unwrap_or(false),
            Dispatcher::WinX86_64(table) => table.get(name).map(FuncEntry::is_supported).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallingConvention, Rptr};

    #[test]
    fn dispatcher_selects_table_matching_its_abi_kind() {
        let mut dispatcher = Dispatcher::new(AbiKind::WinX86_64);
        assert_eq!(dispatcher.kind(), AbiKind::WinX86_64);

        dispatcher.insert_x86_64(FuncEntry::raw(
            "mono_jit_init",
            Rptr(0x1000),
            CallingConvention::Cdecl,
        ));
        // insert_x86 is a no-op on a WinX86_64 dispatcher.
        dispatcher.insert_x86(FuncEntry::raw(
            "mono_jit_init",
            Rptr(0x2000),
            CallingConvention::Cdecl,
        ));

        assert!(dispatcher.is_supported("mono_jit_init"));
        assert!(!dispatcher.is_supported("mono_jit_cleanup"));
    }
}
