// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! IPC vector.
//!
//! Grounded on `IPCVector.h`/`IPCVector_Impl.h`: a dynamically growing
//! array of rptr-sized elements living entirely in target memory, used
//! as the sink for Mono's `mono_*_foreach()` family. The core emits a
//! handful of fastcall target-side primitives once per attach and
//! drives them through [`Backend::rpc_call`]; a single vector instance
//! is reused across enumerations by clearing it before each call
//! rather than allocating a fresh one every time.

use crate::backend::Backend;
use crate::errors::Result;
use crate::types::{CallingConvention, Rptr};

/// Initial capacity used when no enumeration has sized the vector yet.
/// Matches `IPCVector::vectorNew`'s default argument.
pub const DEFAULT_CAPACITY: u32 = 16;

/// Addresses of the target-side IPC-vector primitives, uploaded and
/// assembled once during attach. All calls through this API use the
/// fastcall convention, matching `IPCVector.h`'s `VECTOR_*` typedefs,
/// except [`IpcVectorApi::adapter`], which is never called through
/// `rpc_call` at all — its address is handed to Mono itself as a
/// `mono_*_foreach` callback.
#[derive(Copy, Clone, Debug)]
pub struct IpcVectorApi {
    new_fn: Rptr,
    free_fn: Rptr,
    add_fn: Rptr,
    clear_fn: Rptr,
    length_fn: Rptr,
    capacity_fn: Rptr,
    data_fn: Rptr,
    grow_fn: Rptr,
    adapter_fn: Rptr,
    /// Width of one element, in bytes. Always the ABI pointer width:
    /// the vector only ever stores rptr-sized enumeration results.
    elem_size: usize,
}

impl IpcVectorApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        new_fn: Rptr,
        free_fn: Rptr,
        add_fn: Rptr,
        clear_fn: Rptr,
        length_fn: Rptr,
        capacity_fn: Rptr,
        data_fn: Rptr,
        grow_fn: Rptr,
        adapter_fn: Rptr,
        elem_size: usize,
    ) -> Self {
        IpcVectorApi {
            new_fn,
            free_fn,
            add_fn,
            clear_fn,
            length_fn,
            capacity_fn,
            data_fn,
            grow_fn,
            adapter_fn,
            elem_size,
        }
    }

    /// Address of the `VectorForeachAdapter(elem, header)` trampoline,
    /// to hand Mono as the callback argument of a `mono_*_foreach`
    /// call, with `v` passed as that same call's `user_data`.
    pub fn adapter(&self) -> Rptr {
        self.adapter_fn
    }

    pub fn create(&self, backend: &dyn Backend, cap: u32) -> Result<Rptr> {
        let byte_size = cap as u64 * self.elem_size as u64;
        let ptr = backend.rpc_call(self.new_fn, CallingConvention::Fastcall, &[byte_size])?;
        Ok(Rptr(ptr))
    }

    pub fn free(&self, backend: &dyn Backend, v: Rptr) -> Result<()> {
        backend.rpc_call(self.free_fn, CallingConvention::Fastcall, &[v.0])?;
        Ok(())
    }

    pub fn add(&self, backend: &dyn Backend, v: Rptr, elem: Rptr) -> Result<()> {
        backend.rpc_call(self.add_fn, CallingConvention::Fastcall, &[v.0, elem.0])?;
        Ok(())
    }

    pub fn clear(&self, backend: &dyn Backend, v: Rptr) -> Result<()> {
        backend.rpc_call(self.clear_fn, CallingConvention::Fastcall, &[v.0])?;
        Ok(())
    }

    pub fn length(&self, backend: &dyn Backend, v: Rptr) -> Result<u32> {
        let len = backend.rpc_call(self.length_fn, CallingConvention::Fastcall, &[v.0])?;
        Ok(len as u32)
    }

    /// Target-side `VectorCapacity` returns a byte count, not an
    /// element count (the header has no notion of `elem_size` of its
    /// own), so this divides before handing a count back to callers.
    pub fn capacity(&self, backend: &dyn Backend, v: Rptr) -> Result<u32> {
        let cap_bytes = backend.rpc_call(self.capacity_fn, CallingConvention::Fastcall, &[v.0])?;
        Ok((cap_bytes as usize / self.elem_size) as u32)
    }

    pub fn data(&self, backend: &dyn Backend, v: Rptr) -> Result<Rptr> {
        let ptr = backend.rpc_call(self.data_fn, CallingConvention::Fastcall, &[v.0])?;
        Ok(Rptr(ptr))
    }

    /// Doubles `v`'s backing allocation. Unlike the original, the
    /// target-side primitive always doubles rather than taking a
    /// requested capacity, since growth only ever happens in response
    /// to the data block being exactly full.
    pub fn grow(&self, backend: &dyn Backend, v: Rptr) -> Result<()> {
        backend.rpc_call(self.grow_fn, CallingConvention::Fastcall, &[v.0])?;
        Ok(())
    }

    /// Clear `v`, hand `(trampoline, v)` to the caller-supplied
    /// enumeration, then read the elements back as a controller-side
    /// list: each enumeration clears the vector, calls the
    /// enumerator with (trampoline, vector), and reads the vector back
    /// into a controller-side list. `enumerate` is expected to invoke
    /// a Mono `mono_*_foreach` whose callback address is the core's
    /// vector-add trampoline.
    pub fn drain_enumeration<F>(&self, backend: &dyn Backend, v: Rptr, enumerate: F) -> Result<Vec<Rptr>>
    where
        F: FnOnce() -> Result<()>,
    {
        self.clear(backend, v)?;
        enumerate()?;
        self.read(backend, v)
    }

    /// Read every element currently stored in `v` into a controller-side
    /// `Vec<Rptr>`, in one bulk read sized `length(v) * elem_size`.
    pub fn read(&self, backend: &dyn Backend, v: Rptr) -> Result<Vec<Rptr>> {
        let len = self.length(backend, v)? as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let data_ptr = self.data(backend, v)?;
        let mut buf = vec![0u8; len * self.elem_size];
        backend.read(data_ptr, &mut buf)?;
        let mut out = Vec::with_capacity(len);
        for chunk in buf.chunks_exact(self.elem_size) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            out.push(Rptr(u64::from_ne_bytes(word)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::backend::{AsmArg, Assembler, Module, Operand, Reg};
    use crate::types::ProcessorArch;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Minimal in-process stand-in for a real backend, just enough to
    /// drive `IpcVectorApi` end-to-end: `rpc_call` interprets the
    /// address as one of eight opcodes and mutates a simulated vector
    /// kept in `memory`.
    struct FakeBackend {
        memory: RefCell<HashMap<u64, Vec<u8>>>,
        next_addr: RefCell<u64>,
        elem_size: usize,
    }

    const OP_NEW: u64 = 1;
    const OP_FREE: u64 = 2;
    const OP_ADD: u64 = 3;
    const OP_CLEAR: u64 = 4;
    const OP_LENGTH: u64 = 5;
    const OP_CAPACITY: u64 = 6;
    const OP_DATA: u64 = 7;
    const OP_GROW: u64 = 8;

    struct FakeVector {
        elems: Vec<u64>,
        capacity_bytes: u64,
    }

    impl FakeBackend {
        fn new(elem_size: usize) -> Self {
            FakeBackend {
                memory: RefCell::new(HashMap::new()),
                next_addr: RefCell::new(0x1000),
                elem_size,
            }
        }

        fn alloc_addr(&self) -> u64 {
            let mut n = self.next_addr.borrow_mut();
            let addr = *n;
            *n += 0x100;
            addr
        }
    }

    thread_local! {
        static VECTORS: RefCell<HashMap<u64, FakeVector>> = RefCell::new(HashMap::new());
    }

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
        fn alloc(&self, _size: usize, _protection: crate::types::Protection) -> Result<Rptr> {
            Ok(Rptr(self.alloc_addr()))
        }
        fn free(&self, _ptr: Rptr) -> Result<()> {
            Ok(())
        }
        fn read(&self, ptr: Rptr, dst: &mut [u8]) -> Result<()> {
            let mem = self.memory.borrow();
            let bytes = mem.get(&ptr.0).expect("read from unmapped fake address");
            dst.copy_from_slice(&bytes[..dst.len()]);
            Ok(())
        }
        fn write(&self, ptr: Rptr, src: &[u8]) -> Result<()> {
            self.memory.borrow_mut().insert(ptr.0, src.to_vec());
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
            unimplemented!("not exercised by these tests")
        }
        fn rpc_call(&self, addr: Rptr, _cc: CallingConvention, args: &[u64]) -> Result<u64> {
            VECTORS.with(|cell| {
                let mut vectors = cell.borrow_mut();
                match addr.0 {
                    OP_NEW => {
                        let v = self.alloc_addr();
                        vectors.insert(
                            v,
                            FakeVector {
                                elems: Vec::new(),
                                capacity_bytes: args[0],
                            },
                        );
                        Ok(v)
                    }
                    OP_FREE => {
                        vectors.remove(&args[0]);
                        Ok(0)
                    }
                    OP_ADD => {
                        vectors.get_mut(&args[0]).unwrap().elems.push(args[1]);
                        Ok(0)
                    }
                    OP_CLEAR => {
                        vectors.get_mut(&args[0]).unwrap().elems.clear();
                        Ok(0)
                    }
                    OP_LENGTH => Ok(vectors.get(&args[0]).unwrap().elems.len() as u64),
                    OP_CAPACITY => Ok(vectors.get(&args[0]).unwrap().capacity_bytes),
                    OP_GROW => {
                        let vector = vectors.get_mut(&args[0]).unwrap();
                        vector.capacity_bytes *= 2;
                        Ok(0)
                    }
                    OP_DATA => {
                        let elems = &vectors.get(&args[0]).unwrap().elems;
                        let mut bytes = Vec::with_capacity(elems.len() * self.elem_size);
                        for e in elems {
                            bytes.extend_from_slice(&e.to_ne_bytes()[..self.elem_size]);
                        }
                        let data_addr = self.alloc_addr();
                        self.memory.borrow_mut().insert(data_addr, bytes);
                        Ok(data_addr)
                    }
                    other => panic!("unexpected opcode {}", other),
                }
            })
        }
    }

    fn api(elem_size: usize) -> IpcVectorApi {
        IpcVectorApi::new(
            Rptr(OP_NEW),
            Rptr(OP_FREE),
            Rptr(OP_ADD),
            Rptr(OP_CLEAR),
            Rptr(OP_LENGTH),
            Rptr(OP_CAPACITY),
            Rptr(OP_DATA),
            Rptr(OP_GROW),
            Rptr(0), // adapter isn't invoked through `rpc_call`, no opcode needed
            elem_size,
        )
    }

    #[test]
    fn create_add_read_roundtrip() {
        let elem_size = crate::abi::WinX86_64::PTR_WIDTH;
        let backend = FakeBackend::new(elem_size);
        let api = api(elem_size);

        let v = api.create(&backend, DEFAULT_CAPACITY).unwrap();
        api.add(&backend, v, Rptr(0xAAAA)).unwrap();
        api.add(&backend, v, Rptr(0xBBBB)).unwrap();

        let elements = api.read(&backend, v).unwrap();
        assert_eq!(elements, vec![Rptr(0xAAAA), Rptr(0xBBBB)]);
        assert_eq!(api.length(&backend, v).unwrap(), 2);
    }

    #[test]
    fn clear_empties_vector() {
        let elem_size = crate::abi::WinX86_64::PTR_WIDTH;
        let backend = FakeBackend::new(elem_size);
        let api = api(elem_size);

        let v = api.create(&backend, DEFAULT_CAPACITY).unwrap();
        api.add(&backend, v, Rptr(1)).unwrap();
        api.clear(&backend, v).unwrap();
        assert_eq!(api.read(&backend, v).unwrap(), Vec::new());
    }

    #[test]
    fn grow_doubles_reported_capacity() {
        let elem_size = crate::abi::WinX86_64::PTR_WIDTH;
        let backend = FakeBackend::new(elem_size);
        let api = api(elem_size);

        let v = api.create(&backend, DEFAULT_CAPACITY).unwrap();
        let before = api.capacity(&backend, v).unwrap();
        api.grow(&backend, v).unwrap();
        let after = api.capacity(&backend, v).unwrap();

        assert_eq!(after, before * 2);
    }

    #[test]
    fn drain_enumeration_clears_before_running_enumerator() {
        let elem_size = crate::abi::WinX86_64::PTR_WIDTH;
        let backend = FakeBackend::new(elem_size);
        let api = api(elem_size);

        let v = api.create(&backend, DEFAULT_CAPACITY).unwrap();
        api.add(&backend, v, Rptr(0xDEAD)).unwrap();

        let out = api
            .drain_enumeration(&backend, v, || {
                api.add(&backend, v, Rptr(0x1))?;
                api.add(&backend, v, Rptr(0x2))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(out, vec![Rptr(0x1), Rptr(0x2)]);
    }

    // Silence the unused `AsmArg`/`Operand`/`Reg` imports: kept to assert
    // the `Assembler`/`Backend` seam stays compatible with this module's
    // expectations without constructing a full fake assembler here.
    #[allow(dead_code)]
    fn _type_check(_: AsmArg, _: Operand, _: Reg) {}
}
