// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Target-side code generator for the IPC-vector primitives.
//!
//! Grounded on `IPCVector_Impl.h`'s `inject()`, which assembles the
//! same eight functions against `HeapAlloc`/`HeapReAlloc`/`HeapFree`.
//! This targets `malloc`/`realloc`/`free` instead (resolved from the
//! target's C runtime rather than `kernel32.dll`, matching how every
//! other address in this crate is resolved through `Backend::export_address`
//! against a single module) and trades the original's header-embeds-
//! a-growable-array-inline layout for one that never needs a multiply
//! or a general comparison branch, since [`crate::backend::Assembler`]
//! exposes neither: see the field doc comments below for how each
//! value is kept derivable through `add`/`sub` and an equality test
//! alone. See `DESIGN.md` for the full writeup.
//!
//! Layout: two allocations per vector. The header (the handle value
//! returned to callers, and the address Mono's `mono_*_foreach`
//! receives as its user-data argument) is a fixed five-word struct
//! that is never reallocated, so a caller's handle never goes stale
//! after a grow:
//!
//! ```text
//! [0] data_ptr        current data block
//! [1] write_ptr        data_ptr + length*elem_size, kept up to date
//!                       incrementally so nothing has to multiply by
//!                       elem_size at add time
//! [2] end_ptr           data_ptr + capacity_bytes, so "is the vector
//!                       full" is testable with a single subtraction
//! [3] length            element count
//! [4] capacity_bytes    byte size of the current data allocation
//! ```

use crate::backend::{Assembler, Operand, Reg};
use crate::types::Rptr;

/// Header field count, not byte size — multiply by `ptr_width` for
/// the allocation size.
const HEADER_WORDS: usize = 5;

pub fn header_size(ptr_width: usize) -> usize {
    HEADER_WORDS * ptr_width
}

fn off_write(ptr_width: usize) -> i32 {
    ptr_width as i32
}
fn off_end(ptr_width: usize) -> i32 {
    (2 * ptr_width) as i32
}
fn off_len(ptr_width: usize) -> i32 {
    (3 * ptr_width) as i32
}
fn off_cap(ptr_width: usize) -> i32 {
    (4 * ptr_width) as i32
}

/// Call a real host C function (`malloc`/`free`/`realloc`) whose
/// arguments already sit in `args` (first arg's register first, so
/// `Zcx` then `Zdx`). On x64 that's already the fastcall-like
/// arg-passing this whole crate uses, so the registers need no
/// shuffling, only the mandatory 32-byte shadow space. On x86 these
/// are true cdecl: pushed right-to-left, caller cleans the stack
/// after, unlike the callee-cleans convention this crate's own
/// generated functions use.
fn gen_native_call<A: Assembler + ?Sized>(a: &mut A, addr: Rptr, args: &[Reg], is_x64: bool) {
    if is_x64 {
        a.mov(Operand::Reg(Reg::Zax), Operand::Imm(addr.0 as i64));
        a.sub(Operand::Reg(Reg::Zsp), Operand::Imm(32));
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(32));
    } else {
        for &r in args.iter().rev() {
            a.push(Operand::Reg(r));
        }
        a.mov(Operand::Reg(Reg::Zax), Operand::Imm(addr.0 as i64));
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(4 * args.len() as i64));
    }
}

/// `VectorNew(byte_size) -> header`. Allocates the header and an
/// initial data block of `byte_size` bytes, wires up `write_ptr`/
/// `end_ptr` and zeroes `length`. Doesn't check either `malloc` result
/// for NULL, matching the original, which doesn't either.
pub fn gen_vector_new<A: Assembler + ?Sized>(a: &mut A, malloc_addr: Rptr, ptr_width: usize, is_x64: bool) {
    a.push(Operand::Reg(Reg::Zbx));
    a.push(Operand::Reg(Reg::Zsi));

    a.mov(Operand::Reg(Reg::Zbx), Operand::Reg(Reg::Zcx)); // zbx = byte_size

    a.mov(Operand::Reg(Reg::Zcx), Operand::Imm(header_size(ptr_width) as i64));
    gen_native_call(a, malloc_addr, &[Reg::Zcx], is_x64);
    a.mov(Operand::Reg(Reg::Zsi), Operand::Reg(Reg::Zax)); // zsi = header

    a.mov(Operand::Reg(Reg::Zcx), Operand::Reg(Reg::Zbx));
    gen_native_call(a, malloc_addr, &[Reg::Zcx], is_x64); // zax = data_ptr

    a.mov(Operand::Mem(Reg::Zsi, 0), Operand::Reg(Reg::Zax));
    a.mov(Operand::Mem(Reg::Zsi, off_write(ptr_width)), Operand::Reg(Reg::Zax));
    a.add(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zbx));
    a.mov(Operand::Mem(Reg::Zsi, off_end(ptr_width)), Operand::Reg(Reg::Zax));
    a.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    a.mov(Operand::Mem(Reg::Zsi, off_len(ptr_width)), Operand::Reg(Reg::Zax));
    a.mov(Operand::Mem(Reg::Zsi, off_cap(ptr_width)), Operand::Reg(Reg::Zbx));

    a.mov(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zsi));
    a.pop(Operand::Reg(Reg::Zsi));
    a.pop(Operand::Reg(Reg::Zbx));
    a.ret();
}

/// `VectorFree(header)`: frees the data block, then the header itself.
pub fn gen_vector_free<A: Assembler + ?Sized>(a: &mut A, free_addr: Rptr, ptr_width: usize, is_x64: bool) {
    let _ = ptr_width;
    a.push(Operand::Reg(Reg::Zbx));
    a.mov(Operand::Reg(Reg::Zbx), Operand::Reg(Reg::Zcx));

    a.mov(Operand::Reg(Reg::Zcx), Operand::Mem(Reg::Zbx, 0));
    gen_native_call(a, free_addr, &[Reg::Zcx], is_x64);

    a.mov(Operand::Reg(Reg::Zcx), Operand::Reg(Reg::Zbx));
    gen_native_call(a, free_addr, &[Reg::Zcx], is_x64);

    a.pop(Operand::Reg(Reg::Zbx));
    a.ret();
}

/// Shared body of `VectorGrow`: doubles the data block's capacity via
/// `realloc`. The header's own address never changes, only
/// `data_ptr`/`write_ptr`/`end_ptr`/`capacity_bytes` — a caller
/// holding the header handle across a grow stays valid. Expects the
/// header in `Zbx` already (not `Zcx`), since both
/// [`gen_vector_grow`] and the inlined growth check inside
/// [`gen_vector_add`] reach this with the header already parked
/// there; factored out so `add` doesn't need a same-buffer forward
/// reference to a separately addressed grow function.
fn gen_grow_body<A: Assembler + ?Sized>(a: &mut A, realloc_addr: Rptr, ptr_width: usize, is_x64: bool) {
    a.push(Operand::Reg(Reg::Zdi));

    a.mov(Operand::Reg(Reg::Zsi), Operand::Mem(Reg::Zbx, off_cap(ptr_width))); // zsi = old capacity_bytes
    a.mov(Operand::Reg(Reg::Zdi), Operand::Reg(Reg::Zsi));
    a.add(Operand::Reg(Reg::Zdi), Operand::Reg(Reg::Zsi)); // zdi = new capacity_bytes (doubled)

    a.mov(Operand::Reg(Reg::Zcx), Operand::Mem(Reg::Zbx, 0)); // old data_ptr
    a.mov(Operand::Reg(Reg::Zdx), Operand::Reg(Reg::Zdi));
    gen_native_call(a, realloc_addr, &[Reg::Zcx, Reg::Zdx], is_x64); // zax = new data_ptr

    a.mov(Operand::Mem(Reg::Zbx, 0), Operand::Reg(Reg::Zax));
    // write_ptr = new_data + old capacity_bytes (the block was exactly
    // full right before a grow runs, so that's exactly how many bytes
    // are already in use — no multiply needed to re-derive it).
    a.add(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zsi));
    a.mov(Operand::Mem(Reg::Zbx, off_write(ptr_width)), Operand::Reg(Reg::Zax));
    // end_ptr = new_data + new capacity_bytes. zax currently holds
    // new_data + old_cap; add (new_cap - old_cap) == old_cap again.
    a.add(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zsi));
    a.mov(Operand::Mem(Reg::Zbx, off_end(ptr_width)), Operand::Reg(Reg::Zax));
    a.mov(Operand::Mem(Reg::Zbx, off_cap(ptr_width)), Operand::Reg(Reg::Zdi));

    a.pop(Operand::Reg(Reg::Zdi));
}

/// `VectorGrow(header)`, the standalone entry point `IpcVectorApi::grow`
/// calls directly.
pub fn gen_vector_grow<A: Assembler + ?Sized>(a: &mut A, realloc_addr: Rptr, ptr_width: usize, is_x64: bool) {
    a.push(Operand::Reg(Reg::Zbx));
    a.push(Operand::Reg(Reg::Zsi));
    a.mov(Operand::Reg(Reg::Zbx), Operand::Reg(Reg::Zcx)); // zbx = header

    gen_grow_body(a, realloc_addr, ptr_width, is_x64);

    a.pop(Operand::Reg(Reg::Zsi));
    a.pop(Operand::Reg(Reg::Zbx));
    a.ret();
}

/// Shared body of `VectorAdd`: grows first if the data block is full
/// (`write_ptr == end_ptr`, the only comparison this needs, since
/// `length` never exceeds `capacity` between calls), then appends.
/// Expects the header in `Zbx` and the element in `Zsi` already, like
/// [`gen_grow_body`]; factored out so [`gen_foreach_adapter`] can reach
/// the same append logic without a same-buffer call to
/// [`gen_vector_add`]'s own uploaded copy.
fn gen_add_body<A: Assembler + ?Sized>(a: &mut A, realloc_addr: Rptr, ptr_width: usize, is_x64: bool) {
    let full = a.new_label();
    let store = a.new_label();

    a.mov(Operand::Reg(Reg::Zdx), Operand::Mem(Reg::Zbx, off_write(ptr_width)));
    a.mov(Operand::Reg(Reg::Zax), Operand::Mem(Reg::Zbx, off_end(ptr_width)));
    a.sub(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zdx));
    a.jump_if_zero(Reg::Zax, full);
    a.jump(store);

    a.bind(full);
    // `elem` sits in `Zsi`, which `gen_grow_body` also uses as scratch;
    // save it across the call.
    a.push(Operand::Reg(Reg::Zsi));
    gen_grow_body(a, realloc_addr, ptr_width, is_x64);
    a.pop(Operand::Reg(Reg::Zsi));
    a.mov(Operand::Reg(Reg::Zdx), Operand::Mem(Reg::Zbx, off_write(ptr_width)));

    a.bind(store);
    a.mov(Operand::Mem(Reg::Zdx, 0), Operand::Reg(Reg::Zsi));
    a.add(Operand::Reg(Reg::Zdx), Operand::Imm(ptr_width as i64));
    a.mov(Operand::Mem(Reg::Zbx, off_write(ptr_width)), Operand::Reg(Reg::Zdx));
    a.mov(Operand::Reg(Reg::Zax), Operand::Mem(Reg::Zbx, off_len(ptr_width)));
    a.add(Operand::Reg(Reg::Zax), Operand::Imm(1));
    a.mov(Operand::Mem(Reg::Zbx, off_len(ptr_width)), Operand::Reg(Reg::Zax));
}

/// `VectorAdd(header, elem)`, the fastcall entry point `IpcVectorApi::add`
/// calls directly.
pub fn gen_vector_add<A: Assembler + ?Sized>(
    a: &mut A,
    realloc_addr: Rptr,
    ptr_width: usize,
    is_x64: bool,
) {
    a.push(Operand::Reg(Reg::Zbx));
    a.push(Operand::Reg(Reg::Zsi));

    a.mov(Operand::Reg(Reg::Zbx), Operand::Reg(Reg::Zcx)); // zbx = header
    a.mov(Operand::Reg(Reg::Zsi), Operand::Reg(Reg::Zdx)); // zsi = elem

    gen_add_body(a, realloc_addr, ptr_width, is_x64);

    a.pop(Operand::Reg(Reg::Zsi));
    a.pop(Operand::Reg(Reg::Zbx));
    a.ret();
}

/// `VectorForeachAdapter(elem, header)`: the callback Mono's
/// `mono_*_foreach` family invokes directly, with the vector header
/// passed back to it as `user_data`. Grounded on
/// `rmono_foreach_ipcvec_adapter`, which exists for the same reason:
/// the foreach callback's own argument order (element first, user data
/// second) is the reverse of `VectorAdd`'s (header first, element
/// second), so something has to sit between them and swap. Shares
/// [`gen_add_body`] with [`gen_vector_add`] rather than calling that
/// primitive's own uploaded copy, since this callback's calling
/// convention (the target's native C convention) only ever reaches
/// this buffer from the outside, never from another label inside it.
pub fn gen_foreach_adapter<A: Assembler + ?Sized>(
    a: &mut A,
    realloc_addr: Rptr,
    ptr_width: usize,
    is_x64: bool,
) {
    a.push(Operand::Reg(Reg::Zbx));
    a.push(Operand::Reg(Reg::Zsi));

    if is_x64 {
        // Microsoft x64: first arg (elem) already in Zcx, second
        // (user_data/header) in Zdx.
        a.mov(Operand::Reg(Reg::Zsi), Operand::Reg(Reg::Zcx)); // elem
        a.mov(Operand::Reg(Reg::Zbx), Operand::Reg(Reg::Zdx)); // header
    } else {
        // cdecl: args pushed right-to-left by the caller, so elem sits
        // above user_data on the stack. Account for this function's
        // own two pushes above when indexing from Zsp.
        let w = ptr_width as i32;
        a.mov(Operand::Reg(Reg::Zsi), Operand::Mem(Reg::Zsp, 3 * w)); // elem
        a.mov(Operand::Reg(Reg::Zbx), Operand::Mem(Reg::Zsp, 4 * w)); // header/user_data
    }

    gen_add_body(a, realloc_addr, ptr_width, is_x64);

    a.pop(Operand::Reg(Reg::Zsi));
    a.pop(Operand::Reg(Reg::Zbx));
    a.ret();
}

/// `VectorClear(header)`: resets `write_ptr` to `data_ptr` and
/// `length` to zero. Capacity is untouched, matching the original's
/// reuse-don't-reallocate intent.
pub fn gen_vector_clear<A: Assembler + ?Sized>(a: &mut A, ptr_width: usize) {
    a.mov(Operand::Reg(Reg::Zax), Operand::Mem(Reg::Zcx, 0));
    a.mov(Operand::Mem(Reg::Zcx, off_write(ptr_width)), Operand::Reg(Reg::Zax));
    a.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    a.mov(Operand::Mem(Reg::Zcx, off_len(ptr_width)), Operand::Reg(Reg::Zax));
    a.ret();
}

/// `VectorLength(header) -> length`.
pub fn gen_vector_length<A: Assembler + ?Sized>(a: &mut A, ptr_width: usize) {
    a.mov(Operand::Reg(Reg::Zax), Operand::Mem(Reg::Zcx, off_len(ptr_width)));
    a.ret();
}

/// `VectorCapacity(header) -> capacity_bytes`. The host divides by
/// `elem_size` itself; the header never stores a count, only bytes.
pub fn gen_vector_capacity<A: Assembler + ?Sized>(a: &mut A, ptr_width: usize) {
    a.mov(Operand::Reg(Reg::Zax), Operand::Mem(Reg::Zcx, off_cap(ptr_width)));
    a.ret();
}

/// `VectorData(header) -> data_ptr`.
pub fn gen_vector_data<A: Assembler + ?Sized>(a: &mut A) {
    a.mov(Operand::Reg(Reg::Zax), Operand::Mem(Reg::Zcx, 0));
    a.ret();
}
