// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Process-access backend contract.
//!
//! This is the seam deliberately left out of scope here:
//! the concrete OS-level process-access implementation (memory
//! read/write, module enumeration, remote thread execution, remote
//! memory allocation, assembler code emission) is an injected
//! dependency. Only the trait boundary lives in this crate, grounded
//! 1:1 on `RMonoProcess.h`'s virtual method list.
//!
//! `Backend` is object-safe so a `Runtime` can hold
//! `Arc<dyn Backend + Send + Sync>` without knowing which concrete
//! process-access library backs it — the same seam `audioipc`'s
//! `rpc::Server`/transport traits draw between protocol and transport.
//! It needs to be `Arc`, not `Rc`, because the worker thread spawned at
//! attach time captures a clone of it by move.

use crate::errors::Result;
use crate::types::{CallingConvention, ProcessorArch, Protection, Rptr};

/// A handle to a module (DLL) loaded in the target, as returned by
/// [`Backend::get_module`]/[`Backend::enumerate_modules`].
pub trait Module: std::fmt::Debug {
    fn name(&self) -> &str;
    fn base_address(&self) -> Rptr;
}

/// The general-purpose register file the wrapper/boilerplate generator
/// programs against, named the way `asmutil.h` names them (`zax`,
/// `zcx`, ...): the "z" prefix is AsmJit's convention for "whichever
/// width this architecture uses" (`eax`/`rax` etc.), which is exactly
/// the abstraction the core needs — it never hard-codes 32- vs 64-bit
/// register names itself.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Reg {
    Zax,
    Zcx,
    Zdx,
    Zbx,
    Zsp,
    Zbp,
    Zsi,
    Zdi,
}

/// One raw-mnemonic operand.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// `[reg + disp]`.
    Mem(Reg, i32),
}

/// Emits target-executable machine code with label support, used by the
/// wrapper generator and the boilerplate helpers. The actual instruction *encoding*
/// is the injected backend's concern; this
/// trait is the contract the in-scope wrapper generator programs
/// against, grounded 1:1 on the handful of mnemonics `asmutil.h`
/// actually uses (`mov`, `xor_`, `push`, `pop`, `call`, `add`/`sub` on
/// `zsp`, `jecxz`-style zero-test-and-jump) plus label management.
pub trait Assembler {
    type Label: Copy + Eq + std::fmt::Debug;

    /// Declare a new label that can be bound later with [`Assembler::bind`]
    /// and referenced before that by jumps/calls.
    fn new_label(&mut self) -> Self::Label;

    /// Bind `label` to the current emission position.
    fn bind(&mut self, label: Self::Label);

    fn mov(&mut self, dst: Operand, src: Operand);
    fn xor(&mut self, dst: Operand, src: Operand);
    fn add(&mut self, dst: Operand, src: Operand);
    fn sub(&mut self, dst: Operand, src: Operand);
    fn push(&mut self, src: Operand);
    fn pop(&mut self, dst: Operand);
    fn ret(&mut self);
    fn call_reg(&mut self, reg: Reg);

    /// `asmutil.h`'s `jecxz`/`jrcxz`: jump to `label` iff `reg == 0`,
    /// without disturbing flags needed elsewhere — used by the checked
    /// gchandle helpers to skip the Mono call
    /// entirely when the input is already null/invalid.
    fn jump_if_zero(&mut self, reg: Reg, label: Self::Label);
    fn jump(&mut self, label: Self::Label);

    /// Emit a call to `addr` using `calling_conv`, loading each of
    /// `args` into the position the target's native calling convention
    /// expects (register or stack slot), then — if `return_into` is
    /// `Some(offset)` — storing the raw function's return value back
    /// into the data block at that offset. This is the one primitive
    /// every per-function wrapper is built from
    /// (`gen_call(addr, args, calling_conv)`); the per-ABI register/
    /// stack assignment it performs is exactly the "assembler code
    /// emission" left to the injected backend, not here.
    fn gen_call(
        &mut self,
        addr: Rptr,
        args: &[AsmArg],
        return_into: Option<usize>,
        calling_conv: CallingConvention,
    );

    /// Finalise emission and return the machine code bytes, ready for
    /// upload via [`Backend::write`].
    fn finalize(self: Box<Self>) -> Vec<u8>;

    /// Byte offset of `label` within the finalized buffer. Only valid
    /// after the label has been bound.
    fn label_offset(&self, label: Self::Label) -> usize;
}

/// One argument to [`Assembler::gen_call`]: either an immediate value
/// already known at emission time, the wrapper's data-block pointer
/// itself (the one value every wrapper receives uniformly), or a
/// value to be loaded out of the data block at a given
/// byte offset — this is how the function-entry wrapper generator
/// feeds each marshalled argument to the real
/// Mono function without the core needing to know the target's native
/// parameter-passing convention itself.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AsmArg {
    Immediate(u64),
    DataBlockPtr,
    DataBlockOffset { offset: usize, size: usize },
    /// Whatever full-width value currently sits in `reg`, passed through
    /// untouched. Used for values that must never be round-tripped
    /// through a data-block slot narrower than a pointer — a raw
    /// managed pointer translated from a gchandle-width argument slot is
    /// held here instead of being written back into that slot.
    Register(Reg),
    /// The address of a data-block slot (`data_block_ptr + offset`),
    /// not the value stored there — for out-parameters the real
    /// function writes through, like `mono_runtime_invoke`'s trailing
    /// `MonoObject **exc`.
    DataBlockOffsetAddr { offset: usize },
}

/// The process-access backend contract. Every method maps
/// 1:1 onto a `RMonoProcess` virtual method.
pub trait Backend {
    /// Make the backend ready and prepare a worker-thread execution
    /// environment. Idempotent only in the sense that the engine never
    /// calls it twice per `Runtime`.
    fn attach(&self) -> Result<()>;

    fn get_module(&self, name: &str) -> Result<Option<Box<dyn Module>>>;
    fn enumerate_modules(&self) -> Result<Vec<Box<dyn Module>>>;

    /// Resolve `symbol`'s address within `module`, if exported.
    fn export_address(&self, module: &dyn Module, symbol: &str) -> Result<Option<Rptr>>;

    fn alloc(&self, size: usize, protection: Protection) -> Result<Rptr>;
    fn free(&self, ptr: Rptr) -> Result<()>;

    fn read(&self, ptr: Rptr, dst: &mut [u8]) -> Result<()>;
    fn write(&self, ptr: Rptr, src: &[u8]) -> Result<()>;

    fn page_size(&self) -> Result<usize>;
    fn region_size(&self, ptr: Rptr) -> Result<usize>;

    fn processor_arch(&self) -> Result<ProcessorArch>;

    /// Produce a fresh assembler instance capable of targeting this
    /// backend's architecture.
    fn assembler(&self) -> Box<dyn Assembler<Label = usize>>;

    /// Synchronously run code at `addr` on the worker thread, using
    /// `calling_conv`, passing `args` (already-encoded ABI-width
    /// words) and returning the raw ABI-width result. This is the
    /// single choke point every [`crate::funcentry::FuncEntry`]
    /// invocation funnels through.
    fn rpc_call(&self, addr: Rptr, calling_conv: CallingConvention, args: &[u64]) -> Result<u64>;
}
