// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! In-process loopback backend,
//! gated behind the `test-support` feature.
//!
//! A real [`crate::backend::Backend`] attaches to a separate process and
//! its `Assembler` emits real machine code; the injected encoder and
//! the remote-process plumbing are both explicitly out of scope for
//! this crate. [`LoopbackBackend`] stands in for both at once
//! so the rest of the engine — dispatcher, function entry, handle
//! system, facade — can be exercised in ordinary `cargo test` without a
//! real Mono process: its assembler records the same instruction
//! stream a real encoder would turn into bytes, and `rpc_call`
//! interprets that stream directly instead of jumping into it.
//!
//! Grounded on `audioipc::rpc`'s own practice of testing its protocol
//! layer against an in-memory loopback transport rather than a real
//! socket; here the loopback sits one layer lower, at the process-
//! access boundary itself.
//!
//! `Runtime::attach` takes `Arc<dyn Backend + Send + Sync>` and, on a
//! successful attach, hands a clone of it to the worker thread it
//! spawns — so this backend has to be genuinely `Send + Sync`, not just
//! single-threaded-in-practice. Every piece of interior mutability below
//! is therefore `Mutex`/`Atomic*`, matching the same choice `runtime.rs`'s
//! own `FakeBackend` test double makes, rather than `Rc`/`Cell`/`RefCell`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{AsmArg, Assembler, Backend, Module, Operand, Reg};
use crate::errors::{Error, ErrorKind, Result};
use crate::types::{CallingConvention, ProcessorArch, Protection, Rptr};

/// One operation recorded by [`LoopbackAssembler`]. Mirrors
/// [`crate::backend::Assembler`]'s mnemonics 1:1; `Bind` carries no
/// entry here because `bind()` resolves its label to an offset
/// immediately rather than needing a placeholder in the stream.
#[derive(Clone, Debug)]
enum Op {
    Mov(Operand, Operand),
    Xor(Operand, Operand),
    Add(Operand, Operand),
    Sub(Operand, Operand),
    Push(Operand),
    Pop(Operand),
    Ret,
    CallReg(Reg),
    JumpIfZero(Reg, usize),
    Jump(usize),
    GenCall {
        addr: Rptr,
        args: Vec<AsmArg>,
        return_into: Option<usize>,
    },
}

/// The register [`crate::asm::funcwrap`] keeps the data block pointer
/// in across calls (`funcwrap::DATA_BLOCK_REG`). Duplicated here rather
/// than made `pub` in `funcwrap` since only this interpreter needs it.
const DATA_BLOCK_REG: Reg = Reg::Zbx;

type CodeSink = Arc<Mutex<Option<(Vec<Op>, HashMap<usize, usize>)>>>;

struct LoopbackAssembler {
    ops: Vec<Op>,
    labels: HashMap<usize, usize>,
    next_label: usize,
    sink: CodeSink,
}

impl Assembler for LoopbackAssembler {
    type Label = usize;

    fn new_label(&mut self) -> usize {
        let l = self.next_label;
        self.next_label += 1;
        l
    }
    fn bind(&mut self, label: usize) {
        self.labels.insert(label, self.ops.len());
    }
    fn mov(&mut self, dst: Operand, src: Operand) {
        self.ops.push(Op::Mov(dst, src));
    }
    fn xor(&mut self, dst: Operand, src: Operand) {
        self.ops.push(Op::Xor(dst, src));
    }
    fn add(&mut self, dst: Operand, src: Operand) {
        self.ops.push(Op::Add(dst, src));
    }
    fn sub(&mut self, dst: Operand, src: Operand) {
        self.ops.push(Op::Sub(dst, src));
    }
    fn push(&mut self, src: Operand) {
        self.ops.push(Op::Push(src));
    }
    fn pop(&mut self, dst: Operand) {
        self.ops.push(Op::Pop(dst));
    }
    fn ret(&mut self) {
        self.ops.push(Op::Ret);
    }
    fn call_reg(&mut self, reg: Reg) {
        self.ops.push(Op::CallReg(reg));
    }
    fn jump_if_zero(&mut self, reg: Reg, label: usize) {
        self.ops.push(Op::JumpIfZero(reg, label));
    }
    fn jump(&mut self, label: usize) {
        self.ops.push(Op::Jump(label));
    }
    fn gen_call(
        &mut self,
        addr: Rptr,
        args: &[AsmArg],
        return_into: Option<usize>,
        _calling_conv: CallingConvention,
    ) {
        self.ops.push(Op::GenCall {
            addr,
            args: args.to_vec(),
            return_into,
        });
    }
    fn finalize(self: Box<Self>) -> Vec<u8> {
        let len = self.ops.len().max(1);
        *self.sink.lock().unwrap() = Some((self.ops, self.labels));
        vec![0u8; len]
    }
    fn label_offset(&self, label: usize) -> usize {
        *self.labels.get(&label).unwrap_or(&0)
    }
}

#[derive(Debug)]
struct LoopbackModule {
    name: String,
}

impl Module for LoopbackModule {
    fn name(&self) -> &str {
        &self.name
    }
    fn base_address(&self) -> Rptr {
        Rptr(0x1000_0000)
    }
}

/// A function registered with a [`FakeMonoImage`]: already-decoded
/// ABI-width words in, an ABI-width word out — the same contract
/// [`crate::backend::Backend::rpc_call`] presents. `Send + Sync` for the
/// same reason [`LoopbackBackend`] itself must be: the closure is part
/// of a backend a real attach may hand to its worker thread.
pub type NativeFn = Box<dyn Fn(&[u64]) -> Result<u64> + Send + Sync>;

/// A fake Mono embedding image built by test code before
/// [`crate::runtime::Runtime::attach`] runs against a
/// [`LoopbackBackend`]: a name-to-address export table plus the native
/// Rust closure standing in for the real Mono implementation behind
/// each address.
pub struct FakeMonoImage {
    exports: HashMap<&'static str, Rptr>,
    natives: HashMap<u64, NativeFn>,
    next_addr: u64,
}

impl Default for FakeMonoImage {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMonoImage {
    pub fn new() -> Self {
        FakeMonoImage {
            exports: HashMap::new(),
            natives: HashMap::new(),
            next_addr: 0x1000,
        }
    }

    /// Register one exported function under `name`, backed by `f`.
    /// Returns the address assigned, in case a test needs to call it
    /// directly.
    pub fn export(
        &mut self,
        name: &'static str,
        f: impl Fn(&[u64]) -> Result<u64> + Send + Sync + 'static,
    ) -> Rptr {
        let addr = self.next_addr;
        self.next_addr += 0x10;
        self.exports.insert(name, Rptr(addr));
        self.natives.insert(addr, Box::new(f));
        Rptr(addr)
    }
}

/// In-process stand-in for a real [`Backend`]. Heap
/// reads/writes go to an ordinary `HashMap`; code "upload" is picked up
/// from whichever [`LoopbackAssembler`] was most recently finalized and
/// then written to an `EXECUTE_READ_WRITE` region — correct for the
/// one-assembler-per-attach lifecycle `Runtime::attach` drives, not a
/// general multi-assembler backend.
pub struct LoopbackBackend {
    heap: Mutex<HashMap<u64, Vec<u8>>>,
    next_addr: AtomicU64,
    protections: Mutex<HashMap<u64, Protection>>,
    image: FakeMonoImage,
    pending_code: Mutex<CodeSink>,
    code_regions: Mutex<HashMap<u64, (Vec<Op>, HashMap<usize, usize>)>>,
    arch: ProcessorArch,
}

impl LoopbackBackend {
    pub fn new(image: FakeMonoImage) -> Self {
        LoopbackBackend {
            heap: Mutex::new(HashMap::new()),
            next_addr: AtomicU64::new(0x5000),
            protections: Mutex::new(HashMap::new()),
            image,
            pending_code: Mutex::new(Arc::new(Mutex::new(None))),
            code_regions: Mutex::new(HashMap::new()),
            arch: ProcessorArch::X86_64,
        }
    }

    fn invoke_address(&self, addr: Rptr, args: &[u64]) -> Result<u64> {
        let found = {
            let regions = self.code_regions.lock().unwrap();
            regions
                .iter()
                .find(|(&base, (ops, _))| {
                    let len = ops.len() as u64;
                    addr.0 >= base && addr.0 < base + len.max(1)
                })
                .map(|(&base, (ops, labels))| (base, ops.clone(), labels.clone()))
        };
        if let Some((base, ops, labels)) = found {
            let start = (addr.0 - base) as usize;
            return self.interpret(&ops, &labels, start, args);
        }

        if let Some(f) = self.image.natives.get(&addr.0) {
            return f(args);
        }

        Err(Error::from(ErrorKind::BackendFailure(format!(
            "no function registered at 0x{:x}",
            addr.0
        ))))
    }

    fn interpret(
        &self,
        ops: &[Op],
        labels: &HashMap<usize, usize>,
        start: usize,
        args: &[u64],
    ) -> Result<u64> {
        let mut regs: HashMap<Reg, u64> = HashMap::new();
        regs.insert(Reg::Zcx, args.first().copied().unwrap_or(0));
        let mut stack: Vec<u64> = Vec::new();
        let mut pc = start;

        loop {
            let op = ops.get(pc).ok_or_else(|| {
                Error::from(ErrorKind::BackendFailure(
                    "interpreter ran past the end of the code region".into(),
                ))
            })?;

            match op {
                Op::Ret => return Ok(regs.get(&Reg::Zax).copied().unwrap_or(0)),
                Op::Mov(dst, src) => {
                    let v = self.read_operand(&regs, src)?;
                    self.write_operand(&mut regs, dst, v)?;
                    pc += 1;
                }
                Op::Xor(dst, _src) => {
                    // Every `xor` this engine emits is the `reg, reg`
                    // zero idiom (see `asm::boilerplate`).
                    self.write_operand(&mut regs, dst, 0)?;
                    pc += 1;
                }
                Op::Add(dst, src) => {
                    let a = self.read_operand(&regs, dst)?;
                    let b = self.read_operand(&regs, src)?;
                    self.write_operand(&mut regs, dst, a.wrapping_add(b))?;
                    pc += 1;
                }
                Op::Sub(dst, src) => {
                    let a = self.read_operand(&regs, dst)?;
                    let b = self.read_operand(&regs, src)?;
                    self.write_operand(&mut regs, dst, a.wrapping_sub(b))?;
                    pc += 1;
                }
                Op::Push(src) => {
                    let v = self.read_operand(&regs, src)?;
                    stack.push(v);
                    pc += 1;
                }
                Op::Pop(dst) => {
                    let v = stack.pop().unwrap_or(0);
                    self.write_operand(&mut regs, dst, v)?;
                    pc += 1;
                }
                Op::CallReg(reg) => {
                    let target = Rptr(regs.get(reg).copied().unwrap_or(0));
                    let call_args = [regs.get(&Reg::Zcx).copied().unwrap_or(0)];
                    let result = self.invoke_address(target, &call_args)?;
                    regs.insert(Reg::Zax, result);
                    pc += 1;
                }
                Op::JumpIfZero(reg, label) => {
                    if regs.get(reg).copied().unwrap_or(0) == 0 {
                        pc = *labels.get(label).ok_or_else(|| {
                            Error::from(ErrorKind::BackendFailure(format!(
                                "unbound label {}",
                                label
                            )))
                        })?;
                    } else {
                        pc += 1;
                    }
                }
                Op::Jump(label) => {
                    pc = *labels.get(label).ok_or_else(|| {
                        Error::from(ErrorKind::BackendFailure(format!("unbound label {}", label)))
                    })?;
                }
                Op::GenCall { addr, args: asm_args, return_into } => {
                    let data_block_ptr = regs.get(&DATA_BLOCK_REG).copied().unwrap_or(0);
                    let mut call_args = Vec::with_capacity(asm_args.len());
                    for a in asm_args {
                        let v = match a {
                            AsmArg::Immediate(v) => *v,
                            AsmArg::DataBlockPtr => data_block_ptr,
                            AsmArg::DataBlockOffset { offset, size } => {
                                self.read_data_block_word(Rptr(data_block_ptr), *offset, *size)?
                            }
                            AsmArg::Register(reg) => regs.get(reg).copied().unwrap_or(0),
                            AsmArg::DataBlockOffsetAddr { offset } => data_block_ptr + *offset as u64,
                        };
                        call_args.push(v);
                    }
                    let result = self.invoke_address(*addr, &call_args)?;
                    if let Some(off) = return_into {
                        self.write_data_block_word(Rptr(data_block_ptr), *off, result)?;
                    }
                    regs.insert(Reg::Zax, result);
                    pc += 1;
                }
            }
        }
    }

    fn read_operand(&self, regs: &HashMap<Reg, u64>, op: &Operand) -> Result<u64> {
        Ok(match op {
            Operand::Reg(r) => regs.get(r).copied().unwrap_or(0),
            Operand::Imm(v) => *v as u64,
            Operand::Mem(base, disp) => {
                let base = regs.get(base).copied().unwrap_or(0);
                let addr = (base as i64 + *disp as i64) as u64;
                self.read_data_block_word(Rptr(addr), 0, 8)?
            }
        })
    }

    fn write_operand(&self, regs: &mut HashMap<Reg, u64>, op: &Operand, value: u64) -> Result<()> {
        match op {
            Operand::Reg(r) => {
                regs.insert(*r, value);
            }
            Operand::Imm(_) => {
                return Err(Error::from(ErrorKind::BackendFailure(
                    "cannot write to an immediate operand".into(),
                )))
            }
            Operand::Mem(base, disp) => {
                let base = regs.get(base).copied().unwrap_or(0);
                let addr = (base as i64 + *disp as i64) as u64;
                self.write_data_block_word(Rptr(addr), 0, value)?;
            }
        }
        Ok(())
    }

    fn read_data_block_word(&self, base: Rptr, offset: usize, size: usize) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read(Rptr(base.0 + offset as u64), &mut bytes[..size.min(8)])?;
        Ok(u64::from_ne_bytes(bytes))
    }

    fn write_data_block_word(&self, base: Rptr, offset: usize, value: u64) -> Result<()> {
        let bytes = value.to_ne_bytes();
        self.write(Rptr(base.0 + offset as u64), &bytes)
    }
}

impl Backend for LoopbackBackend {
    fn attach(&self) -> Result<()> {
        Ok(())
    }

    fn get_module(&self, name: &str) -> Result<Option<Box<dyn Module>>> {
        Ok(Some(Box::new(LoopbackModule { name: name.to_string() })))
    }

    fn enumerate_modules(&self) -> Result<Vec<Box<dyn Module>>> {
        Ok(vec![Box::new(LoopbackModule { name: "mono.dll".to_string() })])
    }

    fn export_address(&self, _module: &dyn Module, symbol: &str) -> Result<Option<Rptr>> {
        Ok(self.image.exports.get(symbol).copied())
    }

    fn alloc(&self, size: usize, protection: Protection) -> Result<Rptr> {
        let addr = self.next_addr.fetch_add(size as u64 + 0x100, Ordering::SeqCst);
        self.heap.lock().unwrap().insert(addr, vec![0u8; size.max(1)]);
        self.protections.lock().unwrap().insert(addr, protection);
        Ok(Rptr(addr))
    }

    fn free(&self, ptr: Rptr) -> Result<()> {
        self.heap.lock().unwrap().remove(&ptr.0);
        self.protections.lock().unwrap().remove(&ptr.0);
        self.code_regions.lock().unwrap().remove(&ptr.0);
        Ok(())
    }

    fn read(&self, ptr: Rptr, dst: &mut [u8]) -> Result<()> {
        let heap = self.heap.lock().unwrap();
        let (base, region) = heap
            .iter()
            .find(|(&base, bytes)| ptr.0 >= base && ptr.0 + dst.len() as u64 <= base + bytes.len() as u64)
            .ok_or_else(|| {
                Error::from(ErrorKind::BackendFailure(format!(
                    "read from unmapped address 0x{:x}",
                    ptr.0
                )))
            })?;
        let start = (ptr.0 - base) as usize;
        dst.copy_from_slice(&region[start..start + dst.len()]);
        Ok(())
    }

    fn write(&self, ptr: Rptr, src: &[u8]) -> Result<()> {
        {
            let mut heap = self.heap.lock().unwrap();
            let (&base, region) = heap
                .iter_mut()
                .find(|(&base, bytes)| ptr.0 >= base && ptr.0 + src.len() as u64 <= base + bytes.len() as u64)
                .ok_or_else(|| {
                    Error::from(ErrorKind::BackendFailure(format!(
                        "write to unmapped address 0x{:x}",
                        ptr.0
                    )))
                })?;
            let start = (ptr.0 - base) as usize;
            region[start..start + src.len()].copy_from_slice(src);
        }

        let is_executable = matches!(
            self.protections.lock().unwrap().get(&ptr.0),
            Some(p) if *p == Protection::EXECUTE_READ_WRITE
        );
        if is_executable {
            if let Some(code) = self.pending_code.lock().unwrap().lock().unwrap().take() {
                self.code_regions.lock().unwrap().insert(ptr.0, code);
            }
        }
        Ok(())
    }

    fn page_size(&self) -> Result<usize> {
        Ok(4096)
    }

    fn region_size(&self, ptr: Rptr) -> Result<usize> {
        Ok(self.heap.lock().unwrap().get(&ptr.0).map(|b| b.len()).unwrap_or(0))
    }

    fn processor_arch(&self) -> Result<ProcessorArch> {
        Ok(self.arch)
    }

    fn assembler(&self) -> Box<dyn Assembler<Label = usize>> {
        let sink: CodeSink = Arc::new(Mutex::new(None));
        *self.pending_code.lock().unwrap() = sink.clone();
        Box::new(LoopbackAssembler {
            ops: Vec::new(),
            labels: HashMap::new(),
            next_label: 0,
            sink,
        })
    }

    fn rpc_call(&self, addr: Rptr, _calling_conv: CallingConvention, args: &[u64]) -> Result<u64> {
        self.invoke_address(addr, args)
    }
}
