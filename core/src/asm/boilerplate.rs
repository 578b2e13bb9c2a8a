// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Boilerplate helper stubs.
//!
//! Grounded 1:1 on `asmutil.h`'s `AsmGen*` functions: each one is a
//! small pseudo-function that checks its input for null/invalid before
//! making the real Mono call, so the engine never has to special-case
//! null handling at every call site that might receive one. All of
//! them take their single argument in `Zcx` and return in `Zax`,
//! following the fastcall-like register convention `asmutil.h` uses
//! throughout, and none of them require shadow stack space from the
//! caller.

use crate::backend::{Assembler, Operand, Reg};
use crate::types::{Gchandle, GCHANDLE_INVALID, Rptr};

const _: () = assert!(GCHANDLE_INVALID == 0);

/// `mono_gchandle_get_target(gchandle)`, short-circuiting to NULL when
/// `gchandle == GCHANDLE_INVALID` instead of calling into Mono (which
/// would otherwise abort). Input in `Zcx`, result in `Zax`.
pub fn gen_gchandle_get_target_checked<A: Assembler + ?Sized>(
    a: &mut A,
    raw_addr: Rptr,
    is_x64: bool,
) {
    let skip = a.new_label();

    a.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    a.jump_if_zero(Reg::Zcx, skip);

    a.mov(Operand::Reg(Reg::Zax), Operand::Imm(raw_addr.0 as i64));
    if is_x64 {
        a.sub(Operand::Reg(Reg::Zsp), Operand::Imm(32));
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(32));
    } else {
        a.push(Operand::Reg(Reg::Zcx));
        a.call_reg(Reg::Zax);
        a.pop(Operand::Reg(Reg::Zcx));
    }

    a.bind(skip);
}

/// `mono_gchandle_new(ptr, false)` (always non-pinned), short-circuiting
/// to `GCHANDLE_INVALID` when `ptr == NULL`. Input in `Zcx`, result in
/// `Zax`.
pub fn gen_gchandle_new_checked<A: Assembler + ?Sized>(a: &mut A, raw_addr: Rptr, is_x64: bool) {
    let skip = a.new_label();

    a.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    a.jump_if_zero(Reg::Zcx, skip);

    a.mov(Operand::Reg(Reg::Zax), Operand::Imm(raw_addr.0 as i64));
    if is_x64 {
        a.xor(Operand::Reg(Reg::Zdx), Operand::Reg(Reg::Zdx));
        a.sub(Operand::Reg(Reg::Zsp), Operand::Imm(32));
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(32));
    } else {
        a.push(Operand::Imm(0));
        a.push(Operand::Reg(Reg::Zcx));
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(2 * 4));
    }

    a.bind(skip);
}

/// `mono_class_is_valuetype(mono_object_get_class(obj))`,
/// short-circuiting to `false` when `obj == NULL`. Input in `Zcx`,
/// result in `Zax`.
pub fn gen_is_value_type_instance<A: Assembler + ?Sized>(
    a: &mut A,
    object_get_class_addr: Rptr,
    class_is_valuetype_addr: Rptr,
    is_x64: bool,
) {
    let skip = a.new_label();

    a.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    a.jump_if_zero(Reg::Zcx, skip);

    if is_x64 {
        a.sub(Operand::Reg(Reg::Zsp), Operand::Imm(32));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(object_get_class_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.mov(Operand::Reg(Reg::Zcx), Operand::Reg(Reg::Zax));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(class_is_valuetype_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(32));
    } else {
        a.push(Operand::Reg(Reg::Zcx));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(object_get_class_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.mov(Operand::Mem(Reg::Zsp, 0), Operand::Reg(Reg::Zax));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(class_is_valuetype_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(4));
    }

    a.bind(skip);
}

/// `mono_object_unbox(obj)`. Unlike the others, `asmutil.h` doesn't
/// null-check this one: unboxing a NULL reference is already a caller
/// error on the Mono side. Input in `Zcx`, result in `Zax`.
pub fn gen_object_unbox<A: Assembler + ?Sized>(a: &mut A, object_unbox_addr: Rptr, is_x64: bool) {
    if is_x64 {
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(object_unbox_addr.0 as i64),
        );
        a.sub(Operand::Reg(Reg::Zsp), Operand::Imm(32));
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(32));
    } else {
        a.push(Operand::Reg(Reg::Zcx));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(object_unbox_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(4));
    }
}

/// `mono_object_get_class(obj)`, short-circuiting to NULL when
/// `obj == NULL`. Input in `Zcx`, result in `Zax`.
pub fn gen_object_get_class<A: Assembler + ?Sized>(
    a: &mut A,
    object_get_class_addr: Rptr,
    is_x64: bool,
) {
    let skip = a.new_label();

    a.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    a.jump_if_zero(Reg::Zcx, skip);

    if is_x64 {
        a.sub(Operand::Reg(Reg::Zsp), Operand::Imm(32));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(object_get_class_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(32));
    } else {
        a.push(Operand::Reg(Reg::Zcx));
        a.mov(
            Operand::Reg(Reg::Zax),
            Operand::Imm(object_get_class_addr.0 as i64),
        );
        a.call_reg(Reg::Zax);
        a.add(Operand::Reg(Reg::Zsp), Operand::Imm(4));
    }

    a.bind(skip);
}

/// Sentinel GC-handle value a `*_checked` boilerplate helper returns in
/// place of calling Mono, surfaced here so callers can assert on it in
/// tests without reaching into `crate::types`.
pub const CHECKED_SKIP_RESULT: Gchandle = GCHANDLE_INVALID;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Eq, PartialEq, Clone)]
    enum Instr {
        NewLabel(usize),
        Bind(usize),
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
    }

    /// Records every mnemonic emitted, without encoding any of them,
    /// so these tests assert on *instruction selection* (the part this
    /// crate owns) rather than byte-level encoding (the injected
    /// backend's job).
    struct RecordingAssembler {
        instrs: Vec<Instr>,
        next_label: usize,
    }

    impl RecordingAssembler {
        fn new() -> Self {
            RecordingAssembler {
                instrs: Vec::new(),
                next_label: 0,
            }
        }
    }

    impl Assembler for RecordingAssembler {
        type Label = usize;

        fn new_label(&mut self) -> usize {
            let l = self.next_label;
            self.next_label += 1;
            self.instrs.push(Instr::NewLabel(l));
            l
        }
        fn bind(&mut self, label: usize) {
            self.instrs.push(Instr::Bind(label));
        }
        fn mov(&mut self, dst: Operand, src: Operand) {
            self.instrs.push(Instr::Mov(dst, src));
        }
        fn xor(&mut self, dst: Operand, src: Operand) {
            self.instrs.push(Instr::Xor(dst, src));
        }
        fn add(&mut self, dst: Operand, src: Operand) {
            self.instrs.push(Instr::Add(dst, src));
        }
        fn sub(&mut self, dst: Operand, src: Operand) {
            self.instrs.push(Instr::Sub(dst, src));
        }
        fn push(&mut self, src: Operand) {
            self.instrs.push(Instr::Push(src));
        }
        fn pop(&mut self, dst: Operand) {
            self.instrs.push(Instr::Pop(dst));
        }
        fn ret(&mut self) {
            self.instrs.push(Instr::Ret);
        }
        fn call_reg(&mut self, reg: Reg) {
            self.instrs.push(Instr::CallReg(reg));
        }
        fn jump_if_zero(&mut self, reg: Reg, label: usize) {
            self.instrs.push(Instr::JumpIfZero(reg, label));
        }
        fn jump(&mut self, label: usize) {
            self.instrs.push(Instr::Jump(label));
        }
        fn gen_call(
            &mut self,
            _addr: Rptr,
            _args: &[crate::backend::AsmArg],
            _return_into: Option<usize>,
            _calling_conv: crate::types::CallingConvention,
        ) {
            unimplemented!("not exercised by boilerplate helpers")
        }
        fn finalize(self: Box<Self>) -> Vec<u8> {
            Vec::new()
        }
        fn label_offset(&self, _label: usize) -> usize {
            0
        }
    }

    #[test]
    fn gchandle_get_target_checked_skips_call_on_invalid() {
        let mut asm = RecordingAssembler::new();
        gen_gchandle_get_target_checked(&mut asm, Rptr(0x4000), true);

        assert_eq!(
            asm.instrs,
            vec![
                Instr::NewLabel(0),
                Instr::Xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax)),
                Instr::JumpIfZero(Reg::Zcx, 0),
                Instr::Mov(Operand::Reg(Reg::Zax), Operand::Imm(0x4000)),
                Instr::Sub(Operand::Reg(Reg::Zsp), Operand::Imm(32)),
                Instr::CallReg(Reg::Zax),
                Instr::Add(Operand::Reg(Reg::Zsp), Operand::Imm(32)),
                Instr::Bind(0),
            ]
        );
    }

    #[test]
    fn gchandle_get_target_checked_x86_uses_push_pop_not_shadow_space() {
        let mut asm = RecordingAssembler::new();
        gen_gchandle_get_target_checked(&mut asm, Rptr(0x4000), false);

        assert_eq!(
            asm.instrs,
            vec![
                Instr::NewLabel(0),
                Instr::Xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax)),
                Instr::JumpIfZero(Reg::Zcx, 0),
                Instr::Mov(Operand::Reg(Reg::Zax), Operand::Imm(0x4000)),
                Instr::Push(Operand::Reg(Reg::Zcx)),
                Instr::CallReg(Reg::Zax),
                Instr::Pop(Operand::Reg(Reg::Zcx)),
                Instr::Bind(0),
            ]
        );
    }

    #[test]
    fn gchandle_new_checked_x64_zeroes_pin_flag_in_zdx() {
        let mut asm = RecordingAssembler::new();
        gen_gchandle_new_checked(&mut asm, Rptr(0x5000), true);

        assert!(asm
            .instrs
            .contains(&Instr::Xor(Operand::Reg(Reg::Zdx), Operand::Reg(Reg::Zdx))));
        assert_eq!(asm.instrs.last(), Some(&Instr::Bind(0)));
    }

    #[test]
    fn gchandle_new_checked_x86_pushes_pin_flag_then_pointer() {
        let mut asm = RecordingAssembler::new();
        gen_gchandle_new_checked(&mut asm, Rptr(0x5000), false);

        let push_positions: Vec<_> = asm
            .instrs
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, Instr::Push(_)))
            .collect();
        assert_eq!(push_positions.len(), 2);
        assert_eq!(push_positions[0].1, &Instr::Push(Operand::Imm(0)));
        assert_eq!(
            push_positions[1].1,
            &Instr::Push(Operand::Reg(Reg::Zcx))
        );
    }

    #[test]
    fn object_unbox_has_no_null_check() {
        let mut asm = RecordingAssembler::new();
        gen_object_unbox(&mut asm, Rptr(0x6000), true);

        assert!(!asm.instrs.iter().any(|i| matches!(i, Instr::JumpIfZero(..))));
    }

    #[test]
    fn is_value_type_instance_chains_get_class_then_is_valuetype() {
        let mut asm = RecordingAssembler::new();
        gen_is_value_type_instance(&mut asm, Rptr(0x7000), Rptr(0x7100), true);

        let calls: Vec<_> = asm
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::CallReg(_)))
            .collect();
        assert_eq!(calls.len(), 2);
    }
}
