// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Wrapper assembly.
//!
//! Grounded on `RMonoAPIFunctionWrap_Impl.h`'s generation scheme,
//! simplified to match a single-data-block contract: calls the
//! synthesised wrapper with the block's address, reads the block
//! back, and reconstructs outputs and return value. Every wrapper
//! therefore has the same target-side signature —
//! `fn(data_block_ptr: rptr)`, received in `Zcx` per the fastcall
//! convention used throughout — and the generator's job is entirely
//! about what it does with that one pointer: dereference managed-reference slots through the
//! checked gchandle helpers before forwarding to the real function,
//! then convert a managed-reference return value back the other way.

use crate::asm::boilerplate;
use crate::backend::{AsmArg, Assembler, Operand, Reg};
use crate::funcentry::{FuncSignature, ReturnKind, SlotKind};
use crate::types::{CallingConvention, Rptr};

/// Byte offset and size of one data-block slot, computed the same way
/// [`crate::funcentry::FuncEntry::invoke`]'s sizing pass computes them
/// at call time — static here because, for a single Mono API function,
/// a given parameter position is always the same declared type and
/// therefore always the same size.
#[derive(Copy, Clone, Debug)]
pub struct SlotLayout {
    pub offset: usize,
    pub size: usize,
}

/// Precomputed offsets for every parameter plus the return slot (if
/// any), handed to [`compile_wrapper`] by the attach-time bootstrap
/// that already knows each function's declared argument types.
#[derive(Clone, Debug, Default)]
pub struct WrapperLayout {
    pub params: Vec<SlotLayout>,
    pub ret: Option<SlotLayout>,
    /// Offset of the input "should this return try to unbox" flag,
    /// present only when the signature's `ret_auto_unbox` is set on a
    /// `ManagedRef` return.
    pub auto_unbox_enabled_offset: Option<usize>,
    /// Offset of the trailing "was this unboxed" byte, present only
    /// when the signature's `ret_auto_unbox` is set on a `ManagedRef`
    /// return.
    pub unboxed_flag_offset: Option<usize>,
    /// Offset of the slot the wrapper passes the real function its
    /// trailing `MonoObject **exc` out-parameter address into, present
    /// only when the signature's `exception_out` is set.
    pub exception_slot_offset: Option<usize>,
}

/// Target-side addresses of the three boilerplate helpers needed to
/// auto-unbox a `ManagedRef` return: get the
/// returned object's class, ask whether that class is a value type,
/// and unbox if so.
#[derive(Copy, Clone, Debug)]
pub struct UnboxAddrs {
    pub object_get_class_addr: Rptr,
    pub class_is_valuetype_addr: Rptr,
    pub object_unbox_addr: Rptr,
}

/// The fixed scratch register the generator uses to keep the data
/// block pointer alive across the per-parameter gchandle-checking
/// calls, which otherwise clobber `Zcx`/`Zax` (`asmutil.h`'s checked
/// helpers only promise not to touch anything else). Mono's raw
/// functions themselves are free to clobber `Zbx` under every calling
/// convention this engine targets, so the wrapper must reload it after
/// every call into Mono, not just save/restore it once.
const DATA_BLOCK_REG: Reg = Reg::Zbx;

/// Scratch registers used to hold a translated `ManagedRef` parameter's
/// raw pointer across the rest of the parameter-translation loop,
/// instead of writing it back into the (gchandle-width, narrower than
/// pointer-width) data-block slot it came from — a raw pointer is
/// only ever materialised into a worker-thread stack/register slot,
/// never back into target heap/data-block
/// memory. None of these collide with `DATA_BLOCK_REG` or `Zsp`, and
/// none are touched by the checked boilerplate helpers' own bodies.
/// The current function registry never has more than one `ManagedRef`
/// parameter on any single signature, so three is headroom, not a
/// precisely-sized bound.
const PARAM_SCRATCH_REGS: [Reg; 3] = [Reg::Zsi, Reg::Zdi, Reg::Zbp];

/// Emit one function's wrapper body into `asm`. `raw_addr` is the real
/// Mono function; `gchandle_get_target_addr`/`gchandle_new_addr` are
/// the two checked boilerplate helpers used to
/// translate managed-reference slots across the call. `unbox_addrs`,
/// when given, lets a `ManagedRef` return whose signature requests
/// auto-unboxing branch on whether the returned
/// object is a boxed value type.
pub fn compile_wrapper<A: Assembler + ?Sized>(
    asm: &mut A,
    raw_addr: Rptr,
    raw_calling_convention: CallingConvention,
    signature: &FuncSignature,
    layout: &WrapperLayout,
    gchandle_get_target_addr: Rptr,
    gchandle_new_addr: Rptr,
    unbox_addrs: Option<UnboxAddrs>,
    is_x64: bool,
) {
    // Entry: Zcx holds data_block_ptr. Stash it in a register the
    // boilerplate helpers don't touch so it survives their calls.
    asm.mov(Operand::Reg(DATA_BLOCK_REG), Operand::Reg(Reg::Zcx));

    let mut call_args = Vec::with_capacity(layout.params.len());
    let mut next_scratch = 0usize;
    for (param, slot) in signature.params.iter().zip(layout.params.iter()) {
        match param.kind {
            SlotKind::ManagedRef => {
                asm.mov(
                    Operand::Reg(Reg::Zcx),
                    Operand::Mem(DATA_BLOCK_REG, slot.offset as i32),
                );
                boilerplate::gen_gchandle_get_target_checked(asm, gchandle_get_target_addr, is_x64);
                let scratch = PARAM_SCRATCH_REGS[next_scratch % PARAM_SCRATCH_REGS.len()];
                next_scratch += 1;
                asm.mov(Operand::Reg(scratch), Operand::Reg(Reg::Zax));
                call_args.push(AsmArg::Register(scratch));
            }
            SlotKind::Value | SlotKind::RawPointer => {
                // Already the exact bytes the real function expects;
                // no translation needed, just forward the slot.
                call_args.push(AsmArg::DataBlockOffset {
                    offset: slot.offset,
                    size: slot.size,
                });
            }
        }
    }

    if let Some(offset) = layout.exception_slot_offset {
        call_args.push(AsmArg::DataBlockOffsetAddr { offset });
    }

    let return_into = layout.ret.as_ref().map(|slot| slot.offset);
    asm.gen_call(raw_addr, &call_args, return_into, raw_calling_convention);

    if let (ReturnKind::Slot(SlotKind::ManagedRef), Some(slot)) = (&signature.ret, &layout.ret) {
        match (
            signature.ret_auto_unbox,
            unbox_addrs,
            layout.auto_unbox_enabled_offset,
            layout.unboxed_flag_offset,
        ) {
            (true, Some(addrs), Some(enabled_offset), Some(flag_offset)) => {
                compile_auto_unbox_return(
                    asm,
                    slot.offset,
                    enabled_offset,
                    flag_offset,
                    gchandle_new_addr,
                    addrs,
                    is_x64,
                );
            }
            _ => {
                asm.mov(
                    Operand::Reg(Reg::Zcx),
                    Operand::Mem(DATA_BLOCK_REG, slot.offset as i32),
                );
                boilerplate::gen_gchandle_new_checked(asm, gchandle_new_addr, is_x64);
                asm.mov(
                    Operand::Mem(DATA_BLOCK_REG, slot.offset as i32),
                    Operand::Reg(Reg::Zax),
                );
            }
        }
    }

    asm.ret();
}

/// The `ManagedRef` return branch for a signature with
/// `ret_auto_unbox` set: if the call-time gating argument disabled
/// auto-unboxing, skip straight to the ordinary checked-gchandle-new
/// path. Otherwise check whether the raw object the real function
/// returned is a boxed value type, and if so, unbox it and
/// store the raw data pointer (full pointer width) in the return slot
/// with the trailing flag byte set to 1; otherwise fall back to the
/// ordinary checked-gchandle-new path with the flag left at 0.
fn compile_auto_unbox_return<A: Assembler + ?Sized>(
    asm: &mut A,
    slot_offset: usize,
    enabled_offset: usize,
    flag_offset: usize,
    gchandle_new_addr: Rptr,
    addrs: UnboxAddrs,
    is_x64: bool,
) {
    let is_boxed = asm.new_label();
    let done = asm.new_label();

    asm.mov(
        Operand::Reg(Reg::Zax),
        Operand::Mem(DATA_BLOCK_REG, enabled_offset as i32),
    );
    asm.jump_if_zero(Reg::Zax, is_boxed);

    asm.mov(
        Operand::Reg(Reg::Zcx),
        Operand::Mem(DATA_BLOCK_REG, slot_offset as i32),
    );
    boilerplate::gen_is_value_type_instance(
        asm,
        addrs.object_get_class_addr,
        addrs.class_is_valuetype_addr,
        is_x64,
    );
    asm.jump_if_zero(Reg::Zax, is_boxed);

    // Value type: unbox in place, store the raw data pointer, set the
    // flag byte, skip the gchandle path entirely.
    asm.mov(
        Operand::Reg(Reg::Zcx),
        Operand::Mem(DATA_BLOCK_REG, slot_offset as i32),
    );
    boilerplate::gen_object_unbox(asm, addrs.object_unbox_addr, is_x64);
    asm.mov(
        Operand::Mem(DATA_BLOCK_REG, slot_offset as i32),
        Operand::Reg(Reg::Zax),
    );
    asm.mov(Operand::Reg(Reg::Zax), Operand::Imm(1));
    asm.mov(
        Operand::Mem(DATA_BLOCK_REG, flag_offset as i32),
        Operand::Reg(Reg::Zax),
    );
    asm.jump(done);

    asm.bind(is_boxed);
    asm.mov(
        Operand::Reg(Reg::Zcx),
        Operand::Mem(DATA_BLOCK_REG, slot_offset as i32),
    );
    boilerplate::gen_gchandle_new_checked(asm, gchandle_new_addr, is_x64);
    asm.mov(
        Operand::Mem(DATA_BLOCK_REG, slot_offset as i32),
        Operand::Reg(Reg::Zax),
    );
    asm.xor(Operand::Reg(Reg::Zax), Operand::Reg(Reg::Zax));
    asm.mov(
        Operand::Mem(DATA_BLOCK_REG, flag_offset as i32),
        Operand::Reg(Reg::Zax),
    );

    asm.bind(done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcentry::ParamSpec;

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
        GenCall {
            addr: Rptr,
            args: Vec<AsmArg>,
            return_into: Option<usize>,
        },
    }

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
            addr: Rptr,
            args: &[AsmArg],
            return_into: Option<usize>,
            _calling_conv: CallingConvention,
        ) {
            self.instrs.push(Instr::GenCall {
                addr,
                args: args.to_vec(),
                return_into,
            });
        }
        fn finalize(self: Box<Self>) -> Vec<u8> {
            Vec::new()
        }
        fn label_offset(&self, _label: usize) -> usize {
            0
        }
    }

    #[test]
    fn plain_value_signature_forwards_slots_with_no_gchandle_translation() {
        let mut asm = RecordingAssembler::new();
        let signature = FuncSignature::new(
            vec![ParamSpec::input(SlotKind::Value)],
            ReturnKind::Slot(SlotKind::Value),
        );
        let layout = WrapperLayout {
            params: vec![SlotLayout { offset: 0, size: 4 }],
            ret: Some(SlotLayout { offset: 8, size: 4 }),
            auto_unbox_enabled_offset: None,
            unboxed_flag_offset: None,
        
            exception_slot_offset: None,
        };

        compile_wrapper(
            &mut asm,
            Rptr(0x1000),
            CallingConvention::Cdecl,
            &signature,
            &layout,
            Rptr(0),
            Rptr(0),
            None,
            true,
        );

        assert!(!asm.instrs.iter().any(|i| matches!(i, Instr::JumpIfZero(..))));
        assert!(matches!(asm.instrs.last(), Some(Instr::Ret)));
        assert!(asm.instrs.iter().any(|i| matches!(
            i,
            Instr::GenCall { return_into: Some(8), .. }
        )));
    }

    #[test]
    fn managed_ref_param_goes_through_checked_get_target() {
        let mut asm = RecordingAssembler::new();
        let signature = FuncSignature::new(
            vec![ParamSpec::input(SlotKind::ManagedRef)],
            ReturnKind::Void,
        );
        let layout = WrapperLayout {
            params: vec![SlotLayout { offset: 0, size: 4 }],
            ret: None,
            auto_unbox_enabled_offset: None,
            unboxed_flag_offset: None,
        
            exception_slot_offset: None,
        };

        compile_wrapper(
            &mut asm,
            Rptr(0x2000),
            CallingConvention::Cdecl,
            &signature,
            &layout,
            Rptr(0x9999),
            Rptr(0),
            None,
            true,
        );

        // gchandle_get_target_checked itself emits exactly one call.
        let calls = asm.instrs.iter().filter(|i| matches!(i, Instr::CallReg(_))).count();
        assert_eq!(calls, 1);
        // The translated raw pointer is moved into a scratch register
        // rather than written back into the (narrower) data-block slot
        // it came from, and forwarded to the real call from there.
        assert!(asm.instrs.contains(&Instr::Mov(
            Operand::Reg(PARAM_SCRATCH_REGS[0]),
            Operand::Reg(Reg::Zax)
        )));
        assert!(!asm.instrs.iter().any(|i| matches!(
            i,
            Instr::Mov(Operand::Mem(DATA_BLOCK_REG, 0), Operand::Reg(Reg::Zax))
        )));
        assert!(asm.instrs.iter().any(|i| matches!(
            i,
            Instr::GenCall { args, .. } if args == &vec![AsmArg::Register(PARAM_SCRATCH_REGS[0])]
        )));
    }

    #[test]
    fn managed_ref_return_goes_through_checked_new() {
        let mut asm = RecordingAssembler::new();
        let signature = FuncSignature::new(Vec::new(), ReturnKind::Slot(SlotKind::ManagedRef));
        let layout = WrapperLayout {
            params: Vec::new(),
            ret: Some(SlotLayout { offset: 0, size: 4 }),
            auto_unbox_enabled_offset: None,
            unboxed_flag_offset: None,
        
            exception_slot_offset: None,
        };

        compile_wrapper(
            &mut asm,
            Rptr(0x3000),
            CallingConvention::Cdecl,
            &signature,
            &layout,
            Rptr(0),
            Rptr(0x8888),
            None,
            true,
        );

        let gen_call_idx = asm
            .instrs
            .iter()
            .position(|i| matches!(i, Instr::GenCall { .. }))
            .unwrap();
        let has_checked_new_after = asm.instrs[gen_call_idx..]
            .iter()
            .filter(|i| matches!(i, Instr::CallReg(_)))
            .count();
        assert_eq!(has_checked_new_after, 1);
    }

    #[test]
    fn auto_unbox_return_checks_value_type_before_choosing_a_path() {
        let mut asm = RecordingAssembler::new();
        let signature = FuncSignature::new(Vec::new(), ReturnKind::Slot(SlotKind::ManagedRef))
            .with_auto_unbox(0);
        let layout = WrapperLayout {
            params: Vec::new(),
            ret: Some(SlotLayout { offset: 0, size: 8 }),
            auto_unbox_enabled_offset: Some(8),
            unboxed_flag_offset: Some(16),
            exception_slot_offset: None,
        };

        compile_wrapper(
            &mut asm,
            Rptr(0x3000),
            CallingConvention::Cdecl,
            &signature,
            &layout,
            Rptr(0),
            Rptr(0x8888),
            Some(UnboxAddrs {
                object_get_class_addr: Rptr(0x7000),
                class_is_valuetype_addr: Rptr(0x7100),
                object_unbox_addr: Rptr(0x6000),
            }),
            true,
        );

        // is_value_type_instance chains two calls; each of the unbox
        // and checked-gchandle-new arms adds exactly one more.
        let calls = asm.instrs.iter().filter(|i| matches!(i, Instr::CallReg(_))).count();
        assert_eq!(calls, 4);
        // One JumpIfZero for the enabled-flag gate, one more inside
        // is_value_type_instance's own check.
        let zero_jumps = asm.instrs.iter().filter(|i| matches!(i, Instr::JumpIfZero(Reg::Zax, _))).count();
        assert_eq!(zero_jumps, 2);
        assert!(asm.instrs.iter().any(|i| matches!(i, Instr::Jump(_))));
        // Both arms write the flag slot.
        let flag_writes = asm
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::Mov(Operand::Mem(DATA_BLOCK_REG, 16), _)))
            .count();
        assert_eq!(flag_writes, 2);
    }

    #[test]
    fn exception_out_passes_slot_address_as_trailing_call_argument() {
        let mut asm = RecordingAssembler::new();
        let signature = FuncSignature::new(
            vec![ParamSpec::input(SlotKind::RawPointer)],
            ReturnKind::Slot(SlotKind::ManagedRef),
        )
        .with_exception_out();
        let layout = WrapperLayout {
            params: vec![SlotLayout { offset: 0, size: 8 }],
            ret: Some(SlotLayout { offset: 8, size: 8 }),
            auto_unbox_enabled_offset: None,
            unboxed_flag_offset: None,
            exception_slot_offset: Some(16),
        };

        compile_wrapper(
            &mut asm,
            Rptr(0x4000),
            CallingConvention::Cdecl,
            &signature,
            &layout,
            Rptr(0),
            Rptr(0x8888),
            None,
            true,
        );

        assert!(asm.instrs.iter().any(|i| matches!(
            i,
            Instr::GenCall { args, .. }
                if args.last() == Some(&AsmArg::DataBlockOffsetAddr { offset: 16 })
        )));
    }
}
