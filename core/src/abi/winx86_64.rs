// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Windows/x86_64 ABI: 64-bit pointers, Microsoft x64 calling
//! convention (modelled here as cdecl — the engine only needs to
//! distinguish cdecl/stdcall/fastcall at the `Backend::assembler()`
//! boundary, and Win64 has a single unified convention).

use super::{Abi, AbiKind};

#[derive(Copy, Clone, Debug)]
#[allow(non_camel_case_types)]
pub struct WinX86_64;

impl Abi for WinX86_64 {
    const KIND: AbiKind = AbiKind::WinX86_64;
    const PTR_WIDTH: usize = 8;
    type Internal = u64;
}
