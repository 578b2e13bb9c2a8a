// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Windows/x86 ABI: 32-bit pointers, cdecl calling convention for the
//! exported Mono API, stdcall for a handful of internal Windows
//! callbacks the boilerplate helpers bind to. Grounded on
//! `RMonoABIWinX32.h`.

use super::{Abi, AbiKind};

#[derive(Copy, Clone, Debug)]
pub struct WinX86;

impl Abi for WinX86 {
    const KIND: AbiKind = AbiKind::WinX86;
    const PTR_WIDTH: usize = 4;
    type Internal = u32;
}
