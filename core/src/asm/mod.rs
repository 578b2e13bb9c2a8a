// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Target-side code generation.
//!
//! `boilerplate` holds the handful of helper routines every attach
//! uploads once; `funcentry` (not yet present) will hold the
//! per-API-function wrapper generator. Both are expressed purely in
//! terms of the [`crate::backend::Assembler`] trait: the actual
//! instruction encoding is the injected backend's job, this
//! crate only decides *which* instructions to emit and in what order.

pub mod boilerplate;
pub mod funcwrap;
pub mod ipcvec;
