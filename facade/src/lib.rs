// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Ergonomic, method-per-API surface over `rmono-core`.
//!
//! Grounded on `audioipc-client`'s relationship to `audioipc`: the core
//! crate carries the wire-level machinery (here: ABI selection, wrapper
//! codegen, dispatch, the handle system), this crate wraps it in a
//! convenience API a caller actually wants to hold onto — one method
//! per wrapped Mono function, plus a small fluent class/field/method
//! lookup layer for callers that would rather chain off a resolved
//! class than juggle raw pointers themselves.

#[macro_use]
extern crate log;

pub mod facade;
pub mod helper;

pub use crate::facade::{Facade, StaticFieldShape};
pub use rmono_core::errors::{Error, ErrorKind, Result};
