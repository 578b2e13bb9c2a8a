// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Cross-process Mono embedding-API invocation engine.
//!
//! This crate is the backend-agnostic core: given an injected
//! [`backend::Backend`], it resolves Mono API functions in
//! a remote process, synthesises marshalling wrappers for the ones that
//! need argument/return translation, and serialises every target-side
//! call onto a single worker thread. [`runtime::Runtime`] is
//! the object that ties all of this together; `rmono-facade` builds an
//! ergonomic, method-per-API surface on top of it.
//!
//! Grounded on `audioipc`'s crate split: this crate plays the role of
//! `audioipc` itself (protocol/transport machinery with the platform
//! specifics injected), with `rmono-facade` playing the role the
//! `client` crate plays there.

#![warn(unused_extern_crates)]

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

pub mod abi;
pub mod asm;
pub mod backend;
pub mod config;
pub mod core_thread;
pub mod dispatch;
#[allow(deprecated)]
pub mod errors;
pub mod funcentry;
pub mod handle;
pub mod ipcvec;
pub mod runtime;
pub mod types;
pub mod variant;
pub mod variant_array;

#[cfg(feature = "test-support")]
pub mod testsupport;

pub use crate::config::Config;
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::runtime::Runtime;
pub use crate::types::{CallingConvention, Gchandle, ProcessorArch, Protection, Rptr};
pub use crate::variant::{Direction, Variant};
pub use crate::variant_array::VariantArray;
