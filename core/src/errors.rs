// Copyright © 2017 Mozilla Foundation
//
// This program is made available under an ISC-style license.  See the
// accompanying file LICENSE for details

//! Error taxonomy for the cross-process Mono invocation engine.
//!
//! Modeled after `audioipc::errors`: an `error_chain!` with `foreign_links`
//! for the handful of standard-library error types the engine can surface.
//! `ErrorKind` covers the taxonomy of failures this engine can surface:
//! marshalling, target I/O, handle lifetime, and remote exceptions.

#![allow(deprecated)]

use crate::handle::ManagedHandle;

error_chain! {
    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// An operation was requested before `Runtime::attach` succeeded, or
        /// after `Runtime::detach` ran.
        NotAttached {
            description("runtime is not attached to a target process")
            display("runtime is not attached to a target process")
        }

        /// Attach itself failed; no partial state is left behind.
        AttachFailed(reason: String) {
            description("attach failed")
            display("attach failed: {}", reason)
        }

        /// The target's loaded Mono does not export the function this call
        /// needs. The rest of the runtime remains usable.
        UnsupportedApi(name: String) {
            description("unsupported Mono API function")
            display("Mono API function `{}` is not supported by the attached target", name)
        }

        /// A local precondition was violated (null handle where required,
        /// arity mismatch on a constructor lookup, etc). Not a bug in the
        /// target.
        InvalidPrecondition(reason: String) {
            description("invalid precondition")
            display("invalid precondition: {}", reason)
        }

        /// The target-side wrapper observed a non-null exception output from
        /// `runtime_invoke` / `property_get_value` / `property_set_value` /
        /// `object_to_string`. The message is fetched lazily by the facade
        /// and the exception object itself remains reachable through the
        /// carried handle.
        RemoteException(exception: ManagedHandle, message: String) {
            description("remote managed exception")
            display("remote managed exception: {}", message)
        }

        /// Backend I/O (memory read/write, remote allocation, code upload,
        /// RPC dispatch) failed.
        BackendFailure(reason: String) {
            description("backend failure")
            display("backend failure: {}", reason)
        }

        /// Code emission (assembler) failed during attach. Any memory
        /// already allocated in the target for the wrapper/boilerplate
        /// regions is released before this error propagates.
        CodeEmission(reason: String) {
            description("code emission failed")
            display("code emission failed: {}", reason)
        }
    }
}
