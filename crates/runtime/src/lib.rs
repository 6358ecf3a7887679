//! Glas Runtime: the client API over the glas heap substrate.
//!
//! A host program creates a [`Glas`] context and drives it: push and pop
//! binaries, bitstrings, and integers; build and take apart pairs, lists,
//! and dicts; define names and registers; and commit yield-to-yield steps
//! under optimistic concurrency control.
//!
//! Key design principles:
//! - Values are immutable, structurally shared trees of 32-byte cells
//! - A step either commits (publishing register writes atomically) or
//!   aborts back to its checkpoint; errors are divergence and cannot be
//!   committed
//! - Contexts fork for concurrency; register conflicts are detected
//!   optimistically at commit
//!
//! # Modules
//!
//! - `context`: the `Glas` handle, stacks, and data shuffling
//! - `ops`: data transfer and structural operations
//! - `step`: checkpoint/abort/commit, forks, choices
//! - `registers`: registers, volumes, queue views
//! - `namespace`: definitions and callback programs
//! - `value`/`list`/`dict`/`bits`: the tree rewrites underneath
//! - `postop`: post-commit action queues
//! - `config`: GLAS_CONF handling
//! - `diagnostics`: stderr statistics dump

pub mod bits;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod dict;
pub mod error;
pub mod list;
pub mod namespace;
pub mod ops;
pub mod postop;
pub mod registers;
pub mod step;
pub mod thunk;
pub mod value;

pub use context::{Glas, KillHandle};
pub use error::{
    E_ASSERT, E_ATOMIC_CB, E_CLIENT1, E_CLIENT2, E_CLIENT3, E_CLIENT4, E_CONFLICT, E_DATA_SEAL,
    E_DATA_TYPE, E_DEAD_BRANCH, E_EPHEMERALITY, E_ERROR_OP, E_LINEARITY, E_NAME_SHADOW,
    E_NAME_TYPE, E_NAME_UNDEF, E_QUOTA, E_SIGKILL, E_UNDERFLOW,
};
pub use namespace::ProgCb;
pub use ops::{GlasInt, ZcRead};

// Re-export the substrate for hosts that embed deeper.
pub use glas_core as core;

/// Install the file loader hook. The loader itself (parsing, module
/// search) lives outside the runtime; this only wires the callback.
pub fn vfs_intercept(cb: glas_core::rt::VfsCallback) {
    glas_core::rt::rt().vfs_intercept(cb);
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::context::Glas;

    /// Run `f` with a fresh context. Unit tests that build raw cells must
    /// do so inside a busy window of this context.
    pub fn with_ctx<R>(f: impl FnOnce(&mut Glas) -> R) -> R {
        let mut g = Glas::new();
        f(&mut g)
    }
}
