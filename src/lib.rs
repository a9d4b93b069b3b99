/*!
Session coordination and round lifecycle for anonymous-broadcast overlays.

A fixed set of servers and a dynamic set of clients agree on a synchronized
epoch, build an authenticated roster for it, and drive one anonymous-broadcast
round to completion, repeating indefinitely. Every participant runs a
message-driven state machine ([`machine`]); each transition is authenticated
with asymmetric cryptography ([`wire`]); the broadcast protocol itself is a
pluggable collaborator ([`round`]).

The overlay transport, the clock, and the concrete cryptographic algorithms
are supplied by the embedder ([`overlay`], [`session::SessionParameters`]);
nothing in this crate performs I/O or reads the wall clock on its own, which
is what makes the protocol testable under virtual time (see [`dev`]).
*/
#![no_std]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    clippy::mod_module_files,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(any(test, feature = "dev"))]
#[cfg_attr(docsrs, doc(cfg(feature = "dev")))]
pub mod dev;
pub mod errors;
pub mod identity;
pub mod machine;
pub mod overlay;
pub mod round;
pub mod session;
pub mod wire;

pub use signature;
