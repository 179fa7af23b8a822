#![doc = include_str!("../README.md")]

pub mod key;
pub mod multi;
pub mod name;
mod node;
pub mod qsbr;
mod trie;

pub use key::{QpKey, QPKEY_MAX};
pub use multi::{QpMulti, QpRead, QpSnap, UpdateTx, WriteTx};
pub use name::{DnsName, NameError};
pub use trie::{CompactMode, LeafMethods, Qp, QpMemUsage, QpTimers};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("compilation is only possible for 64-bit targets");

/// The caller-visible failure modes. Anything else the trie can run into is
/// an invariant violation and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QpError {
    /// Insert found the key already present.
    #[error("the key is already present")]
    Exists,
    /// Delete or lookup found no leaf with the key.
    #[error("the key is not present")]
    NotFound,
}
