//! Sandbox patching and direct-call trampoline generation.
//!
//! Takes the raw module produced by the compiler worker and returns a
//! transformed module in which every reachable use of a denylisted
//! capability raises a policy violation before the original action runs,
//! and in which each accepted entry type carries a synthesized
//! direct-dispatch method that routes hook names to methods without
//! reflection.
//!
//! The patch is atomic: any failure while transforming or re-serializing
//! aborts the whole module and no partial output is handed to the loader.

pub mod error;
pub mod patcher;
pub mod policy;
pub mod trampoline;
pub mod trie;

pub use error::{Result, SandboxError};
pub use patcher::{PatchOutcome, Patcher, UnitError};
pub use policy::SecurityPolicy;
pub use trie::{DispatchTrie, NodeId, TrieNode};
