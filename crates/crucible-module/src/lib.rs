//! Compiled-module object model.
//!
//! This crate defines the structured form of a compiled script module: the
//! type/method tree, method bodies as linear instruction streams, and the
//! byte-image encoding exchanged with the external compiler worker. The
//! sandbox patcher and trampoline generator operate on this model and
//! re-serialize it before hand-off to the host's module loader.
//!
//! The instruction set is **data, not behavior**: instructions carry an
//! opcode and at most one operand, and their semantics live in whatever
//! consumes the module (the host's execution engine is out of scope here).

pub mod error;
pub mod image;
pub mod inst;

pub use error::{ImageError, Result};
pub use image::{LocalVar, MethodBody, MethodDef, ModuleImage, ParamDef, TypeDef};
pub use inst::{FieldRef, Instruction, MethodRef, Opcode, Operand};

/// Namespace that compiled script entry types are declared in.
///
/// The compiler worker places every script's entry type here; types found
/// in this namespace that do not correspond to a submitted script are
/// reported as namespace pollution by the patcher.
pub const SCRIPT_NAMESPACE: &str = "Crucible.Scripts";

/// Fully qualified name of the error type raised by patched code when a
/// denied capability is reached.
pub const POLICY_VIOLATION_TYPE: &str = "Crucible.Runtime.PolicyViolationError";

/// Name of the synthesized direct-dispatch method emitted into each
/// accepted entry type.
pub const DISPATCH_METHOD: &str = "DirectDispatch";
