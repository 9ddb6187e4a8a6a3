//! Module image: the type/method tree of a compiled script module.

use serde::{Deserialize, Serialize};

use crate::error::{ImageError, Result};
use crate::inst::Instruction;

/// A compiled module as produced by the compiler worker and consumed by the
/// sandbox patcher.
///
/// The byte image exchanged over the worker protocol is the serialized form
/// of this structure; [`ModuleImage::from_bytes`] and
/// [`ModuleImage::to_bytes`] convert between the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    /// Output name assigned by the job that produced this module.
    pub name: String,
    /// Top-level types. Nested types hang off their declaring type.
    pub types: Vec<TypeDef>,
}

impl ModuleImage {
    /// Decodes a module image from its byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(ImageError::Decode)
    }

    /// Encodes this module to its byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(ImageError::Encode)
    }
}

/// A type declaration within a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Simple type name.
    pub name: String,
    /// Declaring namespace. Empty for the module pseudo-type.
    pub namespace: String,
    /// Set by the compiler for synthesized types (closures, iterators).
    #[serde(default)]
    pub compiler_generated: bool,
    /// Methods declared directly on this type.
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    /// Nested type declarations.
    #[serde(default)]
    pub nested: Vec<TypeDef>,
}

impl TypeDef {
    /// Creates an empty type in the given namespace.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            compiler_generated: false,
            methods: Vec::new(),
            nested: Vec::new(),
        }
    }

    /// Fully qualified name (`namespace.name`, or just `name` when the
    /// namespace is empty).
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }
}

/// A method declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    /// Method name. Compiler-mangled helpers contain `<` and are never
    /// dispatch candidates.
    pub name: String,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_constructor: bool,
    /// Property accessor (getter or setter).
    #[serde(default)]
    pub is_accessor: bool,
    /// Declares generic parameters.
    #[serde(default)]
    pub is_generic: bool,
    /// Carries the host's hook attribute; public hook methods are dispatch
    /// candidates alongside private methods.
    #[serde(default)]
    pub hook_tagged: bool,
    /// Native-interop entry point, for bodyless declarations binding to
    /// external code.
    #[serde(default)]
    pub native_import: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamDef>,
    /// Fully qualified return type; `System.Void` for none.
    pub return_type: String,
    /// Absent for abstract/native declarations.
    #[serde(default)]
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// True when the method returns no value.
    pub fn returns_void(&self) -> bool {
        self.return_type == "System.Void"
    }
}

/// A method parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    /// Fully qualified parameter type (the element type for by-ref
    /// parameters).
    pub ty: String,
    /// Passed by reference; the trampoline copies such arguments through a
    /// local and writes them back after the call.
    #[serde(default)]
    pub by_ref: bool,
}

/// A local variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVar {
    pub name: String,
    /// Fully qualified declared type.
    pub ty: String,
}

/// A method body: declared locals plus a linear instruction stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MethodBody {
    #[serde(default)]
    pub locals: Vec<LocalVar>,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

impl MethodBody {
    /// Validates that every branch lands inside the instruction list.
    pub fn check_branch_targets(&self) -> Result<()> {
        let len = self.instructions.len();
        for inst in &self.instructions {
            if let Some(target) = inst.branch_target()
                && target >= len
            {
                return Err(ImageError::BranchOutOfRange { target, len });
            }
        }
        Ok(())
    }
}
