//! Instruction stream: opcodes, operands, and member references.
//!
//! Method bodies are linear instruction lists. Branch operands address the
//! instruction list by index, so any transform that inserts instructions
//! must rewrite every target at or past the insertion point.

use serde::{Deserialize, Serialize};

/// Reference to a method on some type, by fully qualified declaring type
/// and method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Fully qualified name of the declaring type.
    pub declaring_type: String,
    /// Method name.
    pub name: String,
}

impl MethodRef {
    /// Creates a method reference.
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
        }
    }

    /// `String::length` intrinsic used by generated dispatch code.
    pub fn string_length() -> Self {
        Self::new("System.String", "get_Length")
    }

    /// `String::char_at` intrinsic used by generated dispatch code.
    pub fn string_char_at() -> Self {
        Self::new("System.String", "get_Chars")
    }

    /// `String::is_null_or_empty` intrinsic used by generated dispatch code.
    pub fn string_is_empty() -> Self {
        Self::new("System.String", "IsNullOrEmpty")
    }

    /// `String::equals` intrinsic used by generated dispatch code.
    pub fn string_equals() -> Self {
        Self::new("System.String", "Equals")
    }

    /// Constructor of the policy-violation error raised by patched code.
    pub fn policy_violation_ctor() -> Self {
        Self::new(crate::POLICY_VIOLATION_TYPE, ".ctor")
    }
}

/// Reference to a field, carrying the field's declared type for policy
/// checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Fully qualified name of the declaring type.
    pub declaring_type: String,
    /// Field name.
    pub name: String,
    /// Fully qualified name of the field's declared type.
    pub field_type: String,
}

/// Instruction operand.
///
/// Each instruction carries at most one operand; `Operand::None` is used
/// for pure stack operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand.
    None,
    /// Immediate 32-bit integer (also used for character constants).
    Int(i32),
    /// Immediate string.
    Str(String),
    /// Fully qualified type name (type tokens, box/unbox targets).
    Type(String),
    /// Method reference (calls, function-pointer loads, constructors).
    Method(MethodRef),
    /// Field reference.
    Field(FieldRef),
    /// Local variable index.
    Local(u16),
    /// Argument index.
    Arg(u16),
    /// Branch target: an index into the owning body's instruction list.
    Target(usize),
}

/// Instruction opcode.
///
/// The set is deliberately small: enough for the compiler worker to express
/// script bodies and for the trampoline generator to express string
/// dispatch. Stack effects follow the usual conventions (operands popped,
/// results pushed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Pushes the string operand.
    PushStr,
    /// Pushes the integer operand.
    PushInt,
    /// Pushes a null reference.
    PushNull,
    /// Pushes argument `Arg(n)`.
    LoadArg,
    /// Pushes local `Local(n)`.
    LoadLocal,
    /// Pops into local `Local(n)`.
    StoreLocal,
    /// Pushes the address of local `Local(n)` (by-reference argument passing).
    LoadLocalRef,
    /// Pops index and array, pushes the element reference.
    LoadElem,
    /// Pops value, index, and array, stores the element.
    StoreElem,
    /// Pops a reference, unboxes to the value of type `Type`.
    Unbox,
    /// Pops a value, boxes it as type `Type`.
    Box,
    /// Pops a value and an address, stores the value through the address.
    StoreIndirect,
    /// Direct call to `Method`.
    Call,
    /// Virtual call to `Method`.
    CallVirtual,
    /// Indirect call through a function pointer on the stack.
    CallIndirect,
    /// Pushes a function pointer for `Method`.
    LoadFunction,
    /// Pushes the runtime token for type `Type`.
    LoadToken,
    /// Pops an object, pushes the value of `Field`.
    LoadField,
    /// Pops a value and an object, stores into `Field`.
    StoreField,
    /// Allocates and calls constructor `Method`, pushes the new object.
    NewObject,
    /// Pops two integers, pushes their sum.
    Add,
    /// Pops an error object and raises it.
    Throw,
    /// Returns from the method (popping the return value if any).
    Return,
    /// Unconditional branch to `Target`.
    Jump,
    /// Pops a boolean, branches to `Target` when false.
    JumpIfFalse,
    /// Pops two values, branches to `Target` when unequal.
    JumpIfNotEqual,
    /// Pops two integers, branches to `Target` when first >= second.
    JumpIfGreaterOrEqual,
    /// No operation.
    Nop,
}

/// A single instruction: opcode plus operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    /// Creates an instruction with no operand.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand: Operand::None,
        }
    }

    /// Creates an instruction with an operand.
    pub fn with(opcode: Opcode, operand: Operand) -> Self {
        Self { opcode, operand }
    }

    /// Returns the branch target if this instruction is a branch.
    pub fn branch_target(&self) -> Option<usize> {
        match self.operand {
            Operand::Target(target) => Some(target),
            _ => None,
        }
    }

    /// Rewrites the branch target. No-op for non-branch instructions.
    pub fn set_branch_target(&mut self, target: usize) {
        if let Operand::Target(existing) = &mut self.operand {
            *existing = target;
        }
    }

    /// True when this opcode transfers control to an operand target.
    pub fn is_branch(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Jump
                | Opcode::JumpIfFalse
                | Opcode::JumpIfNotEqual
                | Opcode::JumpIfGreaterOrEqual
        )
    }
}
