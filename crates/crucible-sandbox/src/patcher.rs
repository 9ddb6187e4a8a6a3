//! Whole-module sandbox patching.
//!
//! Single pass, depth-first over types (including nested types), then over
//! each type's methods. Method bodies that reach a denylisted capability
//! are rewritten to raise a policy violation before the denied action can
//! run; accepted entry types additionally receive a generated dispatch
//! method. The transformed module is re-serialized atomically.

use tracing::warn;

use crucible_module::{
    Instruction, MethodBody, MethodDef, MethodRef, ModuleImage, Opcode, Operand, SCRIPT_NAMESPACE,
    TypeDef,
};

use crate::error::Result;
use crate::policy::SecurityPolicy;
use crate::trampoline;

/// Per-unit compile error recorded during patching (does not abort the
/// module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
    /// Constituent unit name the error belongs to.
    pub unit: String,
    pub message: String,
}

/// Result of a successful patch.
#[derive(Debug)]
pub struct PatchOutcome {
    /// The transformed module.
    pub image: ModuleImage,
    /// Re-serialized byte image of [`PatchOutcome::image`].
    pub bytes: Vec<u8>,
    /// Entry-type errors attributed to specific units.
    pub unit_errors: Vec<UnitError>,
    /// Namespace pollution and skipped-dispatch warnings.
    pub warnings: Vec<String>,
}

/// Applies the security policy and trampoline generation to one module.
pub struct Patcher<'a> {
    policy: &'a SecurityPolicy,
    /// Names of the units compiled into the module; used to recognize
    /// entry types and attribute errors.
    unit_names: &'a [String],
}

impl<'a> Patcher<'a> {
    pub fn new(policy: &'a SecurityPolicy, unit_names: &'a [String]) -> Self {
        Self { policy, unit_names }
    }

    /// Patches a raw module byte image.
    ///
    /// # Errors
    ///
    /// Any decode, generation, or re-serialization failure aborts the
    /// whole module; no partial output is returned.
    pub fn patch(&self, raw: &[u8]) -> Result<PatchOutcome> {
        let mut image = ModuleImage::from_bytes(raw)?;
        let mut unit_errors = Vec::new();
        let mut warnings = Vec::new();

        for ty in &mut image.types {
            self.patch_type(ty);
        }
        // Entry-type recognition only applies to top-level types; nested
        // types were already patched by the recursive walk.
        for ty in &mut image.types {
            self.visit_top_level(ty, &mut unit_errors, &mut warnings)?;
        }

        let bytes = image.to_bytes()?;
        Ok(PatchOutcome {
            image,
            bytes,
            unit_errors,
            warnings,
        })
    }

    fn patch_type(&self, ty: &mut TypeDef) {
        for method in &mut ty.methods {
            self.patch_method(method);
        }
        for nested in &mut ty.nested {
            self.patch_type(nested);
        }
    }

    fn visit_top_level(
        &self,
        ty: &mut TypeDef,
        unit_errors: &mut Vec<UnitError>,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        if ty.compiler_generated || ty.name == "<Module>" {
            return Ok(());
        }
        if ty.namespace == SCRIPT_NAMESPACE {
            if self.unit_names.iter().any(|name| *name == ty.name) {
                self.patch_entry_type(ty, unit_errors, warnings)?;
            } else {
                warnings.push(format!(
                    "namespace pollution: {} is not among the compiled scripts",
                    ty.full_name()
                ));
            }
        } else {
            warnings.push(format!(
                "namespace pollution: {} declared outside {}",
                ty.full_name(),
                SCRIPT_NAMESPACE
            ));
        }
        Ok(())
    }

    fn patch_entry_type(
        &self,
        ty: &mut TypeDef,
        unit_errors: &mut Vec<UnitError>,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let hidden_ctor = ty.methods.iter().any(|m| {
            m.is_constructor && !m.is_static && m.params.is_empty() && !m.is_public
        });
        if hidden_ctor {
            unit_errors.push(UnitError {
                unit: ty.name.clone(),
                message: "explicit constructor not allowed: constructor must be public"
                    .to_string(),
            });
            return Ok(());
        }
        let generated = trampoline::generate(ty)?;
        for skipped in generated.skipped {
            warn!(entry = %ty.full_name(), "{skipped}");
            warnings.push(skipped);
        }
        ty.methods.push(generated.method);
        Ok(())
    }

    fn patch_method(&self, method: &mut MethodDef) {
        let Some(body) = method.body.as_mut() else {
            if method.native_import.take().is_some() {
                method.body = Some(throw_body(
                    "native interop is restricted".to_string(),
                ));
            }
            return;
        };

        // Fail closed at declaration granularity: a denied local type
        // condemns the whole body.
        if let Some(local) = body
            .locals
            .iter()
            .find(|local| self.policy.is_denied(&local.ty))
        {
            let message = denial_message(&local.ty);
            *body = throw_body(message);
            return;
        }

        let offending = body.instructions.iter().position(|inst| {
            self.instruction_denied(inst).is_some()
        });
        if let Some(index) = offending {
            // Position matched above, so the name lookup repeats cheaply.
            if let Some(name) = self.instruction_denied(&body.instructions[index]) {
                splice_throw(body, index, &name);
            }
        }
    }

    /// Returns the offending fully qualified name if the instruction uses
    /// a denied capability.
    fn instruction_denied(&self, inst: &Instruction) -> Option<String> {
        match (inst.opcode, &inst.operand) {
            (Opcode::LoadToken, Operand::Type(name)) => {
                self.policy.is_denied(name).then(|| name.clone())
            }
            (
                Opcode::Call | Opcode::CallVirtual | Opcode::CallIndirect | Opcode::LoadFunction,
                Operand::Method(target),
            ) => self
                .policy
                .is_denied(&target.declaring_type)
                .then(|| target.declaring_type.clone()),
            (Opcode::LoadField, Operand::Field(field)) => self
                .policy
                .is_denied(&field.field_type)
                .then(|| field.field_type.clone()),
            _ => None,
        }
    }
}

fn denial_message(name: &str) -> String {
    format!("access is restricted, you are not allowed to use {name}")
}

/// Body that unconditionally raises a policy violation.
fn throw_body(message: String) -> MethodBody {
    MethodBody {
        locals: Vec::new(),
        instructions: throw_sequence(message),
    }
}

fn throw_sequence(message: String) -> Vec<Instruction> {
    vec![
        Instruction::with(Opcode::PushStr, Operand::Str(message)),
        Instruction::with(
            Opcode::NewObject,
            Operand::Method(MethodRef::policy_violation_ctor()),
        ),
        Instruction::new(Opcode::Throw),
    ]
}

/// Splices the three-instruction throw sequence immediately before the
/// offending instruction at `index`, then rewrites every branch target
/// past the insertion point.
///
/// A branch that targeted the offending instruction now lands on the
/// spliced message push, so reaching that point still raises the
/// violation before the denied action.
fn splice_throw(body: &mut MethodBody, index: usize, offending: &str) {
    let spliced = throw_sequence(denial_message(offending));
    let count = spliced.len();
    for (offset, inst) in spliced.into_iter().enumerate() {
        body.instructions.insert(index + offset, inst);
    }
    for inst in &mut body.instructions {
        if let Some(target) = inst.branch_target()
            && target > index
        {
            inst.set_branch_target(target + count);
        }
    }
}
