//! Direct-call trampoline generation.
//!
//! For each accepted entry type the generator synthesizes one method,
//! `DirectDispatch(name, out result, args) -> bool`, that routes a hook
//! name to the matching declared method using character comparisons over a
//! [`DispatchTrie`](crate::trie::DispatchTrie). Generation happens once per
//! compiled type; dispatch afterwards costs O(key length) comparisons with
//! no reflective lookup and no per-call allocation.
//!
//! Code is emitted in two passes: pass one appends symbolic instructions
//! with placeholder branch targets while recording, per trie node, the
//! index of its first instruction; pass two rewrites every placeholder to
//! its resolved index.

use indexmap::IndexMap;

use crucible_module::{
    DISPATCH_METHOD, Instruction, LocalVar, MethodBody, MethodDef, MethodRef, Opcode, Operand,
    ParamDef, TypeDef,
};

use crate::error::{Result, SandboxError};
use crate::trie::{DispatchTrie, NodeId};

/// Placeholder branch target used during pass one.
const PENDING: usize = usize::MAX;

/// Local slot holding the input name's length.
const LOCAL_NAME_LEN: u16 = 0;
/// Local slot holding the current character position.
const LOCAL_POS: u16 = 1;

/// Argument slots of the generated method (0 is the receiver).
const ARG_NAME: u16 = 1;
const ARG_RESULT: u16 = 2;
const ARG_ARGS: u16 = 3;

/// Result of generating a dispatch method for one entry type.
#[derive(Debug)]
pub struct GeneratedDispatch {
    /// The synthesized method, ready to be appended to the type.
    pub method: MethodDef,
    /// Candidates skipped because their signature cannot be expressed;
    /// the host invokes these reflectively instead.
    pub skipped: Vec<String>,
}

/// Builds the dispatch method for `ty`.
///
/// Eligible methods are instance methods declared directly on the type
/// that are private or hook-tagged, non-generic, and not property
/// accessors. The dispatch key is the method name; when several eligible
/// methods share a name, each key gains a parenthesized parameter-type
/// suffix to disambiguate the overloads.
pub fn generate(ty: &TypeDef) -> Result<GeneratedDispatch> {
    let candidates: Vec<&MethodDef> = ty
        .methods
        .iter()
        .filter(|m| is_dispatch_candidate(m))
        .collect();

    // Overload detection runs over the survivors of the signature check:
    // a method whose only same-named sibling was rejected keeps its bare
    // name as the key.
    let mut skipped = Vec::new();
    let mut survivors: Vec<&MethodDef> = Vec::new();
    for &method in &candidates {
        match check_signature(ty, method) {
            Ok(()) => survivors.push(method),
            Err(err) => skipped.push(err.to_string()),
        }
    }

    let mut keys: IndexMap<String, &MethodDef> = IndexMap::new();
    for &method in &survivors {
        keys.entry(dispatch_key(method, &survivors)).or_insert(method);
    }

    let mut trie = DispatchTrie::new();
    for key in keys.keys() {
        trie.insert(key);
    }

    let mut emitter = Emitter::new(&trie, &keys, ty.full_name());
    emitter.emit_prologue();
    let root_edges: Vec<NodeId> = trie.node(trie.root()).edges.values().copied().collect();
    for (sibling, node) in root_edges.into_iter().enumerate() {
        emitter.emit_node(node, sibling);
    }
    let body = emitter.finish();
    body.check_branch_targets()?;

    Ok(GeneratedDispatch {
        method: MethodDef {
            name: DISPATCH_METHOD.to_string(),
            is_static: false,
            is_public: true,
            is_constructor: false,
            is_accessor: false,
            is_generic: false,
            hook_tagged: false,
            native_import: None,
            params: vec![
                ParamDef {
                    name: "name".to_string(),
                    ty: "System.String".to_string(),
                    by_ref: false,
                },
                ParamDef {
                    name: "result".to_string(),
                    ty: "System.Object".to_string(),
                    by_ref: true,
                },
                ParamDef {
                    name: "args".to_string(),
                    ty: "System.Object[]".to_string(),
                    by_ref: false,
                },
            ],
            return_type: "System.Boolean".to_string(),
            body: Some(body),
        },
        skipped,
    })
}

/// Eligibility filter for dispatch candidates.
fn is_dispatch_candidate(method: &MethodDef) -> bool {
    !method.is_static
        && (!method.is_public || method.hook_tagged)
        && !method.is_generic
        && !method.is_accessor
        && !method.is_constructor
        && method.body.is_some()
        && !method.name.contains('<')
}

/// Rejects signatures the trampoline cannot express.
fn check_signature(ty: &TypeDef, method: &MethodDef) -> Result<()> {
    for param in &method.params {
        if param.ty.ends_with('*') {
            return Err(SandboxError::DispatchUnsupported {
                type_name: ty.full_name(),
                method: method.name.clone(),
                reason: format!("pointer typed parameter '{}'", param.name),
            });
        }
    }
    Ok(())
}

/// Computes the dispatch key for a method, adding the overload suffix only
/// when another candidate shares the name.
fn dispatch_key(method: &MethodDef, candidates: &[&MethodDef]) -> String {
    let overloaded = candidates
        .iter()
        .filter(|m| m.name == method.name)
        .count()
        > 1;
    if !overloaded {
        return method.name.clone();
    }
    let params: Vec<String> = method
        .params
        .iter()
        .map(|p| {
            if p.by_ref {
                format!("{}&", p.ty)
            } else {
                p.ty.clone()
            }
        })
        .collect();
    format!("{}({})", method.name, params.join(", "))
}

/// Pass-one instruction builder with pending-target bookkeeping.
struct Emitter<'a> {
    trie: &'a DispatchTrie,
    keys: &'a IndexMap<String, &'a MethodDef>,
    self_type: String,
    instructions: Vec<Instruction>,
    locals: Vec<LocalVar>,
    /// First-instruction index per trie node, filled as nodes are emitted.
    node_entry: Vec<usize>,
    /// Placeholder branches waiting on a sibling node's entry index.
    edge_jumps: Vec<(usize, NodeId)>,
    /// Placeholder branches to the shared not-found epilogue.
    end_jumps: Vec<usize>,
}

impl<'a> Emitter<'a> {
    fn new(
        trie: &'a DispatchTrie,
        keys: &'a IndexMap<String, &'a MethodDef>,
        self_type: String,
    ) -> Self {
        Self {
            trie,
            keys,
            self_type,
            instructions: Vec::new(),
            locals: vec![
                LocalVar {
                    name: "name_len".to_string(),
                    ty: "System.Int32".to_string(),
                },
                LocalVar {
                    name: "pos".to_string(),
                    ty: "System.Int32".to_string(),
                },
            ],
            node_entry: vec![PENDING; trie.len()],
            edge_jumps: Vec::new(),
            end_jumps: Vec::new(),
        }
    }

    fn push(&mut self, opcode: Opcode, operand: Operand) -> usize {
        let index = self.instructions.len();
        self.instructions.push(Instruction::with(opcode, operand));
        index
    }

    fn add_local(&mut self, ty: &str) -> u16 {
        let index = self.locals.len() as u16;
        self.locals.push(LocalVar {
            name: format!("ref{index}"),
            ty: ty.to_string(),
        });
        index
    }

    /// Clears the out parameter, rejects empty names, and caches the
    /// name's length with the position set to zero.
    fn emit_prologue(&mut self) {
        self.push(Opcode::LoadArg, Operand::Arg(ARG_RESULT));
        self.push(Opcode::PushNull, Operand::None);
        self.push(Opcode::StoreIndirect, Operand::None);

        self.push(Opcode::LoadArg, Operand::Arg(ARG_NAME));
        self.push(
            Opcode::Call,
            Operand::Method(MethodRef::string_is_empty()),
        );
        let guard = self.push(Opcode::JumpIfFalse, Operand::Target(PENDING));
        self.emit_return(false);
        let after = self.instructions.len();
        self.instructions[guard].set_branch_target(after);

        self.push(Opcode::LoadArg, Operand::Arg(ARG_NAME));
        self.push(
            Opcode::CallVirtual,
            Operand::Method(MethodRef::string_length()),
        );
        self.push(Opcode::StoreLocal, Operand::Local(LOCAL_NAME_LEN));
        self.push(Opcode::PushInt, Operand::Int(0));
        self.push(Opcode::StoreLocal, Operand::Local(LOCAL_POS));
    }

    /// Emits the comparison for one trie node and recurses into its
    /// children. `sibling` is the node's position among its parent's
    /// edges; the first sibling at each depth also owns the bounds check.
    fn emit_node(&mut self, id: NodeId, sibling: usize) {
        let node = self.trie.node(id);
        let ch = node.ch;
        let key = node.key.clone();
        let children: Vec<NodeId> = node.edges.values().copied().collect();
        let next_sibling = node.parent.and_then(|parent| {
            self.trie
                .node(parent)
                .edges
                .get_index(sibling + 1)
                .map(|(_, next)| *next)
        });

        if sibling == 0 {
            let entry = self.push(Opcode::LoadLocal, Operand::Local(LOCAL_POS));
            self.push(Opcode::LoadLocal, Operand::Local(LOCAL_NAME_LEN));
            let jump = self.push(Opcode::JumpIfGreaterOrEqual, Operand::Target(PENDING));
            self.end_jumps.push(jump);
            self.node_entry[id.index()] = entry;
            self.push(Opcode::LoadArg, Operand::Arg(ARG_NAME));
        } else {
            let entry = self.push(Opcode::LoadArg, Operand::Arg(ARG_NAME));
            self.node_entry[id.index()] = entry;
        }
        self.push(Opcode::LoadLocal, Operand::Local(LOCAL_POS));
        self.push(
            Opcode::CallVirtual,
            Operand::Method(MethodRef::string_char_at()),
        );
        self.push(Opcode::PushInt, Operand::Int(ch as i32));
        let mismatch = self.push(Opcode::JumpIfNotEqual, Operand::Target(PENDING));
        match next_sibling {
            Some(next) => self.edge_jumps.push((mismatch, next)),
            None => self.end_jumps.push(mismatch),
        }

        // A keyless single-edge chain ending in a leaf collapses to one
        // full-string comparison instead of per-character steps.
        if children.len() == 1 && key.is_none() {
            let mut walk = self.trie.node(children[0]);
            while walk.edges.len() == 1 && walk.key.is_none() {
                let next = *walk.edges.values().next().unwrap_or(&NodeId::new(0));
                walk = self.trie.node(next);
            }
            if walk.edges.is_empty()
                && let Some(full_key) = walk.key.clone()
            {
                self.push(Opcode::LoadArg, Operand::Arg(ARG_NAME));
                self.push(Opcode::PushStr, Operand::Str(full_key.clone()));
                self.push(
                    Opcode::CallVirtual,
                    Operand::Method(MethodRef::string_equals()),
                );
                let jump = self.push(Opcode::JumpIfFalse, Operand::Target(PENDING));
                self.end_jumps.push(jump);
                self.emit_call(&full_key);
                self.emit_return(true);
                return;
            }
        }

        self.push(Opcode::LoadLocal, Operand::Local(LOCAL_POS));
        self.push(Opcode::PushInt, Operand::Int(1));
        self.push(Opcode::Add, Operand::None);
        self.push(Opcode::StoreLocal, Operand::Local(LOCAL_POS));

        if let Some(terminal_key) = key {
            // One key is a prefix of another: take the terminal path only
            // when the whole input has been consumed.
            self.push(Opcode::LoadLocal, Operand::Local(LOCAL_POS));
            self.push(Opcode::LoadLocal, Operand::Local(LOCAL_NAME_LEN));
            let jump = self.push(Opcode::JumpIfNotEqual, Operand::Target(PENDING));
            match children.first() {
                Some(&first_child) => self.edge_jumps.push((jump, first_child)),
                None => self.end_jumps.push(jump),
            }
            self.emit_call(&terminal_key);
            self.emit_return(true);
        }

        for (index, child) in children.into_iter().enumerate() {
            self.emit_node(child, index);
        }
    }

    /// Emits the call to the method behind `key`, including by-ref
    /// copy-in/copy-out and boxing of the return value.
    fn emit_call(&mut self, key: &str) {
        let Some(&method) = self.keys.get(key) else {
            // Trie keys are drawn from the key map; a miss is unreachable.
            return;
        };

        let mut ref_locals: Vec<Option<u16>> = vec![None; method.params.len()];
        for (index, param) in method.params.iter().enumerate() {
            if param.by_ref {
                let local = self.add_local(&param.ty);
                self.push(Opcode::LoadArg, Operand::Arg(ARG_ARGS));
                self.push(Opcode::PushInt, Operand::Int(index as i32));
                self.push(Opcode::LoadElem, Operand::None);
                self.push(Opcode::Unbox, Operand::Type(param.ty.clone()));
                self.push(Opcode::StoreLocal, Operand::Local(local));
                ref_locals[index] = Some(local);
            }
        }

        if !method.returns_void() {
            self.push(Opcode::LoadArg, Operand::Arg(ARG_RESULT));
        }
        self.push(Opcode::LoadArg, Operand::Arg(0));
        for (index, param) in method.params.iter().enumerate() {
            match ref_locals[index] {
                Some(local) => {
                    self.push(Opcode::LoadLocalRef, Operand::Local(local));
                }
                None => {
                    self.push(Opcode::LoadArg, Operand::Arg(ARG_ARGS));
                    self.push(Opcode::PushInt, Operand::Int(index as i32));
                    self.push(Opcode::LoadElem, Operand::None);
                    self.push(Opcode::Unbox, Operand::Type(param.ty.clone()));
                }
            }
        }
        self.push(
            Opcode::Call,
            Operand::Method(MethodRef::new(self.self_type.clone(), method.name.clone())),
        );

        for (index, param) in method.params.iter().enumerate() {
            if let Some(local) = ref_locals[index] {
                self.push(Opcode::LoadArg, Operand::Arg(ARG_ARGS));
                self.push(Opcode::PushInt, Operand::Int(index as i32));
                self.push(Opcode::LoadLocal, Operand::Local(local));
                self.push(Opcode::Box, Operand::Type(param.ty.clone()));
                self.push(Opcode::StoreElem, Operand::None);
            }
        }

        if !method.returns_void() {
            if method.return_type != "System.Object" {
                self.push(Opcode::Box, Operand::Type(method.return_type.clone()));
            }
            self.push(Opcode::StoreIndirect, Operand::None);
        }
    }

    fn emit_return(&mut self, value: bool) -> usize {
        let index = self.push(Opcode::PushInt, Operand::Int(if value { 1 } else { 0 }));
        self.push(Opcode::Return, Operand::None);
        index
    }

    /// Emits the shared not-found epilogue and backfills every pending
    /// branch target from the node arena.
    fn finish(mut self) -> MethodBody {
        let end = self.emit_return(false);
        for (index, node) in self.edge_jumps {
            let target = self.node_entry[node.index()];
            self.instructions[index].set_branch_target(target);
        }
        for index in self.end_jumps {
            self.instructions[index].set_branch_target(end);
        }
        MethodBody {
            locals: self.locals,
            instructions: self.instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(name: &str, params: Vec<ParamDef>, return_type: &str) -> MethodDef {
        MethodDef {
            name: name.to_string(),
            is_static: false,
            is_public: false,
            is_constructor: false,
            is_accessor: false,
            is_generic: false,
            hook_tagged: false,
            native_import: None,
            params,
            return_type: return_type.to_string(),
            body: Some(MethodBody::default()),
        }
    }

    fn entry_type(methods: Vec<MethodDef>) -> TypeDef {
        let mut ty = TypeDef::new(crucible_module::SCRIPT_NAMESPACE, "Sample");
        ty.methods = methods;
        ty
    }

    #[test]
    fn static_and_public_methods_are_not_candidates() {
        let mut public = hook("PublicHelper", vec![], "System.Void");
        public.is_public = true;
        let mut tagged = hook("OnTick", vec![], "System.Void");
        tagged.is_public = true;
        tagged.hook_tagged = true;
        let mut stat = hook("StaticHelper", vec![], "System.Void");
        stat.is_static = true;

        assert!(!is_dispatch_candidate(&public));
        assert!(is_dispatch_candidate(&tagged));
        assert!(!is_dispatch_candidate(&stat));
    }

    #[test]
    fn overload_suffix_only_when_names_collide() {
        let a = hook("Foo", vec![], "System.Void");
        let b = hook(
            "Foo",
            vec![ParamDef {
                name: "x".to_string(),
                ty: "System.Int32".to_string(),
                by_ref: false,
            }],
            "System.Void",
        );
        let c = hook(
            "Bar",
            vec![ParamDef {
                name: "x".to_string(),
                ty: "System.Int32".to_string(),
                by_ref: false,
            }],
            "System.Void",
        );
        let candidates = vec![&a, &b, &c];
        assert_eq!(dispatch_key(&a, &candidates), "Foo()");
        assert_eq!(dispatch_key(&b, &candidates), "Foo(System.Int32)");
        assert_eq!(dispatch_key(&c, &candidates), "Bar");
    }

    #[test]
    fn by_ref_parameter_marks_key() {
        let a = hook("Take", vec![], "System.Void");
        let b = hook(
            "Take",
            vec![ParamDef {
                name: "amount".to_string(),
                ty: "System.Int32".to_string(),
                by_ref: true,
            }],
            "System.Void",
        );
        let candidates = vec![&a, &b];
        assert_eq!(dispatch_key(&b, &candidates), "Take(System.Int32&)");
    }

    #[test]
    fn generated_method_shape() {
        let ty = entry_type(vec![hook("OnInit", vec![], "System.Void")]);
        let generated = generate(&ty).unwrap();
        let method = generated.method;
        assert_eq!(method.name, DISPATCH_METHOD);
        assert_eq!(method.return_type, "System.Boolean");
        assert_eq!(method.params.len(), 3);
        assert!(method.params[1].by_ref);
        let body = method.body.unwrap();
        assert!(body.check_branch_targets().is_ok());
        // All placeholders resolved.
        assert!(
            body.instructions
                .iter()
                .all(|inst| inst.branch_target() != Some(PENDING))
        );
    }

    #[test]
    fn empty_type_still_generates_guarded_method() {
        let ty = entry_type(vec![]);
        let generated = generate(&ty).unwrap();
        let body = generated.method.body.unwrap();
        // Guard plus both return paths, nothing else.
        assert!(body.instructions.len() < 20);
    }

    #[test]
    fn pointer_parameter_is_skipped_with_reason() {
        let bad = hook(
            "Native",
            vec![ParamDef {
                name: "p".to_string(),
                ty: "System.Byte*".to_string(),
                by_ref: false,
            }],
            "System.Void",
        );
        let ty = entry_type(vec![bad, hook("OnInit", vec![], "System.Void")]);
        let generated = generate(&ty).unwrap();
        assert_eq!(generated.skipped.len(), 1);
        assert!(generated.skipped[0].contains("pointer typed parameter"));
    }

    #[test]
    fn rejected_overload_leaves_survivor_with_bare_key() {
        let good = hook("Send", vec![], "System.Void");
        let bad = hook(
            "Send",
            vec![ParamDef {
                name: "p".to_string(),
                ty: "System.Byte*".to_string(),
                by_ref: false,
            }],
            "System.Void",
        );
        let ty = entry_type(vec![good, bad]);
        let generated = generate(&ty).unwrap();
        assert_eq!(generated.skipped.len(), 1);

        // The surviving method dispatches on its bare name, not a
        // parenthesized overload key.
        let body = generated.method.body.unwrap();
        let strings: Vec<&str> = body
            .instructions
            .iter()
            .filter_map(|inst| match &inst.operand {
                Operand::Str(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert!(strings.contains(&"Send"));
        assert!(strings.iter().all(|s| !s.contains('(')));
    }
}
