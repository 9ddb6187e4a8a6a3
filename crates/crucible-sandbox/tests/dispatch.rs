//! End-to-end checks for generated dispatch methods.
//!
//! The generated body is executed on a small stack interpreter covering
//! exactly the opcode subset the emitter produces, with the string
//! intrinsics modeled directly. Calls into the script type are recorded
//! rather than executed.

use std::collections::HashMap;

use crucible_module::{
    Instruction, MethodBody, MethodDef, Opcode, Operand, ParamDef, TypeDef,
};
use crucible_sandbox::trampoline;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Int(i32),
    Str(String),
    Receiver,
    ResultRef,
    ArgsRef,
    LocalRef(u16),
}

impl Value {
    fn truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Int(0))
    }
}

/// Behavior of one script method as seen by the interpreter.
struct MethodSpec {
    param_count: usize,
    /// Value the method returns, `None` for void.
    returns: Option<Value>,
    /// Simulated mutation of a by-ref parameter: (param index, new value).
    byref_write: Option<(usize, Value)>,
}

struct Interp {
    self_type: String,
    methods: HashMap<String, MethodSpec>,
    args: Vec<Value>,
    result: Value,
    invocations: Vec<(String, Vec<Value>)>,
}

impl Interp {
    fn new(self_type: &str) -> Self {
        Self {
            self_type: self_type.to_string(),
            methods: HashMap::new(),
            args: Vec::new(),
            result: Value::Null,
            invocations: Vec::new(),
        }
    }

    fn method(mut self, name: &str, spec: MethodSpec) -> Self {
        self.methods.insert(name.to_string(), spec);
        self
    }

    /// Runs the body with the given hook name, returning the dispatch
    /// method's boolean result.
    fn run(&mut self, body: &MethodBody, name: &str) -> bool {
        let mut locals = vec![Value::Null; body.locals.len() + 8];
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;
        let mut fuel = 10_000;

        loop {
            fuel -= 1;
            assert!(fuel > 0, "interpreter ran away");
            let inst: &Instruction = &body.instructions[pc];
            pc += 1;
            match (inst.opcode, &inst.operand) {
                (Opcode::PushStr, Operand::Str(s)) => stack.push(Value::Str(s.clone())),
                (Opcode::PushInt, Operand::Int(n)) => stack.push(Value::Int(*n)),
                (Opcode::PushNull, _) => stack.push(Value::Null),
                (Opcode::LoadArg, Operand::Arg(0)) => stack.push(Value::Receiver),
                (Opcode::LoadArg, Operand::Arg(1)) => {
                    stack.push(Value::Str(name.to_string()));
                }
                (Opcode::LoadArg, Operand::Arg(2)) => stack.push(Value::ResultRef),
                (Opcode::LoadArg, Operand::Arg(3)) => stack.push(Value::ArgsRef),
                (Opcode::LoadLocal, Operand::Local(n)) => {
                    stack.push(locals[*n as usize].clone());
                }
                (Opcode::StoreLocal, Operand::Local(n)) => {
                    locals[*n as usize] = stack.pop().unwrap();
                }
                (Opcode::LoadLocalRef, Operand::Local(n)) => {
                    stack.push(Value::LocalRef(*n));
                }
                (Opcode::LoadElem, _) => {
                    let Value::Int(index) = stack.pop().unwrap() else {
                        panic!("element index must be an int");
                    };
                    assert_eq!(stack.pop().unwrap(), Value::ArgsRef);
                    stack.push(self.args[index as usize].clone());
                }
                (Opcode::StoreElem, _) => {
                    let value = stack.pop().unwrap();
                    let Value::Int(index) = stack.pop().unwrap() else {
                        panic!("element index must be an int");
                    };
                    assert_eq!(stack.pop().unwrap(), Value::ArgsRef);
                    self.args[index as usize] = value;
                }
                (Opcode::Unbox, _) | (Opcode::Box, _) => {}
                (Opcode::StoreIndirect, _) => {
                    let value = stack.pop().unwrap();
                    assert_eq!(stack.pop().unwrap(), Value::ResultRef);
                    self.result = value;
                }
                (Opcode::Call | Opcode::CallVirtual, Operand::Method(target)) => {
                    self.call(target.declaring_type.as_str(), target.name.as_str(), &mut stack, &mut locals);
                }
                (Opcode::Add, _) => {
                    let Value::Int(b) = stack.pop().unwrap() else {
                        panic!("add on non-int");
                    };
                    let Value::Int(a) = stack.pop().unwrap() else {
                        panic!("add on non-int");
                    };
                    stack.push(Value::Int(a + b));
                }
                (Opcode::Jump, Operand::Target(t)) => pc = *t,
                (Opcode::JumpIfFalse, Operand::Target(t)) => {
                    if !stack.pop().unwrap().truthy() {
                        pc = *t;
                    }
                }
                (Opcode::JumpIfNotEqual, Operand::Target(t)) => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    if a != b {
                        pc = *t;
                    }
                }
                (Opcode::JumpIfGreaterOrEqual, Operand::Target(t)) => {
                    let Value::Int(b) = stack.pop().unwrap() else {
                        panic!("compare on non-int");
                    };
                    let Value::Int(a) = stack.pop().unwrap() else {
                        panic!("compare on non-int");
                    };
                    if a >= b {
                        pc = *t;
                    }
                }
                (Opcode::Return, _) => {
                    return stack.pop().unwrap().truthy();
                }
                other => panic!("unexpected instruction {other:?}"),
            }
        }
    }

    fn call(
        &mut self,
        declaring_type: &str,
        method: &str,
        stack: &mut Vec<Value>,
        locals: &mut [Value],
    ) {
        if declaring_type == "System.String" {
            match method {
                "IsNullOrEmpty" => {
                    let Value::Str(s) = stack.pop().unwrap() else {
                        panic!("string intrinsic on non-string");
                    };
                    stack.push(Value::Int(s.is_empty() as i32));
                }
                "get_Length" => {
                    let Value::Str(s) = stack.pop().unwrap() else {
                        panic!("string intrinsic on non-string");
                    };
                    stack.push(Value::Int(s.chars().count() as i32));
                }
                "get_Chars" => {
                    let Value::Int(index) = stack.pop().unwrap() else {
                        panic!("char index must be an int");
                    };
                    let Value::Str(s) = stack.pop().unwrap() else {
                        panic!("string intrinsic on non-string");
                    };
                    let ch = s.chars().nth(index as usize).unwrap();
                    stack.push(Value::Int(ch as i32));
                }
                "Equals" => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(Value::Int((a == b) as i32));
                }
                other => panic!("unknown string intrinsic {other}"),
            }
            return;
        }

        assert_eq!(declaring_type, self.self_type, "call outside the script type");
        let spec = self.methods.get(method).unwrap_or_else(|| {
            panic!("dispatch called unknown method {method}");
        });
        let mut call_args = Vec::new();
        for _ in 0..spec.param_count {
            call_args.push(stack.pop().unwrap());
        }
        call_args.reverse();
        assert_eq!(stack.pop().unwrap(), Value::Receiver);

        let recorded: Vec<Value> = call_args
            .iter()
            .map(|value| match value {
                Value::LocalRef(n) => locals[*n as usize].clone(),
                other => other.clone(),
            })
            .collect();
        if let Some((param, new_value)) = &spec.byref_write
            && let Some(Value::LocalRef(n)) = call_args.get(*param)
        {
            locals[*n as usize] = new_value.clone();
        }
        self.invocations.push((method.to_string(), recorded));
        if let Some(value) = &spec.returns {
            stack.push(value.clone());
        }
    }
}

fn void() -> MethodSpec {
    MethodSpec {
        param_count: 0,
        returns: None,
        byref_write: None,
    }
}

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

fn param(name: &str, ty: &str, by_ref: bool) -> ParamDef {
    ParamDef {
        name: name.to_string(),
        ty: ty.to_string(),
        by_ref,
    }
}

fn entry_type(methods: Vec<MethodDef>) -> TypeDef {
    let mut ty = TypeDef::new(crucible_module::SCRIPT_NAMESPACE, "Sample");
    ty.methods = methods;
    ty
}

fn dispatch_body(ty: &TypeDef) -> MethodBody {
    let generated = trampoline::generate(ty).unwrap();
    assert!(generated.skipped.is_empty());
    generated.method.body.unwrap()
}

fn invoked(interp: &Interp) -> Vec<&str> {
    interp
        .invocations
        .iter()
        .map(|(name, _)| name.as_str())
        .collect()
}

#[test]
fn exact_match_invokes_method() {
    let ty = entry_type(vec![
        hook("OnInit", vec![], "System.Void"),
        hook("OnInput", vec![], "System.Void"),
        hook("Teardown", vec![], "System.Void"),
    ]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample")
        .method("OnInit", void())
        .method("OnInput", void())
        .method("Teardown", void());
    assert!(interp.run(&body, "OnInit"));
    assert_eq!(invoked(&interp), vec!["OnInit"]);

    let mut interp = Interp::new("Crucible.Scripts.Sample")
        .method("OnInit", void())
        .method("OnInput", void())
        .method("Teardown", void());
    assert!(interp.run(&body, "OnInput"));
    assert_eq!(invoked(&interp), vec!["OnInput"]);

    let mut interp = Interp::new("Crucible.Scripts.Sample")
        .method("OnInit", void())
        .method("OnInput", void())
        .method("Teardown", void());
    assert!(interp.run(&body, "Teardown"));
    assert_eq!(invoked(&interp), vec!["Teardown"]);
}

#[test]
fn shared_prefix_of_a_key_is_rejected() {
    let ty = entry_type(vec![
        hook("OnInit", vec![], "System.Void"),
        hook("OnInput", vec![], "System.Void"),
    ]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample")
        .method("OnInit", void())
        .method("OnInput", void());
    // "OnIn" walks shared trie nodes but terminates before any key.
    assert!(!interp.run(&body, "OnIn"));
    assert!(interp.invocations.is_empty());
}

#[test]
fn extension_of_a_key_is_rejected() {
    let ty = entry_type(vec![hook("OnInit", vec![], "System.Void")]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method("OnInit", void());
    assert!(!interp.run(&body, "OnInitExtra"));
    assert!(interp.invocations.is_empty());
}

#[test]
fn unrelated_name_is_rejected() {
    let ty = entry_type(vec![hook("OnInit", vec![], "System.Void")]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method("OnInit", void());
    assert!(!interp.run(&body, "Zzz"));
    assert!(interp.invocations.is_empty());
}

#[test]
fn empty_name_is_rejected_and_result_cleared() {
    let ty = entry_type(vec![hook("OnInit", vec![], "System.Void")]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method("OnInit", void());
    interp.result = Value::Int(7);
    assert!(!interp.run(&body, ""));
    assert_eq!(interp.result, Value::Null);
    assert!(interp.invocations.is_empty());
}

#[test]
fn key_that_prefixes_another_key_dispatches_both_ways() {
    let ty = entry_type(vec![
        hook("Save", vec![], "System.Void"),
        hook("SaveAll", vec![], "System.Void"),
    ]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample")
        .method("Save", void())
        .method("SaveAll", void());
    assert!(interp.run(&body, "Save"));
    assert_eq!(invoked(&interp), vec!["Save"]);

    let mut interp = Interp::new("Crucible.Scripts.Sample")
        .method("Save", void())
        .method("SaveAll", void());
    assert!(interp.run(&body, "SaveAll"));
    assert_eq!(invoked(&interp), vec!["SaveAll"]);
}

#[test]
fn collapsed_single_chain_requires_full_equality() {
    // One long key: the emitter collapses the chain into one string
    // comparison after the first character.
    let ty = entry_type(vec![hook("OnPlayerConnected", vec![], "System.Void")]);
    let body = dispatch_body(&ty);

    let mut interp =
        Interp::new("Crucible.Scripts.Sample").method("OnPlayerConnected", void());
    assert!(interp.run(&body, "OnPlayerConnected"));
    assert_eq!(invoked(&interp), vec!["OnPlayerConnected"]);

    let mut interp =
        Interp::new("Crucible.Scripts.Sample").method("OnPlayerConnected", void());
    assert!(!interp.run(&body, "OnPlayerConnect"));
    assert!(interp.invocations.is_empty());
}

#[test]
fn arguments_are_passed_positionally_and_result_stored() {
    let ty = entry_type(vec![hook(
        "Compute",
        vec![
            param("count", "System.Int32", false),
            param("label", "System.String", false),
        ],
        "System.Int32",
    )]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method(
        "Compute",
        MethodSpec {
            param_count: 2,
            returns: Some(Value::Int(42)),
            byref_write: None,
        },
    );
    interp.args = vec![Value::Int(5), Value::Str("tag".to_string())];
    assert!(interp.run(&body, "Compute"));
    assert_eq!(
        interp.invocations,
        vec![(
            "Compute".to_string(),
            vec![Value::Int(5), Value::Str("tag".to_string())]
        )]
    );
    assert_eq!(interp.result, Value::Int(42));
}

#[test]
fn void_method_leaves_result_null() {
    let ty = entry_type(vec![hook("OnInit", vec![], "System.Void")]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method("OnInit", void());
    interp.result = Value::Int(9);
    assert!(interp.run(&body, "OnInit"));
    assert_eq!(interp.result, Value::Null);
}

#[test]
fn by_ref_parameter_is_copied_in_and_written_back() {
    let ty = entry_type(vec![hook(
        "Take",
        vec![param("amount", "System.Int32", true)],
        "System.Void",
    )]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method(
        "Take",
        MethodSpec {
            param_count: 1,
            returns: None,
            byref_write: Some((0, Value::Int(99))),
        },
    );
    interp.args = vec![Value::Int(10)];
    assert!(interp.run(&body, "Take"));
    // The callee saw the original value and its mutation was stored back
    // into the argument array.
    assert_eq!(
        interp.invocations,
        vec![("Take".to_string(), vec![Value::Int(10)])]
    );
    assert_eq!(interp.args, vec![Value::Int(99)]);
}

#[test]
fn overloaded_names_dispatch_through_suffixed_keys() {
    let ty = entry_type(vec![
        hook("Give", vec![], "System.Void"),
        hook(
            "Give",
            vec![param("amount", "System.Int32", false)],
            "System.Void",
        ),
    ]);
    let body = dispatch_body(&ty);

    let mut interp = Interp::new("Crucible.Scripts.Sample").method("Give", void());
    assert!(interp.run(&body, "Give()"));
    assert_eq!(invoked(&interp), vec!["Give"]);

    // The bare name is not a key when overloads exist.
    let mut interp = Interp::new("Crucible.Scripts.Sample").method("Give", void());
    assert!(!interp.run(&body, "Give"));
    assert!(interp.invocations.is_empty());
}
