use std::sync::Arc;

use crate::class::{
    ClassDefinition, ClassManager, FieldDefinition, Handler, MethodDefinition, Program, TryBlock,
};
use crate::exception::ExceptionKind;
use crate::instruction::{
    FieldReference, Instruction, Location, MethodReference, Opcode, Operands, Register,
};
use crate::node::{ExecutionGraph, ExecutionNode};
use crate::op::{Finish, MoveKind, Op};
use crate::state::ExecutionState;
use crate::value::{TypeName, Value};
use crate::vm::{Configuration, ExecutionError, Truncation, VirtualMachine};

const TEST: &str = "Lcom/example/Test;";

fn instruction(opcode: Opcode, operands: Operands) -> Instruction {
    Instruction::new(opcode, operands)
}

fn r(index: u16) -> Register {
    Register(index)
}

fn reference(signature: &str) -> MethodReference {
    format!("{TEST}->{signature}").parse().unwrap()
}

fn method(signature: &str, registers: u16, instructions: Vec<Instruction>) -> MethodDefinition {
    let reference = reference(signature);
    MethodDefinition {
        name: reference.name.to_string(),
        parameters: reference.parameters,
        return_type: reference.return_type,
        is_static: true,
        registers,
        instructions,
        try_blocks: Vec::new(),
    }
}

fn machine(methods: Vec<MethodDefinition>, fields: Vec<FieldDefinition>) -> VirtualMachine {
    VirtualMachine::new(ClassManager::from_program(Program {
        classes: vec![ClassDefinition {
            name: TypeName::from(TEST),
            superclass: None,
            fields,
            methods,
        }],
    }))
}

fn explore(vm: &VirtualMachine, signature: &str) -> ExecutionGraph {
    let reference = reference(signature);
    let state = vm.initial_state(&reference).unwrap();
    vm.run(&reference, state).unwrap()
}

fn explore_with(
    vm: &VirtualMachine,
    signature: &str,
    registers: &[(u16, Value)],
) -> ExecutionGraph {
    let reference = reference(signature);
    let mut state = vm.initial_state(&reference).unwrap();
    for (register, value) in registers {
        state.assign_register(r(*register), value.clone());
    }
    vm.run(&reference, state).unwrap()
}

/// Returns the values returned by the entry method on every path that
/// completed normally.
fn returned(graph: &ExecutionGraph) -> Vec<Value> {
    graph
        .terminals()
        .filter(|(_, node)| {
            node.caller().is_none() && node.error().is_none() && node.exception().is_none()
        })
        .filter_map(|(_, node)| node.state().result_register().cloned())
        .collect()
}

/// Executes `instruction` once against a state holding `registers`.
fn execute_single(
    instruction: Instruction,
    registers: &[(u16, Value)],
) -> (ExecutionNode, Result<Finish, ExecutionError>) {
    let vm = machine(
        vec![method(
            "run()V",
            8,
            vec![instruction, self::instruction(Opcode::ReturnVoid, Operands::None)],
        )],
        Vec::new(),
    );
    let method = vm.method(&reference("run()V")).unwrap();
    let mut state = ExecutionState::for_method(&method);
    for (register, value) in registers {
        state.assign_register(r(*register), value.clone());
    }
    let mut node = ExecutionNode::new(0, method.clone(), state);
    let op = vm.op(&method, 0).unwrap();
    node.set_speculative_exceptions(op.possible_exceptions());
    let finish = op.execute(&mut node, &vm);
    (node, finish)
}

fn aget(destination: u16, array: u16, index: u16) -> Instruction {
    instruction(
        Opcode::Aget,
        Operands::RegisterTriple {
            a: r(destination),
            b: r(array),
            c: r(index),
        },
    )
}

fn int_array(values: &[i32]) -> Value {
    Value::array("I", values.iter().copied().map(Value::int))
}

fn const4(register: u16, literal: i64) -> Instruction {
    instruction(
        Opcode::Const4,
        Operands::Literal {
            a: r(register),
            literal,
        },
    )
}

fn ret(register: u16) -> Instruction {
    instruction(Opcode::Return, Operands::Register { a: r(register) })
}

#[test]
fn aget_reads_concrete_element() {
    let (node, finish) = execute_single(
        aget(2, 0, 1),
        &[(0, int_array(&[1, 2, 3])), (1, Value::int(1))],
    );
    assert_eq!(finish.unwrap(), Finish::Successors(vec![2]));
    assert_eq!(node.state().register(r(2)), Some(&Value::int(2)));
    assert!(node.exception().is_none());
    assert!(node.speculative_exceptions().is_empty());
}

#[test]
fn aget_index_past_end_is_out_of_bounds() {
    let (node, finish) = execute_single(
        aget(2, 0, 1),
        &[(0, int_array(&[1, 2, 3])), (1, Value::int(3))],
    );
    assert_eq!(finish.unwrap(), Finish::Throw);
    let exception = node.exception().unwrap();
    assert_eq!(exception.kind(), ExceptionKind::ArrayIndexOutOfBounds);
    assert_eq!(exception.message(), Some("length=3; index=3"));
    assert_eq!(exception.address(), 0);
    assert!(node.state().register(r(2)).is_none());
}

#[test]
fn aget_negative_index_is_out_of_bounds() {
    let (node, finish) = execute_single(
        aget(2, 0, 1),
        &[(0, int_array(&[1, 2, 3])), (1, Value::int(-1))],
    );
    assert_eq!(finish.unwrap(), Finish::Throw);
    assert_eq!(
        node.exception().map(|exception| exception.kind()),
        Some(ExceptionKind::ArrayIndexOutOfBounds)
    );
}

#[test]
fn aget_null_array_is_null_dereference() {
    for index in [Value::int(0), Value::unknown("I")] {
        let (node, finish) = execute_single(aget(2, 0, 1), &[(0, Value::null("[I")), (1, index)]);
        assert_eq!(finish.unwrap(), Finish::Throw);
        assert_eq!(
            node.exception().map(|exception| exception.kind()),
            Some(ExceptionKind::NullPointer)
        );
        assert!(node.state().register(r(2)).is_none());
    }
}

#[test]
fn aget_unknown_index_is_unknown_element() {
    let (node, finish) = execute_single(
        aget(2, 0, 1),
        &[(0, int_array(&[1, 2, 3])), (1, Value::unknown("I"))],
    );
    assert_eq!(finish.unwrap(), Finish::Successors(vec![2]));
    assert_eq!(node.state().register(r(2)), Some(&Value::unknown("I")));
    assert!(node.exception().is_none());
    assert!(node
        .speculative_exceptions()
        .contains(&ExceptionKind::ArrayIndexOutOfBounds));
}

#[test]
fn aget_unknown_array_derives_element_type() {
    let (node, _) = execute_single(
        aget(2, 0, 1),
        &[(0, Value::unknown("[[I")), (1, Value::int(0))],
    );
    assert_eq!(node.state().register(r(2)), Some(&Value::unknown("[I")));
    assert!(node.exception().is_none());

    let (node, _) = execute_single(
        aget(2, 0, 1),
        &[(0, Value::unknown(TypeName::UNKNOWN)), (1, Value::int(0))],
    );
    assert_eq!(node.state().register(r(2)), Some(&Value::unknown("?")));
}

fn aput(source: u16, array: u16, index: u16) -> Instruction {
    instruction(
        Opcode::Aput,
        Operands::RegisterTriple {
            a: r(source),
            b: r(array),
            c: r(index),
        },
    )
}

#[test]
fn aput_stores_known_element() {
    let (node, finish) = execute_single(
        aput(2, 0, 1),
        &[(0, int_array(&[1, 2, 3])), (1, Value::int(0)), (2, Value::int(9))],
    );
    assert_eq!(finish.unwrap(), Finish::Successors(vec![2]));
    assert_eq!(node.state().register(r(0)), Some(&int_array(&[9, 2, 3])));
}

#[test]
fn aput_unknown_element_makes_array_unknown() {
    let (node, finish) = execute_single(
        aput(2, 0, 1),
        &[
            (0, int_array(&[1, 2, 3])),
            (1, Value::int(0)),
            (2, Value::unknown("I")),
        ],
    );
    assert_eq!(finish.unwrap(), Finish::Successors(vec![2]));
    assert_eq!(node.state().register(r(0)), Some(&Value::unknown("[I")));
    assert!(node.exception().is_none());
}

#[test]
fn array_with_unknown_element_is_unknown() {
    let array = Value::array("I", [Value::int(1), Value::unknown("I")]);
    assert_eq!(array, Value::unknown("[I"));
    assert!(array.elements().is_none());
}

#[test]
fn packed_switch_payload_accepts_largest_key() {
    let location = |targets: Vec<i32>| Location {
        address: 0,
        instruction: instruction(
            Opcode::PackedSwitchPayload,
            Operands::PackedSwitchPayload {
                first_key: i32::MAX,
                targets,
            },
        ),
        next: None,
    };

    let op = Op::build(&location(vec![5])).unwrap();
    assert!(matches!(op, Op::SwitchPayload(_)));
    assert!(op.to_string().ends_with("[2147483647 -> +5]"));

    assert!(matches!(
        Op::build(&location(vec![5, 7])),
        Err(ExecutionError::MalformedInstruction { address: 0, .. })
    ));
}

#[test]
fn move_copies_register() {
    let registers = [(0, Value::string("before")), (1, Value::int(5)), (3, Value::long(9))];
    let (node, finish) = execute_single(
        instruction(Opcode::Move, Operands::RegisterPair { a: r(0), b: r(1) }),
        &registers,
    );
    assert_eq!(finish.unwrap(), Finish::Successors(vec![1]));
    assert_eq!(node.state().register(r(0)), Some(&Value::int(5)));
    assert_eq!(node.state().register(r(1)), Some(&Value::int(5)));
    assert_eq!(node.state().register(r(3)), Some(&Value::long(9)));
    assert_eq!(node.state().registers().count(), 3);
}

#[test]
fn move_exception_requires_pending_exception() {
    let (_, finish) = execute_single(
        instruction(Opcode::MoveException, Operands::Register { a: r(0) }),
        &[],
    );
    assert_eq!(finish, Err(ExecutionError::NoPendingException));
}

#[test]
fn move_kind_follows_opcode_name() {
    let vm = machine(
        vec![method(
            "run()V",
            2,
            vec![
                instruction(Opcode::MoveResultObject, Operands::Register { a: r(0) }),
                instruction(Opcode::MoveException, Operands::Register { a: r(0) }),
                instruction(Opcode::MoveObject, Operands::RegisterPair { a: r(0), b: r(1) }),
            ],
        )],
        Vec::new(),
    );
    let method = vm.method(&reference("run()V")).unwrap();
    let kinds = [0, 1, 2]
        .into_iter()
        .map(|address| match &*vm.op(&method, address).unwrap() {
            Op::Move(op) => op.kind(),
            other => unreachable!("expected move, got {other}"),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        [MoveKind::Result, MoveKind::Exception, MoveKind::Register]
    );
}

#[test]
fn static_initializer_runs_once_per_path() {
    let field = FieldReference {
        class: TypeName::from(TEST),
        name: Arc::from("value"),
        ty: TypeName::from("I"),
    };
    let clinit = method(
        "<clinit>()V",
        1,
        vec![
            const4(0, 7),
            instruction(
                Opcode::Sput,
                Operands::Field {
                    a: r(0),
                    field: field.clone(),
                },
            ),
            instruction(Opcode::ReturnVoid, Operands::None),
        ],
    );
    let run = method(
        "run()I",
        2,
        vec![
            instruction(
                Opcode::Sget,
                Operands::Field {
                    a: r(0),
                    field: field.clone(),
                },
            ),
            instruction(Opcode::Sget, Operands::Field { a: r(1), field }),
            ret(1),
        ],
    );
    let vm = machine(
        vec![clinit, run],
        vec![FieldDefinition {
            name: String::from("value"),
            ty: TypeName::from("I"),
            initial: None,
        }],
    );

    let graph = explore(&vm, "run()I");
    let initializers = graph
        .nodes()
        .filter(|(_, node)| &*node.method().reference().name == "<clinit>" && node.address() == 0)
        .count();
    assert_eq!(initializers, 1);
    assert_eq!(returned(&graph), [Value::int(7)]);
    assert!(graph.errors().is_empty());
}

#[test]
fn switch_with_unknown_key_reaches_every_target() {
    let vm = machine(
        vec![method(
            "run(I)I",
            1,
            vec![
                instruction(
                    Opcode::PackedSwitch,
                    Operands::RegisterOffset {
                        a: r(0),
                        offset: 9,
                    },
                ),
                const4(0, 0),
                ret(0),
                const4(0, 1),
                ret(0),
                const4(0, 2),
                ret(0),
                instruction(
                    Opcode::PackedSwitchPayload,
                    Operands::PackedSwitchPayload {
                        first_key: 10,
                        targets: vec![5, 7],
                    },
                ),
            ],
        )],
        Vec::new(),
    );

    let graph = explore(&vm, "run(I)I");
    let root = graph.root();
    let children = graph.children(root);
    assert_eq!(children.len(), 1);
    let payload = &graph[children[0]];
    assert_eq!(payload.address(), 9);
    assert_eq!(payload.state().pseudo_instruction_return_address(), Some(3));

    let mut results = returned(&graph);
    results.sort_by_key(|value| value.as_integer().unwrap());
    assert_eq!(results, [Value::int(0), Value::int(1), Value::int(2)]);

    let graph = explore_with(&vm, "run(I)I", &[(0, Value::int(11))]);
    assert_eq!(returned(&graph), [Value::int(2)]);

    let graph = explore_with(&vm, "run(I)I", &[(0, Value::int(4))]);
    assert_eq!(returned(&graph), [Value::int(0)]);
}

#[test]
fn unknown_condition_forks() {
    let vm = machine(
        vec![method(
            "run(I)I",
            1,
            vec![
                instruction(
                    Opcode::IfEqz,
                    Operands::RegisterOffset {
                        a: r(0),
                        offset: 4,
                    },
                ),
                const4(0, 1),
                ret(0),
                const4(0, 2),
                ret(0),
            ],
        )],
        Vec::new(),
    );

    let graph = explore(&vm, "run(I)I");
    assert_eq!(graph.children(graph.root()).len(), 2);
    let mut results = returned(&graph);
    results.sort_by_key(|value| value.as_integer().unwrap());
    assert_eq!(results, [Value::int(1), Value::int(2)]);

    let graph = explore_with(&vm, "run(I)I", &[(0, Value::int(0))]);
    assert_eq!(graph.children(graph.root()).len(), 1);
    assert_eq!(returned(&graph), [Value::int(2)]);
}

#[test]
fn callee_exception_is_caught_by_caller() {
    let fail = method(
        "fail()V",
        1,
        vec![
            const4(0, -1),
            instruction(
                Opcode::NewArray,
                Operands::RegisterPairType {
                    a: r(0),
                    b: r(0),
                    ty: TypeName::from("[I"),
                },
            ),
            instruction(Opcode::ReturnVoid, Operands::None),
        ],
    );
    let mut run = method(
        "run()I",
        1,
        vec![
            instruction(
                Opcode::InvokeStatic,
                Operands::Invoke {
                    registers: Vec::new(),
                    method: reference("fail()V"),
                },
            ),
            const4(0, 0),
            ret(0),
            instruction(Opcode::MoveException, Operands::Register { a: r(0) }),
            const4(0, 1),
            ret(0),
        ],
    );
    run.try_blocks.push(TryBlock {
        start: 0,
        end: 3,
        handlers: vec![Handler {
            exception: Some(TypeName::from("Ljava/lang/RuntimeException;")),
            address: 5,
        }],
    });
    let vm = machine(vec![fail, run], Vec::new());

    let graph = explore(&vm, "run()I");
    assert_eq!(returned(&graph), [Value::int(1)]);
    assert!(graph.errors().is_empty());
    let handler = graph
        .nodes()
        .find(|(_, node)| node.address() == 5)
        .map(|(_, node)| node)
        .unwrap();
    assert_eq!(
        handler
            .state()
            .peek_exception_register()
            .map(|value| value.ty().as_str()),
        Some("Ljava/lang/NegativeArraySizeException;")
    );
}

#[test]
fn uncaught_exception_ends_path() {
    let vm = machine(
        vec![method(
            "run()V",
            1,
            vec![
                const4(0, -1),
                instruction(
                    Opcode::NewArray,
                    Operands::RegisterPairType {
                        a: r(0),
                        b: r(0),
                        ty: TypeName::from("[I"),
                    },
                ),
                instruction(Opcode::ReturnVoid, Operands::None),
            ],
        )],
        Vec::new(),
    );

    let graph = explore(&vm, "run()V");
    assert!(graph.errors().is_empty());
    let terminals = graph.terminals().map(|(_, node)| node).collect::<Vec<_>>();
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].address(), 1);
    let exception = terminals[0].exception().unwrap();
    assert_eq!(exception.kind(), ExceptionKind::NegativeArraySize);
    assert_eq!(exception.message(), Some("-1"));
}

#[test]
fn type_mismatch_is_engine_error() {
    let vm = machine(
        vec![method(
            "run()V",
            1,
            vec![
                const4(0, 0),
                // An int is not an array.
                instruction(
                    Opcode::ArrayLength,
                    Operands::RegisterPair { a: r(0), b: r(0) },
                ),
                instruction(Opcode::ReturnVoid, Operands::None),
            ],
        )],
        Vec::new(),
    );

    let graph = explore(&vm, "run()V");
    assert!(matches!(graph.errors(), [(_, ExecutionError::Type(_))]));
    assert!(graph.terminals().all(|(_, node)| node.error().is_some()));
}

#[test]
fn node_limit_truncates() {
    let vm = machine(
        vec![method(
            "run()V",
            1,
            vec![instruction(Opcode::Goto, Operands::Offset { offset: 0 })],
        )],
        Vec::new(),
    )
    .with_configuration(Configuration::default().with_max_nodes(10));

    let graph = explore(&vm, "run()V");
    assert_eq!(graph.truncation(), Some(Truncation::NodeLimit));
    assert!(!graph.is_complete());
    assert!(graph.len() >= 10);
}

#[test]
fn address_visit_limit_truncates() {
    let vm = machine(
        vec![method(
            "run()V",
            1,
            vec![instruction(Opcode::Goto, Operands::Offset { offset: 0 })],
        )],
        Vec::new(),
    )
    .with_configuration(Configuration::default().with_max_address_visits(3));

    let graph = explore(&vm, "run()V");
    assert_eq!(graph.truncation(), Some(Truncation::AddressVisits));
    assert_eq!(graph.len(), 4);
}

#[test]
fn engine_error_stops_only_its_path() {
    let vm = machine(
        vec![method(
            "run(I)V",
            3,
            vec![
                instruction(
                    Opcode::IfEqz,
                    Operands::RegisterOffset {
                        a: r(2),
                        offset: 4,
                    },
                ),
                instruction(Opcode::Move, Operands::RegisterPair { a: r(1), b: r(0) }),
                instruction(Opcode::ReturnVoid, Operands::None),
                instruction(Opcode::ReturnVoid, Operands::None),
            ],
        )],
        Vec::new(),
    );

    let graph = explore(&vm, "run(I)V");
    assert_eq!(
        graph.errors().iter().map(|(_, error)| error).collect::<Vec<_>>(),
        [&ExecutionError::UnassignedRegister(r(0))]
    );
    let completed = graph
        .terminals()
        .filter(|(_, node)| node.error().is_none())
        .map(|(_, node)| node.address())
        .collect::<Vec<_>>();
    assert_eq!(completed, [4]);
}

fn for_name(class: &str) -> VirtualMachine {
    machine(
        vec![method(
            "run()Ljava/lang/Class;",
            1,
            vec![
                instruction(
                    Opcode::ConstString,
                    Operands::String {
                        a: r(0),
                        string: Arc::from(class),
                    },
                ),
                instruction(
                    Opcode::InvokeStatic,
                    Operands::Invoke {
                        registers: vec![r(0)],
                        method: "Ljava/lang/Class;->forName(Ljava/lang/String;)Ljava/lang/Class;"
                            .parse()
                            .unwrap(),
                    },
                ),
                instruction(Opcode::MoveResultObject, Operands::Register { a: r(0) }),
                instruction(Opcode::ReturnObject, Operands::Register { a: r(0) }),
            ],
        )],
        Vec::new(),
    )
}

#[test]
fn class_for_name_is_emulated() {
    let vm = for_name("com.example.Test");
    let graph = explore(&vm, "run()Ljava/lang/Class;");
    assert_eq!(returned(&graph), [Value::class(TypeName::from(TEST))]);

    let vm = for_name("com.example.Missing");
    let graph = explore(&vm, "run()Ljava/lang/Class;");
    assert!(returned(&graph).is_empty());
    let (_, thrower) = graph
        .terminals()
        .find(|(_, node)| node.exception().is_some())
        .unwrap();
    assert_eq!(thrower.address(), 2);
    assert_eq!(
        thrower.exception().map(|exception| exception.kind()),
        Some(ExceptionKind::ClassNotFound)
    );
}

#[test]
fn speculative_exceptions_fork_to_handler() {
    let mut run = method(
        "run([II)I",
        3,
        vec![
            aget(0, 1, 2),
            ret(0),
            instruction(Opcode::MoveException, Operands::Register { a: r(0) }),
            const4(0, -1),
            ret(0),
        ],
    );
    run.try_blocks.push(TryBlock {
        start: 0,
        end: 2,
        handlers: vec![Handler {
            exception: None,
            address: 3,
        }],
    });
    let vm = machine(vec![run], Vec::new());

    let graph = explore(&vm, "run([II)I");
    let addresses = graph
        .children(graph.root())
        .iter()
        .map(|id| graph[*id].address())
        .collect::<Vec<_>>();
    assert!(addresses.contains(&2));
    assert!(addresses.contains(&3));
    assert!(returned(&graph).contains(&Value::int(-1)));

    let graph = explore_with(
        &vm,
        "run([II)I",
        &[(1, int_array(&[4, 5])), (2, Value::int(1))],
    );
    assert_eq!(graph.children(graph.root()).len(), 1);
    assert_eq!(returned(&graph), [Value::int(5)]);
}

#[test]
fn unimplemented_call_forgets_mutable_arguments() {
    let vm = machine(
        vec![method(
            "run()V",
            1,
            vec![
                instruction(
                    Opcode::InvokeStatic,
                    Operands::Invoke {
                        registers: vec![r(0)],
                        method: "Ljava/util/Arrays;->sort([I)V".parse().unwrap(),
                    },
                ),
                instruction(Opcode::ReturnVoid, Operands::None),
            ],
        )],
        Vec::new(),
    );

    let graph = explore_with(&vm, "run()V", &[(0, int_array(&[3, 1, 2]))]);
    let (_, end) = graph.terminals().next().unwrap();
    assert_eq!(end.address(), 3);
    assert_eq!(end.state().register(r(0)), Some(&Value::unknown("[I")));
}

#[test]
fn breakpoint_is_emulated_as_no_op() {
    let vm = machine(
        vec![method(
            "run()V",
            1,
            vec![
                const4(0, 3),
                instruction(
                    Opcode::InvokeStatic,
                    Operands::Invoke {
                        registers: Vec::new(),
                        method: "Lorg/cf/simplify/Utils;->breakpoint()V".parse().unwrap(),
                    },
                ),
                instruction(Opcode::ReturnVoid, Operands::None),
            ],
        )],
        Vec::new(),
    );

    let graph = explore(&vm, "run()V");
    assert!(graph.errors().is_empty());
    let ends = graph.terminals().map(|(_, node)| node).collect::<Vec<_>>();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].address(), 4);
    assert_eq!(ends[0].state().register(r(0)), Some(&Value::int(3)));
}
