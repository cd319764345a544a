use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use symdex::class::{ClassManager, Program};
use symdex::instruction::{MethodReference, Register};
use symdex::node::{ExecutionGraph, ExecutionNode};
use symdex::value::{Payload, TypeName, Value};
use symdex::vm::{Configuration, Truncation, VirtualMachine};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestOutput {
    Void,
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Class(TypeName),
    Array(Vec<TestOutput>),
    Object(TypeName),
    Unknown(TypeName),
    Exception(TypeName),
    Error(String),
}

impl TestOutput {
    fn from_value(value: &Value) -> Self {
        match value.payload() {
            None => TestOutput::Unknown(value.ty().clone()),
            Some(Payload::Null) => TestOutput::Null,
            Some(Payload::Boolean(value)) => TestOutput::Bool(*value),
            Some(Payload::String(value)) => TestOutput::String(value.to_string()),
            Some(Payload::Class(ty)) => TestOutput::Class(ty.clone()),
            Some(Payload::Array(elements)) => {
                TestOutput::Array(elements.iter().map(TestOutput::from_value).collect())
            }
            Some(Payload::Instance | Payload::Throwable(_)) => {
                TestOutput::Object(value.ty().clone())
            }
            Some(Payload::Float(_) | Payload::Double(_)) => {
                unreachable!("test returned {value:?}, but the harness doesn't support floats")
            }
            Some(_) => TestOutput::Int(value.as_long().unwrap()),
        }
    }

    fn from_terminal(node: &ExecutionNode) -> Self {
        if let Some(error) = node.error() {
            TestOutput::Error(error.to_string())
        } else if let Some(exception) = node.exception() {
            TestOutput::Exception(exception.class().clone())
        } else if node.method().reference().return_type.is_void() {
            TestOutput::Void
        } else {
            node.state()
                .result_register()
                .map_or(TestOutput::Void, TestOutput::from_value)
        }
    }

    fn into_value(self) -> Value {
        match self {
            TestOutput::Null => Value::null(TypeName::OBJECT),
            TestOutput::Bool(value) => Value::boolean(value),
            TestOutput::Int(value) => Value::int(i32::try_from(value).unwrap()),
            TestOutput::String(value) => Value::string(&value),
            TestOutput::Class(ty) => Value::class(ty),
            TestOutput::Array(elements) => {
                let elements = elements
                    .into_iter()
                    .map(TestOutput::into_value)
                    .collect::<Vec<_>>();
                let element = elements
                    .first()
                    .map_or_else(TypeName::unknown, |value| value.ty().clone());
                Value::array(element, elements)
            }
            TestOutput::Object(ty) => Value::instance(ty),
            TestOutput::Unknown(ty) => Value::unknown(ty),
            other => unreachable!("{other:?} can't be used as an argument"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Case {
    pub program: Program,
    pub method: String,
    #[serde(default)]
    pub arguments: BTreeMap<u16, TestOutput>,
    #[serde(default)]
    pub configuration: Configuration,
    /// The outcome of every path that ended in the entry method, or failed.
    #[serde(default)]
    pub outputs: Option<Vec<TestOutput>>,
    #[serde(default)]
    pub truncated: Option<Truncation>,
}

impl Case {
    fn run(&self) -> ExecutionGraph {
        let method = self.method.parse::<MethodReference>().unwrap();
        let vm = VirtualMachine::new(ClassManager::from_program(self.program.clone()))
            .with_configuration(self.configuration.clone());
        let mut state = vm.initial_state(&method).unwrap();
        for (register, value) in &self.arguments {
            state.assign_register(Register(*register), value.clone().into_value());
        }
        vm.run(&method, state).unwrap()
    }
}

fn outputs(graph: &ExecutionGraph) -> Vec<TestOutput> {
    let mut outputs = graph
        .terminals()
        .filter(|(_, node)| node.caller().is_none() || node.error().is_some())
        .map(|(_, node)| TestOutput::from_terminal(node))
        .collect::<Vec<_>>();
    outputs.sort();
    outputs
}

fn main() {
    for entry in std::fs::read_dir("tests/cases").unwrap() {
        let entry = entry.unwrap().path();
        if entry.extension().map_or(false, |ext| ext == "rsn") {
            run_test_cases(&entry);
        }
    }
}

fn run_test_cases(path: &Path) {
    let contents = std::fs::read_to_string(path).unwrap();

    let cases: BTreeMap<String, Case> = match rsn::parser::Config::default()
        .allow_implicit_map(true)
        .deserialize(&contents)
    {
        Ok(cases) => cases,
        Err(err) => unreachable!("error parsing {}: {err}", path.display()),
    };
    for (name, case) in cases {
        println!("Running {name}");
        let graph = case.run();
        assert_eq!(
            graph.truncation(),
            case.truncated,
            "in {path} @ {name}: unexpected truncation",
            path = path.display(),
        );
        if let Some(expected) = &case.outputs {
            let mut expected = expected.clone();
            expected.sort();
            let output = outputs(&graph);
            assert_eq!(
                output,
                expected,
                "in {path} @ {name}: expected {expected:?}, got {output:?}",
                path = path.display(),
            );
        }
    }
}
