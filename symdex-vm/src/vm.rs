//! The virtual machine that explores every feasible path through a method.

use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::class::{ClassManager, VirtualMethod};
use crate::emulate::{EmulatedMethod, EmulatedMethods, EmulationFault};
use crate::exception::ExceptionFactory;
use crate::instruction::{FieldReference, MethodReference, Opcode, Register};
use crate::loader::ClassLoader;
use crate::node::{CallSite, ExecutionGraph, ExecutionNode, NodeId};
use crate::op::{self, Finish, Invocation, InvokeKind, Op};
use crate::state::ExecutionState;
use crate::value::{TypeError, TypeName, Value};

/// Limits on how much work a run may do.
///
/// Every field has a default, so a configuration file only needs to name
/// the limits it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// The number of nodes after which expansion stops.
    pub max_nodes: usize,
    /// The deepest call stack that is executed. Deeper calls return
    /// unknown values.
    pub max_call_depth: usize,
    /// The number of times one address of one method may be executed
    /// across all paths before expansion stops.
    pub max_address_visits: usize,
    /// The wall-clock time after which expansion stops.
    pub max_execution_time: Option<Duration>,
    /// The longest array `new-array` materializes. Longer arrays are
    /// unknown.
    pub max_array_length: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_nodes: 1_000_000,
            max_call_depth: 50,
            max_address_visits: 10_000,
            max_execution_time: None,
            max_array_length: 65_536,
        }
    }
}

impl Configuration {
    /// Sets the node limit and returns self.
    #[must_use]
    pub const fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    /// Sets the call depth limit and returns self.
    #[must_use]
    pub const fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    /// Sets the per-address visit limit and returns self.
    #[must_use]
    pub const fn with_max_address_visits(mut self, max_address_visits: usize) -> Self {
        self.max_address_visits = max_address_visits;
        self
    }

    /// Sets the execution time limit and returns self.
    #[must_use]
    pub const fn with_max_execution_time(mut self, max_execution_time: Duration) -> Self {
        self.max_execution_time = Some(max_execution_time);
        self
    }

    /// Sets the longest array that is materialized and returns self.
    #[must_use]
    pub const fn with_max_array_length(mut self, max_array_length: usize) -> Self {
        self.max_array_length = max_array_length;
        self
    }
}

/// An error in the engine, as opposed to an exception in the executed
/// program.
///
/// An execution error stops the path it occurs on. Other paths continue.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExecutionError {
    /// A register was read before anything was stored in it.
    UnassignedRegister(Register),
    /// `move-exception` executed outside of an exception handler.
    NoPendingException,
    /// `move-result` executed without a staged result.
    NoResult,
    /// A switch payload executed without a preceding switch.
    NoPseudoReturnAddress,
    /// An emulated method was called with fewer arguments than it reads.
    MissingArgument(usize),
    /// A class could not be resolved.
    ClassNotFound(TypeName),
    /// A field of a program class could not be resolved.
    FieldNotFound(FieldReference),
    /// A method could not be resolved.
    MethodNotFound(MethodReference),
    /// A method has no instructions to execute.
    MissingImplementation(MethodReference),
    /// No instruction starts at the address.
    InvalidInstructionAddress(u32),
    /// An instruction's operands do not fit its opcode.
    MalformedInstruction {
        /// The instruction's address.
        address: u32,
        /// The instruction's opcode.
        opcode: Opcode,
    },
    /// A value did not have the type an op required.
    Type(TypeError),
    /// An op that never calls was asked to resume.
    NotResumable(u32),
}

impl_from!(ExecutionError, TypeError, Type);

impl Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::UnassignedRegister(register) => {
                write!(f, "register {register} read before assignment")
            }
            ExecutionError::NoPendingException => f.write_str("no exception is pending"),
            ExecutionError::NoResult => f.write_str("no result is staged"),
            ExecutionError::NoPseudoReturnAddress => {
                f.write_str("switch payload executed without a switch")
            }
            ExecutionError::MissingArgument(index) => write!(f, "missing argument {index}"),
            ExecutionError::ClassNotFound(class) => write!(f, "class not found: {class}"),
            ExecutionError::FieldNotFound(field) => write!(f, "field not found: {field}"),
            ExecutionError::MethodNotFound(method) => write!(f, "method not found: {method}"),
            ExecutionError::MissingImplementation(method) => {
                write!(f, "method has no implementation: {method}")
            }
            ExecutionError::InvalidInstructionAddress(address) => {
                write!(f, "no instruction at address {address}")
            }
            ExecutionError::MalformedInstruction { address, opcode } => {
                write!(f, "malformed {opcode} at address {address}")
            }
            ExecutionError::Type(err) => Display::fmt(err, f),
            ExecutionError::NotResumable(address) => {
                write!(f, "op at address {address} cannot resume")
            }
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Why a run stopped before exploring every path.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Truncation {
    /// [`Configuration::max_nodes`] was reached.
    NodeLimit,
    /// An address was visited more than
    /// [`Configuration::max_address_visits`] times.
    AddressVisits,
    /// [`Configuration::max_execution_time`] elapsed.
    Timeout,
}

impl Display for Truncation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Truncation::NodeLimit => "node limit reached",
            Truncation::AddressVisits => "address visit limit reached",
            Truncation::Timeout => "execution time limit reached",
        })
    }
}

/// A symbolic Dalvik virtual machine.
///
/// The machine itself holds no per-run state; [`VirtualMachine::run`] can be
/// called any number of times, from any number of threads.
#[derive(Debug)]
pub struct VirtualMachine {
    classes: Arc<ClassManager>,
    loader: ClassLoader,
    exceptions: ExceptionFactory,
    emulated: EmulatedMethods,
    configuration: Configuration,
    ops: Mutex<AHashMap<(MethodReference, u32), Arc<Op>>>,
}

impl VirtualMachine {
    /// Returns a machine executing `classes` with the default configuration
    /// and emulated methods.
    #[must_use]
    pub fn new(classes: ClassManager) -> Self {
        let classes = Arc::new(classes);
        Self {
            loader: ClassLoader::new(classes.clone()),
            classes,
            exceptions: ExceptionFactory::new(),
            emulated: EmulatedMethods::default(),
            configuration: Configuration::default(),
            ops: Mutex::default(),
        }
    }

    /// Replaces the configuration and returns self.
    #[must_use]
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Replaces the emulated methods and returns self.
    #[must_use]
    pub fn with_emulated_methods(mut self, emulated: EmulatedMethods) -> Self {
        self.emulated = emulated;
        self
    }

    /// Registers an emulation of `reference`.
    pub fn emulate(&mut self, reference: MethodReference, method: impl EmulatedMethod + 'static) {
        self.emulated.insert(reference, method);
    }

    /// Returns the classes this machine executes.
    #[must_use]
    pub fn classes(&self) -> &ClassManager {
        &self.classes
    }

    /// Returns the class loader used by reflection.
    #[must_use]
    pub const fn class_loader(&self) -> &ClassLoader {
        &self.loader
    }

    /// Returns the factory ops build exceptions with.
    #[must_use]
    pub const fn exception_factory(&self) -> &ExceptionFactory {
        &self.exceptions
    }

    /// Returns the emulated methods.
    #[must_use]
    pub const fn emulated_methods(&self) -> &EmulatedMethods {
        &self.emulated
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Resolves `reference` to a method defined by the program.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::MethodNotFound`] if no class in the
    /// hierarchy of the referenced class defines the method.
    pub fn method(
        &self,
        reference: &MethodReference,
    ) -> Result<Arc<VirtualMethod>, ExecutionError> {
        self.classes
            .method(reference)
            .cloned()
            .ok_or_else(|| ExecutionError::MethodNotFound(reference.clone()))
    }

    /// Returns a state for executing `reference` where every parameter is
    /// unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::MethodNotFound`] if the method cannot be
    /// resolved.
    pub fn initial_state(
        &self,
        reference: &MethodReference,
    ) -> Result<ExecutionState, ExecutionError> {
        let method = self.method(reference)?;
        let mut state = ExecutionState::for_method(&method);
        let receiver = (!method.is_static()).then(|| method.reference().class.clone());
        state.assign_parameters(
            receiver
                .into_iter()
                .chain(method.reference().parameters.iter().cloned())
                .map(Value::unknown),
        );
        Ok(state)
    }

    /// Returns the op at `address` in `method`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the method has no implementation, no instruction
    /// starts at `address`, or the instruction is malformed.
    pub fn op(&self, method: &VirtualMethod, address: u32) -> Result<Arc<Op>, ExecutionError> {
        let key = (method.reference().clone(), address);
        if let Some(op) = self.ops.lock().get(&key) {
            return Ok(op.clone());
        }

        let location = method
            .implementation()
            .ok_or_else(|| ExecutionError::MissingImplementation(method.reference().clone()))?
            .location(address)
            .ok_or(ExecutionError::InvalidInstructionAddress(address))?;
        let op = Arc::new(Op::build(location)?);
        trace!(method = %method.reference(), address, op = %op, "built op");
        self.ops.lock().insert(key, op.clone());
        Ok(op)
    }

    /// Explores `method` from its first instruction, starting from `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the method cannot be resolved or has no
    /// implementation. Errors on individual paths are recorded in the
    /// returned graph instead.
    pub fn run(
        &self,
        method: &MethodReference,
        state: ExecutionState,
    ) -> Result<ExecutionGraph, ExecutionError> {
        self.run_at(method, 0, state)
    }

    /// Explores `method` from `address`, starting from `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the method cannot be resolved or has no
    /// implementation. Errors on individual paths are recorded in the
    /// returned graph instead.
    pub fn run_at(
        &self,
        method: &MethodReference,
        address: u32,
        state: ExecutionState,
    ) -> Result<ExecutionGraph, ExecutionError> {
        let method = self.method(method)?;
        if method.implementation().is_none() {
            return Err(ExecutionError::MissingImplementation(
                method.reference().clone(),
            ));
        }

        debug!(method = %method.reference(), address, "executing");
        let graph = ExecutionGraph::new(ExecutionNode::new(address, method, state));
        let graph = Exploration::new(self, graph).run();
        debug!(
            nodes = graph.len(),
            errors = graph.errors().len(),
            truncation = ?graph.truncation(),
            "finished"
        );
        Ok(graph)
    }

    /// Returns the handler in `method` that catches an exception of `class`
    /// raised at `address`.
    fn handler(&self, method: &VirtualMethod, address: u32, class: &TypeName) -> Option<u32> {
        method
            .handlers_at(address)
            .find(|handler| {
                handler
                    .exception
                    .as_ref()
                    .map_or(true, |caught| self.classes.is_assignable(class, caught))
            })
            .map(|handler| handler.address)
    }

    /// Returns the method an invoke dispatches to. Virtual calls on a
    /// receiver of a known program class dispatch on that class.
    fn dispatch_target(
        &self,
        method: &MethodReference,
        kind: InvokeKind,
        arguments: &[Value],
    ) -> MethodReference {
        if kind.is_dynamic() {
            if let Some(receiver) = arguments.first().filter(|receiver| !receiver.is_unknown()) {
                let class = receiver.ty();
                if self.classes.class(class).is_some() {
                    let candidate = method.in_class(class.clone());
                    if self.classes.method(&candidate).is_some() {
                        return candidate;
                    }
                }
            }
        }
        method.clone()
    }
}

fn stage_result(state: &mut ExecutionState, return_type: &TypeName, value: Option<Value>) {
    if return_type.is_void() {
        state.clear_result_register();
    } else {
        state.assign_result_register(value.unwrap_or_else(|| Value::unknown(return_type.clone())));
    }
}

/// The worklist of one run.
struct Exploration<'a> {
    vm: &'a VirtualMachine,
    graph: ExecutionGraph,
    queue: VecDeque<NodeId>,
    visits: AHashMap<(MethodReference, u32), usize>,
    started: Instant,
}

impl<'a> Exploration<'a> {
    fn new(vm: &'a VirtualMachine, graph: ExecutionGraph) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(graph.root());
        Self {
            vm,
            graph,
            queue,
            visits: AHashMap::new(),
            started: Instant::now(),
        }
    }

    fn run(mut self) -> ExecutionGraph {
        while let Some(id) = self.queue.pop_front() {
            if let Some(reason) = self.exceeded_limit(id) {
                debug!(%reason, "truncating execution");
                self.graph.truncate(reason);
                break;
            }

            if let Err(error) = self.expand(id) {
                warn!(%error, "execution path aborted");
                self.graph.record_error(id, error);
            }
        }
        self.graph
    }

    fn exceeded_limit(&mut self, id: NodeId) -> Option<Truncation> {
        let configuration = self.vm.configuration();
        if self.graph.len() >= configuration.max_nodes {
            return Some(Truncation::NodeLimit);
        }
        if configuration
            .max_execution_time
            .is_some_and(|limit| self.started.elapsed() > limit)
        {
            return Some(Truncation::Timeout);
        }

        let node = self.graph.get(id)?;
        if !node.is_resuming() {
            let visits = self
                .visits
                .entry((node.method().reference().clone(), node.address()))
                .or_default();
            *visits += 1;
            if *visits > configuration.max_address_visits {
                return Some(Truncation::AddressVisits);
            }
        }
        None
    }

    fn push(&mut self, parent: NodeId, node: ExecutionNode) -> NodeId {
        let id = self.graph.attach(parent, node);
        self.queue.push_back(id);
        id
    }

    fn expand(&mut self, id: NodeId) -> Result<(), ExecutionError> {
        let Some(node) = self.graph.get_mut(id) else {
            return Ok(());
        };
        let op = self.vm.op(node.method(), node.address())?;
        let finish = if node.is_resuming() {
            op.resume(node, self.vm)?
        } else {
            node.set_speculative_exceptions(op.possible_exceptions());
            op.execute(node, self.vm)?
        };
        trace!(address = op.address(), op = %op, finish = ?finish, "executed");

        let may_branch_to_handler = !matches!(finish, Finish::Throw);
        self.complete(id, &op, finish)?;
        if may_branch_to_handler {
            self.fork_speculative_handlers(id);
        }
        Ok(())
    }

    fn complete(&mut self, id: NodeId, op: &Op, finish: Finish) -> Result<(), ExecutionError> {
        match finish {
            Finish::Successors(addresses) => {
                for address in addresses {
                    let child = self.graph[id].successor(address);
                    self.push(id, child);
                }
                Ok(())
            }
            Finish::Call(Invocation::ClassInitializer(class)) => {
                self.initialize_class(id, op, class)
            }
            Finish::Call(Invocation::Method {
                method,
                kind,
                arguments,
                registers,
            }) => self.invoke(id, op, &method, kind, arguments, &registers),
            Finish::Return => {
                self.return_to_caller(id);
                Ok(())
            }
            Finish::Throw => {
                self.dispatch_exception(id);
                Ok(())
            }
        }
    }

    /// Resumes `op` on the same node after a call that completed
    /// synchronously.
    fn resume_in_place(&mut self, id: NodeId, op: &Op) -> Result<(), ExecutionError> {
        let Some(node) = self.graph.get_mut(id) else {
            return Ok(());
        };
        let finish = op.resume(node, self.vm)?;
        self.complete(id, op, finish)
    }

    fn initialize_class(
        &mut self,
        id: NodeId,
        op: &Op,
        class: TypeName,
    ) -> Result<(), ExecutionError> {
        let node = &self.graph[id];
        let initializer = self
            .vm
            .classes()
            .class(&class)
            .and_then(|definition| definition.class_initializer())
            .filter(|method| method.implementation().is_some())
            .filter(|_| node.depth() < self.vm.configuration().max_call_depth)
            .cloned();

        let Some(initializer) = initializer else {
            trace!(%class, "initialized without running <clinit>");
            if let Some(node) = self.graph.get_mut(id) {
                node.state_mut().set_class_initialized(class);
            }
            return self.resume_in_place(id, op);
        };

        debug!(%class, "running <clinit>");
        let mut state = ExecutionState::for_method(&initializer);
        state.adopt_class_state(node.state());
        state.set_class_initialized(class);
        let callee = ExecutionNode::new(0, initializer, state).called_from(
            CallSite {
                node: id,
                initializer: true,
            },
            node.depth() + 1,
        );
        self.push(id, callee);
        Ok(())
    }

    fn invoke(
        &mut self,
        id: NodeId,
        op: &Op,
        method: &MethodReference,
        kind: InvokeKind,
        arguments: Vec<Value>,
        registers: &[Register],
    ) -> Result<(), ExecutionError> {
        let target = self.vm.dispatch_target(method, kind, &arguments);
        let emulated = self
            .vm
            .emulated_methods()
            .get(&target)
            .or_else(|| self.vm.emulated_methods().get(method))
            .cloned();
        if let Some(emulated) = emulated {
            return self.invoke_emulated(id, op, &target, kind, &*emulated, arguments);
        }

        let node = &self.graph[id];
        let callee = self
            .vm
            .classes()
            .method(&target)
            .filter(|callee| callee.implementation().is_some())
            .filter(|_| node.depth() < self.vm.configuration().max_call_depth)
            .cloned();
        if let Some(callee) = callee {
            trace!(method = %target, depth = node.depth() + 1, "calling");
            let mut state = ExecutionState::for_method(&callee);
            state.adopt_class_state(node.state());
            state.assign_parameters(arguments);
            let child = ExecutionNode::new(0, callee, state).called_from(
                CallSite {
                    node: id,
                    initializer: false,
                },
                node.depth() + 1,
            );
            self.push(id, child);
            return Ok(());
        }

        // Inherited emulations, such as getClass() on a program class.
        let inherited = target.in_class(TypeName::from(TypeName::OBJECT));
        if let Some(emulated) = self.vm.emulated_methods().get(&inherited).cloned() {
            return self.invoke_emulated(id, op, &target, kind, &*emulated, arguments);
        }

        trace!(method = %target, "returning unknown from unimplemented method");
        let Some(node) = self.graph.get_mut(id) else {
            return Ok(());
        };
        let state = node.state_mut();
        for (register, argument) in registers.iter().zip(&arguments) {
            if argument.is_mutable_reference() {
                state.assign_register(*register, Value::unknown(argument.ty().clone()));
            }
        }
        stage_result(state, &target.return_type, None);
        self.resume_in_place(id, op)
    }

    fn invoke_emulated(
        &mut self,
        id: NodeId,
        op: &Op,
        target: &MethodReference,
        kind: InvokeKind,
        emulated: &dyn EmulatedMethod,
        arguments: Vec<Value>,
    ) -> Result<(), ExecutionError> {
        trace!(method = %target, "emulating");
        let node = &self.graph[id];
        let mut state = ExecutionState::new(0, target, kind.is_static());
        state.adopt_class_state(node.state());
        state.assign_parameters(arguments);
        let outcome = emulated.execute(&mut state, node, self.vm);

        let Some(node) = self.graph.get_mut(id) else {
            return Ok(());
        };
        match outcome {
            Ok(()) => {
                node.state_mut().adopt_class_state(&state);
                stage_result(
                    node.state_mut(),
                    &target.return_type,
                    state.result_register().cloned(),
                );
                self.resume_in_place(id, op)
            }
            Err(EmulationFault::Exception(exception)) => {
                op::throw(node, exception);
                self.dispatch_exception(id);
                Ok(())
            }
            Err(EmulationFault::Engine(error)) => Err(error),
        }
    }

    /// Continues the caller after a callee path returns.
    fn return_to_caller(&mut self, id: NodeId) {
        let node = &self.graph[id];
        let Some(site) = node.caller() else {
            return;
        };
        let caller = &self.graph[site.node];
        let mut resumed = caller.successor(caller.address()).resumed();
        resumed.state_mut().adopt_class_state(node.state());
        if !site.initializer {
            stage_result(
                resumed.state_mut(),
                &node.method().reference().return_type,
                node.state().result_register().cloned(),
            );
        }
        self.push(id, resumed);
    }

    /// Routes the exception attached to `id` to the nearest handler, walking
    /// out through callers until one catches it.
    fn dispatch_exception(&mut self, mut id: NodeId) {
        loop {
            let node = &self.graph[id];
            let Some(exception) = node.exception().cloned() else {
                return;
            };

            if let Some(handler) = self
                .vm
                .handler(node.method(), node.address(), exception.class())
            {
                trace!(%exception, handler, "caught");
                let mut child = node.successor(handler);
                child
                    .state_mut()
                    .assign_exception_register(exception.as_value());
                self.push(id, child);
                return;
            }

            let Some(site) = node.caller() else {
                trace!(%exception, "uncaught");
                return;
            };
            let caller = &self.graph[site.node];
            let mut continuation = caller.successor(caller.address());
            continuation.state_mut().adopt_class_state(node.state());
            continuation.set_exception(exception);
            id = self.graph.attach(id, continuation);
        }
    }

    /// Adds a handler child for each exception the node may raise that a
    /// handler in its method catches.
    fn fork_speculative_handlers(&mut self, id: NodeId) {
        let node = &self.graph[id];
        let mut handlers = Vec::new();
        for kind in node.speculative_exceptions() {
            let exception = self.vm.exception_factory().build(node.address(), *kind);
            if let Some(handler) = self
                .vm
                .handler(node.method(), node.address(), exception.class())
            {
                let mut child = node.successor(handler);
                child
                    .state_mut()
                    .assign_exception_register(exception.as_value());
                handlers.push(child);
            }
        }
        for child in handlers {
            self.push(id, child);
        }
    }
}
