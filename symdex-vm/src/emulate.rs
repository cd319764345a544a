//! Methods whose effects are computed by the engine instead of executed.
//!
//! Framework methods have no bytecode to execute. Without an emulation they
//! return an unknown value. An [`EmulatedMethod`] can do better: it reads
//! the arguments from a callee state and stages a return value there.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use ahash::AHashMap;

use crate::exception::{ExceptionKind, ExceptionModel};
use crate::instruction::MethodReference;
use crate::node::ExecutionNode;
use crate::state::ExecutionState;
use crate::value::{TypeName, Value};
use crate::vm::{ExecutionError, VirtualMachine};

/// A method implemented by the engine.
pub trait EmulatedMethod: Debug + Send + Sync {
    /// Executes the method.
    ///
    /// `state` is a fresh frame with the arguments in its parameter
    /// registers and the caller's static fields. Static fields stored in
    /// `state` are visible to the caller afterwards, and so is the value
    /// staged with [`ExecutionState::assign_return_register`].
    ///
    /// # Errors
    ///
    /// Returns [`EmulationFault::Exception`] when the method throws, and
    /// [`EmulationFault::Engine`] when the engine cannot model the call.
    fn execute(
        &self,
        state: &mut ExecutionState,
        caller: &ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<(), EmulationFault>;
}

/// An emulated method did not complete normally.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulationFault {
    /// The method threw an exception in the executed program.
    Exception(ExceptionModel),
    /// The engine could not model the call.
    Engine(ExecutionError),
}

impl_from!(EmulationFault, ExceptionModel, Exception);
impl_from!(EmulationFault, ExecutionError, Engine);

impl Display for EmulationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulationFault::Exception(exception) => write!(f, "threw {exception}"),
            EmulationFault::Engine(error) => Display::fmt(error, f),
        }
    }
}

impl std::error::Error for EmulationFault {}

fn argument(state: &ExecutionState, index: usize) -> Result<&Value, ExecutionError> {
    state
        .peek_parameter(index)
        .ok_or(ExecutionError::MissingArgument(index))
}

fn reference(class: &str, name: &str, parameters: &[&str], return_type: &str) -> MethodReference {
    MethodReference {
        class: TypeName::from(class),
        name: Arc::from(name),
        parameters: parameters.iter().copied().map(TypeName::from).collect(),
        return_type: TypeName::from(return_type),
    }
}

/// The emulated methods a virtual machine knows, keyed by exact method
/// reference.
#[derive(Debug, Clone)]
pub struct EmulatedMethods {
    methods: AHashMap<MethodReference, Arc<dyn EmulatedMethod>>,
}

impl EmulatedMethods {
    /// Returns a registry with no emulated methods.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            methods: AHashMap::new(),
        }
    }

    /// Registers `method` as the implementation of `reference`, replacing
    /// any previous emulation.
    pub fn insert(&mut self, reference: MethodReference, method: impl EmulatedMethod + 'static) {
        self.methods.insert(reference, Arc::new(method));
    }

    /// Returns the emulation of `reference`.
    #[must_use]
    pub fn get(&self, reference: &MethodReference) -> Option<&Arc<dyn EmulatedMethod>> {
        self.methods.get(reference)
    }

    /// Returns true if `reference` is emulated.
    #[must_use]
    pub fn contains(&self, reference: &MethodReference) -> bool {
        self.methods.contains_key(reference)
    }

    /// Returns the number of emulated methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if no methods are emulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Default for EmulatedMethods {
    /// Returns a registry containing [`ObjectGetClass`], [`ClassForName`],
    /// and [`Breakpoint`].
    fn default() -> Self {
        let mut methods = Self::empty();
        methods.insert(
            reference(TypeName::OBJECT, "getClass", &[], TypeName::CLASS),
            ObjectGetClass,
        );
        methods.insert(
            reference(TypeName::CLASS, "forName", &[TypeName::STRING], TypeName::CLASS),
            ClassForName,
        );
        methods.insert(
            reference("Lorg/cf/simplify/Utils;", "breakpoint", &[], TypeName::VOID),
            Breakpoint,
        );
        methods
    }
}

/// `java.lang.Object.getClass()`.
///
/// The class is taken from the receiver's type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectGetClass;

impl EmulatedMethod for ObjectGetClass {
    fn execute(
        &self,
        state: &mut ExecutionState,
        caller: &ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<(), EmulationFault> {
        let receiver = argument(state, 0)?;
        if receiver.is_null() {
            return Err(EmulationFault::Exception(
                vm.exception_factory().null_pointer(
                    caller.address(),
                    concat!(
                        "Attempt to invoke virtual method ",
                        "'java.lang.Class java.lang.Object.getClass()' on a null object reference",
                    ),
                ),
            ));
        }

        let ty = receiver.ty().clone();
        let class = if ty.is_unknown() {
            Value::unknown(TypeName::CLASS)
        } else {
            let loaded = vm
                .class_loader()
                .load_class(&ty.binary_name())
                .map_err(|_| ExecutionError::ClassNotFound(ty))?;
            Value::class(loaded.name().clone())
        };
        state.assign_return_register(class);
        Ok(())
    }
}

/// `java.lang.Class.forName(String)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassForName;

impl EmulatedMethod for ClassForName {
    fn execute(
        &self,
        state: &mut ExecutionState,
        caller: &ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<(), EmulationFault> {
        let name = argument(state, 0)?;
        if name.is_null() {
            return Err(EmulationFault::Exception(
                vm.exception_factory().null_pointer(caller.address(), "className == null"),
            ));
        }

        let class = match name.as_str() {
            None => Value::unknown(TypeName::CLASS),
            Some(name) => match vm.class_loader().load_class(name) {
                Ok(loaded) => Value::class(loaded.name().clone()),
                Err(err) => {
                    debug!(class = name, "Class.forName failed");
                    return Err(EmulationFault::Exception(
                        vm.exception_factory().with_message(
                            caller.address(),
                            ExceptionKind::ClassNotFound,
                            err.0,
                        ),
                    ));
                }
            },
        };
        state.assign_return_register(class);
        Ok(())
    }
}

/// `org.cf.simplify.Utils.breakpoint()`: a marker call that does nothing
/// except show up in trace output.
#[derive(Debug, Clone, Copy, Default)]
pub struct Breakpoint;

impl EmulatedMethod for Breakpoint {
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn execute(
        &self,
        _state: &mut ExecutionState,
        caller: &ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<(), EmulationFault> {
        trace!(
            method = %caller.method().reference(),
            address = caller.address(),
            "breakpoint"
        );
        Ok(())
    }
}
