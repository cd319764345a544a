//! The per-path machine state.

use kempt::{Map, Set};

use crate::class::{parameter_register_count, VirtualField, VirtualMethod};
use crate::instruction::{FieldReference, MethodReference, Register};
use crate::value::{TypeName, Value};
use crate::vm::ExecutionError;

/// The registers, staged values and class state of one execution path.
///
/// Every [`ExecutionNode`](crate::node::ExecutionNode) owns its state.
/// Forking a path clones the state, so changes on one path are never
/// observed by another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionState {
    registers: Map<Register, Value>,
    register_count: u16,
    parameters: Vec<Register>,
    result: Option<Value>,
    exception: Option<Value>,
    fields: Map<FieldReference, Value>,
    initialized: Set<TypeName>,
    pseudo_return_address: Option<u32>,
}

impl ExecutionState {
    /// Returns an empty state for a frame of `register_count` registers
    /// whose highest registers hold the parameters of `method`.
    ///
    /// The receiver of an instance method is parameter 0.
    #[must_use]
    pub fn new(register_count: u16, method: &MethodReference, is_static: bool) -> Self {
        let parameter_registers = parameter_register_count(&method.parameters, is_static);
        let register_count = register_count.max(parameter_registers);
        let mut next = register_count - parameter_registers;
        let mut parameters = Vec::with_capacity(method.parameters.len() + 1);
        if !is_static {
            parameters.push(Register(next));
            next += 1;
        }
        for ty in &method.parameters {
            parameters.push(Register(next));
            next += if ty.is_wide() { 2 } else { 1 };
        }

        Self {
            register_count,
            parameters,
            ..Self::default()
        }
    }

    /// Returns an empty state laid out for executing `method`.
    #[must_use]
    pub fn for_method(method: &VirtualMethod) -> Self {
        Self::new(method.register_count(), method.reference(), method.is_static())
    }

    /// Returns the number of registers in this frame.
    #[must_use]
    pub const fn register_count(&self) -> u16 {
        self.register_count
    }

    /// Returns the value of `register`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::UnassignedRegister`] if nothing has been
    /// stored in `register` on this path.
    pub fn read_register(&self, register: Register) -> Result<Value, ExecutionError> {
        self.registers
            .get(&register)
            .cloned()
            .ok_or(ExecutionError::UnassignedRegister(register))
    }

    /// Returns the value of `register`, if it has been assigned.
    #[must_use]
    pub fn register(&self, register: Register) -> Option<&Value> {
        self.registers.get(&register)
    }

    /// Stores `value` in `register`.
    pub fn assign_register(&mut self, register: Register, value: Value) {
        self.registers.insert(register, value);
    }

    /// Returns every assigned register in ascending order.
    pub fn registers(&self) -> impl Iterator<Item = (Register, &Value)> {
        self.registers
            .iter()
            .map(|field| (*field.key(), &field.value))
    }

    /// Returns the staged result of the last invoke, return, or switch.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::NoResult`] if no result is staged.
    pub fn read_result_register(&self) -> Result<Value, ExecutionError> {
        self.result.clone().ok_or(ExecutionError::NoResult)
    }

    /// Returns the staged result, if any.
    #[must_use]
    pub const fn result_register(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Stages `value` in the result register.
    pub fn assign_result_register(&mut self, value: Value) {
        self.result = Some(value);
    }

    /// Clears the result register.
    pub fn clear_result_register(&mut self) {
        self.result = None;
    }

    /// Returns the exception being handled, if any.
    #[must_use]
    pub const fn peek_exception_register(&self) -> Option<&Value> {
        self.exception.as_ref()
    }

    /// Stores the exception a handler is about to receive.
    pub fn assign_exception_register(&mut self, value: Value) {
        self.exception = Some(value);
    }

    /// Returns true if `class` has been initialized on this path.
    #[must_use]
    pub fn is_class_initialized(&self, class: &TypeName) -> bool {
        self.initialized.contains(class)
    }

    /// Marks `class` initialized.
    pub fn set_class_initialized(&mut self, class: TypeName) {
        self.initialized.insert(class);
    }

    /// Returns the current value of the static `field`.
    ///
    /// Fields that have not been stored on this path hold their initial
    /// value.
    #[must_use]
    pub fn peek_field(&self, field: &VirtualField) -> Value {
        self.fields
            .get(field.reference())
            .cloned()
            .unwrap_or_else(|| field.initial_value())
    }

    /// Stores `value` in the static `field`.
    pub fn assign_field(&mut self, field: &VirtualField, value: Value) {
        self.fields.insert(field.reference().clone(), value);
    }

    /// Returns every static field stored on this path.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldReference, &Value)> {
        self.fields.iter().map(|field| (field.key(), &field.value))
    }

    /// Records where a switch payload returns to when no case matches.
    pub fn set_pseudo_instruction_return_address(&mut self, address: u32) {
        self.pseudo_return_address = Some(address);
    }

    /// Returns the address recorded by the last switch.
    #[must_use]
    pub const fn pseudo_instruction_return_address(&self) -> Option<u32> {
        self.pseudo_return_address
    }

    /// Returns the number of parameters, counting the receiver.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Returns parameter `index`, counting the receiver as parameter 0 for
    /// instance methods.
    #[must_use]
    pub fn peek_parameter(&self, index: usize) -> Option<&Value> {
        self.parameters
            .get(index)
            .and_then(|register| self.registers.get(register))
    }

    /// Stores `arguments` in the parameter registers, in order.
    pub fn assign_parameters(&mut self, arguments: impl IntoIterator<Item = Value>) {
        let registers = self.parameters.clone();
        for (register, value) in registers.into_iter().zip(arguments) {
            self.assign_register(register, value);
        }
    }

    /// Stages the value a method returns to its caller.
    pub fn assign_return_register(&mut self, value: Value) {
        self.assign_result_register(value);
    }

    /// Replaces this state's static fields and initialized classes with
    /// those of `other`.
    ///
    /// Used when a call returns: whatever the callee path initialized or
    /// stored is visible to the caller on that path.
    pub fn adopt_class_state(&mut self, other: &ExecutionState) {
        self.fields = other.fields.clone();
        self.initialized = other.initialized.clone();
    }
}
