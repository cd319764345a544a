use std::fmt::{self, Display};

use super::{Finish, Invocation, Operation, Site};
use crate::class::VirtualField;
use crate::instruction::{FieldReference, Register};
use crate::node::ExecutionNode;
use crate::value::Value;
use crate::vm::{ExecutionError, VirtualMachine};

/// How a static field access resolved.
enum Resolved<'a> {
    /// The program declares the field.
    Field(&'a VirtualField),
    /// The field belongs to a class the program does not define.
    External,
}

fn resolve<'a>(
    reference: &FieldReference,
    vm: &'a VirtualMachine,
) -> Result<Resolved<'a>, ExecutionError> {
    if let Some(field) = vm.classes().field(reference) {
        Ok(Resolved::Field(field))
    } else if vm.classes().class(&reference.class).is_some() {
        Err(ExecutionError::FieldNotFound(reference.clone()))
    } else {
        Ok(Resolved::External)
    }
}

/// Requests the static initializer of the field's declaring class unless
/// the class has already been initialized on this path.
fn initialize(
    reference: &FieldReference,
    node: &ExecutionNode,
    vm: &VirtualMachine,
) -> Result<Option<Finish>, ExecutionError> {
    match resolve(reference, vm)? {
        Resolved::Field(field) if !node.state().is_class_initialized(field.defining_class()) => {
            Ok(Some(Finish::Call(Invocation::ClassInitializer(
                field.defining_class().clone(),
            ))))
        }
        _ => Ok(None),
    }
}

/// The `sget` family.
#[derive(Debug, Clone, PartialEq)]
pub struct SGetOp {
    site: Site,
    destination: Register,
    field: FieldReference,
}

impl SGetOp {
    pub(super) const fn new(site: Site, destination: Register, field: FieldReference) -> Self {
        Self {
            site,
            destination,
            field,
        }
    }
}

impl Operation for SGetOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        match initialize(&self.field, node, vm)? {
            Some(call) => Ok(call),
            None => self.resume(node, vm),
        }
    }

    fn resume(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let value = match resolve(&self.field, vm)? {
            Resolved::Field(field) => node.state().peek_field(field),
            Resolved::External => Value::unknown(self.field.ty.clone()),
        };
        node.state_mut().assign_register(self.destination, value);
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        0
    }

    fn registers_assigned_count(&self) -> usize {
        1
    }
}

impl Display for SGetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}, {}", self.site.opcode, self.destination, self.field)
    }
}

/// The `sput` family.
#[derive(Debug, Clone, PartialEq)]
pub struct SPutOp {
    site: Site,
    source: Register,
    field: FieldReference,
}

impl SPutOp {
    pub(super) const fn new(site: Site, source: Register, field: FieldReference) -> Self {
        Self {
            site,
            source,
            field,
        }
    }
}

impl Operation for SPutOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        match initialize(&self.field, node, vm)? {
            Some(call) => Ok(call),
            None => self.resume(node, vm),
        }
    }

    fn resume(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let value = node.state().read_register(self.source)?;
        if let Resolved::Field(field) = resolve(&self.field, vm)? {
            node.state_mut().assign_field(field, value);
        }
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        1
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for SPutOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}, {}", self.site.opcode, self.source, self.field)
    }
}
