use std::fmt::{self, Display};
use std::sync::Arc;

use super::{throw, try_all, Finish, Operation, Site};
use crate::exception::ExceptionKind;
use crate::instruction::Register;
use crate::node::ExecutionNode;
use crate::value::{Payload, TypeError, TypeName, Value};
use crate::vm::{ExecutionError, VirtualMachine};

const ARRAY_EXCEPTIONS: &[ExceptionKind] = &[
    ExceptionKind::ArrayIndexOutOfBounds,
    ExceptionKind::NullPointer,
];

fn not_an_array(value: &Value) -> ExecutionError {
    ExecutionError::Type(TypeError::Mismatch {
        expected: "array",
        found: value.ty().clone(),
    })
}

/// The `aget` family.
///
/// Reading from an unknown array, or at an unknown index, produces an
/// unknown element and leaves the speculative exceptions in place. Only a
/// fully concrete read attaches an exception, with one exception: a known
/// null array raises a null dereference whatever the index is.
#[derive(Debug, Clone, PartialEq)]
pub struct AGetOp {
    site: Site,
    destination: Register,
    array: Register,
    index: Register,
}

impl AGetOp {
    pub(super) const fn new(
        site: Site,
        destination: Register,
        array: Register,
        index: Register,
    ) -> Self {
        Self {
            site,
            destination,
            array,
            index,
        }
    }
}

impl Operation for AGetOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state();
        let (array, index) = try_all!(
            state.read_register(self.array),
            state.read_register(self.index)
        );

        let element_type = array.ty().inner_type();
        if array.is_unknown() {
            node.state_mut()
                .assign_register(self.destination, Value::unknown(element_type));
            return Ok(self.site.fallthrough());
        }

        if array.is_null() {
            let exception = vm
                .exception_factory()
                .null_pointer(self.site.address, "Attempt to read from null array");
            return Ok(throw(node, exception));
        }

        if index.is_unknown() {
            node.state_mut()
                .assign_register(self.destination, Value::unknown(element_type));
            return Ok(self.site.fallthrough());
        }

        let index = index.as_integer()?;
        let elements = array.elements().ok_or_else(|| not_an_array(&array))?;
        let Some(element) = usize::try_from(index)
            .ok()
            .and_then(|index| elements.get(index))
        else {
            let exception = vm
                .exception_factory()
                .out_of_bounds(self.site.address, elements.len(), index);
            return Ok(throw(node, exception));
        };

        let element = element.clone();
        node.clear_exceptions();
        node.state_mut().assign_register(self.destination, element);
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        2
    }

    fn registers_assigned_count(&self) -> usize {
        1
    }

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        ARRAY_EXCEPTIONS
    }
}

impl Display for AGetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, {}, {}",
            self.site.opcode, self.destination, self.array, self.index
        )
    }
}

/// The `aput` family.
///
/// Arrays are values, so a store rebinds the array register to a copy with
/// the element replaced. Other registers referring to the same array keep
/// the previous contents.
#[derive(Debug, Clone, PartialEq)]
pub struct APutOp {
    site: Site,
    source: Register,
    array: Register,
    index: Register,
}

impl APutOp {
    pub(super) const fn new(
        site: Site,
        source: Register,
        array: Register,
        index: Register,
    ) -> Self {
        Self {
            site,
            source,
            array,
            index,
        }
    }
}

impl Operation for APutOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state();
        let (value, array, index) = try_all!(
            state.read_register(self.source),
            state.read_register(self.array),
            state.read_register(self.index)
        );

        if array.is_unknown() {
            return Ok(self.site.fallthrough());
        }

        if array.is_null() {
            let exception = vm
                .exception_factory()
                .null_pointer(self.site.address, "Attempt to write to null array");
            return Ok(throw(node, exception));
        }

        if index.is_unknown() {
            let ty = array.ty().clone();
            node.state_mut()
                .assign_register(self.array, Value::unknown(ty));
            return Ok(self.site.fallthrough());
        }

        let index = index.as_integer()?;
        let elements = array.elements().ok_or_else(|| not_an_array(&array))?;
        let slot = usize::try_from(index)
            .ok()
            .filter(|slot| *slot < elements.len());
        let Some(slot) = slot else {
            let exception = vm
                .exception_factory()
                .out_of_bounds(self.site.address, elements.len(), index);
            return Ok(throw(node, exception));
        };

        let updated = if value.is_unknown() {
            Value::unknown(array.ty().clone())
        } else {
            let mut updated = elements.to_vec();
            updated[slot] = value;
            Value::wrap(Payload::Array(Arc::from(updated)), array.ty().clone())
        };
        node.clear_exceptions();
        node.state_mut().assign_register(self.array, updated);
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        3
    }

    fn registers_assigned_count(&self) -> usize {
        1
    }

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        ARRAY_EXCEPTIONS
    }
}

impl Display for APutOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, {}, {}",
            self.site.opcode, self.source, self.array, self.index
        )
    }
}

/// `array-length`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLengthOp {
    site: Site,
    destination: Register,
    array: Register,
}

impl ArrayLengthOp {
    pub(super) const fn new(site: Site, destination: Register, array: Register) -> Self {
        Self {
            site,
            destination,
            array,
        }
    }
}

impl Operation for ArrayLengthOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let array = node.state().read_register(self.array)?;
        let length = if array.is_unknown() {
            Value::unknown("I")
        } else if array.is_null() {
            let exception = vm
                .exception_factory()
                .null_pointer(self.site.address, "Attempt to get length of null array");
            return Ok(throw(node, exception));
        } else {
            let elements = array.elements().ok_or_else(|| not_an_array(&array))?;
            node.clear_exceptions();
            i32::try_from(elements.len()).map_or_else(|_| Value::unknown("I"), Value::int)
        };
        node.state_mut().assign_register(self.destination, length);
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        1
    }

    fn registers_assigned_count(&self) -> usize {
        1
    }

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        &[ExceptionKind::NullPointer]
    }
}

impl Display for ArrayLengthOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array-length {}, {}", self.destination, self.array)
    }
}

/// `new-array`.
///
/// Arrays longer than the configured maximum are not materialized; they
/// are unknown arrays of the declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArrayOp {
    site: Site,
    destination: Register,
    size: Register,
    ty: TypeName,
}

impl NewArrayOp {
    pub(super) const fn new(
        site: Site,
        destination: Register,
        size: Register,
        ty: TypeName,
    ) -> Self {
        Self {
            site,
            destination,
            size,
            ty,
        }
    }
}

impl Operation for NewArrayOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let size = node.state().read_register(self.size)?;
        let array = if size.is_unknown() {
            Value::unknown(self.ty.clone())
        } else {
            let size = size.as_integer()?;
            let Ok(length) = usize::try_from(size) else {
                let exception = vm.exception_factory().with_message(
                    self.site.address,
                    ExceptionKind::NegativeArraySize,
                    size.to_string(),
                );
                return Ok(throw(node, exception));
            };
            node.clear_exceptions();
            if length > vm.configuration().max_array_length {
                debug!(length, "array too large to track");
                Value::unknown(self.ty.clone())
            } else {
                let element = self.ty.inner_type().default_value();
                Value::wrap(
                    Payload::Array(std::iter::repeat(element).take(length).collect()),
                    self.ty.clone(),
                )
            }
        };
        node.state_mut().assign_register(self.destination, array);
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        1
    }

    fn registers_assigned_count(&self) -> usize {
        1
    }

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        &[ExceptionKind::NegativeArraySize]
    }
}

impl Display for NewArrayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "new-array {}, {}, {}", self.destination, self.size, self.ty)
    }
}
