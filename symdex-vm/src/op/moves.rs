use std::fmt::{self, Display};

use super::{throw, Finish, Operation, Site};
use crate::exception::ExceptionKind;
use crate::instruction::Register;
use crate::node::ExecutionNode;
use crate::value::{TypeName, Value};
use crate::vm::{ExecutionError, VirtualMachine};

/// `nop`.
#[derive(Debug, Clone, PartialEq)]
pub struct NopOp {
    site: Site,
}

impl NopOp {
    pub(super) const fn new(site: Site) -> Self {
        Self { site }
    }
}

impl Operation for NopOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        _node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        0
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for NopOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("nop")
    }
}

/// Where a [`MoveOp`] reads from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MoveKind {
    /// Another register.
    Register,
    /// The result register.
    Result,
    /// The exception register.
    Exception,
}

impl MoveKind {
    fn from_name(name: &str) -> Self {
        if name.contains("-result") {
            MoveKind::Result
        } else if name.contains("-exception") {
            MoveKind::Exception
        } else {
            MoveKind::Register
        }
    }
}

/// The `move` family: `move*`, `move-result*`, and `move-exception`.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOp {
    site: Site,
    kind: MoveKind,
    destination: Register,
    source: Option<Register>,
}

impl MoveOp {
    pub(super) fn new(site: Site, destination: Register, source: Option<Register>) -> Self {
        Self {
            kind: MoveKind::from_name(site.opcode.name()),
            site,
            destination,
            source,
        }
    }

    /// Returns where this move reads from.
    #[must_use]
    pub const fn kind(&self) -> MoveKind {
        self.kind
    }
}

impl Operation for MoveOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state_mut();
        let value = match (self.kind, self.source) {
            (MoveKind::Register, Some(source)) => state.read_register(source)?,
            (MoveKind::Register, None) => return Err(self.site.malformed()),
            (MoveKind::Result, _) => state.read_result_register()?,
            (MoveKind::Exception, _) => state
                .peek_exception_register()
                .cloned()
                .ok_or(ExecutionError::NoPendingException)?,
        };
        state.assign_register(self.destination, value);
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        usize::from(self.kind == MoveKind::Register)
    }

    fn registers_assigned_count(&self) -> usize {
        1
    }
}

impl Display for MoveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.site.opcode, self.destination)?;
        if let Some(source) = self.source {
            write!(f, ", {source}")?;
        }
        Ok(())
    }
}

/// What a [`ConstOp`] loads.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// A literal number or string.
    Value(Value),
    /// The `java.lang.Class` of a type, resolved when executed.
    Class(TypeName),
}

/// The `const` family, including `const-string` and `const-class`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstOp {
    site: Site,
    destination: Register,
    constant: Constant,
}

impl ConstOp {
    pub(super) const fn new(site: Site, destination: Register, constant: Constant) -> Self {
        Self {
            site,
            destination,
            constant,
        }
    }
}

impl Operation for ConstOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let value = match &self.constant {
            Constant::Value(value) => value.clone(),
            Constant::Class(ty) => match vm.class_loader().load_class(&ty.binary_name()) {
                Ok(loaded) => {
                    node.clear_exceptions();
                    Value::class(loaded.name().clone())
                }
                Err(_) => {
                    let exception = vm.exception_factory().with_message(
                        self.site.address,
                        ExceptionKind::NoClassDefFound,
                        ty.binary_name(),
                    );
                    return Ok(throw(node, exception));
                }
            },
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

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        match self.constant {
            Constant::Class(_) => &[ExceptionKind::NoClassDefFound],
            Constant::Value(_) => &[],
        }
    }
}

impl Display for ConstOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}, ", self.site.opcode, self.destination)?;
        match &self.constant {
            Constant::Value(value) => Display::fmt(value, f),
            Constant::Class(ty) => Display::fmt(ty, f),
        }
    }
}

/// `return-void` and the `return` family.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnOp {
    site: Site,
    source: Option<Register>,
}

impl ReturnOp {
    pub(super) const fn new(site: Site, source: Option<Register>) -> Self {
        Self { site, source }
    }
}

impl Operation for ReturnOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state_mut();
        match self.source {
            Some(source) => {
                let value = state.read_register(source)?;
                state.assign_return_register(value);
            }
            None => state.clear_result_register(),
        }
        Ok(Finish::Return)
    }

    fn registers_read_count(&self) -> usize {
        usize::from(self.source.is_some())
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for ReturnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(source) => write!(f, "{} {source}", self.site.opcode),
            None => Display::fmt(&self.site.opcode, f),
        }
    }
}
