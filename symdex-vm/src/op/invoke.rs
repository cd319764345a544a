use std::fmt::{self, Display};

use super::{throw, Finish, Invocation, Operation, Site};
use crate::exception::ExceptionKind;
use crate::instruction::{MethodReference, Opcode, Register};
use crate::node::ExecutionNode;
use crate::vm::{ExecutionError, VirtualMachine};

/// How an invoke selects the method it runs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InvokeKind {
    /// `invoke-virtual`: dispatched on the receiver's class.
    Virtual,
    /// `invoke-super`: the superclass implementation.
    Super,
    /// `invoke-direct`: constructors and private methods.
    Direct,
    /// `invoke-static`: no receiver.
    Static,
    /// `invoke-interface`: dispatched on the receiver's class.
    Interface,
}

impl InvokeKind {
    fn for_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::InvokeVirtual | Opcode::InvokeVirtualRange => Some(InvokeKind::Virtual),
            Opcode::InvokeSuper | Opcode::InvokeSuperRange => Some(InvokeKind::Super),
            Opcode::InvokeDirect | Opcode::InvokeDirectRange => Some(InvokeKind::Direct),
            Opcode::InvokeStatic | Opcode::InvokeStaticRange => Some(InvokeKind::Static),
            Opcode::InvokeInterface | Opcode::InvokeInterfaceRange => {
                Some(InvokeKind::Interface)
            }
            _ => None,
        }
    }

    /// Returns true for invokes without a receiver.
    #[must_use]
    pub const fn is_static(self) -> bool {
        matches!(self, InvokeKind::Static)
    }

    /// Returns true for invokes dispatched on the receiver's class.
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        matches!(self, InvokeKind::Virtual | InvokeKind::Interface)
    }
}

impl Display for InvokeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvokeKind::Virtual => "virtual",
            InvokeKind::Super => "super",
            InvokeKind::Direct => "direct",
            InvokeKind::Static => "static",
            InvokeKind::Interface => "interface",
        })
    }
}

/// The `invoke` family.
///
/// The call itself is carried out by the virtual machine. Once it returns,
/// the callee's result is already staged in the result register and the op
/// only continues to the next address.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOp {
    site: Site,
    kind: InvokeKind,
    method: MethodReference,
    /// The first register of each argument. Wide arguments occupy two
    /// registers and are read from the first.
    arguments: Vec<Register>,
    register_count: usize,
}

impl InvokeOp {
    pub(super) fn new(
        site: Site,
        registers: &[Register],
        method: MethodReference,
    ) -> Result<Self, ExecutionError> {
        let kind = InvokeKind::for_opcode(site.opcode).ok_or_else(|| site.malformed())?;
        let mut arguments = Vec::with_capacity(method.parameters.len() + 1);
        let mut remaining = registers.iter().copied();
        if !kind.is_static() {
            arguments.push(remaining.next().ok_or_else(|| site.malformed())?);
        }
        for parameter in &method.parameters {
            arguments.push(remaining.next().ok_or_else(|| site.malformed())?);
            if parameter.is_wide() {
                remaining.next().ok_or_else(|| site.malformed())?;
            }
        }
        if remaining.next().is_some() {
            return Err(site.malformed());
        }

        Ok(Self {
            site,
            kind,
            method,
            arguments,
            register_count: registers.len(),
        })
    }

    /// Returns the invoked method, as referenced by the instruction.
    #[must_use]
    pub const fn method(&self) -> &MethodReference {
        &self.method
    }

    /// Returns how the invoke is dispatched.
    #[must_use]
    pub const fn kind(&self) -> InvokeKind {
        self.kind
    }
}

impl Operation for InvokeOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state();
        let arguments = self
            .arguments
            .iter()
            .map(|register| state.read_register(*register))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(receiver) = arguments.first().filter(|_| !self.kind.is_static()) {
            if receiver.is_null() {
                let exception = vm.exception_factory().null_pointer(
                    self.site.address,
                    format!(
                        "Attempt to invoke {} method '{}' on a null object reference",
                        self.kind, self.method
                    ),
                );
                return Ok(throw(node, exception));
            } else if !receiver.is_unknown() {
                node.clear_exceptions();
            }
        }

        Ok(Finish::Call(Invocation::Method {
            method: self.method.clone(),
            kind: self.kind,
            arguments,
            registers: self.arguments.clone(),
        }))
    }

    fn resume(
        &self,
        _node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        Ok(self.site.fallthrough())
    }

    fn registers_read_count(&self) -> usize {
        self.register_count
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        if self.kind.is_static() {
            &[]
        } else {
            &[ExceptionKind::NullPointer]
        }
    }
}

impl Display for InvokeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.site.opcode)?;
        for (index, register) in self.arguments.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            Display::fmt(register, f)?;
        }
        write!(f, "}}, {}", self.method)
    }
}

/// `throw`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrowOp {
    site: Site,
    source: Register,
}

impl ThrowOp {
    pub(super) const fn new(site: Site, source: Register) -> Self {
        Self { site, source }
    }
}

impl Operation for ThrowOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let value = node.state().read_register(self.source)?;
        let exception = if value.is_null() {
            vm.exception_factory()
                .null_pointer(self.site.address, "throw with null exception")
        } else {
            vm.exception_factory().thrown(self.site.address, value)
        };
        Ok(throw(node, exception))
    }

    fn registers_read_count(&self) -> usize {
        1
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        &[ExceptionKind::Thrown, ExceptionKind::NullPointer]
    }
}

impl Display for ThrowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "throw {}", self.source)
    }
}
