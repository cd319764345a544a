//! Instruction semantics.
//!
//! Every instruction is built into an [`Op`] once per method address. An op
//! executes against an [`ExecutionNode`]: it reads and writes the node's
//! state, attaches or clears exceptions, and reports what is reachable next
//! as a [`Finish`].
//!
//! Ops that need another method to run first (invokes, and static field
//! accesses of uninitialized classes) return [`Finish::Call`]. Once the call
//! completes, the virtual machine asks the same op to [`Op::resume`].

use std::fmt::{self, Display};

use crate::exception::{ExceptionKind, ExceptionModel};
use crate::instruction::{Location, MethodReference, Opcode, Operands, Register};
use crate::node::ExecutionNode;
use crate::value::{TypeName, Value};
use crate::vm::{ExecutionError, VirtualMachine};

mod array;
mod branch;
mod fields;
mod invoke;
mod moves;

pub use self::array::{AGetOp, APutOp, ArrayLengthOp, NewArrayOp};
pub use self::branch::{Comparison, GotoOp, IfOp, SwitchOp, SwitchPayloadOp};
pub use self::fields::{SGetOp, SPutOp};
pub use self::invoke::{InvokeKind, InvokeOp, ThrowOp};
pub use self::moves::{ConstOp, Constant, MoveKind, MoveOp, NopOp, ReturnOp};

macro_rules! try_all {
    ($a:expr, $b:expr) => {
        match ($a, $b) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(err), _) | (_, Err(err)) => return Err(err),
        }
    };
    ($a:expr, $b:expr, $c:expr) => {
        match ($a, $b, $c) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => return Err(err),
        }
    };
}

pub(crate) use try_all;

/// What an op makes reachable.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    /// Execution continues at each address, in order.
    Successors(Vec<u32>),
    /// The op needs a call to complete before it can resume.
    Call(Invocation),
    /// The method returns. The returned value is staged in the result
    /// register.
    Return,
    /// The node's attached exception is raised.
    Throw,
}

/// A call requested by an op.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Run the static initializer of a class.
    ClassInitializer(TypeName),
    /// Invoke a method.
    Method {
        /// The method, as referenced by the instruction.
        method: MethodReference,
        /// How the method is dispatched.
        kind: InvokeKind,
        /// The argument values, one per parameter, receiver first.
        arguments: Vec<Value>,
        /// The register each argument was read from.
        registers: Vec<Register>,
    },
}

/// Where an op lives in its method.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Site {
    /// The op's address.
    pub address: u32,
    /// The address of the sequentially following instruction.
    pub next: u32,
    /// The instruction's opcode.
    pub opcode: Opcode,
}

impl Site {
    fn fallthrough(self) -> Finish {
        Finish::Successors(vec![self.next])
    }

    fn malformed(self) -> ExecutionError {
        ExecutionError::MalformedInstruction {
            address: self.address,
            opcode: self.opcode,
        }
    }

    fn branch(self, offset: i32) -> Result<u32, ExecutionError> {
        self.address
            .checked_add_signed(offset)
            .ok_or(ExecutionError::InvalidInstructionAddress(self.address))
    }
}

pub(crate) trait Operation: Display {
    fn site(&self) -> Site;

    fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError>;

    fn resume(
        &self,
        _node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        Err(ExecutionError::NotResumable(self.site().address))
    }

    fn registers_read_count(&self) -> usize;

    fn registers_assigned_count(&self) -> usize;

    fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        &[]
    }
}

/// Attaches `exception` as the only thing `node` can do.
pub(crate) fn throw(node: &mut ExecutionNode, exception: ExceptionModel) -> Finish {
    node.clear_exceptions();
    node.set_exception(exception);
    Finish::Throw
}

/// One built instruction.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Op {
    Nop(NopOp),
    Move(MoveOp),
    Const(ConstOp),
    AGet(AGetOp),
    APut(APutOp),
    ArrayLength(ArrayLengthOp),
    NewArray(NewArrayOp),
    SGet(SGetOp),
    SPut(SPutOp),
    Goto(GotoOp),
    If(IfOp),
    Switch(SwitchOp),
    SwitchPayload(SwitchPayloadOp),
    Invoke(InvokeOp),
    Return(ReturnOp),
    Throw(ThrowOp),
}

macro_rules! dispatch {
    ($op:expr, $inner:ident => $body:expr) => {
        match $op {
            Op::Nop($inner) => $body,
            Op::Move($inner) => $body,
            Op::Const($inner) => $body,
            Op::AGet($inner) => $body,
            Op::APut($inner) => $body,
            Op::ArrayLength($inner) => $body,
            Op::NewArray($inner) => $body,
            Op::SGet($inner) => $body,
            Op::SPut($inner) => $body,
            Op::Goto($inner) => $body,
            Op::If($inner) => $body,
            Op::Switch($inner) => $body,
            Op::SwitchPayload($inner) => $body,
            Op::Invoke($inner) => $body,
            Op::Return($inner) => $body,
            Op::Throw($inner) => $body,
        }
    };
}

impl Op {
    /// Builds the op for the instruction at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::MalformedInstruction`] if the operands do
    /// not fit the opcode.
    #[allow(clippy::too_many_lines)]
    pub fn build(location: &Location) -> Result<Self, ExecutionError> {
        let instruction = &location.instruction;
        let site = Site {
            address: location.address,
            next: location
                .next
                .unwrap_or_else(|| location.address.saturating_add(instruction.size())),
            opcode: instruction.opcode,
        };
        let op = match (instruction.opcode, &instruction.operands) {
            (Opcode::Nop, _) => Op::Nop(NopOp::new(site)),
            (
                Opcode::Move
                | Opcode::MoveFrom16
                | Opcode::Move16
                | Opcode::MoveWide
                | Opcode::MoveWideFrom16
                | Opcode::MoveWide16
                | Opcode::MoveObject
                | Opcode::MoveObjectFrom16
                | Opcode::MoveObject16,
                Operands::RegisterPair { a, b },
            ) => Op::Move(MoveOp::new(site, *a, Some(*b))),
            (
                Opcode::MoveResult
                | Opcode::MoveResultWide
                | Opcode::MoveResultObject
                | Opcode::MoveException,
                Operands::Register { a },
            ) => Op::Move(MoveOp::new(site, *a, None)),
            (
                Opcode::Const4 | Opcode::Const16 | Opcode::Const | Opcode::ConstHigh16,
                Operands::Literal { a, literal },
            ) => {
                let literal = i32::try_from(*literal).map_err(|_| site.malformed())?;
                Op::Const(ConstOp::new(site, *a, Constant::Value(Value::int(literal))))
            }
            (
                Opcode::ConstWide16
                | Opcode::ConstWide32
                | Opcode::ConstWide
                | Opcode::ConstWideHigh16,
                Operands::Literal { a, literal },
            ) => Op::Const(ConstOp::new(site, *a, Constant::Value(Value::long(*literal)))),
            (Opcode::ConstString | Opcode::ConstStringJumbo, Operands::String { a, string }) => {
                Op::Const(ConstOp::new(
                    site,
                    *a,
                    Constant::Value(Value::string(string)),
                ))
            }
            (Opcode::ConstClass, Operands::Type { a, ty }) => {
                Op::Const(ConstOp::new(site, *a, Constant::Class(ty.clone())))
            }
            (
                Opcode::Aget
                | Opcode::AgetWide
                | Opcode::AgetObject
                | Opcode::AgetBoolean
                | Opcode::AgetByte
                | Opcode::AgetChar
                | Opcode::AgetShort,
                Operands::RegisterTriple { a, b, c },
            ) => Op::AGet(AGetOp::new(site, *a, *b, *c)),
            (
                Opcode::Aput
                | Opcode::AputWide
                | Opcode::AputObject
                | Opcode::AputBoolean
                | Opcode::AputByte
                | Opcode::AputChar
                | Opcode::AputShort,
                Operands::RegisterTriple { a, b, c },
            ) => Op::APut(APutOp::new(site, *a, *b, *c)),
            (Opcode::ArrayLength, Operands::RegisterPair { a, b }) => {
                Op::ArrayLength(ArrayLengthOp::new(site, *a, *b))
            }
            (Opcode::NewArray, Operands::RegisterPairType { a, b, ty }) if ty.is_array() => {
                Op::NewArray(NewArrayOp::new(site, *a, *b, ty.clone()))
            }
            (
                Opcode::Sget
                | Opcode::SgetWide
                | Opcode::SgetObject
                | Opcode::SgetBoolean
                | Opcode::SgetByte
                | Opcode::SgetChar
                | Opcode::SgetShort,
                Operands::Field { a, field },
            ) => Op::SGet(SGetOp::new(site, *a, field.clone())),
            (
                Opcode::Sput
                | Opcode::SputWide
                | Opcode::SputObject
                | Opcode::SputBoolean
                | Opcode::SputByte
                | Opcode::SputChar
                | Opcode::SputShort,
                Operands::Field { a, field },
            ) => Op::SPut(SPutOp::new(site, *a, field.clone())),
            (Opcode::Goto | Opcode::Goto16 | Opcode::Goto32, Operands::Offset { offset }) => {
                Op::Goto(GotoOp::new(site, site.branch(*offset)?))
            }
            (
                Opcode::IfEq
                | Opcode::IfNe
                | Opcode::IfLt
                | Opcode::IfGe
                | Opcode::IfGt
                | Opcode::IfLe,
                Operands::RegisterPairOffset { a, b, offset },
            ) => Op::If(IfOp::new(site, *a, Some(*b), site.branch(*offset)?)?),
            (
                Opcode::IfEqz
                | Opcode::IfNez
                | Opcode::IfLtz
                | Opcode::IfGez
                | Opcode::IfGtz
                | Opcode::IfLez,
                Operands::RegisterOffset { a, offset },
            ) => Op::If(IfOp::new(site, *a, None, site.branch(*offset)?)?),
            (
                Opcode::PackedSwitch | Opcode::SparseSwitch,
                Operands::RegisterOffset { a, offset },
            ) => Op::Switch(SwitchOp::new(site, *a, site.branch(*offset)?)),
            (
                Opcode::PackedSwitchPayload,
                Operands::PackedSwitchPayload {
                    first_key,
                    targets,
                },
            ) => {
                let cases = (0..)
                    .zip(targets.iter().copied())
                    .map(|(index, target)| {
                        first_key.checked_add(index).map(|key| (key, target))
                    })
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| site.malformed())?;
                Op::SwitchPayload(SwitchPayloadOp::new(site, cases))
            }
            (
                Opcode::SparseSwitchPayload,
                Operands::SparseSwitchPayload { keys, targets },
            ) if keys.len() == targets.len() => Op::SwitchPayload(SwitchPayloadOp::new(
                site,
                keys.iter().copied().zip(targets.iter().copied()).collect(),
            )),
            (
                Opcode::InvokeVirtual
                | Opcode::InvokeSuper
                | Opcode::InvokeDirect
                | Opcode::InvokeStatic
                | Opcode::InvokeInterface,
                Operands::Invoke { registers, method },
            ) => Op::Invoke(InvokeOp::new(site, registers, method.clone())?),
            (
                Opcode::InvokeVirtualRange
                | Opcode::InvokeSuperRange
                | Opcode::InvokeDirectRange
                | Opcode::InvokeStaticRange
                | Opcode::InvokeInterfaceRange,
                Operands::InvokeRange {
                    start,
                    count,
                    method,
                },
            ) => {
                let registers = (0..*count)
                    .map(|offset| start.0.checked_add(offset).map(Register))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| site.malformed())?;
                Op::Invoke(InvokeOp::new(site, &registers, method.clone())?)
            }
            (Opcode::ReturnVoid, _) => Op::Return(ReturnOp::new(site, None)),
            (
                Opcode::Return | Opcode::ReturnWide | Opcode::ReturnObject,
                Operands::Register { a },
            ) => Op::Return(ReturnOp::new(site, Some(*a))),
            (Opcode::Throw, Operands::Register { a }) => Op::Throw(ThrowOp::new(site, *a)),
            _ => return Err(site.malformed()),
        };
        Ok(op)
    }

    /// Returns where this op lives.
    #[must_use]
    pub fn site(&self) -> Site {
        dispatch!(self, op => op.site())
    }

    /// Returns this op's address.
    #[must_use]
    pub fn address(&self) -> u32 {
        self.site().address
    }

    /// Executes this op on `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node's state cannot support the op, such as
    /// when reading an unassigned register. Exceptions the executed program
    /// would raise are attached to the node instead.
    pub fn execute(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        dispatch!(self, op => op.execute(node, vm))
    }

    /// Completes this op after the call it requested has finished.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::NotResumable`] for ops that never request
    /// calls, and otherwise the same errors as [`Op::execute`].
    pub fn resume(
        &self,
        node: &mut ExecutionNode,
        vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        dispatch!(self, op => op.resume(node, vm))
    }

    /// Returns how many registers this op reads.
    #[must_use]
    pub fn registers_read_count(&self) -> usize {
        dispatch!(self, op => op.registers_read_count())
    }

    /// Returns how many registers this op writes.
    #[must_use]
    pub fn registers_assigned_count(&self) -> usize {
        dispatch!(self, op => op.registers_assigned_count())
    }

    /// Returns the exceptions this op can raise.
    #[must_use]
    pub fn possible_exceptions(&self) -> &'static [ExceptionKind] {
        dispatch!(self, op => op.possible_exceptions())
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, op => Display::fmt(op, f))
    }
}
