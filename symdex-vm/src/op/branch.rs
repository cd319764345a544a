use std::cmp::Ordering;
use std::fmt::{self, Display};

use super::{Finish, Operation, Site};
use crate::instruction::{Opcode, Register};
use crate::node::ExecutionNode;
use crate::value::{Payload, Value};
use crate::vm::{ExecutionError, VirtualMachine};

/// The size of a `packed-switch` or `sparse-switch` instruction. Payload
/// targets are relative to the switch, which sits this far before the
/// address it falls through to.
const SWITCH_SIZE: u32 = 3;

/// `goto`, `goto/16`, and `goto/32`.
#[derive(Debug, Clone, PartialEq)]
pub struct GotoOp {
    site: Site,
    target: u32,
}

impl GotoOp {
    pub(super) const fn new(site: Site, target: u32) -> Self {
        Self { site, target }
    }
}

impl Operation for GotoOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        _node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        Ok(Finish::Successors(vec![self.target]))
    }

    fn registers_read_count(&self) -> usize {
        0
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for GotoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :addr_{}", self.site.opcode, self.target)
    }
}

/// The test an [`IfOp`] performs.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Comparison {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    Less,
    /// `>=`
    GreaterOrEqual,
    /// `>`
    Greater,
    /// `<=`
    LessOrEqual,
}

impl Comparison {
    fn for_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::IfEq | Opcode::IfEqz => Some(Comparison::Equal),
            Opcode::IfNe | Opcode::IfNez => Some(Comparison::NotEqual),
            Opcode::IfLt | Opcode::IfLtz => Some(Comparison::Less),
            Opcode::IfGe | Opcode::IfGez => Some(Comparison::GreaterOrEqual),
            Opcode::IfGt | Opcode::IfGtz => Some(Comparison::Greater),
            Opcode::IfLe | Opcode::IfLez => Some(Comparison::LessOrEqual),
            _ => None,
        }
    }

    /// Returns true if `ordering` satisfies this comparison.
    #[must_use]
    pub fn test(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Equal => ordering.is_eq(),
            Comparison::NotEqual => ordering.is_ne(),
            Comparison::Less => ordering.is_lt(),
            Comparison::GreaterOrEqual => ordering.is_ge(),
            Comparison::Greater => ordering.is_gt(),
            Comparison::LessOrEqual => ordering.is_le(),
        }
    }
}

enum Operand {
    Number(i64),
    Reference,
}

impl Operand {
    fn of(value: &Value) -> Option<Self> {
        match value.payload()? {
            Payload::Null => Some(Operand::Number(0)),
            Payload::Float(_) | Payload::Double(_) => None,
            Payload::String(_)
            | Payload::Class(_)
            | Payload::Array(_)
            | Payload::Instance
            | Payload::Throwable(_) => Some(Operand::Reference),
            _ => value.as_long().ok().map(Operand::Number),
        }
    }

    fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Operand::Number(left), Operand::Number(right)) => Some(left.cmp(right)),
            // A non-null reference is never equal to null.
            (Operand::Reference, Operand::Number(0)) => Some(Ordering::Greater),
            (Operand::Number(0), Operand::Reference) => Some(Ordering::Less),
            _ => None,
        }
    }
}

/// The `if-*` and `if-*z` families.
///
/// When either operand is unknown, both the branch target and the
/// fallthrough are reachable.
#[derive(Debug, Clone, PartialEq)]
pub struct IfOp {
    site: Site,
    comparison: Comparison,
    left: Register,
    right: Option<Register>,
    target: u32,
}

impl IfOp {
    pub(super) fn new(
        site: Site,
        left: Register,
        right: Option<Register>,
        target: u32,
    ) -> Result<Self, ExecutionError> {
        let comparison = Comparison::for_opcode(site.opcode).ok_or_else(|| site.malformed())?;
        Ok(Self {
            site,
            comparison,
            left,
            right,
            target,
        })
    }

    /// Returns the test this op performs.
    #[must_use]
    pub const fn comparison(&self) -> Comparison {
        self.comparison
    }
}

impl Operation for IfOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state();
        let left = state.read_register(self.left)?;
        let right = match self.right {
            Some(right) => Operand::of(&state.read_register(right)?),
            None => Some(Operand::Number(0)),
        };

        let ordering = Operand::of(&left)
            .zip(right)
            .and_then(|(left, right)| left.compare(&right));
        let successors = match ordering {
            Some(ordering) if self.comparison.test(ordering) => vec![self.target],
            Some(_) => vec![self.site.next],
            None if self.target == self.site.next => vec![self.target],
            None => vec![self.target, self.site.next],
        };
        Ok(Finish::Successors(successors))
    }

    fn registers_read_count(&self) -> usize {
        1 + usize::from(self.right.is_some())
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for IfOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.site.opcode, self.left)?;
        if let Some(right) = self.right {
            write!(f, ", {right}")?;
        }
        write!(f, ", :addr_{}", self.target)
    }
}

/// `packed-switch` and `sparse-switch`.
///
/// The key is staged in the result register and the fallthrough address is
/// recorded for the payload, which decides where execution continues.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchOp {
    site: Site,
    key: Register,
    payload: u32,
}

impl SwitchOp {
    pub(super) const fn new(site: Site, key: Register, payload: u32) -> Self {
        Self { site, key, payload }
    }
}

impl Operation for SwitchOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state_mut();
        let key = state.read_register(self.key)?;
        state.assign_result_register(key);
        state.set_pseudo_instruction_return_address(self.site.next);
        Ok(Finish::Successors(vec![self.payload]))
    }

    fn registers_read_count(&self) -> usize {
        1
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for SwitchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}, :addr_{}", self.site.opcode, self.key, self.payload)
    }
}

/// The payload of a `packed-switch` or `sparse-switch`.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchPayloadOp {
    site: Site,
    cases: Vec<(i32, i32)>,
}

impl SwitchPayloadOp {
    pub(super) const fn new(site: Site, cases: Vec<(i32, i32)>) -> Self {
        Self { site, cases }
    }
}

impl Operation for SwitchPayloadOp {
    fn site(&self) -> Site {
        self.site
    }

    fn execute(
        &self,
        node: &mut ExecutionNode,
        _vm: &VirtualMachine,
    ) -> Result<Finish, ExecutionError> {
        let state = node.state_mut();
        let fallthrough = state
            .pseudo_instruction_return_address()
            .ok_or(ExecutionError::NoPseudoReturnAddress)?;
        let key = state.read_result_register()?;
        state.clear_result_register();

        let switch = fallthrough
            .checked_sub(SWITCH_SIZE)
            .ok_or(ExecutionError::InvalidInstructionAddress(self.site.address))?;
        let target = |offset: i32| {
            switch
                .checked_add_signed(offset)
                .ok_or(ExecutionError::InvalidInstructionAddress(self.site.address))
        };

        if key.is_unknown() {
            let mut successors = Vec::with_capacity(self.cases.len() + 1);
            for (_, offset) in &self.cases {
                let address = target(*offset)?;
                if !successors.contains(&address) {
                    successors.push(address);
                }
            }
            if !successors.contains(&fallthrough) {
                successors.push(fallthrough);
            }
            return Ok(Finish::Successors(successors));
        }

        let key = key.as_integer()?;
        let address = match self.cases.iter().find(|(case, _)| *case == key) {
            Some((_, offset)) => target(*offset)?,
            None => fallthrough,
        };
        Ok(Finish::Successors(vec![address]))
    }

    fn registers_read_count(&self) -> usize {
        0
    }

    fn registers_assigned_count(&self) -> usize {
        0
    }
}

impl Display for SwitchPayloadOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.site.opcode)?;
        for (index, (key, offset)) in self.cases.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key} -> {offset:+}")?;
        }
        f.write_str("]")
    }
}
