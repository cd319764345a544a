//! Symbolic execution of Dalvik bytecode.
//!
//! Registers and fields hold [`Value`](value::Value)s that are either
//! concrete or unknown. The [`VirtualMachine`](vm::VirtualMachine) executes
//! as much of a method as can be proven and forks execution whenever a
//! branch depends on an unknown value. The result of a run is an
//! [`ExecutionGraph`](node::ExecutionGraph): a tree of
//! [`ExecutionNode`](node::ExecutionNode)s, one per reachable instruction
//! on each explored path.
//!
//! | Layer | Types |
//! |-------|-------|
//! | Values | [`Value`](value::Value), [`TypeName`](value::TypeName) |
//! | Program model | [`ClassManager`], [`InstructionGraph`] |
//! | Per-path state | [`ExecutionState`](state::ExecutionState) |
//! | Semantics | [`Op`](op::Op), [`ExceptionModel`](exception::ExceptionModel) |
//! | Orchestration | [`VirtualMachine`](vm::VirtualMachine) |
//!
//! [`ClassManager`]: class::ClassManager
//! [`InstructionGraph`]: instruction::InstructionGraph

macro_rules! impl_from {
    ($on:ty, $from:ty, $variant:ident) => {
        impl From<$from> for $on {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod class;
pub mod emulate;
pub mod exception;
pub mod instruction;
pub mod loader;
pub mod node;
pub mod op;
pub mod state;
pub mod value;
pub mod vm;

#[cfg(test)]
mod tests;
