//! Decoded instructions and the per-method instruction graph.
//!
//! Addresses are measured in 16-bit code units from the start of a method,
//! the same way Dalvik branch offsets are.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::value::TypeName;

/// A virtual machine register index.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Register(pub u16);

impl From<u16> for Register {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Register> for usize {
    fn from(value: Register) -> Self {
        usize::from(value.0)
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Every opcode the engine understands.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Opcode {
    Nop,
    Move,
    MoveFrom16,
    Move16,
    MoveWide,
    MoveWideFrom16,
    MoveWide16,
    MoveObject,
    MoveObjectFrom16,
    MoveObject16,
    MoveResult,
    MoveResultWide,
    MoveResultObject,
    MoveException,
    ReturnVoid,
    Return,
    ReturnWide,
    ReturnObject,
    Const4,
    Const16,
    Const,
    ConstHigh16,
    ConstWide16,
    ConstWide32,
    ConstWide,
    ConstWideHigh16,
    ConstString,
    ConstStringJumbo,
    ConstClass,
    ArrayLength,
    NewArray,
    Throw,
    Goto,
    Goto16,
    Goto32,
    PackedSwitch,
    SparseSwitch,
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,
    Aget,
    AgetWide,
    AgetObject,
    AgetBoolean,
    AgetByte,
    AgetChar,
    AgetShort,
    Aput,
    AputWide,
    AputObject,
    AputBoolean,
    AputByte,
    AputChar,
    AputShort,
    Sget,
    SgetWide,
    SgetObject,
    SgetBoolean,
    SgetByte,
    SgetChar,
    SgetShort,
    Sput,
    SputWide,
    SputObject,
    SputBoolean,
    SputByte,
    SputChar,
    SputShort,
    InvokeVirtual,
    InvokeSuper,
    InvokeDirect,
    InvokeStatic,
    InvokeInterface,
    InvokeVirtualRange,
    InvokeSuperRange,
    InvokeDirectRange,
    InvokeStaticRange,
    InvokeInterfaceRange,
    PackedSwitchPayload,
    SparseSwitchPayload,
}

impl Opcode {
    /// Returns the mnemonic used by smali.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Move => "move",
            Opcode::MoveFrom16 => "move/from16",
            Opcode::Move16 => "move/16",
            Opcode::MoveWide => "move-wide",
            Opcode::MoveWideFrom16 => "move-wide/from16",
            Opcode::MoveWide16 => "move-wide/16",
            Opcode::MoveObject => "move-object",
            Opcode::MoveObjectFrom16 => "move-object/from16",
            Opcode::MoveObject16 => "move-object/16",
            Opcode::MoveResult => "move-result",
            Opcode::MoveResultWide => "move-result-wide",
            Opcode::MoveResultObject => "move-result-object",
            Opcode::MoveException => "move-exception",
            Opcode::ReturnVoid => "return-void",
            Opcode::Return => "return",
            Opcode::ReturnWide => "return-wide",
            Opcode::ReturnObject => "return-object",
            Opcode::Const4 => "const/4",
            Opcode::Const16 => "const/16",
            Opcode::Const => "const",
            Opcode::ConstHigh16 => "const/high16",
            Opcode::ConstWide16 => "const-wide/16",
            Opcode::ConstWide32 => "const-wide/32",
            Opcode::ConstWide => "const-wide",
            Opcode::ConstWideHigh16 => "const-wide/high16",
            Opcode::ConstString => "const-string",
            Opcode::ConstStringJumbo => "const-string/jumbo",
            Opcode::ConstClass => "const-class",
            Opcode::ArrayLength => "array-length",
            Opcode::NewArray => "new-array",
            Opcode::Throw => "throw",
            Opcode::Goto => "goto",
            Opcode::Goto16 => "goto/16",
            Opcode::Goto32 => "goto/32",
            Opcode::PackedSwitch => "packed-switch",
            Opcode::SparseSwitch => "sparse-switch",
            Opcode::IfEq => "if-eq",
            Opcode::IfNe => "if-ne",
            Opcode::IfLt => "if-lt",
            Opcode::IfGe => "if-ge",
            Opcode::IfGt => "if-gt",
            Opcode::IfLe => "if-le",
            Opcode::IfEqz => "if-eqz",
            Opcode::IfNez => "if-nez",
            Opcode::IfLtz => "if-ltz",
            Opcode::IfGez => "if-gez",
            Opcode::IfGtz => "if-gtz",
            Opcode::IfLez => "if-lez",
            Opcode::Aget => "aget",
            Opcode::AgetWide => "aget-wide",
            Opcode::AgetObject => "aget-object",
            Opcode::AgetBoolean => "aget-boolean",
            Opcode::AgetByte => "aget-byte",
            Opcode::AgetChar => "aget-char",
            Opcode::AgetShort => "aget-short",
            Opcode::Aput => "aput",
            Opcode::AputWide => "aput-wide",
            Opcode::AputObject => "aput-object",
            Opcode::AputBoolean => "aput-boolean",
            Opcode::AputByte => "aput-byte",
            Opcode::AputChar => "aput-char",
            Opcode::AputShort => "aput-short",
            Opcode::Sget => "sget",
            Opcode::SgetWide => "sget-wide",
            Opcode::SgetObject => "sget-object",
            Opcode::SgetBoolean => "sget-boolean",
            Opcode::SgetByte => "sget-byte",
            Opcode::SgetChar => "sget-char",
            Opcode::SgetShort => "sget-short",
            Opcode::Sput => "sput",
            Opcode::SputWide => "sput-wide",
            Opcode::SputObject => "sput-object",
            Opcode::SputBoolean => "sput-boolean",
            Opcode::SputByte => "sput-byte",
            Opcode::SputChar => "sput-char",
            Opcode::SputShort => "sput-short",
            Opcode::InvokeVirtual => "invoke-virtual",
            Opcode::InvokeSuper => "invoke-super",
            Opcode::InvokeDirect => "invoke-direct",
            Opcode::InvokeStatic => "invoke-static",
            Opcode::InvokeInterface => "invoke-interface",
            Opcode::InvokeVirtualRange => "invoke-virtual/range",
            Opcode::InvokeSuperRange => "invoke-super/range",
            Opcode::InvokeDirectRange => "invoke-direct/range",
            Opcode::InvokeStaticRange => "invoke-static/range",
            Opcode::InvokeInterfaceRange => "invoke-interface/range",
            Opcode::PackedSwitchPayload => "packed-switch-payload",
            Opcode::SparseSwitchPayload => "sparse-switch-payload",
        }
    }

    /// Returns the size in code units of every opcode whose encoding has a
    /// fixed width. Switch payloads return `None`.
    #[must_use]
    pub const fn fixed_size(self) -> Option<u32> {
        let size = match self {
            Opcode::PackedSwitchPayload | Opcode::SparseSwitchPayload => return None,
            Opcode::Nop
            | Opcode::Move
            | Opcode::MoveWide
            | Opcode::MoveObject
            | Opcode::MoveResult
            | Opcode::MoveResultWide
            | Opcode::MoveResultObject
            | Opcode::MoveException
            | Opcode::ReturnVoid
            | Opcode::Return
            | Opcode::ReturnWide
            | Opcode::ReturnObject
            | Opcode::Const4
            | Opcode::ArrayLength
            | Opcode::Throw
            | Opcode::Goto => 1,
            Opcode::MoveFrom16
            | Opcode::MoveWideFrom16
            | Opcode::MoveObjectFrom16
            | Opcode::Const16
            | Opcode::ConstHigh16
            | Opcode::ConstWide16
            | Opcode::ConstWideHigh16
            | Opcode::ConstString
            | Opcode::ConstClass
            | Opcode::NewArray
            | Opcode::Goto16
            | Opcode::IfEq
            | Opcode::IfNe
            | Opcode::IfLt
            | Opcode::IfGe
            | Opcode::IfGt
            | Opcode::IfLe
            | Opcode::IfEqz
            | Opcode::IfNez
            | Opcode::IfLtz
            | Opcode::IfGez
            | Opcode::IfGtz
            | Opcode::IfLez
            | Opcode::Aget
            | Opcode::AgetWide
            | Opcode::AgetObject
            | Opcode::AgetBoolean
            | Opcode::AgetByte
            | Opcode::AgetChar
            | Opcode::AgetShort
            | Opcode::Aput
            | Opcode::AputWide
            | Opcode::AputObject
            | Opcode::AputBoolean
            | Opcode::AputByte
            | Opcode::AputChar
            | Opcode::AputShort
            | Opcode::Sget
            | Opcode::SgetWide
            | Opcode::SgetObject
            | Opcode::SgetBoolean
            | Opcode::SgetByte
            | Opcode::SgetChar
            | Opcode::SgetShort
            | Opcode::Sput
            | Opcode::SputWide
            | Opcode::SputObject
            | Opcode::SputBoolean
            | Opcode::SputByte
            | Opcode::SputChar
            | Opcode::SputShort => 2,
            Opcode::Move16
            | Opcode::MoveWide16
            | Opcode::MoveObject16
            | Opcode::Const
            | Opcode::ConstWide32
            | Opcode::ConstStringJumbo
            | Opcode::Goto32
            | Opcode::PackedSwitch
            | Opcode::SparseSwitch
            | Opcode::InvokeVirtual
            | Opcode::InvokeSuper
            | Opcode::InvokeDirect
            | Opcode::InvokeStatic
            | Opcode::InvokeInterface
            | Opcode::InvokeVirtualRange
            | Opcode::InvokeSuperRange
            | Opcode::InvokeDirectRange
            | Opcode::InvokeStaticRange
            | Opcode::InvokeInterfaceRange => 3,
            Opcode::ConstWide => 5,
        };
        Some(size)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A reference to a field, as it appears in an instruction.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct FieldReference {
    /// The class the reference names. The field may be declared by a
    /// superclass.
    pub class: TypeName,
    /// The field's name.
    pub name: Arc<str>,
    /// The field's type.
    pub ty: TypeName,
}

impl Display for FieldReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.class, self.name, self.ty)
    }
}

/// A reference to a method, as it appears in an instruction.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MethodReference {
    /// The class the reference names.
    pub class: TypeName,
    /// The method's name.
    pub name: Arc<str>,
    /// The parameter types, excluding the receiver.
    #[serde(default)]
    pub parameters: Vec<TypeName>,
    /// The return type.
    pub return_type: TypeName,
}

impl MethodReference {
    /// Returns the reference's signature without its class, for example
    /// `forName(Ljava/lang/String;)Ljava/lang/Class;`.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut signature = format!("{}(", self.name);
        for parameter in &self.parameters {
            signature.push_str(parameter.as_str());
        }
        signature.push(')');
        signature.push_str(self.return_type.as_str());
        signature
    }

    /// Returns this reference with its class replaced by `class`.
    #[must_use]
    pub fn in_class(&self, class: TypeName) -> Self {
        Self {
            class,
            ..self.clone()
        }
    }
}

impl Display for MethodReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.class, self.signature())
    }
}

impl FromStr for MethodReference {
    type Err = InvalidDescriptor;

    /// Parses `Lcom/example/Foo;->bar(I[J)V`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidDescriptor(s.to_string());
        let (class, rest) = s.split_once("->").ok_or_else(invalid)?;
        let (name, rest) = rest.split_once('(').ok_or_else(invalid)?;
        let (parameters, return_type) = rest.split_once(')').ok_or_else(invalid)?;
        let parameters = parse_descriptors(parameters).ok_or_else(invalid)?;
        let returned = parse_descriptors(return_type).ok_or_else(invalid)?;
        if class.is_empty() || name.is_empty() || returned.len() != 1 {
            return Err(invalid());
        }
        Ok(Self {
            class: TypeName::from(class),
            name: Arc::from(name),
            parameters,
            return_type: returned.into_iter().next().ok_or_else(invalid)?,
        })
    }
}

/// A method or type descriptor could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDescriptor(pub String);

impl Display for InvalidDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid descriptor: {}", self.0)
    }
}

impl std::error::Error for InvalidDescriptor {}

fn parse_descriptors(mut list: &str) -> Option<Vec<TypeName>> {
    let mut types = Vec::new();
    while !list.is_empty() {
        let dimensions = list.len() - list.trim_start_matches('[').len();
        let element = &list[dimensions..];
        let length = match element.chars().next()? {
            'Z' | 'B' | 'S' | 'C' | 'I' | 'J' | 'F' | 'D' | 'V' => 1,
            'L' => element.find(';')? + 1,
            _ => return None,
        };
        types.push(TypeName::from(&list[..dimensions + length]));
        list = &list[dimensions + length..];
    }
    Some(types)
}

/// The operands of a decoded instruction, grouped by encoding format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operands {
    /// Formats `10x`.
    None,
    /// Format `11x`: one register.
    Register {
        /// Register A.
        a: Register,
    },
    /// Formats `12x`, `22x`, `32x`: two registers.
    RegisterPair {
        /// Register A.
        a: Register,
        /// Register B.
        b: Register,
    },
    /// Format `23x`: three registers.
    RegisterTriple {
        /// Register A.
        a: Register,
        /// Register B.
        b: Register,
        /// Register C.
        c: Register,
    },
    /// Formats `11n`, `21s`, `21h`, `31i`, `51l`: a register and a literal.
    Literal {
        /// Register A.
        a: Register,
        /// The literal, already shifted for the `high16` forms.
        literal: i64,
    },
    /// Formats `10t`, `20t`, `30t`: a branch offset.
    Offset {
        /// The branch offset in code units, relative to this instruction.
        offset: i32,
    },
    /// Formats `21t`, `31t`: a register and a branch offset.
    RegisterOffset {
        /// Register A.
        a: Register,
        /// The branch offset in code units, relative to this instruction.
        offset: i32,
    },
    /// Format `22t`: two registers and a branch offset.
    RegisterPairOffset {
        /// Register A.
        a: Register,
        /// Register B.
        b: Register,
        /// The branch offset in code units, relative to this instruction.
        offset: i32,
    },
    /// Format `21c`/`31c` with a string reference.
    String {
        /// Register A.
        a: Register,
        /// The referenced string.
        string: Arc<str>,
    },
    /// Format `21c` with a type reference.
    Type {
        /// Register A.
        a: Register,
        /// The referenced type.
        ty: TypeName,
    },
    /// Format `22c` with a type reference.
    RegisterPairType {
        /// Register A.
        a: Register,
        /// Register B.
        b: Register,
        /// The referenced type.
        ty: TypeName,
    },
    /// Format `21c` with a field reference.
    Field {
        /// Register A.
        a: Register,
        /// The referenced field.
        field: FieldReference,
    },
    /// Format `35c`: an explicit register list and a method reference.
    Invoke {
        /// The argument registers, including both halves of wide values.
        registers: Vec<Register>,
        /// The invoked method.
        method: MethodReference,
    },
    /// Format `3rc`: a register range and a method reference.
    InvokeRange {
        /// The first argument register.
        start: Register,
        /// The number of argument registers.
        count: u16,
        /// The invoked method.
        method: MethodReference,
    },
    /// A `packed-switch` payload.
    PackedSwitchPayload {
        /// The key of the first target.
        first_key: i32,
        /// Branch offsets relative to the switch instruction.
        targets: Vec<i32>,
    },
    /// A `sparse-switch` payload.
    SparseSwitchPayload {
        /// The keys, sorted ascending.
        keys: Vec<i32>,
        /// Branch offsets relative to the switch instruction.
        targets: Vec<i32>,
    },
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// The opcode.
    pub opcode: Opcode,
    /// The operands.
    pub operands: Operands,
}

impl Instruction {
    /// Returns a new instruction.
    #[must_use]
    pub const fn new(opcode: Opcode, operands: Operands) -> Self {
        Self { opcode, operands }
    }

    /// Returns the encoded size of this instruction in code units.
    #[must_use]
    pub fn size(&self) -> u32 {
        if let Some(size) = self.opcode.fixed_size() {
            return size;
        }
        let units = |count: usize| u32::try_from(count).unwrap_or(u32::MAX);
        match &self.operands {
            Operands::PackedSwitchPayload { targets, .. } => {
                4_u32.saturating_add(units(targets.len()).saturating_mul(2))
            }
            Operands::SparseSwitchPayload { targets, .. } => {
                2_u32.saturating_add(units(targets.len()).saturating_mul(4))
            }
            _ => 1,
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.opcode, f)
    }
}

/// An instruction together with its address and the address that follows
/// it.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// The address of the instruction.
    pub address: u32,
    /// The instruction.
    pub instruction: Instruction,
    /// The address of the sequentially following instruction, if any.
    pub next: Option<u32>,
}

impl Location {
    /// Returns the address `offset` code units away from this location.
    #[must_use]
    pub fn branch_target(&self, offset: i32) -> Option<u32> {
        self.address.checked_add_signed(offset)
    }
}

/// The instructions of one method, indexed by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionGraph {
    locations: Vec<Location>,
    by_address: AHashMap<u32, usize>,
}

impl InstructionGraph {
    /// Lays out `instructions` sequentially starting at address 0.
    #[must_use]
    pub fn new(instructions: impl IntoIterator<Item = Instruction>) -> Self {
        let mut locations: Vec<Location> = Vec::new();
        let mut address = 0_u32;
        for instruction in instructions {
            let size = instruction.size();
            if let Some(previous) = locations.last_mut() {
                previous.next = Some(address);
            }
            locations.push(Location {
                address,
                instruction,
                next: None,
            });
            address = address.saturating_add(size);
        }
        let by_address = locations
            .iter()
            .enumerate()
            .map(|(index, location)| (location.address, index))
            .collect();
        Self {
            locations,
            by_address,
        }
    }

    /// Returns the location at `address`.
    #[must_use]
    pub fn location(&self, address: u32) -> Option<&Location> {
        self.by_address
            .get(&address)
            .map(|index| &self.locations[*index])
    }

    /// Returns the address following the instruction at `address`.
    #[must_use]
    pub fn next_address(&self, address: u32) -> Option<u32> {
        self.location(address).and_then(|location| location.next)
    }

    /// Returns an iterator over every location in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.iter()
    }

    /// Returns the number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Returns true if the method has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
