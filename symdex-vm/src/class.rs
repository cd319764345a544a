//! The class model: classes, fields, and methods available to executed code.
//!
//! Programs are described by [`Program`] definitions, which can be
//! deserialized with any serde format, and loaded into a [`ClassManager`].

use std::sync::Arc;

use ahash::AHashMap;
use kempt::Map;
use serde::{Deserialize, Serialize};

use crate::instruction::{FieldReference, Instruction, InstructionGraph, MethodReference};
use crate::value::{TypeName, Value};

/// Framework classes the engine knows the hierarchy of without them being
/// defined by the program.
const FRAMEWORK_CLASSES: &[(&str, Option<&str>)] = &[
    ("Ljava/lang/Object;", None),
    ("Ljava/lang/String;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Class;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Integer;", Some("Ljava/lang/Number;")),
    ("Ljava/lang/Long;", Some("Ljava/lang/Number;")),
    ("Ljava/lang/Number;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Boolean;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Character;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/StringBuilder;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/System;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Math;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Throwable;", Some("Ljava/lang/Object;")),
    ("Ljava/lang/Exception;", Some("Ljava/lang/Throwable;")),
    ("Ljava/lang/Error;", Some("Ljava/lang/Throwable;")),
    ("Ljava/lang/RuntimeException;", Some("Ljava/lang/Exception;")),
    ("Ljava/lang/ReflectiveOperationException;", Some("Ljava/lang/Exception;")),
    ("Ljava/lang/ClassNotFoundException;", Some("Ljava/lang/ReflectiveOperationException;")),
    ("Ljava/lang/LinkageError;", Some("Ljava/lang/Error;")),
    ("Ljava/lang/NoClassDefFoundError;", Some("Ljava/lang/LinkageError;")),
    ("Ljava/lang/NullPointerException;", Some("Ljava/lang/RuntimeException;")),
    ("Ljava/lang/IndexOutOfBoundsException;", Some("Ljava/lang/RuntimeException;")),
    ("Ljava/lang/ArrayIndexOutOfBoundsException;", Some("Ljava/lang/IndexOutOfBoundsException;")),
    ("Ljava/lang/NegativeArraySizeException;", Some("Ljava/lang/RuntimeException;")),
];

/// The deepest class hierarchy walked before giving up on a cycle.
const MAX_HIERARCHY_DEPTH: usize = 64;

/// A set of class definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    /// The classes in the program.
    #[serde(default)]
    pub classes: Vec<ClassDefinition>,
}

/// The definition of one class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDefinition {
    /// The class descriptor.
    pub name: TypeName,
    /// The superclass descriptor. Defaults to `java.lang.Object`.
    #[serde(default)]
    pub superclass: Option<TypeName>,
    /// The fields the class declares.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    /// The methods the class declares.
    #[serde(default)]
    pub methods: Vec<MethodDefinition>,
}

/// The definition of one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// The field's name.
    pub name: String,
    /// The field's type.
    pub ty: TypeName,
    /// The value the field holds before any code runs, from the class's
    /// static values table.
    #[serde(default)]
    pub initial: Option<Value>,
}

/// The definition of one method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDefinition {
    /// The method's name.
    pub name: String,
    /// The parameter types, excluding the receiver.
    #[serde(default)]
    pub parameters: Vec<TypeName>,
    /// The return type.
    pub return_type: TypeName,
    /// True for static methods.
    #[serde(default)]
    pub is_static: bool,
    /// The number of registers the method uses, including parameters.
    #[serde(default)]
    pub registers: u16,
    /// The method body. Methods without instructions have no
    /// implementation.
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    /// The exception handlers.
    #[serde(default)]
    pub try_blocks: Vec<TryBlock>,
}

/// A range of addresses protected by exception handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryBlock {
    /// The first protected address.
    pub start: u32,
    /// The address after the last protected instruction.
    pub end: u32,
    /// The handlers, in the order they are checked.
    pub handlers: Vec<Handler>,
}

/// One exception handler of a [`TryBlock`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    /// The caught class, or `None` to catch everything.
    #[serde(default)]
    pub exception: Option<TypeName>,
    /// The address of the handler code.
    pub address: u32,
}

/// All classes available to executed code.
#[derive(Debug, Default)]
pub struct ClassManager {
    classes: Map<TypeName, Arc<VirtualClass>>,
}

impl ClassManager {
    /// Returns an empty class manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a class manager containing every class in `program`.
    #[must_use]
    pub fn from_program(program: Program) -> Self {
        let mut manager = Self::new();
        for class in program.classes {
            manager.define(class);
        }
        manager
    }

    /// Adds `definition`, replacing any class with the same name.
    pub fn define(&mut self, definition: ClassDefinition) -> Arc<VirtualClass> {
        let class = Arc::new(VirtualClass::new(definition));
        self.classes.insert(class.name.clone(), class.clone());
        class
    }

    /// Returns the class named `name`, if the program defines it.
    #[must_use]
    pub fn class(&self, name: &TypeName) -> Option<&Arc<VirtualClass>> {
        self.classes.get(name)
    }

    /// Returns an iterator over every defined class.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<VirtualClass>> {
        self.classes.values()
    }

    /// Returns true if `name` is defined by the program or is a framework
    /// class the engine knows about.
    #[must_use]
    pub fn is_known(&self, name: &TypeName) -> bool {
        self.classes.contains(name)
            || FRAMEWORK_CLASSES
                .iter()
                .any(|(class, _)| *class == name.as_str())
    }

    /// Returns the superclass of `name`.
    #[must_use]
    pub fn superclass(&self, name: &TypeName) -> Option<TypeName> {
        if let Some(class) = self.class(name) {
            return class.superclass().cloned();
        }
        FRAMEWORK_CLASSES
            .iter()
            .find(|(class, _)| *class == name.as_str())
            .and_then(|(_, superclass)| superclass.map(TypeName::from))
    }

    /// Returns true if a value of class `class` can be stored where
    /// `ancestor` is expected.
    #[must_use]
    pub fn is_assignable(&self, class: &TypeName, ancestor: &TypeName) -> bool {
        let mut current = Some(class.clone());
        for _ in 0..MAX_HIERARCHY_DEPTH {
            match current {
                Some(candidate) if &candidate == ancestor => return true,
                Some(candidate) => current = self.superclass(&candidate),
                None => return false,
            }
        }
        false
    }

    /// Resolves `reference`, searching the named class and then its
    /// superclasses.
    #[must_use]
    pub fn method(&self, reference: &MethodReference) -> Option<&Arc<VirtualMethod>> {
        let signature = reference.signature();
        self.search(&reference.class, |class| class.method(&signature))
    }

    /// Resolves `reference`, searching the named class and then its
    /// superclasses.
    #[must_use]
    pub fn field(&self, reference: &FieldReference) -> Option<&VirtualField> {
        self.search(&reference.class, |class| class.field(&reference.name))
    }

    fn search<'a, T: 'a>(
        &'a self,
        start: &TypeName,
        mut find: impl FnMut(&'a VirtualClass) -> Option<&'a T>,
    ) -> Option<&'a T> {
        let mut current = self.class(start);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let class = current?;
            if let Some(found) = find(&**class) {
                return Some(found);
            }
            current = class.superclass().and_then(|name| self.class(name));
        }
        None
    }
}

/// A class defined by the program.
#[derive(Debug)]
pub struct VirtualClass {
    name: TypeName,
    superclass: Option<TypeName>,
    fields: AHashMap<String, VirtualField>,
    methods: AHashMap<String, Arc<VirtualMethod>>,
}

impl VirtualClass {
    fn new(definition: ClassDefinition) -> Self {
        let name = definition.name;
        let fields = definition
            .fields
            .into_iter()
            .map(|field| {
                (
                    field.name.clone(),
                    VirtualField {
                        reference: FieldReference {
                            class: name.clone(),
                            name: Arc::from(field.name),
                            ty: field.ty,
                        },
                        initial: field.initial,
                    },
                )
            })
            .collect();
        let methods = definition
            .methods
            .into_iter()
            .map(|method| {
                let method = VirtualMethod::new(&name, method);
                (method.reference.signature(), Arc::new(method))
            })
            .collect();
        Self {
            superclass: definition
                .superclass
                .or_else(|| Some(TypeName::from(TypeName::OBJECT)))
                .filter(|superclass| superclass != &name),
            name,
            fields,
            methods,
        }
    }

    /// Returns the class descriptor.
    #[must_use]
    pub const fn name(&self) -> &TypeName {
        &self.name
    }

    /// Returns the superclass descriptor.
    #[must_use]
    pub const fn superclass(&self) -> Option<&TypeName> {
        self.superclass.as_ref()
    }

    /// Returns the field declared with `name`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&VirtualField> {
        self.fields.get(name)
    }

    /// Returns the method declared with `signature`, such as `<clinit>()V`.
    #[must_use]
    pub fn method(&self, signature: &str) -> Option<&Arc<VirtualMethod>> {
        self.methods.get(signature)
    }

    /// Returns the static initializer, if the class declares one.
    #[must_use]
    pub fn class_initializer(&self) -> Option<&Arc<VirtualMethod>> {
        self.method("<clinit>()V")
    }
}

/// A field declared by a [`VirtualClass`].
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualField {
    reference: FieldReference,
    initial: Option<Value>,
}

impl VirtualField {
    /// Returns a reference to this field through its declaring class.
    #[must_use]
    pub const fn reference(&self) -> &FieldReference {
        &self.reference
    }

    /// Returns the class that declares this field.
    #[must_use]
    pub const fn defining_class(&self) -> &TypeName {
        &self.reference.class
    }

    /// Returns the field's type.
    #[must_use]
    pub const fn ty(&self) -> &TypeName {
        &self.reference.ty
    }

    /// Returns the value the field holds before any code stores to it.
    #[must_use]
    pub fn initial_value(&self) -> Value {
        self.initial
            .clone()
            .unwrap_or_else(|| self.reference.ty.default_value())
    }
}

/// A method declared by a [`VirtualClass`].
#[derive(Debug)]
pub struct VirtualMethod {
    reference: MethodReference,
    is_static: bool,
    registers: u16,
    implementation: Option<InstructionGraph>,
    try_blocks: Vec<TryBlock>,
}

impl VirtualMethod {
    fn new(class: &TypeName, definition: MethodDefinition) -> Self {
        let reference = MethodReference {
            class: class.clone(),
            name: Arc::from(definition.name),
            parameters: definition.parameters,
            return_type: definition.return_type,
        };
        let implementation = if definition.instructions.is_empty() {
            None
        } else {
            Some(InstructionGraph::new(definition.instructions))
        };
        let minimum = parameter_register_count(&reference.parameters, definition.is_static);
        Self {
            reference,
            is_static: definition.is_static,
            registers: definition.registers.max(minimum),
            implementation,
            try_blocks: definition.try_blocks,
        }
    }

    /// Returns a reference to this method through its declaring class.
    #[must_use]
    pub const fn reference(&self) -> &MethodReference {
        &self.reference
    }

    /// Returns true for static methods.
    #[must_use]
    pub const fn is_static(&self) -> bool {
        self.is_static
    }

    /// Returns the number of registers the method uses.
    #[must_use]
    pub const fn register_count(&self) -> u16 {
        self.registers
    }

    /// Returns the method body, or `None` for methods without one.
    #[must_use]
    pub const fn implementation(&self) -> Option<&InstructionGraph> {
        self.implementation.as_ref()
    }

    /// Returns the exception handlers.
    #[must_use]
    pub fn try_blocks(&self) -> &[TryBlock] {
        &self.try_blocks
    }

    /// Returns the handlers whose try block covers `address`, in the order
    /// they are checked.
    pub fn handlers_at(&self, address: u32) -> impl Iterator<Item = &Handler> {
        self.try_blocks
            .iter()
            .filter(move |block| (block.start..block.end).contains(&address))
            .flat_map(|block| block.handlers.iter())
    }
}

/// Returns the number of registers occupied by parameters of the given
/// types, plus the receiver for instance methods.
#[must_use]
pub fn parameter_register_count(parameters: &[TypeName], is_static: bool) -> u16 {
    let receiver = u16::from(!is_static);
    parameters.iter().fold(receiver, |count, ty| {
        count.saturating_add(if ty.is_wide() { 2 } else { 1 })
    })
}
