//! Guest exceptions: what the executed program would throw.

use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::{Payload, TypeName, Value};

/// The kinds of exceptions the engine can raise on behalf of the executed
/// program.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ExceptionKind {
    /// A null reference was dereferenced.
    NullPointer,
    /// An array index was negative or not less than the array's length.
    ArrayIndexOutOfBounds,
    /// An array was allocated with a negative length.
    NegativeArraySize,
    /// Reflection could not find a class by name.
    ClassNotFound,
    /// A class referenced by the code could not be linked.
    NoClassDefFound,
    /// The program threw a value with `throw`.
    Thrown,
}

impl ExceptionKind {
    /// Returns the class descriptor for this kind.
    ///
    /// [`ExceptionKind::Thrown`] has no fixed class; it reports
    /// `java.lang.Throwable`.
    #[must_use]
    pub const fn class_descriptor(self) -> &'static str {
        match self {
            ExceptionKind::NullPointer => "Ljava/lang/NullPointerException;",
            ExceptionKind::ArrayIndexOutOfBounds => "Ljava/lang/ArrayIndexOutOfBoundsException;",
            ExceptionKind::NegativeArraySize => "Ljava/lang/NegativeArraySizeException;",
            ExceptionKind::ClassNotFound => "Ljava/lang/ClassNotFoundException;",
            ExceptionKind::NoClassDefFound => "Ljava/lang/NoClassDefFoundError;",
            ExceptionKind::Thrown => "Ljava/lang/Throwable;",
        }
    }
}

/// One exception that fires on an execution path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionModel {
    kind: ExceptionKind,
    class: TypeName,
    address: u32,
    message: Option<Arc<str>>,
    value: Option<Value>,
}

impl ExceptionModel {
    /// Returns the kind of exception.
    #[must_use]
    pub const fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// Returns the exception's class.
    #[must_use]
    pub const fn class(&self) -> &TypeName {
        &self.class
    }

    /// Returns the address of the op that raised this exception.
    #[must_use]
    pub const fn address(&self) -> u32 {
        self.address
    }

    /// Returns the detail message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the value the program threw, for [`ExceptionKind::Thrown`].
    #[must_use]
    pub const fn thrown_value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Returns the value a `move-exception` observes for this exception.
    #[must_use]
    pub fn as_value(&self) -> Value {
        match &self.value {
            Some(value) => value.clone(),
            None => Value::wrap(
                Payload::Throwable(Arc::new(self.clone())),
                self.class.clone(),
            ),
        }
    }
}

impl Display for ExceptionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class.binary_name())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        write!(f, " @{}", self.address)
    }
}

/// Builds [`ExceptionModel`]s with the messages the Android runtime uses.
#[derive(Debug, Default, Clone)]
pub struct ExceptionFactory {
    _private: (),
}

impl ExceptionFactory {
    /// Returns a new factory.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Returns an exception of `kind` raised by the op at `address`, without
    /// a detail message.
    #[must_use]
    pub fn build(&self, address: u32, kind: ExceptionKind) -> ExceptionModel {
        ExceptionModel {
            kind,
            class: TypeName::new(kind.class_descriptor()),
            address,
            message: None,
            value: None,
        }
    }

    /// Returns an exception of `kind` with a detail message.
    #[must_use]
    pub fn with_message(
        &self,
        address: u32,
        kind: ExceptionKind,
        message: impl Into<Arc<str>>,
    ) -> ExceptionModel {
        ExceptionModel {
            message: Some(message.into()),
            ..self.build(address, kind)
        }
    }

    /// Returns a null-dereference exception.
    #[must_use]
    pub fn null_pointer(&self, address: u32, message: impl Into<Arc<str>>) -> ExceptionModel {
        self.with_message(address, ExceptionKind::NullPointer, message)
    }

    /// Returns an out-of-bounds exception for `index` into an array of
    /// `length` elements.
    #[must_use]
    pub fn out_of_bounds(&self, address: u32, length: usize, index: i32) -> ExceptionModel {
        self.with_message(
            address,
            ExceptionKind::ArrayIndexOutOfBounds,
            format!("length={length}; index={index}"),
        )
    }

    /// Returns an exception for the program throwing `value`.
    #[must_use]
    pub fn thrown(&self, address: u32, value: Value) -> ExceptionModel {
        ExceptionModel {
            kind: ExceptionKind::Thrown,
            class: value.ty().clone(),
            address,
            message: None,
            value: Some(value),
        }
    }
}
