//! Symbolic values and type descriptors.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::exception::ExceptionModel;

/// A Dalvik type descriptor, such as `I`, `[I`, or `Ljava/lang/String;`.
///
/// The descriptor `?` names a type that is itself unknown.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(Arc<str>);

impl TypeName {
    /// The descriptor used when a value's type cannot be determined.
    pub const UNKNOWN: &'static str = "?";
    /// `java.lang.Object`.
    pub const OBJECT: &'static str = "Ljava/lang/Object;";
    /// `java.lang.String`.
    pub const STRING: &'static str = "Ljava/lang/String;";
    /// `java.lang.Class`.
    pub const CLASS: &'static str = "Ljava/lang/Class;";
    /// The `void` return type.
    pub const VOID: &'static str = "V";

    /// Returns a type for `descriptor`.
    #[must_use]
    pub fn new(descriptor: impl Into<Arc<str>>) -> Self {
        Self(descriptor.into())
    }

    /// Returns the unknown type.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    /// Returns the descriptor.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the unknown type.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        &*self.0 == Self::UNKNOWN
    }

    /// Returns true if this is the `void` type.
    #[must_use]
    pub fn is_void(&self) -> bool {
        &*self.0 == Self::VOID
    }

    /// Returns true if this descriptor names an array type.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.0.starts_with('[')
    }

    /// Returns true for the primitive descriptors `Z B S C I J F D`.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(&*self.0, "Z" | "B" | "S" | "C" | "I" | "J" | "F" | "D")
    }

    /// Returns true for types that occupy a register pair.
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(&*self.0, "J" | "D")
    }

    /// Returns true for types that fit in a 32-bit integer register.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(&*self.0, "Z" | "B" | "S" | "C" | "I")
    }

    /// Returns this type with one array dimension stripped.
    ///
    /// The unknown type has no structure to strip and is returned as-is.
    #[must_use]
    pub fn inner_type(&self) -> TypeName {
        match self.0.strip_prefix('[') {
            Some(inner) if !self.is_unknown() => Self::new(inner),
            _ => self.clone(),
        }
    }

    /// Returns the array type whose elements are of this type.
    #[must_use]
    pub fn array_of(&self) -> TypeName {
        Self::new(format!("[{}", self.0))
    }

    /// Returns the name a Java class loader would use for this type.
    ///
    /// `Ljava/lang/String;` becomes `java.lang.String`, arrays keep their
    /// descriptor form with dots, and primitives use their keyword.
    #[must_use]
    pub fn binary_name(&self) -> String {
        if self.is_array() {
            return self.0.replace('/', ".");
        }
        match &*self.0 {
            "Z" => String::from("boolean"),
            "B" => String::from("byte"),
            "S" => String::from("short"),
            "C" => String::from("char"),
            "I" => String::from("int"),
            "J" => String::from("long"),
            "F" => String::from("float"),
            "D" => String::from("double"),
            "V" => String::from("void"),
            other => other
                .strip_prefix('L')
                .and_then(|name| name.strip_suffix(';'))
                .unwrap_or(other)
                .replace('/', "."),
        }
    }

    /// Returns the descriptor for a Java binary name.
    #[must_use]
    pub fn from_binary_name(name: &str) -> TypeName {
        let descriptor = match name {
            "boolean" => String::from("Z"),
            "byte" => String::from("B"),
            "short" => String::from("S"),
            "char" => String::from("C"),
            "int" => String::from("I"),
            "long" => String::from("J"),
            "float" => String::from("F"),
            "double" => String::from("D"),
            "void" => String::from("V"),
            array if array.starts_with('[') => array.replace('.', "/"),
            class => format!("L{};", class.replace('.', "/")),
        };
        Self::new(descriptor)
    }

    /// Returns the value a field or array element of this type holds before
    /// anything is stored in it.
    #[must_use]
    pub fn default_value(&self) -> Value {
        let payload = match &*self.0 {
            Self::UNKNOWN => return Value::unknown(self.clone()),
            "Z" => Payload::Boolean(false),
            "B" => Payload::Byte(0),
            "S" => Payload::Short(0),
            "C" => Payload::Char(0),
            "I" => Payload::Int(0),
            "J" => Payload::Long(0),
            "F" => Payload::Float(0.),
            "D" => Payload::Double(0.),
            _ => Payload::Null,
        };
        Value::wrap(payload, self.clone())
    }
}

impl From<&str> for TypeName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TypeName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

/// The concrete content of a known [`Value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// The null reference.
    Null,
    /// A `boolean`.
    Boolean(bool),
    /// A `byte`.
    Byte(i8),
    /// A `short`.
    Short(i16),
    /// A `char`.
    Char(u16),
    /// An `int`.
    Int(i32),
    /// A `long`.
    Long(i64),
    /// A `float`.
    Float(f32),
    /// A `double`.
    Double(f64),
    /// A `java.lang.String`.
    String(Arc<str>),
    /// A `java.lang.Class` handle for the contained type.
    Class(TypeName),
    /// An array whose elements are all known.
    Array(Arc<[Value]>),
    /// An object whose fields are not tracked.
    Instance,
    /// A throwable created by the engine.
    Throwable(Arc<ExceptionModel>),
}

/// Whether a [`Value`] is known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Content {
    /// The value depends on something that could not be determined.
    Unknown,
    /// The value is statically known.
    Known(Payload),
}

/// The content of one register or field.
///
/// A value is either fully known or fully unknown. Values are never mutated;
/// registers are rebound to new values instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    ty: TypeName,
    content: Content,
}

impl Value {
    /// Returns a known value.
    #[must_use]
    pub fn wrap(payload: Payload, ty: impl Into<TypeName>) -> Self {
        Self {
            ty: ty.into(),
            content: Content::Known(payload),
        }
    }

    /// Returns an unknown value of type `ty`.
    #[must_use]
    pub fn unknown(ty: impl Into<TypeName>) -> Self {
        Self {
            ty: ty.into(),
            content: Content::Unknown,
        }
    }

    /// Returns a null reference of type `ty`.
    #[must_use]
    pub fn null(ty: impl Into<TypeName>) -> Self {
        Self::wrap(Payload::Null, ty)
    }

    /// Returns a known `int`.
    #[must_use]
    pub fn int(value: i32) -> Self {
        Self::wrap(Payload::Int(value), "I")
    }

    /// Returns a known `long`.
    #[must_use]
    pub fn long(value: i64) -> Self {
        Self::wrap(Payload::Long(value), "J")
    }

    /// Returns a known `boolean`.
    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self::wrap(Payload::Boolean(value), "Z")
    }

    /// Returns a known string.
    #[must_use]
    pub fn string(value: &str) -> Self {
        Self::wrap(Payload::String(Arc::from(value)), TypeName::STRING)
    }

    /// Returns a known `java.lang.Class` for `class`.
    #[must_use]
    pub fn class(class: TypeName) -> Self {
        Self::wrap(Payload::Class(class), TypeName::CLASS)
    }

    /// Returns a known object of `class` whose fields are not tracked.
    #[must_use]
    pub fn instance(class: impl Into<TypeName>) -> Self {
        Self::wrap(Payload::Instance, class)
    }

    /// Returns an array of `elements`, typed as an array of `element`.
    ///
    /// The array is unknown if any element is unknown.
    #[must_use]
    pub fn array(element: impl Into<TypeName>, elements: impl IntoIterator<Item = Value>) -> Self {
        let ty = element.into().array_of();
        let elements = elements.into_iter().collect::<Arc<[Value]>>();
        if elements.iter().any(Value::is_unknown) {
            Self::unknown(ty)
        } else {
            Self::wrap(Payload::Array(elements), ty)
        }
    }

    /// Returns this value's type.
    #[must_use]
    pub const fn ty(&self) -> &TypeName {
        &self.ty
    }

    /// Returns this value's content.
    #[must_use]
    pub const fn content(&self) -> &Content {
        &self.content
    }

    /// Returns the payload if this value is known.
    #[must_use]
    pub const fn payload(&self) -> Option<&Payload> {
        match &self.content {
            Content::Known(payload) => Some(payload),
            Content::Unknown => None,
        }
    }

    /// Returns true if this value is unknown.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self.content, Content::Unknown)
    }

    /// Returns true if this value is a known null reference.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self.content, Content::Known(Payload::Null))
    }

    /// Returns true if this value is a known reference to something that can
    /// be mutated through another register.
    #[must_use]
    pub const fn is_mutable_reference(&self) -> bool {
        matches!(
            self.content,
            Content::Known(Payload::Array(_) | Payload::Instance)
        )
    }

    /// Returns this value as a 32-bit integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is unknown or is not integer-compatible.
    pub fn as_integer(&self) -> Result<i32, TypeError> {
        match self.payload() {
            None => Err(TypeError::Unknown(self.ty.clone())),
            Some(Payload::Int(value)) => Ok(*value),
            Some(Payload::Short(value)) => Ok(i32::from(*value)),
            Some(Payload::Byte(value)) => Ok(i32::from(*value)),
            Some(Payload::Char(value)) => Ok(i32::from(*value)),
            Some(Payload::Boolean(value)) => Ok(i32::from(*value)),
            Some(_) => Err(TypeError::Mismatch {
                expected: "integer",
                found: self.ty.clone(),
            }),
        }
    }

    /// Returns this value as a 64-bit integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is unknown or is not integral.
    pub fn as_long(&self) -> Result<i64, TypeError> {
        match self.payload() {
            Some(Payload::Long(value)) => Ok(*value),
            _ => self.as_integer().map(i64::from),
        }
    }

    /// Returns the elements of a known array, or `None` for any other value.
    #[must_use]
    pub fn elements(&self) -> Option<&Arc<[Value]>> {
        match self.payload() {
            Some(Payload::Array(elements)) => Some(elements),
            _ => None,
        }
    }

    /// Returns the contents of a known string, or `None` for any other value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self.payload() {
            Some(Payload::String(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns this value with its type replaced by `ty`.
    #[must_use]
    pub fn retype(self, ty: impl Into<TypeName>) -> Self {
        Self {
            ty: ty.into(),
            content: self.content,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.content {
            Content::Unknown => write!(f, "<unknown {}>", self.ty),
            Content::Known(Payload::Null) => write!(f, "null ({})", self.ty),
            Content::Known(Payload::Boolean(value)) => write!(f, "{value}"),
            Content::Known(Payload::Byte(value)) => write!(f, "{value}"),
            Content::Known(Payload::Short(value)) => write!(f, "{value}"),
            Content::Known(Payload::Char(value)) => match char::from_u32(u32::from(*value)) {
                Some(ch) => write!(f, "{ch:?}"),
                None => write!(f, "\\u{value:04x}"),
            },
            Content::Known(Payload::Int(value)) => write!(f, "{value}"),
            Content::Known(Payload::Long(value)) => write!(f, "{value}L"),
            Content::Known(Payload::Float(value)) => write!(f, "{value}f"),
            Content::Known(Payload::Double(value)) => write!(f, "{value}"),
            Content::Known(Payload::String(value)) => write!(f, "{value:?}"),
            Content::Known(Payload::Class(class)) => write!(f, "class {}", class.binary_name()),
            Content::Known(Payload::Array(elements)) => {
                f.write_str("[")?;
                for (index, element) in elements.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    Display::fmt(element, f)?;
                }
                f.write_str("]")
            }
            Content::Known(Payload::Instance) => write!(f, "instance of {}", self.ty),
            Content::Known(Payload::Throwable(exception)) => Display::fmt(exception, f),
        }
    }
}

/// A value could not be interpreted as the type an operation required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// The value is unknown.
    Unknown(TypeName),
    /// The value is known but has an incompatible type.
    Mismatch {
        /// A description of what was expected.
        expected: &'static str,
        /// The type that was found.
        found: TypeName,
    },
}

impl Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::Unknown(ty) => write!(f, "value of type {ty} is unknown"),
            TypeError::Mismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for TypeError {}
