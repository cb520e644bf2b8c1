//! Operator attributes that SPMD rules may depend on (e.g., whether a matrix multiplication operand is transposed).

use std::{collections::HashMap, fmt::Display};

use crate::errors::Error;

/// Value of a single operator attribute.
#[derive(Clone, Debug, PartialEq)]
pub enum Attribute {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bools(Vec<bool>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl Attribute {
    /// Name of the type of this attribute, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bools(_) => "bools",
            Self::Ints(_) => "ints",
            Self::Strings(_) => "strings",
        }
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Bools(values) => write!(f, "{values:?}"),
            Self::Ints(values) => write!(f, "{values:?}"),
            Self::Strings(values) => write!(f, "{values:?}"),
        }
    }
}

macro_rules! impl_from_for_attribute {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Attribute {
            fn from(value: $ty) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

impl_from_for_attribute!(bool, Bool);
impl_from_for_attribute!(i64, Int);
impl_from_for_attribute!(f64, Float);
impl_from_for_attribute!(String, String);
impl_from_for_attribute!(&str, String);
impl_from_for_attribute!(Vec<bool>, Bools);
impl_from_for_attribute!(Vec<i64>, Ints);
impl_from_for_attribute!(Vec<String>, Strings);

/// Attributes of an operator, keyed by attribute name.
pub type AttributeMap = HashMap<String, Attribute>;

fn invalid_attribute_type(name: &str, expected: &str, got: &Attribute) -> Error {
    Error::InvalidAttributeType {
        name: name.to_string(),
        expected: expected.to_string(),
        got: got.type_name().to_string(),
    }
}

/// Returns the boolean attribute `name`, or `default` if it is not present.
pub fn get_bool(attributes: &AttributeMap, name: &str, default: bool) -> Result<bool, Error> {
    match attributes.get(name) {
        None => Ok(default),
        Some(Attribute::Bool(value)) => Ok(*value),
        Some(attribute) => Err(invalid_attribute_type(name, "bool", attribute)),
    }
}

/// Returns the integer attribute `name`, or `default` if it is not present.
pub fn get_int(attributes: &AttributeMap, name: &str, default: i64) -> Result<i64, Error> {
    match attributes.get(name) {
        None => Ok(default),
        Some(Attribute::Int(value)) => Ok(*value),
        Some(attribute) => Err(invalid_attribute_type(name, "int", attribute)),
    }
}

/// Returns the integer list attribute `name`. A single integer is accepted as a list with one element.
pub fn get_ints(attributes: &AttributeMap, name: &str) -> Result<Vec<i64>, Error> {
    match attributes.get(name) {
        None => Err(Error::MissingAttribute { name: name.to_string() }),
        Some(Attribute::Ints(values)) => Ok(values.clone()),
        Some(Attribute::Int(value)) => Ok(vec![*value]),
        Some(attribute) => Err(invalid_attribute_type(name, "ints", attribute)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn attributes() -> AttributeMap {
        AttributeMap::from([
            ("trans_x".to_string(), Attribute::from(true)),
            ("axis".to_string(), Attribute::from(vec![0i64, -1])),
            ("input_count".to_string(), Attribute::from(3i64)),
            ("name".to_string(), Attribute::from("matmul")),
        ])
    }

    #[test]
    fn test_get_bool() {
        let attributes = attributes();
        assert_eq!(get_bool(&attributes, "trans_x", false), Ok(true));
        assert_eq!(get_bool(&attributes, "trans_y", false), Ok(false));
        assert_eq!(
            get_bool(&attributes, "axis", false),
            Err(Error::InvalidAttributeType {
                name: "axis".to_string(),
                expected: "bool".to_string(),
                got: "ints".to_string(),
            }),
        );
    }

    #[test]
    fn test_get_int_and_ints() {
        let attributes = attributes();
        assert_eq!(get_int(&attributes, "input_count", 2), Ok(3));
        assert_eq!(get_int(&attributes, "missing", 2), Ok(2));
        assert!(matches!(get_int(&attributes, "name", 2), Err(Error::InvalidAttributeType { .. })));
        assert_eq!(get_ints(&attributes, "axis"), Ok(vec![0, -1]));
        assert_eq!(get_ints(&attributes, "input_count"), Ok(vec![3]));
        assert_eq!(get_ints(&attributes, "dims"), Err(Error::MissingAttribute { name: "dims".to_string() }));
    }

    #[test]
    fn test_attribute_display() {
        assert_eq!(Attribute::from(true).to_string(), "true");
        assert_eq!(Attribute::from(1.5).to_string(), "1.5");
        assert_eq!(Attribute::from("sum").to_string(), "\"sum\"");
        assert_eq!(Attribute::from(vec![1i64, 2]).to_string(), "[1, 2]");
        assert_eq!(Attribute::Strings(vec!["a".to_string()]).to_string(), "[\"a\"]");
    }
}
