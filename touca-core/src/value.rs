//! # Typed Value Model
//!
//! Every value captured by a workflow is converted into a [`TypedValue`] before it
//! is stored in a test case. Conversion happens in one of two ways:
//!
//! ```text
//! +---------------------+                      +---------------------+
//! | primitives, Vec,    | -- ToTypedValue ---> |                     |
//! | maps, TypedValue    |                      |                     |
//! +---------------------+                      |     TypedValue      |
//! +---------------------+      registered?     |                     |
//! | any T: Serialize    | --+-- yes: converter |                     |
//! |                     |   +-- no: serde ---> |                     |
//! +---------------------+                      +---------------------+
//! ```
//!
//! Types owned by the caller implement [`ToTypedValue`]. Third-party types that
//! cannot implement the trait are handled by [`TypeRegistry`], which looks up a
//! converter by `TypeId` and otherwise walks the value's serialized fields.

use base64::Engine;
use indexmap::IndexMap;
use serde::Serialize;
use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use crate::{Error, Result};

/// Uniform representation of a captured value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Decimal(f64),
    String(String),
    /// Raw bytes, e.g. the content of a file captured with `check_file`.
    Blob(Vec<u8>),
    Array(Vec<TypedValue>),
    Object(IndexMap<String, TypedValue>),
}

impl TypedValue {
    /// Human readable name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            TypedValue::Bool(_) => "a boolean",
            TypedValue::Int(_) => "an integer",
            TypedValue::Decimal(_) => "a decimal",
            TypedValue::String(_) => "a string",
            TypedValue::Blob(_) => "a blob",
            TypedValue::Array(_) => "an array",
            TypedValue::Object(_) => "an object",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            TypedValue::Bool(v) => Value::Bool(*v),
            TypedValue::Int(v) => Value::from(*v),
            TypedValue::Decimal(v) => {
                serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number)
            }
            TypedValue::String(v) => Value::String(v.clone()),
            TypedValue::Blob(v) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(v))
            }
            TypedValue::Array(v) => Value::Array(v.iter().map(TypedValue::to_json).collect()),
            TypedValue::Object(v) => Value::Object(
                v.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>(),
            ),
        }
    }

    /// Convert a JSON document into a typed value. `null` has no typed
    /// counterpart and is rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<TypedValue> {
        use serde_json::Value;
        Ok(match value {
            Value::Null => {
                return Err(Error::UnsupportedType(
                    "null values cannot be captured".to_string(),
                ))
            }
            Value::Bool(v) => TypedValue::Bool(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => TypedValue::Int(v),
                None => TypedValue::Decimal(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(v) => TypedValue::String(v.clone()),
            Value::Array(items) => TypedValue::Array(
                items
                    .iter()
                    .map(TypedValue::from_json)
                    .collect::<Result<_>>()?,
            ),
            Value::Object(fields) => TypedValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), TypedValue::from_json(v)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Structural conversion of any serializable value. This is the fallback
    /// used for types without a registered converter.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<TypedValue> {
        let json = serde_json::to_value(value).map_err(|e| {
            Error::UnsupportedType(format!(
                "{} cannot be converted: {e}",
                std::any::type_name::<T>()
            ))
        })?;
        TypedValue::from_json(&json).map_err(|e| match e {
            Error::UnsupportedType(reason) => Error::UnsupportedType(format!(
                "{}: {reason}",
                std::any::type_name::<T>()
            )),
            other => other,
        })
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Conversion into a [`TypedValue`].
pub trait ToTypedValue {
    fn to_typed_value(&self) -> TypedValue;
}

impl ToTypedValue for TypedValue {
    fn to_typed_value(&self) -> TypedValue {
        self.clone()
    }
}

impl ToTypedValue for bool {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Bool(*self)
    }
}

macro_rules! impl_signed {
    ($($t:ty),*) => {
        $(impl ToTypedValue for $t {
            fn to_typed_value(&self) -> TypedValue {
                TypedValue::Int(i64::from(*self))
            }
        })*
    };
}

impl_signed!(i8, i16, i32, i64, u8, u16, u32);

macro_rules! impl_wide {
    ($($t:ty),*) => {
        $(impl ToTypedValue for $t {
            fn to_typed_value(&self) -> TypedValue {
                match i64::try_from(*self) {
                    Ok(v) => TypedValue::Int(v),
                    Err(_) => TypedValue::Decimal(*self as f64),
                }
            }
        })*
    };
}

impl_wide!(u64, usize, isize, i128, u128);

impl ToTypedValue for f32 {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Decimal(f64::from(*self))
    }
}

impl ToTypedValue for f64 {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Decimal(*self)
    }
}

impl ToTypedValue for char {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::String(self.to_string())
    }
}

impl ToTypedValue for str {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::String(self.to_string())
    }
}

impl ToTypedValue for String {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::String(self.clone())
    }
}

impl ToTypedValue for serde_json::Value {
    fn to_typed_value(&self) -> TypedValue {
        match self {
            serde_json::Value::Null => TypedValue::String("null".to_string()),
            other => TypedValue::from_json(other)
                .unwrap_or_else(|_| TypedValue::String(other.to_string())),
        }
    }
}

impl<T: ToTypedValue + ?Sized> ToTypedValue for &T {
    fn to_typed_value(&self) -> TypedValue {
        (**self).to_typed_value()
    }
}

impl<T: ToTypedValue + ?Sized> ToTypedValue for Box<T> {
    fn to_typed_value(&self) -> TypedValue {
        (**self).to_typed_value()
    }
}

impl<T: ToTypedValue> ToTypedValue for [T] {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Array(self.iter().map(ToTypedValue::to_typed_value).collect())
    }
}

impl<T: ToTypedValue, const N: usize> ToTypedValue for [T; N] {
    fn to_typed_value(&self) -> TypedValue {
        self.as_slice().to_typed_value()
    }
}

impl<T: ToTypedValue> ToTypedValue for Vec<T> {
    fn to_typed_value(&self) -> TypedValue {
        self.as_slice().to_typed_value()
    }
}

impl<T: ToTypedValue> ToTypedValue for VecDeque<T> {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Array(self.iter().map(ToTypedValue::to_typed_value).collect())
    }
}

impl<T: ToTypedValue> ToTypedValue for BTreeSet<T> {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Array(self.iter().map(ToTypedValue::to_typed_value).collect())
    }
}

impl<T: ToTypedValue, S> ToTypedValue for HashSet<T, S> {
    /// Elements are ordered by their rendered form so that the same set always
    /// produces the same array.
    fn to_typed_value(&self) -> TypedValue {
        let mut items: Vec<_> = self.iter().map(ToTypedValue::to_typed_value).collect();
        items.sort_by_cached_key(|v| v.to_string());
        TypedValue::Array(items)
    }
}

impl<K: AsRef<str>, V: ToTypedValue> ToTypedValue for BTreeMap<K, V> {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Object(
            self.iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.to_typed_value()))
                .collect(),
        )
    }
}

impl<K: AsRef<str>, V: ToTypedValue, S> ToTypedValue for HashMap<K, V, S> {
    fn to_typed_value(&self) -> TypedValue {
        let mut fields: IndexMap<String, TypedValue> = self
            .iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.to_typed_value()))
            .collect();
        fields.sort_keys();
        TypedValue::Object(fields)
    }
}

impl<K: AsRef<str>, V: ToTypedValue, S> ToTypedValue for IndexMap<K, V, S> {
    fn to_typed_value(&self) -> TypedValue {
        TypedValue::Object(
            self.iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.to_typed_value()))
                .collect(),
        )
    }
}

type Converter = Arc<dyn Fn(&dyn Any) -> Option<TypedValue> + Send + Sync>;

/// Registry of custom converters keyed by type identity.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    converters: HashMap<TypeId, Converter>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("converters", &self.converters.len())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    /// Register a converter for `T`, replacing any previously registered one.
    pub fn register<T, F>(&mut self, converter: F)
    where
        T: Any,
        F: Fn(&T) -> TypedValue + Send + Sync + 'static,
    {
        self.converters.insert(
            TypeId::of::<T>(),
            Arc::new(move |value: &dyn Any| value.downcast_ref::<T>().map(&converter)),
        );
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.converters.contains_key(&TypeId::of::<T>())
    }

    /// Convert `value` with its registered converter, falling back to its
    /// serialized structure.
    pub fn transform<T: Serialize + Any>(&self, value: &T) -> Result<TypedValue> {
        if let Some(converter) = self.converters.get(&TypeId::of::<T>()) {
            if let Some(converted) = converter(value) {
                return Ok(converted);
            }
        }
        TypedValue::from_serialize(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[derive(Serialize)]
    struct Student {
        username: String,
        fullname: String,
        gpa: f64,
        courses: Vec<String>,
    }

    #[derive(Serialize)]
    struct Date {
        year: u32,
        month: u32,
        day: u32,
    }

    fn alice() -> Student {
        Student {
            username: "alice".into(),
            fullname: "Alice Anderson".into(),
            gpa: 3.9,
            courses: vec!["math".into(), "physics".into()],
        }
    }

    #[test_case(true.to_typed_value(), TypedValue::Bool(true); "bool")]
    #[test_case(42u8.to_typed_value(), TypedValue::Int(42); "small unsigned")]
    #[test_case(u64::MAX.to_typed_value(), TypedValue::Decimal(u64::MAX as f64); "wide unsigned")]
    #[test_case(1.5f32.to_typed_value(), TypedValue::Decimal(1.5); "float")]
    #[test_case("x".to_typed_value(), TypedValue::String("x".into()); "str")]
    #[test_case('y'.to_typed_value(), TypedValue::String("y".into()); "char")]
    fn primitives(actual: TypedValue, expected: TypedValue) {
        assert_eq!(actual, expected);
    }

    #[test]
    fn collections_keep_order() {
        let value = vec![3i64, 1, 2].to_typed_value();
        assert_eq!(
            value,
            TypedValue::Array(vec![
                TypedValue::Int(3),
                TypedValue::Int(1),
                TypedValue::Int(2)
            ])
        );

        let mut map = HashMap::new();
        map.insert("b", 2i64);
        map.insert("a", 1);
        let TypedValue::Object(fields) = map.to_typed_value() else {
            panic!("expected an object");
        };
        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn serde_fallback_builds_object_in_field_order() -> eyre::Result<()> {
        let value = TypeRegistry::new().transform(&alice())?;
        let TypedValue::Object(fields) = &value else {
            eyre::bail!("expected an object, got {value:?}");
        };
        assert_eq!(
            fields.keys().collect::<Vec<_>>(),
            vec!["username", "fullname", "gpa", "courses"]
        );
        assert_eq!(fields["gpa"], TypedValue::Decimal(3.9));
        Ok(())
    }

    #[test]
    fn registered_converter_takes_priority() -> eyre::Result<()> {
        let mut registry = TypeRegistry::new();
        registry.register(|d: &Date| {
            TypedValue::String(format!("{:04}-{:02}-{:02}", d.year, d.month, d.day))
        });
        assert!(registry.contains::<Date>());

        let date = Date {
            year: 2000,
            month: 1,
            day: 1,
        };
        assert_eq!(
            registry.transform(&date)?,
            TypedValue::String("2000-01-01".into())
        );
        Ok(())
    }

    #[test]
    fn null_is_rejected() {
        let err = TypeRegistry::new().transform(&Option::<i32>::None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)), "{err}");
    }

    #[test]
    fn blob_renders_as_base64() {
        let value = TypedValue::Blob(b"touca".to_vec());
        assert_eq!(value.to_json(), serde_json::json!("dG91Y2E="));
    }
}
