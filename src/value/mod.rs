//! Message values.
//!
//! [`MsgValue`] is the typed payload carried by method calls, replies,
//! signals and property accesses. Conformance to a [`SigType`] is checked at
//! the edges: when a proxy sends, when a handler replies and when the router
//! receives arguments. JSON conversion is guided by the declared signature so
//! that script numbers land in the right integer width.

use crate::core::error::ValueError;
use crate::signature::{SigType, Signature};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MsgValue {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<MsgValue>),
    Array(Vec<MsgValue>),
    Struct(Vec<MsgValue>),
    Dict(Vec<(MsgValue, MsgValue)>),
}

impl MsgValue {
    /// Wrap a value in a variant.
    pub fn variant(value: impl Into<MsgValue>) -> Self {
        MsgValue::Variant(Box::new(value.into()))
    }

    /// Whether this value is acceptable where `ty` is declared.
    ///
    /// Empty arrays and dictionaries conform to any array or dictionary type.
    pub fn conforms(&self, ty: &SigType) -> bool {
        match (self, ty) {
            (MsgValue::Byte(_), SigType::Byte)
            | (MsgValue::Bool(_), SigType::Bool)
            | (MsgValue::Int16(_), SigType::Int16)
            | (MsgValue::UInt16(_), SigType::UInt16)
            | (MsgValue::Int32(_), SigType::Int32)
            | (MsgValue::UInt32(_), SigType::UInt32)
            | (MsgValue::Int64(_), SigType::Int64)
            | (MsgValue::UInt64(_), SigType::UInt64)
            | (MsgValue::Double(_), SigType::Double)
            | (MsgValue::Str(_), SigType::String)
            | (MsgValue::ObjectPath(_), SigType::ObjectPath) => true,
            (MsgValue::Signature(s), SigType::Signature) => Signature::parse(s).is_ok(),
            (MsgValue::Variant(inner), SigType::Variant) => inner.infer_type().is_some(),
            (MsgValue::Array(items), SigType::Array(elem)) => {
                items.iter().all(|item| item.conforms(elem))
            }
            (MsgValue::Struct(fields), SigType::Struct(types)) => {
                fields.len() == types.len()
                    && fields.iter().zip(types).all(|(f, t)| f.conforms(t))
            }
            (MsgValue::Dict(entries), SigType::Dict(k, v)) => entries
                .iter()
                .all(|(key, value)| key.conforms(k) && value.conforms(v)),
            _ => false,
        }
    }

    /// The type this value would be sent as inside a variant.
    ///
    /// Arrays take the type of their first element; an empty array is `av`.
    /// Returns `None` for heterogeneous containers.
    pub fn infer_type(&self) -> Option<SigType> {
        Some(match self {
            MsgValue::Byte(_) => SigType::Byte,
            MsgValue::Bool(_) => SigType::Bool,
            MsgValue::Int16(_) => SigType::Int16,
            MsgValue::UInt16(_) => SigType::UInt16,
            MsgValue::Int32(_) => SigType::Int32,
            MsgValue::UInt32(_) => SigType::UInt32,
            MsgValue::Int64(_) => SigType::Int64,
            MsgValue::UInt64(_) => SigType::UInt64,
            MsgValue::Double(_) => SigType::Double,
            MsgValue::Str(_) => SigType::String,
            MsgValue::ObjectPath(_) => SigType::ObjectPath,
            MsgValue::Signature(_) => SigType::Signature,
            MsgValue::Variant(_) => SigType::Variant,
            MsgValue::Array(items) => {
                let elem = match items.first() {
                    None => SigType::Variant,
                    Some(first) => first.infer_type()?,
                };
                if !items.iter().all(|i| i.conforms(&elem)) {
                    return None;
                }
                SigType::Array(Box::new(elem))
            }
            MsgValue::Struct(fields) => SigType::Struct(
                fields
                    .iter()
                    .map(MsgValue::infer_type)
                    .collect::<Option<Vec<_>>>()?,
            ),
            MsgValue::Dict(entries) => {
                let (k, v) = match entries.first() {
                    None => (SigType::String, SigType::Variant),
                    Some((k, v)) => (k.infer_type()?, v.infer_type()?),
                };
                if !k.is_basic()
                    || !entries.iter().all(|(ek, ev)| ek.conforms(&k) && ev.conforms(&v))
                {
                    return None;
                }
                SigType::Dict(Box::new(k), Box::new(v))
            }
        })
    }

    /// Short type label used in mismatch messages.
    pub fn type_label(&self) -> String {
        self.infer_type()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "<mixed>".to_string())
    }

    /// Strip any number of variant wrappers.
    pub fn into_inner(self) -> MsgValue {
        match self {
            MsgValue::Variant(inner) => inner.into_inner(),
            other => other,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MsgValue::Str(s) | MsgValue::ObjectPath(s) | MsgValue::Signature(s) => Some(s),
            MsgValue::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MsgValue::Bool(b) => Some(*b),
            MsgValue::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    /// Any integer value widened to `i64`. `UInt64` values above `i64::MAX`
    /// yield `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MsgValue::Byte(v) => Some(i64::from(*v)),
            MsgValue::Int16(v) => Some(i64::from(*v)),
            MsgValue::UInt16(v) => Some(i64::from(*v)),
            MsgValue::Int32(v) => Some(i64::from(*v)),
            MsgValue::UInt32(v) => Some(i64::from(*v)),
            MsgValue::Int64(v) => Some(*v),
            MsgValue::UInt64(v) => i64::try_from(*v).ok(),
            MsgValue::Variant(inner) => inner.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MsgValue::Double(d) => Some(*d),
            MsgValue::UInt64(v) => Some(*v as f64),
            MsgValue::Variant(inner) => inner.as_f64(),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Look up a string-keyed dictionary entry.
    pub fn dict_get(&self, key: &str) -> Option<&MsgValue> {
        match self {
            MsgValue::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            MsgValue::Variant(inner) => inner.dict_get(key),
            _ => None,
        }
    }

    /// Convert to plain JSON. Variants are transparent, dictionaries with
    /// string keys become objects, other dictionaries become `[key, value]`
    /// pairs.
    pub fn to_json(&self) -> Json {
        match self {
            MsgValue::Byte(v) => Json::from(*v),
            MsgValue::Bool(v) => Json::Bool(*v),
            MsgValue::Int16(v) => Json::from(*v),
            MsgValue::UInt16(v) => Json::from(*v),
            MsgValue::Int32(v) => Json::from(*v),
            MsgValue::UInt32(v) => Json::from(*v),
            MsgValue::Int64(v) => Json::from(*v),
            MsgValue::UInt64(v) => Json::from(*v),
            MsgValue::Double(v) => Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
            MsgValue::Str(s) | MsgValue::ObjectPath(s) | MsgValue::Signature(s) => {
                Json::String(s.clone())
            }
            MsgValue::Variant(inner) => inner.to_json(),
            MsgValue::Array(items) | MsgValue::Struct(items) => {
                Json::Array(items.iter().map(MsgValue::to_json).collect())
            }
            MsgValue::Dict(entries) => {
                if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                    let mut map = Map::new();
                    for (k, v) in entries {
                        if let Some(key) = k.as_str() {
                            map.insert(key.to_string(), v.to_json());
                        }
                    }
                    Json::Object(map)
                } else {
                    Json::Array(
                        entries
                            .iter()
                            .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                            .collect(),
                    )
                }
            }
        }
    }

    /// Convert JSON into a value of the declared type.
    pub fn from_json(json: &Json, ty: &SigType) -> Result<MsgValue, ValueError> {
        let mismatch = || ValueError::TypeMismatch {
            expected: ty.to_string(),
            found: json_kind(json).to_string(),
        };
        Ok(match ty {
            SigType::Byte => MsgValue::Byte(int_from_json(json, ty, "byte")?),
            SigType::Int16 => MsgValue::Int16(int_from_json(json, ty, "int16")?),
            SigType::UInt16 => MsgValue::UInt16(int_from_json(json, ty, "uint16")?),
            SigType::Int32 => MsgValue::Int32(int_from_json(json, ty, "int32")?),
            SigType::UInt32 => MsgValue::UInt32(int_from_json(json, ty, "uint32")?),
            SigType::Int64 => MsgValue::Int64(int_from_json(json, ty, "int64")?),
            SigType::UInt64 => match json.as_u64() {
                Some(v) => MsgValue::UInt64(v),
                None => return Err(mismatch()),
            },
            SigType::Bool => match json {
                Json::Bool(b) => MsgValue::Bool(*b),
                Json::Number(n) => MsgValue::Bool(n.as_f64().is_some_and(|v| v != 0.0)),
                _ => return Err(mismatch()),
            },
            SigType::Double => MsgValue::Double(json.as_f64().ok_or_else(mismatch)?),
            SigType::String => MsgValue::Str(json.as_str().ok_or_else(mismatch)?.to_string()),
            SigType::ObjectPath => {
                MsgValue::ObjectPath(json.as_str().ok_or_else(mismatch)?.to_string())
            }
            SigType::Signature => {
                let text = json.as_str().ok_or_else(mismatch)?;
                Signature::parse(text).map_err(|_| mismatch())?;
                MsgValue::Signature(text.to_string())
            }
            SigType::Variant => MsgValue::Variant(Box::new(MsgValue::infer_from_json(json))),
            SigType::Array(elem) => match json {
                Json::Array(items) => MsgValue::Array(
                    items
                        .iter()
                        .map(|item| MsgValue::from_json(item, elem))
                        .collect::<Result<_, _>>()?,
                ),
                _ => return Err(mismatch()),
            },
            SigType::Struct(types) => match json {
                Json::Array(items) if items.len() == types.len() => MsgValue::Struct(
                    items
                        .iter()
                        .zip(types)
                        .map(|(item, t)| MsgValue::from_json(item, t))
                        .collect::<Result<_, _>>()?,
                ),
                Json::Array(items) => {
                    return Err(ValueError::Arity {
                        expected: types.len(),
                        found: items.len(),
                    })
                }
                _ => return Err(mismatch()),
            },
            SigType::Dict(k, v) => match json {
                Json::Object(map) => MsgValue::Dict(
                    map.iter()
                        .map(|(key, value)| {
                            Ok((
                                key_from_str(key, k)?,
                                MsgValue::from_json(value, v)?,
                            ))
                        })
                        .collect::<Result<_, ValueError>>()?,
                ),
                Json::Array(pairs) => MsgValue::Dict(
                    pairs
                        .iter()
                        .map(|pair| match pair {
                            Json::Array(kv) if kv.len() == 2 => {
                                Ok((MsgValue::from_json(&kv[0], k)?, MsgValue::from_json(&kv[1], v)?))
                            }
                            _ => Err(mismatch()),
                        })
                        .collect::<Result<_, ValueError>>()?,
                ),
                _ => return Err(mismatch()),
            },
        })
    }

    /// Convert a JSON argument list against a signature.
    pub fn list_from_json(items: &[Json], sig: &Signature) -> Result<Vec<MsgValue>, ValueError> {
        if items.len() != sig.len() {
            return Err(ValueError::Arity {
                expected: sig.len(),
                found: items.len(),
            });
        }
        items
            .iter()
            .zip(sig.types())
            .map(|(item, ty)| MsgValue::from_json(item, ty))
            .collect()
    }

    /// Best-effort typing of untyped JSON, used for variant payloads.
    ///
    /// Integers become `x` (or `t` when above `i64::MAX`), other numbers `d`,
    /// arrays `av`, objects `a{sv}` and `null` an empty `av`.
    pub fn infer_from_json(json: &Json) -> MsgValue {
        match json {
            Json::Null => MsgValue::Array(Vec::new()),
            Json::Bool(b) => MsgValue::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MsgValue::Int64(i)
                } else if let Some(u) = n.as_u64() {
                    MsgValue::UInt64(u)
                } else {
                    MsgValue::Double(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => MsgValue::Str(s.clone()),
            Json::Array(items) => MsgValue::Array(
                items
                    .iter()
                    .map(|i| MsgValue::variant(MsgValue::infer_from_json(i)))
                    .collect(),
            ),
            Json::Object(map) => MsgValue::Dict(
                map.iter()
                    .map(|(k, v)| {
                        (
                            MsgValue::Str(k.clone()),
                            MsgValue::variant(MsgValue::infer_from_json(v)),
                        )
                    })
                    .collect(),
            ),
        }
    }
}

/// Check a value list against a signature, reporting the first mismatch.
pub fn check_values(values: &[MsgValue], sig: &Signature) -> Result<(), String> {
    if values.len() != sig.len() {
        return Err(format!(
            "expected {} value(s) of '{}', got {}",
            sig.len(),
            sig,
            values.len()
        ));
    }
    for (index, (value, ty)) in values.iter().zip(sig.types()).enumerate() {
        if !value.conforms(ty) {
            return Err(format!(
                "value {index} is {} where '{ty}' is declared",
                value.type_label()
            ));
        }
    }
    Ok(())
}

fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn int_from_json<T: TryFrom<i64>>(
    json: &Json,
    ty: &SigType,
    target: &'static str,
) -> Result<T, ValueError> {
    let raw = match json {
        Json::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                    f as i64
                }
                _ => {
                    return Err(ValueError::OutOfRange {
                        value: n.to_string(),
                        target,
                    })
                }
            },
        },
        Json::Bool(b) => i64::from(*b),
        other => {
            return Err(ValueError::TypeMismatch {
                expected: ty.to_string(),
                found: json_kind(other).to_string(),
            })
        }
    };
    T::try_from(raw).map_err(|_| ValueError::OutOfRange {
        value: raw.to_string(),
        target,
    })
}

fn key_from_str(key: &str, ty: &SigType) -> Result<MsgValue, ValueError> {
    match ty {
        SigType::String => Ok(MsgValue::Str(key.to_string())),
        SigType::ObjectPath => Ok(MsgValue::ObjectPath(key.to_string())),
        SigType::Signature => Ok(MsgValue::Signature(key.to_string())),
        other => {
            let parsed: Json = key.parse::<i64>().map(Json::from).or_else(|_| {
                key.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Json::Number)
                    .ok_or(())
            }).map_err(|_| ValueError::TypeMismatch {
                expected: other.to_string(),
                found: "string key".to_string(),
            })?;
            MsgValue::from_json(&parsed, other)
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for MsgValue {
                fn from(v: $ty) -> Self {
                    MsgValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar!(
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
);

impl From<&str> for MsgValue {
    fn from(v: &str) -> Self {
        MsgValue::Str(v.to_string())
    }
}

impl<T: Into<MsgValue>> From<Vec<T>> for MsgValue {
    fn from(items: Vec<T>) -> Self {
        MsgValue::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sig(text: &str) -> SigType {
        Signature::parse_single(text).unwrap()
    }

    #[test]
    fn test_conformance() {
        assert!(MsgValue::Int32(7).conforms(&sig("i")));
        assert!(!MsgValue::Int32(7).conforms(&sig("u")));
        assert!(MsgValue::Array(vec![]).conforms(&sig("a(ss)")));
        assert!(MsgValue::from(vec!["a", "b"]).conforms(&sig("as")));
        assert!(!MsgValue::Array(vec![MsgValue::Int32(1), MsgValue::Str("x".into())])
            .conforms(&sig("ai")));
        assert!(MsgValue::variant(42i32).conforms(&sig("v")));
        assert!(!MsgValue::Signature("(".into()).conforms(&sig("g")));
    }

    #[test]
    fn test_from_json_uses_signature_width() {
        let v = MsgValue::from_json(&json!(200), &sig("y")).unwrap();
        assert_eq!(v, MsgValue::Byte(200));
        assert!(matches!(
            MsgValue::from_json(&json!(300), &sig("y")),
            Err(ValueError::OutOfRange { target: "byte", .. })
        ));
        assert_eq!(
            MsgValue::from_json(&json!(5.0), &sig("n")).unwrap(),
            MsgValue::Int16(5)
        );
        assert!(MsgValue::from_json(&json!(5.5), &sig("i")).is_err());
        assert!(MsgValue::from_json(&json!("5"), &sig("i")).is_err());
    }

    #[test]
    fn test_from_json_containers() {
        let v = MsgValue::from_json(&json!({"a": 1, "b": "two"}), &sig("a{sv}")).unwrap();
        assert_eq!(v.dict_get("a"), Some(&MsgValue::variant(MsgValue::Int64(1))));
        assert_eq!(v.dict_get("b").and_then(MsgValue::as_str), Some("two"));

        let v = MsgValue::from_json(&json!([1, "x"]), &sig("(is)")).unwrap();
        assert_eq!(
            v,
            MsgValue::Struct(vec![MsgValue::Int32(1), MsgValue::Str("x".into())])
        );
        assert_eq!(
            MsgValue::from_json(&json!([1]), &sig("(is)")),
            Err(ValueError::Arity { expected: 2, found: 1 })
        );

        let v = MsgValue::from_json(&json!({"7": true}), &sig("a{ib}")).unwrap();
        assert_eq!(
            v,
            MsgValue::Dict(vec![(MsgValue::Int32(7), MsgValue::Bool(true))])
        );
    }

    #[test]
    fn test_to_json() {
        let v = MsgValue::Dict(vec![
            (MsgValue::Str("DeviceName".into()), MsgValue::variant("lamp")),
            (MsgValue::Str("Level".into()), MsgValue::variant(3u16)),
        ]);
        assert_eq!(v.to_json(), json!({"DeviceName": "lamp", "Level": 3}));

        let v = MsgValue::Dict(vec![(MsgValue::Int32(1), MsgValue::Bool(false))]);
        assert_eq!(v.to_json(), json!([[1, false]]));
    }

    #[test]
    fn test_list_from_json_checks_arity() {
        let s = Signature::parse("si").unwrap();
        let values = MsgValue::list_from_json(&[json!("a"), json!(1)], &s).unwrap();
        assert!(check_values(&values, &s).is_ok());
        assert!(MsgValue::list_from_json(&[json!("a")], &s).is_err());
    }

    #[test]
    fn test_check_values_reports_position() {
        let s = Signature::parse("su").unwrap();
        let err = check_values(&[MsgValue::from("x"), MsgValue::Int32(1)], &s).unwrap_err();
        assert!(err.contains("value 1"));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(MsgValue::UInt16(9).as_i64(), Some(9));
        assert_eq!(MsgValue::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(MsgValue::variant(2.5).as_f64(), Some(2.5));
        assert_eq!(MsgValue::variant(MsgValue::variant(true)).into_inner(), MsgValue::Bool(true));
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #[test]
        fn int32_accepts_exactly_its_range(n in any::<i64>()) {
            let converted = MsgValue::from_json(&json!(n), &SigType::Int32);
            prop_assert_eq!(converted.is_ok(), i32::try_from(n).is_ok());
            if let Ok(value) = converted {
                prop_assert!(value.conforms(&SigType::Int32));
                prop_assert_eq!(value.as_i64(), Some(n));
            }
        }

        #[test]
        fn string_dicts_conform_and_keep_their_entries(
            entries in prop::collection::btree_map("[a-z]{1,8}", any::<u32>(), 0..6)
        ) {
            let ty = Signature::parse_single("a{su}").unwrap();
            let value = MsgValue::from_json(&json!(entries), &ty).unwrap();
            prop_assert!(value.conforms(&ty));
            for (key, n) in &entries {
                prop_assert_eq!(value.dict_get(key).and_then(MsgValue::as_i64), Some(i64::from(*n)));
            }
        }
    }
}
