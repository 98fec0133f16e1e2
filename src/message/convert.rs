//! Field type table.
//!
//! | native | neutral | host |
//! |--------|---------|------|
//! | boolean | `Boolean` | `Bool` |
//! | byte, short, int | `Int32` | `Int32` |
//! | long, float, double | `Number` | `Number` |
//! | datetime | `Date` | `Date` |
//! | string | `String` | `String` |
//! | boolean[] | `BooleanArray` | array of `Bool` |
//! | byte[], short[] | `Int16Array` | array of `Int32` |
//! | int[] | `Int32Array` | array of `Int32` |
//! | long[] | `Int64Array` | array of `Number` |
//! | float[] | `FloatArray` | array of `Number` |
//! | double[] | `DoubleArray` | array of `Number` |
//! | datetime[] | `DateArray` | array of `Date` |
//! | string[] | `StringArray` | array of `String` |

use super::{FieldValue, HostField, HostValue, MessageFieldData, OutboundMessage};
use crate::error::{BridgeError, BridgeResult};
use crate::native::{NativeField, NativeValue};

impl FieldValue {
    /// Convert a native value; `None` for tags without a host representation.
    pub fn from_native(value: NativeValue) -> Option<FieldValue> {
        let converted = match value {
            NativeValue::Boolean(b) => FieldValue::Boolean(b),
            NativeValue::Byte(v) => FieldValue::Int32(i32::from(v)),
            NativeValue::Short(v) => FieldValue::Int32(i32::from(v)),
            NativeValue::Int(v) => FieldValue::Int32(v),
            NativeValue::Long(v) => FieldValue::Number(v as f64),
            NativeValue::Float(v) => FieldValue::Number(f64::from(v)),
            NativeValue::Double(v) => FieldValue::Number(v),
            NativeValue::DateTime(ts) => FieldValue::Date(ts),
            NativeValue::String(s) => FieldValue::String(s),
            NativeValue::BooleanArray(v) => FieldValue::BooleanArray(v),
            NativeValue::ByteArray(v) => {
                FieldValue::Int16Array(v.into_iter().map(i16::from).collect())
            }
            NativeValue::ShortArray(v) => FieldValue::Int16Array(v),
            NativeValue::IntArray(v) => FieldValue::Int32Array(v),
            NativeValue::LongArray(v) => FieldValue::Int64Array(v),
            NativeValue::FloatArray(v) => FieldValue::FloatArray(v),
            NativeValue::DoubleArray(v) => FieldValue::DoubleArray(v),
            NativeValue::DateTimeArray(v) => FieldValue::DateArray(v),
            NativeValue::StringArray(v) => FieldValue::StringArray(v),
            NativeValue::Opaque(_) => return None,
        };
        Some(converted)
    }

    /// Native value used when publishing this field.
    pub fn to_native(&self) -> NativeValue {
        match self {
            FieldValue::Boolean(b) => NativeValue::Boolean(*b),
            FieldValue::Int32(v) => NativeValue::Int(*v),
            FieldValue::Number(v) => NativeValue::Double(*v),
            FieldValue::Date(ts) => NativeValue::DateTime(*ts),
            FieldValue::String(s) => NativeValue::String(s.clone()),
            FieldValue::BooleanArray(v) => NativeValue::BooleanArray(v.clone()),
            FieldValue::Int16Array(v) => NativeValue::ShortArray(v.clone()),
            FieldValue::Int32Array(v) => NativeValue::IntArray(v.clone()),
            FieldValue::Int64Array(v) => NativeValue::LongArray(v.clone()),
            FieldValue::FloatArray(v) => NativeValue::FloatArray(v.clone()),
            FieldValue::DoubleArray(v) => NativeValue::DoubleArray(v.clone()),
            FieldValue::DateArray(v) => NativeValue::DateTimeArray(v.clone()),
            FieldValue::StringArray(v) => NativeValue::StringArray(v.clone()),
        }
    }

    pub fn to_host(&self) -> HostValue {
        fn array<T: Copy>(values: &[T], f: impl Fn(T) -> HostValue) -> HostValue {
            HostValue::Array(values.iter().copied().map(f).collect())
        }

        match self {
            FieldValue::Boolean(b) => HostValue::Bool(*b),
            FieldValue::Int32(v) => HostValue::Int32(*v),
            FieldValue::Number(v) => HostValue::Number(*v),
            FieldValue::Date(ts) => HostValue::Date(ts.truncated_to_millis()),
            FieldValue::String(s) => HostValue::String(s.clone()),
            FieldValue::BooleanArray(v) => array(v, HostValue::Bool),
            FieldValue::Int16Array(v) => array(v, |x| HostValue::Int32(i32::from(x))),
            FieldValue::Int32Array(v) => array(v, HostValue::Int32),
            FieldValue::Int64Array(v) => array(v, |x| HostValue::Number(x as f64)),
            FieldValue::FloatArray(v) => array(v, |x| HostValue::Number(f64::from(x))),
            FieldValue::DoubleArray(v) => array(v, HostValue::Number),
            FieldValue::DateArray(v) => array(v, |ts| HostValue::Date(ts.truncated_to_millis())),
            FieldValue::StringArray(v) => {
                HostValue::Array(v.iter().cloned().map(HostValue::String).collect())
            }
        }
    }

    /// Convert a host value for publishing.
    ///
    /// `Ok(None)` for `Undefined`/`Null`, which are skipped. Arrays must be
    /// homogeneous: all `Bool`, all `Date`, all `String`, or numeric (all
    /// `Int32` gives an int array, any `Number` a double array). An empty
    /// array publishes as an empty double array.
    pub fn from_host(value: &HostValue) -> BridgeResult<Option<FieldValue>> {
        let converted = match value {
            HostValue::Undefined | HostValue::Null => return Ok(None),
            HostValue::Bool(b) => FieldValue::Boolean(*b),
            HostValue::Int32(v) => FieldValue::Int32(*v),
            HostValue::Number(v) => FieldValue::Number(*v),
            HostValue::Date(ts) => FieldValue::Date(*ts),
            HostValue::String(s) => FieldValue::String(s.clone()),
            HostValue::Array(items) => array_from_host(items)?,
        };
        Ok(Some(converted))
    }
}

fn array_from_host(items: &[HostValue]) -> BridgeResult<FieldValue> {
    let mixed = || BridgeError::invalid_argument("Array fields must hold a single value type");
    let Some(first) = items.first() else {
        return Ok(FieldValue::DoubleArray(Vec::new()));
    };
    let converted = match first {
        HostValue::Bool(_) => FieldValue::BooleanArray(
            items
                .iter()
                .map(|v| v.as_bool().ok_or_else(mixed))
                .collect::<BridgeResult<_>>()?,
        ),
        HostValue::String(_) => FieldValue::StringArray(
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(mixed))
                .collect::<BridgeResult<_>>()?,
        ),
        HostValue::Date(_) => FieldValue::DateArray(
            items
                .iter()
                .map(|v| match v {
                    HostValue::Date(ts) => Ok(*ts),
                    _ => Err(mixed()),
                })
                .collect::<BridgeResult<_>>()?,
        ),
        HostValue::Int32(_) | HostValue::Number(_) => {
            if items.iter().all(|v| matches!(v, HostValue::Int32(_))) {
                FieldValue::Int32Array(
                    items
                        .iter()
                        .map(|v| match v {
                            HostValue::Int32(i) => Ok(*i),
                            _ => Err(mixed()),
                        })
                        .collect::<BridgeResult<_>>()?,
                )
            } else {
                FieldValue::DoubleArray(
                    items
                        .iter()
                        .map(|v| v.as_f64().ok_or_else(mixed))
                        .collect::<BridgeResult<_>>()?,
                )
            }
        }
        _ => {
            return Err(BridgeError::invalid_argument(
                "Unsupported array element type",
            ));
        }
    };
    Ok(converted)
}

impl MessageFieldData {
    /// Convert one native field; `None` if its type is not representable.
    pub fn from_native(field: NativeField) -> Option<MessageFieldData> {
        let NativeField { name, value } = field;
        FieldValue::from_native(value).map(|value| MessageFieldData { name, value })
    }

    pub fn to_host(&self) -> HostField {
        HostField {
            name: self.name.clone(),
            value: self.value.to_host(),
        }
    }
}

/// Convert an application message into native field values, stopping at the
/// first field that cannot be converted.
pub fn outbound_fields(message: &OutboundMessage) -> BridgeResult<Vec<(String, NativeValue)>> {
    let mut fields = Vec::with_capacity(message.fields().len());
    for field in message.fields() {
        if field.name.is_empty() {
            return Err(BridgeError::invalid_argument("Field names must not be empty"));
        }
        let converted = FieldValue::from_host(&field.value).map_err(|e| match e {
            BridgeError::InvalidArgument { message } => {
                BridgeError::invalid_argument(format!("Field '{}': {}", field.name, message))
            }
            other => other,
        })?;
        if let Some(value) = converted {
            fields.push((field.name.clone(), value.to_native()));
        }
    }
    Ok(fields)
}
