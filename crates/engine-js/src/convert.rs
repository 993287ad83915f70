//! Mapping between the host's dynamic values and boa's `JsValue`.

use boa_engine::object::builtins::JsArray;
use boa_engine::{js_string, Context, JsString, JsValue};

use engine::Error;
use value::Value;

pub fn value_to_js(value: &Value, context: &mut Context<'_>) -> Result<JsValue, Error> {
    Ok(match value {
        Value::Void => JsValue::undefined(),
        Value::Int32(v) => JsValue::from(*v),
        Value::Float32(v) => JsValue::from(*v as f64),
        Value::Bool(v) => JsValue::from(*v),
        Value::String(v) => JsValue::from(JsString::from(v.as_str())),
        Value::Array(items) => {
            let elements = items
                .iter()
                .map(|item| value_to_js(item, context))
                .collect::<Result<Vec<_>, _>>()?;
            JsArray::from_iter(elements, context).into()
        }
        // A function handle's callable lives in a host-side registry;
        // there is nothing meaningful to materialize for the guest here.
        Value::Function(_) => return Err(Error::UnsupportedValue("function handle")),
    })
}

pub fn js_to_value(value: &JsValue, context: &mut Context<'_>) -> Result<Value, Error> {
    match value {
        JsValue::Null | JsValue::Undefined => Ok(Value::Void),
        JsValue::Boolean(v) => Ok(Value::Bool(*v)),
        JsValue::Integer(v) => Ok(Value::Int32(*v)),
        // Whole numbers come back as rationals after most arithmetic;
        // fold them into Int32 when they fit so numeric results have a
        // stable shape.
        JsValue::Rational(v) => Ok(if v.fract() == 0.0 && *v >= i32::MIN as f64 && *v <= i32::MAX as f64 {
            Value::Int32(*v as i32)
        } else {
            Value::Float32(*v as f32)
        }),
        JsValue::String(v) => Ok(Value::String(v.to_std_string_escaped())),
        JsValue::Object(object) => {
            if object.is_callable() {
                return Err(Error::UnsupportedValue("function"));
            }
            if !object.is_array() {
                return Err(Error::UnsupportedValue("object"));
            }
            let length = object
                .get(js_string!("length"), context)
                .and_then(|l| l.to_u32(context))
                .map_err(|err| Error::Guest(err.to_string()))?;

            let mut items = Vec::with_capacity(length as usize);
            for index in 0..length {
                let element = object
                    .get(index, context)
                    .map_err(|err| Error::Guest(err.to_string()))?;
                items.push(js_to_value(&element, context)?);
            }
            Ok(Value::Array(items))
        }
        _ => Err(Error::UnsupportedValue("symbol or bigint")),
    }
}
