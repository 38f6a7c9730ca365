use serde_json::{Map, Value};

use crate::runner::error::WorkerError;

/// Positional and keyword arguments handed to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// Turns message payloads into handler inputs and handler outputs into payloads.
pub trait Converter: Send + Sync {
    fn convert_inputs(&self, payload: &str) -> Result<Arguments, WorkerError>;

    fn convert_outputs(&self, value: &Value) -> Result<String, WorkerError>;
}

/// JSON payloads:
/// - array: positional arguments
/// - object with only `args` and/or `kwargs`: both
/// - any other object: keyword arguments
/// - scalar: one positional argument
/// - empty payload: no arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn convert_inputs(&self, payload: &str) -> Result<Arguments, WorkerError> {
        if payload.trim().is_empty() {
            return Ok(Arguments::default());
        }
        let value: Value = serde_json::from_str(payload)?;
        Ok(match value {
            Value::Array(args) => Arguments {
                args,
                kwargs: Map::new(),
            },
            Value::Object(mut object)
                if !object.is_empty()
                    && object.keys().all(|k| k == "args" || k == "kwargs") =>
            {
                let args = match object.remove("args") {
                    Some(Value::Array(args)) => args,
                    Some(Value::Null) | None => Vec::new(),
                    Some(other) => vec![other],
                };
                let kwargs = match object.remove("kwargs") {
                    Some(Value::Object(kwargs)) => kwargs,
                    Some(Value::Null) | None => Map::new(),
                    Some(_) => {
                        return Err(WorkerError::Validation(
                            "kwargs must be a JSON object".to_string(),
                        ))
                    }
                };
                Arguments { args, kwargs }
            }
            Value::Object(kwargs) => Arguments {
                args: Vec::new(),
                kwargs,
            },
            scalar => Arguments {
                args: vec![scalar],
                kwargs: Map::new(),
            },
        })
    }

    fn convert_outputs(&self, value: &Value) -> Result<String, WorkerError> {
        Ok(serde_json::to_string(value)?)
    }
}
