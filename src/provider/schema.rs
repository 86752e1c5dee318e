//! JSON Schema → OpenAPI-flavored schema conversion for the Google API.
//!
//! Gemini function declarations take an OpenAPI-style schema: no
//! `type: [..., "null"]` unions (use `nullable: true`), and only the subset
//! object/string/number/integer/boolean/array/enum. The conversion is
//! deterministic and total over that subset; anything outside it is a fatal
//! `SchemaConversion` error for the turn.

use serde_json::{Map, Value};

use crate::error::PipelineError;

const SUPPORTED_TYPES: &[&str] = &["object", "string", "number", "integer", "boolean", "array"];

/// Keys carried through unchanged when present.
const PASSTHROUGH_KEYS: &[&str] = &["description", "enum", "format", "required"];

/// Convert a JSON-Schema-shaped tool input schema to Gemini's OpenAPI flavor.
pub fn to_openapi_schema(schema: &Value) -> Result<Value, PipelineError> {
    let obj = match schema {
        Value::Object(obj) => obj,
        _ => {
            return Err(PipelineError::SchemaConversion(format!(
                "expected a schema object, got {schema}"
            )))
        }
    };

    if obj.contains_key("anyOf") || obj.contains_key("oneOf") || obj.contains_key("allOf") {
        return Err(PipelineError::SchemaConversion(
            "anyOf/oneOf/allOf schemas are not supported for this provider".to_string(),
        ));
    }

    let (ty, nullable) = resolve_type(obj)?;

    let mut out = Map::new();
    out.insert("type".to_string(), Value::String(ty.clone()));
    if nullable {
        out.insert("nullable".to_string(), Value::Bool(true));
    }
    for key in PASSTHROUGH_KEYS {
        if let Some(v) = obj.get(*key) {
            out.insert((*key).to_string(), v.clone());
        }
    }

    match ty.as_str() {
        "object" => {
            if let Some(Value::Object(props)) = obj.get("properties") {
                let mut converted = Map::new();
                for (name, prop) in props {
                    converted.insert(name.clone(), to_openapi_schema(prop)?);
                }
                out.insert("properties".to_string(), Value::Object(converted));
            }
        }
        "array" => {
            if let Some(items) = obj.get("items") {
                out.insert("items".to_string(), to_openapi_schema(items)?);
            }
        }
        _ => {}
    }

    Ok(Value::Object(out))
}

/// Resolve the schema's type keyword, folding a `[T, "null"]` union into
/// `(T, nullable)`.
fn resolve_type(obj: &Map<String, Value>) -> Result<(String, bool), PipelineError> {
    match obj.get("type") {
        Some(Value::String(t)) => {
            ensure_supported(t)?;
            Ok((t.clone(), false))
        }
        Some(Value::Array(types)) => {
            let mut concrete = None;
            let mut nullable = false;
            for t in types {
                match t.as_str() {
                    Some("null") => nullable = true,
                    Some(other) => {
                        if concrete.replace(other.to_string()).is_some() {
                            return Err(PipelineError::SchemaConversion(format!(
                                "multi-type union {types:?} cannot be expressed for this provider"
                            )));
                        }
                    }
                    None => {
                        return Err(PipelineError::SchemaConversion(format!(
                            "non-string entry in type union {types:?}"
                        )))
                    }
                }
            }
            let ty = concrete.ok_or_else(|| {
                PipelineError::SchemaConversion("type union contains only null".to_string())
            })?;
            ensure_supported(&ty)?;
            Ok((ty, nullable))
        }
        // enum-only schemas are strings in practice; bare property maps are
        // objects
        None if obj.contains_key("enum") => Ok(("string".to_string(), false)),
        None if obj.contains_key("properties") => Ok(("object".to_string(), false)),
        other => Err(PipelineError::SchemaConversion(format!(
            "unsupported or missing type keyword: {other:?}"
        ))),
    }
}

fn ensure_supported(ty: &str) -> Result<(), PipelineError> {
    if SUPPORTED_TYPES.contains(&ty) {
        Ok(())
    } else {
        Err(PipelineError::SchemaConversion(format!(
            "unsupported schema type '{ty}'"
        )))
    }
}
