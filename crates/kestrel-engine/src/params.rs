//! Parameter resolution using minijinja templates.
//!
//! Every string leaf of a task's `params` is rendered against the instance
//! variables (global parameters overlaid with the var pool) before the
//! attempt is dispatched:
//!
//! ```json
//! { "command": "load --day {{ day }} --rows {{ extract_rows }}" }
//! ```
//!
//! Undefined variables are an error so that a typo fails the attempt instead
//! of silently rendering an empty string.

use std::collections::HashMap;

use minijinja::{Environment, UndefinedBehavior, Value};

use crate::error::EngineError;

/// Environment shared by parameter templates and branch expressions.
pub(crate) fn strict_environment() -> Environment<'static> {
  let mut env = Environment::new();
  env.set_undefined_behavior(UndefinedBehavior::Strict);
  env
}

/// Resolve a node's params against the instance variables.
pub fn resolve_params(
  node_id: &str,
  params: &serde_json::Value,
  variables: &HashMap<String, serde_json::Value>,
) -> Result<serde_json::Value, EngineError> {
  let env = strict_environment();
  let context = Value::from_serialize(variables);
  resolve_value(&env, node_id, params, &context)
}

fn resolve_value(
  env: &Environment,
  node_id: &str,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, EngineError> {
  Ok(match value {
    serde_json::Value::String(template) if is_template(template) => {
      let rendered = env
        .render_str(template, context.clone())
        .map_err(|e| EngineError::Logic {
          node_id: node_id.to_string(),
          message: format!("failed to resolve parameter '{template}': {e}"),
        })?;
      serde_json::Value::String(rendered)
    }
    serde_json::Value::Array(items) => serde_json::Value::Array(
      items
        .iter()
        .map(|item| resolve_value(env, node_id, item, context))
        .collect::<Result<_, _>>()?,
    ),
    serde_json::Value::Object(map) => serde_json::Value::Object(
      map
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(env, node_id, v, context)?)))
        .collect::<Result<_, EngineError>>()?,
    ),
    other => other.clone(),
  })
}

fn is_template(s: &str) -> bool {
  s.contains("{{") || s.contains("{%")
}
