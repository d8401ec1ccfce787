//! Shell task plugin.
//!
//! Runs `params.command` with `sh -c`. Lines of standard output shaped like
//! `${setValue(key=value)}` publish `key` as an output variable; the value is
//! parsed as JSON when possible and kept as a string otherwise.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::plugin::{TaskPlugin, TaskPluginFactory};
use crate::types::{EXIT_CODE_FAILURE, TaskExecutionContext};

pub struct ShellTaskFactory;

impl TaskPluginFactory for ShellTaskFactory {
  fn task_type(&self) -> &str {
    "shell"
  }

  fn create(&self) -> Box<dyn TaskPlugin> {
    Box::new(ShellTask::default())
  }
}

#[derive(Default)]
pub struct ShellTask {
  command: String,
  env: Vec<(String, String)>,
  child: Option<Child>,
  outputs: HashMap<String, serde_json::Value>,
}

#[async_trait]
impl TaskPlugin for ShellTask {
  async fn init(&mut self, ctx: &TaskExecutionContext) -> Result<(), TaskError> {
    self.command = ctx
      .params
      .get("command")
      .and_then(|v| v.as_str())
      .ok_or_else(|| TaskError::MissingParam {
        field: "command".to_string(),
      })?
      .to_string();

    self.env = ctx
      .variables
      .iter()
      .map(|(key, value)| {
        let value = match value {
          serde_json::Value::String(s) => s.clone(),
          other => other.to_string(),
        };
        (key.clone(), value)
      })
      .collect();
    Ok(())
  }

  async fn submit(&mut self) -> Result<(), TaskError> {
    debug!(command = %self.command, "spawning shell task");
    let child = Command::new("sh")
      .arg("-c")
      .arg(&self.command)
      .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
      .stdout(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;
    self.child = Some(child);
    Ok(())
  }

  async fn track_status(&mut self) -> Result<i32, TaskError> {
    let child = self.child.as_mut().ok_or(TaskError::NotSubmitted)?;

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
      pipe.read_to_string(&mut stdout).await?;
    }
    let status = child.wait().await?;

    self.outputs = parse_outputs(&stdout);
    Ok(status.code().unwrap_or(EXIT_CODE_FAILURE))
  }

  async fn cancel(&mut self) -> Result<(), TaskError> {
    if let Some(child) = self.child.as_mut() {
      if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill shell task");
        return Err(e.into());
      }
    }
    Ok(())
  }

  fn outputs(&self) -> HashMap<String, serde_json::Value> {
    self.outputs.clone()
  }
}

fn parse_outputs(stdout: &str) -> HashMap<String, serde_json::Value> {
  stdout
    .lines()
    .filter_map(|line| {
      let inner = line
        .trim()
        .strip_prefix("${setValue(")?
        .strip_suffix(")}")?;
      let (key, value) = inner.split_once('=')?;
      let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
      Some((key.trim().to_string(), value))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn ctx(command: &str) -> TaskExecutionContext {
    TaskExecutionContext {
      instance_id: "i1".to_string(),
      task_instance_id: "t1".to_string(),
      node_id: "a".to_string(),
      task_type: "shell".to_string(),
      attempt: 1,
      params: json!({ "command": command }),
      variables: HashMap::from([("greeting".to_string(), json!("hello"))]),
      timeout_ms: None,
    }
  }

  #[test]
  fn test_parse_outputs() {
    let outputs = parse_outputs("noise\n${setValue(count=3)}\n${setValue(name=abc)}\n");
    assert_eq!(outputs.get("count"), Some(&json!(3)));
    assert_eq!(outputs.get("name"), Some(&json!("abc")));
    assert_eq!(outputs.len(), 2);
  }

  #[tokio::test]
  async fn test_shell_task_publishes_outputs() {
    let mut task = ShellTask::default();
    task.init(&ctx("echo \"\\${setValue(msg=$greeting)}\"")).await.unwrap();
    task.submit().await.unwrap();
    assert_eq!(task.track_status().await.unwrap(), 0);
    assert_eq!(task.outputs().get("msg"), Some(&json!("hello")));
  }

  #[tokio::test]
  async fn test_shell_task_exit_code() {
    let mut task = ShellTask::default();
    task.init(&ctx("exit 3")).await.unwrap();
    task.submit().await.unwrap();
    assert_eq!(task.track_status().await.unwrap(), 3);
  }

  #[tokio::test]
  async fn test_missing_command() {
    let mut task = ShellTask::default();
    let mut context = ctx("true");
    context.params = json!({});
    assert!(matches!(
      task.init(&context).await,
      Err(TaskError::MissingParam { .. })
    ));
  }
}
