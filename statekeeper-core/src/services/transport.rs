//! External process surfaces: the chat send command and the calendar/mail
//! fetcher.
//!
//! Both are opaque commands with a JSON contract. The send command receives
//! `{target, text, thread_id, buttons}` on stdin and prints a message id;
//! the fetcher prints an array of event/thread objects on stdout. Stderr is
//! captured into the error on failure, never streamed.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::config::ReviewConfig;
use crate::services::worker::{Button, ChatTransport};

fn split_argv(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(String::from);
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty command line"))?;
    Ok((program, parts.collect()))
}

fn run_with_stdin(command: &str, extra_args: &[&str], stdin_payload: Option<&str>) -> Result<Vec<u8>> {
    let (program, mut args) = split_argv(command)?;
    args.extend(extra_args.iter().map(|a| a.to_string()));

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(if stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;
    if let (Some(payload), Some(stdin)) = (stdin_payload, child.stdin.as_mut()) {
        stdin
            .write_all(payload.as_bytes())
            .with_context(|| format!("writing stdin of {program}"))?;
    }
    let output = child
        .wait_with_output()
        .with_context(|| format!("waiting for {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

/// Chat surface backed by a configured send command.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    command: String,
    thread_id: Option<String>,
}

impl CommandTransport {
    pub fn new(command: impl Into<String>, thread_id: Option<String>) -> Self {
        Self {
            command: command.into(),
            thread_id,
        }
    }

    /// `None` when no send command is configured (tests, dry runs).
    pub fn from_config(cfg: &ReviewConfig) -> Option<Self> {
        cfg.send_cmd
            .as_deref()
            .map(|cmd| Self::new(cmd, cfg.thread_id.clone()))
    }
}

impl ChatTransport for CommandTransport {
    fn send(&self, target: &str, text: &str, buttons: &[Button]) -> Result<String> {
        let payload = json!({
            "target": target,
            "text": text,
            "thread_id": self.thread_id,
            "buttons": buttons,
        });
        let stdout = run_with_stdin(&self.command, &[], Some(&payload.to_string()))?;
        let message_id = String::from_utf8_lossy(&stdout).trim().to_string();
        if message_id.is_empty() {
            bail!("send command returned no message id");
        }
        Ok(message_id)
    }
}

/// Invoke a fetcher command and parse its stdout as an array of objects.
pub fn run_fetcher(command: &str, extra_args: &[&str]) -> Result<Vec<Value>> {
    let stdout = run_with_stdin(command, extra_args, None)?;
    let parsed: Value = serde_json::from_slice(&stdout)
        .with_context(|| format!("parsing fetcher output of {command}"))?;
    match parsed {
        Value::Array(items) => Ok(items),
        other => bail!(
            "fetcher {command} printed {} where an array was expected",
            match other {
                Value::Object(_) => "an object",
                Value::String(_) => "a string",
                Value::Number(_) => "a number",
                Value::Bool(_) => "a bool",
                Value::Null => "null",
                Value::Array(_) => unreachable!(),
            }
        ),
    }
}
