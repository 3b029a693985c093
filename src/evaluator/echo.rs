//! A tiny line-command evaluator for smoke-testing workers and transports.
//!
//! It does not interpret any scripting language. Recognised commands:
//!
//! | Source | Result |
//! |---|---|
//! | `sleep <ms> [json]` | waits (interruptibly), then returns `json` or `ms` |
//! | `spin` | loops until interrupted |
//! | `throw <Name>: <message>` | fails with that error |
//! | `panic` | panics inside the worker |
//! | `set <key> <json>` / `get <key>` | per-evaluator state |
//! | `incr` | per-evaluator counter |
//! | `options` / `mount` | the init options this evaluator was built with |
//! | anything else | parsed as JSON, or returned as a string |

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};

use super::{Evaluator, EvaluatorFactory, Interrupt};
use crate::protocol::{InitOptions, TaskError, TaskResult};

#[derive(Debug, Default)]
pub struct EchoEvaluator {
    options: InitOptions,
    vars: HashMap<String, Value>,
    counter: u64,
}

impl EchoEvaluator {
    pub fn new(options: &InitOptions) -> Self {
        Self { options: options.clone(), ..Default::default() }
    }

    /// Factory producing one fresh `EchoEvaluator` per worker.
    pub fn factory() -> impl EvaluatorFactory {
        |options: &InitOptions| -> Result<Box<dyn Evaluator>, TaskError> {
            Ok(Box::new(EchoEvaluator::new(options)))
        }
    }
}

fn interrupted() -> TaskError {
    TaskError::new("InternalError", "interrupted")
}

fn literal(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

impl Evaluator for EchoEvaluator {
    fn eval(&mut self, code: &str, filename: &str, interrupt: &Interrupt) -> TaskResult {
        let code = code.trim();
        let (command, rest) = match code.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (code, ""),
        };

        match command {
            "" => Ok(Value::Null),
            "sleep" => {
                let (ms, value) = match rest.split_once(char::is_whitespace) {
                    Some((ms, value)) => (ms, Some(value.trim())),
                    None => (rest, None),
                };
                let ms: u64 = ms
                    .parse()
                    .map_err(|_| TaskError::new("SyntaxError", format!("bad duration: {ms}")))?;
                for _ in 0..ms {
                    if interrupt.should_interrupt() {
                        return Err(interrupted());
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(value.map(literal).unwrap_or_else(|| json!(ms)))
            }
            "spin" => {
                while !interrupt.should_interrupt() {
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(interrupted())
            }
            "throw" => {
                let (name, message) = match rest.split_once(':') {
                    Some((name, message)) => (name.trim(), message.trim()),
                    None => ("Error", rest),
                };
                Err(TaskError::new(name, message)
                    .with_stack(Some(format!("{name}: {message}\n    at {filename}"))))
            }
            "panic" => panic!("evaluator panicked on request"),
            "set" => {
                let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, "null"));
                let value = literal(value.trim());
                self.vars.insert(key.to_string(), value.clone());
                Ok(value)
            }
            "get" => Ok(self.vars.get(rest).cloned().unwrap_or(Value::Null)),
            "incr" => {
                self.counter += 1;
                Ok(json!(self.counter))
            }
            "options" => Ok(self.options.context_options.0.clone()),
            "mount" => Ok(self.options.shared_fs_mount.clone().map_or(Value::Null, Value::String)),
            _ => Ok(literal(code)),
        }
    }
}
