//! Test doubles for the provisioner's collaborators.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{App, AppUnit, UnitStatus};
use crate::services::runner::{format_command, CommandRunner, ExecError, ExitError};

/// What a scripted invocation answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Prints its own arguments, like a shell script doing `echo -n "$*"`.
    Echo,
    Output(String),
    Fail { output: String, code: i32 },
    Timeout,
    Delayed { delay: Duration, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A `CommandRunner` that records every invocation and answers from a list
/// of rules matched on the leading arguments.
pub struct ScriptedRunner {
    rules: Mutex<Vec<(Vec<String>, Reply)>>,
    fallback: Mutex<Reply>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fallback: Mutex::new(Reply::Echo),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every invocation prints `output` and succeeds.
    pub fn with_output(output: impl Into<String>) -> Self {
        let runner = Self::new();
        runner.set_fallback(Reply::Output(output.into()));
        runner
    }

    /// Every invocation prints `output` and exits with `code`.
    pub fn failing(output: impl Into<String>, code: i32) -> Self {
        let runner = Self::new();
        runner.set_fallback(Reply::Fail {
            output: output.into(),
            code,
        });
        runner
    }

    pub fn set_fallback(&self, reply: Reply) {
        *lock(&self.fallback) = reply;
    }

    /// Answers invocations whose arguments start with `prefix`. Later rules
    /// win over earlier ones.
    pub fn on(&self, prefix: &[&str], reply: Reply) {
        let prefix = prefix.iter().map(|p| p.to_string()).collect();
        lock(&self.rules).push((prefix, reply));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Recorded invocations formatted as command lines.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| format_command(&c.program, &c.args))
            .collect()
    }

    /// All recorded arguments flattened, in invocation order.
    pub fn parameters(&self) -> Vec<String> {
        self.calls().into_iter().flat_map(|c| c.args).collect()
    }

    pub fn ran(&self) -> bool {
        !lock(&self.calls).is_empty()
    }

    fn reply_for(&self, args: &[String]) -> Reply {
        let rules = lock(&self.rules);
        rules
            .iter()
            .rev()
            .find(|(prefix, _)| args.starts_with(prefix))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| lock(&self.fallback).clone())
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, ExecError> {
        lock(&self.calls).push(RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            timeout,
        });
        match self.reply_for(args) {
            Reply::Echo => Ok(args.join(" ")),
            Reply::Output(output) => Ok(output),
            Reply::Fail { output, code } => Err(ExecError::Failed {
                output,
                source: ExitError { code },
            }),
            Reply::Timeout => Err(ExecError::Timeout {
                command: format_command(program, args),
                timeout,
            }),
            Reply::Delayed { delay, output } => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
        }
    }
}

/// An application with `n` started units named `<name>/0..n`, unit `i`
/// living on machine `i + 1`.
#[derive(Debug, Clone)]
pub struct FakeApp {
    pub name: String,
    pub process_type: String,
    pub units: Vec<AppUnit>,
}

impl FakeApp {
    pub fn new(name: &str, process_type: &str, unit_count: u32) -> Self {
        let units = (0..unit_count)
            .map(|i| AppUnit {
                name: format!("{name}/{i}"),
                machine: i + 1,
                instance_id: format!("i-{:08x}", i + 1),
                ip: format!("10.10.10.{}", i + 1),
                status: UnitStatus::Started,
            })
            .collect();
        Self {
            name: name.to_string(),
            process_type: process_type.to_string(),
            units,
        }
    }

    pub fn set_unit_status(&mut self, status: UnitStatus, index: usize) {
        if let Some(unit) = self.units.get_mut(index) {
            unit.status = status;
        }
    }
}

impl App for FakeApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_type(&self) -> &str {
        &self.process_type
    }

    fn units(&self) -> Vec<AppUnit> {
        self.units.clone()
    }
}
