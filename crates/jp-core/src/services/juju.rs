use std::sync::Arc;
use std::time::Duration;

use super::runner::{format_command, CommandRunner, ExecError};

/// Thin wrapper building the argument vector of every juju invocation the
/// provisioner issues.
#[derive(Clone)]
pub struct JujuCli {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
    ssh_timeout: Duration,
}

impl JujuCli {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: impl Into<String>,
        timeout: Duration,
        ssh_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
            ssh_timeout,
        }
    }

    async fn run_juju(&self, args: Vec<String>, timeout: Duration) -> Result<String, ExecError> {
        tracing::debug!(command = %format_command(&self.program, &args), "running juju");
        self.runner.run(&self.program, &args, timeout).await
    }

    pub async fn deploy(
        &self,
        charms_path: &str,
        process_type: &str,
        app_name: &str,
    ) -> Result<String, ExecError> {
        let args = vec![
            "deploy".to_string(),
            "--repository".to_string(),
            charms_path.to_string(),
            format!("local:{process_type}"),
            app_name.to_string(),
        ];
        self.run_juju(args, self.timeout).await
    }

    pub async fn set(&self, app_name: &str, key: &str, value: &str) -> Result<String, ExecError> {
        let args = vec![
            "set".to_string(),
            app_name.to_string(),
            format!("{key}={value}"),
        ];
        self.run_juju(args, self.timeout).await
    }

    pub async fn add_unit(&self, app_name: &str, count: u32) -> Result<String, ExecError> {
        let args = vec![
            "add-unit".to_string(),
            app_name.to_string(),
            "--num-units".to_string(),
            count.to_string(),
        ];
        self.run_juju(args, self.timeout).await
    }

    pub async fn remove_unit(&self, unit_name: &str) -> Result<String, ExecError> {
        let args = vec!["remove-unit".to_string(), unit_name.to_string()];
        self.run_juju(args, self.timeout).await
    }

    pub async fn terminate_machine(&self, machine: u32) -> Result<String, ExecError> {
        let args = vec!["terminate-machine".to_string(), machine.to_string()];
        self.run_juju(args, self.timeout).await
    }

    pub async fn destroy_service(&self, app_name: &str) -> Result<String, ExecError> {
        let args = vec!["destroy-service".to_string(), app_name.to_string()];
        self.run_juju(args, self.timeout).await
    }

    pub async fn status(&self) -> Result<String, ExecError> {
        self.run_juju(vec!["status".to_string()], self.timeout).await
    }

    /// Runs `cmd args...` on a machine over a non-interactive ssh session.
    pub async fn ssh(&self, machine: u32, cmd: &str, args: &[String]) -> Result<String, ExecError> {
        let mut full = vec![
            "ssh".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking no".to_string(),
            "-q".to_string(),
            machine.to_string(),
            cmd.to_string(),
        ];
        full.extend(args.iter().cloned());
        self.run_juju(full, self.ssh_timeout).await
    }
}
