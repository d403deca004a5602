use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::error::{ProvisionError, Result};
use crate::models::message::ADD_UNIT_TO_LB;
use crate::models::{
    is_concrete_instance, App, AppUnit, Message, PersistedUnit, ProvisionerConfig, Unit,
    UnitStatus, PENDING_INSTANCE,
};

use super::balancer::{Balancer, BalancerService, ElbManager};
use super::balancer_worker::BalancerWorker;
use super::juju::JujuCli;
use super::queue::WorkQueue;
use super::reconciler::Reconciler;
use super::runner::{CommandRunner, ExecError};
use super::unit_store::{UnitFilter, UnitStore};

static ADDED_UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Unit '([^']+)' added to service").unwrap());

/// Status a unit must be in before commands can run on it.
const READY_STATUS: UnitStatus = UnitStatus::Started;

/// The two queues the provisioner talks to.
#[derive(Clone)]
pub struct Queues {
    /// Consumed by the provisioner's own balancer worker.
    pub provisioner: Arc<dyn WorkQueue>,
    /// Consumed by the application layer.
    pub app: Arc<dyn WorkQueue>,
}

/// Provisions applications on a juju-managed cluster.
pub struct JujuProvisioner {
    config: ProvisionerConfig,
    juju: JujuCli,
    store: Arc<dyn UnitStore>,
    queues: Queues,
    balancer: Balancer,
    reconciler: Reconciler,
}

impl JujuProvisioner {
    /// `juju.use-elb` is read here, once. Without a balancer service the
    /// provisioner runs with load balancing disabled.
    pub fn new(
        config: ProvisionerConfig,
        runner: Arc<dyn CommandRunner>,
        store: Arc<dyn UnitStore>,
        queues: Queues,
        balancer_service: Option<Arc<dyn BalancerService>>,
    ) -> Self {
        let balancer = match (config.juju.use_elb, balancer_service) {
            (true, Some(service)) => Balancer::Elb(ElbManager::new(service)),
            (true, None) => {
                tracing::warn!("juju:use-elb is set but no balancer service is available");
                Balancer::Disabled
            }
            (false, _) => Balancer::Disabled,
        };

        let juju = JujuCli::new(
            runner,
            config.juju.bin.clone(),
            config.juju.command_timeout(),
            config.juju.ssh_timeout(),
        );
        let reconciler = Reconciler::new(
            juju.clone(),
            store.clone(),
            queues.app.clone(),
            queues.provisioner.clone(),
            balancer.is_enabled(),
        );

        Self {
            config,
            juju,
            store,
            queues,
            balancer,
            reconciler,
        }
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// A worker consuming the provisioner queue with this provisioner's
    /// store and balancer.
    pub fn balancer_worker(&self) -> BalancerWorker {
        BalancerWorker::new(
            self.queues.provisioner.clone(),
            self.store.clone(),
            self.balancer.clone(),
            self.config.agent.retry_delay(),
        )
    }

    pub async fn provision(&self, app: &dyn App) -> Result<()> {
        let charms_path = self.config.juju.charms_path()?;
        self.juju
            .deploy(charms_path, app.process_type(), app.name())
            .await?;
        tracing::info!(app = app.name(), "deployed");

        if self.balancer.is_enabled() {
            self.balancer.create(app.name()).await?;
            self.queues
                .provisioner
                .put(Message::new(ADD_UNIT_TO_LB, [app.name()]))
                .await?;
        }
        Ok(())
    }

    /// Destroys the service, terminates its machines and forgets its units.
    pub async fn destroy(&self, app: &dyn App) -> Result<()> {
        self.juju.destroy_service(app.name()).await?;

        let units = app.units();
        let mut machines = BTreeSet::new();
        for unit in &units {
            if machines.insert(unit.machine) {
                self.juju.terminate_machine(unit.machine).await?;
            }
        }

        match self.balancer.destroy(app.name()).await {
            Ok(()) | Err(ProvisionError::ResourceNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let removed = self
            .store
            .delete(&UnitFilter::App(app.name().to_string()))
            .await?;
        tracing::info!(app = app.name(), machines = machines.len(), removed, "destroyed");
        Ok(())
    }

    pub async fn add_units(&self, app: &dyn App, count: u32) -> Result<Vec<Unit>> {
        if count == 0 {
            return Err(ProvisionError::ZeroUnits);
        }
        let repo_url = self.config.git.read_only_url(app.name())?;
        self.juju.set(app.name(), "app-repo", &repo_url).await?;
        let output = self.juju.add_unit(app.name(), count).await?;

        let names = added_unit_names(&output, app.name(), app.units().len(), count);
        let units: Vec<Unit> = names
            .into_iter()
            .map(|name| Unit {
                name,
                app_name: app.name().to_string(),
                process_type: app.process_type().to_string(),
                machine: 0,
                instance_id: PENDING_INSTANCE.to_string(),
                ip: String::new(),
                status: UnitStatus::Pending,
            })
            .collect();

        for unit in &units {
            if let Err(e) = self
                .store
                .insert(PersistedUnit::new(&unit.name, &unit.instance_id))
                .await
            {
                tracing::warn!(unit = %unit.name, error = %e, "failed to record new unit");
            }
        }

        if self.balancer.is_enabled() {
            self.defer_registration(app.name(), &units).await?;
        }
        tracing::info!(app = app.name(), count, "added units");
        Ok(units)
    }

    /// Units fresh from `add-unit` have no instance yet, so their
    /// registration is left to the balancer worker.
    async fn defer_registration(&self, app_name: &str, units: &[Unit]) -> Result<()> {
        let args = std::iter::once(app_name.to_string())
            .chain(units.iter().map(|u| u.name.clone()));
        self.queues
            .provisioner
            .put(Message::new(ADD_UNIT_TO_LB, args))
            .await
    }

    pub async fn remove_unit(&self, app: &dyn App, unit_name: &str) -> Result<()> {
        let unit = app
            .units()
            .into_iter()
            .find(|u| u.name == unit_name)
            .ok_or_else(|| ProvisionError::UnknownUnit {
                app: app.name().to_string(),
                unit: unit_name.to_string(),
            })?;
        self.remove(app, &unit).await
    }

    async fn remove(&self, app: &dyn App, unit: &AppUnit) -> Result<()> {
        match self.juju.remove_unit(&unit.name).await {
            Ok(_) => {}
            Err(ExecError::Failed { ref output, .. }) if unit_not_found(output, &unit.name) => {
                tracing::info!(unit = %unit.name, "unit already unknown to juju");
            }
            Err(e) => return Err(e.into()),
        }
        self.juju.terminate_machine(unit.machine).await?;

        if self.balancer.is_enabled() {
            let instance_id = match self.store.get(&unit.name).await? {
                Some(stored) if is_concrete_instance(&stored.instance_id) => stored.instance_id,
                _ => unit.instance_id.clone(),
            };
            if is_concrete_instance(&instance_id) {
                self.balancer.deregister(app.name(), &[instance_id]).await?;
            }
        }

        self.store
            .delete(&UnitFilter::Names(vec![unit.name.clone()]))
            .await?;
        tracing::info!(app = app.name(), unit = %unit.name, machine = unit.machine, "removed unit");
        Ok(())
    }

    /// Runs `cmd args...` on every started unit of `app`, writing one
    /// labeled block per unit to `stdout` in unit order. The first failing
    /// unit aborts the call; its output goes to `stderr`.
    pub async fn execute_command<O, E>(
        &self,
        stdout: &mut O,
        stderr: &mut E,
        app: &dyn App,
        cmd: &str,
        args: &[String],
    ) -> Result<()>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let units = app.units();
        let mut results: Vec<Option<std::result::Result<String, ExecError>>> =
            Vec::with_capacity(units.len());
        let mut tasks = JoinSet::new();

        for (index, unit) in units.iter().enumerate() {
            if unit.status == READY_STATUS {
                results.push(None);
                let juju = self.juju.clone();
                let machine = unit.machine;
                let cmd = cmd.to_string();
                let args = args.to_vec();
                tasks.spawn(async move { (index, juju.ssh(machine, &cmd, &args).await) });
            } else {
                results.push(Some(Ok(format!(
                    "Unit state is \"{}\", it must be \"{}\" for running commands.",
                    unit.status, READY_STATUS
                ))));
            }
        }

        let mut next = 0;
        loop {
            while next < units.len() {
                let output = match results[next].take() {
                    None => break,
                    Some(Ok(output)) => output,
                    Some(Err(e)) => {
                        tasks.abort_all();
                        return fail_command(stdout, stderr, &units[next].name, e).await;
                    }
                };
                if next > 0 {
                    stdout.write_all(b"\n").await?;
                }
                let header = format!("Output from unit \"{}\":\n\n", units[next].name);
                stdout.write_all(header.as_bytes()).await?;
                let body = output.strip_suffix('\n').unwrap_or(&output);
                stdout.write_all(body.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                next += 1;
            }
            if next >= units.len() {
                break;
            }
            match tasks.join_next().await {
                Some(Ok((index, Err(e)))) if index > next => {
                    // Fail as soon as any unit fails; earlier units keep their blocks.
                    tasks.abort_all();
                    return fail_command(stdout, stderr, &units[index].name, e).await;
                }
                Some(Ok((index, result))) => results[index] = Some(result),
                Some(Err(e)) => {
                    return Err(ProvisionError::Io(std::io::Error::other(e)));
                }
                None => break,
            }
        }
        stdout.flush().await?;
        Ok(())
    }

    pub async fn collect_status(&self) -> Result<Vec<Unit>> {
        self.reconciler.collect_status().await
    }

    /// The app's balancer address when balancing is on and a balancer
    /// exists, otherwise the address of its first unit.
    pub async fn addr(&self, app: &dyn App) -> Result<String> {
        let balancer_error = match self.balancer.addr(app.name()).await {
            Ok(Some(address)) => return Ok(address),
            Ok(None) => None,
            Err(e @ ProvisionError::ResourceNotFound(_)) => Some(e),
            Err(e) => return Err(e),
        };
        match app.units().into_iter().next() {
            Some(unit) => Ok(unit.ip),
            None => Err(balancer_error
                .unwrap_or_else(|| ProvisionError::NoUnits(app.name().to_string()))),
        }
    }
}

/// Reports a failed remote command: no block on `stdout`, the command's own
/// output on `stderr`.
async fn fail_command<O, E>(
    stdout: &mut O,
    stderr: &mut E,
    unit_name: &str,
    err: ExecError,
) -> Result<()>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    stdout.flush().await?;
    stderr.write_all(err.output().as_bytes()).await?;
    stderr.flush().await?;
    tracing::warn!(unit = unit_name, error = %err, "remote command failed");
    Err(err.into())
}

fn unit_not_found(output: &str, unit_name: &str) -> bool {
    output.contains(&format!("Service unit '{unit_name}' was not found"))
}

/// Names of the units created by `add-unit`. Uses the names juju printed
/// when it printed exactly `count` of them, otherwise numbers them after the
/// app's current units.
fn added_unit_names(output: &str, app_name: &str, current: usize, count: u32) -> Vec<String> {
    let reported: Vec<String> = ADDED_UNIT_RE
        .captures_iter(output)
        .map(|caps| caps[1].to_string())
        .collect();
    if reported.len() == count as usize {
        return reported;
    }
    (0..count as usize)
        .map(|i| format!("{app_name}/{}", current + i))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::message::{REGENERATE_APPRC_AND_START, SWAP_LB_MEMBER};
    use crate::services::balancer::MemoryBalancerService;
    use crate::services::queue::MemoryQueue;
    use crate::services::status_parser::fixtures::{COLLECT_OUTPUT, SIMPLE_COLLECT_OUTPUT};
    use crate::services::unit_store::MemoryUnitStore;
    use crate::testing::{FakeApp, Reply, ScriptedRunner};

    const ADD_UNITS_OUTPUT: &str = "2013-01-11 20:02:07,883 INFO Connecting to environment...
2013-01-11 20:02:10,147 INFO Connected to environment.
2013-01-11 20:02:10,160 INFO Unit 'resist/3' added to service 'resist'
2013-01-11 20:02:10,161 INFO Unit 'resist/4' added to service 'resist'
2013-01-11 20:02:10,162 INFO Unit 'resist/5' added to service 'resist'
2013-01-11 20:02:10,163 INFO Unit 'resist/6' added to service 'resist'
2013-01-11 20:02:10,164 INFO 'add_unit' command finished successfully";

    struct Fixture {
        runner: Arc<ScriptedRunner>,
        store: Arc<MemoryUnitStore>,
        provisioner_queue: Arc<MemoryQueue>,
        app_queue: Arc<MemoryQueue>,
        service: Arc<MemoryBalancerService>,
        provisioner: JujuProvisioner,
    }

    fn config(use_elb: bool) -> ProvisionerConfig {
        let mut config = ProvisionerConfig::default();
        config.juju.charms_path = Some("/etc/juju/charms".into());
        config.juju.use_elb = use_elb;
        config.git.ro_host = Some("gandalf.example.com".into());
        config.agent.retry_delay = 0;
        config
    }

    fn fixture_with(runner: ScriptedRunner, config: ProvisionerConfig) -> Fixture {
        let runner = Arc::new(runner);
        let store = Arc::new(MemoryUnitStore::new());
        let provisioner_queue = Arc::new(MemoryQueue::new("provisioner"));
        let app_queue = Arc::new(MemoryQueue::new("app"));
        let service = Arc::new(MemoryBalancerService::default());
        let provisioner = JujuProvisioner::new(
            config,
            runner.clone(),
            store.clone(),
            Queues {
                provisioner: provisioner_queue.clone(),
                app: app_queue.clone(),
            },
            Some(service.clone()),
        );
        Fixture {
            runner,
            store,
            provisioner_queue,
            app_queue,
            service,
            provisioner,
        }
    }

    fn fixture(runner: ScriptedRunner) -> Fixture {
        fixture_with(runner, config(false))
    }

    fn elb_fixture(runner: ScriptedRunner) -> Fixture {
        fixture_with(runner, config(true))
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn use_elb_is_resolved_at_construction() {
        assert!(elb_fixture(ScriptedRunner::new()).provisioner.balancer().is_enabled());
        assert!(!fixture(ScriptedRunner::new()).provisioner.balancer().is_enabled());

        let provisioner = JujuProvisioner::new(
            config(true),
            Arc::new(ScriptedRunner::new()),
            Arc::new(MemoryUnitStore::new()),
            Queues {
                provisioner: Arc::new(MemoryQueue::new("p")),
                app: Arc::new(MemoryQueue::new("a")),
            },
            None,
        );
        assert!(!provisioner.balancer().is_enabled());
    }

    #[tokio::test]
    async fn provision_deploys_charm() {
        let f = fixture(ScriptedRunner::new());
        let app = FakeApp::new("trace", "python", 0);
        f.provisioner.provision(&app).await.unwrap();
        assert_eq!(
            f.runner.commands(),
            vec!["juju deploy --repository /etc/juju/charms local:python trace"]
        );
    }

    #[tokio::test]
    async fn provision_without_charms_path() {
        let mut cfg = config(false);
        cfg.juju.charms_path = None;
        let f = fixture_with(ScriptedRunner::new(), cfg);
        let err = f
            .provisioner
            .provision(&FakeApp::new("eternity", "sandman", 0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Setting \"juju:charms-path\" is not defined.");
        assert!(!f.runner.ran());
    }

    #[tokio::test]
    async fn provision_failure_carries_reason() {
        let f = fixture(ScriptedRunner::failing("juju failed", 1));
        let err = f
            .provisioner
            .provision(&FakeApp::new("trace", "python", 0))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("juju failed"));
        match err {
            ProvisionError::ExternalCommandFailed { source, .. } => {
                assert_eq!(source.to_string(), "exit status 1")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn provision_with_elb_creates_balancer() {
        let f = elb_fixture(ScriptedRunner::with_output("deployed"));
        let app = FakeApp::new("jimmy", "who", 0);
        f.provisioner.provision(&app).await.unwrap();

        let addr = f.provisioner.balancer().addr("jimmy").await.unwrap();
        assert!(addr.is_some_and(|a| !a.is_empty()));
        assert_eq!(
            f.provisioner_queue.peek_all().await,
            vec![Message::new(ADD_UNIT_TO_LB, ["jimmy"])]
        );
    }

    #[tokio::test]
    async fn destroy_terminates_machines_and_forgets_units() {
        let f = fixture(ScriptedRunner::new());
        for name in ["cribcaged/0", "cribcaged/1", "cribcaged/2"] {
            f.store.insert(PersistedUnit::new(name, "")).await.unwrap();
        }
        let app = FakeApp::new("cribcaged", "python", 3);

        f.provisioner.destroy(&app).await.unwrap();

        assert_eq!(
            f.runner.parameters(),
            strings(&[
                "destroy-service", "cribcaged",
                "terminate-machine", "1",
                "terminate-machine", "2",
                "terminate-machine", "3",
            ])
        );
        assert_eq!(f.store.count(&UnitFilter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn destroy_forgets_units_the_app_does_not_list_yet() {
        let f = fixture(ScriptedRunner::new());
        for name in ["cribcaged/0", "cribcaged/1", "cribcaged/2", "cribcaged/3"] {
            f.store.insert(PersistedUnit::new(name, "")).await.unwrap();
        }
        f.store
            .insert(PersistedUnit::new("cribcaged-two/0", "i-1"))
            .await
            .unwrap();

        f.provisioner
            .destroy(&FakeApp::new("cribcaged", "python", 3))
            .await
            .unwrap();

        assert_eq!(
            f.store.count(&UnitFilter::App("cribcaged".into())).await.unwrap(),
            0
        );
        assert!(f.store.get("cribcaged-two/0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn destroy_terminates_each_machine_once() {
        let f = fixture(ScriptedRunner::new());
        let mut app = FakeApp::new("shared", "python", 2);
        app.units[1].machine = 1;

        f.provisioner.destroy(&app).await.unwrap();
        assert_eq!(
            f.runner.commands(),
            vec!["juju destroy-service shared", "juju terminate-machine 1"]
        );
    }

    #[tokio::test]
    async fn destroy_failure_carries_reason() {
        let f = fixture(ScriptedRunner::failing("juju failed to destroy the machine", 25));
        let err = f
            .provisioner
            .destroy(&FakeApp::new("idioglossia", "static", 1))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("juju failed to destroy the machine"));
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("exit status 25".to_string())
        );
    }

    #[tokio::test]
    async fn destroy_with_elb_removes_balancer() {
        let f = elb_fixture(ScriptedRunner::with_output("deployed"));
        let app = FakeApp::new("jimmy", "who", 0);
        f.provisioner.provision(&app).await.unwrap();
        f.provisioner.destroy(&app).await.unwrap();

        assert!(matches!(
            f.provisioner.balancer().addr("jimmy").await,
            Err(ProvisionError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn add_units_uses_reported_names() {
        let f = fixture(ScriptedRunner::with_output(ADD_UNITS_OUTPUT));
        let app = FakeApp::new("resist", "rush", 0);

        let units = f.provisioner.add_units(&app, 4).await.unwrap();
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["resist/3", "resist/4", "resist/5", "resist/6"]);
        assert!(units.iter().all(|u| u.app_name == "resist" && u.process_type == "rush"));
        assert_eq!(
            f.runner.parameters(),
            strings(&[
                "set", "resist", "app-repo=git://gandalf.example.com/resist.git",
                "add-unit", "resist", "--num-units", "4",
            ])
        );
        assert_eq!(f.store.count(&UnitFilter::App("resist".into())).await.unwrap(), 4);
        let stored = f.store.get("resist/3").await.unwrap().unwrap();
        assert_eq!(stored.instance_id, PENDING_INSTANCE);
        assert_eq!(f.provisioner_queue.ready_len().await, 0);
    }

    #[tokio::test]
    async fn add_units_derives_names_from_current_count() {
        let f = fixture(ScriptedRunner::with_output("added"));
        let app = FakeApp::new("headlong", "rush", 2);

        let units = f.provisioner.add_units(&app, 2).await.unwrap();
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["headlong/2", "headlong/3"]);
    }

    #[tokio::test]
    async fn add_zero_units_fails_without_running_juju() {
        let f = fixture(ScriptedRunner::new());
        let err = f
            .provisioner
            .add_units(&FakeApp::new("resist", "rush", 0), 0)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot add zero units.");
        assert!(!f.runner.ran());
    }

    #[tokio::test]
    async fn add_units_failure_carries_reason() {
        let f = fixture(ScriptedRunner::failing("juju failed", 1));
        let err = f
            .provisioner
            .add_units(&FakeApp::new("headlong", "rush", 1), 1)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("juju failed"));
        assert_eq!(f.store.count(&UnitFilter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_units_with_elb_defers_pending_units() {
        let f = elb_fixture(ScriptedRunner::with_output(ADD_UNITS_OUTPUT));
        let app = FakeApp::new("resist", "rush", 0);
        f.provisioner.add_units(&app, 4).await.unwrap();

        assert_eq!(
            f.provisioner_queue.peek_all().await,
            vec![Message::new(
                ADD_UNIT_TO_LB,
                ["resist", "resist/3", "resist/4", "resist/5", "resist/6"]
            )]
        );
    }

    #[tokio::test]
    async fn remove_unit_runs_juju_and_forgets_unit() {
        let f = fixture(ScriptedRunner::with_output("removed"));
        f.store
            .insert(PersistedUnit::new("two/2", "i-00000439"))
            .await
            .unwrap();
        let app = FakeApp::new("two", "rush", 3);

        f.provisioner.remove_unit(&app, "two/2").await.unwrap();

        assert_eq!(
            f.runner.parameters(),
            strings(&["remove-unit", "two/2", "terminate-machine", "3"])
        );
        assert!(f.store.get("two/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unit_unknown_to_juju_still_succeeds() {
        let output = "2013-01-11 20:02:07,883 INFO Connecting to environment...
2013-01-11 20:02:10,147 INFO Connected to environment.
2013-01-11 20:02:10,160 ERROR Service unit 'two/2' was not found";
        let runner = ScriptedRunner::new();
        runner.on(
            &["remove-unit"],
            Reply::Fail {
                output: output.into(),
                code: 1,
            },
        );
        let f = fixture(runner);
        f.store
            .insert(PersistedUnit::new("two/2", "i-00000439"))
            .await
            .unwrap();

        f.provisioner
            .remove_unit(&FakeApp::new("two", "rush", 3), "two/2")
            .await
            .unwrap();

        assert_eq!(
            f.runner.commands(),
            vec!["juju remove-unit two/2", "juju terminate-machine 3"]
        );
        assert!(f.store.get("two/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_unknown_unit_fails_without_running_juju() {
        let f = fixture(ScriptedRunner::new());
        let err = f
            .provisioner
            .remove_unit(&FakeApp::new("tears", "rush", 2), "tears/2")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownUnit { .. }));
        assert_eq!(
            err.to_string(),
            "App \"tears\" does not have a unit named \"tears/2\"."
        );
        assert!(!f.runner.ran());
    }

    #[tokio::test]
    async fn remove_unit_failure_carries_reason() {
        let f = fixture(ScriptedRunner::failing("juju failed", 66));
        let err = f
            .provisioner
            .remove_unit(&FakeApp::new("something", "rush", 1), "something/0")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("juju failed"));
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("exit status 66".to_string())
        );
    }

    #[tokio::test]
    async fn remove_unit_with_elb_deregisters_instance() {
        let f = elb_fixture(ScriptedRunner::with_output("unit removed"));
        let app = FakeApp::new("radio", "rush", 4);
        let ids: Vec<String> = app.units.iter().map(|u| u.instance_id.clone()).collect();
        f.provisioner.balancer().create("radio").await.unwrap();
        f.provisioner.balancer().register("radio", &ids).await.unwrap();

        f.provisioner.remove_unit(&app, "radio/0").await.unwrap();

        let lb = f.service.describe("radio").await.unwrap();
        assert_eq!(lb.instances, ids[1..].to_vec());
    }

    #[tokio::test]
    async fn execute_command_on_every_unit() {
        let f = fixture(ScriptedRunner::new());
        let app = FakeApp::new("almah", "static", 2);
        let mut out = Vec::new();
        let mut err = Vec::new();

        f.provisioner
            .execute_command(&mut out, &mut err, &app, "ls", &strings(&["-lh"]))
            .await
            .unwrap();

        let expected = "Output from unit \"almah/0\":

ssh -o StrictHostKeyChecking no -q 1 ls -lh

Output from unit \"almah/1\":

ssh -o StrictHostKeyChecking no -q 2 ls -lh
";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
        assert!(err.is_empty());
        let mut commands = f.runner.commands();
        commands.sort();
        assert_eq!(
            commands,
            vec![
                "juju ssh -o StrictHostKeyChecking no -q 1 ls -lh",
                "juju ssh -o StrictHostKeyChecking no -q 2 ls -lh",
            ]
        );
    }

    #[tokio::test]
    async fn execute_command_skips_units_not_started() {
        let f = fixture(ScriptedRunner::new());
        let mut app = FakeApp::new("almah", "static", 3);
        app.set_unit_status(UnitStatus::Down, 1);
        let mut out = Vec::new();
        let mut err = Vec::new();

        f.provisioner
            .execute_command(&mut out, &mut err, &app, "ls", &strings(&["-lha"]))
            .await
            .unwrap();

        let expected = "Output from unit \"almah/0\":

ssh -o StrictHostKeyChecking no -q 1 ls -lha

Output from unit \"almah/1\":

Unit state is \"down\", it must be \"started\" for running commands.

Output from unit \"almah/2\":

ssh -o StrictHostKeyChecking no -q 3 ls -lha
";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
        let machines: BTreeSet<String> = f
            .runner
            .calls()
            .into_iter()
            .map(|c| c.args[4].clone())
            .collect();
        assert_eq!(machines, ["1", "3"].iter().map(|m| m.to_string()).collect());
    }

    #[tokio::test]
    async fn execute_command_output_follows_unit_order() {
        let runner = ScriptedRunner::new();
        runner.on(
            &["ssh", "-o", "StrictHostKeyChecking no", "-q", "1"],
            Reply::Delayed {
                delay: Duration::from_millis(50),
                output: "slow\n".into(),
            },
        );
        runner.on(
            &["ssh", "-o", "StrictHostKeyChecking no", "-q", "2"],
            Reply::Output("fast\n".into()),
        );
        let f = fixture(runner);
        let mut out = Vec::new();
        let mut err = Vec::new();

        f.provisioner
            .execute_command(&mut out, &mut err, &FakeApp::new("almah", "static", 2), "uptime", &[])
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Output from unit \"almah/0\":\n\nslow\n\nOutput from unit \"almah/1\":\n\nfast\n"
        );
    }

    #[tokio::test]
    async fn execute_command_failure_aborts() {
        let f = fixture(ScriptedRunner::failing("failed", 2));
        let mut out = Vec::new();
        let mut err = Vec::new();

        let result = f
            .provisioner
            .execute_command(&mut out, &mut err, &FakeApp::new("frases", "static", 1), "ls", &strings(&["-l"]))
            .await;

        let e = result.unwrap_err();
        assert_eq!(
            std::error::Error::source(&e).map(|s| s.to_string()),
            Some("exit status 2".to_string())
        );
        assert_eq!(String::from_utf8(err).unwrap(), "failed");
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn failing_unit_gets_no_output_block() {
        let runner = ScriptedRunner::new();
        runner.on(
            &["ssh", "-o", "StrictHostKeyChecking no", "-q", "2"],
            Reply::Fail {
                output: "boom".into(),
                code: 3,
            },
        );
        let f = fixture(runner);
        let mut app = FakeApp::new("almah", "static", 2);
        app.set_unit_status(UnitStatus::Down, 0);
        let mut out = Vec::new();
        let mut err = Vec::new();

        let result = f
            .provisioner
            .execute_command(&mut out, &mut err, &app, "ls", &[])
            .await;

        assert!(result.is_err());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Output from unit \"almah/0\":\n\nUnit state is \"down\", it must be \"started\" for running commands.\n"
        );
        assert_eq!(String::from_utf8(err).unwrap(), "boom");
    }

    #[tokio::test]
    async fn execute_command_failure_on_later_unit_is_reported_early() {
        let runner = ScriptedRunner::new();
        runner.on(
            &["ssh", "-o", "StrictHostKeyChecking no", "-q", "1"],
            Reply::Delayed {
                delay: Duration::from_secs(30),
                output: "never\n".into(),
            },
        );
        runner.on(
            &["ssh", "-o", "StrictHostKeyChecking no", "-q", "2"],
            Reply::Fail {
                output: "boom".into(),
                code: 3,
            },
        );
        let f = fixture(runner);
        let mut out = Vec::new();
        let mut err = Vec::new();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            f.provisioner.execute_command(
                &mut out,
                &mut err,
                &FakeApp::new("almah", "static", 2),
                "ls",
                &[],
            ),
        )
        .await
        .expect("failure should not wait for the slow unit");

        assert!(result.is_err());
        assert_eq!(String::from_utf8(err).unwrap(), "boom");
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn collect_status_through_facade() {
        let f = fixture(ScriptedRunner::with_output(COLLECT_OUTPUT));
        let units = f.provisioner.collect_status().await.unwrap();
        let statuses: Vec<UnitStatus> = units.iter().map(|u| u.status).collect();
        assert_eq!(statuses, vec![UnitStatus::Started, UnitStatus::Installing]);
        assert_eq!(f.store.count(&UnitFilter::All).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn collect_status_with_elb_and_identity_change() {
        let f = elb_fixture(ScriptedRunner::new());
        let balancer = f.provisioner.balancer().clone();
        balancer.create("symfonia").await.unwrap();
        f.store
            .insert(PersistedUnit::new("symfonia/0", "i-00003333"))
            .await
            .unwrap();
        balancer
            .register("symfonia", &strings(&["i-00003333", "i-00004445"]))
            .await
            .unwrap();
        f.runner.set_fallback(Reply::Output(SIMPLE_COLLECT_OUTPUT.into()));

        f.provisioner.collect_status().await.unwrap();
        let worker = f.provisioner.balancer_worker();
        while worker.process_next(Duration::from_millis(10)).await.unwrap() {}

        let stored = f.store.get("symfonia/0").await.unwrap().unwrap();
        assert_eq!(stored.instance_id, "i-00004444");
        let lb = f.service.describe("symfonia").await.unwrap();
        assert_eq!(lb.instances, strings(&["i-00004445", "i-00004444"]));

        let messages = f.app_queue.peek_all().await;
        assert_eq!(
            messages,
            vec![Message::new(REGENERATE_APPRC_AND_START, ["symfonia", "symfonia/0"])]
        );
        assert!(f
            .provisioner_queue
            .peek_all()
            .await
            .iter()
            .all(|m| m.action != SWAP_LB_MEMBER));
    }

    #[tokio::test]
    async fn addr_is_first_unit_ip() {
        let f = fixture(ScriptedRunner::new());
        let app = FakeApp::new("blue", "who", 1);
        assert_eq!(f.provisioner.addr(&app).await.unwrap(), app.units[0].ip);
    }

    #[tokio::test]
    async fn addr_without_units() {
        let f = fixture(ScriptedRunner::new());
        let err = f
            .provisioner
            .addr(&FakeApp::new("squeeze", "who", 0))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "App \"squeeze\" has no units.");
    }

    #[tokio::test]
    async fn addr_with_elb() {
        let f = elb_fixture(ScriptedRunner::new());
        let app = FakeApp::new("jimmy", "who", 0);
        f.provisioner.balancer().create("jimmy").await.unwrap();

        let addr = f.provisioner.addr(&app).await.unwrap();
        assert_eq!(Some(addr), f.provisioner.balancer().addr("jimmy").await.unwrap());
    }

    #[tokio::test]
    async fn addr_with_unknown_elb_and_no_units() {
        let f = elb_fixture(ScriptedRunner::new());
        let err = f
            .provisioner
            .addr(&FakeApp::new("jimmy", "who", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn addr_with_unknown_elb_falls_back_to_unit() {
        let f = elb_fixture(ScriptedRunner::new());
        let app = FakeApp::new("jimmy", "who", 2);
        assert_eq!(f.provisioner.addr(&app).await.unwrap(), app.units[0].ip);
    }

    #[test]
    fn added_unit_names_fall_back_to_count() {
        assert_eq!(
            added_unit_names("Unit 'a/7' added to service 'a'", "a", 1, 2),
            vec!["a/1", "a/2"]
        );
        assert_eq!(
            added_unit_names("Unit 'a/7' added to service 'a'", "a", 1, 1),
            vec!["a/7"]
        );
    }
}
