//! In-crate test doubles for the command runner and the compute platform.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::compute::{ComputePlatform, InstanceSummary, SecretChanges, instance_name};
use super::models::DeploymentKind;
use super::steps::{CommandRunner, StepOutput};
use crate::config::CommandSpec;
use crate::errors::{OrchestratorError, OrchestratorResult};

/// Records every command line and succeeds unless a failure was scripted for
/// a substring of it.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, StepOutput>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_when(&self, needle: &str, output: StepOutput) {
        self.failures
            .lock()
            .unwrap()
            .insert(needle.to_string(), output);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.calls().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _cwd: &Path, cmd: &CommandSpec) -> Result<StepOutput> {
        let line = format!("{} {}", cmd.program, cmd.args.join(" "));
        self.calls.lock().unwrap().push(line.clone());
        let failures = self.failures.lock().unwrap();
        let scripted = failures
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone());
        Ok(scripted.unwrap_or_else(|| StepOutput::succeeded("")))
    }
}

/// Fake compute platform. Instances are named with the `preview` prefix and
/// served from `https://<name>.example.dev`.
#[derive(Default)]
pub struct FakeCompute {
    calls: Mutex<Vec<String>>,
    secrets: Mutex<Vec<(String, SecretChanges)>>,
    instances: Mutex<Vec<InstanceSummary>>,
    fail_destroy: Mutex<HashSet<String>>,
    fail_provision: AtomicBool,
    fail_deploy: AtomicBool,
    deploy_delay: Mutex<Option<Duration>>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn secrets(&self) -> Vec<(String, SecretChanges)> {
        self.secrets.lock().unwrap().clone()
    }

    pub fn fail_provision(&self) {
        self.fail_provision.store(true, Ordering::SeqCst);
    }

    pub fn fail_deploy(&self) {
        self.fail_deploy.store(true, Ordering::SeqCst);
    }

    pub fn fail_destroy_of(&self, instance: &str) {
        self.fail_destroy.lock().unwrap().insert(instance.to_string());
    }

    pub fn delay_deploys(&self, delay: Duration) {
        *self.deploy_delay.lock().unwrap() = Some(delay);
    }

    pub fn add_instance(&self, name: &str, status: &str) {
        self.instances.lock().unwrap().push(InstanceSummary {
            name: name.to_string(),
            status: status.to_string(),
            hostname: Some(format!("{}.example.dev", name)),
            current_release: None,
        });
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ComputePlatform for FakeCompute {
    async fn provision(
        &self,
        generation_id: &str,
        _kind: DeploymentKind,
    ) -> OrchestratorResult<String> {
        self.record(format!("provision {}", generation_id));
        let name = instance_name("preview", generation_id);
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ProvisionFailed {
                instance: name,
                message: "capacity exhausted".into(),
            });
        }
        Ok(name)
    }

    async fn deploy(&self, instance: &str, _workspace: &Path) -> OrchestratorResult<String> {
        self.record(format!("deploy {}", instance));
        let delay = *self.deploy_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(OrchestratorError::DeployFailed {
                instance: instance.to_string(),
                message: "release crashed on boot".into(),
            });
        }
        Ok(format!("https://{}.example.dev", instance))
    }

    async fn set_secrets(&self, instance: &str, changes: &SecretChanges) -> OrchestratorResult<()> {
        self.record(format!("set_secrets {}", instance));
        self.secrets
            .lock()
            .unwrap()
            .push((instance.to_string(), changes.clone()));
        Ok(())
    }

    async fn list_instances(&self) -> OrchestratorResult<Vec<InstanceSummary>> {
        Ok(self.instances.lock().unwrap().clone())
    }

    async fn destroy(&self, instance: &str) -> OrchestratorResult<()> {
        self.record(format!("destroy {}", instance));
        if self.fail_destroy.lock().unwrap().contains(instance) {
            return Err(OrchestratorError::ComputeApi("HTTP 500: boom".into()));
        }
        self.instances.lock().unwrap().retain(|i| i.name != instance);
        Ok(())
    }
}
