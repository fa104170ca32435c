//! In-memory [`ContainerApi`] for tests.
//!
//! `MockApi` tracks containers and their labels, answers streaming calls
//! with scripted JSON lines, and records every call in order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;

use crate::api::{
    BuildSpec, ByteStream, ContainerApi, CreateSpec, ExecIo, ExecSpec, PathStat,
    RegistryCredentials,
};
use crate::docker::{ExecExit, exec_exit};
use crate::stream::lines_stream;

/// A call received by [`MockApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `list_containers` with the label value.
    ListContainers(String),
    /// `create_container`.
    Create(CreateSpec),
    /// `start_container`.
    Start(ContainerId),
    /// `stop_container`.
    Stop(ContainerId),
    /// `kill_container`.
    Kill(ContainerId),
    /// `remove_container`.
    Remove(ContainerId),
    /// `list_images`.
    ListImages(String),
    /// `pull_image`.
    Pull(String, Option<RegistryCredentials>),
    /// `build_image`.
    Build(BuildSpec),
    /// `push_image`.
    Push(String, Option<RegistryCredentials>),
    /// `exec`.
    Exec(ExecSpec),
    /// `upload_archive` with the destination path.
    Upload(ContainerId, String),
    /// `download_archive`.
    Download(ContainerId, String),
    /// `stat_path`.
    Stat(ContainerId, String),
    /// `changes`.
    Changes(ContainerId),
}

#[derive(Debug, Clone)]
struct MockContainer {
    labels: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    containers: BTreeMap<String, MockContainer>,
    images: HashSet<String>,
    calls: Vec<MockCall>,
    failing_commands: Vec<(String, i64)>,
    lost_exit_codes: Vec<String>,
    command_output: Vec<(String, String)>,
    failing_operations: HashSet<&'static str>,
    changes: Vec<String>,
    archives: HashMap<String, Vec<u8>>,
    stats: HashMap<String, PathStat>,
    uploads: Vec<(String, Vec<u8>)>,
    pull_lines: Vec<String>,
    build_lines: Vec<String>,
    push_lines: HashMap<String, Vec<String>>,
}

/// Scriptable in-memory runtime.
#[derive(Debug, Default)]
pub struct MockApi {
    state: Mutex<MockState>,
}

fn command_text(spec: &ExecSpec) -> String {
    spec.command.last().cloned().unwrap_or_default()
}

impl MockApi {
    /// Creates an empty runtime with no images or containers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self, operation: &'static str, target: &str) -> Result<()> {
        if self.state().failing_operations.contains(operation) {
            return Err(BerthError::runtime(operation, target, "injected failure"));
        }
        Ok(())
    }

    /// Marks `reference` as present locally.
    #[must_use]
    pub fn with_image(self, reference: &str) -> Self {
        let _ = self.state().images.insert(reference.to_string());
        self
    }

    /// Adds an existing container carrying `label_key=label_value`.
    pub fn insert_container(&self, label_key: &str, label_value: &str) -> ContainerId {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("stale-{}", state.next_id);
        let labels = HashMap::from([(label_key.to_string(), label_value.to_string())]);
        let _ = state.containers.insert(id.clone(), MockContainer { labels });
        ContainerId::new(id)
    }

    /// Any exec whose command text contains `needle` exits with `code`.
    pub fn fail_command(&self, needle: &str, code: i64) {
        self.state().failing_commands.push((needle.to_string(), code));
    }

    /// Any exec whose command text contains `needle` stops without the
    /// daemon reporting an exit code.
    pub fn lose_exit_code(&self, needle: &str) {
        self.state().lost_exit_codes.push(needle.to_string());
    }

    /// Any exec whose command text contains `needle` prints `output`.
    pub fn command_output(&self, needle: &str, output: &str) {
        self.state()
            .command_output
            .push((needle.to_string(), output.to_string()));
    }

    /// Makes the named operation (`create`, `start`, `remove`, ...) fail.
    pub fn fail_operation(&self, operation: &'static str) {
        let _ = self.state().failing_operations.insert(operation);
    }

    /// Paths reported by `changes`.
    pub fn set_changes(&self, paths: &[&str]) {
        self.state().changes = paths.iter().map(ToString::to_string).collect();
    }

    /// Archive returned when `path` is downloaded.
    pub fn set_archive(&self, path: &str, archive: Vec<u8>) {
        let _ = self.state().archives.insert(path.to_string(), archive);
    }

    /// Stat result for `path`.
    pub fn set_stat(&self, path: &str, stat: PathStat) {
        let _ = self.state().stats.insert(path.to_string(), stat);
    }

    /// Lines streamed back by `pull_image`.
    pub fn set_pull_lines(&self, lines: &[&str]) {
        self.state().pull_lines = lines.iter().map(ToString::to_string).collect();
    }

    /// Lines streamed back by `build_image`.
    pub fn set_build_lines(&self, lines: &[&str]) {
        self.state().build_lines = lines.iter().map(ToString::to_string).collect();
    }

    /// Lines streamed back by `push_image` for `tag`.
    pub fn set_push_lines(&self, tag: &str, lines: &[&str]) {
        let _ = self
            .state()
            .push_lines
            .insert(tag.to_string(), lines.iter().map(ToString::to_string).collect());
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Command texts of every exec, in order.
    pub fn exec_commands(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Exec(spec) => Some(command_text(spec)),
                _ => None,
            })
            .collect()
    }

    /// Uploaded archives with their destination paths.
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.state().uploads.clone()
    }

    /// Containers still present carrying `label_key=label_value`.
    pub fn labeled(&self, label_key: &str, label_value: &str) -> Vec<ContainerId> {
        self.state()
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(label_key).map(String::as_str) == Some(label_value))
            .map(|(id, _)| ContainerId::new(id.clone()))
            .collect()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: MockCall) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl ContainerApi for MockApi {
    async fn list_containers(&self, label_key: &str, label_value: &str) -> Result<Vec<ContainerId>> {
        self.record(MockCall::ListContainers(label_value.to_string()));
        self.check("list containers", label_value)?;
        Ok(self.labeled(label_key, label_value))
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId> {
        self.record(MockCall::Create(spec.clone()));
        self.check("create", &spec.name)?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        let _ = state.containers.insert(
            id.clone(),
            MockContainer {
                labels: spec.labels.clone(),
            },
        );
        Ok(ContainerId::new(id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Start(id.clone()));
        self.check("start", id.as_str())
    }

    async fn stop_container(&self, id: &ContainerId, _grace: Duration) -> Result<()> {
        self.record(MockCall::Stop(id.clone()));
        self.check("stop", id.as_str())
    }

    async fn kill_container(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Kill(id.clone()));
        self.check("kill", id.as_str())
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        self.record(MockCall::Remove(id.clone()));
        self.check("remove", id.as_str())?;
        match self.state().containers.remove(id.as_str()) {
            Some(_) => Ok(()),
            None => Err(BerthError::runtime("remove", id.as_str(), "no such container")),
        }
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<String>> {
        self.record(MockCall::ListImages(reference.to_string()));
        self.check("list images", reference)?;
        Ok(self
            .state()
            .images
            .iter()
            .filter(|i| i.as_str() == reference)
            .map(|i| format!("sha256:{i}"))
            .collect())
    }

    fn pull_image(&self, reference: &str, credentials: Option<RegistryCredentials>) -> ByteStream {
        self.record(MockCall::Pull(reference.to_string(), credentials));
        let mut state = self.state();
        let _ = state.images.insert(reference.to_string());
        lines_stream(state.pull_lines.clone())
    }

    fn build_image(&self, spec: BuildSpec, _context: Vec<u8>) -> ByteStream {
        self.record(MockCall::Build(spec));
        lines_stream(self.state().build_lines.clone())
    }

    fn push_image(&self, tag: &str, credentials: Option<RegistryCredentials>) -> ByteStream {
        self.record(MockCall::Push(tag.to_string(), credentials));
        lines_stream(self.state().push_lines.get(tag).cloned().unwrap_or_default())
    }

    async fn exec(&self, spec: &ExecSpec, io: ExecIo) -> Result<i64> {
        self.record(MockCall::Exec(spec.clone()));
        self.check("exec", spec.container.as_str())?;
        let text = command_text(spec);
        let (code, output) = {
            let state = self.state();
            if !state.containers.contains_key(spec.container.as_str()) {
                return Err(BerthError::runtime("exec", spec.container.as_str(), "no such container"));
            }
            let code = if state.lost_exit_codes.iter().any(|needle| text.contains(needle.as_str())) {
                None
            } else {
                Some(
                    state
                        .failing_commands
                        .iter()
                        .find(|(needle, _)| text.contains(needle.as_str()))
                        .map_or(0, |(_, code)| *code),
                )
            };
            let output: String = state
                .command_output
                .iter()
                .filter(|(needle, _)| text.contains(needle.as_str()))
                .map(|(_, out)| out.as_str())
                .collect();
            (code, output)
        };
        let mut stdout = io.stdout;
        stdout
            .write_all(output.as_bytes())
            .map_err(|e| BerthError::io("<mock stdout>", e))?;
        stdout.flush().map_err(|e| BerthError::io("<mock stdout>", e))?;
        match exec_exit(spec.container.as_str(), Some(false), code)? {
            ExecExit::Exited(code) => Ok(code),
            ExecExit::Running => Err(BerthError::runtime("exec", spec.container.as_str(), "still running")),
        }
    }

    async fn upload_archive(&self, id: &ContainerId, path: &str, archive: Vec<u8>) -> Result<()> {
        self.record(MockCall::Upload(id.clone(), path.to_string()));
        self.check("upload", path)?;
        self.state().uploads.push((path.to_string(), archive));
        Ok(())
    }

    async fn download_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>> {
        self.record(MockCall::Download(id.clone(), path.to_string()));
        self.check("download", path)?;
        self.state()
            .archives
            .get(path)
            .cloned()
            .ok_or_else(|| BerthError::runtime("download", path, "no such path"))
    }

    async fn stat_path(&self, id: &ContainerId, path: &str) -> Result<PathStat> {
        self.record(MockCall::Stat(id.clone(), path.to_string()));
        self.check("stat", path)?;
        Ok(self.state().stats.get(path).cloned().unwrap_or_default())
    }

    async fn changes(&self, id: &ContainerId) -> Result<Vec<String>> {
        self.record(MockCall::Changes(id.clone()));
        self.check("diff", id.as_str())?;
        Ok(self.state().changes.clone())
    }
}
