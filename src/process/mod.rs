use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::{Child, Command};

use crate::error::{BunkitError, Result};
use crate::storage::InstallDirectory;
use crate::storage::manifest::VersionMetadata;
use crate::util::wait_for_cancel;
use crate::version::Version;

/// A resolved, ready-to-execute installed runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Runtime {
    metadata: VersionMetadata,
    executable_path: PathBuf,
}

impl Runtime {
    pub fn new(metadata: VersionMetadata, executable_path: PathBuf) -> Self {
        Self {
            metadata,
            executable_path,
        }
    }

    /// Locate the executable for a manifest entry inside `dir`.
    pub fn from_metadata(metadata: VersionMetadata, dir: &InstallDirectory) -> Self {
        let executable_path = dir.executable_path(&metadata.hash);
        Self::new(metadata, executable_path)
    }

    pub fn version(&self) -> Version {
        self.metadata.version
    }

    pub fn metadata(&self) -> &VersionMetadata {
        &self.metadata
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    /// Invocation of the runtime with `args` passed verbatim and inherited stdio.
    pub fn command<I, S>(&self, args: I, working_dir: &Path) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.executable_path);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    pub fn spawn<I, S>(&self, args: I, working_dir: &Path) -> Result<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        debug!(
            "run: {} in {}",
            self.executable_path.display(),
            working_dir.display()
        );
        Ok(self.command(args, working_dir).spawn()?)
    }

    /// Run the runtime to completion and return its exit code.
    ///
    /// When `cancel` is raised the whole process tree is killed before
    /// [`BunkitError::Cancelled`] is returned.
    pub async fn run<I, S>(
        &self,
        args: I,
        working_dir: &Path,
        cancel: Option<&AtomicBool>,
    ) -> Result<i32>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = self.spawn(args, working_dir)?;
        info!("run: started {} (pid {:?})", self.version(), child.id());

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = wait_for_cancel(cancel) => {
                terminate_tree(&mut child).await;
                return Err(BunkitError::Cancelled(format!(
                    "runtime {} cancelled by caller",
                    self.version()
                )));
            }
        };

        let code = exit_code(status);
        debug!("run: {} exited with {code}", self.version());
        Ok(code)
    }
}

/// Kill every descendant of `child`, then the child itself, and reap it.
async fn terminate_tree(child: &mut Child) {
    if let Some(root) = child.id() {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let descendants = descendant_pids(&system, Pid::from_u32(root));
        if !descendants.is_empty() {
            debug!("run: killing {} descendant process(es)", descendants.len());
        }
        for pid in descendants.iter().rev() {
            if let Some(process) = system.process(*pid)
                && !process.kill()
            {
                debug!("run: could not kill descendant {pid}");
            }
        }
    }
    if let Err(err) = child.kill().await {
        warn!("run: failed to kill runtime process: {err}");
    }
}

/// Descendants of `root`, parents before children.
fn descendant_pids(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for child in children.get(&pid).into_iter().flatten() {
            found.push(*child);
            queue.push_back(*child);
        }
    }
    found
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
