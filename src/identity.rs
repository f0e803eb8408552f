use crate::data::WorkloadIdentity;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("no process with pid {pid}")]
    ProcessLookup { pid: u32 },
    #[error("process {pid} name {name:?} is not of the form <container>@<namespace>/<pod>")]
    MalformedIdentity { pid: u32, name: String },
}

/// OS process table, looked up by pid.
pub trait ProcessTable: Send + Sync {
    /// Display name of the process, or `NotFound` if it no longer exists.
    fn process_name(&self, pid: u32) -> io::Result<String>;
}

/// Reads process display names from `/proc/<pid>/cmdline`.
///
/// `comm` is not used because the kernel cuts it at 15 bytes, which is
/// shorter than any real `<container>@<namespace>/<pod>` name.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessTable for ProcFs {
    fn process_name(&self, pid: u32) -> io::Result<String> {
        let cmdline = std::fs::read(self.root.join(pid.to_string()).join("cmdline"))?;
        Ok(display_name(&cmdline))
    }
}

/// Argument separators (and the terminating NUL) become spaces.
fn display_name(cmdline: &[u8]) -> String {
    String::from_utf8_lossy(cmdline).replace('\0', " ")
}

/// Maps a pid to the workload it belongs to.
///
/// Nothing is cached: pids are recycled, so every call consults the live
/// process table.
pub trait WorkloadIdentityResolver: Send + Sync {
    fn resolve(&self, pid: u32) -> Result<WorkloadIdentity, IdentityError>;
}

/// Resolves identities from process names following the
/// `<container>@<namespace>/<pod>` convention.
pub struct ProcessNameResolver<T> {
    table: T,
}

impl<T: ProcessTable> ProcessNameResolver<T> {
    pub fn new(table: T) -> Self {
        Self { table }
    }
}

impl<T: ProcessTable> WorkloadIdentityResolver for ProcessNameResolver<T> {
    fn resolve(&self, pid: u32) -> Result<WorkloadIdentity, IdentityError> {
        let name = self
            .table
            .process_name(pid)
            .map_err(|_| IdentityError::ProcessLookup { pid })?;
        parse_identity(&name).ok_or(IdentityError::MalformedIdentity { pid, name })
    }
}

/// Splits `"<container>@<namespace>/<pod> "` into its parts.
///
/// The container ends at the first `@`, the namespace at the first `/`
/// after it; the pod is the rest with surrounding whitespace trimmed. A `/`
/// before the `@`, a missing delimiter, or an empty part is rejected.
pub fn parse_identity(name: &str) -> Option<WorkloadIdentity> {
    let (container, rest) = name.split_once('@')?;
    let (namespace, pod) = rest.split_once('/')?;
    let pod = pod.trim();

    if container.contains('/') || container.is_empty() || namespace.is_empty() || pod.is_empty()
    {
        return None;
    }

    Some(WorkloadIdentity {
        container: container.to_string(),
        namespace: namespace.to_string(),
        pod: pod.to_string(),
    })
}
