// src/tool.rs

//! The external unpacking tool.
//!
//! Extraction only depends on a narrow contract: the tool is started as
//! `tool x <archive> <dest> -y [-p<password>] [<background flag>]` and exit
//! code zero means success. Listing contents (`tool l -y <archive>`) is the
//! one place the tool's output is parsed.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no unpacking tool configured or found")]
    NotFound,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("listing failed: {0}")]
    Listing(String),
}

/// What to extract and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackRequest {
    pub archive: PathBuf,
    pub destination: PathBuf,
    pub password: Option<String>,
}

/// A started tool process. Polled, never awaited, so the caller stays free.
pub trait UnpackProcess: Send {
    fn id(&self) -> Option<u32>;
    /// `Some(code)` once the process has exited.
    fn try_wait(&mut self) -> Result<Option<i32>, ToolError>;
    /// Polite stop request.
    fn terminate(&mut self) -> Result<(), ToolError>;
    fn kill(&mut self) -> Result<(), ToolError>;
}

pub trait UnpackTool: Send + Sync {
    fn spawn(&self, request: &UnpackRequest) -> Result<Box<dyn UnpackProcess>, ToolError>;
}

/// Runs a RAR-compatible command line tool.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: PathBuf,
    background_flag: Option<String>,
}

impl CommandTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let background_flag = cfg!(windows).then(|| "-ibck+".to_string());
        Self { program: program.into(), background_flag }
    }

    pub fn with_background_flag(mut self, flag: Option<String>) -> Self {
        self.background_flag = flag;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn extract_args(&self, request: &UnpackRequest) -> Vec<String> {
        let mut args = vec![
            "x".to_string(),
            request.archive.to_string_lossy().into_owned(),
            request.destination.to_string_lossy().into_owned(),
            "-y".to_string(),
        ];
        if let Some(password) = request.password.as_deref().filter(|p| !p.is_empty()) {
            args.push(format!("-p{password}"));
        }
        if let Some(flag) = &self.background_flag {
            args.push(flag.clone());
        }
        args
    }

    /// Lists the entries of an archive without extracting it.
    pub async fn list_contents(&self, archive: &Path) -> Result<ArchiveListing, ToolError> {
        if !archive.exists() {
            return Err(ToolError::Listing(format!("archive not found: {}", archive.display())));
        }
        let output = Command::new(&self.program)
            .arg("l")
            .arg("-y")
            .arg(archive)
            .output()
            .await
            .map_err(|source| ToolError::Spawn { program: self.program.clone(), source })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Listing(stderr.trim().to_string()));
        }
        parse_listing(&String::from_utf8_lossy(&output.stdout))
    }
}

impl UnpackTool for CommandTool {
    fn spawn(&self, request: &UnpackRequest) -> Result<Box<dyn UnpackProcess>, ToolError> {
        let child = Command::new(&self.program)
            .args(self.extract_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ToolError::Spawn { program: self.program.clone(), source })?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl UnpackProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, ToolError> {
        // Killed by a signal: no code, report as failure.
        Ok(self.child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<(), ToolError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<(), ToolError> {
        self.child.start_kill()?;
        Ok(())
    }

    fn kill(&mut self) -> Result<(), ToolError> {
        self.child.start_kill()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub packed: u64,
    pub ratio: String,
    pub date: String,
    pub time: String,
    pub attributes: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveListing {
    pub entries: Vec<ArchiveEntry>,
    pub total_size: u64,
    pub file_count: usize,
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with("---") && trimmed.chars().all(|c| c == '-' || c == ' ')
}

fn parse_number(field: &str) -> Option<u64> {
    field.replace(',', "").parse().ok()
}

/// Parses the columnar listing between the first two dashed separator lines.
/// Each row is `name size packed ratio date time attributes`; names may
/// contain spaces, so columns are taken from the right.
pub fn parse_listing(output: &str) -> Result<ArchiveListing, ToolError> {
    let mut lines = output.lines();
    if !lines.by_ref().any(is_separator) {
        return Err(ToolError::Listing("no file list found".to_string()));
    }

    let mut listing = ArchiveListing::default();
    for line in lines.take_while(|line| !is_separator(line)) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }
        let (name, columns) = fields.split_at(fields.len() - 6);
        let Some(packed) = parse_number(columns[1]) else {
            continue;
        };
        let name = name.join(" ");
        let attributes = columns[5].to_string();
        let kind = if attributes.starts_with(['D', 'd']) || attributes.contains('D') || name.ends_with('/') {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let size = parse_number(columns[0]).unwrap_or(0);

        listing.total_size += size;
        if kind == EntryKind::File {
            listing.file_count += 1;
        }
        listing.entries.push(ArchiveEntry {
            name,
            size,
            packed,
            ratio: columns[2].to_string(),
            date: columns[3].to_string(),
            time: columns[4].to_string(),
            attributes,
            kind,
        });
    }
    Ok(listing)
}
