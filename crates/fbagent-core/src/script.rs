//! Scripted installer.
//!
//! Runs fastboot commands from a file through the same engine as the
//! interactive loop, one line at a time. `cmd#/path` stages `/path` as the
//! download before running `cmd`. The first failing command stops the run.
//! The download buffer stays locked for the whole run, so a host connecting
//! meanwhile waits until the script is done.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::download::DownloadError;
use crate::engine::{Engine, Session};
use crate::protocol::Response;
use crate::transport::{Transport, TransportError, TransportKind};

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("cannot read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: cannot stage {path}: {source}")]
    Preload {
        line: usize,
        path: PathBuf,
        #[source]
        source: DownloadError,
    },

    #[error("line {line}: '{command}' failed")]
    CommandFailed { line: usize, command: String },
}

/// One command of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    /// 1-based line number in the script file.
    pub line: usize,
    pub command: String,
    /// File to stage as the download first.
    pub preload: Option<PathBuf>,
}

pub fn parse_script(text: &str) -> Vec<ScriptStep> {
    text.lines()
        .enumerate()
        .filter_map(|(i, raw)| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (command, preload) = match line.split_once('#') {
                Some((cmd, path)) if !path.trim().is_empty() => {
                    (cmd.trim(), Some(PathBuf::from(path.trim())))
                }
                Some((cmd, _)) => (cmd.trim(), None),
                None => (line, None),
            };
            Some(ScriptStep {
                line: i + 1,
                command: command.to_string(),
                preload,
            })
        })
        .collect()
}

pub fn load_script(path: &Path) -> Result<Vec<ScriptStep>, ScriptError> {
    let text = fs::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_script(&text))
}

/// Transport standing in for the host while a script runs.
#[derive(Default)]
pub struct ScriptSink;

impl Transport for ScriptSink {
    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match Response::parse(data) {
            Ok(response) => debug!(code = %response.code, text = %response.text, "Script response"),
            Err(_) => debug!(len = data.len(), "Script output"),
        }
        Ok(data.len())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }
}

/// Run `steps` in order, returning how many succeeded.
#[instrument(skip_all, fields(steps = steps.len()))]
pub fn run_script(engine: &Engine, steps: &[ScriptStep]) -> Result<usize, ScriptError> {
    let mut session = Session::new(Box::new(ScriptSink), engine.services().observer.clone());
    let mut download = engine.download();

    for step in steps {
        info!(line = step.line, command = %step.command, "Script step");
        session.begin();
        if let Some(path) = &step.preload {
            download
                .load_file(path)
                .map_err(|source| ScriptError::Preload {
                    line: step.line,
                    path: path.clone(),
                    source,
                })?;
        }
        engine.execute(&mut session, &mut download, &step.command);
        if session.last_ack() != Some(true) {
            warn!(line = step.line, command = %step.command, "Script stopped");
            return Err(ScriptError::CommandFailed {
                line: step.line,
                command: step.command.clone(),
            });
        }
    }
    info!(count = steps.len(), "Script complete");
    Ok(steps.len())
}
