//! Utility functions used to extract data from procfs

use std::{
    fs::{self, File},
    io::{self, BufReader, prelude::*},
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading file failed {path}")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },
    #[error("parent for process {0} not found")]
    ParentNotFound(u32),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

impl ProcfsError {
    /// True when the process doesn't exist (anymore).
    pub fn is_not_found(&self) -> bool {
        match self {
            ProcfsError::ReadFile { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Returns the command name for the given process.
pub fn get_process_comm(pid: u32) -> Result<String, ProcfsError> {
    let path = format!("/proc/{pid}/comm");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;
    Ok(data.trim().to_owned())
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: u32) -> Result<u32, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(value) = line.strip_prefix("PPid:") {
            return Ok(value.trim().parse()?);
        }
    }

    Err(ProcfsError::ParentNotFound(pid))
}
