//! Session metadata file (`info`).

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::trace::constants::INFO_FILE;

/// Metadata describing one recording.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub command_line: String,
    /// Printed verbatim; the recorder decides the format.
    pub recorded_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    /// Kernel event filters active while recording.
    #[serde(default)]
    pub kernel_events: Vec<String>,
    /// Relative names of nested sessions recorded by a child `record`.
    #[serde(default)]
    pub child_sessions: Vec<String>,
    #[serde(default)]
    pub incomplete: bool,
}

impl SessionInfo {
    pub fn new(command_line: &str, recorded_time: &str) -> Self {
        Self {
            session_id: new_session_id(),
            command_line: command_line.to_string(),
            recorded_time: recorded_time.to_string(),
            hostname: local_hostname(),
            ..Default::default()
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(INFO_FILE);
        let buf = fs::read_to_string(&path)
            .with_context(|| format!("failed to read session info {}", path.display()))?;
        let info = serde_json::from_str(&buf)
            .with_context(|| format!("malformed session info {}", path.display()))?;
        Ok(info)
    }

    /// Write the metadata file. The new contents go to a temporary file that
    /// is renamed over the old one, so readers never see a partial file.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = dir.join(INFO_FILE);
        let tmp = dir.join(format!(".{INFO_FILE}.tmp"));
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to install {}", path.display()))?;
        Ok(())
    }

    /// Flag an existing session directory as incomplete.
    pub fn mark_incomplete(dir: &Path) -> Result<()> {
        let mut info = Self::load(dir)?;
        if !info.incomplete {
            info.incomplete = true;
            info.store(dir)?;
        }
        Ok(())
    }

    pub fn add_child_session(&mut self, name: &str) {
        if !self.child_sessions.iter().any(|c| c == name) {
            self.child_sessions.push(name.to_string());
        }
    }
}

/// Random 16 hex digit session id.
pub fn new_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}
