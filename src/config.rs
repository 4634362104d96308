// SPDX-License-Identifier: PMPL-1.0-or-later

//! Agent configuration: where helper tools live and which `tc` to run.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const TOOLS_DIR_ENV: &str = "CHAOS_AGENT_TOOLS_DIR";
pub const TC_ENV: &str = "CHAOS_AGENT_TC";

const DEFAULT_TC: &str = "tc";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub tools_dir: Option<PathBuf>,
    #[serde(default)]
    pub tc: Option<String>,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("parsing json agent config {}", path.display())),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing yaml agent config {}", path.display())),
            _ => Err(anyhow!(
                "unsupported agent config extension for {}",
                path.display()
            )),
        }
    }

    /// Environment variables win over file values.
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = env::var(TOOLS_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.tools_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(tc) = env::var(TC_ENV) {
            if !tc.trim().is_empty() {
                self.tc = Some(tc);
            }
        }
        self
    }

    pub fn tc_program(&self) -> &str {
        self.tc.as_deref().unwrap_or(DEFAULT_TC)
    }

    /// Falls back to the directory holding the running executable, which is
    /// where cargo installs the bundled helper binaries.
    pub fn tools_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.tools_dir {
            return Ok(dir.clone());
        }
        let exe = env::current_exe().context("locating current executable")?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("executable {} has no parent directory", exe.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "tools_dir: /opt/chaos/tools\ntc: /sbin/tc").unwrap();
        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.tools_dir, Some(PathBuf::from("/opt/chaos/tools")));
        assert_eq!(config.tc_program(), "/sbin/tc");
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        assert!(AgentConfig::load(file.path()).is_err());
    }

    #[test]
    fn defaults_to_plain_tc() {
        assert_eq!(AgentConfig::default().tc_program(), "tc");
    }
}
