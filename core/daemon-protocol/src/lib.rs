//! Data model shared by the hpcaas agent and the control plane.
//!
//! The agent is the authority on state transitions; the control plane reads
//! `DaemonState` and pushes `DeclaredState` updates. Field names are part of
//! the snapshot format and must stay stable so older snapshots still load.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SNAPSHOT_VERSION: u32 = 1;
pub const MAX_CODE_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodeStatus {
    #[default]
    Waiting,
    Missing,
    Running,
    Stopped,
    Killed,
    Error,
    FailedToStart,
    FailedToKill,
}

impl CodeStatus {
    /// Whether `code_pid` / `code_started_method` describe a live run.
    pub fn has_live_process(&self) -> bool {
        matches!(self, CodeStatus::Running | CodeStatus::Killed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Waiting => "waiting",
            CodeStatus::Missing => "missing",
            CodeStatus::Running => "running",
            CodeStatus::Stopped => "stopped",
            CodeStatus::Killed => "killed",
            CodeStatus::Error => "error",
            CodeStatus::FailedToStart => "failed_to_start",
            CodeStatus::FailedToKill => "failed_to_kill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartedMethod {
    ByAgent,
    Externally,
}

/// Supervision state of the node. One instance per agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    #[serde(default)]
    pub code_name: String,
    #[serde(default)]
    pub code_arguments: Vec<String>,
    #[serde(default)]
    pub code_params: BTreeMap<String, String>,
    #[serde(default)]
    pub code_status: CodeStatus,
    #[serde(default)]
    pub code_started_method: Option<StartedMethod>,
    #[serde(default, rename = "codePID")]
    pub code_pid: Option<u32>,
    #[serde(default)]
    pub code_stdout: String,
    #[serde(default)]
    pub code_stderr: String,
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub ssh_addresses: BTreeMap<u32, String>,
    #[serde(default)]
    pub authorization_key: String,
}

impl DaemonState {
    pub fn with_code_name(code_name: impl Into<String>) -> Self {
        Self {
            code_name: code_name.into(),
            code_arguments: Vec::new(),
            code_params: BTreeMap::new(),
            code_status: CodeStatus::Waiting,
            code_started_method: None,
            code_pid: None,
            code_stdout: String::new(),
            code_stderr: String::new(),
            error_messages: Vec::new(),
            ssh_addresses: BTreeMap::new(),
            authorization_key: String::new(),
        }
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::with_code_name(String::new())
    }
}

/// Update pushed by the control plane. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeclaredState {
    #[serde(default)]
    pub code_name: Option<String>,
    #[serde(default)]
    pub code_arguments: Option<Vec<String>>,
    #[serde(default)]
    pub code_params: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub ssh_addresses: Option<BTreeMap<u32, String>>,
    #[serde(default)]
    pub authorization_key: Option<String>,
}

impl DeclaredState {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(name) = &self.code_name {
            validate_code_name(name)?;
        }
        if let Some(params) = &self.code_params {
            for key in params.keys() {
                if key.is_empty() || key.contains('=') || key.contains('\0') {
                    return Err(ErrorInfo::new(
                        "invalid_code_params",
                        format!("parameter name {:?} is not a valid environment key", key),
                    ));
                }
            }
        }
        if let Some(addresses) = &self.ssh_addresses {
            for (id, address) in addresses {
                validate_ssh_address(*id, address)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub fn parse_declared_state(params: Value) -> Result<DeclaredState, ErrorInfo> {
    let declared: DeclaredState = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("state payload is invalid JSON: {}", err),
        )
    })?;
    declared.validate()?;
    Ok(declared)
}

/// A code name is a plain file name under the code root.
pub fn validate_code_name(name: &str) -> Result<(), ErrorInfo> {
    if name.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "codeName is required"));
    }
    if name.len() > MAX_CODE_NAME_LEN {
        return Err(ErrorInfo::new(
            "invalid_code_name",
            format!("codeName must be {} bytes or fewer", MAX_CODE_NAME_LEN),
        ));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(ErrorInfo::new(
            "invalid_code_name",
            "codeName must be a plain file name",
        ));
    }
    Ok(())
}

fn validate_ssh_address(id: u32, address: &str) -> Result<(), ErrorInfo> {
    let valid = match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ErrorInfo::new(
            "invalid_ssh_address",
            format!("address for container {} must be ip:port, got {:?}", id, address),
        ))
    }
}
