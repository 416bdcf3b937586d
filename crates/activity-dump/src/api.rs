//! Requests and responses exchanged with the control plane.

use std::{error::Error, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::manager::ManagerError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpActivityParams {
    pub comm: String,
    /// Minutes. The configured default timeout when missing.
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub differentiate_args: bool,
    #[serde(default)]
    pub with_graph: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopActivityDumpParams {
    pub comm: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListActivityDumpsParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateProfileParams {
    pub activity_dump_file: PathBuf,
}

/// Metadata of an activity dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityActivityDumpMessage {
    pub comm: String,
    pub container_id: String,
    /// RFC 3339 start time.
    pub start: String,
    /// Human readable timeout, e.g. `30m`.
    pub timeout: String,
    pub differentiate_args: bool,
    pub with_graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_file: Option<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityActivityDumpListMessage {
    pub dumps: Vec<SecurityActivityDumpMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityActivityDumpStoppedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityProfileGeneratedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error and its sources on a single line.
pub(crate) fn describe(err: &dyn Error) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        description.push_str(": ");
        description.push_str(&err.to_string());
        source = err.source();
    }
    description
}

macro_rules! from_manager_error {
    ($($message:ty),*) => {
        $(
            impl From<ManagerError> for $message {
                fn from(err: ManagerError) -> Self {
                    Self {
                        error: Some(describe(&err)),
                        ..Default::default()
                    }
                }
            }
        )*
    };
}

from_manager_error!(
    SecurityActivityDumpMessage,
    SecurityActivityDumpListMessage,
    SecurityActivityDumpStoppedMessage,
    SecurityProfileGeneratedMessage
);
