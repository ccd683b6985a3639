use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::models::TaskId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLogStream {
    Stdout,
    Stderr,
    System,
}

impl TaskLogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for TaskLogStream {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "system" => Ok(Self::System),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskLogLine {
    pub task_id: TaskId,
    pub sequence: u64,
    pub stream: TaskLogStream,
    pub message: String,
    pub created_at: SystemTime,
}
