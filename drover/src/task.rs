//! The wire format between the driver and remote workers.

use serde::{Deserialize, Serialize};

use crate::fs::FileSystemKind;
use crate::split::InputSplit;

/// The phase of a job a task belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Map,
    Reduce,
}

/// A serializable description of a single unit of work, carrying everything a
/// remote worker needs to initialize itself and execute the task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "jobNumber")]
    pub job_number: usize,

    pub phase: Phase,

    #[serde(rename = "binID")]
    pub bin_id: u64,

    #[serde(rename = "intermediateBins")]
    pub intermediate_bins: u64,

    pub splits: Vec<InputSplit>,

    #[serde(rename = "filesystemKind")]
    pub file_system_kind: FileSystemKind,

    #[serde(rename = "workingLocation")]
    pub working_location: String,

    pub cleanup: bool,
}

/// What a completed task reports back to the driver.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "bytesRead")]
    pub bytes_read: u64,

    #[serde(rename = "bytesWritten")]
    pub bytes_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_round_trips_through_json() {
        let task = Task {
            job_number: 2,
            phase: Phase::Map,
            bin_id: 7,
            intermediate_bins: 12,
            splits: vec![InputSplit {
                filename: "s3://bucket/input".to_string(),
                start_offset: 0,
                end_offset: 99,
            }],
            file_system_kind: FileSystemKind::S3,
            working_location: "s3://bucket/work".to_string(),
            cleanup: true,
        };

        let payload = serde_json::to_string(&task).unwrap();
        let decoded: Task = serde_json::from_str(&payload).unwrap();

        assert_eq!(decoded.job_number, 2);
        assert_eq!(decoded.phase, Phase::Map);
        assert_eq!(decoded.bin_id, 7);
        assert_eq!(decoded.intermediate_bins, 12);
        assert_eq!(decoded.splits, task.splits);
        assert_eq!(decoded.file_system_kind, FileSystemKind::S3);
        assert!(decoded.cleanup);
    }

    #[test]
    fn wire_field_names_are_stable() {
        let task = Task {
            job_number: 0,
            phase: Phase::Reduce,
            bin_id: 1,
            intermediate_bins: 1,
            splits: Vec::new(),
            file_system_kind: FileSystemKind::Local,
            working_location: ".".to_string(),
            cleanup: false,
        };

        let value: serde_json::Value = serde_json::to_value(&task).unwrap();
        for field in [
            "jobNumber",
            "phase",
            "binID",
            "intermediateBins",
            "splits",
            "filesystemKind",
            "workingLocation",
            "cleanup",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }

        let result = serde_json::to_value(TaskResult {
            bytes_read: 1,
            bytes_written: 2,
        })
        .unwrap();
        assert!(result.get("bytesRead").is_some());
        assert!(result.get("bytesWritten").is_some());
    }
}
