use serde::{Deserialize, Serialize};

use crate::core::{Hash32, Payload};
use crate::resource::{ResourceKey, Stamp};
use crate::task::TaskId;

/// Something a task observed while it was executing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    /// Another task was required and produced an output with this
    /// fingerprint, or failed when `output` is `None`.
    Task { task: TaskId, output: Option<Hash32> },
    /// A resource was read (or looked for) while it had this stamp.
    Resource { key: ResourceKey, stamp: Stamp },
}

/// The record of a task's last successful execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub task: TaskId,
    /// Fingerprint of the arguments combined with the definition version.
    pub args: Hash32,
    pub output: Payload,
    /// Dependencies in the order they were observed.
    pub dependencies: Vec<Dependency>,
}

impl TraceRecord {
    /// Human readable dump, handy when debugging why a task re-ran.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub(crate) fn is_intact(&self) -> bool {
        self.output.is_intact() && self.task.args().is_intact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_dump() {
        let record = TraceRecord {
            task: TaskId::new("square", &4u64).unwrap(),
            args: Hash32::default(),
            output: Payload::encode(&16u64).unwrap(),
            dependencies: vec![
                Dependency::Resource {
                    key: ResourceKey::new("str", "a.str"),
                    stamp: Stamp::Missing,
                },
                Dependency::Task {
                    task: TaskId::new("parse", &"a.str").unwrap(),
                    output: None,
                },
            ],
        };

        let json = record.to_json().unwrap();
        assert!(json.contains("\"square\""));
        assert!(json.contains("\"Missing\""));
        assert!(json.contains("\"output\": null"));
    }
}
