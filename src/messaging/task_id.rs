use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::DerefMut;
use std::time::SystemTime;

/// Opaque identifier of a task record.
///
/// Ids are short strings, unique within a store and never reused. Callers may
/// supply their own (e.g. a stable name for a recurring maintenance task);
/// otherwise one is generated from a millisecond timestamp plus a per-process
/// counter to break ties within the same millisecond.
#[derive(Debug, Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id.
    pub fn generate() -> Self {
        // (timestamp, counter)
        static LAST: std::sync::Mutex<(u128, u32)> = std::sync::Mutex::new((0, 0));

        let mut guard = LAST.lock().unwrap();
        let (last_timestamp, last_count) = guard.deref_mut();

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis();

        // Counter breaks ties when two ids land in the same millisecond.
        if *last_timestamp == timestamp {
            *last_count += 1;
        } else {
            *last_timestamp = timestamp;
            *last_count = 0;
        }
        let n = *last_count;

        Self(format!("{timestamp:x}-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::TaskId;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_unique() {
        let ids = (0..1000).map(|_| TaskId::generate()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn task_id_serializes_as_plain_string() -> Result<(), anyhow::Error> {
        let id = TaskId::new("purge-policy");
        assert_eq!(serde_json::to_string(&id)?, "\"purge-policy\"");

        let back = serde_json::from_str::<TaskId>("\"purge-policy\"")?;
        assert_eq!(back, id);
        Ok(())
    }
}
