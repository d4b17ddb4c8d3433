use serde::{Deserialize, Serialize};

use crate::models::db::Platform;

/// Jobs carried on the incoming stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingJob {
    /// A normalized message waiting in the cache under `message_key`.
    NewMessage {
        binding_id: String,
        platform: Platform,
        message_key: String,
    },
    /// An external hook trigger with its JSON payload.
    HookTriggered {
        hook_id: String,
        data: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_wire_format() {
        let job = IncomingJob::NewMessage {
            binding_id: "b1".into(),
            platform: Platform::Telegram,
            message_key: "telegram:b1:42".into(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "NEW_MESSAGE");
        assert_eq!(value["platform"], "telegram");
    }

    #[test]
    fn hook_job_parses() {
        let raw = r#"{"type":"HOOK_TRIGGERED","hook_id":"h1","data":{"name":"juan"}}"#;
        let job: IncomingJob = serde_json::from_str(raw).unwrap();
        match job {
            IncomingJob::HookTriggered { hook_id, data } => {
                assert_eq!(hook_id, "h1");
                assert_eq!(data["name"], "juan");
            }
            other => panic!("unexpected job {other:?}"),
        }
    }
}
