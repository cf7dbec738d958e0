//! Wire Protocol
//!
//! JSON messages exchanged with a connected client, internally tagged by
//! `"type"`.

use crate::domain::entities::{JobRequest, JobResponse};
use crate::domain::value_objects::{Difficulty, Port};
use crate::error::{HarnessError, HarnessResult};
use kernel::id::ChallengeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    SubmitJob { request: JobRequest },
    SubmitChallenge { response: String },
}

impl ClientMessage {
    pub fn parse(text: &str) -> HarnessResult<Self> {
        serde_json::from_str(text).map_err(|e| HarnessError::MalformedMessage(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::SubmitJob { .. } => "submitJob",
            ClientMessage::SubmitChallenge { .. } => "submitChallenge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Challenge {
        id: ChallengeId,
        prefix: String,
        difficulty: Difficulty,
    },
    Queued {
        port: Port,
    },
    Position {
        ahead: u64,
    },
    Accepted {
        response: JobResponse,
        launch_at_ms: i64,
    },
    Processing {
        response: JobResponse,
        lease_until_ms: i64,
    },
    Done,
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> HarnessResult<String> {
        serde_json::to_string(self).map_err(|e| HarnessError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_parse_client_messages() {
        let msg = ClientMessage::parse(r#"{"type":"submitJob","request":{"program":"1+1"}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::SubmitJob {
                request: JobRequest(json!({ "program": "1+1" }))
            }
        );

        let msg = ClientMessage::parse(r#"{"type":"submitChallenge","response":"4242"}"#).unwrap();
        assert_eq!(msg.name(), "submitChallenge");
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        for text in [
            r#"{"type":"launchNow"}"#,
            r#"{"type":"submitChallenge","response":42}"#,
            "not json",
        ] {
            assert!(matches!(
                ClientMessage::parse(text),
                Err(HarnessError::MalformedMessage(_))
            ));
        }
    }

    #[test]
    fn test_server_message_shapes() {
        let value: Value = serde_json::from_str(
            &ServerMessage::Accepted {
                response: JobResponse {
                    url: "http://localhost:2048/".into(),
                },
                launch_at_ms: 1_700_000_000_000,
            }
            .to_json()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "accepted",
                "response": { "url": "http://localhost:2048/" },
                "launchAtMs": 1_700_000_000_000i64,
            })
        );

        let value: Value = serde_json::from_str(&ServerMessage::Done.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "type": "done" }));

        let value: Value = serde_json::from_str(
            &ServerMessage::Queued {
                port: Port::new(4096).unwrap(),
            }
            .to_json()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(value, json!({ "type": "queued", "port": 4096 }));
    }
}
