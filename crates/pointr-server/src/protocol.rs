// JSON messages exchanged with browser clients over the WebSocket.
//
// Every message is an object with a SCREAMING_SNAKE_CASE `type` field. A
// client opens with HELLO, then sends user actions (JOIN, ADD_STORY, ...);
// the server answers with a VIEW after every change.

use serde::{Deserialize, Serialize};

use pointr_core::model::ParticipantId;
use pointr_core::{ClientView, UserAction};

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// First message on a connection. Without a `session_id` a fresh session
/// is created; `participant_id` is the identity the client remembers for
/// that session, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(Hello),
    Action(UserAction),
}

const HELLO_TYPE: &str = "HELLO";

/// Decode one text frame. HELLO is told apart by its `type` tag; anything
/// else must be a [`UserAction`].
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("type").and_then(|t| t.as_str()) == Some(HELLO_TYPE) {
        Ok(ClientMessage::Hello(serde_json::from_value(value)?))
    } else {
        Ok(ClientMessage::Action(serde_json::from_value(value)?))
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Full render state; sent on attach and after every change.
    View { view: ClientView },
    /// The connection could not be set up; it is closed after this.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pointr_core::SessionId;
    use uuid::Uuid;

    #[test]
    fn hello_with_and_without_fields() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"type":"HELLO","session_id":"team-7","participant_id":"{id}"}}"#);
        assert_eq!(
            parse_client_message(&text).unwrap(),
            ClientMessage::Hello(Hello {
                session_id: Some("team-7".into()),
                participant_id: Some(id),
            })
        );

        assert_eq!(
            parse_client_message(r#"{"type":"HELLO"}"#).unwrap(),
            ClientMessage::Hello(Hello::default())
        );
    }

    #[test]
    fn actions_decode_by_tag() {
        assert_eq!(
            parse_client_message(r#"{"type":"JOIN","name":"Ada"}"#).unwrap(),
            ClientMessage::Action(UserAction::Join { name: "Ada".into() })
        );
        assert_eq!(
            parse_client_message(r#"{"type":"SELECT_POINTS","points":5}"#).unwrap(),
            ClientMessage::Action(UserAction::SelectPoints { points: 5 })
        );
        assert_eq!(
            parse_client_message(r#"{"type":"SUBMIT_VOTE"}"#).unwrap(),
            ClientMessage::Action(UserAction::SubmitVote)
        );

        let story = Uuid::new_v4();
        let text = format!(r#"{{"type":"START_VOTING","story_id":"{story}"}}"#);
        assert_eq!(
            parse_client_message(&text).unwrap(),
            ClientMessage::Action(UserAction::StartVoting { story_id: story })
        );
    }

    #[test]
    fn unknown_or_malformed_messages_are_errors() {
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
        assert!(parse_client_message(r#"{"type":"JOIN"}"#).is_err());
        assert!(parse_client_message(r#"{"name":"Ada"}"#).is_err());
    }

    #[test]
    fn server_messages_carry_type_tag() {
        let err = ServerMessage::Error {
            message: "boom".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["message"], "boom");

        let view = ClientView {
            session_id: SessionId::parse("s").unwrap(),
            me: None,
            stories: vec![],
            participants: vec![],
            voting_active: false,
            active_story: None,
            votes: vec![],
            vote_options: vec![1, 2, 3, 5, 8, 13],
            selected_points: None,
            can_end_voting: false,
            error: None,
        };
        let json = serde_json::to_value(ServerMessage::View { view }).unwrap();
        assert_eq!(json["type"], "VIEW");
        assert_eq!(json["view"]["session_id"], "s");
        assert_eq!(json["view"]["vote_options"][5], 13);
    }
}
