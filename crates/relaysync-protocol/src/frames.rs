//! Frame types for the relay protocol.
//!
//! Every frame is a JSON array whose first element names the frame type.
//! Client frames travel to a relay, relay frames come back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::event::{Event, EventId};
use crate::filter::Filter;

/// Frames sent by a client to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum ClientMessage {
    /// `["REQ", <sub id>, <filter>...]`
    Req {
        /// Subscription id chosen by the client.
        subscription_id: String,
        /// Filters, OR-ed together.
        filters: Vec<Filter>,
    },
    /// `["CLOSE", <sub id>]`
    Close {
        /// Subscription to stop.
        subscription_id: String,
    },
    /// `["EVENT", <event>]`
    Event(Event),
    /// `["AUTH", <signed auth event>]`
    Auth(Event),
}

/// Frames sent by a relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum RelayMessage {
    /// `["EVENT", <sub id>, <event>]`
    Event {
        /// Subscription the event belongs to.
        subscription_id: String,
        /// The event.
        event: Event,
    },
    /// `["EOSE", <sub id>]`
    EndOfStoredEvents {
        /// Subscription whose stored events are exhausted.
        subscription_id: String,
    },
    /// `["CLOSED", <sub id>, <message>]`
    Closed {
        /// Subscription the relay refused or ended.
        subscription_id: String,
        /// Reason, usually with a machine-readable prefix.
        message: String,
    },
    /// `["NOTICE", <message>]`
    Notice(String),
    /// `["OK", <event id>, <accepted>, <message>]`
    Ok {
        /// Event the result refers to.
        event_id: EventId,
        /// Whether the relay accepted it.
        accepted: bool,
        /// Optional explanation.
        message: String,
    },
    /// `["AUTH", <challenge>]`
    Auth {
        /// Challenge string to sign.
        challenge: String,
    },
}

impl ClientMessage {
    /// Create a REQ frame.
    #[must_use]
    pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            subscription_id: subscription_id.into(),
            filters,
        }
    }

    /// Create a CLOSE frame.
    #[must_use]
    pub fn close(subscription_id: impl Into<String>) -> Self {
        ClientMessage::Close {
            subscription_id: subscription_id.into(),
        }
    }

    /// Frame type label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Req { .. } => "REQ",
            ClientMessage::Close { .. } => "CLOSE",
            ClientMessage::Event(_) => "EVENT",
            ClientMessage::Auth(_) => "AUTH",
        }
    }
}

impl RelayMessage {
    /// Create an EVENT frame.
    #[must_use]
    pub fn event(subscription_id: impl Into<String>, event: Event) -> Self {
        RelayMessage::Event {
            subscription_id: subscription_id.into(),
            event,
        }
    }

    /// Create an EOSE frame.
    #[must_use]
    pub fn eose(subscription_id: impl Into<String>) -> Self {
        RelayMessage::EndOfStoredEvents {
            subscription_id: subscription_id.into(),
        }
    }

    /// Create a CLOSED frame.
    #[must_use]
    pub fn closed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    /// Create an AUTH challenge frame.
    #[must_use]
    pub fn auth(challenge: impl Into<String>) -> Self {
        RelayMessage::Auth {
            challenge: challenge.into(),
        }
    }

    /// Subscription id this frame is addressed to, if any.
    #[must_use]
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::EndOfStoredEvents { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

impl From<ClientMessage> for Value {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                arr.extend(filters.iter().map(Filter::to_value));
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Auth(event) => json!(["AUTH", event]),
        }
    }
}

impl From<RelayMessage> for Value {
    fn from(msg: RelayMessage) -> Self {
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::EndOfStoredEvents { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice(message) => json!(["NOTICE", message]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
        }
    }
}

fn frame_parts(value: &Value) -> Result<(&str, &[Value]), String> {
    let arr = value.as_array().ok_or("frame must be a JSON array")?;
    let (head, rest) = arr.split_first().ok_or("frame is empty")?;
    let label = head.as_str().ok_or("frame type must be a string")?;
    Ok((label, rest))
}

fn str_at(rest: &[Value], idx: usize, what: &str) -> Result<String, String> {
    rest.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing {what}"))
}

fn event_at(rest: &[Value], idx: usize) -> Result<Event, String> {
    let raw = rest.get(idx).ok_or("missing event")?;
    serde_json::from_value(raw.clone()).map_err(|e| format!("bad event: {e}"))
}

impl TryFrom<Value> for ClientMessage {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let (label, rest) = frame_parts(&value)?;
        match label {
            "REQ" => {
                let subscription_id = str_at(rest, 0, "subscription id")?;
                let filters = rest[1..]
                    .iter()
                    .map(|v| Filter::from_value(v).map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: str_at(rest, 0, "subscription id")?,
            }),
            "EVENT" => Ok(ClientMessage::Event(event_at(rest, 0)?)),
            "AUTH" => Ok(ClientMessage::Auth(event_at(rest, 0)?)),
            other => Err(format!("unknown client frame {other}")),
        }
    }
}

impl TryFrom<Value> for RelayMessage {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let (label, rest) = frame_parts(&value)?;
        match label {
            "EVENT" => Ok(RelayMessage::Event {
                subscription_id: str_at(rest, 0, "subscription id")?,
                event: event_at(rest, 1)?,
            }),
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents {
                subscription_id: str_at(rest, 0, "subscription id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(rest, 0, "subscription id")?,
                message: str_at(rest, 1, "message").unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice(str_at(rest, 0, "message")?)),
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(rest, 0, "event id")?,
                accepted: rest
                    .get(1)
                    .and_then(Value::as_bool)
                    .ok_or("missing accepted flag")?,
                message: str_at(rest, 2, "message").unwrap_or_default(),
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(rest, 0, "challenge")?,
            }),
            other => Err(format!("unknown relay frame {other}")),
        }
    }
}

/// Machine-readable prefix of a CLOSED or OK message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosedPrefix {
    /// The relay wants the client to authenticate first.
    AuthRequired,
    /// The authenticated identity is not allowed.
    Restricted,
    /// Too many requests.
    RateLimited,
    /// The request was malformed.
    Invalid,
    /// The relay failed internally.
    Error,
    /// Duplicate submission.
    Duplicate,
    /// Anything else, including no prefix.
    Other,
}

/// A parsed CLOSED reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedReason {
    /// Machine-readable prefix.
    pub prefix: ClosedPrefix,
    /// The full message.
    pub message: String,
}

impl ClosedReason {
    /// Parse a relay message of the form `prefix: human text`.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        let message = message.into();
        let prefix = match message.split_once(':').map(|(p, _)| p.trim()) {
            Some("auth-required") => ClosedPrefix::AuthRequired,
            Some("restricted") => ClosedPrefix::Restricted,
            Some("rate-limited") => ClosedPrefix::RateLimited,
            Some("invalid") => ClosedPrefix::Invalid,
            Some("error") => ClosedPrefix::Error,
            Some("duplicate") => ClosedPrefix::Duplicate,
            _ => ClosedPrefix::Other,
        };
        Self { prefix, message }
    }

    /// Check whether the relay asked for authentication.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        self.prefix == ClosedPrefix::AuthRequired
    }
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_shape() {
        let req = ClientMessage::req("sub-1", vec![Filter::new().kind(22), Filter::new().kind(21)]);
        let json: Value = req.clone().into();
        assert_eq!(json[0], "REQ");
        assert_eq!(json[1], "sub-1");
        assert_eq!(json[2]["kinds"][0], 22);
        assert_eq!(json[3]["kinds"][0], 21);
        assert_eq!(ClientMessage::try_from(json).unwrap(), req);
    }

    #[test]
    fn test_relay_frames_parse() {
        let ev = Event::new("e1", "pk", 22, 5);
        let frame = json!(["EVENT", "sub-1", ev]);
        match RelayMessage::try_from(frame).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub-1");
                assert_eq!(event.id, "e1");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let closed = RelayMessage::try_from(json!(["CLOSED", "sub-1"])).unwrap();
        assert_eq!(closed, RelayMessage::closed("sub-1", ""));
        assert_eq!(closed.subscription_id(), Some("sub-1"));
    }

    #[test]
    fn test_unknown_frame_rejected() {
        assert!(RelayMessage::try_from(json!(["COUNT", "x", {}])).is_err());
        assert!(RelayMessage::try_from(json!({"type": "EVENT"})).is_err());
        assert!(RelayMessage::try_from(json!([])).is_err());
    }

    #[test]
    fn test_closed_reason_prefix() {
        let reason = ClosedReason::parse("auth-required: we only serve members");
        assert!(reason.requires_auth());
        assert_eq!(ClosedReason::parse("restricted: no").prefix, ClosedPrefix::Restricted);
        assert_eq!(ClosedReason::parse("bye").prefix, ClosedPrefix::Other);
    }
}
