use std::{fmt, io};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// The canonical shared state. Opaque to the coordinator: it is stored,
/// replaced wholesale and shipped around, never inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nom(Value);

impl Nom {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The empty object, `{}`.
    pub fn empty() -> Self {
        Self(Value::Object(Default::default()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl Default for Nom {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Nom {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl fmt::Display for Nom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub identify: String,
}

/// A session request. Any combination of fields may be present; see
/// [`Request::action`] for which one wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "is_false")]
    pub bye: bool,
    /// Any value counts, `{"get": false}` included.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub get: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub put: Option<Nom>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Bye,
    Get,
    Put(Nom),
}

impl Request {
    pub fn bye() -> Self {
        Self {
            bye: true,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self {
            get: Some(Value::Bool(true)),
            ..Self::default()
        }
    }

    pub fn put(nom: Nom) -> Self {
        Self {
            put: Some(nom),
            ..Self::default()
        }
    }

    /// Resolves the request to at most one action, `bye` over `get` over `put`.
    pub fn action(self) -> Option<Action> {
        if self.bye {
            Some(Action::Bye)
        } else if self.get.is_some() {
            Some(Action::Get)
        } else {
            self.put.map(Action::Put)
        }
    }
}

/// Coordinator to replica: the canonical state after a `get` or a `put`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update: Nom,
}

/// Everything a replica may send to the coordinator, validated once at the
/// deserialization boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Handshake(Handshake),
    Request(Request),
}

impl Inbound {
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(fields) = &value else {
            return Err(ProtocolError::NotAnObject);
        };

        if fields.contains_key("identify") {
            let handshake: Handshake = serde_json::from_value(value)?;
            Ok(Inbound::Handshake(handshake))
        } else {
            let request: Request = serde_json::from_value(value)?;
            Ok(Inbound::Request(request))
        }
    }
}

// `get` and `put` are keyed on presence, `null` included, so a present field
// must not collapse to `None`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Reads the next non-empty line. `Ok(None)` means the peer closed the stream.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

/// Reads and decodes the next update. Undecodable lines surface as
/// [`io::ErrorKind::InvalidData`] so callers can tell them from transport failures.
pub async fn read_update<R>(reader: &mut R) -> io::Result<Option<Update>>
where
    R: AsyncBufRead + Unpin,
{
    match read_frame(reader).await? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // One JSON object per line, flushed so replicas see updates promptly.
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_handshake() {
        let inbound = Inbound::decode(r#"{"identify":"alice"}"#).expect("decode");
        assert_eq!(
            inbound,
            Inbound::Handshake(Handshake {
                identify: "alice".into()
            })
        );
    }

    #[test]
    fn bye_wins_over_get_and_put() {
        let inbound = Inbound::decode(r#"{"bye":true,"get":true,"put":{"x":1}}"#).expect("decode");
        let Inbound::Request(request) = inbound else {
            panic!("expected request");
        };
        assert_eq!(request.action(), Some(Action::Bye));
    }

    #[test]
    fn get_wins_over_put() {
        let Inbound::Request(request) =
            Inbound::decode(r#"{"get":true,"put":{"x":1}}"#).expect("decode")
        else {
            panic!("expected request");
        };
        assert_eq!(request.action(), Some(Action::Get));
    }

    #[test]
    fn put_null_is_still_a_put() {
        let Inbound::Request(request) = Inbound::decode(r#"{"put":null}"#).expect("decode") else {
            panic!("expected request");
        };
        assert_eq!(request.action(), Some(Action::Put(Nom::new(Value::Null))));
    }

    #[test]
    fn empty_object_is_a_no_op_request() {
        let Inbound::Request(request) = Inbound::decode("{}").expect("decode") else {
            panic!("expected request");
        };
        assert_eq!(request.action(), None);
    }

    #[test]
    fn get_fires_on_presence_whatever_its_value() {
        for line in [
            r#"{"bye":false,"get":false}"#,
            r#"{"get":null}"#,
            r#"{"get":1,"put":{"x":1}}"#,
        ] {
            let Inbound::Request(request) = Inbound::decode(line).expect("decode") else {
                panic!("expected request for {line}");
            };
            assert_eq!(request.action(), Some(Action::Get), "{line}");
        }
    }

    #[test]
    fn false_bye_does_nothing() {
        let Inbound::Request(request) = Inbound::decode(r#"{"bye":false}"#).expect("decode") else {
            panic!("expected request");
        };
        assert_eq!(request.action(), None);
    }

    #[test]
    fn rejects_non_objects_and_garbage() {
        assert!(matches!(
            Inbound::decode("[1,2,3]"),
            Err(ProtocolError::NotAnObject)
        ));
        assert!(matches!(
            Inbound::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Inbound::decode(r#"{"identify":42}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn request_serializes_only_present_fields() {
        let encoded = serde_json::to_value(Request::put(Nom::new(json!({"x": 1})))).expect("encode");
        assert_eq!(encoded, json!({"put": {"x": 1}}));
        let encoded = serde_json::to_value(Request::get()).expect("encode");
        assert_eq!(encoded, json!({"get": true}));
    }

    #[tokio::test]
    async fn update_survives_the_line_framing() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = Update {
            update: Nom::new(json!({"x": 1})),
        };

        write_message(&mut writer, &message)
            .await
            .expect("write message");
        let parsed = read_update(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");

        assert_eq!(message, parsed);
    }
}
