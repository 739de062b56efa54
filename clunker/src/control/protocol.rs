use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw view of one incoming typed value: a `type` tag and a single scalar
/// `value`. Kept loose so an untyped or unknown message can be answered
/// with an `error` reply instead of closing the connection.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Clean,
    SetCount(i64),
    GetCount,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ControlReply {
    CleanResult(bool),
    SetResult(bool),
    Count(i64),
    Error(String),
}

/// Consume one complete typed value from the front of `buf`, leaving any
/// trailing bytes for the next call. `Ok(None)` means the buffer holds only
/// a partial value; a genuine syntax error is fatal for the connection.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, serde_json::Error> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Envelope>();
    match stream.next() {
        Some(Ok(envelope)) => {
            let consumed = stream.byte_offset();
            let _ = buf.split_to(consumed);
            Ok(Some(envelope))
        }
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(err),
        None => Ok(None),
    }
}

pub fn encode(reply: &ControlReply) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(reply)
}

/// Map an envelope to a control request, or to the text of the `error`
/// reply it deserves. Counts are accepted as integers or as decimal
/// strings, matching the stringly typed values of the original protocol.
pub fn parse_request(envelope: &Envelope) -> Result<ControlRequest, String> {
    let kind = match &envelope.kind {
        Some(kind) => kind.as_str(),
        None => return Err(format!("message has no type [{}]", envelope.value)),
    };
    match kind {
        "clean" => Ok(ControlRequest::Clean),
        "get_count" => Ok(ControlRequest::GetCount),
        "set_count" => {
            let count = match &envelope.value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            count
                .map(ControlRequest::SetCount)
                .ok_or_else(|| format!("bad count [{}]", envelope.value))
        }
        other => Err(format!("unknown message type [{other}]")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Envelope> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(envelope) = decode(&mut buf).unwrap() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_decode_single_message() {
        let envelopes = decode_all(br#"{"type":"set_count","value":200}"#);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(
            parse_request(&envelopes[0]),
            Ok(ControlRequest::SetCount(200))
        );
    }

    #[test]
    fn test_decode_back_to_back_messages() {
        let envelopes =
            decode_all(br#"{"type":"clean","value":""} {"type":"get_count","value":""}"#);
        assert_eq!(envelopes.len(), 2);
        assert_eq!(parse_request(&envelopes[0]), Ok(ControlRequest::Clean));
        assert_eq!(parse_request(&envelopes[1]), Ok(ControlRequest::GetCount));
    }

    #[test]
    fn test_decode_waits_for_partial_value() {
        let mut buf = BytesMut::from(&br#"{"type":"set_co"#[..]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(br#"unt","value":-1}"#);
        let envelope = decode(&mut buf).unwrap().unwrap();
        assert_eq!(parse_request(&envelope), Ok(ControlRequest::SetCount(-1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut buf = BytesMut::from(&b"not json at all"[..]);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_stringly_count_is_accepted() {
        let envelopes = decode_all(br#"{"type":"set_count","value":"42"}"#);
        assert_eq!(
            parse_request(&envelopes[0]),
            Ok(ControlRequest::SetCount(42))
        );
    }

    #[test]
    fn test_bad_count_and_unknown_type_reply_error() {
        let envelopes = decode_all(br#"{"type":"set_count","value":"many"}"#);
        assert!(parse_request(&envelopes[0]).unwrap_err().contains("bad count"));

        let envelopes = decode_all(br#"{"type":"explode","value":""}"#);
        assert!(parse_request(&envelopes[0])
            .unwrap_err()
            .contains("unknown message type [explode]"));

        let envelopes = decode_all(br#"{"value":"oops"}"#);
        assert!(parse_request(&envelopes[0])
            .unwrap_err()
            .contains("message has no type"));
    }

    #[test]
    fn test_reply_wire_shapes() {
        assert_eq!(
            encode(&ControlReply::CleanResult(true)).unwrap(),
            br#"{"type":"clean_result","value":true}"#.to_vec()
        );
        assert_eq!(
            encode(&ControlReply::Count(-1)).unwrap(),
            br#"{"type":"count","value":-1}"#.to_vec()
        );
        assert_eq!(
            encode(&ControlReply::SetResult(true)).unwrap(),
            br#"{"type":"set_result","value":true}"#.to_vec()
        );
    }
}
