use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates a response with its request.
///
/// Ids created here are UUID strings, peers may also use integers which are echoed back as
/// integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Repr);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Text(String),
    Number(i64),
}

impl RequestId {
    pub fn new() -> Self {
        Self(Repr::Text(Uuid::new_v4().to_string()))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(Repr::Text(value.to_owned()))
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self(Repr::Number(value))
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Repr::Text(text) => f.write_str(text),
            Repr::Number(number) => write!(f, "{number}"),
        }
    }
}

/// A line on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Response(Response),
    Request(Request),
}

/// Asks the other side to run an action.
///
/// Requests without a `requestId` are not answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn new(request_id: RequestId, result: Result<serde_json::Value, String>) -> Self {
        match result {
            Ok(result) => Self {
                request_id,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(error) => Self {
                request_id,
                success: false,
                result: None,
                error: Some(error),
            },
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.success {
            Ok(self.result.unwrap_or_default())
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "Action failed without an error message".to_owned()))
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_requests_and_responses() {
        let request: Message =
            serde_json::from_str(r#"{"requestId":"1","action":"getQueueStats","payload":{}}"#)
                .unwrap();
        let notification: Message = serde_json::from_str(r#"{"action":"shutdown"}"#).unwrap();
        let response: Message =
            serde_json::from_str(r#"{"requestId":"1","success":false,"error":"nope"}"#).unwrap();

        assert_eq!(
            request,
            Message::Request(Request {
                request_id: Some("1".into()),
                action: "getQueueStats".to_owned(),
                payload: json!({}),
            })
        );
        assert_eq!(
            notification,
            Message::Request(Request {
                request_id: None,
                action: "shutdown".to_owned(),
                payload: serde_json::Value::Null,
            })
        );
        assert_eq!(
            response,
            Message::Response(Response::new("1".into(), Err("nope".to_owned())))
        );
    }

    #[test]
    fn request_serializes_in_wire_shape() {
        let line = serde_json::to_string(&Message::Request(Request {
            request_id: Some("abc".into()),
            action: "echo".to_owned(),
            payload: json!({"x": 1}),
        }))
        .unwrap();

        assert_eq!(line, r#"{"requestId":"abc","action":"echo","payload":{"x":1}}"#);
    }

    #[test]
    fn numeric_request_ids_are_kept() {
        let request: Message =
            serde_json::from_str(r#"{"requestId":42,"action":"getQueueStats"}"#).unwrap();
        let Message::Request(request) = request else {
            panic!("expected a request, got {request:?}");
        };

        assert_eq!(request.request_id, Some(RequestId::from(42)));
        assert_ne!(request.request_id, Some(RequestId::from("42")));

        let response = Response::new(RequestId::from(42), Ok(json!(null)));
        assert_eq!(
            serde_json::to_string(&Message::Response(response)).unwrap(),
            r#"{"requestId":42,"success":true,"result":null}"#
        );
        assert_eq!(RequestId::from(42).to_string(), "42");
    }

    #[test]
    fn response_into_result() {
        let ok = Response::new("1".into(), Ok(json!(3)));
        assert_eq!(ok.into_result(), Ok(json!(3)));

        let missing_error = Response {
            request_id: "2".into(),
            success: false,
            result: None,
            error: None,
        };
        assert!(missing_error.into_result().is_err());
    }
}
