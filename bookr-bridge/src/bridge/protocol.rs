//! Wire protocol for parent-child communication.
//!
//! Every frame is a run of `\n`-terminated lines:
//!
//! - **Request**: `<id>` line, then the payload as a record body, then an empty line
//! - **Response**: `<field>` / `<value>` line pairs, then an empty line
//! - **Value**: `{` + field/value pairs + `}`, `[` + values + `]`, or a bare scalar line
//! - **Shutdown**: `quit` line, then an empty line
//!
//! Markers only count as whole lines, so some texts cannot be represented.
//! [`ControlRequest::validate`] rejects those before anything reaches the pipe.

use crate::value::{Record, Value};

pub const OPEN_RECORD: &str = "{";
pub const CLOSE_RECORD: &str = "}";
pub const OPEN_LIST: &str = "[";
pub const CLOSE_LIST: &str = "]";
/// Terminates a top-level request or response envelope.
pub const END_OF_FRAME: &str = "";
/// Id line that asks the child to exit.
pub const QUIT: &str = "quit";

/// Messages from parent to child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Call { id: String, payload: Record },
    Quit,
}

impl ControlRequest {
    pub fn call(id: impl Into<String>, payload: Record) -> Self {
        Self::Call {
            id: id.into(),
            payload,
        }
    }

    /// Id line as written on the wire.
    pub fn id(&self) -> &str {
        match self {
            Self::Call { id, .. } => id,
            Self::Quit => QUIT,
        }
    }

    /// Check that the request survives a trip through the line encoding.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Self::Call { id, payload } => validate_call(id, payload),
            Self::Quit => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("request id must not be empty")]
    EmptyId,

    #[error("request id '{0}' is reserved for shutdown")]
    ReservedId(String),

    #[error("{what} contains a line break: {text:?}")]
    LineBreak { what: &'static str, text: String },

    #[error("field name {0:?} collides with the record terminator")]
    FieldIsTerminator(String),

    #[error("scalar {0:?} collides with a marker")]
    ScalarIsMarker(String),
}

/// Check that a call's id and payload survive a trip through the line encoding.
pub fn validate_call(id: &str, payload: &Record) -> Result<(), ProtocolError> {
    validate_id(id)?;
    validate_record(payload, END_OF_FRAME)
}

/// Check that a response record survives a trip through the line encoding.
pub fn validate_response(record: &Record) -> Result<(), ProtocolError> {
    validate_record(record, END_OF_FRAME)
}

fn validate_id(id: &str) -> Result<(), ProtocolError> {
    if id.is_empty() {
        return Err(ProtocolError::EmptyId);
    }
    if id == QUIT {
        return Err(ProtocolError::ReservedId(id.to_string()));
    }
    validate_line("request id", id)
}

fn validate_line(what: &'static str, text: &str) -> Result<(), ProtocolError> {
    if text.contains(['\n', '\r']) {
        return Err(ProtocolError::LineBreak {
            what,
            text: text.to_string(),
        });
    }
    Ok(())
}

fn validate_record(record: &Record, end: &str) -> Result<(), ProtocolError> {
    for (field, value) in record {
        validate_line("field name", field)?;
        if field == end {
            return Err(ProtocolError::FieldIsTerminator(field.clone()));
        }
        validate_value(value, false)?;
    }
    Ok(())
}

fn validate_value(value: &Value, in_list: bool) -> Result<(), ProtocolError> {
    match value {
        Value::Scalar(s) => {
            validate_line("scalar", s)?;
            if s == OPEN_RECORD || s == OPEN_LIST || (in_list && s == CLOSE_LIST) {
                return Err(ProtocolError::ScalarIsMarker(s.clone()));
            }
            Ok(())
        }
        Value::Record(record) => validate_record(record, CLOSE_RECORD),
        Value::List(items) => items.iter().try_for_each(|v| validate_value(v, true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn plain_call_is_valid() {
        let payload = record(&[
            ("title", Value::from("Dune")),
            ("tags", Value::from(vec![Value::from("a"), Value::from("")])),
            ("meta", Value::from(record(&[("", Value::from("}"))]))),
        ]);
        assert_eq!(ControlRequest::call("lookup", payload).validate(), Ok(()));
    }

    #[test]
    fn quit_is_always_valid() {
        assert_eq!(ControlRequest::Quit.validate(), Ok(()));
        assert_eq!(ControlRequest::Quit.id(), "quit");
    }

    #[test]
    fn rejects_bad_ids() {
        assert_eq!(
            ControlRequest::call("", Record::new()).validate(),
            Err(ProtocolError::EmptyId)
        );
        assert_eq!(
            ControlRequest::call("quit", Record::new()).validate(),
            Err(ProtocolError::ReservedId("quit".to_string()))
        );
        assert!(matches!(
            ControlRequest::call("a\nb", Record::new()).validate(),
            Err(ProtocolError::LineBreak { what: "request id", .. })
        ));
    }

    #[test]
    fn rejects_terminator_field_names() {
        let top = record(&[("", Value::from("x"))]);
        assert_eq!(
            ControlRequest::call("r1", top).validate(),
            Err(ProtocolError::FieldIsTerminator(String::new()))
        );

        let nested = record(&[("outer", Value::from(record(&[("}", Value::from("x"))])))]);
        assert_eq!(
            ControlRequest::call("r1", nested).validate(),
            Err(ProtocolError::FieldIsTerminator("}".to_string()))
        );
    }

    #[test]
    fn rejects_marker_scalars() {
        let open = record(&[("a", Value::from("{"))]);
        assert_eq!(
            ControlRequest::call("r1", open).validate(),
            Err(ProtocolError::ScalarIsMarker("{".to_string()))
        );

        // A bare `]` is fine as a record value but ends a list early.
        let close_in_record = record(&[("a", Value::from("]"))]);
        assert_eq!(ControlRequest::call("r1", close_in_record).validate(), Ok(()));

        let close_in_list = record(&[("a", Value::from(vec![Value::from("]")]))]);
        assert_eq!(
            ControlRequest::call("r1", close_in_list).validate(),
            Err(ProtocolError::ScalarIsMarker("]".to_string()))
        );
    }

    #[test]
    fn rejects_carriage_returns() {
        let payload = record(&[("a", Value::from("line\r"))]);
        assert!(matches!(
            ControlRequest::call("r1", payload).validate(),
            Err(ProtocolError::LineBreak { what: "scalar", .. })
        ));
    }
}
