//! The server-error JSON envelope.
//!
//! A fixed-schema JSON representation of an [`Error`](crate::Error) that
//! round-trips across process boundaries. Servers answer failed operations
//! with this document instead of killing the connection; clients rebuild an
//! equivalent error on their side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, ErrorKind, ErrorProperties, GENERIC_UNEXPECTED_MESSAGE};

const REDACTED: &str = "[REDACTED]";

/// The `result` member of the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerErrorResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exception_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exception_message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub exception_full_dump: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_properties: Option<ErrorProperties>,
    /// User-visible message, or the generic placeholder.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// The top-level envelope: `{ "result": { ... } }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerErrorJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ServerErrorResult>,
}

impl ServerErrorJson {
    /// Materialize an error into its wire envelope, redacting sensitive
    /// values everywhere.
    pub fn from_error(error: &Error) -> ServerErrorJson {
        let result = ServerErrorResult {
            exception_type: error.kind().as_str().to_owned(),
            exception_message: error.message().to_owned(),
            exception_full_dump: error.full_dump(),
            exception_properties: Some(error.properties().clone()),
            message: error.user_message().to_owned(),
        };

        let result = redact_result(result, error.sensitive_values());

        ServerErrorJson {
            result: Some(result),
        }
    }

    /// Rebuild the error this envelope describes.
    ///
    /// `Ok` is the reconstructed remote error; `Err` is a local
    /// Argument-kind error describing why the envelope itself is malformed.
    pub fn into_error(self) -> crate::Result<Error> {
        let result = self
            .result
            .ok_or_else(|| Error::argument("server error envelope: 'result' property is not set"))?;

        let properties = result.exception_properties.unwrap_or_default();

        if let Some(category) = properties.category_name.as_deref() {
            if !matches!(category, "generic" | "system" | "") {
                return Err(Error::argument(format!(
                    "server error envelope: unknown error category '{category}'"
                )));
            }
        }

        // Unrecognized kind names deserialize as Unexpected.
        let kind =
            ErrorKind::from_name(&result.exception_type).unwrap_or(ErrorKind::Unexpected);

        if kind == ErrorKind::System {
            let has_category = properties
                .category_name
                .as_deref()
                .is_some_and(|c| !c.is_empty());
            if !has_category || properties.error_code.is_none() {
                return Err(Error::argument(
                    "server error envelope: category or error code is not set for a System error",
                ));
            }
        }

        let message = if result.exception_message.is_empty() {
            if result.message.is_empty() {
                GENERIC_UNEXPECTED_MESSAGE.to_owned()
            } else {
                result.message.clone()
            }
        } else {
            result.exception_message.clone()
        };

        Ok(Error::new(kind, message).with_properties(properties))
    }

    pub fn to_json_string(&self) -> String {
        // The envelope schema has no non-serializable members.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }

    pub fn from_json_str(text: &str) -> crate::Result<ServerErrorJson> {
        serde_json::from_str(text)
            .map_err(|e| Error::argument(format!("malformed server error envelope: {e}")))
    }
}

/// Replace every occurrence of each sensitive value in `text` with
/// `[REDACTED]`.
pub(crate) fn redact(text: &str, sensitive: &[String]) -> String {
    let mut out = text.to_owned();
    for value in sensitive {
        if !value.is_empty() {
            out = out.replace(value.as_str(), REDACTED);
        }
    }
    out
}

/// Walk every string in the serialized result and redact sensitive values,
/// so nothing that reaches the wire can leak a token payload.
fn redact_result(result: ServerErrorResult, sensitive: &[String]) -> ServerErrorResult {
    if sensitive.is_empty() {
        return result;
    }

    let mut value = match serde_json::to_value(&result) {
        Ok(v) => v,
        Err(_) => return result,
    };
    redact_value(&mut value, sensitive);
    serde_json::from_value(value).unwrap_or(result)
}

fn redact_value(value: &mut Value, sensitive: &[String]) {
    match value {
        Value::String(s) => {
            let redacted = redact(s, sensitive);
            if redacted != *s {
                *s = redacted;
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, sensitive);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                redact_value(item, sensitive);
            }
        }
        _ => {}
    }
}
