//! Structured errors for the courier runtime.
//!
//! Every library crate in the workspace returns [`Error`]: a closed taxonomy
//! of error kinds plus a fixed set of optional diagnostic attributes that
//! survive process boundaries through the JSON envelope in [`envelope`].
//! The attribute names match the wire schema verbatim (camelCase), so a
//! deserialized remote error is indistinguishable from a local one.

mod envelope;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use envelope::{ServerErrorJson, ServerErrorResult};

/// Message surfaced to users when the underlying error is not user-friendly.
pub const GENERIC_UNEXPECTED_MESSAGE: &str =
    "An unexpected error has occurred and the request cannot be completed";

/// Error uuid attached to acknowledgment / response timeouts.
pub const ERROR_UUID_RESPONSE_TIMEOUT: Uuid =
    uuid::uuid!("7f1652dc-b0ec-478a-bdd4-2a06ec2d5e04");

/// POSIX `ECANCELED`; the error code carried by cooperative-cancellation errors.
const ERRNO_CANCELED: i32 = 125;

// ── Error kinds ───────────────────────────────────────────────────────────────

/// The closed set of error kinds recognized by the runtime.
///
/// The textual names below are the `exceptionType` values of the server-error
/// envelope. Unknown names deserialize as [`ErrorKind::Unexpected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Argument,
    ArgumentNull,
    Cache,
    ExternalCommand,
    Http,
    HttpServer,
    InvalidDataFormat,
    Java,
    Json,
    NotFound,
    NotSupported,
    ObjectDisconnected,
    Security,
    ServerError,
    ServerNoConnection,
    Timeout,
    Unexpected,
    UserAuthentication,
    /// User-friendly by default: the message is meant to be shown verbatim.
    UserMessage,
    Xml,
    /// Wraps a platform `(category, code)` pair.
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Argument => "Argument",
            ErrorKind::ArgumentNull => "ArgumentNull",
            ErrorKind::Cache => "Cache",
            ErrorKind::ExternalCommand => "ExternalCommand",
            ErrorKind::Http => "Http",
            ErrorKind::HttpServer => "HttpServer",
            ErrorKind::InvalidDataFormat => "InvalidDataFormat",
            ErrorKind::Java => "Java",
            ErrorKind::Json => "Json",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::ObjectDisconnected => "ObjectDisconnected",
            ErrorKind::Security => "Security",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::ServerNoConnection => "ServerNoConnection",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::UserAuthentication => "UserAuthentication",
            ErrorKind::UserMessage => "UserMessage",
            ErrorKind::Xml => "Xml",
            ErrorKind::System => "System",
        }
    }

    /// Parse an envelope `exceptionType` name. `None` for unrecognized names;
    /// the envelope layer maps those to [`ErrorKind::Unexpected`].
    pub fn from_name(name: &str) -> Option<ErrorKind> {
        Some(match name {
            "Argument" => ErrorKind::Argument,
            "ArgumentNull" => ErrorKind::ArgumentNull,
            "Cache" => ErrorKind::Cache,
            "ExternalCommand" => ErrorKind::ExternalCommand,
            "Http" => ErrorKind::Http,
            "HttpServer" => ErrorKind::HttpServer,
            "InvalidDataFormat" => ErrorKind::InvalidDataFormat,
            "Java" => ErrorKind::Java,
            "Json" => ErrorKind::Json,
            "NotFound" => ErrorKind::NotFound,
            "NotSupported" => ErrorKind::NotSupported,
            "ObjectDisconnected" => ErrorKind::ObjectDisconnected,
            "Security" => ErrorKind::Security,
            "ServerError" => ErrorKind::ServerError,
            "ServerNoConnection" => ErrorKind::ServerNoConnection,
            "Timeout" => ErrorKind::Timeout,
            "Unexpected" => ErrorKind::Unexpected,
            "UserAuthentication" => ErrorKind::UserAuthentication,
            "UserMessage" => ErrorKind::UserMessage,
            "Xml" => ErrorKind::Xml,
            "System" => ErrorKind::System,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Broker error codes ────────────────────────────────────────────────────────

/// Dedicated error codes recognized on the broker and conversation paths.
///
/// Carried in the envelope's `errorCode` property on ServerError-kind errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BrokerErrorCode {
    ProtocolValidationFailed = 1,
    AuthorizationFailed = 2,
    TargetPeerQueueFull = 3,
}

impl BrokerErrorCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Option<BrokerErrorCode> {
        match code {
            1 => Some(BrokerErrorCode::ProtocolValidationFailed),
            2 => Some(BrokerErrorCode::AuthorizationFailed),
            3 => Some(BrokerErrorCode::TargetPeerQueueFull),
            _ => None,
        }
    }
}

// ── Diagnostic attributes ─────────────────────────────────────────────────────

/// The fixed set of optional diagnostic attributes preserved across process
/// boundaries. Field names are the wire names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_no: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_open_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_thrown: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_code: Option<i32>,
    /// One of `"generic"`, `"system"` or `""`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_expected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_response_headers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_request_details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_command_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_command_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_user_friendly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_failed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_error: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_error_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_is_verify_subject_name: Option<String>,
}

// ── Error ─────────────────────────────────────────────────────────────────────

/// The runtime error: a kind, a short message, the diagnostic attributes and
/// an optional nested cause.
///
/// Values registered via [`Error::with_sensitive`] (authentication token
/// payloads) are replaced by `[REDACTED]` wherever the error is serialized.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    properties: Box<ErrorProperties>,
    #[source]
    source: Option<Box<Error>>,
    sensitive: Vec<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut properties = Box::<ErrorProperties>::default();
        properties.time_thrown = Some(chrono::Utc::now().to_rfc3339());
        Error {
            kind,
            message: message.into(),
            properties,
            source: None,
            sensitive: Vec::new(),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Argument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unexpected, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, message)
    }

    /// A server-side error carrying one of the dedicated broker codes.
    pub fn server_error(code: BrokerErrorCode, message: impl Into<String>) -> Self {
        Error::new(ErrorKind::ServerError, message).with_error_code(code.code())
    }

    /// The error recorded for cooperatively canceled work.
    pub fn canceled() -> Self {
        Error::new(ErrorKind::System, "operation was canceled")
            .with_category("generic")
            .with_error_code(ERRNO_CANCELED)
            .with_expected(true)
    }

    /// A submission against a disposed queue or dispatcher.
    pub fn disposed(what: &str) -> Self {
        Error::new(
            ErrorKind::ObjectDisconnected,
            format!("{what} has been disposed"),
        )
    }

    // ── builders ──────────────────────────────────────────────────────────

    pub fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_error_code(mut self, code: i32) -> Self {
        self.properties.error_code = Some(code);
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.properties.category_name = Some(category.to_owned());
        self
    }

    pub fn with_error_uuid(mut self, uuid: Uuid) -> Self {
        self.properties.error_uuid = Some(uuid);
        self
    }

    pub fn with_http_status(mut self, status: i32) -> Self {
        self.properties.http_status_code = Some(status);
        self
    }

    pub fn with_endpoint(mut self, address: impl Into<String>, port: u16) -> Self {
        self.properties.endpoint_address = Some(address.into());
        self.properties.endpoint_port = Some(port);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.properties.file_name = Some(file_name.into());
        self
    }

    pub fn with_task_info(mut self, task_info: impl Into<String>) -> Self {
        self.properties.task_info = Some(task_info.into());
        self
    }

    pub fn with_user_friendly(mut self, user_friendly: bool) -> Self {
        self.properties.is_user_friendly = Some(user_friendly);
        self
    }

    pub fn with_expected(mut self, expected: bool) -> Self {
        self.properties.is_expected = Some(expected);
        self
    }

    pub fn with_message_property(mut self, message: impl Into<String>) -> Self {
        self.properties.message = Some(message.into());
        self
    }

    pub fn with_properties(mut self, properties: ErrorProperties) -> Self {
        self.properties = Box::new(properties);
        self
    }

    /// Register a sensitive value to be redacted from all serialized forms.
    pub fn with_sensitive(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.sensitive.push(value);
        }
        self
    }

    // ── accessors ─────────────────────────────────────────────────────────

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn properties(&self) -> &ErrorProperties {
        &self.properties
    }

    pub fn cause(&self) -> Option<&Error> {
        self.source.as_deref()
    }

    pub(crate) fn sensitive_values(&self) -> &[String] {
        &self.sensitive
    }

    /// The broker code, when this is a ServerError carrying one.
    pub fn broker_code(&self) -> Option<BrokerErrorCode> {
        if self.kind != ErrorKind::ServerError {
            return None;
        }
        self.properties.error_code.and_then(BrokerErrorCode::from_code)
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::System && self.properties.error_code == Some(ERRNO_CANCELED)
    }

    /// Whether the message is meant to be shown to users verbatim.
    ///
    /// UserMessage-kind errors are user-friendly by default; the
    /// `isUserFriendly` property overrides for any kind.
    pub fn is_user_friendly(&self) -> bool {
        self.properties
            .is_user_friendly
            .unwrap_or(self.kind == ErrorKind::UserMessage)
    }

    /// The message surfaced to users: the real one when user-friendly,
    /// the generic placeholder otherwise.
    pub fn user_message(&self) -> &str {
        if self.is_user_friendly() {
            &self.message
        } else {
            GENERIC_UNEXPECTED_MESSAGE
        }
    }

    /// Multi-line diagnostic covering the full cause chain and the set
    /// attributes. Sensitive values are redacted.
    pub fn full_dump(&self) -> String {
        let mut out = String::new();
        let mut current = Some(self);
        let mut depth = 0usize;
        while let Some(err) = current {
            if depth > 0 {
                out.push_str("caused by:\n");
            }
            out.push_str(&format!("[{}] {}\n", err.kind, err.message));
            if *err.properties != ErrorProperties::default() {
                out.push_str(&format!("properties: {:?}\n", err.properties));
            }
            current = err.cause();
            depth += 1;
        }
        crate::envelope::redact(&out, &self.sensitive)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let mut err = Error::new(ErrorKind::System, e.to_string()).with_category("system");
        if let Some(code) = e.raw_os_error() {
            err.properties.err_no = Some(code);
            err.properties.error_code = Some(code);
        }
        err
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        let mut err = Error::new(ErrorKind::Json, e.to_string());
        err.properties.parser_line = Some(e.line() as u32);
        err.properties.parser_column = Some(e.column() as u32);
        err
    }
}

// ── Retry classification ──────────────────────────────────────────────────────

/// Whether a message-delivery failure may be retried by the conversation
/// engine.
///
/// Retryable: a full target peer queue (the consumer may drain it), a
/// disconnected dispatch object and a lost server connection. Everything
/// else, notably server-side processing errors and cancellation, is final.
pub fn is_retryable_messaging_broker_error(error: &Error) -> bool {
    match error.kind() {
        ErrorKind::ObjectDisconnected | ErrorKind::ServerNoConnection => true,
        ErrorKind::ServerError => error.broker_code() == Some(BrokerErrorCode::TargetPeerQueueFull),
        _ => false,
    }
}
