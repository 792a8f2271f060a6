//! Round-trip and redaction tests for the server-error envelope.

use courier_errors::{
    BrokerErrorCode, Error, ErrorKind, ErrorProperties, ServerErrorJson, ERROR_UUID_RESPONSE_TIMEOUT,
    GENERIC_UNEXPECTED_MESSAGE,
};

const EACCES: i32 = 13;

fn round_trip(error: &Error) -> Error {
    let text = ServerErrorJson::from_error(error).to_json_string();
    ServerErrorJson::from_json_str(&text)
        .expect("parse")
        .into_error()
        .expect("rebuild")
}

#[test]
fn http_server_round_trip_preserves_kind_and_attributes() {
    let original = Error::new(ErrorKind::HttpServer, "bad")
        .with_category("generic")
        .with_error_code(EACCES)
        .with_http_status(400);

    let rebuilt = round_trip(&original);

    assert_eq!(rebuilt.kind(), ErrorKind::HttpServer);
    assert_eq!(rebuilt.message(), "bad");
    assert_eq!(rebuilt.properties().error_code, Some(EACCES));
    assert_eq!(rebuilt.properties().http_status_code, Some(400));
    assert_eq!(rebuilt.properties().category_name.as_deref(), Some("generic"));
}

#[test]
fn every_kind_survives_a_round_trip() {
    for kind in [
        ErrorKind::Argument,
        ErrorKind::ArgumentNull,
        ErrorKind::Cache,
        ErrorKind::ExternalCommand,
        ErrorKind::Http,
        ErrorKind::HttpServer,
        ErrorKind::InvalidDataFormat,
        ErrorKind::Java,
        ErrorKind::Json,
        ErrorKind::NotFound,
        ErrorKind::NotSupported,
        ErrorKind::ObjectDisconnected,
        ErrorKind::Security,
        ErrorKind::ServerError,
        ErrorKind::ServerNoConnection,
        ErrorKind::Timeout,
        ErrorKind::Unexpected,
        ErrorKind::UserAuthentication,
        ErrorKind::UserMessage,
        ErrorKind::Xml,
    ] {
        let rebuilt = round_trip(&Error::new(kind, "probe"));
        assert_eq!(rebuilt.kind(), kind, "kind {kind} must be preserved");
    }
}

#[test]
fn invalid_data_format_kind_is_preserved_not_remapped() {
    let rebuilt = round_trip(&Error::new(ErrorKind::InvalidDataFormat, "bad bytes"));
    assert_eq!(rebuilt.kind(), ErrorKind::InvalidDataFormat);
}

#[test]
fn system_round_trip_requires_category_and_code() {
    let good = Error::new(ErrorKind::System, "open failed: no such file")
        .with_category("system")
        .with_error_code(2);
    let rebuilt = round_trip(&good);
    assert_eq!(rebuilt.kind(), ErrorKind::System);
    assert_eq!(rebuilt.properties().error_code, Some(2));

    // A System envelope with no category must be rejected as malformed.
    let text = r#"{"result":{"exceptionType":"System","exceptionMessage":"x",
                   "exceptionProperties":{}}}"#;
    let err = ServerErrorJson::from_json_str(text)
        .unwrap()
        .into_error()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
}

#[test]
fn unknown_exception_type_becomes_unexpected() {
    let text = r#"{"result":{"exceptionType":"bl::SomethingNew","exceptionMessage":"odd"}}"#;
    let rebuilt = ServerErrorJson::from_json_str(text)
        .unwrap()
        .into_error()
        .unwrap();
    assert_eq!(rebuilt.kind(), ErrorKind::Unexpected);
    assert_eq!(rebuilt.message(), "odd");
}

#[test]
fn missing_result_is_an_argument_error() {
    let err = ServerErrorJson::from_json_str("{}")
        .unwrap()
        .into_error()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
}

#[test]
fn unknown_category_is_an_argument_error() {
    let text = r#"{"result":{"exceptionType":"Argument",
                   "exceptionProperties":{"categoryName":"martian"}}}"#;
    let err = ServerErrorJson::from_json_str(text)
        .unwrap()
        .into_error()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
}

#[test]
fn garbage_text_is_an_argument_error() {
    let err = ServerErrorJson::from_json_str("not json at all").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
}

#[test]
fn sensitive_values_are_redacted_everywhere() {
    let token = "secret-cookie-0f9a";
    let error = Error::new(
        ErrorKind::Security,
        format!("authorization failed for token {token}"),
    )
    .with_message_property(format!("token was {token}"))
    .with_sensitive(token);

    let text = ServerErrorJson::from_error(&error).to_json_string();

    assert!(
        !text.contains(token),
        "serialized envelope must not contain the token payload: {text}"
    );
    assert!(text.contains("[REDACTED]"));
}

#[test]
fn user_friendly_message_selection() {
    let unfriendly = Error::unexpected("stack details");
    let envelope = ServerErrorJson::from_error(&unfriendly);
    assert_eq!(
        envelope.result.as_ref().unwrap().message,
        GENERIC_UNEXPECTED_MESSAGE
    );

    let friendly = Error::new(ErrorKind::UserMessage, "quota exceeded");
    let envelope = ServerErrorJson::from_error(&friendly);
    assert_eq!(envelope.result.as_ref().unwrap().message, "quota exceeded");
}

#[test]
fn broker_code_and_error_uuid_round_trip() {
    let original = Error::server_error(BrokerErrorCode::TargetPeerQueueFull, "queue full")
        .with_error_uuid(ERROR_UUID_RESPONSE_TIMEOUT);

    let rebuilt = round_trip(&original);

    assert_eq!(rebuilt.kind(), ErrorKind::ServerError);
    assert_eq!(rebuilt.broker_code(), Some(BrokerErrorCode::TargetPeerQueueFull));
    assert_eq!(
        rebuilt.properties().error_uuid,
        Some(ERROR_UUID_RESPONSE_TIMEOUT)
    );
}

#[test]
fn nested_cause_appears_in_the_dump() {
    let inner = Error::new(ErrorKind::System, "connection reset")
        .with_category("system")
        .with_error_code(104);
    let outer = Error::new(ErrorKind::ServerNoConnection, "all endpoints exhausted")
        .with_source(inner);

    let envelope = ServerErrorJson::from_error(&outer);
    let dump = &envelope.result.as_ref().unwrap().exception_full_dump;
    assert!(dump.contains("ServerNoConnection"));
    assert!(dump.contains("caused by"));
    assert!(dump.contains("connection reset"));

    let mut properties = ErrorProperties::default();
    properties.error_code = Some(104);
    assert_eq!(outer.cause().unwrap().properties().error_code, properties.error_code);
}
