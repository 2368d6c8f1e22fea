//! Label derivation for gRPC call metrics
//!
//! Turns the framework's call descriptor (full method path plus streaming
//! flags) and outcome code into the `grpc_type`, `grpc_service`,
//! `grpc_method` and `grpc_code` label values.

use crate::error::MalformedMethod;
use std::borrow::Cow;
use std::fmt;
use std::fmt::Write as _;
use tonic::Code;

/// Every outcome code a call can complete with, in wire order
pub const ALL_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

/// Canonical status name used for the `grpc_code` label
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Shape of a call, derived from its streaming flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallType {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl CallType {
    pub fn from_flags(server_streams: bool, client_streams: bool) -> Self {
        match (server_streams, client_streams) {
            (true, true) => Self::BidiStream,
            (true, false) => Self::ServerStream,
            (false, true) => Self::ClientStream,
            (false, false) => Self::Unary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ClientStream => "client_stream",
            Self::ServerStream => "server_stream",
            Self::BidiStream => "bidi_stream",
        }
    }

    pub fn server_streams(&self) -> bool {
        matches!(self, Self::ServerStream | Self::BidiStream)
    }

    pub fn client_streams(&self) -> bool {
        matches!(self, Self::ClientStream | Self::BidiStream)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label values for one method, borrowed from the full method string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodLabels<'a> {
    pub call_type: CallType,
    /// Service path including the leading `/`, e.g. `/pkg.Health`
    pub service: &'a str,
    pub method: &'a str,
}

impl MethodLabels<'_> {
    /// Encode as `grpc_type="..",grpc_service="..",grpc_method=".."[,grpc_code=".."]`
    pub fn encode(&self, code: Option<Code>) -> String {
        let mut out = String::with_capacity(64 + self.service.len() + self.method.len());
        let _ = write!(
            out,
            r#"grpc_type="{}",grpc_service="{}",grpc_method="{}""#,
            self.call_type,
            escape_label_value(self.service),
            escape_label_value(self.method),
        );
        if let Some(code) = code {
            let _ = write!(out, r#",grpc_code="{}""#, code_name(code));
        }
        out
    }
}

/// Split a full method path into its label values.
///
/// `full_method` must look like `/service/method`: non-empty, starting with
/// `/`, with exactly one further `/` and non-empty parts on both sides. The
/// service keeps its leading `/`.
pub fn derive_labels(
    full_method: &str,
    server_streams: bool,
    client_streams: bool,
) -> Result<MethodLabels<'_>, MalformedMethod> {
    let malformed = || MalformedMethod::new(full_method);

    let rest = full_method.strip_prefix('/').ok_or_else(malformed)?;
    let split = rest.find('/').ok_or_else(malformed)?;
    let (service, method) = full_method.split_at(split + 1);
    let method = &method[1..];

    if split == 0 || method.is_empty() || method.contains('/') {
        return Err(malformed());
    }

    Ok(MethodLabels {
        call_type: CallType::from_flags(server_streams, client_streams),
        service,
        method,
    })
}

/// Call descriptor supplied by the call framework
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub full_method: String,
    pub server_streams: bool,
    pub client_streams: bool,
}

impl MethodDescriptor {
    pub fn new(full_method: impl Into<String>, server_streams: bool, client_streams: bool) -> Self {
        Self {
            full_method: full_method.into(),
            server_streams,
            client_streams,
        }
    }

    pub fn unary(full_method: impl Into<String>) -> Self {
        Self::new(full_method, false, false)
    }

    pub fn server_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, true, false)
    }

    pub fn client_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, false, true)
    }

    pub fn bidi_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, true, true)
    }

    pub fn call_type(&self) -> CallType {
        CallType::from_flags(self.server_streams, self.client_streams)
    }

    pub fn labels(&self) -> Result<MethodLabels<'_>, MalformedMethod> {
        derive_labels(&self.full_method, self.server_streams, self.client_streams)
    }
}

fn escape_label_value(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }

    let mut escaped = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str(r"\\"),
            '"' => escaped.push_str(r#"\""#),
            '\n' => escaped.push_str(r"\n"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_call_type_decision_table() {
        assert_eq!(CallType::from_flags(false, false), CallType::Unary);
        assert_eq!(CallType::from_flags(true, false), CallType::ServerStream);
        assert_eq!(CallType::from_flags(false, true), CallType::ClientStream);
        assert_eq!(CallType::from_flags(true, true), CallType::BidiStream);

        assert_eq!(CallType::BidiStream.as_str(), "bidi_stream");
        assert!(CallType::BidiStream.server_streams());
        assert!(CallType::BidiStream.client_streams());
        assert!(!CallType::Unary.server_streams());
    }

    #[test]
    fn test_derive_labels() {
        let labels = derive_labels("/grpc.health.v1.Health/Watch", true, false).unwrap();
        assert_eq!(labels.call_type, CallType::ServerStream);
        assert_eq!(labels.service, "/grpc.health.v1.Health");
        assert_eq!(labels.method, "Watch");
    }

    #[test]
    fn test_derive_labels_rejects_malformed_methods() {
        for bad in ["", "no-leading-slash", "/", "/no-method", "//Check", "/svc/", "/a/b/c"] {
            let err = derive_labels(bad, false, false).unwrap_err();
            assert_eq!(err.full_method(), bad);
        }
    }

    #[test]
    fn test_encode_labels() {
        let labels = derive_labels("/pkg.Health/Check", false, false).unwrap();
        assert_eq!(
            labels.encode(None),
            r#"grpc_type="unary",grpc_service="/pkg.Health",grpc_method="Check""#
        );
        assert_eq!(
            labels.encode(Some(Code::DeadlineExceeded)),
            r#"grpc_type="unary",grpc_service="/pkg.Health",grpc_method="Check",grpc_code="DEADLINE_EXCEEDED""#
        );
    }

    #[test]
    fn test_encode_escapes_label_values() {
        let labels = derive_labels("/pkg\"x/Ch\\eck", false, false).unwrap();
        assert_eq!(
            labels.encode(None),
            r#"grpc_type="unary",grpc_service="/pkg\"x",grpc_method="Ch\\eck""#
        );
    }

    #[test]
    fn test_code_names_are_distinct() {
        let names: HashSet<_> = ALL_CODES.iter().map(|c| code_name(*c)).collect();
        assert_eq!(names.len(), ALL_CODES.len());
        assert_eq!(code_name(Code::Ok), "OK");
        assert_eq!(code_name(Code::Unauthenticated), "UNAUTHENTICATED");
    }

    #[test]
    fn test_descriptor_constructors() {
        assert_eq!(
            MethodDescriptor::unary("/a.B/C").call_type(),
            CallType::Unary
        );
        assert_eq!(
            MethodDescriptor::client_streaming("/a.B/C").call_type(),
            CallType::ClientStream
        );
        assert_eq!(
            MethodDescriptor::bidi_streaming("/a.B/C").call_type(),
            CallType::BidiStream
        );
        assert!(MethodDescriptor::server_streaming("bad").labels().is_err());
    }
}
