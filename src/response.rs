//! Conversion of request outcomes into HTTP responses

use crate::error::{classify, ClassifiedError, RelayError};
use crate::models::{Meta, Params, ServiceInfo};
use crate::proxy::Outcome;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use tracing::error;

const JSON: &str = "application/json";

/// Guess a content type from leading bytes
///
/// Known image signatures map to their MIME type; other valid UTF-8 is
/// reported as plain text and anything else as an octet stream.
pub fn detect_content_type(buf: &[u8]) -> &'static str {
    if let Ok(format) = image::guess_format(buf) {
        return format.to_mime_type();
    }
    if std::str::from_utf8(buf).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

/// `GET /` descriptor
pub fn service_info_response() -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &ServiceInfo::default())
}

/// JSON error body `{"message", "status"}` with the classified status
pub fn error_response(err: &RelayError) -> Response<Full<Bytes>> {
    let classified = classify(err);
    json_response(status_code(&classified), &classified)
}

/// 405 for anything but `GET`
pub fn method_not_allowed_response() -> Response<Full<Bytes>> {
    let classified = ClassifiedError {
        kind: "method_not_allowed",
        message: "method not allowed".to_string(),
        status: StatusCode::METHOD_NOT_ALLOWED.as_u16(),
    };
    json_response(StatusCode::METHOD_NOT_ALLOWED, &classified)
}

/// Build the response for a handled request
///
/// On error the classified status is used; fallback bytes are sent as the
/// body when present, otherwise a JSON error. On success metadata is sent as
/// JSON when it was requested and produced, otherwise the image bytes.
pub fn shape_response(params: &Params, outcome: Outcome) -> Response<Full<Bytes>> {
    let Outcome { buf, meta, err } = outcome;

    if let Some(err) = err {
        let classified = classify(&err);
        if buf.is_empty() {
            return json_response(status_code(&classified), &classified);
        }
        let content_type = content_type_for(meta.as_ref(), &buf);
        return build(status_code(&classified), &content_type, buf);
    }

    if params.meta {
        if let Some(ref meta) = meta {
            return json_response(StatusCode::OK, meta);
        }
    }

    let content_type = content_type_for(meta.as_ref(), &buf);
    build(StatusCode::OK, &content_type, buf)
}

/// Metadata content type when known, otherwise sniffed from the bytes
fn content_type_for(meta: Option<&Meta>, buf: &[u8]) -> String {
    match meta {
        Some(meta) if !meta.content_type.is_empty() => meta.content_type.clone(),
        _ => detect_content_type(buf).to_string(),
    }
}

fn status_code(classified: &ClassifiedError) -> StatusCode {
    StatusCode::from_u16(classified.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => build(status, JSON, Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "failed to encode response body");
            build(
                StatusCode::INTERNAL_SERVER_ERROR,
                JSON,
                Bytes::from_static(br#"{"message":"internal error","status":500}"#),
            )
        }
    }
}

fn build(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let len = body.len();
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    response
}
