//! Content-negotiated response bodies.
//!
//! Every payload is a JSON value. It is sent as JSON unless the request's
//! `Accept` header is exactly `application/xml`, in which case it is rendered
//! as an XML document with a `<response>` root.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <response>
//!   <images>
//!     <item><id>1</id><filename>cat.png</filename></item>
//!   </images>
//! </response>
//! ```

use axum::{
    extract::FromRequestParts,
    http::{
        HeaderValue, StatusCode,
        header::{ACCEPT, CONTENT_TYPE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use serde_json::Value;
use std::{convert::Infallible, io::Cursor};
use thiserror::Error;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const XML_CONTENT_TYPE: &str = "application/xml";

/// Root element of every XML document.
const XML_ROOT: &str = "response";

/// Element wrapping each member of an array.
const XML_ITEM: &str = "item";

/// The representation a response body is rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Xml,
}

impl ResponseFormat {
    /// Picks the format for an `Accept` header value.
    ///
    /// Only the exact value `application/xml` selects XML; everything else,
    /// including a missing header or a list of media types, selects JSON.
    pub fn from_accept(accept: Option<&str>) -> Self {
        match accept {
            Some(XML_CONTENT_TYPE) => ResponseFormat::Xml,
            _ => ResponseFormat::Json,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ResponseFormat::Json => JSON_CONTENT_TYPE,
            ResponseFormat::Xml => XML_CONTENT_TYPE,
        }
    }

    /// Serializes `payload` in this format.
    pub fn render(self, payload: &Value) -> Result<Vec<u8>, FormatError> {
        match self {
            ResponseFormat::Json => Ok(serde_json::to_vec(payload)?),
            ResponseFormat::Xml => render_xml(payload),
        }
    }
}

impl<S> FromRequestParts<S> for ResponseFormat
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let accept = parts.headers.get(ACCEPT).and_then(|v| v.to_str().ok());
        Ok(ResponseFormat::from_accept(accept))
    }
}

/// A payload paired with its status code and negotiated format.
#[derive(Debug, Clone)]
pub struct Formatted {
    pub format: ResponseFormat,
    pub status: StatusCode,
    pub payload: Value,
}

impl Formatted {
    pub fn new(format: ResponseFormat, status: StatusCode, payload: Value) -> Self {
        Self {
            format,
            status,
            payload,
        }
    }

    pub fn ok(format: ResponseFormat, payload: Value) -> Self {
        Self::new(format, StatusCode::OK, payload)
    }
}

impl IntoResponse for Formatted {
    fn into_response(self) -> Response {
        match self.format.render(&self.payload) {
            Ok(body) => (
                self.status,
                [(
                    CONTENT_TYPE,
                    HeaderValue::from_static(self.format.content_type()),
                )],
                body,
            )
                .into_response(),
            Err(e) => {
                tracing::error!(error = %e, "failed to render response body");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("xml encoding failed: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("xml output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Renders `payload` under a `<response>` root.
///
/// Objects contribute one child element per key, arrays a container element
/// of `<item>` children, and scalars their text. No type attributes are written.
pub fn render_xml(payload: &Value) -> Result<Vec<u8>, FormatError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_element(&mut writer, XML_ROOT, payload)?;

    Ok(writer.into_inner().into_inner())
}

/// Renders `payload` as an XML string.
pub fn render_xml_string(payload: &Value) -> Result<String, FormatError> {
    Ok(String::from_utf8(render_xml(payload)?)?)
}

fn write_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    value: &Value,
) -> Result<(), FormatError> {
    let name = element_name(name);

    writer.write_event(Event::Start(BytesStart::new(name.as_str())))?;
    match value {
        Value::Null => {}
        Value::Bool(b) => write_text(writer, if *b { "true" } else { "false" })?,
        Value::Number(n) => write_text(writer, &n.to_string())?,
        Value::String(s) => write_text(writer, s)?,
        Value::Array(items) => {
            for item in items {
                write_element(writer, XML_ITEM, item)?;
            }
        }
        Value::Object(fields) => {
            for (key, field) in fields {
                write_element(writer, key, field)?;
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(name.as_str())))?;

    Ok(())
}

fn write_text(writer: &mut Writer<Cursor<Vec<u8>>>, text: &str) -> Result<(), FormatError> {
    writer.write_event(Event::Text(BytesText::new(text)))?;
    Ok(())
}

/// Makes a payload key usable as an XML element name.
///
/// Characters outside `[A-Za-z0-9_.-]` become `_`, and names that would start
/// with a digit, `-` or `.` (or be empty) get an `n` prefix.
fn element_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let needs_prefix = name
        .chars()
        .next()
        .is_none_or(|c| c.is_ascii_digit() || c == '-' || c == '.');
    if needs_prefix {
        name.insert(0, 'n');
    }

    name
}

#[cfg(test)]
mod tests {
    use super::{ResponseFormat, element_name, render_xml_string};
    use serde_json::json;

    const DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

    #[test]
    fn test_from_accept() {
        assert_eq!(
            ResponseFormat::Xml,
            ResponseFormat::from_accept(Some("application/xml"))
        );
        assert_eq!(ResponseFormat::Json, ResponseFormat::from_accept(None));
        assert_eq!(
            ResponseFormat::Json,
            ResponseFormat::from_accept(Some("application/json"))
        );
        // Exact match only.
        assert_eq!(
            ResponseFormat::Json,
            ResponseFormat::from_accept(Some("application/xml, application/json"))
        );
        assert_eq!(
            ResponseFormat::Json,
            ResponseFormat::from_accept(Some("text/xml"))
        );
    }

    #[test]
    fn test_json_keeps_key_order() {
        let payload = json!({
            "message": "Image uploaded successfully",
            "filename": "cat.png",
            "access_url": "http://localhost/blobs/cat.png",
        });

        let body = ResponseFormat::Json.render(&payload).unwrap();

        assert_eq!(
            r#"{"message":"Image uploaded successfully","filename":"cat.png","access_url":"http://localhost/blobs/cat.png"}"#,
            String::from_utf8(body).unwrap()
        );
    }

    #[test]
    fn test_xml_flat_payload() {
        let payload = json!({ "message": "Image deleted successfully" });

        assert_eq!(
            format!("{DECL}<response><message>Image deleted successfully</message></response>"),
            render_xml_string(&payload).unwrap()
        );
    }

    #[test]
    fn test_xml_list_payload() {
        let payload = json!({
            "images": [
                { "id": 1, "filename": "a&b.png", "filesize_bytes": 1024 },
                { "id": 2, "filename": "c.png", "filesize_bytes": 0 },
            ]
        });

        assert_eq!(
            format!(
                "{DECL}<response><images>\
                <item><id>1</id><filename>a&amp;b.png</filename><filesize_bytes>1024</filesize_bytes></item>\
                <item><id>2</id><filename>c.png</filename><filesize_bytes>0</filesize_bytes></item>\
                </images></response>"
            ),
            render_xml_string(&payload).unwrap()
        );
    }

    #[test]
    fn test_xml_empty_and_scalar_values() {
        let payload = json!({ "images": [], "public": true, "note": null });

        assert_eq!(
            format!(
                "{DECL}<response><images></images><public>true</public><note></note></response>"
            ),
            render_xml_string(&payload).unwrap()
        );
    }

    #[test]
    fn test_element_name() {
        assert_eq!("access_url", element_name("access_url"));
        assert_eq!("n42", element_name("42"));
        assert_eq!("new_url_", element_name("new url!"));
        assert_eq!("n", element_name(""));
    }
}
