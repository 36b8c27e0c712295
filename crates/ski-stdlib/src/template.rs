//! Templated HTTP requests
//!
//! A request template is plain text with `{{name}}` placeholders, where
//! `name` is a dotted path into a JSON argument object:
//!
//! ```text
//! POST https://api.example.com/items/{{item.id}}
//! Content-Type: application/json
//! X-Token: {{token}}
//!
//! {"name": "{{item.name}}"}
//! ```
//!
//! The first non-empty line is `METHOD URL`, then one `Name: value` header
//! per line, a blank line, and the body.

use serde_json::Value as JsonValue;
use ski_engine::host::Request;
use thiserror::Error;

/// Errors raised while rendering or parsing a request template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// `{{` without a matching `}}`
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    /// `{{}}` or a path with empty segments
    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),

    /// No `METHOD URL` line
    #[error("missing request line")]
    MissingRequestLine,

    /// The request line is not `METHOD URL`
    #[error("invalid request line {0:?}")]
    InvalidRequestLine(String),

    /// A header line without a colon
    #[error("invalid header line {0:?}")]
    InvalidHeader(String),
}

/// Substitute every `{{path}}` in `template` from `args`.
///
/// Strings render as is, missing values and `null` as nothing, anything
/// else as its JSON text.
pub fn render(template: &str, args: &JsonValue) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + open))?;
        let path = after[..close].trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(TemplateError::EmptyPlaceholder(offset + open));
        }
        match lookup(args, path) {
            Some(JsonValue::String(text)) => out.push_str(text),
            Some(JsonValue::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup<'a>(args: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(args, |value, segment| match value {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Parse rendered request text into a [`Request`]
pub fn parse_request(text: &str) -> Result<Request, TemplateError> {
    let mut lines = text.split_inclusive('\n');

    let request_line = lines
        .by_ref()
        .map(trim_line)
        .find(|line| !line.is_empty())
        .ok_or(TemplateError::MissingRequestLine)?;
    let mut parts = request_line.split_whitespace();
    let (method, url) = match (parts.next(), parts.next()) {
        (Some(method), Some(url)) => (method, url),
        _ => return Err(TemplateError::InvalidRequestLine(request_line.to_string())),
    };
    let mut request = Request::new(method, url);

    let mut body = String::new();
    let mut in_body = false;
    for line in lines {
        if in_body {
            body.push_str(line);
            continue;
        }
        let header = trim_line(line);
        if header.is_empty() {
            in_body = true;
            continue;
        }
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| TemplateError::InvalidHeader(header.to_string()))?;
        request = request.header(name.trim(), value.trim());
    }

    let body = body.trim_end_matches(['\r', '\n']);
    if !body.is_empty() {
        request = request.body(body.as_bytes().to_vec());
    }
    Ok(request)
}

fn trim_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n']).trim()
}

/// Render `template` with `args` and parse the result
pub fn request_from_template(template: &str, args: &JsonValue) -> Result<Request, TemplateError> {
    parse_request(&render(template, args)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_paths() {
        let args = json!({ "user": { "name": "ada", "ids": [7, 8] }, "n": 3, "none": null });
        assert_eq!(
            render("{{user.name}}/{{ user.ids.1 }}/{{n}}/{{none}}/{{missing}}", &args).unwrap(),
            "ada/8/3//"
        );
        assert_eq!(render("{{user.ids}}", &args).unwrap(), "[7,8]");
        assert_eq!(render("no placeholders", &args).unwrap(), "no placeholders");
    }

    #[test]
    fn test_render_errors() {
        assert_eq!(
            render("a {{oops", &json!({})),
            Err(TemplateError::Unterminated(2))
        );
        assert_eq!(
            render("{{ }}", &json!({})),
            Err(TemplateError::EmptyPlaceholder(0))
        );
        assert!(render("{{a..b}}", &json!({})).is_err());
    }

    #[test]
    fn test_parse_request() {
        let text = "\nPOST https://example.com/items HTTP/1.1\r\nContent-Type: application/json\r\nX-Id: 9\r\n\r\n{\"a\": 1}\n";
        let request = parse_request(text).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "https://example.com/items");
        assert_eq!(request.header_value("content-type"), Some("application/json"));
        assert_eq!(request.header_value("X-Id"), Some("9"));
        assert_eq!(request.body.as_deref(), Some(&b"{\"a\": 1}"[..]));
    }

    #[test]
    fn test_parse_request_without_body() {
        let request = parse_request("get http://example.com/").unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
    }

    #[test]
    fn test_parse_request_errors() {
        assert_eq!(parse_request("  \n"), Err(TemplateError::MissingRequestLine));
        assert!(matches!(
            parse_request("GET"),
            Err(TemplateError::InvalidRequestLine(_))
        ));
        assert!(matches!(
            parse_request("GET http://x/\nbroken header\n"),
            Err(TemplateError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_request_from_template() {
        let request = request_from_template(
            "GET https://example.com/u/{{id}}\nAuthorization: Bearer {{token}}\n",
            &json!({ "id": 42, "token": "t0k" }),
        )
        .unwrap();
        assert_eq!(request.url, "https://example.com/u/42");
        assert_eq!(request.header_value("authorization"), Some("Bearer t0k"));
    }
}
