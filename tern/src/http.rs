use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get, Post, Put, Delete, Patch, Head, Options, Trace, Connect, Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

/// Status phrase and human message for each error page we render.
struct ErrorPage {
    phrase: &'static str,
    message: &'static str,
}

static ERROR_PAGES: LazyLock<HashMap<u16, ErrorPage>> = LazyLock::new(|| {
    HashMap::from([
        (400, ErrorPage { phrase: "Bad Request", message: "Your request is invalid or malformed." }),
        (403, ErrorPage { phrase: "Forbidden", message: "You don't have permission to access this page." }),
        (404, ErrorPage { phrase: "Not Found", message: "The page you're looking for doesn't exist." }),
        (405, ErrorPage {
            phrase: "Method Not Allowed",
            message: "The method you're trying to use is not allowed for this resource.",
        }),
        (500, ErrorPage { phrase: "Internal Server Error", message: "Something went wrong on the server." }),
        (502, ErrorPage {
            phrase: "Bad Gateway",
            message: "The server received an invalid response from an upstream server.",
        }),
    ])
});

const FALLBACK_ERROR: u16 = 500;

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        other => match ERROR_PAGES.get(&other) {
            Some(page) => page.phrase,
            None => "Unknown",
        },
    }
}

/// A complete response. Every response closes the connection, so there is no
/// keep-alive or chunked variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn ok(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, content_type, body)
    }

    pub fn text(body: impl Into<Vec<u8>>) -> Self {
        Self::ok("text/plain; charset=UTF-8", body)
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self::ok("text/html; charset=UTF-8", body)
    }

    pub fn redirect(location: &str) -> Self {
        Self::new(301, "text/plain", format!("Redirecting to {}", location))
            .with_header("Location", location)
    }

    /// HTML error page for `code`. Codes outside the table render as 500.
    pub fn error(code: u16) -> Self {
        Self::error_with_hint(code, "")
    }

    /// Like [`Response::error`], appending `hint` to the fixed message.
    pub fn error_with_hint(code: u16, hint: &str) -> Self {
        let (code, page) = match ERROR_PAGES.get(&code) {
            Some(page) => (code, page),
            None => (FALLBACK_ERROR, &ERROR_PAGES[&FALLBACK_ERROR]),
        };
        let mut message = page.message.to_string();
        if !hint.is_empty() {
            message.push(' ');
            message.push_str(hint);
        }
        let body = format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{code} {phrase}</title>
    <style>
        body {{ font-family: sans-serif; text-align: center; margin-top: 100px; color: #444; }}
        h1 {{ font-size: 48px; }}
        p {{ font-size: 20px; }}
        a {{ color: #007acc; text-decoration: none; }}
    </style>
</head>
<body>
    <h1>{code} - {phrase}</h1>
    <p>{message}</p>
    <p><a href="/">Back to Home</a></p>
</body>
</html>
"#,
            phrase = page.phrase,
        );
        Self::new(code, "text/html; charset=UTF-8", body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to wire format, stamping `Date` with the current time.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_at(SystemTime::now())
    }

    pub fn to_bytes_at(&self, now: SystemTime) -> Vec<u8> {
        let mut head = String::with_capacity(128);
        // Writing into a String cannot fail.
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        let _ = write!(head, "Content-Type: {}\r\n", self.content_type);
        let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        head.push_str("Connection: close\r\n");
        let _ = write!(head, "Date: {}\r\n", httpdate::fmt_http_date(now));
        for (k, v) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", k, v);
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}
