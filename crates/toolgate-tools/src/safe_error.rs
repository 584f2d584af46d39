//! Caller-facing error text that never carries host details.

use std::io;
use std::sync::LazyLock;

use regex::Regex;

static DB_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:postgres(?:ql)?|mysql|mariadb|mongodb(?:\+srv)?|redis|rediss|amqps?|mssql|sqlserver|oracle|jdbc:[a-z]+)://[^\s'\x22<>]+",
    )
    .expect("database url regex is valid")
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z][a-z0-9+.-]*://[^\s'\x22<>]+").expect("url regex is valid")
});

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(password|passwd|secret|token|api_key|apikey)\s*[=:]\s*\S+")
        .expect("credential regex is valid")
});

static HOME_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(Users|home)/[^/\s'\x22]+(?:/[^\s'\x22:,;)]*)?").expect("home path regex is valid")
});

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s'\x22(=])(/[\w.\-]+(?:/[\w.\-]+)+/?)").expect("unix path regex is valid")
});

static WINDOWS_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z]:\\[^\s'\x22]*").expect("windows path regex is valid")
});

static IP_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}(:\d{1,5})?\b").expect("ip regex is valid")
});

static HOST_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:localhost|[a-z0-9-]+(?:\.[a-z0-9-]+)+):\d{1,5}\b")
        .expect("host port regex is valid")
});

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:localhost|(?:[a-z0-9-]+\.)+(?:com|net|org|io|dev|local|internal|lan|corp|cloud|app|co))\b",
    )
    .expect("hostname regex is valid")
});

/// Scrub host-identifying details from an error message.
///
/// Database URLs become `<database_url>`, other URLs `<url>`, credentials assigned in
/// `key=value` form lose their value, home directories keep their root but lose the
/// user (`/Users/<user>/<path>`), other absolute paths become `<path>`, and addresses,
/// ports and hostnames become `<ip>`, `<port>` and `<host>`.
#[must_use]
pub fn scrub_sensitive_text(text: &str) -> String {
    let s = DB_URL_RE.replace_all(text, "<database_url>");
    let s = URL_RE.replace_all(&s, "<url>");
    let s = CREDENTIAL_RE.replace_all(&s, "$1=<redacted>");
    let s = HOME_PATH_RE.replace_all(&s, "/$1/<user>/<path>");
    let s = UNIX_PATH_RE.replace_all(&s, |caps: &regex::Captures<'_>| {
        let whole = &caps[0];
        let path = &caps[1];
        if path.contains("<user>") {
            whole.to_owned()
        } else {
            format!("{}<path>", &whole[..whole.len() - path.len()])
        }
    });
    let s = WINDOWS_PATH_RE.replace_all(&s, "<path>");
    let s = IP_PORT_RE.replace_all(&s, |caps: &regex::Captures<'_>| {
        if caps.get(1).is_some() {
            "<ip>:<port>".to_owned()
        } else {
            "<ip>".to_owned()
        }
    });
    let s = HOST_PORT_RE.replace_all(&s, "<host>:<port>");
    HOSTNAME_RE.replace_all(&s, "<host>").into_owned()
}

/// Generic description for an I/O failure class.
#[must_use]
pub fn describe_io_kind(kind: io::ErrorKind) -> &'static str {
    use io::ErrorKind as K;
    match kind {
        K::NotFound => "a required file or resource was not found",
        K::PermissionDenied => "permission was denied while accessing a required resource",
        K::AlreadyExists => "a resource already exists",
        K::TimedOut => "the operation timed out",
        K::ConnectionRefused
        | K::ConnectionReset
        | K::ConnectionAborted
        | K::NotConnected
        | K::AddrInUse
        | K::AddrNotAvailable
        | K::BrokenPipe => "a network or pipe connection failed",
        K::InvalidInput | K::InvalidData => "invalid input or data was encountered",
        K::OutOfMemory => "the process ran out of memory",
        K::Interrupted => "the operation was interrupted",
        _ => "an internal error occurred",
    }
}

/// Builds caller-facing error messages. Raw detail is only appended, scrubbed, when
/// `include_details` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeErrorFormatter {
    include_details: bool,
}

impl SafeErrorFormatter {
    #[must_use]
    pub fn new(include_details: bool) -> Self {
        Self { include_details }
    }

    #[must_use]
    pub fn include_details(&self) -> bool {
        self.include_details
    }

    /// Safe message for an I/O error raised while running `tool`.
    #[must_use]
    pub fn format_io(&self, err: &io::Error, tool: &str, request_id: Option<&str>) -> String {
        self.format(describe_io_kind(err.kind()), &err.to_string(), tool, request_id)
    }

    /// Safe message built from a generic `summary`; `detail` is the raw text that may be
    /// attached after scrubbing.
    #[must_use]
    pub fn format(
        &self,
        summary: &str,
        detail: &str,
        tool: &str,
        request_id: Option<&str>,
    ) -> String {
        let mut msg = format!("Tool '{tool}' failed: {summary}");
        if let Some(id) = request_id {
            msg.push_str(&format!(" (request id: {id})"));
        }
        if self.include_details && !detail.is_empty() {
            msg.push_str(". Details: ");
            msg.push_str(&scrub_sensitive_text(detail));
        }
        msg
    }
}
