//! Minimal HTTP/1.0 framing spoken over a transfer socket.
//!
//! ```text
//! DOWNLOAD:  GET <path> HTTP/1.0          UPLOAD:  PUT <path> HTTP/1.0
//!            Host: <host>                          Host: <host>
//!            [Range: bytes=<off>-]                 Content-Length: <n>
//!                                                  [Content-Range: bytes <off>-<end>/<len>]
//! ```
//!
//! Response heads are parsed with `httparse`. Only the status code,
//! `Content-Length` and `Content-Range` are interpreted; bodies must use the
//! identity transfer coding.

use http::StatusCode;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, TRANSFER_ENCODING};
use url::Url;

use crate::TransferError;

/// Upper bound on a response header block.
pub(crate) const MAX_HEAD_LEN: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

const USER_AGENT: &str = concat!("gridxfer/", env!("CARGO_PKG_VERSION"));

/// Host, port and request path of a candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Target {
    /// Parses an `http://` URL.
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        let url = Url::parse(raw).map_err(|e| TransferError::InvalidUrl(format!("{raw}: {e}")))?;
        if url.scheme() != "http" {
            return Err(TransferError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransferError::InvalidUrl(format!("{raw}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransferError::InvalidUrl(format!("{raw}: missing port")))?;
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self { host, port, path })
    }

    fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http://{}{}", self.host_header(), self.path)
    }
}

/// Builds the request head for a download resuming at `offset`.
pub(crate) fn download_request(target: &Target, offset: u64) -> Vec<u8> {
    let mut head = request_line("GET", target);
    if offset > 0 {
        head.push_str(&format!("Range: bytes={offset}-\r\n"));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// Builds the request head for an upload of bytes `offset..len`.
pub(crate) fn upload_request(target: &Target, offset: u64, len: u64) -> Vec<u8> {
    let mut head = request_line("PUT", target);
    head.push_str(&format!("Content-Length: {}\r\n", len - offset));
    if offset > 0 && len > offset {
        head.push_str(&format!(
            "Content-Range: bytes {offset}-{}/{len}\r\n",
            len - 1
        ));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

fn request_line(method: &str, target: &Target) -> String {
    format!(
        "{method} {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: {USER_AGENT}\r\nConnection: close\r\n",
        target.path,
        target.host_header()
    )
}

/// Parsed response status line and headers of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) content_length: Option<u64>,
    pub(crate) content_range: Option<ContentRange>,
}

/// Value of a `Content-Range: bytes <first>-<last>/<complete>` header.
///
/// `first` is `None` for the `*/<complete>` form sent with 416. `complete`
/// is `None` when the server does not know the full length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub(crate) first: Option<u64>,
    pub(crate) complete: Option<u64>,
}

/// Parses the response head at the start of `buf`.
///
/// Returns `None` until the blank line ending the head has arrived, else
/// the head and its length in bytes.
pub(crate) fn parse_response_head(
    buf: &[u8],
) -> Result<Option<(ResponseHead, usize)>, TransferError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let head_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => {
            return Err(TransferError::Protocol(format!(
                "malformed response head: {e}"
            )));
        }
    };
    let code = response
        .code
        .ok_or_else(|| TransferError::Protocol("response without status code".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|e| TransferError::Protocol(format!("bad status {code}: {e}")))?;

    let mut head = ResponseHead {
        status,
        content_length: None,
        content_range: None,
    };
    for header in response.headers.iter() {
        let name = header.name;
        let value = std::str::from_utf8(header.value)
            .map_err(|_| TransferError::Protocol(format!("non UTF-8 value in {name}")))?
            .trim();
        if name.eq_ignore_ascii_case(CONTENT_LENGTH.as_str()) {
            let len = value
                .parse::<u64>()
                .map_err(|_| TransferError::Protocol(format!("bad Content-Length: {value:?}")))?;
            head.content_length = Some(len);
        } else if name.eq_ignore_ascii_case(CONTENT_RANGE.as_str()) {
            head.content_range = Some(parse_content_range(value)?);
        } else if name.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str())
            && !value.eq_ignore_ascii_case("identity")
        {
            return Err(TransferError::Protocol(format!(
                "unsupported Transfer-Encoding: {value}"
            )));
        }
    }
    Ok(Some((head, head_len)))
}

fn parse_content_range(value: &str) -> Result<ContentRange, TransferError> {
    let bad = || TransferError::Protocol(format!("bad Content-Range: {value:?}"));
    let (range, complete) = value
        .strip_prefix("bytes ")
        .and_then(|rest| rest.trim().split_once('/'))
        .ok_or_else(bad)?;
    let first = match range {
        "*" => None,
        range => {
            let (first, _) = range.split_once('-').ok_or_else(bad)?;
            Some(first.trim().parse::<u64>().map_err(|_| bad())?)
        }
    };
    let complete = match complete {
        "*" => None,
        len => Some(len.trim().parse::<u64>().map_err(|_| bad())?),
    };
    Ok(ContentRange { first, complete })
}
