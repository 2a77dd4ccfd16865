use httparse::Request;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::{
    fs::{self, File},
    io::{Read, Seek, SeekFrom, Write},
    net::TcpStream,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::fsutil::{escape_html, get_mime_type, secure_join};

pub const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// What a handler reports back to the connection loop: whether the
/// connection may be reused, the response status, and the number of
/// body bytes written (for the access log).
pub type Outcome = (bool, u16, u64);

const NOT_FOUND_BODY: &[u8] = b"404 page not found";

/// Byte-range selection parsed from a `Range` header, relative to a
/// resource of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No (usable) Range header; serve the whole resource.
    Full,
    /// Inclusive byte span to serve with 206.
    Span(u64, u64),
    /// A `bytes=` range was given but cannot be satisfied; 416.
    Unsatisfiable,
}

/// Parses a single-range `bytes=` header (`N-M`, `N-`, `-N`).
/// Anything else, including multipart ranges, degrades to `Full`.
pub fn parse_range(headers: &[httparse::Header], len: u64) -> RangeSpec {
    let Some(value) = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("range"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.strip_prefix("bytes="))
    else {
        return RangeSpec::Full;
    };

    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 2 {
        return RangeSpec::Full;
    }
    let (start_str, end_str) = (parts[0].trim(), parts[1].trim());
    let last = len.saturating_sub(1);

    if start_str.is_empty() {
        // suffix form: last N bytes
        return match end_str.parse::<u64>() {
            Ok(suffix) if suffix > 0 && len > 0 => {
                RangeSpec::Span(len.saturating_sub(suffix), last)
            }
            _ => RangeSpec::Unsatisfiable,
        };
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeSpec::Full;
    };
    if start >= len {
        return RangeSpec::Unsatisfiable;
    }
    let end = if end_str.is_empty() {
        last
    } else {
        match end_str.parse::<u64>() {
            Ok(e) => e.min(last),
            Err(_) => return RangeSpec::Full,
        }
    };
    if start > end {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Span(start, end)
}

/// True when the client's `If-Modified-Since` token is at least as new
/// as the file's mtime. Comparison is at whole-second granularity to
/// match the header format.
fn not_modified(headers: &[httparse::Header], mtime: SystemTime) -> bool {
    let Some(since) = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("if-modified-since"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    else {
        return false;
    };
    let secs = |t: SystemTime| t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    secs(mtime) <= secs(since)
}

/// Resolves and serves one request path against `root`. All failures
/// are converted into error responses; the only errors returned are
/// socket write errors, which end the connection.
pub fn serve_path(
    stream: &mut TcpStream,
    req_path: &str,
    headers: &[httparse::Header],
    root: &Path,
    keep_alive: bool,
    head: bool,
) -> std::io::Result<Outcome> {
    // the query is delimited by a raw '?'; an encoded %3F is part of
    // the filename, so split before decoding
    let (raw_path, query) = match req_path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (req_path, None),
    };
    let raw_path = if raw_path.is_empty() { "/" } else { raw_path };
    let decoded_path = percent_decode_str(raw_path)
        .decode_utf8()
        .unwrap_or_else(|_| raw_path.into());
    let normalized = decoded_path.replace('\\', "/");

    let target = normalized.trim_start_matches('/');
    let wants_dir = normalized.ends_with('/') || normalized == "/";

    // paths escaping the root report exactly like missing ones
    let Some(fs_path) = secure_join(root, target) else {
        return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
    };

    let Ok(metadata) = fs::metadata(&fs_path) else {
        return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
    };

    // symlink backstop: an existing path must still canonicalize to
    // somewhere under the root
    if let Ok(canon) = fs_path.canonicalize() {
        let base_canon = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        if !canon.starts_with(&base_canon) {
            return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
        }
    }

    if metadata.is_dir() {
        if !wants_dir {
            return send_redirect(stream, &normalized, query, keep_alive, head);
        }
        let index = fs_path.join("index.html");
        if fs::metadata(&index).map(|m| m.is_file()).unwrap_or(false) {
            return serve_file(stream, &index, headers, keep_alive, head);
        }
        return serve_listing(stream, &fs_path, &normalized, keep_alive, head);
    }

    if metadata.is_file() {
        return serve_file(stream, &fs_path, headers, keep_alive, head);
    }

    // sockets, fifos and friends are not served
    send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head)
}

/// 301 to the slash-suffixed path so relative links inside the
/// directory resolve correctly. The query string, if any, survives
/// the redirect.
fn send_redirect(
    stream: &mut TcpStream,
    normalized: &str,
    query: Option<&str>,
    keep_alive: bool,
    head: bool,
) -> std::io::Result<Outcome> {
    let mut encoded_location =
        utf8_percent_encode(&format!("{}/", normalized), PATH_ENCODE_SET).to_string();
    if let Some(query) = query {
        encoded_location.push('?');
        encoded_location.push_str(query);
    }
    let body = format!(
        "<a href=\"{}\">Moved Permanently</a>",
        encoded_location
    );
    let extra = format!("Location: {}\r\n", encoded_location);
    send_response(
        stream,
        301,
        body.as_bytes(),
        "text/html; charset=utf-8",
        keep_alive,
        head,
        Some(&extra),
    )
}

fn serve_file(
    stream: &mut TcpStream,
    path: &Path,
    headers: &[httparse::Header],
    keep_alive: bool,
    head: bool,
) -> std::io::Result<Outcome> {
    let Ok(mut file) = File::open(path) else {
        return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
    };
    let Ok(metadata) = file.metadata() else {
        return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
    };
    if !metadata.is_file() {
        return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
    }

    let len = metadata.len();
    let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);
    let last_modified = format!("Last-Modified: {}\r\n", httpdate::fmt_http_date(mtime));
    let mime = get_mime_type(path);

    let range = parse_range(headers, len);

    if range == RangeSpec::Full && not_modified(headers, mtime) {
        let extra = format!("{}Accept-Ranges: bytes\r\n", last_modified);
        send_headers(stream, 304, &mime, 0, keep_alive, Some(&extra))?;
        stream.flush()?;
        return Ok((keep_alive, 304, 0));
    }

    if range == RangeSpec::Unsatisfiable {
        let extra = format!("Content-Range: bytes */{}\r\n", len);
        return send_response(
            stream,
            416,
            b"Range Not Satisfiable",
            "text/plain",
            keep_alive,
            head,
            Some(&extra),
        );
    }

    let (status, start, end) = match range {
        RangeSpec::Span(start, end) => (206, start, end),
        _ => (200, 0, len.saturating_sub(1)),
    };
    let content_length = if len == 0 { 0 } else { end - start + 1 };

    let mut extra = String::with_capacity(128);
    extra.push_str(&last_modified);
    extra.push_str("Accept-Ranges: bytes\r\n");
    if status == 206 {
        extra.push_str(&format!("Content-Range: bytes {}-{}/{}\r\n", start, end, len));
    }

    send_headers(stream, status, &mime, content_length, keep_alive, Some(&extra))?;

    if head {
        stream.flush()?;
        return Ok((keep_alive, status, 0));
    }

    if status == 206 {
        file.seek(SeekFrom::Start(start))?;
        let mut reader = std::io::BufReader::with_capacity(65536, file.take(content_length));
        std::io::copy(&mut reader, stream)?;
    } else {
        std::io::copy(&mut file, stream)?;
    }
    stream.flush()?;
    Ok((keep_alive, status, content_length))
}

/// Generated directory index: immediate children, lexicographically
/// sorted, subdirectories slash-suffixed.
fn serve_listing(
    stream: &mut TcpStream,
    dir: &Path,
    req_path: &str,
    keep_alive: bool,
    head: bool,
) -> std::io::Result<Outcome> {
    let Ok(entries) = fs::read_dir(dir) else {
        return send_error(stream, 404, NOT_FOUND_BODY, keep_alive, head);
    };

    let mut names: Vec<String> = entries
        .flatten()
        .map(|entry| {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();

    let title = escape_html(req_path);
    let mut body = String::with_capacity(256 + names.len() * 64);
    body.push_str("<!DOCTYPE html>\n<html><head><title>Index of ");
    body.push_str(&title);
    body.push_str("</title></head><body>\n<h1>Index of ");
    body.push_str(&title);
    body.push_str("</h1>\n<pre>\n");
    for name in &names {
        let href = utf8_percent_encode(name, PATH_ENCODE_SET).to_string();
        body.push_str(&format!(
            "<a href=\"{}\">{}</a>\n",
            href,
            escape_html(name)
        ));
    }
    body.push_str("</pre>\n</body></html>\n");

    send_response(
        stream,
        200,
        body.as_bytes(),
        "text/html; charset=utf-8",
        keep_alive,
        head,
        None,
    )
}

pub fn is_keep_alive(req: &Request) -> bool {
    let is_http11 = req.version.unwrap_or(0) == 1;
    if let Some(h) = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("connection"))
        && let Ok(val) = std::str::from_utf8(h.value)
    {
        if val.eq_ignore_ascii_case("keep-alive") {
            return true;
        }
        if val.eq_ignore_ascii_case("close") {
            return false;
        }
        return val.to_lowercase().contains("keep-alive");
    }
    is_http11
}

pub fn send_headers(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    length: u64,
    keep_alive: bool,
    extra_headers: Option<&str>,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        416 => "Range Not Satisfiable",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    };

    let mut buf = Vec::with_capacity(256);
    let conn = if keep_alive { "keep-alive" } else { "close" };
    let date_header = httpdate::fmt_http_date(SystemTime::now());
    let mut num_buf = itoa::Buffer::new();

    write!(
        &mut buf,
        "HTTP/1.1 {} {}\r\nDate: {}\r\nContent-Type: {}\r\nContent-Length: ",
        status, reason, date_header, content_type
    )?;
    buf.extend_from_slice(num_buf.format(length).as_bytes());
    buf.extend_from_slice(b"\r\nConnection: ");
    buf.extend_from_slice(conn.as_bytes());
    buf.extend_from_slice(b"\r\n");
    if let Some(extra) = extra_headers {
        buf.extend_from_slice(extra.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");

    stream.write_all(&buf)
}

pub fn send_response(
    stream: &mut TcpStream,
    status: u16,
    body: &[u8],
    content_type: &str,
    keep_alive: bool,
    head: bool,
    extra_headers: Option<&str>,
) -> std::io::Result<Outcome> {
    send_headers(
        stream,
        status,
        content_type,
        body.len() as u64,
        keep_alive,
        extra_headers,
    )?;
    let bytes = if head {
        0
    } else {
        stream.write_all(body)?;
        body.len() as u64
    };
    stream.flush()?;
    Ok((keep_alive, status, bytes))
}

pub fn send_error(
    stream: &mut TcpStream,
    status: u16,
    message: &[u8],
    keep_alive: bool,
    head: bool,
) -> std::io::Result<Outcome> {
    let content_type = if message.starts_with(b"<") {
        "text/html; charset=utf-8"
    } else {
        "text/plain"
    };
    send_response(stream, status, message, content_type, keep_alive, head, None)
}
