//! The login handshake (spec §4.3, §4.4).
//!
//! A connection starts life as a plain HTTP/1.1 POST to
//! `/__rpc_service__`. The client sends its credential and supported
//! compression set as custom headers; once the server accepts, both sides
//! drop into raw frame mode on the same socket. `httparse` does the request
//! line/header parsing (it already covers this for the teacher's own h1
//! codec); the switch to frame mode reuses [`crate::common::io::Rewind`] to
//! carry forward any body bytes `httparse` already buffered.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::io::Rewind;
use crate::compress::CompressType;
use crate::error::{Error, Kind, Result};

pub(crate) const LOGIN_PATH: &str = "/__rpc_service__";
const MAX_HEADER_LEN: usize = 16 * 1024;

/// Credential and peer capabilities presented at login, parsed off either
/// the client request (server side) or response (client side).
#[derive(Debug, Clone, Default)]
pub(crate) struct LoginInfo {
    pub(crate) auth_ticket: Option<String>,
    pub(crate) compress_types: Vec<CompressType>,
    pub(crate) tos: Option<u8>,
}

impl LoginInfo {
    fn from_owned_headers(headers: &[(String, Vec<u8>)]) -> Result<LoginInfo> {
        let mut info = LoginInfo::default();
        for (name, value) in headers {
            let v = std::str::from_utf8(value).map_err(Error::new_protocol)?;
            match name.as_str() {
                "Cookie" => info.auth_ticket = parse_auth_ticket(v),
                "X-Poppy-Compress-Type" => {
                    info.compress_types = v
                        .split(',')
                        .filter_map(|s| s.trim().parse::<i32>().ok())
                        .filter_map(CompressType::from_i32)
                        .collect();
                }
                "X-Poppy-Tos" => info.tos = v.trim().parse::<u8>().ok(),
                _ => {}
            }
        }
        Ok(info)
    }
}

fn parse_auth_ticket(cookie_header: &str) -> Option<String> {
    cookie_header.split(';').find_map(|kv| {
        let kv = kv.trim();
        kv.strip_prefix("POPPY_AUTH_TICKET=").map(percent_decode)
    })
}

/// Minimal percent-decoding for the credential cookie value; login
/// credentials are the only percent-encoded field on the wire so a general
/// URI-decoding crate isn't worth pulling in.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) =
                u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16)
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Outcome of the server side of the handshake.
pub(crate) enum LoginOutcome<T> {
    /// Verified; connection is now in frame mode.
    Accepted {
        io: Rewind<T>,
        peer_compress_types: Vec<CompressType>,
    },
    /// Sent `400`/`401`/`403` and closed.
    Rejected,
}

/// Client side: send the POST request line, login headers, and wait for
/// the status line + headers reply.
pub(crate) async fn client_login<T: AsyncRead + AsyncWrite + Unpin>(
    mut io: T,
    auth_ticket: &str,
    supported_compress: &[CompressType],
    tos: Option<u8>,
) -> Result<(Rewind<T>, Vec<CompressType>)> {
    let compress_csv = supported_compress
        .iter()
        .filter(|c| **c != CompressType::Auto)
        .map(|c| (*c as i32).to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut request = format!(
        "POST {} HTTP/1.1\r\nCookie: POPPY_AUTH_TICKET={}\r\nX-Poppy-Compress-Type: {}\r\n",
        LOGIN_PATH,
        percent_encode(auth_ticket),
        compress_csv,
    );
    if let Some(tos) = tos {
        request.push_str(&format!("X-Poppy-Tos: {}\r\n", tos));
    }
    request.push_str("Content-Length: 0\r\n\r\n");

    io.write_all(request.as_bytes())
        .await
        .map_err(Error::new_io)?;
    io.flush().await.map_err(Error::new_io)?;

    let (status, headers, leftover) = read_http_message(&mut io, true).await?;
    if status != 200 {
        return Err(
            Error::new(Kind::Login).with(format!("server rejected login with status {}", status))
        );
    }

    let info = LoginInfo::from_owned_headers(&headers)?;
    Ok((Rewind::new_buffered(io, leftover), info.compress_types))
}

/// Server side: parse the client's POST + headers, invoke `verify`, and
/// reply with the matching status line.
pub(crate) async fn server_login<T, F>(
    mut io: T,
    our_compress: &[CompressType],
    verify: F,
) -> Result<LoginOutcome<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&LoginInfo) -> std::result::Result<(), LoginRejection>,
{
    let parsed = async {
        let (_status, headers, leftover) = read_http_message(&mut io, false).await?;
        let info = LoginInfo::from_owned_headers(&headers)?;
        Ok::<_, Error>((info, leftover))
    }
    .await;
    let (info, leftover) = match parsed {
        Ok(pair) => pair,
        Err(err) if err.is_protocol() => {
            let _ = io.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
            let _ = io.flush().await;
            return Ok(LoginOutcome::Rejected);
        }
        Err(err) => return Err(err),
    };

    match verify(&info) {
        Ok(()) => {
            let compress_csv = our_compress
                .iter()
                .filter(|c| **c != CompressType::Auto)
                .map(|c| (*c as i32).to_string())
                .collect::<Vec<_>>()
                .join(",");
            let reply = format!(
                "HTTP/1.1 200 OK\r\nX-Poppy-Compress-Type: {}\r\nContent-Length: 0\r\n\r\n",
                compress_csv
            );
            io.write_all(reply.as_bytes()).await.map_err(Error::new_io)?;
            io.flush().await.map_err(Error::new_io)?;
            Ok(LoginOutcome::Accepted {
                io: Rewind::new_buffered(io, leftover),
                peer_compress_types: info.compress_types,
            })
        }
        Err(rejection) => {
            let (code, reason) = rejection.status_line();
            let reply = format!("HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n", code, reason);
            let _ = io.write_all(reply.as_bytes()).await;
            let _ = io.flush().await;
            Ok(LoginOutcome::Rejected)
        }
    }
}

/// Why the server declined a login attempt (spec §4.3).
pub(crate) enum LoginRejection {
    /// `403 Forbidden`: credential was understood but denied.
    Denied,
    /// `401 Unauthorized`: the verifier itself failed (not a clean denial).
    VerifierError,
}

impl LoginRejection {
    fn status_line(&self) -> (u16, &'static str) {
        match self {
            LoginRejection::Denied => (403, "Forbidden"),
            LoginRejection::VerifierError => (401, "Unauthorized"),
        }
    }
}

/// Read one HTTP/1.1 request or response (status line + headers) off `io`,
/// returning the status code (0 for a parsed request), the owned headers,
/// and whatever body bytes `httparse` had already buffered past the
/// `\r\n\r\n` terminator.
async fn read_http_message<T: AsyncRead + Unpin>(
    io: &mut T,
    is_response: bool,
) -> Result<(u16, Vec<(String, Vec<u8>)>, Bytes)> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 1024];
        let n = io.read(&mut chunk).await.map_err(Error::new_io)?;
        if n == 0 {
            return Err(Error::new(Kind::Login).with("connection closed during login"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEADER_LEN {
            return Err(Error::new_protocol("login headers too large"));
        }

        let mut raw_headers = [httparse::EMPTY_HEADER; 32];
        let status = if is_response {
            let mut resp = httparse::Response::new(&mut raw_headers);
            match resp.parse(&buf).map_err(Error::new_protocol)? {
                httparse::Status::Complete(used) => Some((resp.code.unwrap_or(0), used)),
                httparse::Status::Partial => None,
            }
        } else {
            let mut req = httparse::Request::new(&mut raw_headers);
            match req.parse(&buf).map_err(Error::new_protocol)? {
                httparse::Status::Complete(used) => Some((0, used)),
                httparse::Status::Partial => None,
            }
        };

        if let Some((status, used)) = status {
            let headers = raw_headers
                .iter()
                .take_while(|h| *h != &httparse::EMPTY_HEADER)
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect::<Vec<_>>();
            let leftover = Bytes::copy_from_slice(&buf[used..]);
            return Ok((status, headers, leftover));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_percent_encoded_ticket() {
        let cookie = "POPPY_AUTH_TICKET=a%3Ab%20c";
        assert_eq!(parse_auth_ticket(cookie).as_deref(), Some("a:b c"));
    }

    #[test]
    fn round_trips_percent_encoding() {
        let raw = "user:secret token";
        assert_eq!(percent_decode(&percent_encode(raw)), raw);
    }
}
