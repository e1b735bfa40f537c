//! FastCGI responder client, enough to run one script on PHP-FPM.
//!
//! Record layout (all integers big endian):
//! `version:u8 type:u8 request_id:u16 content_length:u16 padding:u8 reserved:u8`

use std::io;
use std::time::Duration;

use super::exchange;
use crate::uri::Endpoint;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
const REQUEST_ID: u16 = 1;
const ROLE_RESPONDER: u16 = 1;
const MAX_CONTENT: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::BeginRequest),
            3 => Some(Self::EndRequest),
            4 => Some(Self::Params),
            5 => Some(Self::Stdin),
            6 => Some(Self::Stdout),
            7 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Script output, split from the FastCGI framing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub app_status: u32,
}

impl Response {
    /// Stdout without the CGI header block.
    pub fn body(&self) -> &[u8] {
        match find(&self.stdout, b"\r\n\r\n") {
            Some(i) => &self.stdout[i + 4..],
            None => match find(&self.stdout, b"\n\n") {
                Some(i) => &self.stdout[i + 2..],
                None => &self.stdout,
            },
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn push_record(out: &mut Vec<u8>, kind: RecordType, content: &[u8]) {
    let padding = (8 - content.len() % 8) % 8;
    out.push(VERSION);
    out.push(kind as u8);
    out.extend_from_slice(&REQUEST_ID.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.push(padding as u8);
    out.push(0);
    out.extend_from_slice(content);
    out.extend(std::iter::repeat(0u8).take(padding));
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Encodes name-value pairs for a PARAMS stream.
pub fn encode_params(params: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in params {
        push_length(&mut out, name.len());
        push_length(&mut out, value.len());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}

/// Builds the full request: BEGIN_REQUEST, PARAMS stream, empty STDIN.
pub fn encode_request(params: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut begin = Vec::with_capacity(8);
    begin.extend_from_slice(&ROLE_RESPONDER.to_be_bytes());
    begin.extend_from_slice(&[0u8; 6]); // flags: close connection when done
    push_record(&mut out, RecordType::BeginRequest, &begin);

    let encoded = encode_params(params);
    for chunk in encoded.chunks(MAX_CONTENT) {
        push_record(&mut out, RecordType::Params, chunk);
    }
    push_record(&mut out, RecordType::Params, &[]);
    push_record(&mut out, RecordType::Stdin, &[]);
    out
}

/// Decodes records up to END_REQUEST. `Ok(None)` means more bytes are needed.
pub fn decode_response(buf: &[u8]) -> Result<Option<Response>, String> {
    let mut response = Response::default();
    let mut pos = 0;

    while buf.len() >= pos + HEADER_LEN {
        let header = &buf[pos..pos + HEADER_LEN];
        if header[0] != VERSION {
            return Err(format!("unsupported FastCGI version {}", header[0]));
        }
        let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding = header[6] as usize;
        let end = pos + HEADER_LEN + content_len + padding;
        if buf.len() < end {
            return Ok(None);
        }
        let content = &buf[pos + HEADER_LEN..pos + HEADER_LEN + content_len];

        match RecordType::from_u8(header[1]) {
            Some(RecordType::Stdout) => response.stdout.extend_from_slice(content),
            Some(RecordType::Stderr) => response.stderr.extend_from_slice(content),
            Some(RecordType::EndRequest) => {
                if content.len() >= 4 {
                    response.app_status =
                        u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
                }
                return Ok(Some(response));
            }
            _ => {}
        }
        pos = end;
    }
    Ok(None)
}

/// Runs `script` on the FastCGI server at `endpoint`.
pub async fn get(endpoint: &Endpoint, script: &str, timeout: Duration) -> io::Result<Response> {
    let request = encode_request(&[
        ("GATEWAY_INTERFACE", "FastCGI/1.0"),
        ("REQUEST_METHOD", "GET"),
        ("SCRIPT_FILENAME", script),
        ("SCRIPT_NAME", script),
        ("QUERY_STRING", ""),
        ("SERVER_PROTOCOL", "HTTP/1.1"),
    ]);

    let raw = exchange(endpoint, &request, timeout, |buf| {
        matches!(decode_response(buf), Ok(Some(_)) | Err(_))
    })
    .await?;

    decode_response(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before END_REQUEST",
            )
        })
}
