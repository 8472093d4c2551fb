use std::str;

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{headers::MAX_HEADERS, Request, Response};

// an assembled response must fit on the wire in one piece; overflowing it is
// a protocol violation, not a truncation opportunity
const MAX_RESPONSE_SIZE: usize = 1024;

const MAX_METHOD_SIZE: usize = 16;

/// One decoded inbound message. A header block that blows the header cap is
/// not a parse error but a request the caller must refuse; it carries the
/// headers read so far so the refusal can still echo `CSeq`. The byte stream
/// is not framed past a rejected block.
pub enum Incoming {
    Request(Request),
    OverLimit(Request),
}

/// Stateful RTSP/1.0 request parser and response serialiser. Requests may
/// arrive in arbitrarily fragmented TCP segments; the codec assembles the
/// header block line by line and then reads exactly `Content-Length` bytes
/// of body.
pub struct Codec {
    partial: Option<Request>,
    content_length: Option<usize>,
    // a bare CR at the end of a segment may be half of a split CRLF
    swallow_lf: bool,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            partial: None,
            content_length: None,
            swallow_lf: false,
        }
    }

    // accepts CR, LF, or CRLF as terminator, even split across segments
    fn take_line(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if self.swallow_lf {
            if src.is_empty() {
                return Ok(None);
            }
            if src[0] == b'\n' {
                src.advance(1);
            }
            self.swallow_lf = false;
        }

        let end = match src.iter().position(|&x| x == b'\r' || x == b'\n') {
            Some(end) => end,
            None => return Ok(None),
        };

        let line = src.split_to(end);
        let terminator = src[0];
        src.advance(1);
        if terminator == b'\r' {
            if src.is_empty() {
                self.swallow_lf = true;
            } else if src[0] == b'\n' {
                src.advance(1);
            }
        }

        let line = str::from_utf8(&line).map_err(|_| anyhow!("bad packet"))?;

        Ok(Some(line.to_string()))
    }
}

fn parse_request_line(line: &str) -> Result<Request> {
    let mut parts = line.split(' ');

    let method = parts.next().unwrap_or_default();
    if method.is_empty() || method.len() > MAX_METHOD_SIZE || !method.is_ascii() {
        bail!("bad method {:?}", method);
    }
    let path = parts.next().ok_or_else(|| anyhow!("no request uri"))?;
    match parts.next() {
        Some("RTSP/1.0") => {}
        other => bail!("bad protocol version {:?}", other),
    }
    if parts.next().is_some() {
        bail!("trailing data in request line");
    }

    Ok(Request {
        method: method.to_string(),
        path: path.to_string(),
        headers: super::Headers::new(),
        content: Vec::new(),
    })
}

impl Decoder for Codec {
    type Item = Incoming;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(length) = self.content_length {
                if src.len() < length {
                    return Ok(None);
                }

                let mut request = self
                    .partial
                    .take()
                    .ok_or_else(|| anyhow!("content without header block"))?;
                request.content = src.split_to(length).to_vec();
                self.content_length = None;

                return Ok(Some(Incoming::Request(request)));
            }

            let line = match self.take_line(src)? {
                Some(line) => line,
                None => return Ok(None),
            };

            match self.partial.take() {
                None => {
                    self.partial = Some(parse_request_line(&line)?);
                }
                Some(mut request) if !line.is_empty() => {
                    let (name, value) = line
                        .split_once(": ")
                        .ok_or_else(|| anyhow!("bad header {:?}", line))?;
                    // over-limit header blocks are rejected, never truncated
                    if request.headers.len() >= MAX_HEADERS {
                        return Ok(Some(Incoming::OverLimit(request)));
                    }
                    request.headers.add(name, value)?;
                    self.partial = Some(request);
                }
                Some(request) => {
                    let length = match request.headers.get("Content-Length") {
                        Some(value) => value
                            .trim()
                            .parse()
                            .map_err(|_| anyhow!("bad Content-Length {:?}", value))?,
                        None => 0,
                    };
                    self.content_length = Some(length);
                    self.partial = Some(request);
                }
            }
        }
    }
}

impl Encoder<Response> for Codec {
    type Error = anyhow::Error;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut packet = Vec::with_capacity(MAX_RESPONSE_SIZE);

        packet.extend_from_slice(
            format!("RTSP/1.0 {} {}\r\n", response.status as u32, response.status.reason()).as_bytes(),
        );
        for (name, value) in response.headers.iter() {
            packet.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        packet.extend_from_slice(b"\r\n");

        if packet.len() > MAX_RESPONSE_SIZE {
            bail!("attempted to write overlong RTSP packet of {} bytes", packet.len());
        }

        dst.extend_from_slice(&packet);

        Ok(())
    }
}
