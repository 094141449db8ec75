//! WebSocket handshake and frame codec, layered on top of the HTTP/1.1 core.
//!
//! The handshake ([`upgrade::try_upgrade`]) runs inside a normal
//! [`Handler::handle`](crate::Handler::handle) call, exactly like any other
//! route. Once the 101 response is written, [`Handler::handle_ws`] takes
//! over the raw socket and [`WebSocketConnection`] drives the RFC 6455
//! frame layer on top of it.

use crate::{
    arena::{Arena, ArenaBuf},
    limits::WsLimits,
};
use std::{error, fmt, io};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub mod upgrade {
    //! Validates the opening handshake and finalizes the `101` response.

    use super::ACCEPT_GUID;
    use crate::{Handled, Request, Response, StatusCode};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sha1::{Digest, Sha1};
    use std::{error, fmt};

    /// Why an upgrade attempt was rejected.
    ///
    /// Carries no data beyond the identity of the missing/invalid header,
    /// since the handshake never retries with partial information.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum UpgradeError {
        /// `Connection` header missing or doesn't contain the `upgrade` token.
        MissingConnection,
        /// `Upgrade` header missing or doesn't contain the `websocket` token.
        MissingUpgrade,
        /// `Sec-WebSocket-Version` missing or not exactly `13`.
        UnsupportedVersion,
        /// `Sec-WebSocket-Key` missing or empty.
        MissingKey,
    }

    impl fmt::Display for UpgradeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                UpgradeError::MissingConnection => "missing or invalid `connection` header",
                UpgradeError::MissingUpgrade => "missing or invalid `upgrade` header",
                UpgradeError::UnsupportedVersion => {
                    "missing or unsupported `sec-websocket-version`"
                }
                UpgradeError::MissingKey => "missing or empty `sec-websocket-key`",
            })
        }
    }

    impl error::Error for UpgradeError {}

    /// Validates the four required upgrade headers and, on success,
    /// finalizes `response` as a `101 Switching Protocols` upgrade via
    /// [`Response::upgrade`].
    ///
    /// Does not consult any parser-level "this looked like an upgrade
    /// request" flag — a request with a correct `Upgrade`/`Connection`
    /// header pair upgrades regardless of how it got here.
    ///
    /// # Examples
    /// ```
    /// use kestrel_web::{ws::upgrade::try_upgrade, Handled, Request, Response, StatusCode};
    ///
    /// fn handle(req: &Request, resp: &mut Response) -> Handled {
    ///     match try_upgrade(req, resp) {
    ///         Ok(handled) => handled,
    ///         Err(e) => resp.status(StatusCode::BadRequest).body(e.to_string()),
    ///     }
    /// }
    /// ```
    pub fn try_upgrade(request: &Request, response: &mut Response) -> Result<Handled, UpgradeError> {
        let connection = request
            .header(b"connection")
            .ok_or(UpgradeError::MissingConnection)?;
        if !header_has_token(connection, b"upgrade") {
            return Err(UpgradeError::MissingConnection);
        }

        let upgrade = request
            .header(b"upgrade")
            .ok_or(UpgradeError::MissingUpgrade)?;
        if !header_has_token(upgrade, b"websocket") {
            return Err(UpgradeError::MissingUpgrade);
        }

        let version = request
            .header(b"sec-websocket-version")
            .ok_or(UpgradeError::UnsupportedVersion)?;
        if version != b"13" {
            return Err(UpgradeError::UnsupportedVersion);
        }

        let key = request
            .header(b"sec-websocket-key")
            .ok_or(UpgradeError::MissingKey)?;
        if key.is_empty() {
            return Err(UpgradeError::MissingKey);
        }

        let accept = accept_key(key);

        Ok(response
            .status(StatusCode::SwitchingProtocols)
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-accept", accept.as_str())
            .upgrade())
    }

    fn accept_key(key: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(key);
        hasher.update(ACCEPT_GUID);
        STANDARD.encode(hasher.finalize())
    }

    fn header_has_token(value: &[u8], token: &[u8]) -> bool {
        value
            .split(|&b| b == b',')
            .any(|part| trim_ascii_ws(part).eq_ignore_ascii_case(token))
    }

    fn trim_ascii_ws(mut src: &[u8]) -> &[u8] {
        while let [first, rest @ ..] = src {
            if first.is_ascii_whitespace() {
                src = rest;
            } else {
                break;
            }
        }
        while let [rest @ .., last] = src {
            if last.is_ascii_whitespace() {
                src = rest;
            } else {
                break;
            }
        }
        src
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn accept_key_matches_rfc6455_example() {
            // https://datatracker.ietf.org/doc/html/rfc6455#section-1.3
            assert_eq!(
                accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
            );
        }

        #[test]
        fn header_has_token_is_case_insensitive_and_trims() {
            assert!(header_has_token(b"Upgrade", b"upgrade"));
            assert!(header_has_token(b"keep-alive, Upgrade", b"upgrade"));
            assert!(header_has_token(b" upgrade ", b"upgrade"));
            assert!(!header_has_token(b"keep-alive", b"upgrade"));
        }
    }
}

/// Frame opcode (RFC 6455 section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum OpCode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl OpCode {
    fn from_u8(byte: u8) -> Result<Self, WsError> {
        match byte {
            0 => Ok(OpCode::Continuation),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            _ => Err(WsError::Protocol("invalid opcode")),
        }
    }

    const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    mask: [u8; 4],
    len: usize,
}

struct Fragment<'a> {
    opcode: OpCode,
    payload: ArenaBuf<'a, u8>,
}

/// A fully reassembled WebSocket message delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message; already validated as UTF-8.
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// A peer-initiated close, already echoed back by
    /// [`WebSocketConnection::read_message`] when `auto_close` is set.
    Close { code: u16, reason: String },
}

/// A WebSocket-layer failure: a protocol violation or a transport error.
#[derive(Debug)]
pub enum WsError {
    /// A frame or message violated RFC 6455.
    Protocol(&'static str),
    /// The underlying transport failed or the peer disappeared mid-frame.
    Io(io::Error),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsError::Protocol(msg) => write!(f, "WebSocket protocol error: {msg}"),
            WsError::Io(err) => write!(f, "WebSocket I/O error: {err}"),
        }
    }
}

impl error::Error for WsError {}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> Self {
        WsError::Io(err)
    }
}

/// A WebSocket connection running the RFC 6455 frame layer over an already
/// upgraded [`TcpStream`].
///
/// Built from the socket and scratch buffer handed to
/// [`Handler::handle_ws`](crate::Handler::handle_ws), so no allocation is
/// needed beyond what the HTTP connection already reserved (plus the
/// fragment reassembly buffer, which only grows when a message actually
/// spans multiple frames, and is backed by the same per-connection
/// [`Arena`] the HTTP side used for its request buffer).
pub struct WebSocketConnection<'a> {
    stream: &'a mut TcpStream,
    buffer: &'a mut [u8],
    pos: usize,
    len: usize,
    limits: WsLimits,
    arena: &'a Arena,
    fragment: Option<Fragment<'a>>,
    close_sent: bool,
}

impl<'a> WebSocketConnection<'a> {
    /// Wraps an already-upgraded stream. `buffer` must fit a full frame
    /// header (2 + 8 length + 4 mask = 14 bytes); the request buffer handed
    /// to `handle_ws` is always large enough. `arena` backs the fragment
    /// reassembly buffer for messages spanning more than one frame.
    #[inline]
    pub fn new(stream: &'a mut TcpStream, buffer: &'a mut [u8], limits: WsLimits, arena: &'a Arena) -> Self {
        debug_assert!(
            buffer.len() >= 14,
            "WebSocket scratch buffer must fit a full frame header"
        );

        Self {
            stream,
            buffer,
            pos: 0,
            len: 0,
            limits,
            arena,
            fragment: None,
            close_sent: false,
        }
    }

    /// Reads and reassembles the next complete message.
    ///
    /// `Ping` frames are answered with an automatic `Pong` (when
    /// `auto_pong` is set) and never surfaced to the caller; `Pong` frames
    /// are silently dropped. A `Close` frame is echoed back (when
    /// `auto_close` is set) and returned as [`Message::Close`] — the
    /// caller should stop reading and drop the connection afterward.
    pub async fn read_message(&mut self) -> Result<Message, WsError> {
        let result = self.read_message_inner().await;
        if let Err(WsError::Protocol(reason)) = &result {
            tracing::warn!(reason, "websocket protocol violation");
        }
        result
    }

    async fn read_message_inner(&mut self) -> Result<Message, WsError> {
        loop {
            let header = self.read_frame_header().await?;
            let payload = self.read_payload(header.len, header.mask).await?;

            if header.opcode.is_control() {
                match header.opcode {
                    OpCode::Ping => {
                        if self.limits.auto_pong {
                            self.write_frame(OpCode::Pong, &payload).await?;
                        }
                        continue;
                    }
                    OpCode::Pong => continue,
                    OpCode::Close => {
                        let (code, reason) = parse_close_payload(&payload)?;
                        if self.limits.auto_close && !self.close_sent {
                            self.write_close(code, reason.as_bytes()).await?;
                        }
                        return Ok(Message::Close { code, reason });
                    }
                    _ => unreachable!("is_control() only matches Close/Ping/Pong"),
                }
            }

            match (header.opcode, &mut self.fragment) {
                (OpCode::Continuation, None) => {
                    return Err(WsError::Protocol("continuation with no active fragment"));
                }
                (OpCode::Continuation, Some(frag)) => {
                    if frag.payload.len() + payload.len() > self.limits.max_message_size {
                        return Err(WsError::Protocol("reassembled message too large"));
                    }
                    frag.payload
                        .extend_from_slice(&payload)
                        .map_err(|_| WsError::Protocol("reassembly buffer allocator exhausted"))?;

                    if header.fin {
                        let frag = self.fragment.take().expect("checked Some above");
                        return finish_message(frag.opcode, frag.payload.as_slice().to_vec());
                    }
                }
                (_, Some(_)) => {
                    return Err(WsError::Protocol(
                        "data frame interleaved with an active fragment",
                    ));
                }
                (opcode, None) if header.fin => return finish_message(opcode, payload),
                (opcode, None) => {
                    let mut buf = ArenaBuf::new(self.arena);
                    buf.extend_from_slice(&payload)
                        .map_err(|_| WsError::Protocol("reassembly buffer allocator exhausted"))?;
                    self.fragment = Some(Fragment { opcode, payload: buf });
                }
            }
        }
    }

    /// Sends a text message.
    pub async fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.write_frame(OpCode::Text, text.as_bytes()).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError> {
        self.write_frame(OpCode::Binary, data).await
    }

    /// Sends a close frame with the given code and UTF-8 reason, and marks
    /// the connection as having initiated closure (suppresses a redundant
    /// echo if the peer's close frame arrives afterward).
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        self.write_close(code, reason.as_bytes()).await
    }

    async fn write_close(&mut self, code: u16, reason: &[u8]) -> Result<(), WsError> {
        self.close_sent = true;
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
        self.write_frame(OpCode::Close, &payload).await
    }

    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        let header = encode_frame_header(opcode, payload.len());
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        Ok(())
    }

    async fn read_frame_header(&mut self) -> Result<FrameHeader, WsError> {
        self.ensure(2).await?;
        let b0 = self.buffer[self.pos];
        let b1 = self.buffer[self.pos + 1];
        self.pos += 2;

        let fin = b0 & 0x80 != 0;
        if b0 & 0x70 != 0 {
            return Err(WsError::Protocol("reserved bits must be zero"));
        }
        let opcode = OpCode::from_u8(b0 & 0x0F)?;

        let masked = b1 & 0x80 != 0;
        if !masked {
            return Err(WsError::Protocol("client frame must be masked"));
        }
        let len7 = b1 & 0x7F;

        if opcode.is_control() && (!fin || len7 > 125) {
            return Err(WsError::Protocol("control frame must be unfragmented and <= 125 bytes"));
        }

        let len = match len7 {
            126 => {
                self.ensure(2).await?;
                let n = u16::from_be_bytes([self.buffer[self.pos], self.buffer[self.pos + 1]]);
                self.pos += 2;
                n as usize
            }
            127 => {
                self.ensure(8).await?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buffer[self.pos..self.pos + 8]);
                self.pos += 8;
                u64::from_be_bytes(raw) as usize
            }
            direct => direct as usize,
        };

        if len > self.limits.max_message_size {
            return Err(WsError::Protocol("frame exceeds the configured maximum size"));
        }

        self.ensure(4).await?;
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&self.buffer[self.pos..self.pos + 4]);
        self.pos += 4;

        Ok(FrameHeader { fin, opcode, mask, len })
    }

    async fn read_payload(&mut self, len: usize, mask: [u8; 4]) -> Result<Vec<u8>, WsError> {
        let mut payload = Vec::with_capacity(len);
        let mut remaining = len;

        while remaining > 0 {
            if self.pos >= self.len {
                self.refill().await?;
            }

            let available = (self.len - self.pos).min(remaining);
            payload.extend_from_slice(&self.buffer[self.pos..self.pos + available]);
            self.pos += available;
            remaining -= available;
        }

        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        Ok(payload)
    }

    /// Ensures at least `need` unread bytes are available in `buffer`,
    /// compacting already-consumed bytes out of the way and reading more
    /// from the socket as required.
    async fn ensure(&mut self, need: usize) -> Result<(), WsError> {
        debug_assert!(need <= self.buffer.len());

        loop {
            if self.len - self.pos >= need {
                return Ok(());
            }

            if self.pos > 0 {
                self.buffer.copy_within(self.pos..self.len, 0);
                self.len -= self.pos;
                self.pos = 0;
            }

            let n = self.stream.read(&mut self.buffer[self.len..]).await?;
            if n == 0 {
                return Err(WsError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
            self.len += n;
        }
    }

    async fn refill(&mut self) -> Result<(), WsError> {
        self.pos = 0;
        self.len = self.stream.read(self.buffer).await?;
        if self.len == 0 {
            return Err(WsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
        Ok(())
    }
}

fn finish_message(opcode: OpCode, payload: Vec<u8>) -> Result<Message, WsError> {
    match opcode {
        OpCode::Text => {
            if simdutf8::basic::from_utf8(&payload).is_err() {
                return Err(WsError::Protocol("invalid UTF-8 in text message"));
            }
            // SAFETY: validated immediately above.
            Ok(Message::Text(unsafe { String::from_utf8_unchecked(payload) }))
        }
        OpCode::Binary => Ok(Message::Binary(payload)),
        _ => unreachable!("continuation/control opcodes never reach finish_message"),
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<(u16, String), WsError> {
    match payload.len() {
        0 => Ok((1000, String::new())),
        1 => Err(WsError::Protocol("close frame payload must be empty or >= 2 bytes")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(WsError::Protocol("invalid close code"));
            }

            if simdutf8::basic::from_utf8(&payload[2..]).is_err() {
                return Err(WsError::Protocol("invalid UTF-8 in close reason"));
            }
            // SAFETY: validated immediately above.
            let reason = unsafe { std::str::from_utf8_unchecked(&payload[2..]) }.to_owned();

            Ok((code, reason))
        }
    }
}

const fn is_valid_close_code(code: u16) -> bool {
    (1000 <= code && code <= 4999) && !matches!(code, 1004 | 1005 | 1006 | 1015)
}

fn encode_frame_header(opcode: OpCode, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(10);
    header.push(0x80 | opcode as u8);

    match payload_len {
        n if n <= 125 => header.push(n as u8),
        n if n <= u16::MAX as usize => {
            header.push(126);
            header.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            header.push(127);
            header.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_validity_table() {
        let valid = [1000, 1001, 1002, 1003, 1008, 1011, 3000, 4999];
        let invalid = [999, 1004, 1005, 1006, 1015, 5000, 0];

        for code in valid {
            assert!(is_valid_close_code(code), "{code} should be valid");
        }
        for code in invalid {
            assert!(!is_valid_close_code(code), "{code} should be invalid");
        }
    }

    #[test]
    fn parse_close_payload_empty_defaults_to_normal() {
        let (code, reason) = parse_close_payload(&[]).unwrap();
        assert_eq!(code, 1000);
        assert_eq!(reason, "");
    }

    #[test]
    fn parse_close_payload_single_byte_is_protocol_error() {
        assert!(matches!(
            parse_close_payload(&[0x03]),
            Err(WsError::Protocol(_))
        ));
    }

    #[test]
    fn parse_close_payload_decodes_code_and_reason() {
        let mut payload = 1001u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");

        let (code, reason) = parse_close_payload(&payload).unwrap();
        assert_eq!(code, 1001);
        assert_eq!(reason, "bye");
    }

    #[test]
    fn parse_close_payload_rejects_invalid_utf8_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);

        assert!(matches!(
            parse_close_payload(&payload),
            Err(WsError::Protocol(_))
        ));
    }

    #[test]
    fn parse_close_payload_rejects_reserved_code() {
        let payload = 1005u16.to_be_bytes();
        assert!(matches!(
            parse_close_payload(&payload),
            Err(WsError::Protocol(_))
        ));
    }

    #[test]
    fn encode_frame_header_small_payload() {
        let header = encode_frame_header(OpCode::Text, 5);
        assert_eq!(header, vec![0x80 | 1, 5]);
    }

    #[test]
    fn encode_frame_header_medium_payload() {
        let header = encode_frame_header(OpCode::Binary, 200);
        assert_eq!(header, vec![0x80 | 2, 126, 0, 200]);
    }

    #[test]
    fn encode_frame_header_large_payload() {
        let header = encode_frame_header(OpCode::Binary, 70_000);
        assert_eq!(header[0], 0x80 | 2);
        assert_eq!(header[1], 127);
        assert_eq!(&header[2..], &(70_000u64).to_be_bytes());
    }

    #[test]
    fn opcode_from_u8_rejects_unknown() {
        assert!(matches!(OpCode::from_u8(3), Err(WsError::Protocol(_))));
        assert!(matches!(OpCode::from_u8(11), Err(WsError::Protocol(_))));
    }

    #[test]
    fn opcode_is_control_classification() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
    }
}
