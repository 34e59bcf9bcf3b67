//! Per-connection HTTP/1.x request state machine.
//!
//! ```text
//!  WaitForRequestLine ──line──▶ ReadingHeaders ──blank line──▶ DoneReading
//!          ▲                                                      │
//!          └───────────── keep-alive ◀────────────────────────────┤
//!                                                                 ├──▶ Upgrade
//!                               fatal error ──▶ BadRequest        └──▶ Closed
//! ```
//!
//! `feed` never blocks. When a line is incomplete the unconsumed tail is kept
//! as carry-over and prepended to the next `feed`.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::HttpError;
use crate::grammar::{
    MAX_HEADER_LINE, MAX_HEADERS, MAX_REQUEST_LINE, RequestLine, find_line_end,
    parse_header_line, parse_request_line, read_line,
};
use crate::http::Method;
use crate::response::{Response, ServeContext};

/// Stable identifier of a connection within its reactor.
pub type ConnId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    WaitForRequestLine,
    ReadingHeaders,
    DoneReading,
    Upgrade,
    BadRequest,
    Closed,
}

/// Notified on every state transition of every connection.
pub trait StateObserver: Send + Sync {
    fn state_changed(&self, id: ConnId, old: State, new: State);
}

/// What an upgrading connection surrenders to the WebSocket side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Verbatim request line and headers, blank line included.
    pub head: Vec<u8>,
    /// Bytes received after the blank line.
    pub leftover: Vec<u8>,
}

/// Input thrown away after a rejected request line, so the rest of that
/// request is not parsed as new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Nothing,
    /// The remainder of an over-long line.
    Line,
    /// Header lines up to and including the blank line.
    Head,
}

/// Result of pushing queued responses to a writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flush {
    /// The queue is empty.
    pub drained: bool,
    /// Responses that finished during this call.
    pub completed: usize,
    pub bytes: u64,
}

pub struct Connection {
    id: ConnId,
    state: State,
    discard: Discard,
    carry: Vec<u8>,
    line: String,
    head: Option<Vec<u8>>,
    headers: HashMap<String, String>,
    header_lines: usize,
    request: Option<RequestLine>,
    keep_alive: bool,
    leftover: Vec<u8>,
    responses: VecDeque<Response>,
    observer: Option<Arc<dyn StateObserver>>,
}

impl Connection {
    pub fn new(id: ConnId) -> Self {
        Self {
            id,
            state: State::WaitForRequestLine,
            discard: Discard::Nothing,
            carry: Vec::new(),
            line: String::new(),
            head: Some(Vec::new()),
            headers: HashMap::new(),
            header_lines: 0,
            request: None,
            keep_alive: false,
            leftover: Vec::new(),
            responses: VecDeque::new(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn StateObserver>>) -> Self {
        self.observer = observer;
        self
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// The request line currently being read, if any.
    pub fn request_line(&self) -> Option<&RequestLine> {
        self.request.as_ref()
    }

    pub fn has_pending_responses(&self) -> bool {
        !self.responses.is_empty()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn responses(&self) -> impl Iterator<Item = &Response> {
        self.responses.iter()
    }

    /// No more requests will be parsed: the connection is closing or leaving.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::BadRequest | State::Closed | State::Upgrade)
    }

    fn set_state(&mut self, new: State) {
        let old = self.state;
        if old == new {
            return;
        }
        trace!(conn = self.id, ?old, ?new, "state change");
        self.state = new;
        if let Some(observer) = &self.observer {
            observer.state_changed(self.id, old, new);
        }
    }

    /// Mark the connection closed; used by the reactor when evicting.
    pub fn mark_closed(&mut self) {
        self.set_state(State::Closed);
    }

    /// Forget the previous request and wait for the next request line.
    fn reset_for_next_request(&mut self) {
        self.headers.clear();
        self.header_lines = 0;
        self.request = None;
        self.head = Some(Vec::new());
        self.set_state(State::WaitForRequestLine);
    }

    fn append_head(&mut self, bytes: &[u8]) {
        if let Some(head) = self.head.as_mut() {
            head.extend_from_slice(bytes);
        }
    }

    /// Consume newly received bytes, queueing a response for every request
    /// (or protocol error) they complete.
    pub fn feed(&mut self, data: &[u8]) {
        match self.state {
            State::Upgrade => {
                self.leftover.extend_from_slice(data);
                return;
            }
            State::BadRequest | State::Closed => return,
            _ => {}
        }

        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(data);
        let mut pos = 0;

        loop {
            match self.state {
                State::WaitForRequestLine => {
                    let progressed = match self.discard {
                        Discard::Line => Some(self.discard_line(&buf, &mut pos)),
                        Discard::Head => Some(self.discard_head_line(&buf, &mut pos)),
                        Discard::Nothing => None,
                    };
                    match progressed {
                        Some(true) => continue,
                        Some(false) => break,
                        None => {}
                    }

                    let start = pos;
                    self.line.clear();
                    if !read_line(&buf, &mut pos, false, &mut self.line) {
                        if buf.len() - pos > MAX_REQUEST_LINE + 2 {
                            self.fail(HttpError::uri_too_long("request line too long", false));
                            self.discard = Discard::Line;
                            continue;
                        }
                        break;
                    }
                    if pos - start == 2 {
                        continue;
                    }
                    self.append_head(&buf[start..pos]);
                    let parsed = if pos - start - 2 > MAX_REQUEST_LINE {
                        Err(HttpError::uri_too_long("request line too long", false))
                    } else {
                        parse_request_line(&self.line)
                    };
                    match parsed {
                        Ok(request) => {
                            trace!(conn = self.id, uri = %request.uri, "request line");
                            self.request = Some(request);
                            self.set_state(State::ReadingHeaders);
                        }
                        Err(err) => self.fail(err),
                    }
                }
                State::ReadingHeaders => {
                    let start = pos;
                    self.line.clear();
                    if !read_line(&buf, &mut pos, true, &mut self.line) {
                        if buf.len() - pos > MAX_HEADER_LINE + 2 {
                            self.fail(HttpError::bad_request("header line too long", true));
                        }
                        break;
                    }
                    self.append_head(&buf[start..pos]);
                    if pos - start == 2 {
                        self.set_state(State::DoneReading);
                        continue;
                    }
                    if pos - start - 2 > MAX_HEADER_LINE {
                        self.fail(HttpError::bad_request("header line too long", true));
                        continue;
                    }
                    self.header_lines += 1;
                    if self.header_lines > MAX_HEADERS {
                        self.fail(HttpError::bad_request("too many headers", true));
                        continue;
                    }
                    match parse_header_line(&self.line) {
                        Ok((name, value)) => {
                            self.headers.insert(name, value);
                        }
                        Err(err) => self.fail(err),
                    }
                }
                State::DoneReading => {
                    let rest = &buf[pos..];
                    if self.finish_request(rest) {
                        pos = buf.len();
                    }
                }
                State::Upgrade | State::BadRequest | State::Closed => break,
            }
        }

        if matches!(self.state, State::WaitForRequestLine | State::ReadingHeaders) {
            buf.drain(..pos);
            self.carry = buf;
        }
    }

    /// Skip to the end of the current line. Returns `false` when its
    /// terminator has not arrived yet.
    fn discard_line(&mut self, buf: &[u8], pos: &mut usize) -> bool {
        match find_line_end(buf, *pos, false) {
            Some(cr) => {
                *pos = cr + 2;
                self.discard = Discard::Head;
                true
            }
            None => {
                // A trailing CR stays; its LF may start the next read.
                let keep = usize::from(buf.last() == Some(&b'\r'));
                *pos = (buf.len() - keep).max(*pos);
                false
            }
        }
    }

    /// Skip one header line of a rejected request; the blank line ends the
    /// skipping. Returns `false` when more input is needed.
    fn discard_head_line(&mut self, buf: &[u8], pos: &mut usize) -> bool {
        let Some(cr) = find_line_end(buf, *pos, false) else {
            if buf.len() - *pos > MAX_HEADER_LINE + 2 {
                self.discard = Discard::Line;
                return true;
            }
            return false;
        };
        if cr == *pos {
            self.discard = Discard::Nothing;
        }
        *pos = cr + 2;
        true
    }

    /// Act on a complete head. Returns `true` when `rest` was taken as
    /// upgrade leftover.
    fn finish_request(&mut self, rest: &[u8]) -> bool {
        let upgrading = self
            .headers
            .get("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if upgrading {
            debug!(
                conn = self.id,
                uri = self.request.as_ref().map(|r| r.uri.as_str()),
                "websocket upgrade requested"
            );
            self.leftover = rest.to_vec();
            self.set_state(State::Upgrade);
            return true;
        }

        if let Err(err) = self.check_request() {
            self.fail(err);
            return false;
        }
        let Some(request) = self.request.take() else {
            return false;
        };

        self.keep_alive = request.minor_version > 0
            && self.headers.get("connection").is_some_and(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
            });

        debug!(
            conn = self.id,
            method = %request.method_name,
            uri = %request.uri,
            keep_alive = self.keep_alive,
            "request complete"
        );
        let headers = std::mem::take(&mut self.headers);
        self.responses.push_back(Response::for_request(
            request.method,
            request.uri,
            headers,
            !self.keep_alive,
        ));

        if self.keep_alive {
            self.reset_for_next_request();
        } else {
            self.set_state(State::Closed);
        }
        false
    }

    fn check_request(&self) -> Result<(), HttpError> {
        let Some(request) = &self.request else {
            return Err(HttpError::bad_request("missing request line", true));
        };
        if !request.method.is_supported() {
            return Err(HttpError::method_not_allowed(&request.method_name));
        }
        if self.headers.contains_key("content-length") {
            return Err(HttpError::payload_too_large());
        }
        if self.headers.contains_key("transfer-encoding") {
            return Err(HttpError::not_implemented("transfer codings are not supported"));
        }
        Ok(())
    }

    /// Queue the error reply. Recoverable errors skip the rest of the
    /// rejected request and resume at the next request line; fatal ones stop
    /// parsing until the connection closes.
    fn fail(&mut self, err: HttpError) {
        debug!(conn = self.id, state = ?self.state, error = %err, "request rejected");
        let method = self
            .request
            .as_ref()
            .map(|r| r.method)
            .unwrap_or(Method::Get);
        self.responses
            .push_back(Response::error(&err, method, err.fatal));
        if err.fatal {
            self.keep_alive = false;
            self.set_state(State::BadRequest);
        } else {
            self.reset_for_next_request();
            self.discard = Discard::Head;
        }
    }

    /// Hand over the raw head and leftover bytes. Yields `Some` at most once,
    /// and only in the `Upgrade` state.
    pub fn take_upgrade(&mut self) -> Option<UpgradeRequest> {
        if self.state != State::Upgrade {
            return None;
        }
        let head = self.head.take()?;
        Some(UpgradeRequest {
            head,
            leftover: std::mem::take(&mut self.leftover),
        })
    }

    /// Write queued responses in order, one at a time, until the queue is
    /// empty or the writer pushes back.
    pub fn write_responses<W: Write>(
        &mut self,
        ctx: &ServeContext<'_>,
        out: &mut W,
    ) -> io::Result<Flush> {
        let mut flush = Flush::default();
        while let Some(current) = self.responses.front_mut() {
            let before = current.bytes_sent();
            let done = current.write(ctx, out);
            flush.bytes += current.bytes_sent() - before;
            if !done? {
                return Ok(flush);
            }
            self.responses.pop_front();
            flush.completed += 1;
        }
        flush.drained = true;
        Ok(flush)
    }
}
