//! Wire protocol: request parsing and reply encoding.
//!
//! Requests arrive either inline (a single line, whitespace separated with
//! quoting) or multi-bulk (`*N` followed by N length-prefixed arguments);
//! the form is auto-detected from the first byte. Replies are staged in a
//! fixed buffer per client and overflow into a queue of byte chunks with
//! small-chunk coalescing.

use crate::config::LimitsConfig;
use crate::object::Obj;
use crate::util::{string_to_i64, IntBuf};
use lazy_static::lazy_static;
use std::collections::VecDeque;
use std::io;
use std::mem;

pub const REPLY_CHUNK_BYTES: usize = 16 * 1024;

/// Bulk arguments at least this large take the buffer-donation path.
pub const BIG_ARG: usize = 32 * 1024;

const WRONGTYPE_TEXT: &str =
    "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Handle to a process-wide immutable reply fragment. Handles share the
/// lifecycle of the pooled small integers: copy on clone, no-op on drop,
/// the backing bytes are never freed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Shared {
    Ok,
    Pong,
    NilBulk,
    NullMultibulk,
    WrongType,
}

lazy_static! {
    static ref SHARED_REPLIES: [Vec<u8>; 5] = [
        b"+OK\r\n".to_vec(),
        b"+PONG\r\n".to_vec(),
        b"$-1\r\n".to_vec(),
        b"*-1\r\n".to_vec(),
        format!("-{}\r\n", WRONGTYPE_TEXT).into_bytes(),
    ];
}

impl Shared {
    /// Resolves the handle into the pooled fragment.
    #[inline]
    pub fn bytes(self) -> &'static [u8] {
        let pool: &'static [Vec<u8>; 5] = &SHARED_REPLIES;
        &pool[self as usize]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReqType {
    Inline,
    Multibulk,
}

/// Per-client request parsing state, reset on every command boundary.
pub struct RequestState {
    pub reqtype: Option<ReqType>,
    pub multibulklen: i64,
    pub bulklen: i64,
}

impl RequestState {
    pub fn new() -> RequestState {
        RequestState { reqtype: None, multibulklen: 0, bulklen: -1 }
    }

    pub fn reset(&mut self) {
        self.reqtype = None;
        self.multibulklen = 0;
        self.bulklen = -1;
    }
}

impl Default for RequestState {
    fn default() -> RequestState {
        RequestState::new()
    }
}

pub enum ParseResult {
    /// More bytes are needed.
    Incomplete,
    /// A full request was consumed; argv holds the arguments (possibly none
    /// for an empty inline line).
    Ready,
    /// Malformed input. The text is the protocol error to report before
    /// closing the connection.
    Error(String),
}

/// Consumes at most one request from the head of `querybuf` into `argv`.
pub fn parse(
    state: &mut RequestState,
    querybuf: &mut Vec<u8>,
    argv: &mut Vec<Obj>,
    limits: &LimitsConfig,
) -> ParseResult {
    if state.reqtype.is_none() {
        if querybuf.is_empty() {
            return ParseResult::Incomplete;
        }
        state.reqtype = Some(if querybuf[0] == b'*' {
            ReqType::Multibulk
        } else {
            ReqType::Inline
        });
    }

    match state.reqtype {
        Some(ReqType::Inline) => parse_inline(querybuf, argv, limits),
        Some(ReqType::Multibulk) => parse_multibulk(state, querybuf, argv, limits),
        None => unreachable!(),
    }
}

fn parse_inline(
    querybuf: &mut Vec<u8>,
    argv: &mut Vec<Obj>,
    limits: &LimitsConfig,
) -> ParseResult {
    let newline = match querybuf.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None => {
            if querybuf.len() > limits.inline_max_size {
                return ParseResult::Error("Protocol error: too big inline request".to_string());
            }
            return ParseResult::Incomplete;
        }
    };

    let mut line_end = newline;
    if line_end > 0 && querybuf[line_end - 1] == b'\r' {
        line_end -= 1;
    }

    let args = match split_args(&querybuf[..line_end]) {
        Some(args) => args,
        None => {
            return ParseResult::Error(
                "Protocol error: unbalanced quotes in request".to_string(),
            );
        }
    };

    querybuf.drain(..=newline);
    for arg in args {
        argv.push(Obj::new_string_raw(arg));
    }
    ParseResult::Ready
}

fn parse_multibulk(
    state: &mut RequestState,
    querybuf: &mut Vec<u8>,
    argv: &mut Vec<Obj>,
    limits: &LimitsConfig,
) -> ParseResult {
    let mut pos = 0usize;

    if state.multibulklen == 0 {
        let newline = match find_cr(querybuf, 0) {
            Some(idx) => idx,
            None => {
                if querybuf.len() > limits.inline_max_size {
                    return ParseResult::Error(
                        "Protocol error: too big mbulk count string".to_string(),
                    );
                }
                return ParseResult::Incomplete;
            }
        };
        if newline + 1 >= querybuf.len() {
            return ParseResult::Incomplete;
        }

        let count = match string_to_i64(&querybuf[1..newline]) {
            Some(v) if v <= limits.multibulk_max as i64 => v,
            _ => {
                return ParseResult::Error("Protocol error: invalid multibulk length".to_string());
            }
        };
        pos = newline + 2;

        if count <= 0 {
            querybuf.drain(..pos);
            return ParseResult::Ready;
        }
        state.multibulklen = count;
    }

    while state.multibulklen > 0 {
        if state.bulklen == -1 {
            let newline = match find_cr(querybuf, pos) {
                Some(idx) => idx,
                None => {
                    if querybuf.len() - pos > limits.inline_max_size {
                        querybuf.drain(..pos);
                        return ParseResult::Error(
                            "Protocol error: too big bulk count string".to_string(),
                        );
                    }
                    break;
                }
            };
            if newline + 1 >= querybuf.len() {
                break;
            }

            if querybuf[pos] != b'$' {
                let err = format!(
                    "Protocol error: expected '$', got '{}'",
                    char::from(querybuf[pos])
                );
                querybuf.drain(..pos);
                return ParseResult::Error(err);
            }

            let len = match string_to_i64(&querybuf[pos + 1..newline]) {
                Some(v) if v >= 0 && v <= limits.proto_max_bulk_len as i64 => v,
                _ => {
                    querybuf.drain(..pos);
                    return ParseResult::Error("Protocol error: invalid bulk length".to_string());
                }
            };
            pos = newline + 2;

            if len >= BIG_ARG as i64 {
                // Drop the consumed prefix right away so a big payload can
                // start at offset zero and be donated below.
                querybuf.drain(..pos);
                pos = 0;
                if querybuf.capacity() < len as usize + 2 {
                    querybuf.reserve(len as usize + 2 - querybuf.len());
                }
            }
            state.bulklen = len;
        }

        let bulklen = state.bulklen as usize;
        if querybuf.len() - pos < bulklen + 2 {
            break;
        }

        if pos == 0 && bulklen >= BIG_ARG && querybuf.len() == bulklen + 2 {
            // The buffer holds exactly this argument: donate it instead of
            // copying.
            let mut payload = mem::replace(querybuf, Vec::new());
            payload.truncate(bulklen);
            argv.push(Obj::new_string_raw(payload));
        } else {
            argv.push(Obj::new_string_raw(querybuf[pos..pos + bulklen].to_vec()));
            pos += bulklen + 2;
        }
        state.bulklen = -1;
        state.multibulklen -= 1;
    }

    querybuf.drain(..pos);

    if state.multibulklen == 0 {
        ParseResult::Ready
    } else {
        ParseResult::Incomplete
    }
}

#[inline]
fn find_cr(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == b'\r').map(|i| i + from)
}

#[inline]
fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Splits an inline request line into arguments: whitespace separated, with
/// double quotes (supporting `\xHH` and the usual escapes) and single quotes
/// (supporting `\'`). Returns None on unbalanced quotes.
pub fn split_args(line: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut args = Vec::new();
    let mut i = 0;

    loop {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == line.len() {
            return Some(args);
        }

        let mut current = Vec::new();
        let mut in_quotes = false;
        let mut in_single_quotes = false;

        loop {
            if in_quotes {
                if i == line.len() {
                    return None;
                }
                if line[i] == b'\\' && i + 3 < line.len() && line[i + 1] == b'x' {
                    if let (Some(hi), Some(lo)) = (hex_digit(line[i + 2]), hex_digit(line[i + 3])) {
                        current.push(hi * 16 + lo);
                        i += 4;
                        continue;
                    }
                }
                if line[i] == b'\\' && i + 1 < line.len() {
                    let c = match line[i + 1] {
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'b' => 0x08,
                        b'a' => 0x07,
                        other => other,
                    };
                    current.push(c);
                    i += 2;
                } else if line[i] == b'"' {
                    // Closing quote must be followed by a separator.
                    if i + 1 < line.len() && !line[i + 1].is_ascii_whitespace() {
                        return None;
                    }
                    i += 1;
                    break;
                } else {
                    current.push(line[i]);
                    i += 1;
                }
            } else if in_single_quotes {
                if i == line.len() {
                    return None;
                }
                if line[i] == b'\\' && i + 1 < line.len() && line[i + 1] == b'\'' {
                    current.push(b'\'');
                    i += 2;
                } else if line[i] == b'\'' {
                    if i + 1 < line.len() && !line[i + 1].is_ascii_whitespace() {
                        return None;
                    }
                    i += 1;
                    break;
                } else {
                    current.push(line[i]);
                    i += 1;
                }
            } else {
                if i == line.len() {
                    break;
                }
                match line[i] {
                    b' ' | b'\n' | b'\r' | b'\t' | 0x0b | 0x0c => break,
                    b'"' => {
                        in_quotes = true;
                        i += 1;
                    }
                    b'\'' => {
                        in_single_quotes = true;
                        i += 1;
                    }
                    other => {
                        current.push(other);
                        i += 1;
                    }
                }
            }
        }
        args.push(current);
    }
}

enum ReplyNode {
    Data(Vec<u8>),
    Placeholder,
}

/// Handle to a deferred multi-bulk length, filled once the element count is
/// known.
#[derive(Debug, Copy, Clone)]
pub struct DeferredLen(u64);

/// Per-client reply staging: a fixed chunk that absorbs small replies, then
/// a queue of byte chunks. Consecutive small chunks are coalesced so the
/// queue stays short.
pub struct ReplyBuffer {
    buf: [u8; REPLY_CHUNK_BYTES],
    bufpos: usize,
    sentlen: usize,
    queue: VecDeque<ReplyNode>,
    queue_bytes: usize,
    popped: u64,
}

impl ReplyBuffer {
    pub fn new() -> ReplyBuffer {
        ReplyBuffer {
            buf: [0; REPLY_CHUNK_BYTES],
            bufpos: 0,
            sentlen: 0,
            queue: VecDeque::new(),
            queue_bytes: 0,
            popped: 0,
        }
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.bufpos > 0 || !self.queue.is_empty()
    }

    /// Bytes sitting in the overflow queue; the fixed buffer is not counted,
    /// matching how output limits are assessed.
    #[inline]
    pub fn queue_bytes(&self) -> usize {
        self.queue_bytes
    }

    /// Unsent bytes still in the fixed buffer.
    #[inline]
    pub fn fixed_pending(&self) -> usize {
        self.bufpos.saturating_sub(if self.queue.is_empty() { self.sentlen } else { 0 })
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.queue.len()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.queue.is_empty() && self.bufpos + bytes.len() <= REPLY_CHUNK_BYTES {
            self.buf[self.bufpos..self.bufpos + bytes.len()].copy_from_slice(bytes);
            self.bufpos += bytes.len();
            return;
        }

        self.queue_bytes += bytes.len();
        if let Some(ReplyNode::Data(tail)) = self.queue.back_mut() {
            if tail.len() + bytes.len() <= REPLY_CHUNK_BYTES {
                tail.extend_from_slice(bytes);
                return;
            }
        }
        self.queue.push_back(ReplyNode::Data(bytes.to_vec()));
    }

    /// Takes ownership of an already-encoded chunk, avoiding a copy when it
    /// is too large to coalesce.
    pub fn append_owned(&mut self, bytes: Vec<u8>) {
        if bytes.len() <= REPLY_CHUNK_BYTES {
            self.append(&bytes);
            return;
        }
        self.queue_bytes += bytes.len();
        self.queue.push_back(ReplyNode::Data(bytes));
    }

    pub fn add_status(&mut self, text: &str) {
        let mut out = Vec::with_capacity(text.len() + 3);
        out.push(b'+');
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.append(&out);
    }

    /// Generic error reply. CR and LF in the text are replaced by spaces so
    /// the reply stays a single line.
    pub fn add_error(&mut self, text: &str) {
        self.add_error_full(&format!("ERR {}", text));
    }

    /// Error reply with the leading code already present ("WRONGTYPE ...").
    pub fn add_error_full(&mut self, text: &str) {
        let mut out = Vec::with_capacity(text.len() + 3);
        out.push(b'-');
        for &b in text.as_bytes() {
            out.push(if b == b'\r' || b == b'\n' { b' ' } else { b });
        }
        out.extend_from_slice(b"\r\n");
        self.append(&out);
    }

    pub fn add_integer(&mut self, value: i64) {
        let digits = IntBuf::format(value);
        let mut out = Vec::with_capacity(digits.as_bytes().len() + 3);
        out.push(b':');
        out.extend_from_slice(digits.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.append(&out);
    }

    pub fn add_bulk(&mut self, payload: &[u8]) {
        let len = IntBuf::format(payload.len() as i64);
        let mut out = Vec::with_capacity(payload.len() + len.as_bytes().len() + 5);
        out.push(b'$');
        out.extend_from_slice(len.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\n");
        self.append_owned(out);
    }

    pub fn add_nil(&mut self) {
        self.add_shared(Shared::NilBulk);
    }

    pub fn add_shared(&mut self, reply: Shared) {
        self.append(reply.bytes());
    }

    pub fn add_multibulk_len(&mut self, count: usize) {
        let len = IntBuf::format(count as i64);
        let mut out = Vec::with_capacity(len.as_bytes().len() + 3);
        out.push(b'*');
        out.extend_from_slice(len.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.append(&out);
    }

    /// Doubles encode as bulk strings, with infinities spelled out.
    pub fn add_double(&mut self, value: f64) {
        let text = crate::util::fmt_f64(value);
        self.add_bulk(text.as_bytes());
    }

    /// Reserves a multi-bulk header whose length is not known yet. Replies
    /// appended afterwards land behind the placeholder.
    pub fn defer_multibulk_len(&mut self) -> DeferredLen {
        let handle = DeferredLen(self.popped + self.queue.len() as u64);
        self.queue.push_back(ReplyNode::Placeholder);
        handle
    }

    /// Fills a deferred header. When the following node is a plain chunk the
    /// two are coalesced.
    pub fn set_deferred_multibulk_len(&mut self, handle: DeferredLen, count: usize) {
        let idx = (handle.0 - self.popped) as usize;
        let len = IntBuf::format(count as i64);
        let mut header = Vec::with_capacity(len.as_bytes().len() + 3);
        header.push(b'*');
        header.extend_from_slice(len.as_bytes());
        header.extend_from_slice(b"\r\n");

        self.queue_bytes += header.len();
        let merge_next = matches!(self.queue.get(idx + 1), Some(ReplyNode::Data(_)));
        if merge_next {
            if let Some(ReplyNode::Data(mut next)) = self.queue.remove(idx + 1) {
                header.append(&mut next);
            }
        }
        self.queue[idx] = ReplyNode::Data(header);
    }

    /// Drains staged bytes into `dest`: fixed buffer first, then the queue.
    /// Stops after `limit` bytes unless `ignore_limit`, on WouldBlock, or
    /// when everything is flushed. Fatal I/O errors propagate.
    pub fn flush_to<W: io::Write>(
        &mut self,
        dest: &mut W,
        limit: usize,
        ignore_limit: bool,
    ) -> io::Result<usize> {
        let mut total = 0usize;

        loop {
            if self.bufpos > 0 {
                match dest.write(&self.buf[self.sentlen..self.bufpos]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        self.sentlen += n;
                        total += n;
                        if self.sentlen == self.bufpos {
                            self.bufpos = 0;
                            self.sentlen = 0;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            } else {
                let node_len = match self.queue.front() {
                    None | Some(ReplyNode::Placeholder) => break,
                    Some(ReplyNode::Data(data)) => data.len(),
                };
                if node_len == 0 {
                    self.queue.pop_front();
                    self.popped += 1;
                    continue;
                }

                let result = match self.queue.front() {
                    Some(ReplyNode::Data(data)) => dest.write(&data[self.sentlen..]),
                    _ => unreachable!(),
                };
                match result {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        self.sentlen += n;
                        total += n;
                        if self.sentlen == node_len {
                            self.queue_bytes -= node_len;
                            self.queue.pop_front();
                            self.popped += 1;
                            self.sentlen = 0;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }

            if total > limit && !ignore_limit {
                break;
            }
        }
        Ok(total)
    }
}

impl Default for ReplyBuffer {
    fn default() -> ReplyBuffer {
        ReplyBuffer::new()
    }
}
