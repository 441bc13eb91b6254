//! Message payload plumbing.
//!
//! [`OutputDataStream`] is what the application hands to a channel: an
//! optional MIME header block followed by byte segments, possibly still being
//! produced. [`InputDataStream`] is what the application receives: an
//! append-only queue of segments filled by the channel as frames arrive.
//! Reading from an input stream releases receive-window credit back to the
//! channel it belongs to.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::SessionError;

/// Content-Type assumed when none is given
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content-Transfer-Encoding assumed when none is given
pub const DEFAULT_TRANSFER_ENCODING: &str = "binary";

/// Content-Type of channel-zero control messages
pub const BEEP_XML_CONTENT_TYPE: &str = "application/beep+xml";

const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";

/// MIME entity headers of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeHeaders {
    headers: Vec<(String, String)>,
}

impl MimeHeaders {
    /// Headers with the default content type and transfer encoding
    #[must_use]
    pub fn new() -> Self {
        Self {
            headers: vec![
                (CONTENT_TYPE.to_string(), DEFAULT_CONTENT_TYPE.to_string()),
                (
                    CONTENT_TRANSFER_ENCODING.to_string(),
                    DEFAULT_TRANSFER_ENCODING.to_string(),
                ),
            ],
        }
    }

    /// Headers with the given content type
    #[must_use]
    pub fn with_content_type(content_type: &str) -> Self {
        let mut headers = Self::new();
        headers.set(CONTENT_TYPE, content_type);
        headers
    }

    /// Set (or replace) a header, matching names case-insensitively
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Look up a header value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Content type
    #[must_use]
    pub fn content_type(&self) -> &str {
        self.get(CONTENT_TYPE).unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Content transfer encoding
    #[must_use]
    pub fn transfer_encoding(&self) -> &str {
        self.get(CONTENT_TRANSFER_ENCODING)
            .unwrap_or(DEFAULT_TRANSFER_ENCODING)
    }

    /// Encode the header block; headers equal to their defaults are omitted
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        for (name, value) in &self.headers {
            let is_default = (name.eq_ignore_ascii_case(CONTENT_TYPE)
                && value.eq_ignore_ascii_case(DEFAULT_CONTENT_TYPE))
                || (name.eq_ignore_ascii_case(CONTENT_TRANSFER_ENCODING)
                    && value.eq_ignore_ascii_case(DEFAULT_TRANSFER_ENCODING));
            if !is_default {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(value);
                out.push_str("\r\n");
            }
        }
        out.push_str("\r\n");
        Bytes::from(out)
    }

    /// Parse a header block at the start of `data`
    ///
    /// Returns the headers and the offset of the entity body, or `None` if
    /// `data` does not begin with a complete header block.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        let mut headers = Self::new();
        let mut pos = 0;
        loop {
            let rest = &data[pos..];
            let eol = rest.windows(2).position(|w| w == b"\r\n")?;
            if eol == 0 {
                return Some((headers, pos + 2));
            }
            let line = std::str::from_utf8(&rest[..eol]).ok()?;
            let (name, value) = line.split_once(':')?;
            if name.is_empty() || name.contains(' ') {
                return None;
            }
            headers.set(name.trim(), value.trim());
            pos += eol + 2;
        }
    }
}

impl Default for MimeHeaders {
    fn default() -> Self {
        Self::new()
    }
}

type Waker = Arc<dyn Fn() + Send + Sync>;

struct OutputInner {
    header: Option<Bytes>,
    segments: VecDeque<Bytes>,
    complete: bool,
    waker: Option<Waker>,
}

/// Outbound payload: optional MIME header block plus ordered byte segments
///
/// Clones share the same underlying stream, so an application can keep a
/// handle and keep appending after the message was queued on a channel.
#[derive(Clone)]
pub struct OutputDataStream {
    inner: Arc<Mutex<OutputInner>>,
}

impl OutputDataStream {
    /// Empty, still-open stream without a MIME header block
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(OutputInner {
                header: None,
                segments: VecDeque::new(),
                complete: false,
                waker: None,
            })),
        }
    }

    /// Empty, still-open stream that starts with the given MIME headers
    #[must_use]
    pub fn with_mime(headers: &MimeHeaders) -> Self {
        let stream = Self::new();
        stream.inner.lock().header = Some(headers.encode());
        stream
    }

    /// Complete stream holding exactly `data`
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let stream = Self::new();
        stream.add(data);
        stream.set_complete();
        stream
    }

    /// Complete stream with MIME headers and a body
    #[must_use]
    pub fn from_entity(headers: &MimeHeaders, body: impl Into<Bytes>) -> Self {
        let stream = Self::with_mime(headers);
        stream.add(body);
        stream.set_complete();
        stream
    }

    /// Append a segment
    pub fn add(&self, segment: impl Into<Bytes>) {
        let segment = segment.into();
        let waker = {
            let mut inner = self.inner.lock();
            if !segment.is_empty() {
                inner.segments.push_back(segment);
            }
            inner.waker.clone()
        };
        if let Some(wake) = waker {
            wake();
        }
    }

    /// Mark that no more segments will be added
    pub fn set_complete(&self) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.complete = true;
            inner.waker.clone()
        };
        if let Some(wake) = waker {
            wake();
        }
    }

    /// True once [`set_complete`](Self::set_complete) was called
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    /// Bytes buffered and not yet sent (header block included)
    #[must_use]
    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        inner.header.as_ref().map_or(0, Bytes::len)
            + inner.segments.iter().map(Bytes::len).sum::<usize>()
    }

    pub(crate) fn set_waker(&self, waker: Waker) {
        self.inner.lock().waker = Some(waker);
    }

    pub(crate) fn clear_waker(&self) {
        self.inner.lock().waker = None;
    }

    /// Pull up to `max` bytes, header block first
    ///
    /// Returns the chunks, their total size and whether the stream is now
    /// complete and fully drained.
    pub(crate) fn take(&self, max: usize) -> (Vec<Bytes>, usize, bool) {
        let mut inner = self.inner.lock();
        let mut chunks = Vec::new();
        let mut taken = 0;

        if let Some(header) = inner.header.take() {
            inner.segments.push_front(header);
        }
        while taken < max {
            let Some(mut segment) = inner.segments.pop_front() else {
                break;
            };
            let room = max - taken;
            if segment.len() > room {
                let rest = segment.split_off(room);
                inner.segments.push_front(rest);
            }
            taken += segment.len();
            chunks.push(segment);
        }

        let finished = inner.complete && inner.segments.is_empty();
        (chunks, taken, finished)
    }

    /// Everything buffered so far, and whether that was all of it
    pub(crate) fn drain(&self) -> (Bytes, bool) {
        let (chunks, _, finished) = self.take(usize::MAX);
        (concat(chunks), finished)
    }
}

fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

impl Default for OutputDataStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OutputDataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("OutputDataStream")
            .field("segments", &inner.segments.len())
            .field("complete", &inner.complete)
            .finish()
    }
}

impl From<&'static str> for OutputDataStream {
    fn from(s: &'static str) -> Self {
        Self::from_bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Bytes> for OutputDataStream {
    fn from(b: Bytes) -> Self {
        Self::from_bytes(b)
    }
}

impl From<Vec<u8>> for OutputDataStream {
    fn from(v: Vec<u8>) -> Self {
        Self::from_bytes(v)
    }
}

impl From<String> for OutputDataStream {
    fn from(s: String) -> Self {
        Self::from_bytes(s.into_bytes())
    }
}

/// Called with the number of bytes the application consumed
pub(crate) type ConsumeHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct InputState {
    segments: VecDeque<Bytes>,
    available: usize,
    received: usize,
    complete: bool,
    aborted: Option<String>,
}

struct InputInner {
    state: Mutex<InputState>,
    notify: Notify,
    on_consumed: Option<ConsumeHook>,
}

impl Drop for InputInner {
    // Unread bytes still count against the receive window until released
    fn drop(&mut self) {
        let available = self.state.get_mut().available;
        if available > 0 {
            if let Some(hook) = &self.on_consumed {
                hook(available);
            }
        }
    }
}

/// Inbound payload, filled by the channel and drained by the application
#[derive(Clone)]
pub struct InputDataStream {
    inner: Arc<InputInner>,
}

impl InputDataStream {
    pub(crate) fn new(on_consumed: Option<ConsumeHook>) -> Self {
        Self {
            inner: Arc::new(InputInner {
                state: Mutex::new(InputState::default()),
                notify: Notify::new(),
                on_consumed,
            }),
        }
    }

    /// Complete stream holding exactly `data`, detached from any channel
    #[must_use]
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let stream = Self::new(None);
        stream.push(data.into());
        stream.set_complete();
        stream
    }

    pub(crate) fn push(&self, segment: Bytes) {
        {
            let mut state = self.inner.state.lock();
            if segment.is_empty() || state.aborted.is_some() {
                return;
            }
            state.available += segment.len();
            state.received += segment.len();
            state.segments.push_back(segment);
        }
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn set_complete(&self) {
        self.inner.state.lock().complete = true;
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn abort(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.complete {
                return;
            }
            state.aborted = Some(reason.to_string());
        }
        self.inner.notify.notify_waiters();
    }

    /// Bytes buffered and not yet read
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Total bytes received so far
    #[must_use]
    pub fn received(&self) -> usize {
        self.inner.state.lock().received
    }

    /// True once the final frame of the message has arrived
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().complete
    }

    /// True once the stream is complete and every segment has been read
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let state = self.inner.state.lock();
        state.complete && state.segments.is_empty()
    }

    /// Take the next buffered segment without waiting
    #[must_use]
    pub fn try_next_segment(&self) -> Option<Bytes> {
        let segment = {
            let mut state = self.inner.state.lock();
            let segment = state.segments.pop_front()?;
            state.available -= segment.len();
            segment
        };
        if let Some(hook) = &self.inner.on_consumed {
            hook(segment.len());
        }
        Some(segment)
    }

    /// Read whatever is buffered without waiting
    pub(crate) fn drain_available(&self) -> Bytes {
        let mut chunks = Vec::new();
        while let Some(segment) = self.try_next_segment() {
            chunks.push(segment);
        }
        concat(chunks)
    }

    /// Wait for the next segment; `Ok(None)` once the stream is exhausted
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminated`] if the session went away before
    /// the message was complete.
    pub async fn next_segment(&self) -> Result<Option<Bytes>, SessionError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(segment) = self.try_next_segment() {
                return Ok(Some(segment));
            }
            {
                let state = self.inner.state.lock();
                if state.complete {
                    return Ok(None);
                }
                if let Some(reason) = &state.aborted {
                    return Err(SessionError::Terminated(reason.clone().into()));
                }
            }
            notified.await;
        }
    }

    /// Read every remaining segment into one buffer
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Terminated`] if the session went away before
    /// the message was complete.
    pub async fn read_to_end(&self) -> Result<Bytes, SessionError> {
        let mut first: Option<Bytes> = None;
        let mut buf = BytesMut::new();
        while let Some(segment) = self.next_segment().await? {
            match first.take() {
                None if buf.is_empty() => first = Some(segment),
                Some(prev) => {
                    buf.extend_from_slice(&prev);
                    buf.extend_from_slice(&segment);
                }
                None => buf.extend_from_slice(&segment),
            }
        }
        Ok(first.unwrap_or_else(|| buf.freeze()))
    }
}

impl fmt::Debug for InputDataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("InputDataStream")
            .field("available", &state.available)
            .field("complete", &state.complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_headers_are_omitted() {
        assert_eq!(&MimeHeaders::new().encode()[..], b"\r\n");
        let xml = MimeHeaders::with_content_type(BEEP_XML_CONTENT_TYPE);
        assert_eq!(
            &xml.encode()[..],
            b"Content-Type: application/beep+xml\r\n\r\n"
        );
    }

    #[test]
    fn test_header_parse() {
        let data = b"Content-Type: text/plain\r\nX-Custom: 1\r\n\r\nbody";
        let (headers, offset) = MimeHeaders::parse(data).unwrap();
        assert_eq!(headers.content_type(), "text/plain");
        assert_eq!(headers.transfer_encoding(), DEFAULT_TRANSFER_ENCODING);
        assert_eq!(headers.get("x-custom"), Some("1"));
        assert_eq!(&data[offset..], b"body");

        assert!(MimeHeaders::parse(b"<greeting/>").is_none());
        let (_, offset) = MimeHeaders::parse(b"\r\n<ok/>").unwrap();
        assert_eq!(offset, 2);
    }

    #[test]
    fn test_output_take_splits_segments() {
        let stream = OutputDataStream::from_bytes(Bytes::from_static(b"0123456789"));
        let (chunks, n, done) = stream.take(4);
        assert_eq!(n, 4);
        assert_eq!(chunks, vec![Bytes::from_static(b"0123")]);
        assert!(!done);
        let (_, n, done) = stream.take(100);
        assert_eq!(n, 6);
        assert!(done);
    }

    #[test]
    fn test_output_header_prepended_once() {
        let headers = MimeHeaders::with_content_type("text/plain");
        let stream = OutputDataStream::from_entity(&headers, "hi");
        let (chunks, _, done) = stream.take(1024);
        assert!(done);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, b"Content-Type: text/plain\r\n\r\nhi");
        let (chunks, n, _) = stream.take(1024);
        assert!(chunks.is_empty());
        assert_eq!(n, 0);
    }

    #[test]
    fn test_output_waker_fires_on_add() {
        let count = Arc::new(AtomicUsize::new(0));
        let stream = OutputDataStream::new();
        let c = count.clone();
        stream.set_waker(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        stream.add("a");
        stream.set_complete();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_input_reports_consumption() {
        let consumed = Arc::new(AtomicUsize::new(0));
        let c = consumed.clone();
        let stream = InputDataStream::new(Some(Arc::new(move |n| {
            c.fetch_add(n, Ordering::SeqCst);
        })));
        stream.push(Bytes::from_static(b"abc"));
        stream.push(Bytes::from_static(b"de"));
        assert_eq!(stream.available(), 5);
        assert!(!stream.is_complete());

        assert_eq!(stream.try_next_segment(), Some(Bytes::from_static(b"abc")));
        assert_eq!(consumed.load(Ordering::SeqCst), 3);

        stream.set_complete();
        assert_eq!(stream.read_to_end().await.unwrap(), Bytes::from_static(b"de"));
        assert_eq!(consumed.load(Ordering::SeqCst), 5);
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn test_input_reader_waits_for_segments() {
        let stream = InputDataStream::new(None);
        let writer = stream.clone();
        let reader = tokio::spawn(async move { stream.read_to_end().await });
        tokio::task::yield_now().await;
        writer.push(Bytes::from_static(b"hello "));
        writer.push(Bytes::from_static(b"world"));
        writer.set_complete();
        assert_eq!(
            reader.await.unwrap().unwrap(),
            Bytes::from_static(b"hello world")
        );
    }

    #[tokio::test]
    async fn test_input_abort_wakes_reader() {
        let stream = InputDataStream::new(None);
        let writer = stream.clone();
        let reader = tokio::spawn(async move { stream.next_segment().await });
        tokio::task::yield_now().await;
        writer.abort("gone");
        assert!(matches!(
            reader.await.unwrap(),
            Err(SessionError::Terminated(_))
        ));
    }
}
