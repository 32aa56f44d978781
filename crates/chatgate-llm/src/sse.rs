//! Server-sent event decoding for upstream streaming responses
//!
//! Bytes are buffered until a blank line closes an event, so frames split
//! across network chunks (including split UTF-8 sequences) decode correctly.

use async_stream::try_stream;
use bytes::Bytes;
use futures::stream::unfold;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use chatgate_core::{Error, Result};

use crate::http::map_reqwest_error;
use crate::provider::ModelEvent;

/// One decoded SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if present
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

impl SseEvent {
    /// OpenAI-style end-of-stream sentinel
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Decode a byte stream into SSE frames.
pub fn sse_events<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let initial_state = (Box::pin(bytes_stream), Vec::<u8>::new(), false);

    unfold(initial_state, |(mut stream, mut buffer, finished)| async move {
        if finished {
            return None;
        }
        loop {
            if let Some(event) = take_event(&mut buffer) {
                match event {
                    Ok(Some(event)) => return Some((Ok(event), (stream, buffer, false))),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), (stream, buffer, true))),
                }
            }

            match stream.next().await {
                Some(Ok(bytes)) => {
                    buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(e)) => {
                    return Some((Err(map_reqwest_error(e)), (stream, buffer, true)));
                }
                None => {
                    // A final frame may lack its trailing blank line
                    if !buffer.iter().all(u8::is_ascii_whitespace) {
                        buffer.extend_from_slice(b"\n\n");
                        if let Some(Ok(Some(event))) = take_event(&mut buffer) {
                            return Some((Ok(event), (stream, buffer, true)));
                        }
                        warn!("Stream ended with unparsed data in buffer");
                    }
                    return None;
                }
            }
        }
    })
}

/// Provider-specific translation of SSE frames into model events
pub trait FrameDecoder: Send + 'static {
    /// Decode one frame; may produce zero or more events
    fn decode(&mut self, frame: &SseEvent) -> Result<Vec<ModelEvent>>;

    /// True once the terminal event has been produced
    fn is_finished(&self) -> bool;
}

/// Run `decoder` over a frame stream, stopping after the terminal event.
pub fn decode_frames<S, D>(frames: S, mut decoder: D) -> impl Stream<Item = Result<ModelEvent>> + Send
where
    S: Stream<Item = Result<SseEvent>> + Send + 'static,
    D: FrameDecoder,
{
    try_stream! {
        let mut frames = Box::pin(frames);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            for event in decoder.decode(&frame)? {
                yield event;
            }
            if decoder.is_finished() {
                break;
            }
        }
    }
}

/// Pop the next complete frame off the buffer.
///
/// `None` means more bytes are needed; `Some(Ok(None))` is a frame with no
/// data (comment or keep-alive).
fn take_event(buffer: &mut Vec<u8>) -> Option<Result<Option<SseEvent>>> {
    let end = buffer.windows(2).position(|w| w == b"\n\n")?;
    let frame: Vec<u8> = buffer.drain(..end + 2).collect();

    let text = match std::str::from_utf8(&frame[..end]) {
        Ok(text) => text,
        Err(e) => return Some(Err(Error::malformed(format!("invalid UTF-8 in event stream: {}", e)))),
    };

    Some(Ok(parse_frame(text)))
}

fn parse_frame(text: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            other => debug!("Ignoring SSE field '{}'", other),
        }
    }

    if data.is_empty() && event.is_none() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static {
        let items: Vec<std::result::Result<Bytes, reqwest::Error>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items)
    }

    async fn collect(parts: &[&'static [u8]]) -> Vec<SseEvent> {
        sse_events(chunks(parts))
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_named_events() {
        let events = collect(&[b"event: ping\ndata: {}\n\nevent: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert_eq!(events[1].data, "{\"type\":\"message_stop\"}");
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        let events = collect(&[b"data: {\"a\":", b"1}\r\n", b"\r\ndata: [DONE]\n\n"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done_marker());
    }

    #[tokio::test]
    async fn test_split_utf8_sequence() {
        // "é" is 0xC3 0xA9
        let events = collect(&[b"data: caf\xC3", b"\xA9\n\n"]).await;
        assert_eq!(events[0].data, "café");
    }

    #[tokio::test]
    async fn test_comments_skipped_and_trailing_frame_flushed() {
        let events = collect(&[b": keep-alive\n\ndata: last"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "last");
    }
}
