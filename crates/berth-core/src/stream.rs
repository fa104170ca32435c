//! Message stream decoding.
//!
//! The daemon reports pulls, builds, and pushes as newline-delimited JSON
//! records. Each record decodes into exactly one [`ContainerEvent`]; the end
//! of every source yields one [`ContainerEvent::EndOfSubStream`].
//!
//! An [`EventSession`] fans any number of sources into one channel. It is
//! drained once it has seen as many end markers as it has sources, which
//! lets a push of K tags be consumed as a single operation.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use berth_common::error::{BerthError, Result};
use berth_common::types::{ImageId, TagDigest};

use crate::api::ByteStream;

const CHANNEL_CAPACITY: usize = 64;

/// Structured payload a daemon record can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metadata {
    /// Identifier of a freshly built image.
    ImageId(ImageId),
    /// Digest reported for a pushed tag.
    TagDigest(TagDigest),
}

/// One decoded daemon message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// Human-readable progress text.
    Progress {
        /// Progress text, newline-terminated when non-empty.
        message: String,
    },
    /// Build or push result data.
    Metadata(Metadata),
    /// An error reported by the daemon, or a record that failed to decode.
    Error {
        /// Error text.
        message: String,
    },
    /// The source producing this sub-stream has ended.
    EndOfSubStream,
}

/// An event tagged with the sub-stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Label of the originating source (the full tag for pushes).
    pub source: String,
    /// Decoded event.
    pub event: ContainerEvent,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<RawErrorDetail>,
    #[serde(default)]
    aux: Option<RawAux>,
}

#[derive(Debug, Default, Deserialize)]
struct RawErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAux {
    #[serde(default, rename = "ID")]
    id: Option<String>,
    #[serde(default, rename = "Tag")]
    tag: Option<String>,
    #[serde(default, rename = "Digest")]
    digest: Option<String>,
    #[serde(default, rename = "Size")]
    size: Option<u64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn push_status_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<tag>[^\s:]+): digest: (?P<digest>\S+:[0-9a-fA-F]+) size: (?P<size>\d+)$").ok()
    })
    .as_ref()
}

/// Decodes one daemon record.
///
/// Returns `None` for blank lines only; every other line maps to exactly
/// one event. Malformed JSON becomes [`ContainerEvent::Error`].
pub fn decode_line(line: &str) -> Option<ContainerEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawMessage = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            return Some(ContainerEvent::Error {
                message: format!("malformed daemon message: {e}"),
            });
        }
    };

    if let Some(message) = non_empty(raw.error)
        .or_else(|| raw.error_detail.and_then(|d| non_empty(d.message)))
    {
        return Some(ContainerEvent::Error { message });
    }

    if let Some(aux) = raw.aux {
        if let Some(id) = non_empty(aux.id) {
            return Some(ContainerEvent::Metadata(Metadata::ImageId(ImageId::new(id))));
        }
        if let (Some(tag), Some(digest)) = (non_empty(aux.tag), non_empty(aux.digest)) {
            return Some(ContainerEvent::Metadata(Metadata::TagDigest(TagDigest {
                tag,
                digest,
                size: aux.size.unwrap_or(0),
            })));
        }
    }

    let status = non_empty(raw.status);
    if let Some(caps) = status
        .as_deref()
        .and_then(|s| push_status_regex().and_then(|re| re.captures(s)))
    {
        return Some(ContainerEvent::Metadata(Metadata::TagDigest(TagDigest {
            tag: caps["tag"].to_string(),
            digest: caps["digest"].to_string(),
            size: caps["size"].parse().unwrap_or(0),
        })));
    }

    Some(ContainerEvent::Progress {
        message: summarize(non_empty(raw.stream), non_empty(raw.id), status, non_empty(raw.progress)),
    })
}

fn summarize(
    stream: Option<String>,
    id: Option<String>,
    status: Option<String>,
    progress: Option<String>,
) -> String {
    if let Some(stream) = stream {
        return stream;
    }
    let mut parts = Vec::new();
    if let Some(id) = id {
        parts.push(format!("{id}:"));
    }
    parts.extend(status);
    parts.extend(progress);
    if parts.is_empty() {
        String::new()
    } else {
        let mut text = parts.join(" ");
        text.push('\n');
        text
    }
}

/// Splits a chunked byte stream into lines and decodes each one.
async fn pump(source: String, mut input: ByteStream, tx: mpsc::Sender<SessionEvent>) {
    let mut buf = BytesMut::new();
    let send = |event: ContainerEvent| {
        let tx = tx.clone();
        let source = source.clone();
        async move { tx.send(SessionEvent { source, event }).await.is_ok() }
    };

    while let Some(chunk) = input.next().await {
        match chunk {
            Ok(bytes) => {
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.split_to(pos + 1);
                    if let Some(event) = decode_line(&String::from_utf8_lossy(&line)) {
                        if !send(event).await {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "daemon stream read failed");
                if !send(ContainerEvent::Error { message: e.to_string() }).await {
                    return;
                }
                break;
            }
        }
    }

    if let Some(event) = decode_line(&String::from_utf8_lossy(&buf)) {
        if !send(event).await {
            return;
        }
    }
    let _ = send(ContainerEvent::EndOfSubStream).await;
}

/// A drained session's accumulated results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Image identifier reported by a build.
    pub image_id: Option<ImageId>,
    /// Digest per pushed tag, keyed by the full tag string.
    pub tag_digests: HashMap<String, TagDigest>,
    /// Every error seen, prefixed with its source.
    pub errors: Vec<String>,
    /// Whether every expected end marker arrived.
    pub complete: bool,
}

impl SessionReport {
    /// Turns collected stream errors into a [`BerthError::Stream`].
    ///
    /// # Errors
    ///
    /// Returns an error if any sub-stream reported an error or the session
    /// closed before all sub-streams completed.
    pub fn into_result(self) -> Result<Self> {
        if !self.errors.is_empty() {
            return Err(BerthError::Stream {
                message: self.errors.join("; "),
            });
        }
        if !self.complete {
            return Err(BerthError::Stream {
                message: "session closed before all sub-streams completed".into(),
            });
        }
        Ok(self)
    }
}

/// Owned consumer side of one or more decoding sub-streams.
///
/// Dropping the session aborts its producers.
#[derive(Debug)]
pub struct EventSession {
    rx: mpsc::Receiver<SessionEvent>,
    producers: Vec<JoinHandle<()>>,
    expected_ends: usize,
    ends_seen: usize,
    image_id: Option<ImageId>,
    tag_digests: HashMap<String, TagDigest>,
    errors: Vec<String>,
}

impl EventSession {
    /// Spawns one decoding task per `(label, stream)` source.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(sources: Vec<(String, ByteStream)>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let expected_ends = sources.len();
        let producers = sources
            .into_iter()
            .map(|(label, stream)| tokio::spawn(pump(label, stream, tx.clone())))
            .collect();
        Self {
            rx,
            producers,
            expected_ends,
            ends_seen: 0,
            image_id: None,
            tag_digests: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Number of end markers that complete this session.
    pub const fn expected_ends(&self) -> usize {
        self.expected_ends
    }

    /// Whether every expected end marker has arrived.
    pub const fn is_drained(&self) -> bool {
        self.ends_seen >= self.expected_ends
    }

    /// Image identifier seen so far.
    pub const fn image_id(&self) -> Option<&ImageId> {
        self.image_id.as_ref()
    }

    /// Tag digests seen so far, keyed by full tag.
    pub const fn tag_digests(&self) -> &HashMap<String, TagDigest> {
        &self.tag_digests
    }

    /// Returns the next event, or `None` once drained or closed.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if self.is_drained() {
            return None;
        }
        let item = self.rx.recv().await?;
        self.record(&item);
        Some(item)
    }

    fn record(&mut self, item: &SessionEvent) {
        match &item.event {
            ContainerEvent::Metadata(Metadata::ImageId(id)) => {
                tracing::debug!(image = %id, "build reported image id");
                self.image_id = Some(id.clone());
            }
            ContainerEvent::Metadata(Metadata::TagDigest(td)) => {
                tracing::debug!(tag = %item.source, digest = %td.digest, "push reported digest");
                let _ = self.tag_digests.insert(item.source.clone(), td.clone());
            }
            ContainerEvent::Error { message } => {
                self.errors.push(format!("{}: {message}", item.source));
            }
            ContainerEvent::EndOfSubStream => self.ends_seen += 1,
            ContainerEvent::Progress { .. } => {}
        }
    }

    /// Invokes `f` for every event until the session is drained.
    pub async fn subscribe<F>(mut self, mut f: F) -> SessionReport
    where
        F: FnMut(&SessionEvent) + Send,
    {
        while let Some(item) = self.next().await {
            f(&item);
        }
        self.report()
    }

    /// Consumes every remaining event and returns the report.
    pub async fn wait(self) -> SessionReport {
        self.subscribe(|_| {}).await
    }

    fn report(&mut self) -> SessionReport {
        SessionReport {
            image_id: self.image_id.take(),
            tag_digests: std::mem::take(&mut self.tag_digests),
            errors: std::mem::take(&mut self.errors),
            complete: self.is_drained(),
        }
    }
}

impl Drop for EventSession {
    fn drop(&mut self) {
        for producer in &self.producers {
            producer.abort();
        }
    }
}

/// Builds a stream from fixed lines, newline-terminating each.
pub fn lines_stream<I, S>(lines: I) -> ByteStream
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let chunks: Vec<std::io::Result<Bytes>> = lines
        .into_iter()
        .map(|l| {
            let mut line: String = l.into();
            line.push('\n');
            Ok(Bytes::from(line))
        })
        .collect();
    futures::stream::iter(chunks).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_field_yields_error() {
        let event = decode_line(r#"{"error":"pull access denied"}"#).expect("event");
        assert_eq!(
            event,
            ContainerEvent::Error {
                message: "pull access denied".into()
            }
        );
    }

    #[test]
    fn error_detail_alone_yields_error() {
        let event = decode_line(r#"{"errorDetail":{"message":"denied"}}"#).expect("event");
        assert!(matches!(event, ContainerEvent::Error { message } if message == "denied"));
    }

    #[test]
    fn aux_id_yields_image_id() {
        let event = decode_line(r#"{"aux":{"ID":"sha256:abc"}}"#).expect("event");
        assert_eq!(
            event,
            ContainerEvent::Metadata(Metadata::ImageId(ImageId::new("sha256:abc")))
        );
    }

    #[test]
    fn aux_tag_digest_yields_tag_digest() {
        let event =
            decode_line(r#"{"aux":{"Tag":"v1","Digest":"sha256:def","Size":528}}"#).expect("event");
        assert_eq!(
            event,
            ContainerEvent::Metadata(Metadata::TagDigest(TagDigest {
                tag: "v1".into(),
                digest: "sha256:def".into(),
                size: 528,
            }))
        );
    }

    #[test]
    fn push_status_line_yields_tag_digest() {
        let event = decode_line(r#"{"status":"v1: digest: sha256:0a1b size: 1570"}"#).expect("event");
        assert_eq!(
            event,
            ContainerEvent::Metadata(Metadata::TagDigest(TagDigest {
                tag: "v1".into(),
                digest: "sha256:0a1b".into(),
                size: 1570,
            }))
        );
    }

    #[test]
    fn status_with_id_and_progress_is_summarized() {
        let event = decode_line(r#"{"status":"Downloading","id":"a1b2","progress":"[=>  ]"}"#)
            .expect("event");
        assert_eq!(
            event,
            ContainerEvent::Progress {
                message: "a1b2: Downloading [=>  ]\n".into()
            }
        );
    }

    #[test]
    fn stream_text_is_kept_verbatim() {
        let event = decode_line(r#"{"stream":"Step 1/3 : FROM alpine\n"}"#).expect("event");
        assert_eq!(
            event,
            ContainerEvent::Progress {
                message: "Step 1/3 : FROM alpine\n".into()
            }
        );
    }

    #[test]
    fn malformed_json_is_an_error_event() {
        let event = decode_line("{not json").expect("event");
        assert!(matches!(event, ContainerEvent::Error { .. }));
    }

    #[test]
    fn blank_line_yields_nothing() {
        assert!(decode_line("   \n").is_none());
    }

    #[tokio::test]
    async fn n_lines_yield_n_events_then_one_end() {
        let lines = vec![
            r#"{"status":"Pulling fs layer","id":"1"}"#,
            r#"{"status":"Download complete","id":"1"}"#,
            r#"{"status":"Pull complete","id":"1"}"#,
        ];
        let mut session = EventSession::spawn(vec![("pull".into(), lines_stream(lines))]);
        assert_eq!(session.expected_ends(), 1);

        let mut content = 0;
        let mut ends = 0;
        while let Some(item) = session.next().await {
            match item.event {
                ContainerEvent::EndOfSubStream => ends += 1,
                _ => {
                    assert_eq!(ends, 0, "content after end marker");
                    content += 1;
                }
            }
        }
        assert_eq!(content, 3);
        assert_eq!(ends, 1);
        assert!(session.is_drained());
    }

    #[tokio::test]
    async fn malformed_line_does_not_stop_decoding() {
        let lines = vec![r#"{"status":"one"}"#, "garbage", r#"{"status":"two"}"#];
        let session = EventSession::spawn(vec![("pull".into(), lines_stream(lines))]);
        let mut seen = Vec::new();
        let report = session.subscribe(|item| seen.push(item.event.clone())).await;

        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[1], ContainerEvent::Error { .. }));
        assert!(matches!(&seen[2], ContainerEvent::Progress { message } if message == "two\n"));
        assert_eq!(report.errors.len(), 1);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"stat")),
            Ok(Bytes::from_static(b"us\":\"a\"}\n{\"status\":")),
            Ok(Bytes::from_static(b"\"b\"}")),
        ];
        let session = EventSession::spawn(vec![("s".into(), futures::stream::iter(chunks).boxed())]);
        let mut messages = Vec::new();
        let report = session
            .subscribe(|item| {
                if let ContainerEvent::Progress { message } = &item.event {
                    messages.push(message.clone());
                }
            })
            .await;
        assert_eq!(messages, vec!["a\n".to_string(), "b\n".to_string()]);
        assert!(report.complete);
    }

    #[tokio::test]
    async fn session_waits_for_every_tag_end() {
        let sources = vec![
            (
                "registry.local/app:v1".to_string(),
                lines_stream(vec![
                    r#"{"status":"Pushing"}"#,
                    r#"{"aux":{"Tag":"v1","Digest":"sha256:aa","Size":10}}"#,
                ]),
            ),
            (
                "registry.local/app:v2".to_string(),
                lines_stream(vec![r#"{"aux":{"Tag":"v2","Digest":"sha256:bb","Size":20}}"#]),
            ),
            (
                "other.local/app:v3".to_string(),
                lines_stream(vec![r#"{"error":"denied"}"#, r#"{"status":"late"}"#]),
            ),
        ];
        let session = EventSession::spawn(sources);
        assert_eq!(session.expected_ends(), 3);

        let mut ends = 0;
        let report = session
            .subscribe(|item| {
                if item.event == ContainerEvent::EndOfSubStream {
                    ends += 1;
                }
            })
            .await;

        assert_eq!(ends, 3);
        assert!(report.complete);
        assert_eq!(report.tag_digests.len(), 2);
        assert_eq!(report.tag_digests["registry.local/app:v1"].digest, "sha256:aa");
        assert_eq!(report.tag_digests["registry.local/app:v2"].size, 20);
        assert_eq!(report.errors, vec!["other.local/app:v3: denied".to_string()]);
    }

    #[tokio::test]
    async fn build_session_records_image_id() {
        let session = EventSession::spawn(vec![(
            "build".into(),
            lines_stream(vec![
                r#"{"stream":"Step 1/1 : FROM alpine\n"}"#,
                r#"{"aux":{"ID":"sha256:feed"}}"#,
            ]),
        )]);
        let report = session.wait().await.into_result().expect("clean build");
        assert_eq!(report.image_id, Some(ImageId::new("sha256:feed")));
    }

    #[tokio::test]
    async fn empty_session_is_drained_immediately() {
        let mut session = EventSession::spawn(Vec::new());
        assert!(session.next().await.is_none());
    }

    #[tokio::test]
    async fn read_error_becomes_event_and_ends_substream() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"status\":\"a\"}\n")),
            Err(std::io::Error::other("connection reset")),
        ];
        let session = EventSession::spawn(vec![("s".into(), futures::stream::iter(chunks).boxed())]);
        let report = session.wait().await;
        assert!(report.complete);
        assert_eq!(report.errors, vec!["s: connection reset".to_string()]);
    }
}
