//! Per-run latency accounting.
//!
//! A [`Tracer`] is created fresh for every pipeline run and records one
//! [`Span`] per stage execution. Spans are opened with [`Tracer::start`] and
//! closed with [`Tracer::stop`]; [`Tracer::span`] returns a guard that closes
//! the span when dropped, including during unwinding.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone)]
pub struct Span {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    start: Instant,
    elapsed: Option<Duration>,
}

impl Span {
    pub fn is_closed(&self) -> bool {
        self.elapsed.is_some()
    }

    /// Zero until the span is closed.
    pub fn duration_ms(&self) -> f64 {
        self.elapsed
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Index of a span inside its tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanId(usize);

#[derive(Debug, Default)]
pub struct Tracer {
    spans: Vec<Span>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<I, K, V>(&mut self, name: impl Into<String>, tags: I) -> SpanId
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.spans.push(Span {
            name: name.into(),
            started_at: Utc::now(),
            ended_at: None,
            tags: tags
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            start: Instant::now(),
            elapsed: None,
        });
        SpanId(self.spans.len() - 1)
    }

    /// Close a span. Closing twice keeps the first end time.
    pub fn stop(&mut self, id: SpanId) {
        if let Some(span) = self.spans.get_mut(id.0)
            && span.elapsed.is_none()
        {
            span.elapsed = Some(span.start.elapsed());
            span.ended_at = Some(Utc::now());
        }
    }

    /// Open a span that closes itself when the guard goes out of scope.
    pub fn span<I, K, V>(&mut self, name: impl Into<String>, tags: I) -> SpanGuard<'_>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let id = self.start(name, tags);
        SpanGuard { tracer: self, id }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Sum of closed span durations.
    pub fn total_duration_ms(&self) -> f64 {
        self.spans.iter().map(Span::duration_ms).sum()
    }

    /// `{"spans": [{name, duration_ms, started_at, ...tags}]}`
    pub fn to_json(&self) -> Value {
        let spans: Vec<Value> = self
            .spans
            .iter()
            .map(|span| {
                let mut entry = Map::new();
                entry.insert("name".into(), json!(span.name));
                entry.insert("duration_ms".into(), json!(span.duration_ms()));
                entry.insert("started_at".into(), json!(span.started_at.to_rfc3339()));
                for (k, v) in &span.tags {
                    entry.insert(k.clone(), json!(v));
                }
                Value::Object(entry)
            })
            .collect();
        json!({ "spans": spans })
    }
}

pub struct SpanGuard<'a> {
    tracer: &'a mut Tracer,
    id: SpanId,
}

impl SpanGuard<'_> {
    pub fn id(&self) -> SpanId {
        self.id
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.tracer.stop(self.id);
    }
}
