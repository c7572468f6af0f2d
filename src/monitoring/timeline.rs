//! Execution Timeline
//!
//! Rebuilds step timing from published events for execution reports and
//! Gantt charts. A step's bar runs from its first `step.started` to its
//! final `step.completed` or `step.failed`, so retries and backoff are
//! included.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::events::{Event, EventKind};

/// Step phase recorded on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Started,
    Retrying,
    Completed,
    Failed,
}

/// A single point on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub step_id: String,
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

/// Timing of one session.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    entries: Vec<TimelineEntry>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a timeline from one session's events, in sequence order.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut timeline = Self::new();
        for event in events {
            timeline.record(event);
        }
        timeline
    }

    /// Adds one event. Events that carry no timing are ignored.
    pub fn record(&mut self, event: &Event) {
        match event.kind {
            EventKind::WorkflowStarted => self.start = Some(event.timestamp),
            kind if kind.is_terminal() => self.end = Some(event.timestamp),
            _ => {}
        }

        let phase = match event.kind {
            EventKind::StepStarted => Phase::Started,
            EventKind::StepRetrying => Phase::Retrying,
            EventKind::StepCompleted => Phase::Completed,
            EventKind::StepFailed => Phase::Failed,
            _ => return,
        };
        let Some(step_id) = &event.step_id else {
            return;
        };

        self.start.get_or_insert(event.timestamp);
        self.entries.push(TimelineEntry {
            step_id: step_id.clone(),
            phase,
            at: event.timestamp,
        });
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Time from session start to its terminal event (or the last entry).
    pub fn elapsed(&self) -> Duration {
        let end = self.end.or_else(|| self.entries.last().map(|e| e.at));
        match (self.start, end) {
            (Some(start), Some(end)) if end > start => end - start,
            _ => Duration::zero(),
        }
    }

    /// (offset from session start, end offset) in ms per finished step.
    fn spans(&self) -> HashMap<String, (i64, i64)> {
        let Some(origin) = self.start else {
            return HashMap::new();
        };

        let mut starts: HashMap<&str, i64> = HashMap::new();
        let mut spans = HashMap::new();
        for entry in &self.entries {
            let offset = (entry.at - origin).num_milliseconds().max(0);
            match entry.phase {
                Phase::Started => {
                    starts.entry(entry.step_id.as_str()).or_insert(offset);
                }
                Phase::Retrying => {}
                Phase::Completed | Phase::Failed => {
                    if let Some(&start) = starts.get(entry.step_id.as_str()) {
                        spans.insert(entry.step_id.clone(), (start, offset.max(start)));
                    }
                }
            }
        }
        spans
    }

    /// Returns step durations in milliseconds, retries included.
    pub fn durations(&self) -> HashMap<String, i64> {
        self.spans()
            .into_iter()
            .map(|(id, (start, end))| (id, end - start))
            .collect()
    }

    /// Number of attempts that started, per step.
    pub fn attempts(&self) -> HashMap<String, u32> {
        let mut attempts = HashMap::new();
        for entry in self.entries.iter().filter(|e| e.phase == Phase::Started) {
            *attempts.entry(entry.step_id.clone()).or_insert(0) += 1;
        }
        attempts
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Each step is shown as a bar indicating when it ran relative to the
    /// whole session. Failed steps are drawn with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().num_milliseconds();
        if total_time <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let failed: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| e.phase == Phase::Failed)
            .map(|e| e.step_id.as_str())
            .collect();

        let mut sorted_steps: Vec<_> = self.spans().into_iter().collect();
        sorted_steps.sort_by(|(a_id, (a_start, _)), (b_id, (b_start, _))| {
            a_start.cmp(b_start).then_with(|| a_id.cmp(b_id))
        });

        for (step_id, (start, end)) in sorted_steps {
            let start_pos = ((start as f64 * scale) as usize).min(49);
            let width = (((end - start) as f64 * scale).max(1.0) as usize).min(50 - start_pos);
            let mark = if failed.contains(&step_id.as_str()) { "x" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
