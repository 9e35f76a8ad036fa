//! Ring buffer of recent database operations, shared by the connections of
//! one application.
//!
//! Every execute call begins an entry and receives a cookie. The cookie encodes
//! the slot and a generation, so ending an operation whose slot has since been
//! reused is silently ignored.

use std::fmt::Write as _;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use regex::Regex;
use tracing::info;

use crate::error::Error;
use crate::global;
use crate::value::Value;

const COOKIE_GENERATION_SHIFT: u32 = 8;
const COOKIE_INDEX_MASK: u32 = 0xff;
const HISTOGRAM_BUCKETS: usize = 8;

/// Handle for an operation started with [`OperationLog::begin_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationCookie(u32);

/// Collapses every whitespace run that contains a line break into one space.
pub fn trim_sql_for_display(sql: &str) -> String {
    static LINE_BREAKS: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = LINE_BREAKS.get_or_init(|| Regex::new(r"\s*\n+\s*").ok());
    match pattern {
        Some(re) => re.replace_all(sql, " ").into_owned(),
        None => sql.to_string(),
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn histogram_bucket(now: i64) -> usize {
    ((now & 0xE000) >> 13) as usize
}

fn format_start_time(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(utc) => utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string(),
        None => millis.to_string(),
    }
}

/// Point-in-time copy of one logged operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSnapshot {
    pub kind: String,
    pub session_qualifier: String,
    pub sql: Option<String>,
    pub bind_args: Vec<Value>,
    pub finished: bool,
    pub failure: Option<String>,
}

#[derive(Debug)]
struct OperationEntry {
    cookie: u32,
    thread_id: ThreadId,
    session_qualifier: String,
    start_time: i64,
    end_time: i64,
    kind: String,
    sql: Option<String>,
    bind_args: Vec<Value>,
    finished: bool,
    failure: Option<String>,
}

impl OperationEntry {
    fn status(&self) -> &'static str {
        match (self.finished, &self.failure) {
            (false, _) => "running",
            (true, Some(_)) => "failed",
            (true, None) => "succeeded",
        }
    }

    fn describe(&self, out: &mut String, verbose: bool) {
        out.push_str(&self.kind);
        if self.finished {
            let _ = write!(out, " took {}ms", self.end_time - self.start_time);
        } else {
            let _ = write!(out, " started {}ms ago", now_millis() - self.start_time);
        }
        let _ = write!(
            out,
            " - {}\n      threadId:{:?}, sessionQualifier:{}, startTime:{}",
            self.status(),
            self.thread_id,
            self.session_qualifier,
            format_start_time(self.start_time)
        );
        if let Some(sql) = &self.sql {
            let _ = write!(out, ", sql=\"{}\"", trim_sql_for_display(sql));
        }
        if verbose && !self.bind_args.is_empty() {
            let args = self
                .bind_args
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(out, ", bindArgs=[{args}]");
        }
        if let Some(failure) = &self.failure {
            let _ = write!(out, "\n      error=\"{failure}\"");
        }
    }

    fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            kind: self.kind.clone(),
            session_qualifier: self.session_qualifier.clone(),
            sql: self.sql.clone(),
            bind_args: self.bind_args.clone(),
            finished: self.finished,
            failure: self.failure.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Histogram {
    buckets: [u32; HISTOGRAM_BUCKETS],
    last_bucket: usize,
    total: u64,
}

impl Histogram {
    /// Zeroes every bucket the clock has moved past since the last update.
    fn advance_to(&mut self, bucket: usize) {
        while self.last_bucket != bucket {
            self.last_bucket = (self.last_bucket + 1) % HISTOGRAM_BUCKETS;
            self.buckets[self.last_bucket] = 0;
        }
    }

    fn tick(&mut self, now: i64) {
        let bucket = histogram_bucket(now);
        self.advance_to(bucket);
        self.buckets[bucket] += 1;
        self.total += 1;
    }
}

#[derive(Debug)]
struct LogState {
    operations: Vec<Option<OperationEntry>>,
    index: usize,
    generation: u32,
    opens: Histogram,
    closes: Histogram,
}

impl LogState {
    fn entry_mut(&mut self, cookie: OperationCookie) -> Option<&mut OperationEntry> {
        let index = (cookie.0 & COOKIE_INDEX_MASK) as usize;
        self.operations
            .get_mut(index)?
            .as_mut()
            .filter(|entry| entry.cookie == cookie.0)
    }
}

/// Recent-operation ring for one application.
#[derive(Debug)]
pub struct OperationLog {
    app_name: String,
    state: Mutex<LogState>,
}

impl OperationLog {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            state: Mutex::new(LogState {
                operations: (0..global::MAX_RECENT_OPERATIONS).map(|_| None).collect(),
                index: 0,
                generation: 0,
                opens: Histogram::default(),
                closes: Histogram::default(),
            }),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Records the start of an operation. Blob arguments are kept without their bytes.
    pub fn begin_operation(
        &self,
        session_qualifier: &str,
        kind: &str,
        sql: Option<&str>,
        bind_args: &[Value],
    ) -> OperationCookie {
        let mut state = self.state.lock();
        let index = (state.index + 1) % global::MAX_RECENT_OPERATIONS;
        let generation = state.generation;
        state.generation = state.generation.wrapping_add(1);
        let cookie = (generation << COOKIE_GENERATION_SHIFT) | index as u32;

        state.operations[index] = Some(OperationEntry {
            cookie,
            thread_id: thread::current().id(),
            session_qualifier: session_qualifier.to_string(),
            start_time: now_millis(),
            end_time: 0,
            kind: kind.to_string(),
            sql: sql.map(str::to_string),
            bind_args: bind_args.iter().map(Value::redacted).collect(),
            finished: false,
            failure: None,
        });
        state.index = index;
        OperationCookie(cookie)
    }

    /// Records `error` against the operation and logs it.
    pub fn fail_operation(&self, cookie: OperationCookie, error: &Error) {
        let line = {
            let mut state = self.state.lock();
            state.entry_mut(cookie).map(|entry| {
                entry.failure = Some(error.to_string());
                let mut line = String::new();
                entry.describe(&mut line, false);
                line
            })
        };
        if let Some(line) = line {
            info!(app_name = %self.app_name, "failOperation: {line}");
        }
    }

    /// Marks the operation finished, logging it if it ran slowly.
    pub fn end_operation(&self, cookie: OperationCookie) {
        let line = {
            let mut state = self.state.lock();
            state.entry_mut(cookie).and_then(|entry| {
                finish(entry).then(|| {
                    let mut line = String::new();
                    entry.describe(&mut line, false);
                    line
                })
            })
        };
        if let Some(line) = line {
            info!(app_name = %self.app_name, "endOperation (long runtime): {line}");
        }
    }

    /// Like [`end_operation`](Self::end_operation), logging `detail` instead
    /// of the entry when the operation was slow.
    pub fn end_operation_with_detail(&self, cookie: OperationCookie, detail: &str) {
        let slow = {
            let mut state = self.state.lock();
            state.entry_mut(cookie).is_some_and(finish)
        };
        if slow {
            info!(app_name = %self.app_name, "endOperation (long runtime): {detail}");
        }
    }

    /// Logs the operation together with an extra detail, unconditionally.
    pub fn log_operation(&self, cookie: OperationCookie, detail: &str) {
        let line = {
            let mut state = self.state.lock();
            state.entry_mut(cookie).map(|entry| {
                let mut line = String::new();
                entry.describe(&mut line, false);
                let _ = write!(line, ", {detail}");
                line
            })
        };
        if let Some(line) = line {
            info!(app_name = %self.app_name, "{line}");
        }
    }

    pub fn tick_open(&self) {
        self.state.lock().opens.tick(now_millis());
    }

    pub fn tick_close(&self) {
        self.state.lock().closes.tick(now_millis());
    }

    pub fn total_opens(&self) -> u64 {
        self.state.lock().opens.total
    }

    pub fn total_closes(&self) -> u64 {
        self.state.lock().closes.total
    }

    /// Connections opened through this log and not yet closed.
    pub fn active_connections(&self) -> u64 {
        let state = self.state.lock();
        state.opens.total.saturating_sub(state.closes.total)
    }

    /// Describes the most recent operation if it is still running.
    pub fn describe_current_operation(&self) -> Option<String> {
        let state = self.state.lock();
        state.operations[state.index]
            .as_ref()
            .filter(|entry| !entry.finished)
            .map(|entry| {
                let mut out = String::new();
                entry.describe(&mut out, false);
                out
            })
    }

    /// Logged operations, most recent first.
    pub fn recent_operations(&self) -> Vec<OperationSnapshot> {
        let state = self.state.lock();
        let len = state.operations.len();
        (0..len)
            .map(|n| (state.index + len - n) % len)
            .map_while(|i| state.operations[i].as_ref().map(OperationEntry::snapshot))
            .collect()
    }

    pub fn clear_operations(&self) {
        let mut state = self.state.lock();
        for slot in state.operations.iter_mut() {
            *slot = None;
        }
    }

    pub fn dump(&self, out: &mut String, verbose: bool) {
        let mut state = self.state.lock();
        let bucket = histogram_bucket(now_millis());
        state.opens.advance_to(bucket);
        state.closes.advance_to(bucket);

        out.push_str("  Last 65 seconds of open and close activity on this appName\n");
        out.push_str("     opens | closes\n");
        let mut idx = bucket;
        for _ in 0..HISTOGRAM_BUCKETS {
            let _ = writeln!(
                out,
                "    {:>6}   {:>6}",
                state.opens.buckets[idx], state.closes.buckets[idx]
            );
            idx = (idx + HISTOGRAM_BUCKETS - 1) % HISTOGRAM_BUCKETS;
        }
        let _ = writeln!(
            out,
            "Total opens: {} closes: {} currently active: {}\n",
            state.opens.total,
            state.closes.total,
            state.opens.total.saturating_sub(state.closes.total)
        );

        out.push_str("  Most recently executed operations:\n");
        let len = state.operations.len();
        let mut any = false;
        for n in 0..len {
            let i = (state.index + len - n) % len;
            let Some(entry) = state.operations[i].as_ref() else {
                break;
            };
            any = true;
            let _ = write!(out, " {n}: ");
            entry.describe(out, verbose);
            out.push('\n');
        }
        if !any {
            out.push_str("    <none>\n");
        }
    }
}

/// Stamps the end time once; returns whether the operation counts as slow.
fn finish(entry: &mut OperationEntry) -> bool {
    if !entry.finished {
        entry.end_time = now_millis();
        entry.finished = true;
    }
    entry.end_time - entry.start_time >= global::SLOW_OPERATION_THRESHOLD_MS
}
