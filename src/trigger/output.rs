// Live script output: per-container line backlog plus a broadcast feed, kept for a while
// after the script ends.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

const FEED_CAPACITY: usize = 1024;
/// Lines kept per session for late subscribers; older lines are dropped.
pub const BACKLOG_LINES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum OutputEvent {
    Line(OutputLine),
    Finished { success: bool },
}

struct Session {
    name: String,
    lines: VecDeque<OutputLine>,
    feed: broadcast::Sender<OutputEvent>,
    finished: Option<(Instant, bool)>,
}

/// What a late subscriber gets: everything so far, then the live feed.
pub struct OutputSubscription {
    pub backlog: Vec<OutputLine>,
    /// `Some(success)` when the script already ended.
    pub finished: Option<bool>,
    pub feed: broadcast::Receiver<OutputEvent>,
}

#[derive(Clone)]
pub struct OutputHub {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    retention: Duration,
    backlog_limit: usize,
}

impl OutputHub {
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            retention,
            backlog_limit: BACKLOG_LINES,
        }
    }

    pub fn with_backlog_limit(mut self, lines: usize) -> Self {
        self.backlog_limit = lines.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune(&self, sessions: &mut HashMap<String, Session>) {
        let retention = self.retention;
        sessions.retain(|_, s| s.finished.is_none_or(|(at, _)| at.elapsed() < retention));
    }

    /// Open (or restart) the session of a container.
    pub fn start(&self, id: &str, name: &str) -> OutputSink {
        let mut sessions = self.lock();
        self.prune(&mut sessions);
        sessions.insert(
            id.to_string(),
            Session {
                name: name.to_string(),
                lines: VecDeque::new(),
                feed: broadcast::channel(FEED_CAPACITY).0,
                finished: None,
            },
        );
        OutputSink {
            hub: self.clone(),
            id: id.to_string(),
        }
    }

    /// Look up by container id, then by container name.
    pub fn subscribe(&self, key: &str) -> Option<OutputSubscription> {
        let mut sessions = self.lock();
        self.prune(&mut sessions);
        let session = match sessions.get(key) {
            Some(session) => session,
            None => sessions.values().find(|s| s.name == key)?,
        };
        Some(OutputSubscription {
            backlog: session.lines.iter().cloned().collect(),
            finished: session.finished.map(|(_, success)| success),
            feed: session.feed.subscribe(),
        })
    }

    fn push(&self, id: &str, stream: OutputStream, line: String) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(id) {
            let line = OutputLine {
                stream,
                line,
                at: Utc::now(),
            };
            if session.lines.len() >= self.backlog_limit {
                session.lines.pop_front();
            }
            session.lines.push_back(line.clone());
            let _ = session.feed.send(OutputEvent::Line(line));
        }
    }

    fn finish(&self, id: &str, success: bool) {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(id) {
            session.finished = Some((Instant::now(), success));
            let _ = session.feed.send(OutputEvent::Finished { success });
        }
    }
}

/// Write side of one session.
pub struct OutputSink {
    hub: OutputHub,
    id: String,
}

impl OutputSink {
    pub fn line(&self, stream: OutputStream, line: String) {
        self.hub.push(&self.id, stream, line);
    }

    pub fn finish(&self, success: bool) {
        self.hub.finish(&self.id, success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_feed() {
        let hub = OutputHub::new(Duration::from_secs(60));
        let sink = hub.start("abc", "web");
        sink.line(OutputStream::Stdout, "pulling".into());

        let mut sub = hub.subscribe("web").unwrap();
        assert_eq!(sub.backlog.len(), 1);
        assert_eq!(sub.finished, None);

        sink.line(OutputStream::Stderr, "done".into());
        sink.finish(true);
        match sub.feed.recv().await.unwrap() {
            OutputEvent::Line(l) => assert_eq!(l.line, "done"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            sub.feed.recv().await.unwrap(),
            OutputEvent::Finished { success: true }
        ));
        assert_eq!(hub.subscribe("abc").unwrap().finished, Some(true));
    }

    #[test]
    fn backlog_keeps_the_latest_lines() {
        let hub = OutputHub::new(Duration::from_secs(60)).with_backlog_limit(3);
        let sink = hub.start("abc", "web");
        for i in 0..10 {
            sink.line(OutputStream::Stdout, format!("line {i}"));
        }
        let backlog: Vec<String> = hub
            .subscribe("abc")
            .unwrap()
            .backlog
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert_eq!(backlog, vec!["line 7", "line 8", "line 9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_sessions_expire() {
        let hub = OutputHub::new(Duration::from_secs(5));
        hub.start("abc", "web").finish(false);
        assert!(hub.subscribe("abc").is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(hub.subscribe("abc").is_none());
    }
}
