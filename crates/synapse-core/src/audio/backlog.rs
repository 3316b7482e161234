use std::collections::VecDeque;

use crate::transport::{SendError, TransportSink};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sent: usize,
    /// Frames lost because the transport refused them.
    pub dropped: usize,
}

/// Encoded `audioChunk` frames waiting for room in the transport queue.
///
/// When full, pushing evicts the oldest frame so that playback on the peer
/// side stays close to real time.
#[derive(Debug)]
pub struct AudioBacklog {
    queue: VecDeque<String>,
    capacity: usize,
}

impl AudioBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Queues a frame. Returns `true` if the oldest frame was evicted.
    pub fn push(&mut self, frame: String) -> bool {
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            true
        } else {
            false
        };
        self.queue.push_back(frame);
        evicted
    }

    /// Moves as many frames as the sink has room for. A closed sink drops
    /// the whole queue.
    pub fn flush(&mut self, sink: &dyn TransportSink) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if !sink.is_open() {
            outcome.dropped = self.clear();
            return outcome;
        }
        while sink.has_capacity() {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            match sink.send_text(frame) {
                Ok(()) => outcome.sent += 1,
                Err(SendError::Full) => outcome.dropped += 1,
                Err(SendError::Closed) => {
                    outcome.dropped += 1 + self.queue.len();
                    self.queue.clear();
                    break;
                }
            }
        }
        outcome
    }

    /// Empties the queue and returns how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, Outgoing};

    #[test]
    fn test_push_evicts_oldest() {
        let mut backlog = AudioBacklog::new(2);
        assert!(!backlog.push("a".into()));
        assert!(!backlog.push("b".into()));
        assert!(backlog.push("c".into()));
        assert_eq!(backlog.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_respects_sink_capacity() {
        let (connection, mut remote) = Connection::channel(2);
        let mut backlog = AudioBacklog::new(8);
        for frame in ["1", "2", "3"] {
            backlog.push(frame.to_string());
        }

        let outcome = backlog.flush(connection.sink.as_ref());
        assert_eq!(outcome, FlushOutcome { sent: 2, dropped: 0 });
        assert_eq!(backlog.len(), 1);

        assert_eq!(remote.outgoing.recv().await, Some(Outgoing::Text("1".into())));
        assert_eq!(remote.outgoing.recv().await, Some(Outgoing::Text("2".into())));

        let outcome = backlog.flush(connection.sink.as_ref());
        assert_eq!(outcome.sent, 1);
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_flush_on_closed_sink_discards_everything() {
        let (connection, remote) = Connection::channel(4);
        drop(remote);
        let mut backlog = AudioBacklog::new(8);
        backlog.push("1".into());
        backlog.push("2".into());
        let outcome = backlog.flush(connection.sink.as_ref());
        assert_eq!(outcome, FlushOutcome { sent: 0, dropped: 2 });
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn test_flush_after_local_close_discards_everything() {
        let (connection, _remote) = Connection::channel(4);
        connection.sink.close(1000, "done");
        let mut backlog = AudioBacklog::new(8);
        for frame in ["1", "2", "3"] {
            backlog.push(frame.to_string());
        }
        assert_eq!(
            backlog.flush(connection.sink.as_ref()),
            FlushOutcome { sent: 0, dropped: 3 }
        );
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_clear_reports_discarded_frames() {
        let mut backlog = AudioBacklog::new(4);
        backlog.push("1".into());
        backlog.push("2".into());
        assert_eq!(backlog.clear(), 2);
        assert_eq!(backlog.clear(), 0);
    }
}
