//! Ordered submission of compute and conversion work.
//!
//! Work is executed on the calling thread as it is submitted; a stream
//! records the order and acts as the completion barrier. Once a stream has
//! been waited on it is exhausted, and the context hands out a fresh one on
//! the next request.

use crate::conversion::ConversionStats;

/// Identity of a stream within its context. Later streams have larger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

/// An ordered batch of submitted operations.
#[derive(Debug)]
pub struct ExecutionStream {
    id: StreamId,
    submitted: Vec<String>,
    exhausted: bool,
}

impl ExecutionStream {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            submitted: Vec::new(),
            exhausted: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Queue an operation. Never blocks.
    pub fn submit(&mut self, label: impl Into<String>) {
        self.submitted.push(label.into());
    }

    /// Block until everything submitted has completed. Completed work is
    /// dropped from the log and the stream cannot accept work afterwards.
    pub fn wait(&mut self) {
        tracing::trace!(stream = self.id.0, ops = self.submitted.len(), "stream wait");
        self.submitted.clear();
        self.exhausted = true;
    }

    /// True until the stream has been waited on.
    pub fn is_ready(&self) -> bool {
        !self.exhausted
    }

    /// Labels of operations submitted and not yet waited on, in order.
    pub fn submitted(&self) -> &[String] {
        &self.submitted
    }
}

/// Per-net execution state: the current stream and conversion counters.
///
/// Passed explicitly to build and forward calls so that independent nets
/// never share a stream.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    current: Option<ExecutionStream>,
    next_id: u64,
    stats: ConversionStats,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current stream, replaced first if it is missing or exhausted.
    pub fn stream(&mut self) -> &mut ExecutionStream {
        if !self.current.as_ref().is_some_and(ExecutionStream::is_ready) {
            let id = StreamId(self.next_id);
            self.next_id += 1;
            tracing::trace!(stream = id.0, "new stream");
            self.current = Some(ExecutionStream::new(id));
        }
        self.current.get_or_insert_with(|| ExecutionStream::new(StreamId(0)))
    }

    /// Submit an operation to the current stream and return that stream's id.
    pub fn submit(&mut self, label: impl Into<String>) -> StreamId {
        let stream = self.stream();
        stream.submit(label);
        stream.id()
    }

    /// Id of the current stream if it is still accepting work.
    pub fn current_id(&self) -> Option<StreamId> {
        self.current
            .as_ref()
            .filter(|s| s.is_ready())
            .map(ExecutionStream::id)
    }

    /// Make sure work submitted to `id` has completed.
    ///
    /// Older streams have already been waited on, so only the current
    /// stream can block.
    pub fn wait_for(&mut self, id: StreamId) {
        if let Some(stream) = self.current.as_mut()
            && stream.id() == id
            && stream.is_ready()
        {
            stream.wait();
        }
    }

    /// Wait on the current stream, if it is live.
    pub fn wait_current(&mut self) {
        if let Some(stream) = self.current.as_mut()
            && stream.is_ready()
        {
            stream.wait();
        }
    }

    /// Number of operations on the current stream not yet waited on.
    pub fn pending(&self) -> usize {
        self.current.as_ref().map_or(0, |s| s.submitted().len())
    }

    pub fn stats(&self) -> ConversionStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ConversionStats {
        &mut self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ConversionStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_created_lazily() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.current_id(), None);
        let id = ctx.submit("conv1");
        assert_eq!(ctx.current_id(), Some(id));
        assert_eq!(ctx.stream().submitted(), &["conv1".to_string()]);
    }

    #[test]
    fn test_exhausted_stream_is_replaced() {
        let mut ctx = ExecutionContext::new();
        let first = ctx.submit("a");
        ctx.wait_for(first);
        assert_eq!(ctx.current_id(), None);

        let second = ctx.submit("b");
        assert!(second > first);
        assert_eq!(ctx.stream().submitted(), &["b".to_string()]);
    }

    #[test]
    fn test_waiting_on_old_stream_is_a_no_op() {
        let mut ctx = ExecutionContext::new();
        let first = ctx.submit("a");
        ctx.wait_current();
        let second = ctx.submit("b");
        ctx.wait_for(first);
        assert_eq!(ctx.current_id(), Some(second));
    }

    #[test]
    fn test_wait_drains_submitted_work() {
        let mut ctx = ExecutionContext::new();
        for i in 0..10 {
            ctx.submit(format!("op{}", i));
        }
        assert_eq!(ctx.pending(), 10);
        ctx.wait_current();
        assert_eq!(ctx.pending(), 0);

        ctx.submit("next");
        assert_eq!(ctx.pending(), 1);
    }
}
