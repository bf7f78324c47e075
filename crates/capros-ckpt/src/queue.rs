use std::collections::{HashMap, VecDeque};

use tracing::trace;

/// The wait queues an engine can block on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Released when restart is done.
    RestartQueue,
    /// Released when a demarcation event is declared.
    WaitForCkptNeeded,
    /// Released when a checkpoint finishes.
    WaitForCkptInactive,
    /// Released when migration frees log space.
    WaitForLogSpace,
    /// Released when an object source finishes an operation.
    SourceWait,
    /// Released when the log's anchor frames are mounted.
    WaitForMount,
}

/// A cooperative kernel activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityId(pub u64);

/// Result of one bounded unit of engine work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Work was done; call again.
    Progress,
    /// Nothing can happen until the queue is woken.
    Blocked(QueueId),
    /// Nothing to do.
    Idle,
    /// The state machine reached its terminal state.
    Done,
}

/// Activities stalled on each queue, in arrival order.
#[derive(Debug, Default)]
pub struct WaitQueues {
    queues: HashMap<QueueId, VecDeque<ActivityId>>,
}

impl WaitQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stall `activity` on `queue`. An activity waits on a queue at most once.
    pub fn sleep_on(&mut self, queue: QueueId, activity: ActivityId) {
        let q = self.queues.entry(queue).or_default();
        if !q.contains(&activity) {
            q.push_back(activity);
        }
    }

    /// Release every activity on `queue`, oldest first.
    pub fn wake_all(&mut self, queue: QueueId) -> Vec<ActivityId> {
        let woken: Vec<ActivityId> = self
            .queues
            .remove(&queue)
            .map(Vec::from)
            .unwrap_or_default();
        if !woken.is_empty() {
            trace!(?queue, count = woken.len(), "woke activities");
        }
        woken
    }

    pub fn is_waiting(&self, queue: QueueId, activity: ActivityId) -> bool {
        self.queues
            .get(&queue)
            .is_some_and(|q| q.contains(&activity))
    }

    pub fn waiting(&self, queue: QueueId) -> usize {
        self.queues.get(&queue).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_releases_in_arrival_order() {
        let mut queues = WaitQueues::new();
        queues.sleep_on(QueueId::WaitForLogSpace, ActivityId(2));
        queues.sleep_on(QueueId::WaitForLogSpace, ActivityId(1));
        queues.sleep_on(QueueId::WaitForLogSpace, ActivityId(2));
        queues.sleep_on(QueueId::RestartQueue, ActivityId(3));
        assert_eq!(queues.waiting(QueueId::WaitForLogSpace), 2);

        assert_eq!(
            queues.wake_all(QueueId::WaitForLogSpace),
            vec![ActivityId(2), ActivityId(1)]
        );
        assert!(queues.wake_all(QueueId::WaitForLogSpace).is_empty());
        assert!(queues.is_waiting(QueueId::RestartQueue, ActivityId(3)));
    }
}
