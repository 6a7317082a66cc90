//! Central deadline queue
//!
//! One task owns a min-heap of all armed deadlines instead of one sleeping
//! task per dispatch. Cancellation tombstones the entry; a fired deadline for
//! a stale (task, generation) pair is dropped, so retried or cancelled tasks
//! are never resurrected by an old timer.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::domain_types::TaskId;

/// Tombstone housekeeping threshold
const TOMBSTONE_SWEEP_MIN: usize = 1024;

#[derive(Debug)]
enum TimerCommand {
    Arm {
        task_id: TaskId,
        generation: u32,
        deadline: Instant,
    },
    Cancel {
        task_id: TaskId,
        generation: u32,
    },
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    deadline: Instant,
    task_id: TaskId,
    generation: u32,
}

/// Handle for arming and cancelling deadlines
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerHandle {
    /// Arms a single-shot deadline for one dispatch attempt
    pub fn arm(&self, task_id: TaskId, generation: u32, deadline: Instant) {
        let _ = self.tx.send(TimerCommand::Arm {
            task_id,
            generation,
            deadline,
        });
    }

    /// Cancels a previously armed deadline
    pub fn cancel(&self, task_id: TaskId, generation: u32) {
        let _ = self.tx.send(TimerCommand::Cancel {
            task_id,
            generation,
        });
    }
}

/// Spawns the timer task; `on_fire` runs for every non-cancelled deadline
pub fn spawn_timer_wheel(
    on_fire: impl Fn(TaskId, u32) + Send + 'static,
    shutdown: CancellationToken,
) -> TimerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
        let mut tombstones: HashSet<(TaskId, u32)> = HashSet::new();

        loop {
            let next_deadline = heap.peek().map(|Reverse(entry)| entry.deadline);
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(TimerCommand::Arm { task_id, generation, deadline }) => {
                        trace!(%task_id, generation, "deadline armed");
                        heap.push(Reverse(HeapEntry { deadline, task_id, generation }));
                    }
                    Some(TimerCommand::Cancel { task_id, generation }) => {
                        trace!(%task_id, generation, "deadline cancelled");
                        tombstones.insert((task_id, generation));
                        if tombstones.len() > heap.len() + TOMBSTONE_SWEEP_MIN {
                            let live: HashSet<(TaskId, u32)> = heap
                                .iter()
                                .map(|Reverse(entry)| (entry.task_id, entry.generation))
                                .collect();
                            tombstones.retain(|key| live.contains(key));
                        }
                    }
                    None => break,
                },
                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let now = Instant::now();
                    while let Some(Reverse(entry)) = heap.peek() {
                        if entry.deadline > now {
                            break;
                        }
                        let Reverse(entry) = heap.pop().expect("peeked entry exists");
                        if tombstones.remove(&(entry.task_id, entry.generation)) {
                            continue;
                        }
                        on_fire(entry.task_id, entry.generation);
                    }
                }
            }
        }
        debug!("timer wheel stopped");
    });

    TimerHandle { tx }
}
