//! Command queue
//!
//! Priority-ordered with FIFO ties, bounded, drained by the host. All
//! access is serialized through the engine loop; the queue itself is plain
//! single-threaded data.

use crate::model::orders::Command;

#[derive(Debug)]
struct QueueEntry {
    command: Command,
    seq: u64,
}

/// Bounded priority queue: highest priority first, insertion order within
/// equal priority. Over-limit enqueues drop the lowest-priority tail.
#[derive(Debug)]
pub struct CommandQueue {
    entries: Vec<QueueEntry>,
    max_len: usize,
    next_seq: u64,
    dropped_total: u64,
}

impl CommandQueue {
    /// `max_commands_per_tick` bounds a single drain; the queue holds at
    /// most four ticks' worth.
    pub fn new(max_commands_per_tick: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_len: max_commands_per_tick.max(1) * 4,
            next_seq: 0,
            dropped_total: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Insert preserving descending priority, FIFO within equal priority.
    pub fn enqueue(&mut self, command: Command) {
        let seq = self.next_seq;
        self.next_seq += 1;

        // Entries are kept sorted descending by priority; seq ordering
        // within a priority falls out of inserting after the last equal.
        let index = self
            .entries
            .partition_point(|e| e.command.priority >= command.priority);
        self.entries.insert(index, QueueEntry { command, seq });

        while self.entries.len() > self.max_len {
            let dropped = self.entries.pop().expect("over-full queue has a tail");
            self.dropped_total += 1;
            crate::warn_log!(
                "Command queue full ({}), dropped lowest-priority {} (priority {})",
                self.max_len,
                dropped.command.command_type(),
                dropped.command.priority
            );
        }
    }

    pub fn enqueue_batch(&mut self, commands: Vec<Command>) {
        for command in commands {
            self.enqueue(command);
        }
    }

    /// Remove and return up to `max_n` highest-priority commands. The batch
    /// is removed atomically; a command is handed to the host exactly once.
    pub fn drain(&mut self, max_n: usize) -> Vec<Command> {
        let take = max_n.min(self.entries.len());
        self.entries
            .drain(..take)
            .map(|entry| entry.command)
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn seqs(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.seq).collect()
    }
}
