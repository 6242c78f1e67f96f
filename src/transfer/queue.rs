use super::types::DownloadQueueItem;
use crate::protocol::ContentHash;
use std::collections::{BTreeMap, VecDeque};

/// Downloads waiting for a slot, bucketed by priority.
///
/// Lower numbers are served first; within a priority the queue is FIFO.
#[derive(Debug, Default)]
pub struct DownloadQueue {
    levels: BTreeMap<i32, VecDeque<DownloadQueueItem>>,
    /// Requeued items kept away from `pop_next` until `release_held`.
    held: Vec<DownloadQueueItem>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.levels
            .values()
            .any(|level| level.iter().any(|item| &item.hash == hash))
            || self.held.iter().any(|item| &item.hash == hash)
    }

    pub fn push(&mut self, item: DownloadQueueItem) {
        self.levels.entry(item.priority).or_default().push_back(item);
    }

    /// Queues an item that only becomes eligible after the next
    /// `release_held`.
    pub fn hold(&mut self, item: DownloadQueueItem) {
        self.held.push(item);
    }

    pub fn release_held(&mut self) {
        for item in std::mem::take(&mut self.held) {
            self.push(item);
        }
    }

    pub fn pop_next(&mut self) -> Option<DownloadQueueItem> {
        let (&priority, level) = self.levels.iter_mut().find(|(_, level)| !level.is_empty())?;
        let item = level.pop_front();
        if level.is_empty() {
            self.levels.remove(&priority);
        }
        item
    }

    pub fn remove(&mut self, priority: i32, hash: &ContentHash) -> Option<DownloadQueueItem> {
        if let Some(index) = self
            .held
            .iter()
            .position(|item| item.priority == priority && &item.hash == hash)
        {
            return Some(self.held.remove(index));
        }
        let level = self.levels.get_mut(&priority)?;
        let index = level.iter().position(|item| &item.hash == hash)?;
        let item = level.remove(index);
        if level.is_empty() {
            self.levels.remove(&priority);
        }
        item
    }

    /// Moves an item between priorities. Promoted items go to the back of
    /// their new level; demoted ones (or same level) to the front.
    pub fn change_priority(&mut self, old: i32, new: i32, hash: &ContentHash) -> bool {
        if let Some(item) = self
            .held
            .iter_mut()
            .find(|item| item.priority == old && &item.hash == hash)
        {
            item.priority = new;
            return true;
        }
        let Some(mut item) = self.remove(old, hash) else {
            return false;
        };
        item.priority = new;
        let level = self.levels.entry(new).or_default();
        if old > new {
            level.push_back(item);
        } else {
            level.push_front(item);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(VecDeque::len).sum::<usize>() + self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(VecDeque::is_empty) && self.held.is_empty()
    }

    /// Snapshot in service order, held items last.
    pub fn items(&self) -> Vec<DownloadQueueItem> {
        self.levels
            .values()
            .flatten()
            .chain(self.held.iter())
            .cloned()
            .collect()
    }
}
