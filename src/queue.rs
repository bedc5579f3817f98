// src/queue.rs

use crate::models::{JobRecord, JobStatus};

/// The job list: id-addressable, iterated in queueing order.
///
/// Download lists are short (tens of entries), so lookups are linear scans
/// over a `Vec`, which keeps insertion order for free.
#[derive(Debug, Default, Clone)]
pub struct JobQueue {
    jobs: Vec<JobRecord>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a queue from records that are already in queueing order.
    pub fn from_records(records: Vec<JobRecord>) -> Self {
        Self { jobs: records }
    }

    /// Appends a job. An existing job with the same id is replaced in place.
    pub fn push(&mut self, record: JobRecord) {
        match self.get_mut(&record.id) {
            Some(existing) => *existing = record,
            None => self.jobs.push(record),
        }
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<JobRecord> {
        let index = self.jobs.iter().position(|job| job.id == id)?;
        Some(self.jobs.remove(index))
    }

    /// Removes every job with the given status and returns their ids.
    pub fn remove_with_status(&mut self, status: JobStatus) -> Vec<String> {
        let mut removed = Vec::new();
        self.jobs.retain(|job| {
            if job.status == status {
                removed.push(job.id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Empties the list, returning the ids it held.
    pub fn drain_ids(&mut self) -> Vec<String> {
        self.jobs.drain(..).map(|job| job.id).collect()
    }

    /// The first job in queueing order still waiting for its turn.
    pub fn first_queued(&self) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.status == JobStatus::Queued)
    }

    pub fn has_in_progress(&self) -> bool {
        self.jobs.iter().any(|job| job.status == JobStatus::InProgress)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JobRecord> {
        self.jobs.iter_mut()
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.jobs.clone()
    }
}
