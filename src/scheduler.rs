//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! A single background worker drains a min-heap of `ProcessingJob`s ordered
//! by `(total_size ASC, filename ASC)`. Smallest job first minimizes mean
//! latency on this shared single-worker pipeline.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::Result;

use crate::logging::Logger;
use crate::processor;

pub struct ProcessingJob {
    pub data: Vec<u8>,
    pub image_id: String,
    pub filename: String,
    pub format: String,
    pub processing_type: crate::protocol::ProcessingType,
    pub total_size: u32,
}

// BinaryHeap is a max-heap; we want the smallest (total_size, filename) out
// first, so we order jobs by `Reverse` of the natural tuple order.
impl_ord_by!(ProcessingJob, |a: &ProcessingJob, b: &ProcessingJob| {
    Reverse((a.total_size, &a.filename)).cmp(&Reverse((b.total_size, &b.filename)))
});

struct Shared {
    heap: Mutex<BinaryHeap<ProcessingJob>>,
    cond: Condvar,
    terminate: Mutex<bool>,
}

// `worker` is a `Mutex` rather than a plain field so `shutdown` can take
// `&self`: the scheduler is shared across accept-loop-spawned connection
// threads behind an `Arc`, and none of them can hand back an exclusive
// `&mut Scheduler` to shut it down.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the worker thread. Construction failure is reported via the
    /// `Result`; there is no partially-started state to clean up on error.
    pub fn start(config: processor::OutputConfig, logger: Logger) -> Result<Self> {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            terminate: Mutex::new(false),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("scheduler-worker".into())
            .spawn(move || worker_main(worker_shared, config, logger))?;

        Ok(Scheduler { shared, worker: Mutex::new(Some(worker)) })
    }

    /// Takes ownership of `job.data` on success. On failure, the job is
    /// returned to the caller, who remains responsible for it.
    pub fn enqueue(&self, job: ProcessingJob) -> Result<(), ProcessingJob> {
        let terminating = *self.shared.terminate.lock().unwrap();
        if terminating {
            return Err(job);
        }
        let mut heap = self.shared.heap.lock().unwrap();
        heap.push(job);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Signals termination, wakes the worker, and joins it. Draining of any
    /// remaining heap entries happens inside the worker itself before it
    /// exits. Safe to call more than once: a second call observes the
    /// worker handle already taken and is a no-op.
    pub fn shutdown(&self) {
        *self.shared.terminate.lock().unwrap() = true;
        self.shared.cond.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        // A job can slip in between enqueue()'s terminate check and its
        // heap push, landing after the worker already observed terminate
        // and exited. Drain it here so no buffer is silently kept alive.
        self.shared.heap.lock().unwrap().clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: Arc<Shared>, config: processor::OutputConfig, logger: Logger) {
    loop {
        // Idle: wait on the condition while the heap is empty and we
        // haven't been asked to terminate.
        let mut heap = shared.heap.lock().unwrap();
        while heap.is_empty() {
            if *shared.terminate.lock().unwrap() {
                // Draining/Terminal: nothing left to pop, termination
                // requested. The heap is already empty, so there is
                // nothing to release.
                return;
            }
            heap = shared.cond.wait(heap).unwrap();
        }
        // Processing: pop the min, release the lock, invoke the processor,
        // then loop back to re-acquire and check again.
        let job = heap.pop().expect("heap was just checked non-empty");
        drop(heap);

        if let Err(e) = processor::process_job(&job, &config) {
            logger.log(&format!(
                "Failed to process image {} ({}): {:#}", job.image_id, job.filename, e
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProcessingType;

    fn job(total_size: u32, filename: &str) -> ProcessingJob {
        ProcessingJob {
            data: vec![0u8; total_size as usize],
            image_id: "test-id".into(),
            filename: filename.into(),
            format: "bin".into(),
            processing_type: ProcessingType::Both,
            total_size,
        }
    }

    #[test]
    fn pop_order_is_size_ascending_then_filename() {
        let mut heap = BinaryHeap::new();
        heap.push(job(9000, "c"));
        heap.push(job(100, "a"));
        heap.push(job(4500, "b"));

        let sizes: Vec<u32> = [heap.pop(), heap.pop(), heap.pop()]
            .into_iter()
            .map(|j| j.unwrap().total_size)
            .collect();
        assert_eq!(sizes, vec![100, 4500, 9000]);
    }

    #[test]
    fn ties_break_by_filename_ascending() {
        let mut heap = BinaryHeap::new();
        heap.push(job(100, "zebra"));
        heap.push(job(100, "apple"));

        assert_eq!(heap.pop().unwrap().filename, "apple");
        assert_eq!(heap.pop().unwrap().filename, "zebra");
    }
}
