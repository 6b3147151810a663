//! Background job offload. One dedicated worker thread per job type, each
//! draining its own FIFO behind a mutex + condvar pair. Workers never touch
//! object memory; jobs carry nothing but raw fds.

use crate::logging::{self, Logger};
use crate::util;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobKind {
    CloseFile,
    AofFsync,
}

pub const JOB_KINDS: [JobKind; 2] = [JobKind::CloseFile, JobKind::AofFsync];

impl JobKind {
    #[inline]
    fn index(self) -> usize {
        match self {
            JobKind::CloseFile => 0,
            JobKind::AofFsync => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            JobKind::CloseFile => "close-file",
            JobKind::AofFsync => "aof-fsync",
        }
    }
}

#[derive(Debug)]
pub enum Job {
    CloseFile(RawFd),
    AofFsync(RawFd),
}

impl Job {
    #[inline]
    pub fn kind(&self) -> JobKind {
        match self {
            Job::CloseFile(_) => JobKind::CloseFile,
            Job::AofFsync(_) => JobKind::AofFsync,
        }
    }

    #[cfg(test)]
    fn fd(&self) -> RawFd {
        match *self {
            Job::CloseFile(fd) | Job::AofFsync(fd) => fd,
        }
    }
}

struct PendingJob {
    created_secs: u64,
    job: Job,
}

struct Queue {
    jobs: VecDeque<PendingJob>,
    pending: usize,
    stop: bool,
}

struct Lane {
    queue: Mutex<Queue>,
    ready: Condvar,
}

pub struct BgPool {
    lanes: Vec<Arc<Lane>>,
    workers: Vec<JoinHandle<()>>,
}

impl BgPool {
    /// Spawns one worker per job kind.
    pub fn new(log: &Logger) -> BgPool {
        let mut lanes = Vec::with_capacity(JOB_KINDS.len());
        let mut workers = Vec::with_capacity(JOB_KINDS.len());

        for kind in JOB_KINDS.iter().copied() {
            let lane = Arc::new(Lane {
                queue: Mutex::new(Queue { jobs: VecDeque::new(), pending: 0, stop: false }),
                ready: Condvar::new(),
            });
            let worker_lane = lane.clone();
            let worker_log = log.new(logging::o!("worker" => kind.name()));
            let handle = thread::Builder::new()
                .name(format!("bgjobs-{}", kind.name()))
                .spawn(move || worker_loop(worker_lane, worker_log))
                .expect("Error spawning background worker");

            lanes.push(lane);
            workers.push(handle);
        }

        BgPool { lanes, workers }
    }

    pub fn submit(&self, job: Job) {
        let lane = &self.lanes[job.kind().index()];
        let mut queue = lane.queue.lock().expect("Background queue poisoned");
        queue.jobs.push_back(PendingJob { created_secs: util::now_secs(), job });
        queue.pending += 1;
        lane.ready.notify_one();
    }

    pub fn pending(&self, kind: JobKind) -> usize {
        let queue = self.lanes[kind.index()]
            .queue
            .lock()
            .expect("Background queue poisoned");
        queue.pending
    }

    /// Stops every worker and joins it. Queued jobs that have not started
    /// are dropped; used only on the crash path so the main thread can
    /// inspect memory without interference.
    pub fn kill_all(&mut self) {
        for lane in &self.lanes {
            let mut queue = lane.queue.lock().expect("Background queue poisoned");
            queue.stop = true;
            lane.ready.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    #[cfg(test)]
    fn queued_fds(&self, kind: JobKind) -> Vec<RawFd> {
        let queue = self.lanes[kind.index()].queue.lock().unwrap();
        queue.jobs.iter().map(|p| p.job.fd()).collect()
    }
}

impl Drop for BgPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.kill_all();
        }
    }
}

fn worker_loop(lane: Arc<Lane>, log: Logger) {
    let mut queue = lane.queue.lock().expect("Background queue poisoned");
    loop {
        while queue.jobs.is_empty() && !queue.stop {
            queue = lane.ready.wait(queue).expect("Background queue poisoned");
        }
        if queue.stop {
            break;
        }

        let pending = queue.jobs.pop_front().expect("Woken on an empty queue");
        drop(queue);

        execute(&pending.job, pending.created_secs, &log);

        queue = lane.queue.lock().expect("Background queue poisoned");
        queue.pending -= 1;
    }
}

fn execute(job: &Job, created_secs: u64, log: &Logger) {
    logging::trace!(log, "executing background job";
                    "job" => ?job,
                    "queued_at" => created_secs);
    match *job {
        Job::CloseFile(fd) => unsafe {
            libc::close(fd);
        },
        Job::AofFsync(fd) => unsafe {
            libc::fsync(fd);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use std::time::Duration;

    fn wait_drained(pool: &BgPool, kind: JobKind) {
        for _ in 0..500 {
            if pool.pending(kind) == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("Background queue never drained");
    }

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_close_job_closes_fd() {
        let log = logging::discard();
        let pool = BgPool::new(&log);
        let (r, w) = make_pipe();

        pool.submit(Job::CloseFile(w));
        wait_drained(&pool, JobKind::CloseFile);

        // The reader sees EOF once the writer end was closed by the worker.
        let mut byte = [0u8];
        let n = unsafe { libc::read(r, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(n, 0);
        unsafe { libc::close(r) };
    }

    #[test]
    fn test_pending_counts_per_kind() {
        let log = logging::discard();
        let mut pool = BgPool::new(&log);
        pool.kill_all();

        let (r, w) = make_pipe();
        pool.submit(Job::CloseFile(r));
        pool.submit(Job::CloseFile(w));
        assert_eq!(pool.pending(JobKind::CloseFile), 2);
        assert_eq!(pool.pending(JobKind::AofFsync), 0);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_fifo_order_within_kind() {
        let log = logging::discard();
        let mut pool = BgPool::new(&log);
        // Stop the workers so the queue can be observed at rest.
        pool.kill_all();

        pool.submit(Job::CloseFile(11));
        pool.submit(Job::CloseFile(22));
        pool.submit(Job::CloseFile(33));
        assert_eq!(pool.queued_fds(JobKind::CloseFile), vec![11, 22, 33]);
    }

    #[test]
    fn test_kill_all_joins() {
        let log = logging::discard();
        let mut pool = BgPool::new(&log);
        pool.kill_all();
        assert!(pool.workers.is_empty());
        // A second call must be a no-op.
        pool.kill_all();
    }
}
