//! Priority job queue with a fixed worker pool.
//!
//! Jobs are ordered by `(priority, enqueue_sequence)` so equal priorities
//! preserve FIFO. Streaming jobs get a single-consumer byte channel whose
//! close (sender dropped) is this implementation's terminal sentinel.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::dispatcher::{build_payload, AskRequest, Dispatcher};
use crate::errors::GatewayError;
use crate::selector::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

struct JobRecord {
    request: AskRequest,
    priority: i64,
    status: JobStatus,
    enqueued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    device: Option<Value>,
    result: Option<Value>,
    error: Option<String>,
    stream: bool,
    stream_tx: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Read-only view returned by `GET /jobs/{id}`.
#[derive(Serialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub priority: i64,
    pub enqueued_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub device: Option<Value>,
    pub error: Option<String>,
}

fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(PartialEq, Eq)]
struct QueueEntry {
    priority: i64,
    seq: u64,
    job_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct JobQueue {
    jobs: DashMap<String, Mutex<JobRecord>>,
    stream_rx: DashMap<String, Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>>,
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    notify: Notify,
    seq: AtomicU64,
    stop: AtomicBool,
}

impl JobQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
            stream_rx: DashMap::new(),
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        })
    }

    pub async fn enqueue(self: &Arc<Self>, request: AskRequest) -> Result<String, GatewayError> {
        self.enqueue_inner(request, false).await
    }

    pub async fn enqueue_stream(self: &Arc<Self>, request: AskRequest) -> Result<String, GatewayError> {
        self.enqueue_inner(request, true).await
    }

    async fn enqueue_inner(self: &Arc<Self>, request: AskRequest, stream: bool) -> Result<String, GatewayError> {
        request.validate()?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let priority = request.priority;
        let stream_tx = if stream {
            let (tx, rx) = mpsc::unbounded_channel();
            self.stream_rx.insert(id.clone(), Mutex::new(Some(rx)));
            Some(tx)
        } else {
            None
        };
        let record = JobRecord {
            request,
            priority,
            status: JobStatus::Queued,
            enqueued_at: iso_now(),
            started_at: None,
            finished_at: None,
            device: None,
            result: None,
            error: None,
            stream,
            stream_tx,
        };
        self.jobs.insert(id.clone(), Mutex::new(record));

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.heap.lock().await.push(Reverse(QueueEntry {
            priority,
            seq,
            job_id: id.clone(),
        }));
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn status(&self, job_id: &str) -> Option<JobView> {
        let entry = self.jobs.get(job_id)?;
        let job = entry.lock().await;
        Some(JobView {
            id: job_id.to_string(),
            status: job.status,
            priority: job.priority,
            enqueued_at: job.enqueued_at.clone(),
            started_at: job.started_at.clone(),
            finished_at: job.finished_at.clone(),
            device: job.device.clone(),
            error: job.error.clone(),
        })
    }

    pub async fn result(&self, job_id: &str) -> Option<JobOutcome> {
        let entry = self.jobs.get(job_id)?;
        let job = entry.lock().await;
        Some(match job.status {
            JobStatus::Done => JobOutcome::Done(job.result.clone().unwrap_or(Value::Null)),
            other => JobOutcome::Pending(other),
        })
    }

    /// Takes ownership of the job's stream receiver. Returns `None` for a
    /// non-streaming job, an unknown job, or one whose stream was already
    /// consumed.
    pub async fn take_stream(&self, job_id: &str) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        let slot = self.stream_rx.get(job_id)?;
        slot.lock().await.take()
    }

    async fn dequeue(self: &Arc<Self>) -> Option<String> {
        loop {
            {
                let mut heap = self.heap.lock().await;
                if let Some(Reverse(entry)) = heap.pop() {
                    return Some(entry.job_id);
                }
            }
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Spawns `worker_count` (minimum 1) worker tasks.
    pub fn spawn_workers(
        self: &Arc<Self>,
        worker_count: usize,
        selector: Arc<Selector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count.max(1))
            .map(|idx| {
                let queue = self.clone();
                let selector = selector.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { queue.worker_loop(idx, selector, dispatcher).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, _idx: usize, selector: Arc<Selector>, dispatcher: Arc<Dispatcher>) {
        while let Some(job_id) = self.dequeue().await {
            self.run_job(&job_id, &selector, &dispatcher).await;
        }
    }

    async fn run_job(&self, job_id: &str, selector: &Arc<Selector>, dispatcher: &Arc<Dispatcher>) {
        let Some(entry) = self.jobs.get(job_id) else { return };

        let (request, is_stream) = {
            let mut job = entry.lock().await;
            job.status = JobStatus::Running;
            job.started_at = Some(iso_now());
            (job.request.clone(), job.stream)
        };

        let device = selector.pick();
        {
            let mut job = entry.lock().await;
            job.device = Some(serde_json::json!({
                "host": device.config.host,
                "port": device.config.port,
                "key": device.key(),
            }));
        }
        let payload = build_payload(&request, device.config.default_model.as_deref(), is_stream);

        if is_stream {
            let tx = entry.lock().await.stream_tx.clone();
            let Some(tx) = tx else { return };
            let header = format!(
                "# picked {}:{} model={}\n",
                device.config.host,
                device.config.port,
                payload.get("model").and_then(Value::as_str).unwrap_or("")
            );
            let _ = tx.send(Bytes::from(header));
            let _ = tx.send(Bytes::from_static(b"# posting (streaming)...\n"));

            match dispatcher.stream(&device, payload).await {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.next().await {
                        if tx.send(chunk).is_err() {
                            break;
                        }
                    }
                    let _ = tx.send(Bytes::from_static(b"\n# done\n"));
                    let mut job = entry.lock().await;
                    job.status = JobStatus::Done;
                }
                Err(e) => {
                    let _ = tx.send(Bytes::from(format!("# error: {e}\n")));
                    let mut job = entry.lock().await;
                    job.status = JobStatus::Error;
                    job.error = Some(e.to_string());
                }
            }
            // Drop our sender clone so the receiver observes end-of-stream
            // once the worker's own clone (held on the record) is also gone.
            let mut job = entry.lock().await;
            job.stream_tx = None;
        } else {
            match dispatcher.post(&device, &payload).await {
                Ok(result) => {
                    let mut job = entry.lock().await;
                    job.result = Some(result);
                    job.status = JobStatus::Done;
                }
                Err(e) => {
                    let mut job = entry.lock().await;
                    job.error = Some(e.to_string());
                    job.status = JobStatus::Error;
                }
            }
        }

        let mut job = entry.lock().await;
        job.finished_at = Some(iso_now());
    }
}

pub enum JobOutcome {
    Done(Value),
    Pending(JobStatus),
}
