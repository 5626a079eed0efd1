//! Passive scan job: a dedicated task per APID.
//!
//! A deliberate seek-semantics decision, recorded in DESIGN.md: this job
//! seeks to `range_start` whenever it is non-empty, matching the
//! synchronous scan path in `workers::read`. A passive job and a
//! synchronous Scan over the same range must agree on what "the range"
//! means, so the two paths share one seek rule rather than each picking
//! its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::engine::EngineIterator;
use crate::protocol::header::{MAGIC_BYTE, PROTOCOL_VERSION};
use crate::protocol::{header::Opcode, Frame};
use crate::tablespace::TableSlot;
use crate::workers::envelope::Reply;

use super::{JobSignal, JobStatistics, TerminationInfo};

const STATUS_FULL: u8 = 0x00;
const STATUS_NO_DATA: u8 = 0x01;
const STATUS_PARTIAL: u8 = 0x02;

pub struct PassiveScanParams {
    pub chunk_size: u32,
    pub scan_limit: u64,
    pub start: Bytes,
    pub end: Bytes,
}

pub struct PassiveScanJob {
    pub input: mpsc::Sender<JobSignal>,
    pub termination_info: Arc<TerminationInfo>,
    pub statistics: Arc<JobStatistics>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Spawns a passive scan job task bound to `slot`, returning a handle the
/// job router retains in its `apid -> job` map.
pub fn spawn(
    slot: TableSlot,
    params: PassiveScanParams,
    scrub_requests: Arc<AtomicU64>,
    grace_period: Duration,
) -> PassiveScanJob {
    let termination_info = TerminationInfo::new(scrub_requests);
    let statistics = Arc::new(JobStatistics::default());
    let (input_tx, input_rx) = mpsc::channel(16);

    let task_termination_info = termination_info.clone();
    let task_statistics = statistics.clone();
    let task = tokio::spawn(run(
        slot,
        params,
        input_rx,
        task_termination_info,
        task_statistics,
        grace_period,
    ));

    PassiveScanJob {
        input: input_tx,
        termination_info,
        statistics,
        task,
    }
}

fn status_header(status: u8) -> Bytes {
    Bytes::from(vec![MAGIC_BYTE, PROTOCOL_VERSION, Opcode::ClientDataRequest.to_byte(), status])
}

async fn run(
    slot: TableSlot,
    params: PassiveScanParams,
    mut input: mpsc::Receiver<JobSignal>,
    termination_info: Arc<TerminationInfo>,
    statistics: Arc<JobStatistics>,
    grace_period: Duration,
) {
    let snapshot = match slot.engine.snapshot() {
        Ok(s) => s,
        Err(_) => {
            termination_info.set_terminated();
            return;
        }
    };
    let mut it = snapshot.iter();
    if params.start.is_empty() {
        it.seek_to_first();
    } else {
        it.seek(&params.start);
    }

    let mut remaining_limit = params.scan_limit;

    loop {
        let signal = match input.recv().await {
            Some(signal) => signal,
            None => break,
        };
        let reply = match signal {
            JobSignal::Shutdown => break,
            JobSignal::Pull(reply) => reply,
        };

        let mut pairs = Vec::new();
        while pairs.len() < params.chunk_size as usize && remaining_limit > 0 && it.valid() {
            let key = it.key();
            if !params.end.is_empty() && key.as_ref() >= params.end.as_ref() {
                break;
            }
            let value = it.value();
            statistics.record((key.len() + value.len()) as u64, 1);
            pairs.push((key, value));
            remaining_limit -= 1;
            it.step_next();
        }

        let short = pairs.len() < params.chunk_size as usize;
        let status = if pairs.is_empty() {
            STATUS_NO_DATA
        } else if short {
            STATUS_PARTIAL
        } else {
            STATUS_FULL
        };

        let mut frames = vec![Frame::new(status_header(status), !pairs.is_empty())];
        let last = pairs.len().saturating_sub(1);
        for (i, (key, value)) in pairs.into_iter().enumerate() {
            frames.push(Frame::new(key, true));
            frames.push(Frame::new(value, i != last));
        }
        reply.send(frames).await;

        if short {
            break;
        }
    }

    terminate(termination_info, input, grace_period).await;
}

/// Two-phase shutdown: signal intent, drain any pulls that arrive during a
/// bounded grace period with `NoData`, then mark fully terminated.
async fn terminate(
    termination_info: Arc<TerminationInfo>,
    mut input: mpsc::Receiver<JobSignal>,
    grace_period: Duration,
) {
    termination_info.set_wants_to_terminate();

    let deadline = tokio::time::Instant::now() + grace_period;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, input.recv()).await {
            Ok(Some(JobSignal::Pull(reply))) => {
                reply
                    .send(vec![Frame::last(status_header(STATUS_NO_DATA))])
                    .await;
            }
            Ok(Some(JobSignal::Shutdown)) | Ok(None) => break,
            Err(_) => break,
        }
    }

    termination_info.set_terminated();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemEngine, WriteBatch, WriteOp};
    use crate::merge_ops::MergeOperator;
    use crate::workers::envelope::ReplyChannel;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::mpsc as tmpsc;

    fn slot_with(pairs: &[(&str, &str)]) -> TableSlot {
        let engine = Arc::new(MemEngine::new());
        let mut batch = WriteBatch::default();
        for (k, v) in pairs {
            batch.ops.push(WriteOp::Put(
                Bytes::copy_from_slice(k.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            ));
        }
        engine.write(batch, &MergeOperator::Replace).unwrap();
        TableSlot {
            engine,
            merge_operator: MergeOperator::Replace,
        }
    }

    async fn pull(job: &PassiveScanJob) -> Vec<Frame> {
        let (tx, mut rx) = tmpsc::channel(1);
        let reply = Reply::Envelope(ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx,
        });
        job.input.send(JobSignal::Pull(reply)).await.unwrap();
        let mut message = rx.recv().await.unwrap();
        message.drain(0..2);
        message
    }

    #[tokio::test]
    async fn scenario_passive_scan_job_chunked_pulls() {
        let slot = slot_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let job = spawn(
            slot,
            PassiveScanParams {
                chunk_size: 2,
                scan_limit: u64::MAX,
                start: Bytes::from_static(b"a"),
                end: Bytes::from_static(b"z"),
            },
            Arc::new(AtomicU64::new(0)),
            Duration::from_millis(50),
        );

        let first = pull(&job).await;
        assert_eq!(first[0].data[3], STATUS_FULL);
        assert_eq!(&first[1].data[..], b"a");
        assert_eq!(&first[3].data[..], b"b");

        let second = pull(&job).await;
        assert_eq!(second[0].data[3], STATUS_PARTIAL);
        assert_eq!(&second[1].data[..], b"c");

        let third = pull(&job).await;
        assert_eq!(third[0].data[3], STATUS_NO_DATA);
        assert_eq!(third.len(), 1);

        job.task.await.unwrap();
        assert!(job.termination_info.has_terminated());
    }

    #[tokio::test]
    async fn grace_period_drains_pending_pulls_with_no_data() {
        let slot = slot_with(&[("a", "1")]);
        let job = spawn(
            slot,
            PassiveScanParams {
                chunk_size: 100,
                scan_limit: u64::MAX,
                start: Bytes::new(),
                end: Bytes::new(),
            },
            Arc::new(AtomicU64::new(0)),
            Duration::from_millis(50),
        );

        // First pull drains the whole table and is a short/final chunk,
        // putting the job straight into its grace period.
        let first = pull(&job).await;
        assert_eq!(first[0].data[3], STATUS_PARTIAL);

        // A pull arriving during the grace period still gets a definitive
        // reply rather than hanging.
        let (tx, mut rx) = tmpsc::channel(1);
        let reply = Reply::Envelope(ReplyChannel {
            routing_id: Bytes::from_static(b"c2"),
            sender: tx,
        });
        let _ = job.input.send(JobSignal::Pull(reply)).await;
        if let Ok(Some(message)) = timeout(Duration::from_millis(200), rx.recv()).await {
            assert_eq!(message[2].data[3], STATUS_NO_DATA);
        }

        job.task.await.unwrap();
        assert!(job.termination_info.has_terminated());
    }
}
