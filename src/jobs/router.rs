//! Async Job Router.
//!
//! A single task owns an `apid -> PassiveScanJob` map so job lifecycle
//! (spawn, scrub, terminate) never races across tasks. Each job handle
//! already carries its own `TerminationInfo`/`JobStatistics`; a shared
//! `Arc<AtomicU64>` scrub counter threaded through every job's
//! `TerminationInfo` drives the periodic forced-scrub sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::admin::AdminHandle;
use crate::jobs::passive_scan::{self, PassiveScanJob, PassiveScanParams};
use crate::jobs::JobSignal;
use crate::protocol::header::{Opcode, STATUS_OK};
use crate::protocol::{Frame, FrameCursor, Header};
use crate::tablespace::Tablespace;
use crate::workers::envelope::{Reply, WorkItem};

use super::apid::ApidGenerator;

pub struct AsyncJobRouter {
    pub sender: mpsc::Sender<WorkItem>,
}

pub fn spawn(
    hwm: usize,
    tablespace: Arc<Tablespace>,
    admin: AdminHandle,
    apid_generator: Arc<ApidGenerator>,
    default_chunk_size: u32,
    grace_period: Duration,
    forced_scrub_interval: Duration,
) -> AsyncJobRouter {
    let (sender, receiver) = mpsc::channel(hwm);
    tokio::spawn(run(
        tablespace,
        admin,
        apid_generator,
        default_chunk_size,
        grace_period,
        forced_scrub_interval,
        receiver,
    ));
    AsyncJobRouter { sender }
}

async fn run(
    tablespace: Arc<Tablespace>,
    admin: AdminHandle,
    apid_generator: Arc<ApidGenerator>,
    default_chunk_size: u32,
    grace_period: Duration,
    forced_scrub_interval: Duration,
    mut receiver: mpsc::Receiver<WorkItem>,
) {
    let mut jobs: HashMap<u64, PassiveScanJob> = HashMap::new();
    let scrub_requests = Arc::new(AtomicU64::new(0));
    let mut forced_scrub = tokio::time::interval(forced_scrub_interval);

    loop {
        tokio::select! {
            item = receiver.recv() => {
                let Some(item) = item else { break };
                if item.is_shutdown() {
                    break;
                }
                if let Err(e) = handle_request(
                    &tablespace,
                    &admin,
                    &apid_generator,
                    default_chunk_size,
                    grace_period,
                    &scrub_requests,
                    &mut jobs,
                    item,
                ).await {
                    warn!(error = %e, "async job router request failed");
                }
                if scrub_requests.load(Ordering::SeqCst) > 0 {
                    scrub(&scrub_requests, &mut jobs);
                }
            }
            _ = forced_scrub.tick() => {
                scrub(&scrub_requests, &mut jobs);
            }
        }
    }

    for (_, job) in jobs.drain() {
        let _ = job.input.send(JobSignal::Shutdown).await;
        let _ = job.task.await;
    }
}

async fn handle_request(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    apid_generator: &ApidGenerator,
    default_chunk_size: u32,
    grace_period: Duration,
    scrub_requests: &Arc<AtomicU64>,
    jobs: &mut HashMap<u64, PassiveScanJob>,
    item: WorkItem,
) -> Result<(), crate::error::ProtocolError> {
    let mut cursor = FrameCursor::new(item.frames.clone());
    let header_frame = cursor.require_frame("header")?;
    let header = Header::parse(&header_frame.data)?;

    match header.opcode {
        Opcode::ClientSidePassiveInit => {
            handle_init(tablespace, admin, apid_generator, default_chunk_size, grace_period, scrub_requests, jobs, &header, &mut cursor, &item.reply).await?
        }
        Opcode::ClientDataRequest => handle_pull(jobs, &header, &mut cursor, &item.reply).await?,
        Opcode::ForwardRangeToSocket | Opcode::ServerSideTableSinkedMapInit => {
            item.reply
                .send(vec![
                    Frame::new(header.response(header.opcode, 0x11), true),
                    Frame::last(bytes::Bytes::from_static(b"not implemented")),
                ])
                .await;
        }
        other => {
            warn!(?other, "opcode routed to async job router that it cannot handle");
            item.reply
                .send(vec![Frame::last(header.response(other, 0x11))])
                .await;
        }
    }
    Ok(())
}

async fn handle_init(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    apid_generator: &ApidGenerator,
    default_chunk_size: u32,
    grace_period: Duration,
    scrub_requests: &Arc<AtomicU64>,
    jobs: &mut HashMap<u64, PassiveScanJob>,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let chunk_size = cursor.parse_u32("chunk size", default_chunk_size)?;
    let scan_limit = cursor.parse_u64("scan limit", u64::MAX)?;
    let (start, end) = cursor.parse_range()?;

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::ClientSidePassiveInit, 0x10))])
                .await;
            return Ok(());
        }
    };

    let apid = match apid_generator.allocate().await {
        Ok(apid) => apid,
        Err(e) => {
            warn!(error = %e, "failed to allocate apid");
            reply
                .send(vec![Frame::last(header.response(Opcode::ClientSidePassiveInit, 0x10))])
                .await;
            return Ok(());
        }
    };

    let job = passive_scan::spawn(
        slot,
        PassiveScanParams {
            chunk_size,
            scan_limit,
            start,
            end,
        },
        scrub_requests.clone(),
        grace_period,
    );
    jobs.insert(apid, job);

    reply
        .send(vec![
            Frame::new(header.response(Opcode::ClientSidePassiveInit, STATUS_OK), true),
            Frame::last(bytes::Bytes::from(apid.to_le_bytes().to_vec())),
        ])
        .await;
    Ok(())
}

async fn handle_pull(
    jobs: &HashMap<u64, PassiveScanJob>,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &Reply,
) -> Result<(), crate::error::ProtocolError> {
    let apid = cursor.parse_u64("apid", 0)?;

    let job = jobs.get(&apid).filter(|job| !job.termination_info.wants_to_terminate());
    match job {
        Some(job) => {
            let _ = job.input.send(JobSignal::Pull(reply.clone())).await;
        }
        None => {
            reply
                .send(vec![Frame::last(header.response(Opcode::ClientDataRequest, 0x01))])
                .await;
        }
    }
    Ok(())
}

fn scrub(scrub_requests: &Arc<AtomicU64>, jobs: &mut HashMap<u64, PassiveScanJob>) {
    let pending = scrub_requests.swap(0, Ordering::SeqCst);
    if pending == 0 {
        return;
    }
    let terminated: Vec<u64> = jobs
        .iter()
        .filter(|(_, job)| job.termination_info.has_terminated())
        .map(|(apid, _)| *apid)
        .collect();
    for apid in terminated {
        if let Some(job) = jobs.remove(&apid) {
            info!(apid, "scrubbing terminated job");
            tokio::spawn(async move {
                let _ = job.task.await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, MemEngine, MemEngineFactory, WriteBatch, WriteOp};
    use crate::merge_ops::MergeOperator;
    use crate::tablespace::TableSlot;
    use bytes::Bytes;
    use tokio::sync::mpsc as tmpsc;

    fn header_bytes(opcode: Opcode) -> Bytes {
        Bytes::from(vec![0x31, 0x01, opcode.to_byte()])
    }

    fn make_admin_for(tablespace: Arc<Tablespace>) -> AdminHandle {
        let factory: Arc<dyn EngineFactory> = Arc::new(MemEngineFactory);
        crate::admin::spawn(
            tablespace,
            factory,
            std::env::temp_dir().join(format!("job-router-test-{}", std::process::id())),
            crate::config::ServerConfig::default().default_table_options,
        )
    }

    async fn table_with(pairs: &[(&str, &str)]) -> Tablespace {
        let tablespace = Tablespace::new();
        let engine = Arc::new(MemEngine::new());
        let mut batch = WriteBatch::default();
        for (k, v) in pairs {
            batch.ops.push(WriteOp::Put(
                Bytes::copy_from_slice(k.as_bytes()),
                Bytes::copy_from_slice(v.as_bytes()),
            ));
        }
        engine.write(batch, &MergeOperator::Replace).unwrap();
        tablespace
            .insert(
                1,
                TableSlot {
                    engine,
                    merge_operator: MergeOperator::Replace,
                },
            )
            .await;
        tablespace
    }

    #[tokio::test]
    async fn init_then_pull_returns_chunked_data() {
        let dir = tempfile::tempdir().unwrap();
        let tablespace = Arc::new(table_with(&[("a", "1"), ("b", "2")]).await);
        let admin = make_admin_for(tablespace.clone());
        let apid_generator = Arc::new(ApidGenerator::load(dir.path().join("next-apid")).await.unwrap());
        let router = spawn(16, tablespace, admin, apid_generator, 1000, Duration::from_millis(50), Duration::from_secs(30));

        let (tx, mut rx) = tmpsc::channel(1);
        let reply = Reply::Envelope(crate::workers::envelope::ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx,
        });
        let mut frames = vec![Frame::new(header_bytes(Opcode::ClientSidePassiveInit), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::last(Bytes::new()));
        router.sender.send(WorkItem { reply, frames }).await.unwrap();

        let init_reply = rx.recv().await.unwrap();
        let apid = u64::from_le_bytes(init_reply[3].data[..].try_into().unwrap());
        assert_eq!(apid, 0);

        let (tx2, mut rx2) = tmpsc::channel(1);
        let pull_reply = Reply::Envelope(crate::workers::envelope::ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx2,
        });
        let mut pull_frames = vec![Frame::new(header_bytes(Opcode::ClientDataRequest), true)];
        pull_frames.push(Frame::last(Bytes::from(apid.to_le_bytes().to_vec())));
        router
            .sender
            .send(WorkItem {
                reply: pull_reply,
                frames: pull_frames,
            })
            .await
            .unwrap();

        let pull_response = rx2.recv().await.unwrap();
        assert_eq!(pull_response[2].data[3], 0x00); // status OK/full chunk
    }

    #[tokio::test]
    async fn pull_on_unknown_apid_replies_no_more_data() {
        let dir = tempfile::tempdir().unwrap();
        let tablespace = Arc::new(Tablespace::new());
        let admin = make_admin_for(tablespace.clone());
        let apid_generator = Arc::new(ApidGenerator::load(dir.path().join("next-apid")).await.unwrap());
        let router = spawn(16, tablespace, admin, apid_generator, 1000, Duration::from_millis(50), Duration::from_secs(30));

        let (tx, mut rx) = tmpsc::channel(1);
        let reply = Reply::Envelope(crate::workers::envelope::ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx,
        });
        let mut frames = vec![Frame::new(header_bytes(Opcode::ClientDataRequest), true)];
        frames.push(Frame::last(999u64.to_le_bytes().to_vec()));
        router.sender.send(WorkItem { reply, frames }).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response[2].data[3], 0x01);
    }

    #[tokio::test]
    async fn init_auto_opens_an_unopened_table() {
        let dir = tempfile::tempdir().unwrap();
        let tablespace = Arc::new(Tablespace::new());
        let admin = make_admin_for(tablespace.clone());
        assert!(!tablespace.is_table_open(1).await);
        let apid_generator = Arc::new(ApidGenerator::load(dir.path().join("next-apid")).await.unwrap());
        let router = spawn(16, tablespace.clone(), admin, apid_generator, 1000, Duration::from_millis(50), Duration::from_secs(30));

        let (tx, mut rx) = tmpsc::channel(1);
        let reply = Reply::Envelope(crate::workers::envelope::ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx,
        });
        let mut frames = vec![Frame::new(header_bytes(Opcode::ClientSidePassiveInit), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::last(Bytes::new()));
        router.sender.send(WorkItem { reply, frames }).await.unwrap();

        let init_reply = rx.recv().await.unwrap();
        assert_eq!(init_reply[2].data[3], STATUS_OK);
        assert!(tablespace.is_table_open(1).await);
    }
}
