//! Main Router: owns the external sockets, classifies requests, and runs
//! the response proxy back to the wire.
//!
//! Implements the wiring spec.md section 4.8 describes. Each accepted TCP
//! connection on the router role gets its
//! own reader task (validates the envelope, classifies by opcode, forwards
//! to the right worker pool) and its own writer task (drains an outbound
//! channel — the per-connection slice of the "response proxy" — onto the
//! socket). No task other than a connection's own writer ever touches that
//! connection's socket, which is the invariant section 4.8 calls "confines
//! the external socket to a single task."

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::admin::AdminHandle;
use crate::jobs::router::AsyncJobRouter;
use crate::protocol::frame::{read_message, write_message};
use crate::protocol::header::{
    Opcode, FEATURE_ON_THE_FLY_TABLE_OPEN, FEATURE_SUPPORT_FULLSYNC, FEATURE_SUPPORT_PARTSYNC,
    STATUS_OK, WRITE_FLAG_PARTSYNC,
};
use crate::protocol::{Frame, Header};
use crate::workers::envelope::{OutgoingMessage, Reply, ReplyChannel, WorkItem};
use crate::workers::read::ReadWorkers;
use crate::workers::update::UpdateWorkers;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct MainRouter {
    read_workers: ReadWorkers,
    update_workers: UpdateWorkers,
    job_router: AsyncJobRouter,
    admin: AdminHandle,
    external_hwm: usize,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    next_conn_id: AtomicU64,
}

impl MainRouter {
    pub fn new(
        read_workers: ReadWorkers,
        update_workers: UpdateWorkers,
        job_router: AsyncJobRouter,
        admin: AdminHandle,
        external_hwm: usize,
    ) -> Self {
        MainRouter {
            read_workers,
            update_workers,
            job_router,
            admin,
            external_hwm,
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            next_conn_id: AtomicU64::new(0),
        }
    }

    /// Signals every task owned by this router to shut down. Matches the
    /// `StopServer` path: "ACK and set a global interrupt flag so the
    /// event loop exits" (spec.md 4.8).
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        let _ = self.update_workers.sender.send(WorkItem::shutdown()).await;
        let _ = self.read_workers.sender.send(WorkItem::shutdown()).await;
        let _ = self.job_router.sender.send(WorkItem::shutdown()).await;
        self.admin.stop().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Serves the request/reply (router) role on `addr` until `shutdown`
    /// is called.
    pub async fn serve_router_role(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "router role listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
                    info!(conn_id, %peer, "accepted router-role connection");
                    self.clone().spawn_router_connection(stream, conn_id);
                }
                _ = self.stop.notified() => {
                    info!("router role shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serves the pull (push/pull consumer) role on `addr`. No envelope;
    /// writes are processed unconditionally, reads are rejected.
    pub async fn serve_pull_role(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "pull role listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(%peer, "accepted pull-role connection");
                    self.clone().spawn_pull_connection(stream);
                }
                _ = self.stop.notified() => {
                    info!("pull role shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_router_connection(self: Arc<Self>, stream: TcpStream, conn_id: u64) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<OutgoingMessage>(self.external_hwm);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if write_message(&mut write_half, &message).await.is_err() {
                    break;
                }
            }
        });

        let router = self.clone();
        tokio::spawn(async move {
            let routing_id = Bytes::from(conn_id.to_le_bytes().to_vec());
            loop {
                match read_message(&mut read_half).await {
                    Ok(Some(frames)) => {
                        router.handle_router_message(frames, routing_id.clone(), &out_tx).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn_id, error = %e, "router-role connection read error");
                        break;
                    }
                }
                if router.is_stopped() {
                    break;
                }
            }
        });
    }

    fn spawn_pull_connection(self: Arc<Self>, stream: TcpStream) {
        let (mut read_half, _write_half) = stream.into_split();
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                match read_message(&mut read_half).await {
                    Ok(Some(frames)) => router.handle_pull_message(frames).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "pull-role connection read error");
                        break;
                    }
                }
                if router.is_stopped() {
                    break;
                }
            }
        });
    }

    async fn handle_router_message(
        &self,
        frames: Vec<Frame>,
        routing_id: Bytes,
        out_tx: &mpsc::Sender<OutgoingMessage>,
    ) {
        if frames.len() < 2 || !frames[1].is_empty() {
            let _ = out_tx
                .send(vec![
                    Frame::new(routing_id, true),
                    Frame::new(Bytes::new(), true),
                    Frame::last(Bytes::from_static(b"malformed envelope: expected empty delimiter frame")),
                ])
                .await;
            return;
        }
        let payload = frames[2..].to_vec();
        let reply_channel = ReplyChannel {
            routing_id,
            sender: out_tx.clone(),
        };
        self.dispatch(payload, Reply::Envelope(reply_channel)).await;
    }

    async fn handle_pull_message(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        // No reply envelope exists on this role, so dispatching with
        // `Reply::None` has the same net effect as the source's "rewrite
        // the status byte to 0x00 before forwarding": nothing is ever
        // written back to this connection.
        if let Ok(header) = Header::parse(&frames[0].data) {
            if matches!(header.opcode, Opcode::Read | Opcode::Count | Opcode::Exists | Opcode::Scan) {
                warn!(?header.opcode, "read-family request rejected on pull-role socket");
                return;
            }
        }
        self.dispatch(frames, Reply::None).await;
    }

    async fn dispatch(&self, frames: Vec<Frame>, reply: Reply) {
        let Some(header_frame) = frames.first() else {
            return;
        };
        let header = match Header::parse(&header_frame.data) {
            Ok(h) => h,
            Err(e) => {
                reply
                    .send(vec![
                        Frame::new(Bytes::from(vec![0x31, 0x01, 0xFF, 0x01]), true),
                        Frame::last(Bytes::from(e.to_string())),
                    ])
                    .await;
                return;
            }
        };

        match header.opcode {
            Opcode::ServerInfo => self.handle_server_info(&header, &reply).await,
            Opcode::StopServer => self.handle_stop(&header, &reply).await,
            Opcode::Read | Opcode::Exists | Opcode::Count | Opcode::Scan => {
                let _ = self.read_workers.sender.send(WorkItem { reply, frames }).await;
            }
            Opcode::Put | Opcode::Delete | Opcode::DeleteRange | Opcode::CopyRange => {
                self.dispatch_write(header, frames, reply).await;
            }
            Opcode::OpenTable | Opcode::CloseTable | Opcode::CompactTable | Opcode::TruncateTable => {
                let _ = self.update_workers.sender.send(WorkItem { reply, frames }).await;
            }
            other if other.is_async_job() => {
                let _ = self.job_router.sender.send(WorkItem { reply, frames }).await;
            }
            other => {
                warn!(?other, "unknown opcode");
                reply
                    .send(vec![Frame::last(header.response(other, 0x11))])
                    .await;
            }
        }
    }

    async fn dispatch_write(&self, header: Header, frames: Vec<Frame>, reply: Reply) {
        let partsync = header.flags_byte() & WRITE_FLAG_PARTSYNC != 0;
        if !partsync {
            // Acknowledge before the worker has processed the request
            // (spec.md 4.8 / section 9 Open Question a: ack first, log
            // failure). The worker itself replies to nobody.
            reply
                .send(vec![Frame::last(header.response(header.opcode, STATUS_OK))])
                .await;
            let _ = self
                .update_workers
                .sender
                .send(WorkItem {
                    reply: Reply::None,
                    frames,
                })
                .await;
        } else {
            let _ = self.update_workers.sender.send(WorkItem { reply, frames }).await;
        }
    }

    async fn handle_server_info(&self, header: &Header, reply: &Reply) {
        let flags = FEATURE_ON_THE_FLY_TABLE_OPEN | FEATURE_SUPPORT_PARTSYNC | FEATURE_SUPPORT_FULLSYNC;
        reply
            .send(vec![
                Frame::new(header.response(Opcode::ServerInfo, STATUS_OK), true),
                Frame::new(Bytes::from(flags.to_le_bytes().to_vec()), true),
                Frame::last(Bytes::from_static(SERVER_VERSION.as_bytes())),
            ])
            .await;
    }

    async fn handle_stop(&self, header: &Header, reply: &Reply) {
        reply
            .send(vec![Frame::last(header.response(Opcode::StopServer, STATUS_OK))])
            .await;
        self.shutdown().await;
    }
}
