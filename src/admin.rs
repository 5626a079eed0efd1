//! Table-Admin Server: a single task serializing Open/Close/Truncate.
//!
//! One task consuming admin requests serially so engine-option assembly
//! and directory manipulation never race (spec.md 4.3). Each request gets
//! a `tokio::sync::oneshot` reply channel, the same request/response
//! framing pattern used elsewhere in this crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::engine::{table_dir, EngineFactory, TableOptions};
use crate::merge_ops::MergeOperator;
use crate::protocol::header::{STATUS_DB_ERROR, STATUS_GENERIC_ERROR, STATUS_OK};
use crate::table_config::{resolve_and_persist, PartialTableOptions};
use crate::tablespace::{TableSlot, Tablespace};

pub enum AdminOp {
    Open {
        table_id: u32,
        options: HashMap<String, String>,
    },
    Close {
        table_id: u32,
    },
    Truncate {
        table_id: u32,
    },
    Stop,
}

/// Result of an admin operation. `status` follows spec.md 4.3's byte codes
/// (`0x00` success, `0x01` no action needed, `0x10` engine error, `0x11`
/// unknown request); `description` is set alongside `0x10`.
pub struct AdminReply {
    pub status: u8,
    pub description: Option<String>,
}

impl AdminReply {
    fn ok() -> Self {
        AdminReply {
            status: STATUS_OK,
            description: None,
        }
    }

    fn no_action() -> Self {
        AdminReply {
            status: STATUS_GENERIC_ERROR,
            description: None,
        }
    }

    fn engine_error(message: impl Into<String>) -> Self {
        AdminReply {
            status: STATUS_DB_ERROR,
            description: Some(message.into()),
        }
    }
}

struct AdminRequest {
    op: AdminOp,
    reply: oneshot::Sender<AdminReply>,
}

/// Handle workers/router use to submit admin requests. Cloning shares the
/// same underlying channel to the single admin task.
#[derive(Clone)]
pub struct AdminHandle {
    sender: mpsc::Sender<AdminRequest>,
}

impl AdminHandle {
    async fn call(&self, op: AdminOp) -> AdminReply {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(AdminRequest { op, reply }).await.is_err() {
            return AdminReply::engine_error("admin server is not running");
        }
        rx.await
            .unwrap_or_else(|_| AdminReply::engine_error("admin server dropped the reply"))
    }

    pub async fn open(&self, table_id: u32, options: HashMap<String, String>) -> AdminReply {
        self.call(AdminOp::Open { table_id, options }).await
    }

    pub async fn close(&self, table_id: u32) -> AdminReply {
        self.call(AdminOp::Close { table_id }).await
    }

    pub async fn truncate(&self, table_id: u32) -> AdminReply {
        self.call(AdminOp::Truncate { table_id }).await
    }

    pub async fn stop(&self) {
        let _ = self.call(AdminOp::Stop).await;
    }
}

/// Spawns the admin task and returns a handle to it.
pub fn spawn(
    tablespace: Arc<Tablespace>,
    factory: Arc<dyn EngineFactory>,
    data_dir: PathBuf,
    process_default: TableOptions,
) -> AdminHandle {
    let (sender, receiver) = mpsc::channel(64);
    tokio::spawn(run(tablespace, factory, data_dir, process_default, receiver));
    AdminHandle { sender }
}

async fn run(
    tablespace: Arc<Tablespace>,
    factory: Arc<dyn EngineFactory>,
    data_dir: PathBuf,
    process_default: TableOptions,
    mut receiver: mpsc::Receiver<AdminRequest>,
) {
    while let Some(request) = receiver.recv().await {
        let stop = matches!(request.op, AdminOp::Stop);
        let reply = handle(&tablespace, &factory, &data_dir, &process_default, request.op).await;
        let _ = request.reply.send(reply);
        if stop {
            info!("admin server stopping");
            break;
        }
    }
}

async fn handle(
    tablespace: &Tablespace,
    factory: &Arc<dyn EngineFactory>,
    data_dir: &std::path::Path,
    process_default: &TableOptions,
    op: AdminOp,
) -> AdminReply {
    match op {
        AdminOp::Stop => AdminReply::ok(),
        AdminOp::Open { table_id, options } => {
            open_table(tablespace, factory, data_dir, process_default, table_id, options).await
        }
        AdminOp::Close { table_id } => {
            if tablespace.remove(table_id).await.is_some() {
                AdminReply::ok()
            } else {
                AdminReply::no_action()
            }
        }
        AdminOp::Truncate { table_id } => truncate_table(tablespace, factory, data_dir, table_id).await,
    }
}

async fn open_table(
    tablespace: &Tablespace,
    factory: &Arc<dyn EngineFactory>,
    data_dir: &std::path::Path,
    process_default: &TableOptions,
    table_id: u32,
    options: HashMap<String, String>,
) -> AdminReply {
    if tablespace.is_table_open(table_id).await {
        return AdminReply::no_action();
    }

    let dir = table_dir(data_dir, table_id);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return AdminReply::engine_error(format!("failed to create table directory: {e}"));
    }
    let config_path = dir.with_extension("cfg");

    let requested = PartialTableOptions::from_string_map(&options);
    let resolved = match resolve_and_persist(&config_path, requested, process_default).await {
        Ok(resolved) => resolved,
        Err(e) => return AdminReply::engine_error(format!("failed to persist table config: {e}")),
    };

    let handle = match factory.open(&dir, &resolved) {
        Ok(handle) => handle,
        Err(e) => return AdminReply::engine_error(e.to_string()),
    };

    let slot = TableSlot {
        engine: handle,
        merge_operator: MergeOperator::from_repr(resolved.merge_operator_code),
    };
    if tablespace.insert(table_id, slot).await {
        AdminReply::ok()
    } else {
        // Lost a race against a concurrent Open for the same table-id: the
        // admin task is single-threaded so this should be unreachable, but
        // treat it the same as "already open" rather than panic.
        warn!(table_id, "table was opened concurrently");
        AdminReply::no_action()
    }
}

async fn truncate_table(
    tablespace: &Tablespace,
    factory: &Arc<dyn EngineFactory>,
    data_dir: &std::path::Path,
    table_id: u32,
) -> AdminReply {
    if tablespace.remove(table_id).await.is_none() {
        return AdminReply::no_action();
    }
    let dir = table_dir(data_dir, table_id);
    if let Err(e) = factory.destroy(&dir) {
        return AdminReply::engine_error(e.to_string());
    }
    let config_path = dir.with_extension("cfg");
    let _ = tokio::fs::remove_file(&config_path).await;
    AdminReply::ok()
}
