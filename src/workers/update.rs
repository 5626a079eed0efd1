//! Update worker pool: Put/Delete/DeleteRange/CopyRange/Compact plus the
//! Open/Close/Truncate proxy to the Table-Admin Server.
//!
//! A configurable number of tasks share one inbound `mpsc::Receiver` behind
//! a tokio mutex (tokio channels don't support multiple consumers directly,
//! so the mutex-guarded receiver is the idiomatic stand-in for "N tasks
//! competing for the same queue").
//!
//! A deliberate design decision, recorded in DESIGN.md:
//! - the copy-source loop iterates the source
//!   table, matching spec.md's stated semantics ("iterates source and
//!   Puts/Merges into target").

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::admin::AdminHandle;
use crate::engine::{WriteBatch, WriteOp};
use crate::error::EngineError;
use crate::protocol::header::{
    Opcode, STATUS_DB_ERROR, STATUS_OK, WRITE_FLAG_FULLSYNC,
};
use crate::protocol::{Frame, FrameCursor, Header};
use crate::tablespace::Tablespace;
use crate::workers::envelope::WorkItem;

pub struct UpdateWorkers {
    pub sender: tokio::sync::mpsc::Sender<WorkItem>,
}

pub fn spawn(
    pool_size: usize,
    hwm: usize,
    tablespace: Arc<Tablespace>,
    admin: AdminHandle,
    put_batch_size: usize,
) -> UpdateWorkers {
    let (sender, receiver) = tokio::sync::mpsc::channel(hwm);
    let receiver = Arc::new(Mutex::new(receiver));
    for id in 0..pool_size {
        let receiver = receiver.clone();
        let tablespace = tablespace.clone();
        let admin = admin.clone();
        tokio::spawn(worker_loop(id, receiver, tablespace, admin, put_batch_size));
    }
    UpdateWorkers { sender }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<tokio::sync::mpsc::Receiver<WorkItem>>>,
    tablespace: Arc<Tablespace>,
    admin: AdminHandle,
    put_batch_size: usize,
) {
    loop {
        let item = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some(item) = item else {
            break;
        };
        if item.is_shutdown() {
            break;
        }
        if let Err(e) = process(&tablespace, &admin, put_batch_size, &item).await {
            warn!(worker_id, error = %e, "update worker request failed");
        }
    }
}

async fn process(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    put_batch_size: usize,
    item: &WorkItem,
) -> Result<(), crate::error::ProtocolError> {
    let mut cursor = FrameCursor::new(item.frames.clone());
    let header_frame = cursor.require_frame("header")?;
    let header = Header::parse(&header_frame.data)?;

    match header.opcode {
        Opcode::Put => handle_put(tablespace, admin, &header, &mut cursor, &item.reply, put_batch_size).await?,
        Opcode::Delete => handle_delete(tablespace, admin, &header, &mut cursor, &item.reply).await?,
        Opcode::DeleteRange => handle_delete_range(tablespace, admin, &header, &mut cursor, &item.reply).await?,
        Opcode::CopyRange => handle_copy_range(tablespace, admin, &header, &mut cursor, &item.reply).await?,
        Opcode::CompactTable => handle_compact(tablespace, admin, &header, &mut cursor, &item.reply).await?,
        Opcode::OpenTable => handle_open(admin, &header, &mut cursor, &item.reply).await?,
        Opcode::CloseTable => handle_close(admin, &header, &mut cursor, &item.reply).await?,
        Opcode::TruncateTable => handle_truncate(admin, &header, &mut cursor, &item.reply).await?,
        other => {
            error!(?other, "opcode routed to update worker that it cannot handle");
            item.reply
                .send(vec![Frame::last(header.response(other, 0x11))])
                .await;
        }
    }
    Ok(())
}

fn engine_error_response(header: &Header, response_opcode: Opcode, e: &EngineError) -> Vec<Frame> {
    vec![
        Frame::new(header.response(response_opcode, STATUS_DB_ERROR), true),
        Frame::last(Bytes::from(e.to_string())),
    ]
}

async fn handle_put(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
    put_batch_size: usize,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let pairs = cursor.parse_key_value_pairs()?;

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Put, STATUS_DB_ERROR))])
                .await;
            return Ok(());
        }
    };

    let fullsync = header.flags_byte() & WRITE_FLAG_FULLSYNC != 0;
    let merge_required = tablespace.is_merge_required(table_id).await;

    let mut batch = WriteBatch {
        fullsync,
        ..Default::default()
    };
    for (key, value) in pairs {
        if key.is_empty() && value.is_empty() {
            continue;
        }
        batch.ops.push(if merge_required {
            WriteOp::Merge(key, value)
        } else {
            WriteOp::Put(key, value)
        });
        if batch.ops.len() >= put_batch_size {
            if let Err(e) = slot.engine.write(std::mem::take(&mut batch), &slot.merge_operator) {
                reply.send(engine_error_response(header, Opcode::Put, &e)).await;
                return Ok(());
            }
            batch.fullsync = fullsync;
        }
    }
    if !batch.is_empty() {
        if let Err(e) = slot.engine.write(batch, &slot.merge_operator) {
            reply.send(engine_error_response(header, Opcode::Put, &e)).await;
            return Ok(());
        }
    }
    reply
        .send(vec![Frame::last(header.response(Opcode::Put, STATUS_OK))])
        .await;
    Ok(())
}

async fn handle_delete(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let keys = cursor.parse_remaining();

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Delete, STATUS_DB_ERROR))])
                .await;
            return Ok(());
        }
    };

    let batch = WriteBatch {
        ops: keys.into_iter().map(WriteOp::Delete).collect(),
        fullsync: false,
    };
    match slot.engine.write(batch, &slot.merge_operator) {
        Ok(()) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Delete, STATUS_OK))])
                .await
        }
        Err(e) => reply.send(engine_error_response(header, Opcode::Delete, &e)).await,
    }
    Ok(())
}

async fn handle_delete_range(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let limit = cursor.parse_u64("limit", u64::MAX)?;
    let (start, end) = cursor.parse_range()?;

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::DeleteRange, STATUS_DB_ERROR))])
                .await;
            return Ok(());
        }
    };

    let snapshot = match slot.engine.snapshot() {
        Ok(s) => s,
        Err(e) => {
            reply.send(engine_error_response(header, Opcode::DeleteRange, &e)).await;
            return Ok(());
        }
    };
    let mut it = snapshot.iter();
    if start.is_empty() {
        it.seek_to_first();
    } else {
        it.seek(&start);
    }

    let mut batch = WriteBatch::default();
    let mut remaining = limit;
    while it.valid() && remaining > 0 {
        let key = it.key();
        if !end.is_empty() && key.as_ref() >= end.as_ref() {
            break;
        }
        batch.ops.push(WriteOp::Delete(key));
        remaining -= 1;
        it.step_next();
    }

    match slot.engine.write(batch, &slot.merge_operator) {
        Ok(()) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::DeleteRange, STATUS_OK))])
                .await
        }
        Err(e) => reply.send(engine_error_response(header, Opcode::DeleteRange, &e)).await,
    }
    Ok(())
}

async fn handle_copy_range(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let src_table = cursor.parse_u32("source table id", 0)?;
    let dst_table = cursor.parse_u32("target table id", 0)?;
    let limit = cursor.parse_u64("limit", u64::MAX)?;
    let (start, end) = cursor.parse_range()?;

    let (Ok(src_slot), Ok(dst_slot)) = (
        tablespace.get_or_open(src_table, admin).await,
        tablespace.get_or_open(dst_table, admin).await,
    ) else {
        reply
            .send(vec![Frame::last(header.response(Opcode::CopyRange, STATUS_DB_ERROR))])
            .await;
        return Ok(());
    };

    let snapshot = match src_slot.engine.snapshot() {
        Ok(s) => s,
        Err(e) => {
            reply.send(engine_error_response(header, Opcode::CopyRange, &e)).await;
            return Ok(());
        }
    };
    let mut it = snapshot.iter();
    if start.is_empty() {
        it.seek_to_first();
    } else {
        it.seek(&start);
    }

    let dst_merge_required = tablespace.is_merge_required(dst_table).await;
    let mut batch = WriteBatch::default();
    let mut remaining = limit;
    while it.valid() && remaining > 0 {
        let key = it.key();
        if !end.is_empty() && key.as_ref() >= end.as_ref() {
            break;
        }
        let value = it.value();
        batch.ops.push(if dst_merge_required {
            WriteOp::Merge(key, value)
        } else {
            WriteOp::Put(key, value)
        });
        remaining -= 1;
        it.step_next();
    }

    match dst_slot.engine.write(batch, &dst_slot.merge_operator) {
        Ok(()) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::CopyRange, STATUS_OK))])
                .await
        }
        Err(e) => reply.send(engine_error_response(header, Opcode::CopyRange, &e)).await,
    }
    Ok(())
}

async fn handle_compact(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let (start, end) = cursor.parse_range()?;

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::CompactTable, STATUS_DB_ERROR))])
                .await;
            return Ok(());
        }
    };

    let start_opt = (!start.is_empty()).then_some(start.as_ref());
    let end_opt = (!end.is_empty()).then_some(end.as_ref());
    match slot.engine.compact_range(start_opt, end_opt) {
        Ok(()) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::CompactTable, STATUS_OK))])
                .await
        }
        Err(e) => reply.send(engine_error_response(header, Opcode::CompactTable, &e)).await,
    }
    Ok(())
}

async fn handle_open(
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let options = cursor.parse_string_map()?;
    let result = admin.open(table_id, options).await;
    reply.send(admin_response(header, Opcode::OpenTable, result)).await;
    Ok(())
}

async fn handle_close(
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let result = admin.close(table_id).await;
    reply.send(admin_response(header, Opcode::CloseTable, result)).await;
    Ok(())
}

async fn handle_truncate(
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) -> Result<(), crate::error::ProtocolError> {
    let table_id = cursor.parse_u32("table id", 0)?;
    let result = admin.truncate(table_id).await;
    reply.send(admin_response(header, Opcode::TruncateTable, result)).await;
    Ok(())
}

fn admin_response(header: &Header, opcode: Opcode, result: crate::admin::AdminReply) -> Vec<Frame> {
    let response_header = header.response(opcode, result.status);
    match result.description {
        Some(description) => vec![
            Frame::new(response_header, true),
            Frame::last(Bytes::from(description)),
        ],
        None => vec![Frame::last(response_header)],
    }
}
