//! Read worker pool: Read/Exists/Count/Scan.
//!
//! A streaming implementation would pipeline "send previous response frame,
//! buffer current" so only the genuinely-last frame of a multi-frame reply
//! omits more-follows; since here a whole reply is built as a `Vec<Frame>`
//! before being handed to `Reply::send` (which itself corrects the last
//! frame's more-bit, see `protocol::frame::write_message`), that pipelining
//! isn't needed — the simplification is noted in DESIGN.md.

use bytes::Bytes;

use crate::admin::AdminHandle;
use crate::boyer_moore::Searcher;
use crate::protocol::header::{Opcode, SCAN_FLAG_REVERSE, STATUS_DB_ERROR, STATUS_OK};
use crate::protocol::{Frame, FrameCursor, Header};
use crate::tablespace::Tablespace;
use crate::workers::envelope::WorkItem;

pub struct ReadWorkers {
    pub sender: tokio::sync::mpsc::Sender<WorkItem>,
}

pub fn spawn(
    pool_size: usize,
    hwm: usize,
    tablespace: std::sync::Arc<Tablespace>,
    admin: AdminHandle,
) -> ReadWorkers {
    let (sender, receiver) = tokio::sync::mpsc::channel(hwm);
    let receiver = std::sync::Arc::new(tokio::sync::Mutex::new(receiver));
    for id in 0..pool_size {
        let receiver = receiver.clone();
        let tablespace = tablespace.clone();
        let admin = admin.clone();
        tokio::spawn(worker_loop(id, receiver, tablespace, admin));
    }
    ReadWorkers { sender }
}

async fn worker_loop(
    worker_id: usize,
    receiver: std::sync::Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<WorkItem>>>,
    tablespace: std::sync::Arc<Tablespace>,
    admin: AdminHandle,
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
        if let Err(e) = process(&tablespace, &admin, &item).await {
            tracing::warn!(worker_id, error = %e, "read worker request failed");
        }
    }
}

async fn process(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    item: &WorkItem,
) -> Result<(), crate::error::ProtocolError> {
    let mut cursor = FrameCursor::new(item.frames.clone());
    let header_frame = cursor.require_frame("header")?;
    let header = Header::parse(&header_frame.data)?;

    match header.opcode {
        Opcode::Read => handle_read(tablespace, admin, &header, &mut cursor, &item.reply).await,
        Opcode::Exists => handle_exists(tablespace, admin, &header, &mut cursor, &item.reply).await,
        Opcode::Count => handle_count(tablespace, admin, &header, &mut cursor, &item.reply).await,
        Opcode::Scan => handle_scan(tablespace, admin, &header, &mut cursor, &item.reply).await,
        other => {
            tracing::error!(?other, "opcode routed to read worker that it cannot handle");
            item.reply
                .send(vec![Frame::last(header.response(other, 0x11))])
                .await;
        }
    }
    Ok(())
}

async fn handle_read(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) {
    let table_id = match cursor.parse_u32("table id", 0) {
        Ok(id) => id,
        Err(_) => return,
    };
    let keys = cursor.parse_remaining();

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Read, STATUS_DB_ERROR))])
                .await;
            return;
        }
    };

    let mut frames = vec![Frame::new(header.response(Opcode::Read, STATUS_OK), !keys.is_empty())];
    let last = keys.len().saturating_sub(1);
    for (i, key) in keys.into_iter().enumerate() {
        let value = slot.engine.get(&key).ok().flatten().unwrap_or_default();
        frames.push(Frame::new(value, i != last));
    }
    reply.send(frames).await;
}

async fn handle_exists(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) {
    let table_id = match cursor.parse_u32("table id", 0) {
        Ok(id) => id,
        Err(_) => return,
    };
    let keys = cursor.parse_remaining();

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Exists, STATUS_DB_ERROR))])
                .await;
            return;
        }
    };

    let mut frames = vec![Frame::new(header.response(Opcode::Exists, STATUS_OK), !keys.is_empty())];
    let last = keys.len().saturating_sub(1);
    for (i, key) in keys.into_iter().enumerate() {
        let exists = matches!(slot.engine.get(&key), Ok(Some(_)));
        frames.push(Frame::new(
            Bytes::from_static(if exists { &[0x01] } else { &[0x00] }),
            i != last,
        ));
    }
    reply.send(frames).await;
}

async fn handle_count(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) {
    let table_id = match cursor.parse_u32("table id", 0) {
        Ok(id) => id,
        Err(_) => return,
    };
    let (start, end) = match cursor.parse_range() {
        Ok(r) => r,
        Err(_) => return,
    };

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Count, STATUS_DB_ERROR))])
                .await;
            return;
        }
    };

    let snapshot = match slot.engine.snapshot() {
        Ok(s) => s,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Count, STATUS_DB_ERROR))])
                .await;
            return;
        }
    };
    let mut it = snapshot.iter();
    if start.is_empty() {
        it.seek_to_first();
    } else {
        it.seek(&start);
    }
    let mut count: u64 = 0;
    while it.valid() {
        if !end.is_empty() && it.key().as_ref() >= end.as_ref() {
            break;
        }
        count += 1;
        it.step_next();
    }

    reply
        .send(vec![
            Frame::new(header.response(Opcode::Count, STATUS_OK), true),
            Frame::last(Bytes::from(count.to_le_bytes().to_vec())),
        ])
        .await;
}

async fn handle_scan(
    tablespace: &Tablespace,
    admin: &AdminHandle,
    header: &Header,
    cursor: &mut FrameCursor,
    reply: &crate::workers::envelope::Reply,
) {
    let reverse = header.flags_byte() & SCAN_FLAG_REVERSE != 0;
    let table_id = match cursor.parse_u32("table id", 0) {
        Ok(id) => id,
        Err(_) => return,
    };
    let limit = match cursor.parse_u64("limit", u64::MAX) {
        Ok(l) => l,
        Err(_) => return,
    };
    let (start, end) = match cursor.parse_range() {
        Ok(r) => r,
        Err(_) => return,
    };
    let key_filter = match cursor.parse_bytes("key filter") {
        Ok(f) => f,
        Err(_) => return,
    };
    let value_filter = match cursor.parse_bytes("value filter") {
        Ok(f) => f,
        Err(_) => return,
    };

    let slot = match tablespace.get_or_open(table_id, admin).await {
        Ok(slot) => slot,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Scan, STATUS_DB_ERROR))])
                .await;
            return;
        }
    };

    let snapshot = match slot.engine.snapshot() {
        Ok(s) => s,
        Err(_) => {
            reply
                .send(vec![Frame::last(header.response(Opcode::Scan, STATUS_DB_ERROR))])
                .await;
            return;
        }
    };

    let key_searcher = (!key_filter.is_empty()).then(|| Searcher::new(key_filter.to_vec()));
    let value_searcher = (!value_filter.is_empty()).then(|| Searcher::new(value_filter.to_vec()));

    let mut it = snapshot.iter();
    // Seek-to-start dominates direction whenever `start` is non-empty
    // (spec.md section 9, Open Question b — resolved against
    // `ReadWorker::handleScanRequest`).
    if !start.is_empty() {
        it.seek(&start);
    } else if reverse {
        it.seek_to_last();
    } else {
        it.seek_to_first();
    }

    let mut pairs: Vec<(Bytes, Bytes)> = Vec::new();
    let mut remaining = limit;
    while it.valid() && remaining > 0 {
        let key = it.key();
        if !reverse && !end.is_empty() && key.as_ref() >= end.as_ref() {
            break;
        }
        if reverse && !end.is_empty() && key.as_ref() <= end.as_ref() {
            break;
        }
        let value = it.value();

        let key_ok = key_searcher.as_ref().map(|s| s.contains(&key)).unwrap_or(true);
        let value_ok = value_searcher.as_ref().map(|s| s.contains(&value)).unwrap_or(true);
        if key_ok && value_ok {
            pairs.push((key, value));
            remaining -= 1;
        }
        if reverse {
            it.step_prev();
        } else {
            it.step_next();
        }
    }

    if pairs.is_empty() {
        reply
            .send(vec![Frame::last(header.response(Opcode::Scan, STATUS_OK))])
            .await;
        return;
    }

    let mut frames = vec![Frame::new(header.response(Opcode::Scan, STATUS_OK), true)];
    let last = pairs.len() - 1;
    for (i, (key, value)) in pairs.into_iter().enumerate() {
        frames.push(Frame::new(key, true));
        frames.push(Frame::new(value, i != last));
    }
    reply.send(frames).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminHandle;
    use crate::engine::{EngineFactory, MemEngine, MemEngineFactory, WriteBatch, WriteOp};
    use crate::merge_ops::MergeOperator;
    use crate::tablespace::TableSlot;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn make_admin_for(tablespace: Arc<Tablespace>) -> AdminHandle {
        let factory: Arc<dyn EngineFactory> = Arc::new(MemEngineFactory);
        crate::admin::spawn(
            tablespace,
            factory,
            std::env::temp_dir().join(format!("read-worker-test-{}", std::process::id())),
            crate::config::ServerConfig::default().default_table_options,
        )
    }

    fn header_bytes(opcode: Opcode, flags: u8) -> Bytes {
        Bytes::from(vec![0x31, 0x01, opcode.to_byte(), flags])
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

    async fn run(tablespace: &Tablespace, frames: Vec<Frame>) -> Vec<Frame> {
        let admin = make_admin_for(Arc::new(Tablespace::new()));
        let (tx, mut rx) = mpsc::channel(1);
        let reply = crate::workers::envelope::Reply::Envelope(crate::workers::envelope::ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx,
        });
        let item = WorkItem { reply, frames };
        process(tablespace, &admin, &item).await.unwrap();
        let mut message = rx.recv().await.unwrap();
        message.drain(0..2); // strip routing_id + delimiter
        message
    }

    #[tokio::test]
    async fn scenario_put_then_read() {
        let tablespace = table_with(&[("k1", "v1"), ("k2", "v2")]).await;
        let mut frames = vec![Frame::new(header_bytes(Opcode::Read, 0), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::from_static(b"k1"), true));
        frames.push(Frame::new(Bytes::from_static(b"k2"), true));
        frames.push(Frame::last(Bytes::from_static(b"k3")));

        let result = run(&tablespace, frames).await;
        assert_eq!(&result[0].data[..4], &[0x31, 0x01, 0x10, 0x00]);
        assert_eq!(&result[1].data[..], b"v1");
        assert_eq!(&result[2].data[..], b"v2");
        assert_eq!(&result[3].data[..], b"");
    }

    #[tokio::test]
    async fn scenario_scan_with_key_filter() {
        let tablespace = table_with(&[("apple", "1"), ("apricot", "2"), ("banana", "3")]).await;
        let mut frames = vec![Frame::new(header_bytes(Opcode::Scan, 0), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(10u64.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::from_static(b"a"), true));
        frames.push(Frame::new(Bytes::from_static(b"b"), true));
        frames.push(Frame::new(Bytes::from_static(b"ap"), true));
        frames.push(Frame::last(Bytes::new()));

        let result = run(&tablespace, frames).await;
        let pairs: Vec<_> = result[1..]
            .chunks(2)
            .map(|c| (c[0].data.clone(), c[1].data.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (Bytes::from_static(b"apple"), Bytes::from_static(b"1")),
                (Bytes::from_static(b"apricot"), Bytes::from_static(b"2")),
            ]
        );
    }

    #[tokio::test]
    async fn scenario_reverse_scan_with_limit() {
        let tablespace = table_with(&[("apple", "1"), ("apricot", "2"), ("banana", "3")]).await;
        let mut frames = vec![Frame::new(header_bytes(Opcode::Scan, SCAN_FLAG_REVERSE), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(2u64.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::last(Bytes::new()));

        let result = run(&tablespace, frames).await;
        let pairs: Vec<_> = result[1..]
            .chunks(2)
            .map(|c| (c[0].data.clone(), c[1].data.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (Bytes::from_static(b"banana"), Bytes::from_static(b"3")),
                (Bytes::from_static(b"apricot"), Bytes::from_static(b"2")),
            ]
        );
    }

    #[tokio::test]
    async fn empty_scan_result_is_header_only() {
        let tablespace = table_with(&[]).await;
        let mut frames = vec![Frame::new(header_bytes(Opcode::Scan, 0), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(10u64.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::last(Bytes::new()));

        let result = run(&tablespace, frames).await;
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn count_counts_the_range() {
        let tablespace = table_with(&[("k1", "a"), ("k2", "b"), ("k3", "c")]).await;
        let mut frames = vec![Frame::new(header_bytes(Opcode::Count, 0), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::new(Bytes::new(), true));
        frames.push(Frame::last(Bytes::new()));

        let result = run(&tablespace, frames).await;
        let count = u64::from_le_bytes(result[1].data[..].try_into().unwrap());
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn read_auto_opens_an_unopened_table() {
        let tablespace = Arc::new(Tablespace::new());
        let admin = make_admin_for(tablespace.clone());
        assert!(!tablespace.is_table_open(1).await);

        let (tx, mut rx) = mpsc::channel(1);
        let reply = crate::workers::envelope::Reply::Envelope(crate::workers::envelope::ReplyChannel {
            routing_id: Bytes::from_static(b"c1"),
            sender: tx,
        });
        let mut frames = vec![Frame::new(header_bytes(Opcode::Read, 0), true)];
        frames.push(Frame::new(1u32.to_le_bytes().to_vec(), true));
        frames.push(Frame::last(Bytes::from_static(b"missing-key")));

        let item = WorkItem { reply, frames };
        process(&tablespace, &admin, &item).await.unwrap();

        let mut message = rx.recv().await.unwrap();
        message.drain(0..2);
        assert_eq!(&message[0].data[..4], &[0x31, 0x01, 0x10, 0x00]);
        assert_eq!(&message[1].data[..], b"");
        assert!(tablespace.is_table_open(1).await);
    }
}
