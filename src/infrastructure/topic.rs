use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::{BrokerError, GroupName, Message, Result, TopicName, TopicStats};
use crate::infrastructure::guard::ExecutionGuard;
use crate::infrastructure::storage::TopicStorage;

/// Writer-side state, serialized by one topic-wide mutex so offsets are
/// assigned in the exact order producers acquire it.
#[derive(Debug)]
struct ProduceState {
    produce_offset: u64,
    segment_id: u64,
    /// Append position inside the active segment file.
    position: u64,
    message_writer: File,
    index_writer: File,
}

/// One consumer group's read cursor, serialized by its own mutex.
#[derive(Debug)]
struct GroupCursor {
    next_offset: u64,
    segment_id: u64,
    index_reader: File,
    message_reader: File,
    offset_writer: File,
}

/// A durable, offset-addressable append log for one topic, plus its
/// consumer-group cursors.
///
/// The index entry for a record is written and flushed only after the record
/// bytes themselves are durable, so the existence of an index entry implies
/// the record is fully written. Readers advance by reading index entries and
/// never have to coordinate with the writer beyond that.
#[derive(Debug)]
pub struct Topic {
    name: TopicName,
    storage: TopicStorage,
    guard: ExecutionGuard,
    produce: Mutex<ProduceState>,
    groups: Mutex<HashMap<String, Arc<Mutex<GroupCursor>>>>,
}

impl Topic {
    /// Opens (creating if absent) the topic's storage, recovering the produce
    /// offset from the index length and hydrating a cursor for every
    /// persisted consumer group.
    pub fn open(storage_dir: &Path, name: TopicName, segment_split: u64) -> Result<Self> {
        let storage = TopicStorage::open(storage_dir, &name, segment_split)?;

        // The index length is the durable source of truth for the next
        // offset; in-memory counters are never trusted across restarts.
        let produce_offset = storage.index_len()? / 8;
        let segment_id = storage.segment_id(produce_offset);

        let message_writer = storage.open_segment_writer(segment_id)?;
        let position = message_writer.metadata()?.len();
        let index_writer = storage.open_index_writer()?;

        let topic = Self {
            name,
            storage,
            guard: ExecutionGuard::new(),
            produce: Mutex::new(ProduceState {
                produce_offset,
                segment_id,
                position,
                message_writer,
                index_writer,
            }),
            groups: Mutex::new(HashMap::new()),
        };

        for group in topic.storage.group_names()? {
            let cursor = topic.hydrate_cursor(&group)?;
            lock(&topic.groups).insert(group, Arc::new(Mutex::new(cursor)));
        }

        debug!(
            "topic '{}' opened at offset {} (segment {})",
            topic.name, produce_offset, segment_id
        );
        Ok(topic)
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    /// Appends a record and returns its assigned offset and timestamp, or
    /// `None` when the topic is shutting down.
    pub fn produce(&self, meta: &str, body: &[u8]) -> Result<Option<(u64, DateTime<Utc>)>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };

        let mut state = lock(&self.produce);

        let timestamp = truncate_to_micros(Utc::now());
        let record = encode_record(timestamp.timestamp_micros(), meta, body);
        let begin = state.position;

        // Record bytes first, durably, then the index entry; readers treat
        // the index entry as proof the record is complete.
        state.message_writer.write_all(&record)?;
        state.message_writer.sync_data()?;
        state.position += record.len() as u64;

        let offset = state.produce_offset;
        state.produce_offset += 1;

        state.index_writer.write_all(&begin.to_be_bytes())?;
        state.index_writer.sync_data()?;

        // Roll to the next segment inside the same critical section, so no
        // concurrent producer can observe the boundary while this record's
        // writes are still in flight.
        if state.produce_offset % self.storage.segment_split() == 0 {
            let next = state.segment_id + 1;
            debug!("topic '{}': rolling to segment {next}", self.name);
            state.message_writer = self.storage.open_segment_writer(next)?;
            state.segment_id = next;
            state.position = state.message_writer.metadata()?.len();
        }

        Ok(Some((offset, timestamp)))
    }

    /// Reads the next message for `group`, or `None` at end of log or when
    /// the topic is shutting down. The cursor is created on first use, seeded
    /// from its persisted offset file.
    pub fn consume_group(&self, group: &GroupName) -> Result<Option<Message>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };

        let cursor = self.cursor(group)?;
        let mut cursor = lock(&cursor);

        // An index entry only appears after its record is fully durable, so
        // advancing past one is always safe.
        let index_len = self.storage.index_len()?;
        let index_pos = cursor.next_offset * 8;
        if index_pos + 8 > index_len {
            return Ok(None);
        }

        cursor.index_reader.seek(SeekFrom::Start(index_pos))?;
        let record_pos = read_u64(&mut cursor.index_reader)?;

        // Crossing a segment boundary means the cursor's record file is the
        // wrong one; reopen against the segment that holds next_offset.
        let segment = self.storage.segment_id(cursor.next_offset);
        if segment != cursor.segment_id {
            cursor.message_reader = self.storage.open_segment_reader(segment)?;
            cursor.segment_id = segment;
        }
        cursor.message_reader.seek(SeekFrom::Start(record_pos))?;

        let next_offset = cursor.next_offset;
        let message = read_record(&mut cursor.message_reader, next_offset, true)?;
        cursor.next_offset += 1;
        persist_cursor(&mut cursor)?;

        Ok(Some(message))
    }

    /// Random access read of the record at `offset`.
    pub fn consume_at(&self, offset: u64) -> Result<Option<Message>> {
        self.read_at(offset, true)
    }

    /// Like `consume_at` but never reads the body; cheap existence and
    /// metadata checks.
    pub fn peek(&self, offset: u64) -> Result<Option<Message>> {
        self.read_at(offset, false)
    }

    fn read_at(&self, offset: u64, read_body: bool) -> Result<Option<Message>> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(None);
        };

        // offsets arrive straight off the wire; anything past the index end
        // reads as none, and the bounds check itself must not overflow
        let index_len = self.storage.index_len()?;
        let Some(end) = offset.checked_mul(8).and_then(|pos| pos.checked_add(8)) else {
            return Ok(None);
        };
        if end > index_len {
            return Ok(None);
        }

        let mut index = self.storage.open_index_reader()?;
        index.seek(SeekFrom::Start(offset * 8))?;
        let record_pos = read_u64(&mut index)?;

        let mut reader = self
            .storage
            .open_segment_reader(self.storage.segment_id(offset))?;
        reader.seek(SeekFrom::Start(record_pos))?;
        Ok(Some(read_record(&mut reader, offset, read_body)?))
    }

    /// Rewinds or advances a group's persisted cursor to `offset`, re-deriving
    /// its record-file position from the index the same way hydration does.
    /// Returns `false` when the topic is shutting down.
    pub fn set_offset(&self, group: &GroupName, offset: u64) -> Result<bool> {
        let Some(_permit) = self.guard.enter() else {
            return Ok(false);
        };

        let next = lock(&self.produce).produce_offset;
        if offset > next {
            return Err(BrokerError::OffsetOutOfRange { offset, next });
        }

        let cursor = self.cursor(group)?;
        let mut cursor = lock(&cursor);

        cursor.next_offset = offset;
        let segment = self.storage.segment_id(offset);
        if segment != cursor.segment_id {
            cursor.message_reader = self.storage.open_segment_reader(segment)?;
            cursor.segment_id = segment;
        }
        if offset * 8 + 8 <= self.storage.index_len()? {
            cursor.index_reader.seek(SeekFrom::Start(offset * 8))?;
            let record_pos = read_u64(&mut cursor.index_reader)?;
            cursor.message_reader.seek(SeekFrom::Start(record_pos))?;
            cursor.index_reader.seek(SeekFrom::Start(offset * 8))?;
        }
        persist_cursor(&mut cursor)?;

        Ok(true)
    }

    pub fn stats(&self) -> TopicStats {
        let message_count = lock(&self.produce).produce_offset;
        TopicStats {
            name: self.name.clone(),
            storage_directory: self.storage.topic_dir().to_path_buf(),
            message_count,
        }
    }

    /// Disables the gate, drains in-flight operations and flushes the
    /// writers. Idempotent; later calls are no-ops.
    pub fn close(&self) {
        if !self.guard.disable_execute() {
            return;
        }
        let state = lock(&self.produce);
        if let Err(e) = state.message_writer.sync_all() {
            warn!("topic '{}': message flush on close failed: {e}", self.name);
        }
        if let Err(e) = state.index_writer.sync_all() {
            warn!("topic '{}': index flush on close failed: {e}", self.name);
        }
        lock(&self.groups).clear();
        debug!("topic '{}' closed", self.name);
    }

    /// Resolves the cursor for `group`, creating and hydrating it on first
    /// use.
    fn cursor(&self, group: &GroupName) -> Result<Arc<Mutex<GroupCursor>>> {
        let mut groups = lock(&self.groups);
        if let Some(cursor) = groups.get(group.as_str()) {
            return Ok(Arc::clone(cursor));
        }
        let cursor = Arc::new(Mutex::new(self.hydrate_cursor(group.as_str())?));
        groups.insert(group.as_str().to_string(), Arc::clone(&cursor));
        Ok(cursor)
    }

    fn hydrate_cursor(&self, group: &str) -> Result<GroupCursor> {
        let mut offset_file = self.storage.open_group_reader(group)?;
        let next_offset = if offset_file.metadata()?.len() >= 8 {
            read_u64(&mut offset_file)?
        } else {
            0
        };

        let segment_id = self.storage.segment_id(next_offset);
        let mut index_reader = self.storage.open_index_reader()?;
        let mut message_reader = self.storage.open_segment_reader(segment_id)?;

        // Position the record reader from the index when an entry exists;
        // at end of log the next consume re-derives the position anyway.
        let index_pos = next_offset * 8;
        if index_pos + 8 <= self.storage.index_len()? {
            index_reader.seek(SeekFrom::Start(index_pos))?;
            let record_pos = read_u64(&mut index_reader)?;
            message_reader.seek(SeekFrom::Start(record_pos))?;
            index_reader.seek(SeekFrom::Start(index_pos))?;
        }

        let offset_writer = self.storage.open_group_writer(group)?;
        Ok(GroupCursor {
            next_offset,
            segment_id,
            index_reader,
            message_reader,
            offset_writer,
        })
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        self.close();
    }
}

/// Overwrites the single u64 in the group's offset file.
fn persist_cursor(cursor: &mut GroupCursor) -> io::Result<()> {
    cursor.offset_writer.seek(SeekFrom::Start(0))?;
    cursor
        .offset_writer
        .write_all(&cursor.next_offset.to_be_bytes())?;
    cursor.offset_writer.sync_data()
}

/// `[i64 timestamp micros][u32 meta len][meta utf8][u32 body len][body]`,
/// big-endian. An absent body is stored as zero bytes.
fn encode_record(timestamp_micros: i64, meta: &str, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(8 + 4 + meta.len() + 4 + body.len());
    record.extend_from_slice(&timestamp_micros.to_be_bytes());
    record.extend_from_slice(&(meta.len() as u32).to_be_bytes());
    record.extend_from_slice(meta.as_bytes());
    record.extend_from_slice(&(body.len() as u32).to_be_bytes());
    record.extend_from_slice(body);
    record
}

fn read_record(reader: &mut File, offset: u64, read_body: bool) -> Result<Message> {
    let timestamp_micros = read_i64(reader)?;
    let timestamp = DateTime::from_timestamp_micros(timestamp_micros)
        .ok_or_else(|| corrupt(format!("timestamp {timestamp_micros} out of range")))?;

    let meta_len = read_u32(reader)? as usize;
    let mut meta = vec![0u8; meta_len];
    reader.read_exact(&mut meta)?;
    let meta = String::from_utf8(meta).map_err(|e| corrupt(format!("meta not UTF-8: {e}")))?;

    let body_len = read_u32(reader)? as u64;
    let body = if read_body {
        let mut body = vec![0u8; body_len as usize];
        reader.read_exact(&mut body)?;
        body
    } else {
        reader.seek(SeekFrom::Current(body_len as i64))?;
        Vec::new()
    };

    Ok(Message {
        offset: Some(offset),
        timestamp: Some(timestamp),
        meta,
        body,
    })
}

/// Timestamps persist at microsecond precision; the value handed back by
/// produce must round-trip exactly through the record format.
fn truncate_to_micros(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(timestamp.timestamp_micros()).unwrap_or(timestamp)
}

fn corrupt(message: String) -> BrokerError {
    BrokerError::Storage(io::Error::new(io::ErrorKind::InvalidData, message))
}

fn read_u64(reader: &mut File) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

fn read_i64(reader: &mut File) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_u32(reader: &mut File) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
