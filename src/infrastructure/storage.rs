use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::TopicName;

/// On-disk layout for one topic.
///
/// ```text
/// <storage_dir>/topics/<name>/
///   messages/messages_{segment:05}.bin   records, one file per segment
///   messages/index.bin                   one u64 byte position per offset
///   group_indexes/{group}.bin            one u64: the group's next offset
/// ```
///
/// The index is topic-global while record data is segmented: entry `offset`
/// holds the byte position of record `offset` inside segment
/// `offset / segment_split`.
#[derive(Debug)]
pub struct TopicStorage {
    topic_dir: PathBuf,
    message_dir: PathBuf,
    group_dir: PathBuf,
    segment_split: u64,
}

impl TopicStorage {
    pub fn open(storage_dir: &Path, topic: &TopicName, segment_split: u64) -> io::Result<Self> {
        let topic_dir = storage_dir.join("topics").join(topic.as_str());
        let message_dir = topic_dir.join("messages");
        let group_dir = topic_dir.join("group_indexes");
        fs::create_dir_all(&message_dir)?;
        fs::create_dir_all(&group_dir)?;
        Ok(Self {
            topic_dir,
            message_dir,
            group_dir,
            segment_split: segment_split.max(1),
        })
    }

    pub fn topic_dir(&self) -> &Path {
        &self.topic_dir
    }

    pub fn segment_split(&self) -> u64 {
        self.segment_split
    }

    /// Segment that holds the record at `offset`.
    pub fn segment_id(&self, offset: u64) -> u64 {
        offset / self.segment_split
    }

    pub fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.message_dir.join(format!("messages_{segment_id:05}.bin"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.message_dir.join("index.bin")
    }

    pub fn group_path(&self, group: &str) -> PathBuf {
        self.group_dir.join(format!("{group}.bin"))
    }

    pub fn open_segment_writer(&self, segment_id: u64) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.segment_path(segment_id))
    }

    pub fn open_segment_reader(&self, segment_id: u64) -> io::Result<File> {
        open_readable(&self.segment_path(segment_id))
    }

    pub fn open_index_writer(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())
    }

    pub fn open_index_reader(&self) -> io::Result<File> {
        open_readable(&self.index_path())
    }

    /// Length of the global index in bytes; `len / 8` is the number of
    /// produced records.
    pub fn index_len(&self) -> io::Result<u64> {
        Ok(fs::metadata(self.index_path()).map(|m| m.len()).unwrap_or(0))
    }

    pub fn open_group_reader(&self, group: &str) -> io::Result<File> {
        open_readable(&self.group_path(group))
    }

    pub fn open_group_writer(&self, group: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.group_path(group))
    }

    /// Names of every consumer group with a persisted offset file.
    pub fn group_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.group_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Open for reading, creating the file when absent so a fresh reader on an
/// empty topic or group is not an error.
fn open_readable(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}
