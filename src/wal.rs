use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one record as `[len][bincode][crc32]`.
fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first (torn tail).
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next record and its size on disk. `Ok(None)` at end of log or
/// at the first torn / corrupt record; everything after it is ignored.
fn read_record(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        tracing::warn!("WAL record failed CRC check, discarding tail");
        return Ok(None);
    }
    let size = (len_buf.len() + payload.len() + crc_buf.len()) as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, size)))
}

/// Every intact record, plus the byte offset where the intact prefix ends.
fn read_intact(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0u64;
    while let Some((event, size)) = read_record(&mut reader)? {
        events.push(event);
        intact_len += size;
    }
    Ok((events, intact_len))
}

/// Append-only write-ahead log of reservation and catalog events.
///
/// Each record is `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A crash mid-append leaves a torn last record which `recover` cuts off
/// before the log is reopened for writing.
///
/// `durable_len` is the file length after the last successful flush. A failed
/// flush truncates back to it, so a batch is either fully in the log or not
/// at all.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    durable_len: u64,
    durable_appends: u64,
    /// Set when a rollback itself failed; the tail is unknown, so every later
    /// append is refused.
    poisoned: bool,
    #[cfg(test)]
    fail_next_flush: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            durable_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_next_flush: false,
        })
    }

    /// Replay the intact prefix of the log and truncate anything after it, so
    /// records appended from now on are reachable by the next replay.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact_len) = read_intact(path)?;
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > intact_len {
                tracing::warn!(
                    "truncating {} bytes of torn WAL tail in {}",
                    meta.len() - intact_len,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(intact_len)?;
                file.sync_all()?;
            }
        }
        Ok(events)
    }

    /// Append and fsync a single record.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer a record; durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL unusable after failed rollback"));
        }
        write_record(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_flush) {
            return Err(io::Error::other("injected fsync failure"));
        }
        self.writer.get_ref().sync_all()?;
        self.mark_durable()
    }

    fn mark_durable(&mut self) -> io::Result<()> {
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.durable_appends = self.appends_since_compact;
        Ok(())
    }

    /// Drop everything written since the last successful flush: buffered
    /// bytes are discarded and the file is cut back to `durable_len`.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_durable();
        if result.is_err() {
            self.poisoned = true;
        }
        self.appends_since_compact = self.durable_appends;
        result
    }

    fn truncate_to_durable(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (stale_file, _unwritten) = stale.into_parts();
        drop(stale_file);
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    #[cfg(test)]
    pub(crate) fn inject_flush_failure(&mut self) {
        self.fail_next_flush = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event set to `<path>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.mark_durable()
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact record without touching the file. A missing file is
    /// an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_intact(path).map(|(events, _)| events)
    }
}
