use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Write one framed record: `[u32 len][bincode Event][u32 crc32]`, little endian.
/// Returns the frame's size in bytes.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Outcome of reading one frame during replay.
enum Frame {
    Record(Event),
    /// Clean end of file.
    End,
    /// Torn write or checksum mismatch; everything from here on is ignored.
    Damaged(&'static str),
}

/// Fill `buf` completely. `Ok(false)` means the stream ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(Frame::Damaged("truncated payload"));
    }
    if !read_full(reader, &mut word)? {
        return Ok(Frame::Damaged("truncated checksum"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Record(event)),
        Err(_) => Ok(Frame::Damaged("undecodable payload")),
    }
}

fn open_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Append-only log of [`Event`]s. Every booking, table and cover-image change is
/// one record, so a booking and its table links are durable together or not at all.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last durable batch. A failed batch is cut back to here.
    committed_len: u64,
    /// Set when a failed batch could not be rolled back; the log refuses further appends.
    poisoned: bool,
    #[cfg(test)]
    fail_at: Option<usize>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let writer = open_append(path)?;
        let committed_len = writer.get_ref().metadata()?.len();
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            committed_len,
            poisoned: false,
            #[cfg(test)]
            fail_at: None,
        })
    }

    /// Append and fsync a single record.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Write, flush and fsync a batch. Either every record is durable or the file is
    /// truncated back to its previous length so no partial frame is left behind.
    pub fn append_batch(&mut self, events: &[Event]) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned by an earlier failed rollback"));
        }
        match self.write_batch(events) {
            Ok(written) => {
                self.committed_len += written;
                self.appends_since_compact += events.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    self.poisoned = true;
                    error!(path = %self.path.display(), "WAL rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn write_batch(&mut self, events: &[Event]) -> io::Result<u64> {
        let mut written = 0;
        for (index, event) in events.iter().enumerate() {
            self.injected_failure(index, event)?;
            written += write_frame(&mut self.writer, event)?;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(written)
    }

    /// Drop whatever the failed batch buffered and cut the file back to `committed_len`.
    fn rollback(&mut self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let (file, _unwritten) = std::mem::replace(&mut self.writer, fresh).into_parts();
        file.set_len(self.committed_len)?;
        file.sync_all()
    }

    /// Make the batch record at `index` fail halfway through its frame.
    #[cfg(test)]
    pub fn fail_at(&mut self, index: usize) {
        self.fail_at = Some(index);
    }

    #[cfg(test)]
    fn injected_failure(&mut self, index: usize, event: &Event) -> io::Result<()> {
        if self.fail_at != Some(index) {
            return Ok(());
        }
        self.fail_at = None;
        let mut frame = Vec::new();
        write_frame(&mut frame, event)?;
        self.writer.write_all(&frame[..frame.len() / 2])?;
        self.writer.flush()?;
        Err(io::Error::other("injected write failure"))
    }

    #[cfg(not(test))]
    fn injected_failure(&mut self, _index: usize, _event: &Event) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a compacted snapshot next to the log. Slow; does not touch the live file.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.writer = open_append(&self.path)?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact = 0;
        self.poisoned = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact record. A damaged tail (crash mid-write) is dropped with a warning.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        loop {
            match read_frame(&mut reader)? {
                Frame::Record(event) => events.push(event),
                Frame::End => break,
                Frame::Damaged(reason) => {
                    warn!(
                        path = %path.display(),
                        recovered = events.len(),
                        "discarding damaged WAL tail: {reason}"
                    );
                    break;
                }
            }
        }
        Ok(events)
    }
}
