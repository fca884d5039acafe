use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// A length prefix above this is read as corruption, not allocated.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame one event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// `false` if the reader ran dry before `buf` was full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact frame and its size on disk. `None` at the end of the log or
/// at the first torn, oversized, or corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, (len + 8) as u64)))
}

/// Every intact event in the log, plus the byte length they cover.
fn read_log(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0u64;
    while let Some((event, size)) = read_frame(&mut reader)? {
        events.push(event);
        intact += size;
    }
    Ok((events, intact))
}

/// Append-only event log for one tenant.
///
/// Each entry is `[u32 len][bincode Event][u32 crc32]`, little-endian, where
/// `len` counts only the payload. Opening the log cuts off a torn or corrupt
/// tail, so appends after a crash are never hidden behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Recover the log at `path` and open it for appends. Returns the intact
    /// events. They count toward the compaction threshold.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact) = read_log(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            warn!(
                "{}: dropping {} byte(s) of torn or corrupt log tail",
                path.display(),
                on_disk - intact
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: events.len() as u64,
        };
        Ok((wal, events))
    }

    /// Read the intact events without touching the file.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        read_log(path).map(|(events, _)| events)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event set to `<wal>.wal.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path.with_extension("wal.tmp"))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(self.path.with_extension("wal.tmp"), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, PropertyDetails, Provider, Span, DAY};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("wigwam_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn property(id: Ulid) -> Event {
        Event::PropertyCreated {
            id,
            owner_id: Ulid::new(),
            details: PropertyDetails {
                name: "Yurt".into(),
                ..PropertyDetails::default()
            },
        }
    }

    fn listing(property_id: Ulid, superseded: Vec<Ulid>) -> Event {
        Event::ListingAdmitted {
            id: Ulid::new(),
            property_id,
            span: Span::new(DAY, 5 * DAY).unwrap(),
            superseded,
        }
    }

    #[test]
    fn append_and_replay_every_event_kind() {
        let path = tmp_path("every_kind.wal");
        let user = Ulid::new();
        let pid = Ulid::new();
        let events = vec![
            Event::UserCreated {
                id: user,
                email: Some("a@example.com".into()),
            },
            Event::ConnectionLinked {
                user_id: user,
                connection: Connection {
                    provider: Provider::Google,
                    uid: "g-1".into(),
                    name: Some("Ann".into()),
                    access_token: Some("tok".into()),
                    expires_at: Some(42),
                    linked_at: 7,
                },
            },
            property(pid),
            listing(pid, vec![Ulid::new(), Ulid::new()]),
            Event::RentalBooked {
                id: Ulid::new(),
                property_id: pid,
                renter_id: user,
                span: Span::new(2 * DAY, 3 * DAY).unwrap(),
            },
            Event::ConnectionRemoved {
                user_id: user,
                provider: Provider::Google,
            },
            Event::PropertyDeleted { id: pid },
        ];

        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let path = tmp_path("truncated.wal");
        let event = property(Ulid::new());
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        // A crash mid-write leaves a length prefix with no payload.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = property(Ulid::new());
        let bad = Event::PropertyDeleted { id: Ulid::new() };
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&(crc32fast::hash(&payload) ^ 1).to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let pid = Ulid::new();
        let created = property(pid);
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            for _ in 0..20 {
                let id = Ulid::new();
                wal.append(&Event::RentalBooked {
                    id,
                    property_id: pid,
                    renter_id: Ulid::new(),
                    span: Span::new(DAY, 2 * DAY).unwrap(),
                })
                .unwrap();
                wal.append(&Event::RentalCancelled { id, property_id: pid }).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 41);
        }
        let before = fs::metadata(&path).unwrap().len();

        let kept = listing(pid, Vec::new());
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&kept).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should shrink: {after} >= {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![created, kept]);
        assert!(!path.with_extension("wal.tmp").exists());
    }

    #[test]
    fn buffered_appends_are_durable_after_flush() {
        let path = tmp_path("buffered.wal");
        let pid = Ulid::new();
        let events: Vec<Event> = (0..5).map(|_| listing(pid, Vec::new())).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn open_cuts_torn_tail_so_later_appends_replay() {
        let path = tmp_path("torn_then_append.wal");
        let first = property(Ulid::new());
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&64u32.to_le_bytes()).unwrap();
            f.write_all(&[9; 10]).unwrap();
        }

        let second = Event::PropertyDeleted { id: Ulid::new() };
        {
            let (mut wal, events) = Wal::open(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            assert_eq!(wal.appends_since_compact(), 1);
            wal.append(&second).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn oversized_length_prefix_is_corruption() {
        let path = tmp_path("oversized.wal");
        let good = property(Ulid::new());
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }

        let (_, events) = Wal::open(&path).unwrap();
        assert_eq!(events, vec![good]);
    }
}
