use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, RwLock};

use crate::model::Event;

const JOURNAL_CHANNEL_CAPACITY: usize = 4096;

/// Frame a single event as `[u32 len][bincode payload][u32 crc32]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read the next frame. `Ok(None)` on clean EOF, on a torn tail, or on a
/// frame whose checksum or payload does not decode: everything after the
/// first bad frame is untrusted.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of directory and reservation events.
///
/// A truncated last entry (crash mid-write) is discarded on replay via the
/// length prefix and CRC.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.commit(std::iter::once(event))
    }

    /// Append and fsync `events` as one unit. If any of it fails, the log is
    /// cut back to where it stood before the batch.
    pub fn commit<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        self.writer.flush()?;
        let committed_len = self.writer.get_ref().metadata()?.len();
        let committed_appends = self.appends_since_compact;

        let result = events
            .into_iter()
            .try_for_each(|event| self.append_buffered(event))
            .and_then(|()| self.flush_sync());
        if let Err(e) = result {
            self.appends_since_compact = committed_appends;
            if let Err(rollback) = self.truncate_to(committed_len) {
                tracing::error!("WAL rollback to {committed_len} bytes failed: {rollback}");
            }
            return Err(e);
        }
        Ok(())
    }

    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        #[cfg(test)]
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                self.fail_after = None;
                return Err(io::Error::other("injected append failure"));
            }
            *remaining -= 1;
        }
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Drop whatever is still buffered, then shrink the file to `len`.
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(len)?;
        file.sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the log as exactly `events`: temp file, fsync, rename, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// All valid events in the log, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_frame(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

// ── Group-commit journal ─────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("WAL error: {0}")]
pub struct JournalError(pub String);

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Held by a writer from before its append until its change is applied in
/// memory. Compaction waits for all permits to drain.
pub type JournalPermit = OwnedRwLockReadGuard<()>;

/// Cloneable handle to the background task that owns the `Wal`.
/// Concurrent appends are batched into one fsync.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<WalCommand>,
    gate: Arc<RwLock<()>>,
}

impl Journal {
    /// Replay the log at `path`, then start the writer task.
    /// Must be called from within a Tokio runtime.
    pub fn open(path: &Path) -> io::Result<(Journal, Vec<Event>)> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(JOURNAL_CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(wal, rx));
        let journal = Journal {
            tx,
            gate: Arc::new(RwLock::new(())),
        };
        Ok((journal, events))
    }

    pub async fn permit(&self) -> JournalPermit {
        self.gate.clone().read_owned().await
    }

    /// Compact from a snapshot taken while no writer holds a permit, so no
    /// event can be appended to the old log without being in the snapshot.
    /// Returns the number of events written.
    pub async fn compact_with<F>(&self, snapshot: F) -> Result<usize, JournalError>
    where
        F: Future<Output = Vec<Event>>,
    {
        let _exclusive = self.gate.write().await;
        let events = snapshot.await;
        let written = events.len();
        self.compact(events).await?;
        Ok(written)
    }

    /// Durably append one event. Returns once the batch containing it is fsynced.
    pub async fn append(&self, event: &Event) -> Result<(), JournalError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response,
            })
            .await
            .map_err(|_| JournalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| JournalError("WAL writer dropped response".into()))?
            .map_err(|e| JournalError(e.to_string()))
    }

    /// Replace the log contents with `events` (a snapshot of current state).
    pub async fn compact(&self, events: Vec<Event>) -> Result<(), JournalError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { events, response })
            .await
            .map_err(|_| JournalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| JournalError("WAL writer dropped response".into()))?
            .map_err(|e| JournalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL. Blocks for the first append, drains whatever else is
/// already queued, then fsyncs once and answers every sender in the batch.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Pending) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = wal.commit(batch.iter().map(|(event, _)| event));

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
    }

    for (_, tx) in batch {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to control path")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Span, Status};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("shareit_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn user_event() -> Event {
        Event::UserRegistered {
            id: Ulid::new(),
            name: "Ann".into(),
            email: format!("{}@example.com", Ulid::new()),
        }
    }

    fn created_event(item_id: Ulid) -> Event {
        Event::ReservationCreated {
            id: Ulid::new(),
            item_id,
            booker_id: Ulid::new(),
            span: Span::new(1_000, 2_000),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let item = Ulid::new();
        let events = vec![user_event(), created_event(item)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = user_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = user_event();
        let bad = created_event(Ulid::new());
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_replaces_history_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let item = Ulid::new();
        let created = created_event(item);
        let Event::ReservationCreated { id, .. } = created else {
            unreachable!()
        };
        let decided = Event::ReservationDecided {
            id,
            item_id: item,
            from: Status::Waiting,
            to: Status::Approved,
        };

        let mut wal = Wal::open(&path).unwrap();
        for _ in 0..20 {
            wal.append(&user_event()).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&created)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        wal.append(&decided).unwrap();
        drop(wal);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![created, decided]);
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let path = tmp_path("failed_batch.wal");
        let kept = user_event();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let len = fs::metadata(&path).unwrap().len();

        // large enough that part of the batch spills past the write buffer
        let batch: Vec<Event> = (0..400).map(|_| user_event()).collect();
        wal.fail_after = Some(batch.len() - 1);
        assert!(wal.commit(&batch).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        assert_eq!(wal.appends_since_compact(), 1);

        let after = user_event();
        wal.append(&after).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, after]);
    }

    #[tokio::test]
    async fn journal_group_commit_persists_concurrent_appends() {
        let path = tmp_path("journal_group.wal");
        let (journal, replayed) = Journal::open(&path).unwrap();
        assert!(replayed.is_empty());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move { journal.append(&user_event()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(journal.appends_since_compact().await, 32);
        assert_eq!(Wal::replay(&path).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn compaction_waits_for_outstanding_permits() {
        let path = tmp_path("journal_gate.wal");
        let (journal, _) = Journal::open(&path).unwrap();
        let kept = user_event();

        let permit = journal.permit().await;
        let compactor = {
            let journal = journal.clone();
            let kept = kept.clone();
            tokio::spawn(async move { journal.compact_with(async move { vec![kept] }).await })
        };
        tokio::task::yield_now().await;
        assert!(!compactor.is_finished());

        journal.append(&user_event()).await.unwrap();
        drop(permit);
        assert_eq!(compactor.await.unwrap().unwrap(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
    }
}
