//! Session recording.
//!
//! Packs are append-only JSON-Lines files, `{session_id}.jsonl` under the
//! configured directory. The first line is a `_meta` header; every following
//! line is a complete outbound envelope with `ts_ms` rewritten to a
//! session-relative offset. Writing happens on a dedicated task fed by a
//! bounded queue so the ingest path never blocks on disk.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use chrono::Utc;
use coach_types::{Envelope, EventKind, EventPayload, Payload, SCHEMA_VERSION};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::fabricator::Fabricator;
use crate::queue::BoundedQueue;
use crate::state::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("already recording")]
    AlreadyRecording,
    #[error("not recording")]
    NotRecording,
    #[error("invalid session id")]
    InvalidSessionId,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("recorder task unavailable")]
    Unavailable,
}

/// Session summary, as listed by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub schema_version: Option<String>,
    pub created: Option<String>,
    pub description: Option<String>,
    pub duration_s: Option<f64>,
    pub message_count: u64,
    pub athlete_count: u64,
}

// ── Lifecycle commands ────────────────────────────────────────────────────────

enum RecorderCommand {
    Start {
        session_id: Option<String>,
        reply: oneshot::Sender<Result<String, RecorderError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionMeta, RecorderError>>,
    },
}

/// Handle shared with the control surface and the fabricator.
#[derive(Clone)]
pub struct RecorderHandle {
    control: mpsc::Sender<RecorderCommand>,
    pub recording: Arc<AtomicBool>,
    pub data_queue: Arc<BoundedQueue<Envelope>>,
}

impl RecorderHandle {
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub async fn start(&self, session_id: Option<String>) -> Result<String, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(RecorderCommand::Start { session_id, reply })
            .await
            .map_err(|_| RecorderError::Unavailable)?;
        rx.await.map_err(|_| RecorderError::Unavailable)?
    }

    pub async fn stop(&self) -> Result<SessionMeta, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(RecorderCommand::Stop { reply })
            .await
            .map_err(|_| RecorderError::Unavailable)?;
        rx.await.map_err(|_| RecorderError::Unavailable)?
    }
}

// ── Recorder task ─────────────────────────────────────────────────────────────

struct ActiveSession {
    session_id: String,
    file: File,
    started_ms: i64,
    message_count: u64,
    athlete_ids: HashSet<String>,
}

/// Spawn the recorder task. `queue_capacity` bounds the data queue; the
/// fabricator only feeds it while a session is active.
pub fn spawn_recorder(
    session_dir: PathBuf,
    queue_capacity: usize,
) -> (RecorderHandle, RecorderSpawner) {
    let (control_tx, control_rx) = mpsc::channel(8);
    let handle = RecorderHandle {
        control: control_tx,
        recording: Arc::new(AtomicBool::new(false)),
        data_queue: Arc::new(BoundedQueue::new(queue_capacity)),
    };
    let spawner = RecorderSpawner {
        session_dir,
        control_rx,
        handle: handle.clone(),
    };
    (handle, spawner)
}

/// Deferred task start: the recorder needs the fabricator (for SYSTEM_ERROR
/// events and session stamping), which in turn needs the recorder's queue.
pub struct RecorderSpawner {
    session_dir: PathBuf,
    control_rx: mpsc::Receiver<RecorderCommand>,
    handle: RecorderHandle,
}

impl RecorderSpawner {
    pub fn spawn(self, fabricator: Arc<Fabricator>) {
        tokio::spawn(run_recorder(self, fabricator));
    }
}

async fn run_recorder(spawner: RecorderSpawner, fabricator: Arc<Fabricator>) {
    let RecorderSpawner {
        session_dir,
        mut control_rx,
        handle,
    } = spawner;

    let mut active: Option<ActiveSession> = None;

    loop {
        tokio::select! {
            cmd = control_rx.recv() => match cmd {
                Some(RecorderCommand::Start { session_id, reply }) => {
                    let result = start_session(&session_dir, &mut active, session_id).await;
                    if let Ok(id) = &result {
                        handle.recording.store(true, Ordering::Relaxed);
                        fabricator.set_session_id(Some(id.clone()));
                        info!("Session recording started: {id}");
                    }
                    let _ = reply.send(result);
                }
                Some(RecorderCommand::Stop { reply }) => {
                    let result = stop_session(&mut active).await;
                    handle.recording.store(false, Ordering::Relaxed);
                    fabricator.set_session_id(None);
                    if let Ok(meta) = &result {
                        info!(
                            "Session recording stopped: {} ({} messages)",
                            meta.session_id, meta.message_count
                        );
                    }
                    let _ = reply.send(result);
                }
                None => break,
            },
            envelope = handle.data_queue.pop() => {
                let Some(session) = active.as_mut() else { continue };
                if let Err(e) = append_envelope(session, envelope).await {
                    // Recording faults abort the session, never the relay.
                    error!("Pack write failed, aborting recording: {e}");
                    let failed = active.take();
                    handle.recording.store(false, Ordering::Relaxed);
                    fabricator.set_session_id(None);
                    let mut details = serde_json::Map::new();
                    details.insert("reason".into(), Value::from("pack write failed"));
                    if let Some(s) = failed {
                        details.insert("session_id".into(), Value::from(s.session_id));
                    }
                    fabricator.emit(Payload::Event(EventPayload {
                        event_kind: EventKind::SystemError,
                        athlete_id: None,
                        name: None,
                        details,
                    }));
                }
            }
        }
    }
}

async fn start_session(
    session_dir: &Path,
    active: &mut Option<ActiveSession>,
    session_id: Option<String>,
) -> Result<String, RecorderError> {
    if active.is_some() {
        return Err(RecorderError::AlreadyRecording);
    }
    let session_id =
        session_id.unwrap_or_else(|| Utc::now().format("S%Y-%m-%d-%H%M%S").to_string());
    if !valid_session_id(&session_id) {
        return Err(RecorderError::InvalidSessionId);
    }

    tokio::fs::create_dir_all(session_dir).await?;
    let path = pack_path(session_dir, &session_id);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .await?;

    let header = serde_json::json!({
        "_meta": true,
        "schema_version": SCHEMA_VERSION,
        "session_id": session_id,
        "created": Utc::now().to_rfc3339(),
        "description": Value::Null,
    });
    file.write_all(format!("{header}\n").as_bytes()).await?;

    *active = Some(ActiveSession {
        session_id: session_id.clone(),
        file,
        started_ms: now_ms(),
        message_count: 0,
        athlete_ids: HashSet::new(),
    });
    Ok(session_id)
}

async fn stop_session(active: &mut Option<ActiveSession>) -> Result<SessionMeta, RecorderError> {
    let mut session = active.take().ok_or(RecorderError::NotRecording)?;
    session.file.flush().await?;
    let duration_s = (now_ms() - session.started_ms) as f64 / 1000.0;
    Ok(SessionMeta {
        session_id: session.session_id,
        schema_version: Some(SCHEMA_VERSION.to_string()),
        created: None,
        description: None,
        duration_s: Some((duration_s * 10.0).round() / 10.0),
        message_count: session.message_count,
        athlete_count: session.athlete_ids.len() as u64,
    })
}

async fn append_envelope(session: &mut ActiveSession, mut envelope: Envelope) -> io::Result<()> {
    envelope.ts_ms = (envelope.ts_ms - session.started_ms).max(0);
    track_athletes(&envelope.payload, &mut session.athlete_ids);
    session
        .file
        .write_all(format!("{}\n", envelope.to_json()).as_bytes())
        .await?;
    session.message_count += 1;
    Ok(())
}

fn track_athletes(payload: &Payload, seen: &mut HashSet<String>) {
    match payload {
        Payload::PositionUpdate(p) => {
            for pos in &p.positions {
                seen.insert(pos.athlete_id.clone());
            }
        }
        Payload::GateMetrics(p) => {
            for m in &p.metrics {
                seen.insert(m.athlete_id.clone());
            }
        }
        _ => {}
    }
}

// ── Pack files on disk ────────────────────────────────────────────────────────

pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub fn pack_path(session_dir: &Path, session_id: &str) -> PathBuf {
    session_dir.join(format!("{session_id}.jsonl"))
}

/// Per-file metadata cache keyed by size + mtime, so repeated listings do
/// not re-stream unchanged packs.
pub type MetaCache = Mutex<std::collections::HashMap<String, (u64, SystemTime, SessionMeta)>>;

fn lock_cache(cache: &MetaCache) -> MutexGuard<'_, std::collections::HashMap<String, (u64, SystemTime, SessionMeta)>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// List all packs with metadata, newest first.
pub async fn list_sessions(session_dir: &Path, cache: &MetaCache) -> io::Result<Vec<SessionMeta>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(session_dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(session_id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            continue;
        };
        if let Some(meta) = scan_pack(&path, &session_id, cache).await? {
            out.push(meta);
        }
    }
    out.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(out)
}

pub async fn session_meta(
    session_dir: &Path,
    session_id: &str,
    cache: &MetaCache,
) -> io::Result<Option<SessionMeta>> {
    if !valid_session_id(session_id) {
        return Ok(None);
    }
    let path = pack_path(session_dir, session_id);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    scan_pack(&path, session_id, cache).await
}

async fn scan_pack(
    path: &Path,
    session_id: &str,
    cache: &MetaCache,
) -> io::Result<Option<SessionMeta>> {
    let fs_meta = tokio::fs::metadata(path).await?;
    let size = fs_meta.len();
    let mtime = fs_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    if let Some((cached_size, cached_mtime, meta)) = lock_cache(cache).get(session_id) {
        if *cached_size == size && *cached_mtime == mtime {
            return Ok(Some(meta.clone()));
        }
    }

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut meta = SessionMeta {
        session_id: session_id.to_string(),
        schema_version: None,
        created: None,
        description: None,
        duration_s: None,
        message_count: 0,
        athlete_count: 0,
    };
    let mut athletes: HashSet<String> = HashSet::new();
    let mut last_ts_ms: Option<i64> = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("_meta").and_then(Value::as_bool).unwrap_or(false) {
            meta.schema_version = value
                .get("schema_version")
                .and_then(Value::as_str)
                .map(String::from);
            meta.created = value.get("created").and_then(Value::as_str).map(String::from);
            meta.description = value
                .get("description")
                .and_then(Value::as_str)
                .map(String::from);
            continue;
        }
        meta.message_count += 1;
        last_ts_ms = value.get("ts_ms").and_then(Value::as_i64).or(last_ts_ms);
        if let Some(payload) = value.get("payload") {
            for key in ["positions", "metrics"] {
                if let Some(items) = payload.get(key).and_then(Value::as_array) {
                    for item in items {
                        if let Some(id) = item.get("athlete_id").and_then(Value::as_str) {
                            athletes.insert(id.to_string());
                        }
                    }
                }
            }
        }
    }

    meta.athlete_count = athletes.len() as u64;
    meta.duration_s = last_ts_ms.map(|ts| ts as f64 / 1000.0);

    lock_cache(cache).insert(session_id.to_string(), (size, mtime, meta.clone()));
    Ok(Some(meta))
}

// ── Streaming reads & exports ─────────────────────────────────────────────────

enum LineStream {
    Init(PathBuf),
    Read(Lines<BufReader<File>>),
    Done,
}

/// Stream the envelope lines of a pack (skipping the `_meta` header), each
/// chunk already newline-terminated. Nothing is materialized in memory.
pub fn pack_lines(path: PathBuf) -> impl Stream<Item = io::Result<String>> {
    stream_transformed(path, |line| Some(format!("{line}\n")))
}

/// Stream a pack flattened to CSV. Position and gate batches each yield one
/// row per athlete entry; the header row comes first.
pub fn pack_csv(path: PathBuf) -> impl Stream<Item = io::Result<String>> {
    let header = concat!(
        "ts_ms,session_id,athlete_id,device_id,name,team,",
        "lat,lon,alt_m,sog_kn,cog_deg,dist_to_line_m,",
        "eta_to_line_s,speed_to_line_mps,status,data_age_ms\n"
    );
    let head = futures::stream::once(async move { Ok(header.to_string()) });
    let body = stream_transformed(path, csv_rows_for_line);
    futures::StreamExt::chain(head, body)
}

fn stream_transformed(
    path: PathBuf,
    transform: fn(&str) -> Option<String>,
) -> impl Stream<Item = io::Result<String>> {
    futures::stream::unfold(LineStream::Init(path), move |state| {
        async move {
            let mut lines = match state {
                LineStream::Init(path) => match File::open(&path).await {
                    Ok(f) => BufReader::new(f).lines(),
                    Err(e) => return Some((Err(e), LineStream::Done)),
                },
                LineStream::Read(lines) => lines,
                LineStream::Done => return None,
            };
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() || is_meta_line(line) {
                            continue;
                        }
                        if let Some(chunk) = transform(line) {
                            return Some((Ok(chunk), LineStream::Read(lines)));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e), LineStream::Done)),
                }
            }
        }
    })
}

fn is_meta_line(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("_meta").and_then(Value::as_bool))
        .unwrap_or(false)
}

fn csv_rows_for_line(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    let ts_ms = value.get("ts_ms").and_then(Value::as_i64).unwrap_or(0);
    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let payload = value.get("payload")?;
    let msg_type = value.get("type").and_then(Value::as_str)?;

    let mut rows = String::new();
    match msg_type {
        "position_update" => {
            for p in payload.get("positions")?.as_array()? {
                rows.push_str(&format!(
                    "{ts_ms},{session_id},{},{},{},{},{},{},{},{},{},,,,,{}\n",
                    str_field(p, "athlete_id"),
                    num_field(p, "device_id"),
                    csv_escape(&str_field(p, "name")),
                    csv_escape(&str_field(p, "team")),
                    num_field(p, "lat"),
                    num_field(p, "lon"),
                    num_field(p, "alt_m"),
                    num_field(p, "sog_kn"),
                    num_field(p, "cog_deg"),
                    num_field(p, "data_age_ms"),
                ));
            }
        }
        "gate_metrics" => {
            for m in payload.get("metrics")?.as_array()? {
                rows.push_str(&format!(
                    "{ts_ms},{session_id},{},{},{},,,,,,,{},{},{},{},\n",
                    str_field(m, "athlete_id"),
                    num_field(m, "device_id"),
                    csv_escape(&str_field(m, "name")),
                    num_field(m, "dist_to_line_m"),
                    num_field(m, "eta_to_line_s"),
                    num_field(m, "speed_to_line_mps"),
                    str_field(m, "status"),
                ));
            }
        }
        _ => return None,
    }
    (!rows.is_empty()).then_some(rows)
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn num_field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::Broadcaster;
    use crate::state::RelayCounters;
    use coach_types::{MessageType, PositionEntry, PositionUpdatePayload};
    use futures::StreamExt;
    use std::time::Duration;

    fn test_fabricator(handle: &RecorderHandle) -> Arc<Fabricator> {
        let counters = Arc::new(RelayCounters::default());
        let broadcaster = Arc::new(Broadcaster::new(
            8,
            Duration::from_secs(2),
            Duration::from_secs(5),
            counters.clone(),
        ));
        Arc::new(Fabricator::new(
            broadcaster,
            handle.data_queue.clone(),
            handle.recording.clone(),
            counters,
        ))
    }

    fn position_payload(athlete_id: &str) -> Payload {
        Payload::PositionUpdate(PositionUpdatePayload {
            positions: vec![PositionEntry {
                athlete_id: athlete_id.into(),
                device_id: 1,
                name: "CHAN, SIU MING".into(),
                team: "HKG".into(),
                lat: 22.296,
                lon: 114.168,
                alt_m: 0.3,
                sog_kn: Some(9.4),
                cog_deg: Some(180.0),
                source_mask: 1,
                device_ts_ms: now_ms(),
                data_age_ms: 100,
            }],
        })
    }

    async fn drain(handle: &RecorderHandle) {
        // Give the recorder task a chance to drain its queue.
        for _ in 0..50 {
            if handle.data_queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn record_stop_list_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, spawner) = spawn_recorder(dir.path().to_path_buf(), 64);
        let fabricator = test_fabricator(&handle);
        spawner.spawn(fabricator.clone());

        let id = handle.start(Some("S-test".into())).await.unwrap();
        assert_eq!(id, "S-test");
        assert!(handle.is_recording());
        // Double start conflicts.
        assert!(matches!(
            handle.start(None).await,
            Err(RecorderError::AlreadyRecording)
        ));

        fabricator.emit(position_payload("T1"));
        fabricator.emit(position_payload("T2"));
        drain(&handle).await;

        let meta = handle.stop().await.unwrap();
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.athlete_count, 2);
        assert!(matches!(handle.stop().await, Err(RecorderError::NotRecording)));

        // The pack re-reads to the same envelope sequence.
        let cache = MetaCache::default();
        let listed = list_sessions(dir.path(), &cache).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "S-test");
        assert_eq!(listed[0].message_count, 2);
        assert_eq!(listed[0].schema_version.as_deref(), Some("1.0"));

        let lines: Vec<_> = pack_lines(pack_path(dir.path(), "S-test"))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(lines.len(), 2);
        let env: Envelope = serde_json::from_str(lines[0].as_ref().unwrap()).unwrap();
        assert_eq!(env.kind, MessageType::PositionUpdate);
        assert_eq!(env.session_id.as_deref(), Some("S-test"));
        // Session-relative timestamps start near zero.
        assert!(env.ts_ms < 5_000, "ts_ms {}", env.ts_ms);
    }

    #[tokio::test]
    async fn csv_export_has_one_row_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, spawner) = spawn_recorder(dir.path().to_path_buf(), 64);
        let fabricator = test_fabricator(&handle);
        spawner.spawn(fabricator.clone());

        handle.start(Some("S-csv".into())).await.unwrap();
        fabricator.emit(position_payload("T1"));
        drain(&handle).await;
        handle.stop().await.unwrap();

        let chunks: Vec<_> = pack_csv(pack_path(dir.path(), "S-csv"))
            .collect::<Vec<_>>()
            .await;
        let csv: String = chunks.into_iter().map(|c| c.unwrap()).collect();
        let lines: Vec<&str> = csv.lines().collect();
        assert!(lines[0].starts_with("ts_ms,session_id,athlete_id"));
        assert_eq!(lines.len(), 2);
        // The comma in the name is escaped.
        assert!(lines[1].contains("\"CHAN, SIU MING\""));
        assert!(lines[1].contains("9.4"));
    }

    #[tokio::test]
    async fn session_id_validation() {
        assert!(valid_session_id("S2026-08-02-120000"));
        assert!(valid_session_id("race_1.final"));
        assert!(!valid_session_id(""));
        assert!(!valid_session_id("../escape"));
        assert!(!valid_session_id("a/b"));
        assert!(!valid_session_id(".hidden"));
    }

    #[tokio::test]
    async fn meta_cache_hits_on_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, spawner) = spawn_recorder(dir.path().to_path_buf(), 64);
        let fabricator = test_fabricator(&handle);
        spawner.spawn(fabricator.clone());

        handle.start(Some("S-cache".into())).await.unwrap();
        fabricator.emit(position_payload("T1"));
        drain(&handle).await;
        handle.stop().await.unwrap();

        let cache = MetaCache::default();
        let first = session_meta(dir.path(), "S-cache", &cache).await.unwrap().unwrap();
        let second = session_meta(dir.path(), "S-cache", &cache).await.unwrap().unwrap();
        assert_eq!(first.message_count, second.message_count);
        assert!(session_meta(dir.path(), "missing", &cache).await.unwrap().is_none());
    }
}
