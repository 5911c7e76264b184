// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector stage: tails log files and receives syslog datagrams.
//!
//! ```text
//!   tail /var/log/auth.log ─┐
//!   tail /var/log/syslog ───┼──► funnel (mpsc) ──► forwarder ──► Emitter<RawEvent>
//!   syslog UDP socket ──────┘
//! ```
//!
//! Every input runs in its own task and feeds a shared funnel. A single forwarder owns the
//! emitter. Once the run is cancelled the inputs stop reading and the forwarder hands what
//! is left in the funnel downstream, then drops the emitter, which closes the processor's
//! input.

use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use siem_agent_core::pipeline::{self, Emitter, OutputEndpoint};
use siem_agent_core::{Producer, RunContext, Stage, StageError};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CollectorConfig, ConfigError};
use crate::record::{EventSource, RawEvent};
use crate::tasks::{join_within, STAGE_STOP_TIMEOUT};

const FUNNEL_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind syslog socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("collector was already started")]
    AlreadyStarted,

    #[error("collector tasks did not finish within {0:?}")]
    StopTimeout(Duration),
}

pub struct Collector {
    config: CollectorConfig,
    syslog_bind: Option<SocketAddr>,
    output: Option<OutputEndpoint<RawEvent>>,
    emitter: Option<Emitter<RawEvent>>,

    cancel: Option<CancellationToken>,
    tasks: Option<JoinSet<()>>,
    syslog_addr: Option<SocketAddr>,
}

impl Collector {
    /// Validates the section. Nothing is opened until `start`.
    pub fn new(config: CollectorConfig) -> Result<Self, ConfigError> {
        let syslog_bind = config.validate()?;
        let (output, emitter) = pipeline::output();
        Ok(Self {
            config,
            syslog_bind,
            output: Some(output),
            emitter: Some(emitter),
            cancel: None,
            tasks: None,
            syslog_addr: None,
        })
    }

    /// Address the syslog socket is bound to, once started.
    #[must_use]
    pub fn syslog_addr(&self) -> Option<SocketAddr> {
        self.syslog_addr
    }
}

#[async_trait]
impl Stage for Collector {
    async fn start(&mut self, ctx: RunContext) -> Result<(), StageError> {
        let emitter = self.emitter.take().ok_or(CollectorError::AlreadyStarted)?;

        // Open every input before spawning anything so a failure leaves nothing running.
        let mut tailers = Vec::with_capacity(self.config.paths.len());
        for path in &self.config.paths {
            let tailer = Tailer::open(path, self.config.read_from_start, self.config.max_line_bytes)
                .await
                .map_err(|source| CollectorError::Open {
                    path: path.clone(),
                    source,
                })?;
            tailers.push(tailer);
        }
        let socket = match self.syslog_bind {
            Some(addr) => Some(
                UdpSocket::bind(addr)
                    .await
                    .map_err(|source| CollectorError::Bind { addr, source })?,
            ),
            None => None,
        };
        self.syslog_addr = socket.as_ref().and_then(|s| s.local_addr().ok());

        let cancel = ctx.child_token();
        let (funnel_tx, funnel_rx) = mpsc::channel(FUNNEL_CAPACITY);
        let mut tasks = JoinSet::new();

        let files = tailers.len();
        for tailer in tailers {
            tasks.spawn(tail(
                tailer,
                funnel_tx.clone(),
                cancel.clone(),
                self.config.poll_interval(),
            ));
        }
        if let Some(socket) = socket {
            tasks.spawn(receive_syslog(
                socket,
                funnel_tx.clone(),
                cancel.clone(),
                self.config.max_line_bytes,
            ));
        }
        drop(funnel_tx);
        tasks.spawn(forward(funnel_rx, emitter, cancel.clone()));

        info!(files, syslog = ?self.syslog_addr, "Collector started");
        self.cancel = Some(cancel);
        self.tasks = Some(tasks);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), StageError> {
        let Some(mut tasks) = self.tasks.take() else {
            return Ok(());
        };
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if !join_within("collector", &mut tasks, STAGE_STOP_TIMEOUT).await {
            return Err(CollectorError::StopTimeout(STAGE_STOP_TIMEOUT).into());
        }
        debug!("Collector stopped");
        Ok(())
    }
}

impl Producer for Collector {
    type Output = RawEvent;

    fn output_endpoint(&mut self) -> Option<OutputEndpoint<RawEvent>> {
        self.output.take()
    }
}

/// Polling reader over one file. Follows appends, restarts after truncation and switches
/// to the new file once the path is rotated away.
struct Tailer {
    path: PathBuf,
    reader: BufReader<File>,
    id: Option<FileId>,
    position: u64,
    pending: Vec<u8>,
    max_line_bytes: usize,
}

/// Device and inode of an open file.
type FileId = (u64, u64);

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<FileId> {
    None
}

impl Tailer {
    async fn open(path: &Path, from_start: bool, max_line_bytes: usize) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let id = file_id(&file.metadata().await?);
        let position = if from_start {
            0
        } else {
            file.seek(SeekFrom::End(0)).await?
        };
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            id,
            position,
            pending: Vec::new(),
            max_line_bytes,
        })
    }

    /// Complete lines appended since the last poll. A trailing partial line is kept until
    /// its newline arrives, holding at most `max_line_bytes` of it.
    async fn poll(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();

        let len = self.reader.get_ref().metadata().await?.len();
        if len < self.position {
            info!(path = %self.path.display(), "File truncated, reading from the beginning");
            self.reader.seek(SeekFrom::Start(0)).await?;
            self.position = 0;
            self.pending.clear();
        }

        let rotated = self.rotated().await;
        self.read_lines(&mut lines).await?;

        if rotated {
            match File::open(&self.path).await {
                Ok(file) => {
                    let line = decode_line(&self.pending, self.max_line_bytes);
                    if !line.is_empty() {
                        lines.push(line);
                    }
                    info!(path = %self.path.display(), "File rotated, following the new file");
                    self.id = file_id(&file.metadata().await?);
                    self.reader = BufReader::new(file);
                    self.position = 0;
                    self.pending.clear();
                    self.read_lines(&mut lines).await?;
                }
                Err(e) => debug!(path = %self.path.display(), "Rotated file not reopened yet: {e}"),
            }
        }
        Ok(lines)
    }

    /// Whether the path now names a different file than the open handle. A missing path
    /// keeps the current handle until the file is recreated.
    async fn rotated(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => file_id(&meta) != self.id,
            Err(_) => false,
        }
    }

    async fn read_lines(&mut self, lines: &mut Vec<String>) -> io::Result<()> {
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(());
            }
            let newline = chunk.iter().position(|&b| b == b'\n');
            let body = &chunk[..newline.unwrap_or(chunk.len())];
            let room = self.max_line_bytes.saturating_sub(self.pending.len());
            self.pending.extend_from_slice(&body[..body.len().min(room)]);

            let consumed = newline.map_or(chunk.len(), |i| i + 1);
            self.reader.consume(consumed);
            self.position += consumed as u64;

            if newline.is_some() {
                let line = decode_line(&self.pending, self.max_line_bytes);
                self.pending.clear();
                if !line.is_empty() {
                    lines.push(line);
                }
            }
        }
    }
}

async fn tail(
    mut tailer: Tailer,
    funnel: mpsc::Sender<RawEvent>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let source = EventSource::File(tailer.path.display().to_string());
    loop {
        match tailer.poll().await {
            Ok(lines) => {
                for line in lines {
                    if funnel.send(RawEvent::new(source.clone(), line)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => debug!(path = %tailer.path.display(), "Failed to read file: {e}"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}

async fn receive_syslog(
    socket: UdpSocket,
    funnel: mpsc::Sender<RawEvent>,
    cancel: CancellationToken,
    max_line_bytes: usize,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            () = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    warn!("Failed to receive syslog datagram: {e}");
                    continue;
                }
            },
        };

        let line = decode_line(&buf[..len], max_line_bytes);
        if line.is_empty() {
            continue;
        }
        let event = RawEvent::new(EventSource::Syslog(peer.to_string()), line);
        if funnel.send(event).await.is_err() {
            return;
        }
    }
}

/// Moves events from the funnel to the emitter. After cancellation, forwards what the
/// funnel still holds as long as the pipeline is wired.
async fn forward(
    mut funnel: mpsc::Receiver<RawEvent>,
    mut emitter: Emitter<RawEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = funnel.recv() => event,
        };
        let Some(event) = event else {
            return;
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            sent = emitter.emit(event) => if sent.is_err() {
                debug!("Collector output detached");
                return;
            },
        }
    }

    funnel.close();
    let mut forwarded = 0usize;
    let mut dropped = 0usize;
    while let Some(event) = funnel.recv().await {
        if emitter.is_attached() && emitter.emit(event).await.is_ok() {
            forwarded += 1;
        } else {
            dropped += 1;
        }
    }
    debug!(forwarded, dropped, "Collector drained");
}

/// Trims the line terminator, replaces invalid UTF-8 and caps the length on a char
/// boundary.
fn decode_line(raw: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_end_matches(['\n', '\r', '\0']);
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut end = max_bytes;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    fn config_for(path: &Path) -> CollectorConfig {
        CollectorConfig {
            paths: vec![path.to_path_buf()],
            poll_interval_ms: 10,
            read_from_start: true,
            ..CollectorConfig::default()
        }
    }

    async fn next_line(rx: &mut mpsc::Receiver<RawEvent>) -> RawEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a line")
            .expect("collector output closed")
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"sshd[1]: ok\r\n", 100), "sshd[1]: ok");
        assert_eq!(decode_line(b"abcdef\n", 3), "abc");
        assert_eq!(decode_line("héllo".as_bytes(), 2), "h");
        assert_eq!(decode_line(b"\xffbad\n", 100), "\u{fffd}bad");
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        assert!(Collector::new(CollectorConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = Collector::new(config_for(&dir.path().join("absent.log"))).unwrap();
        let (ctx, _handle) = RunContext::standalone(siem_agent_core::StageKind::Collector);

        let err = collector.start(ctx).await.unwrap_err();
        assert!(err.to_string().contains("absent.log"));
        assert!(collector.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_tails_appended_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "existing line").unwrap();

        let mut collector = Collector::new(config_for(file.path())).unwrap();
        let (input, mut rx) = pipeline::input(16);
        pipeline::connect(collector.output_endpoint().unwrap(), input);
        let (ctx, _handle) = RunContext::standalone(siem_agent_core::StageKind::Collector);
        collector.start(ctx).await.unwrap();

        assert_eq!(next_line(&mut rx).await.line, "existing line");

        write!(file, "Failed password for root").unwrap();
        file.flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writeln!(file, " from 10.0.0.9").unwrap();

        let event = next_line(&mut rx).await;
        assert_eq!(event.line, "Failed password for root from 10.0.0.9");
        assert!(matches!(event.source, EventSource::File(_)));

        collector.stop().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_beginning() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first generation line").unwrap();

        let mut collector = Collector::new(config_for(file.path())).unwrap();
        let (input, mut rx) = pipeline::input(16);
        pipeline::connect(collector.output_endpoint().unwrap(), input);
        let (ctx, _handle) = RunContext::standalone(siem_agent_core::StageKind::Collector);
        collector.start(ctx).await.unwrap();
        assert_eq!(next_line(&mut rx).await.line, "first generation line");

        file.as_file().set_len(0).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        writeln!(file, "new").unwrap();

        assert_eq!(next_line(&mut rx).await.line, "new");
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_switches_to_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        let mut old = std::fs::File::create(&path).unwrap();
        for i in 0..5 {
            writeln!(old, "old line {i}").unwrap();
        }

        let mut collector = Collector::new(config_for(&path)).unwrap();
        let (input, mut rx) = pipeline::input(64);
        pipeline::connect(collector.output_endpoint().unwrap(), input);
        let (ctx, _handle) = RunContext::standalone(siem_agent_core::StageKind::Collector);
        collector.start(ctx).await.unwrap();
        for i in 0..5 {
            assert_eq!(next_line(&mut rx).await.line, format!("old line {i}"));
        }

        std::fs::rename(&path, dir.path().join("auth.log.1")).unwrap();
        writeln!(old, "written after rename").unwrap();
        let mut new = std::fs::File::create(&path).unwrap();
        writeln!(new, "NEW after rotation").unwrap();

        assert_eq!(next_line(&mut rx).await.line, "written after rename");
        assert_eq!(next_line(&mut rx).await.line, "NEW after rotation");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "rotated file was read again");

        writeln!(new, "appended to new file").unwrap();
        assert_eq!(next_line(&mut rx).await.line, "appended to new file");
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_line_is_buffered_up_to_limit() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'a'; 10_000]).unwrap();
        file.flush().unwrap();

        let mut tailer = Tailer::open(file.path(), true, 64).await.unwrap();
        assert!(tailer.poll().await.unwrap().is_empty());
        assert_eq!(tailer.pending.len(), 64);
        assert_eq!(tailer.position, 10_000);

        file.write_all(&[b'a'; 10_000]).unwrap();
        writeln!(file, "aaa").unwrap();
        writeln!(file, "short").unwrap();
        file.flush().unwrap();

        let lines = tailer.poll().await.unwrap();
        assert_eq!(lines, vec!["a".repeat(64), "short".to_string()]);
        assert!(tailer.pending.is_empty());
    }

    #[tokio::test]
    async fn test_receives_syslog_datagrams() {
        let config = CollectorConfig {
            syslog_udp_bind: Some("127.0.0.1:0".to_string()),
            ..CollectorConfig::default()
        };
        let mut collector = Collector::new(config).unwrap();
        let (input, mut rx) = pipeline::input(16);
        pipeline::connect(collector.output_endpoint().unwrap(), input);
        let (ctx, _handle) = RunContext::standalone(siem_agent_core::StageKind::Collector);
        collector.start(ctx).await.unwrap();

        let target = collector.syslog_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"<34>Oct 11 22:14:15 host su: 'su root' failed\n", target)
            .await
            .unwrap();

        let event = next_line(&mut rx).await;
        assert_eq!(event.line, "<34>Oct 11 22:14:15 host su: 'su root' failed");
        assert!(matches!(event.source, EventSource::Syslog(_)));
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_wiring_does_not_hang() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "never delivered").unwrap();

        let mut collector = Collector::new(config_for(file.path())).unwrap();
        let _output = collector.output_endpoint().unwrap();
        let (ctx, handle) = RunContext::standalone(siem_agent_core::StageKind::Collector);
        collector.start(ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        handle.shutdown();
        collector.stop().await.unwrap();
        collector.stop().await.unwrap();
    }
}
