// manager.rs - Device link: connection state machine, reader task, reconnect loop
//
// The reader task is the only thing that reads the stream. It frames lines,
// decodes them and publishes readings. When the stream ends or goes silent it
// either starts the reconnect loop or drops back to Disconnected, depending
// on the auto-reconnect switch. Commands go through one async writer lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::error::{DecodeError, LinkError};
use crate::packet::PacketDecoder;
use crate::types::SensorReading;

use super::backoff::Backoff;
use super::command::DeviceCommand;
use super::framing::{FramedLine, LineFramer};
use super::state::ConnectionState;
use super::transport::Transport;

const READ_CHUNK: usize = 1_024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub lines: u64,
    pub readings: u64,
    pub replies: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct LinkTasks {
    reader: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
}

struct LinkInner<T: Transport> {
    transport: T,
    config: LinkConfig,
    state_tx: watch::Sender<ConnectionState>,
    readings_tx: broadcast::Sender<SensorReading>,
    writer: tokio::sync::Mutex<Option<WriteHalf<T::Stream>>>,
    connect_lock: tokio::sync::Mutex<()>,
    auto_reconnect: AtomicBool,
    tasks: Mutex<LinkTasks>,
    decoder: PacketDecoder,
    lines: AtomicU64,
    reconnects: AtomicU64,
}

impl<T: Transport> LinkInner<T> {
    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Apply `next` if it is a legal edge. Returns false when rejected.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut rejected_from = None;
        let changed = self.state_tx.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                rejected_from = Some(current.label());
                return false;
            }
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });

        match rejected_from {
            Some(from) => {
                warn!("[link] rejected transition {} -> {}", from, next.label());
                false
            }
            None => {
                if changed {
                    info!("[link] {}", next);
                }
                true
            }
        }
    }

    fn tasks(&self) -> MutexGuard<'_, LinkTasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_reader(&self) {
        if let Some(token) = self.tasks().reader.take() {
            token.cancel();
        }
    }

    fn cancel_reconnect(&self) -> bool {
        match self.tasks().reconnect.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn handle_line(&self, framed: FramedLine) {
        match framed {
            FramedLine::Line(line) => {
                self.lines.fetch_add(1, Ordering::Relaxed);
                if let Some(reading) = self.decoder.decode(&line, Utc::now()) {
                    // no subscribers is not an error
                    let _ = self.readings_tx.send(reading);
                }
            }
            FramedLine::Oversized(bytes) => {
                self.decoder.record_malformed();
                let reason = DecodeError::Oversized(self.config.max_line_bytes);
                warn!("[link] discarded {} byte line: {}", bytes, reason);
            }
        }
    }

    async fn release_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("[link] writer shutdown: {}", e);
            }
        }
    }
}

/// Connection to the sensor device over a [`Transport`].
///
/// Cheap to clone; clones share the same connection.
pub struct DeviceLink<T: Transport> {
    inner: Arc<LinkInner<T>>,
}

impl<T: Transport> Clone for DeviceLink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> DeviceLink<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (readings_tx, _) = broadcast::channel(config.reading_channel_capacity.max(1));
        Self {
            inner: Arc::new(LinkInner {
                transport,
                config,
                state_tx,
                readings_tx,
                writer: tokio::sync::Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                auto_reconnect: AtomicBool::new(false),
                tasks: Mutex::new(LinkTasks::default()),
                decoder: PacketDecoder::new(),
                lines: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_readings(&self) -> broadcast::Receiver<SensorReading> {
        self.inner.readings_tx.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        let decoded = self.inner.decoder.stats();
        LinkStats {
            lines: self.inner.lines.load(Ordering::Relaxed),
            readings: decoded.readings,
            replies: decoded.replies,
            malformed: decoded.malformed,
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
        }
    }

    pub fn is_auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Open the link. Does nothing if already connecting or connected.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let inner = &self.inner;
        inner.cancel_reconnect();
        let _guard = inner.connect_lock.lock().await;

        match inner.state() {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            ConnectionState::Reconnecting { .. } => {
                inner.set_state(ConnectionState::Disconnected);
            }
            _ => {}
        }

        inner.set_state(ConnectionState::Connecting);
        info!("[link] connecting to {}", inner.transport.describe());

        if let Err(e) = inner.transport.check_available() {
            warn!("[link] {}", e);
            inner.set_state(ConnectionState::from_error(&e));
            return Err(e);
        }

        let timeout = inner.config.connect_timeout();
        let opened = match tokio::time::timeout(timeout, inner.transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::ConnectTimeout(timeout.as_millis() as u64)),
        };

        match opened {
            Ok(stream) => {
                if attach(inner, stream).await {
                    Ok(())
                } else {
                    Err(LinkError::ConnectionLost(
                        "link closed while connecting".to_string(),
                    ))
                }
            }
            Err(e) => {
                warn!("[link] connect failed: {}", e);
                inner.set_state(ConnectionState::from_error(&e));
                Err(e)
            }
        }
    }

    /// Close the link and stop any background work. Always safe.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.cancel_reconnect();
        inner.cancel_reader();
        let _guard = inner.connect_lock.lock().await;
        // a reader attached while waiting for the lock
        inner.cancel_reader();
        inner.release_writer().await;
        inner.set_state(ConnectionState::Disconnected);
    }

    /// Write one newline-terminated command. False when not connected or the write fails.
    pub async fn send_command(&self, text: &str) -> bool {
        if !self.inner.state().is_connected() {
            debug!("[link] not connected, dropping command {:?}", text);
            return false;
        }

        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return false;
        };

        let mut line = text.trim_end().to_string();
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                debug!("[link] sent {}", line.trim_end());
                true
            }
            Err(e) => {
                warn!("[link] command write failed: {}", e);
                false
            }
        }
    }

    pub async fn send(&self, command: DeviceCommand) -> bool {
        self.send_command(&command.to_string()).await
    }

    pub fn start_auto_reconnect(&self) {
        self.inner.auto_reconnect.store(true, Ordering::SeqCst);
    }

    /// Disable reconnection and cancel a running reconnect loop.
    pub fn stop_auto_reconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);
        if self.inner.cancel_reconnect()
            && matches!(self.inner.state(), ConnectionState::Reconnecting { .. })
        {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }

    /// Start the reconnect loop from a retryable Error, e.g. after a failed
    /// first connect. Returns false when not applicable.
    pub fn retry_in_background(&self) -> bool {
        let retryable = matches!(
            self.inner.state(),
            ConnectionState::Error { retryable: true, .. }
        );
        if retryable && self.is_auto_reconnect() {
            spawn_reconnect(&self.inner);
            true
        } else {
            false
        }
    }
}

// ─── Background tasks ────────────────────────────────────────────────────────
//
// Spawning goes through plain functions so the reader and reconnect futures
// never contain each other.

async fn attach<T: Transport>(inner: &Arc<LinkInner<T>>, stream: T::Stream) -> bool {
    let (read, write) = tokio::io::split(stream);
    *inner.writer.lock().await = Some(write);

    if !inner.set_state(ConnectionState::Connected) {
        inner.writer.lock().await.take();
        return false;
    }

    spawn_reader(inner, read);
    true
}

fn spawn_reader<T: Transport>(inner: &Arc<LinkInner<T>>, read: ReadHalf<T::Stream>) {
    let token = CancellationToken::new();
    if let Some(previous) = inner.tasks().reader.replace(token.clone()) {
        previous.cancel();
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        if let Some(reason) = read_loop(&inner, read, &token).await {
            if !token.is_cancelled() {
                handle_loss(&inner, reason).await;
            }
        }
    });
}

async fn read_loop<T: Transport>(
    inner: &LinkInner<T>,
    mut read: ReadHalf<T::Stream>,
    token: &CancellationToken,
) -> Option<LinkError> {
    let mut framer = LineFramer::new(inner.config.max_line_bytes);
    let mut buf = vec![0u8; READ_CHUNK];
    let silence = inner.config.silence_timeout();

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return None,
            result = read_with_watchdog(&mut read, &mut buf, silence) => result,
        };

        match result {
            Ok(0) => {
                return Some(LinkError::ConnectionLost(
                    "device closed the stream".to_string(),
                ))
            }
            Ok(n) => {
                for framed in framer.push(&buf[..n]) {
                    inner.handle_line(framed);
                }
            }
            Err(e) => return Some(e),
        }
    }
}

async fn read_with_watchdog<R: AsyncRead + Unpin>(
    read: &mut R,
    buf: &mut [u8],
    silence: Option<Duration>,
) -> Result<usize, LinkError> {
    let result = match silence {
        Some(limit) => match tokio::time::timeout(limit, read.read(buf)).await {
            Ok(result) => result,
            Err(_) => {
                return Err(LinkError::ConnectionLost(format!(
                    "no data for {} ms",
                    limit.as_millis()
                )))
            }
        },
        None => read.read(buf).await,
    };
    result.map_err(|e| LinkError::ConnectionLost(e.to_string()))
}

async fn handle_loss<T: Transport>(inner: &Arc<LinkInner<T>>, reason: LinkError) {
    inner.release_writer().await;

    if inner.auto_reconnect.load(Ordering::SeqCst) {
        warn!("[link] connection lost: {}, reconnecting", reason);
        spawn_reconnect(inner);
    } else {
        warn!("[link] connection lost: {}, auto-reconnect off", reason);
        inner.set_state(ConnectionState::Disconnected);
    }
}

fn spawn_reconnect<T: Transport>(inner: &Arc<LinkInner<T>>) {
    let token = CancellationToken::new();
    if let Some(previous) = inner.tasks().reconnect.replace(token.clone()) {
        previous.cancel();
    }

    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        reconnect_loop(&inner, &token).await;
    });
}

async fn reconnect_loop<T: Transport>(inner: &Arc<LinkInner<T>>, token: &CancellationToken) {
    let mut backoff = Backoff::new(inner.config.backoff.clone());
    let timeout = inner.config.connect_timeout();

    loop {
        let Some(attempt) = backoff.next_attempt() else {
            let e = LinkError::MaxRetryReached(backoff.max_attempts());
            error!("[link] {}", e);
            inner.set_state(ConnectionState::from_error(&e));
            return;
        };

        let scheduled = inner.set_state(ConnectionState::Reconnecting {
            attempt: attempt.number,
            max_attempts: attempt.max_attempts,
            next_delay_ms: attempt.delay.as_millis() as u64,
        });
        if !scheduled {
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(attempt.delay) => {}
        }

        if let Err(e) = inner.transport.check_available() {
            warn!("[link] reconnect aborted: {}", e);
            inner.set_state(ConnectionState::from_error(&e));
            return;
        }

        let opened = tokio::select! {
            _ = token.cancelled() => return,
            opened = tokio::time::timeout(timeout, inner.transport.open()) => opened,
        };

        match opened {
            Ok(Ok(stream)) => {
                let _guard = inner.connect_lock.lock().await;
                if token.is_cancelled() {
                    return;
                }
                if attach(inner, stream).await {
                    inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    backoff.record_success();
                    info!("[link] reconnected after {} attempt(s)", attempt.number);
                }
                return;
            }
            Ok(Err(e)) if !e.is_retryable() => {
                warn!("[link] reconnect aborted: {}", e);
                inner.set_state(ConnectionState::from_error(&e));
                return;
            }
            Ok(Err(e)) => {
                warn!("[link] reconnect failed: {} [{}]", e, backoff.status());
            }
            Err(_) => {
                warn!(
                    "[link] reconnect attempt {}/{} timed out",
                    attempt.number, attempt.max_attempts
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::error::LinkErrorKind;
    use std::collections::VecDeque;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::time::Instant;

    enum Script {
        Stream(DuplexStream),
        Fail(LinkError),
        Hang,
    }

    /// Scripted transport over in-memory duplex pipes
    struct MockTransport {
        available: Mutex<Result<(), LinkError>>,
        script: Mutex<VecDeque<Script>>,
        opens: Mutex<Vec<Instant>>,
    }

    impl MockTransport {
        fn new(script: Vec<Script>) -> Self {
            Self {
                available: Mutex::new(Ok(())),
                script: Mutex::new(script.into()),
                opens: Mutex::new(Vec::new()),
            }
        }

        fn opens(&self) -> Vec<Instant> {
            self.opens.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        type Stream = DuplexStream;

        fn describe(&self) -> String {
            "mock".to_string()
        }

        fn check_available(&self) -> Result<(), LinkError> {
            self.available.lock().unwrap().clone()
        }

        async fn open(&self) -> Result<DuplexStream, LinkError> {
            self.opens.lock().unwrap().push(Instant::now());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Script::Stream(stream)) => Ok(stream),
                Some(Script::Fail(e)) => Err(e),
                Some(Script::Hang) => std::future::pending().await,
                None => Err(LinkError::ConnectionLost("device out of range".to_string())),
            }
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            backoff: BackoffConfig::default(),
            connect_timeout_ms: 10_000,
            silence_timeout_ms: None,
            max_line_bytes: 128,
            reading_channel_capacity: 64,
        }
    }

    fn link_with(script: Vec<Script>, config: LinkConfig) -> DeviceLink<MockTransport> {
        DeviceLink::new(MockTransport::new(script), config)
    }

    fn pipe() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(4_096)
    }

    async fn wait_for_state(
        link: &DeviceLink<MockTransport>,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = link.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(300), rx.wait_for(predicate))
            .await
            .expect("state not reached")
            .expect("link dropped");
        state.clone()
    }

    #[tokio::test]
    async fn test_connect_publishes_readings() {
        let (device, mut peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        let mut readings = link.subscribe_readings();

        link.connect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);

        peer.write_all(b"DATA,1,10,0.5,12.0,0.3\ngarbage\nDATA,2,2").await.unwrap();
        peer.write_all(b"0,1.0,12.0,0.3\r\nACK:START\n").await.unwrap();

        assert_eq!(readings.recv().await.unwrap().sequence, 1);
        let second = readings.recv().await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.device_millis, 20);

        // the reply line is processed after the second reading
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = link.stats();
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.readings, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.replies, 1);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (device, _peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        link.connect().await.unwrap();
        link.connect().await.unwrap();
        assert_eq!(link.transport().opens().len(), 1);
    }

    #[tokio::test]
    async fn test_send_command_requires_connection() {
        let (device, peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        assert!(!link.send(DeviceCommand::Start).await);

        link.connect().await.unwrap();
        assert!(link.send(DeviceCommand::Start).await);

        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "CMD:START");
    }

    #[tokio::test]
    async fn test_concurrent_commands_do_not_interleave() {
        let (device, peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        link.connect().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let link = link.clone();
            handles.push(tokio::spawn(async move {
                link.send_command(&format!("CMD:STATUS,TAG={:04}", i)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let mut lines = BufReader::new(peer).lines();
        let mut seen = Vec::new();
        for _ in 0..20 {
            let line = lines.next_line().await.unwrap().unwrap();
            assert!(line.starts_with("CMD:STATUS,TAG="));
            assert_eq!(line.len(), "CMD:STATUS,TAG=0000".len());
            seen.push(line);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_unavailable_adapter_fails_fast() {
        let link = link_with(vec![], config());
        *link.transport().available.lock().unwrap() =
            Err(LinkError::Disabled("adapter off".to_string()));
        link.start_auto_reconnect();

        let err = link.connect().await.unwrap_err();
        assert_eq!(err.kind(), LinkErrorKind::LinkDisabled);
        match link.state() {
            ConnectionState::Error { kind, retryable, .. } => {
                assert_eq!(kind, LinkErrorKind::LinkDisabled);
                assert!(!retryable);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!link.retry_in_background());
        assert!(link.transport().opens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_then_manual_retry() {
        let (device, _peer) = pipe();
        let link = link_with(vec![Script::Hang, Script::Stream(device)], config());

        let started = Instant::now();
        let err = link.connect().await.unwrap_err();
        assert_eq!(err, LinkError::ConnectTimeout(10_000));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(matches!(
            link.state(),
            ConnectionState::Error { retryable: true, .. }
        ));

        link.connect().await.unwrap();
        assert!(link.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_then_max_retry() {
        let (device, peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        link.start_auto_reconnect();
        link.connect().await.unwrap();

        let lost_at = Instant::now();
        drop(peer);

        let state = wait_for_state(&link, |s| {
            matches!(s, ConnectionState::Error { kind: LinkErrorKind::MaxRetryReached, .. })
        })
        .await;
        assert!(matches!(state, ConnectionState::Error { retryable: false, .. }));

        let opens = link.transport().opens();
        assert_eq!(opens.len(), 6);

        let mut previous = lost_at;
        for (open, expected_ms) in opens[1..].iter().zip([1_000i64, 2_000, 4_000, 8_000, 16_000]) {
            let gap_ms = (*open - previous).as_millis() as i64;
            assert!(
                (gap_ms - expected_ms).abs() <= 2,
                "expected ~{} ms between attempts, got {} ms",
                expected_ms,
                gap_ms
            );
            previous = *open;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_resumes_readings() {
        let (first, first_peer) = pipe();
        let (second, mut second_peer) = pipe();
        let link = link_with(
            vec![
                Script::Stream(first),
                Script::Fail(LinkError::ConnectionLost("refused".to_string())),
                Script::Stream(second),
            ],
            config(),
        );
        link.start_auto_reconnect();
        link.connect().await.unwrap();
        let mut readings = link.subscribe_readings();

        drop(first_peer);
        wait_for_state(&link, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        wait_for_state(&link, |s| s.is_connected()).await;

        second_peer.write_all(b"DATA,9,900,4.5,20.0,0.4\n").await.unwrap();
        assert_eq!(readings.recv().await.unwrap().sequence, 9);
        assert_eq!(link.stats().reconnects, 1);
        assert_eq!(link.transport().opens().len(), 3);
        assert!(link.send(DeviceCommand::Status).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_ends_reconnect_loop() {
        let (device, peer) = pipe();
        let link = link_with(
            vec![
                Script::Stream(device),
                Script::Fail(LinkError::DeviceNotFound("unpaired".to_string())),
            ],
            config(),
        );
        link.start_auto_reconnect();
        link.connect().await.unwrap();
        drop(peer);

        let state = wait_for_state(&link, |s| matches!(s, ConnectionState::Error { .. })).await;
        assert!(matches!(
            state,
            ConnectionState::Error { kind: LinkErrorKind::DeviceNotFound, retryable: false, .. }
        ));
        assert_eq!(link.transport().opens().len(), 2);
    }

    #[tokio::test]
    async fn test_loss_without_auto_reconnect_disconnects() {
        let (device, peer) = pipe();
        let (second, _second_peer) = pipe();
        let link = link_with(vec![Script::Stream(device), Script::Stream(second)], config());
        link.connect().await.unwrap();
        drop(peer);

        let state = wait_for_state(&link, |s| *s == ConnectionState::Disconnected).await;
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(!link.send(DeviceCommand::Stop).await);
        assert_eq!(link.transport().opens().len(), 1);

        link.connect().await.unwrap();
        assert!(link.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_watchdog_reports_loss() {
        let (device, _peer) = pipe();
        let link = link_with(
            vec![Script::Stream(device)],
            LinkConfig {
                silence_timeout_ms: Some(2_000),
                ..config()
            },
        );
        link.connect().await.unwrap();
        let connected_at = Instant::now();

        let state = wait_for_state(&link, |s| *s == ConnectionState::Disconnected).await;
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(connected_at.elapsed() >= Duration::from_secs(2));
        assert_eq!(link.stats().reconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_reconnect_loop() {
        let (device, peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        link.start_auto_reconnect();
        link.connect().await.unwrap();
        drop(peer);

        wait_for_state(&link, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(link.transport().opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_reconnect_attach_leaves_no_reader() {
        let (first, first_peer) = pipe();
        let (second, mut second_peer) = pipe();
        let link = link_with(vec![Script::Stream(first), Script::Stream(second)], config());
        link.start_auto_reconnect();
        link.connect().await.unwrap();
        drop(first_peer);
        wait_for_state(&link, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;

        // hold the connect lock so the reconnect loop opens the stream and
        // then waits to attach it
        let guard = link.inner.connect_lock.lock().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(link.transport().opens().len(), 2);

        let disconnecting = {
            let link = link.clone();
            tokio::spawn(async move { link.disconnect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        disconnecting.await.unwrap();

        assert_eq!(link.state(), ConnectionState::Disconnected);
        // the reopened stream was dropped, not handed to a reader
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(1), second_peer.read(&mut buf))
            .await
            .expect("stream still open");
        assert_eq!(read.unwrap(), 0);
        assert_eq!(link.stats().reconnects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_auto_reconnect_cancels_loop() {
        let (device, peer) = pipe();
        let link = link_with(vec![Script::Stream(device)], config());
        link.start_auto_reconnect();
        link.connect().await.unwrap();
        drop(peer);

        wait_for_state(&link, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        link.stop_auto_reconnect();
        assert_eq!(link.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(link.transport().opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_connect_can_start_loop() {
        let (device, _peer) = pipe();
        let link = link_with(
            vec![
                Script::Fail(LinkError::ConnectionLost("refused".to_string())),
                Script::Stream(device),
            ],
            config(),
        );
        link.start_auto_reconnect();
        assert!(link.connect().await.is_err());
        assert!(link.retry_in_background());

        wait_for_state(&link, |s| s.is_connected()).await;
        assert_eq!(link.stats().reconnects, 1);
    }
}
