//! シリアルセッション
//!
//! 接続済みトランスポートを一つだけ所有し、読み書きと唯一の解放経路を提供する。
//! 読み込みはセッション専用のタスクで行い、受信チャンクを有界キューへ流す。

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cancel::wait_until_set;
use super::connector::AddressGuard;
use super::traits::{DeviceDescriptor, SerialTransport};
use crate::error::{Result, SppError};
use crate::protocol::ServiceIdentifier;

type TransportReader = ReadHalf<Box<dyn SerialTransport>>;
type TransportWriter = WriteHalf<Box<dyn SerialTransport>>;

/// セッション状態
///
/// Connecting → Open → {Closed | Failed}。Closed / Failed からは遷移しない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::Connecting, SessionState::Open) => true,
            (SessionState::Connecting, SessionState::Failed) => true,
            (SessionState::Open, SessionState::Closed) => true,
            (SessionState::Open, SessionState::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// セッションの読み込み設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// 1回の読み込みバッファサイズ（バイト）
    pub read_buffer_size: usize,

    /// 未消費チャンクのキュー長
    pub read_queue_depth: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            read_buffer_size: 1024,
            read_queue_depth: 32,
        }
    }
}

/// セッション統計情報
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub opened_at: DateTime<Utc>,
    pub bytes_read: u64,
    pub chunks_read: u64,
    pub bytes_written: u64,
    pub writes: u64,
}

/// セッションと読み込みタスクの共有部分
struct Shared {
    device: DeviceDescriptor,
    state: Mutex<SessionState>,

    /// トランスポート解放済みフラグ（解放処理を一度だけ実行する）
    released: AtomicBool,

    /// 読み込みタスク・書き込み中の処理への終了通知
    shutdown: watch::Sender<bool>,

    writer: tokio::sync::Mutex<Option<TransportWriter>>,

    /// 読み込みタスクが検出したエラー（一度だけ呼び出し側へ返す）
    failure: Mutex<Option<io::Error>>,

    /// 接続中デバイス集合への登録（解放時に外れる）
    live_guard: Mutex<Option<AddressGuard>>,

    stats: Mutex<SessionStatistics>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            debug!("Session {} state: {} -> {}", self.device.address, *state, next);
            *state = next;
            true
        } else {
            false
        }
    }

    /// トランスポートを解放（二回目以降は何もしない）
    ///
    /// 戻り値の `bool` はこの呼び出しで解放したかどうか。
    async fn release(&self, final_state: SessionState) -> io::Result<bool> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        self.transition(final_state);
        self.shutdown.send_replace(true);
        self.live_guard.lock().take();

        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };

        info!(
            "Session {} released ({})",
            self.device.address,
            self.state()
        );
        result.map(|_| true)
    }

    /// 失敗時の暗黙クローズ（解放エラーはログのみ）
    async fn fail(&self) {
        if let Err(e) = self.release(SessionState::Failed).await {
            warn!(
                "Failed to close transport for {} after I/O error: {}",
                self.device.address, e
            );
        }
    }

    fn record_read(&self, n: usize) {
        let mut stats = self.stats.lock();
        stats.bytes_read += n as u64;
        stats.chunks_read += 1;
    }

    fn record_write(&self, n: usize) {
        let mut stats = self.stats.lock();
        stats.bytes_written += n as u64;
        stats.writes += 1;
    }
}

/// 接続済みシリアルセッション
///
/// `SessionConnector` のみが生成する。Closed / Failed になったセッションは再利用できない。
pub struct SerialSession {
    shared: Arc<Shared>,
    service: ServiceIdentifier,
    chunks: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SerialSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSession")
            .field("device", &self.shared.device)
            .field("service", &self.service)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl SerialSession {
    /// ハンドシェイク済みトランスポートからセッションを開く
    pub(crate) fn open(
        device: DeviceDescriptor,
        service: ServiceIdentifier,
        transport: Box<dyn SerialTransport>,
        options: SessionOptions,
        live_guard: Option<AddressGuard>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let (shutdown, _) = watch::channel(false);
        let (tx, rx) = mpsc::channel(options.read_queue_depth.max(1));

        let shared = Arc::new(Shared {
            device,
            state: Mutex::new(SessionState::Open),
            released: AtomicBool::new(false),
            shutdown,
            writer: tokio::sync::Mutex::new(Some(writer)),
            failure: Mutex::new(None),
            live_guard: Mutex::new(live_guard),
            stats: Mutex::new(SessionStatistics {
                opened_at: Utc::now(),
                bytes_read: 0,
                chunks_read: 0,
                bytes_written: 0,
                writes: 0,
            }),
        });

        let task = tokio::spawn(read_loop(
            shared.clone(),
            reader,
            tx,
            options.read_buffer_size.max(1),
        ));

        info!("Session open: {} [{}]", shared.device, service);

        SerialSession {
            shared,
            service,
            chunks: tokio::sync::Mutex::new(rx),
            reader_task: Mutex::new(Some(task)),
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.shared.device
    }

    pub fn service(&self) -> ServiceIdentifier {
        self.service
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.shared.stats.lock().clone()
    }

    /// 次の受信チャンクを待つ
    ///
    /// - `Ok(Some(chunk))`: 受信順のチャンク
    /// - `Ok(None)`: ピアが切断した、またはセッションがクローズされた（以降も `None`）
    /// - `Err(Io)`: 読み込みエラー（一度だけ返る。セッションは Failed）
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.chunks.lock().await;
        match rx.recv().await {
            Some(chunk) => Ok(Some(chunk)),
            None => match self.shared.failure.lock().take() {
                Some(e) => Err(SppError::Io(e)),
                None => Ok(None),
            },
        }
    }

    /// 受信チャンクのストリーム
    pub fn chunks(&self) -> impl Stream<Item = Result<Vec<u8>>> + '_ {
        futures::stream::unfold(self, |session| async move {
            match session.read_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), session)),
                Ok(None) => None,
                Err(e) => Some((Err(e), session)),
            }
        })
    }

    /// バイト列を送信
    ///
    /// 送信順は呼び出し順。I/Oエラー時はセッションを Failed にして解放する。
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let state = self.state();
        if state != SessionState::Open {
            return Err(SppError::SessionNotOpen(state));
        }

        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SppError::SessionNotOpen(self.state()));
        };

        let closed = wait_until_set(self.shared.shutdown.subscribe());
        let result = tokio::select! {
            biased;
            _ = closed => None,
            res = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => Some(res),
        };
        drop(guard);

        match result {
            None => Err(SppError::SessionNotOpen(self.state())),
            Some(Ok(())) => {
                self.shared.record_write(data.len());
                debug!("Wrote {} bytes to {}", data.len(), self.shared.device.address);
                Ok(())
            }
            Some(Err(e)) => {
                warn!("Write to {} failed: {}", self.shared.device.address, e);
                self.shared.fail().await;
                Err(SppError::Io(e))
            }
        }
    }

    /// セッションをクローズ
    ///
    /// 何度呼んでもよい。トランスポートの解放は一度だけ行われ、
    /// 並行した二回目以降の呼び出しは何もしない。
    pub async fn close(&self) -> Result<()> {
        let released = self.shared.release(SessionState::Closed).await;

        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Read loop for {} ended abnormally: {}", self.shared.device.address, e);
            }
        }

        match released {
            Ok(true) => {
                info!("Session closed: {}", self.shared.device);
                Ok(())
            }
            Ok(false) => {
                debug!("Session {} already released", self.shared.device.address);
                Ok(())
            }
            Err(e) => {
                warn!("Error while closing {}: {}", self.shared.device.address, e);
                Err(SppError::Io(e))
            }
        }
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }

        // close() されずに破棄された場合。書き込み側はここで破棄し、
        // 読み込み側は終了通知を受けたタスクが破棄する
        self.shared.transition(SessionState::Closed);
        self.shared.shutdown.send_replace(true);
        self.shared.live_guard.lock().take();
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
        debug!("Session {} dropped without close", self.shared.device.address);
    }
}

/// 読み込みループ（セッション専用タスク）
async fn read_loop(
    shared: Arc<Shared>,
    mut reader: TransportReader,
    tx: mpsc::Sender<Vec<u8>>,
    buffer_size: usize,
) {
    let closed = wait_until_set(shared.shutdown.subscribe());
    tokio::pin!(closed);
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            biased;
            _ = &mut closed => break,
            res = reader.read(&mut buf) => res,
        };

        match read {
            Ok(0) => {
                info!("Peer {} closed the connection", shared.device.address);
                if let Err(e) = shared.release(SessionState::Closed).await {
                    warn!("Error while closing {} after EOF: {}", shared.device.address, e);
                }
                break;
            }
            Ok(n) => {
                shared.record_read(n);
                debug!("Read {} bytes from {}", n, shared.device.address);
                let chunk = buf[..n].to_vec();

                let sent = tokio::select! {
                    biased;
                    _ = &mut closed => break,
                    sent = tx.send(chunk) => sent,
                };
                if sent.is_err() {
                    // 受信側（セッション）が破棄済み
                    break;
                }
            }
            Err(e) => {
                warn!("Read from {} failed: {}", shared.device.address, e);
                *shared.failure.lock() = Some(e);
                shared.fail().await;
                break;
            }
        }
    }

    debug!("Read loop for {} finished", shared.device.address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor::new("WM1", "98:D3:31:F5:2A:10", true)
    }

    fn open_with_peer(options: SessionOptions) -> (SerialSession, DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let session = SerialSession::open(
            device(),
            ServiceIdentifier::SERIAL_PORT,
            Box::new(local),
            options,
            None,
        );
        (session, remote)
    }

    #[test]
    fn test_state_transitions() {
        assert!(SessionState::Connecting.can_transition_to(SessionState::Open));
        assert!(SessionState::Open.can_transition_to(SessionState::Closed));
        assert!(SessionState::Open.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Closed.can_transition_to(SessionState::Open));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Closed.can_transition_to(SessionState::Failed));
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Open.is_terminal());
    }

    #[tokio::test]
    async fn test_writes_arrive_in_order() {
        let (session, mut peer) = open_with_peer(SessionOptions::default());

        session.write(b"b1").await.unwrap();
        session.write(b"b2").await.unwrap();
        session.write(b"b3").await.unwrap();

        let mut received = [0u8; 6];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"b1b2b3");

        let stats = session.statistics();
        assert_eq!(stats.bytes_written, 6);
        assert_eq!(stats.writes, 3);
    }

    #[tokio::test]
    async fn test_reads_preserve_order_and_end_on_peer_close() {
        let (session, mut peer) = open_with_peer(SessionOptions {
            read_buffer_size: 4,
            read_queue_depth: 2,
        });

        peer.write_all(b"hello world").await.unwrap();
        drop(peer);

        let mut received = Vec::new();
        while let Some(chunk) = session.read_chunk().await.unwrap() {
            assert!(chunk.len() <= 4);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"hello world");
        assert_eq!(session.state(), SessionState::Closed);

        // 一度尽きたら再開しない
        assert_eq!(session.read_chunk().await.unwrap(), None);
        assert!(matches!(
            session.write(b"x").await,
            Err(SppError::SessionNotOpen(SessionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_chunks_stream() {
        use futures::StreamExt;

        let (session, mut peer) = open_with_peer(SessionOptions::default());
        peer.write_all(b"abc").await.unwrap();
        peer.shutdown().await.unwrap();
        drop(peer);

        let collected: Vec<u8> = session
            .chunks()
            .map(|chunk| chunk.unwrap())
            .concat()
            .await;
        assert_eq!(collected, b"abc");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, mut peer) = open_with_peer(SessionOptions::default());

        session.close().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        // 対向側はEOFを観測する
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        assert_eq!(session.read_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_reader() {
        let (session, _peer) = open_with_peer(SessionOptions::default());
        let session = Arc::new(session);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.read_chunk().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (session, _peer) = open_with_peer(SessionOptions::default());
        let session = Arc::new(session);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move { session.close().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_drop_without_close_releases_transport() {
        let (session, mut peer) = open_with_peer(SessionOptions::default());
        drop(session);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
