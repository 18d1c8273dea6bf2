//! インメモリのループバックプラットフォーム（テスト・デモ用）
//!
//! ハンドシェイクが成功すると `tokio::io::duplex` の片端をセッションへ渡し、
//! もう片端を `LoopbackPeer` として取り出せる。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

use super::traits::{
    normalize_address, BluetoothPlatform, ChannelReservation, DeviceDescriptor, EnableOutcome,
    PermissionScope, RadioState, SerialTransport,
};
use crate::error::{Result, SppError};
use crate::protocol::ServiceIdentifier;

const DUPLEX_CAPACITY: usize = 4096;

/// ハンドシェイクの振る舞い
#[derive(Debug)]
pub enum HandshakeScript {
    /// 即座に成功
    Accept,
    /// 指定時間後に成功
    AcceptAfter(Duration),
    /// 指定メッセージで失敗
    Reject(String),
    /// 完了しない
    Hang,
    /// ゲートが開いたら成功、ゲートが破棄されたら失敗
    Gated(oneshot::Receiver<()>),
}

/// トランスポートの解放・故障注入用プローブ
#[derive(Debug, Default)]
pub struct TransportProbe {
    shutdowns: AtomicUsize,
    drops: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl TransportProbe {
    /// 書き込み側のシャットダウン回数
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// ハンドル破棄回数
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// 以降の読み込みを失敗させる（次にピアがデータを送った時点で発火）
    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    /// 以降の書き込みを失敗させる
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

/// 計数付きトランスポート
#[derive(Debug)]
struct CountingTransport {
    inner: DuplexStream,
    probe: Arc<TransportProbe>,
}

impl AsyncRead for CountingTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.probe.fail_reads.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "loopback read failure",
            )));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.probe.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "loopback write failure",
            )));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for CountingTransport {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// セッションの対向側
#[derive(Debug)]
pub struct LoopbackPeer {
    pub stream: DuplexStream,
    pub probe: Arc<TransportProbe>,
}

#[derive(Debug, Default)]
struct Counters {
    enable_flows: AtomicUsize,
    bonded_queries: AtomicUsize,
    reservations_opened: AtomicUsize,
    reservations_released: AtomicUsize,
    handshakes_active: AtomicUsize,
    handshakes_max: AtomicUsize,
}

#[derive(Debug)]
struct LoopbackState {
    radio: RadioState,
    devices: Vec<DeviceDescriptor>,
    revoked: Vec<PermissionScope>,
    enable_gate: Option<oneshot::Receiver<EnableOutcome>>,
    scripts: HashMap<String, Vec<HandshakeScript>>,
    peers: HashMap<String, Vec<LoopbackPeer>>,
}

/// ループバックプラットフォーム
#[derive(Debug)]
pub struct LoopbackPlatform {
    state: Arc<Mutex<LoopbackState>>,
    counters: Arc<Counters>,
}

impl LoopbackPlatform {
    /// 無線有効・ペアリング済みデバイスなしで作成
    pub fn new() -> Self {
        LoopbackPlatform {
            state: Arc::new(Mutex::new(LoopbackState {
                radio: RadioState::Enabled,
                devices: Vec::new(),
                revoked: Vec::new(),
                enable_gate: None,
                scripts: HashMap::new(),
                peers: HashMap::new(),
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn set_radio_state(&self, radio: RadioState) {
        self.state.lock().radio = radio;
    }

    pub fn add_bonded_device(&self, device: DeviceDescriptor) {
        self.state.lock().devices.push(device);
    }

    pub fn revoke_permission(&self, scope: PermissionScope) {
        self.state.lock().revoked.push(scope);
    }

    /// 次の有効化フローをゲートで止める。送信した結果でフローが完了する
    pub fn gate_enable_flow(&self) -> oneshot::Sender<EnableOutcome> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().enable_gate = Some(rx);
        tx
    }

    /// 指定アドレスの次回ハンドシェイクの振る舞いを設定（先入れ先出し）
    pub fn script_handshake(&self, address: &str, script: HandshakeScript) {
        self.state
            .lock()
            .scripts
            .entry(normalize_address(address))
            .or_default()
            .push(script);
    }

    /// ゲート付きハンドシェイクを設定し、ゲートを返す
    pub fn gate_handshake(&self, address: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.script_handshake(address, HandshakeScript::Gated(rx));
        tx
    }

    /// 接続済みセッションの対向側を取り出す
    pub fn take_peer(&self, address: &str) -> Option<LoopbackPeer> {
        let mut state = self.state.lock();
        let peers = state.peers.get_mut(&normalize_address(address))?;
        if peers.is_empty() {
            None
        } else {
            Some(peers.remove(0))
        }
    }

    pub fn enable_flow_count(&self) -> usize {
        self.counters.enable_flows.load(Ordering::SeqCst)
    }

    pub fn bonded_query_count(&self) -> usize {
        self.counters.bonded_queries.load(Ordering::SeqCst)
    }

    pub fn reservations_opened(&self) -> usize {
        self.counters.reservations_opened.load(Ordering::SeqCst)
    }

    pub fn reservations_released(&self) -> usize {
        self.counters.reservations_released.load(Ordering::SeqCst)
    }

    /// 同時に実行されたハンドシェイク数の最大値
    pub fn max_concurrent_handshakes(&self) -> usize {
        self.counters.handshakes_max.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BluetoothPlatform for LoopbackPlatform {
    async fn radio_state(&self) -> RadioState {
        self.state.lock().radio
    }

    async fn request_enable(&self) -> Result<EnableOutcome> {
        self.counters.enable_flows.fetch_add(1, Ordering::SeqCst);
        let gate = self.state.lock().enable_gate.take();

        let outcome = match gate {
            Some(gate) => gate.await.unwrap_or(EnableOutcome::Cancelled),
            None => EnableOutcome::Enabled,
        };
        if outcome == EnableOutcome::Enabled {
            self.state.lock().radio = RadioState::Enabled;
        }
        Ok(outcome)
    }

    async fn check_permission(&self, scope: PermissionScope) -> Result<()> {
        if self.state.lock().revoked.contains(&scope) {
            return Err(SppError::PermissionDenied(format!("{:?} permission revoked", scope)));
        }
        Ok(())
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.counters.bonded_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().devices.clone())
    }

    async fn open_channel(
        &self,
        device: &DeviceDescriptor,
        service: &ServiceIdentifier,
    ) -> Result<Box<dyn ChannelReservation>> {
        let address = device.address_key();
        let script = {
            let mut state = self.state.lock();
            match state.scripts.get_mut(&address) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => HandshakeScript::Accept,
            }
        };
        self.counters.reservations_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(LoopbackReservation {
            address,
            service: *service,
            script: Some(script),
            state: self.state.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct LoopbackReservation {
    address: String,
    service: ServiceIdentifier,
    script: Option<HandshakeScript>,
    state: Arc<Mutex<LoopbackState>>,
    counters: Arc<Counters>,
}

/// 実行中ハンドシェイク数の計数
struct ActiveHandshake<'a>(&'a Counters);

impl<'a> ActiveHandshake<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let active = counters.handshakes_active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.handshakes_max.fetch_max(active, Ordering::SeqCst);
        ActiveHandshake(counters)
    }
}

impl Drop for ActiveHandshake<'_> {
    fn drop(&mut self) {
        self.0.handshakes_active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoopbackReservation {
    fn accept(&self) -> Box<dyn SerialTransport> {
        let (local, remote) = tokio::io::duplex(DUPLEX_CAPACITY);
        let probe = Arc::new(TransportProbe::default());
        self.state
            .lock()
            .peers
            .entry(self.address.clone())
            .or_default()
            .push(LoopbackPeer {
                stream: remote,
                probe: probe.clone(),
            });
        Box::new(CountingTransport {
            inner: local,
            probe,
        })
    }
}

#[async_trait]
impl ChannelReservation for LoopbackReservation {
    async fn handshake(&mut self) -> Result<Box<dyn SerialTransport>> {
        let script = self
            .script
            .take()
            .ok_or_else(|| SppError::ConnectFailed("Handshake already attempted".to_string()))?;
        let counters = self.counters.clone();
        let _active = ActiveHandshake::enter(&counters);

        match script {
            HandshakeScript::Accept => Ok(self.accept()),
            HandshakeScript::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept())
            }
            HandshakeScript::Reject(reason) => Err(SppError::ConnectFailed(format!(
                "{} rejected {}: {}",
                self.address, self.service, reason
            ))),
            HandshakeScript::Hang => std::future::pending().await,
            HandshakeScript::Gated(gate) => match gate.await {
                Ok(()) => Ok(self.accept()),
                Err(_) => Err(SppError::ConnectFailed(format!("{} gate dropped", self.address))),
            },
        }
    }

    async fn release(self: Box<Self>) {
        self.counters
            .reservations_released
            .fetch_add(1, Ordering::SeqCst);
    }
}
