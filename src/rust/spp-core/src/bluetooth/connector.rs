//! セッションコネクター
//!
//! デバイスとサービスUUIDからチャネルを予約し、ハンドシェイクを別タスクで実行して
//! `SerialSession` を生成する。同一アドレスへの並行した接続試行は受け付けない。

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::cancel::CancelHandle;
use super::radio::RadioController;
use super::session::{SerialSession, SessionOptions};
use super::traits::{BluetoothPlatform, DeviceDescriptor, PermissionScope};
use crate::error::{Result, SppError};
use crate::protocol::ServiceIdentifier;

/// 接続試行中・接続中のアドレス集合
#[derive(Debug, Default)]
struct DeviceSets {
    connecting: HashSet<String>,
    live: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardKind {
    Connecting,
    Live,
}

/// アドレス集合への登録（破棄時に登録解除）
pub(crate) struct AddressGuard {
    sets: Arc<Mutex<DeviceSets>>,
    key: String,
    kind: GuardKind,
}

impl fmt::Debug for AddressGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressGuard")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}

impl AddressGuard {
    /// 接続試行中 → 接続中へ移す（空白期間なし）
    fn promote(self) -> AddressGuard {
        let live = AddressGuard {
            sets: self.sets.clone(),
            key: self.key.clone(),
            kind: GuardKind::Live,
        };
        live.sets.lock().live.insert(live.key.clone());
        drop(self);
        live
    }
}

impl Drop for AddressGuard {
    fn drop(&mut self) {
        let mut sets = self.sets.lock();
        match self.kind {
            GuardKind::Connecting => sets.connecting.remove(&self.key),
            GuardKind::Live => sets.live.remove(&self.key),
        };
    }
}

/// セッションコネクター
#[derive(Clone)]
pub struct SessionConnector {
    platform: Arc<dyn BluetoothPlatform>,
    radio: RadioController,
    sets: Arc<Mutex<DeviceSets>>,
    options: SessionOptions,
}

impl SessionConnector {
    /// 新しいコネクターを作成
    pub fn new(platform: Arc<dyn BluetoothPlatform>, radio: RadioController) -> Self {
        SessionConnector {
            platform,
            radio,
            sets: Arc::new(Mutex::new(DeviceSets::default())),
            options: SessionOptions::default(),
        }
    }

    /// 生成するセッションの読み込み設定
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// 指定アドレスへの接続試行が進行中か
    pub fn is_connecting(&self, address: &str) -> bool {
        self.sets
            .lock()
            .connecting
            .contains(&super::traits::normalize_address(address))
    }

    /// 指定アドレスのセッションが開いているか
    pub fn has_live_session(&self, address: &str) -> bool {
        self.sets
            .lock()
            .live
            .contains(&super::traits::normalize_address(address))
    }

    fn acquire(&self, device: &DeviceDescriptor) -> Result<AddressGuard> {
        let key = device.address_key();
        let mut sets = self.sets.lock();

        if sets.live.contains(&key) {
            return Err(SppError::AlreadyConnected(device.address.clone()));
        }
        if !sets.connecting.insert(key.clone()) {
            return Err(SppError::AlreadyConnecting(device.address.clone()));
        }

        Ok(AddressGuard {
            sets: self.sets.clone(),
            key,
            kind: GuardKind::Connecting,
        })
    }

    /// 接続を開始
    ///
    /// 即座に `PendingConnect` を返し、接続処理はバックグラウンドタスクで行う。
    /// ハンドシェイクは `timeout` 経過または取消で打ち切られる。
    pub fn connect(
        &self,
        device: &DeviceDescriptor,
        service: ServiceIdentifier,
        timeout: Duration,
    ) -> PendingConnect {
        let cancel = CancelHandle::new();
        let (tx, rx) = oneshot::channel();
        let pending = PendingConnect {
            device: device.clone(),
            cancel: cancel.clone(),
            rx,
        };

        let guard = match self.acquire(device) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Rejected connect to {}: {}", device, e);
                let _ = tx.send(Err(e));
                return pending;
            }
        };

        let attempt = ConnectAttempt {
            platform: self.platform.clone(),
            radio: self.radio.clone(),
            device: device.clone(),
            service,
            timeout,
            options: self.options,
            cancel,
        };

        tokio::spawn(async move {
            let address = attempt.device.address.clone();
            let result = attempt.run(guard).await;
            if let Err(unclaimed) = tx.send(result) {
                // 呼び出し側が PendingConnect を破棄済み
                if let Ok(session) = unclaimed {
                    warn!("Connect result for {} was not claimed; closing session", address);
                    if let Err(e) = session.close().await {
                        warn!("Failed to close unclaimed session for {}: {}", address, e);
                    }
                }
            }
        });

        pending
    }

    /// 接続して結果を待つ
    pub async fn connect_and_wait(
        &self,
        device: &DeviceDescriptor,
        service: ServiceIdentifier,
        timeout: Duration,
    ) -> Result<SerialSession> {
        self.connect(device, service, timeout).outcome().await
    }
}

struct ConnectAttempt {
    platform: Arc<dyn BluetoothPlatform>,
    radio: RadioController,
    device: DeviceDescriptor,
    service: ServiceIdentifier,
    timeout: Duration,
    options: SessionOptions,
    cancel: CancelHandle,
}

impl ConnectAttempt {
    async fn run(self, guard: AddressGuard) -> Result<SerialSession> {
        let state = self.radio.query_state().await;
        if !state.is_enabled() {
            return Err(SppError::radio_unavailable(state));
        }
        self.platform
            .check_permission(PermissionScope::Connect)
            .await
            .map_err(connect_error)?;
        if self.cancel.is_cancelled() {
            info!("Connect to {} cancelled before opening a channel", self.device);
            return Err(SppError::Cancelled);
        }

        info!("Connecting to {} [{}]", self.device, self.service);

        let opened = tokio::select! {
            biased;
            res = self.platform.open_channel(&self.device, &self.service) => res,
            _ = self.cancel.cancelled() => Err(SppError::Cancelled),
        };
        let mut reservation = match opened {
            Ok(reservation) => reservation,
            Err(SppError::Cancelled) => {
                info!("Connect to {} cancelled", self.device);
                return Err(SppError::Cancelled);
            }
            Err(e) => {
                let e = connect_error(e);
                warn!("Failed to open channel to {}: {}", self.device, e);
                return Err(e);
            }
        };
        if self.cancel.is_cancelled() {
            debug!("Releasing channel reservation for {}", self.device.address);
            reservation.release().await;
            info!("Connect to {} cancelled", self.device);
            return Err(SppError::Cancelled);
        }

        let handshake = tokio::select! {
            biased;
            res = tokio::time::timeout(self.timeout, reservation.handshake()) => match res {
                Ok(res) => res,
                Err(_) => Err(SppError::ConnectFailed(format!(
                    "Handshake with {} timed out after {:?}",
                    self.device.address, self.timeout
                ))),
            },
            _ = self.cancel.cancelled() => Err(SppError::Cancelled),
        };

        match handshake {
            Ok(transport) => {
                let live = guard.promote();
                info!("Connected to {}", self.device);
                Ok(SerialSession::open(
                    self.device,
                    self.service,
                    transport,
                    self.options,
                    Some(live),
                ))
            }
            Err(e) => {
                debug!("Releasing channel reservation for {}", self.device.address);
                reservation.release().await;

                let e = connect_error(e);
                match &e {
                    SppError::Cancelled => info!("Connect to {} cancelled", self.device),
                    _ => warn!("Connect to {} failed: {}", self.device, e),
                }
                Err(e)
            }
        }
    }
}

/// 接続で返すエラー種別へ寄せる
fn connect_error(e: SppError) -> SppError {
    match e {
        e @ (SppError::Cancelled
        | SppError::ConnectFailed(_)
        | SppError::PermissionDenied(_)
        | SppError::RadioAbsent
        | SppError::RadioDisabled) => e,
        other => SppError::ConnectFailed(other.to_string()),
    }
}

/// 保留中の接続
///
/// `outcome` は self を消費するため、結果は一度だけ受け取る。
#[derive(Debug)]
pub struct PendingConnect {
    device: DeviceDescriptor,
    cancel: CancelHandle,
    rx: oneshot::Receiver<Result<SerialSession>>,
}

impl PendingConnect {
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// 取消を要求（完了済みなら実際の結果が優先される）
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// 接続結果を待つ
    pub async fn outcome(self) -> Result<SerialSession> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SppError::ConnectFailed(format!(
                "Connect task for {} ended without a result",
                self.device.address
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::loopback::{HandshakeScript, LoopbackPlatform};
    use crate::bluetooth::session::SessionState;
    use crate::bluetooth::traits::RadioState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const ADDRESS: &str = "98:D3:31:F5:2A:10";
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn setup() -> (Arc<LoopbackPlatform>, SessionConnector, DeviceDescriptor) {
        let platform = Arc::new(LoopbackPlatform::new());
        let device = DeviceDescriptor::new("WM1", ADDRESS, true);
        platform.add_bonded_device(device.clone());
        let radio = RadioController::new(platform.clone());
        let connector = SessionConnector::new(platform.clone(), radio);
        (platform, connector, device)
    }

    #[tokio::test]
    async fn test_connect_and_round_trip() {
        let (platform, connector, device) = setup();

        let session = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.device().address, ADDRESS);
        assert!(connector.has_live_session(ADDRESS));
        assert!(!connector.is_connecting(ADDRESS));

        let mut peer = platform.take_peer(ADDRESS).unwrap();
        session.write(&[1]).await.unwrap();
        session.write(&[2]).await.unwrap();
        session.write(&[3]).await.unwrap();
        let mut received = [0u8; 3];
        peer.stream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [1, 2, 3]);

        peer.stream.write_all(b"ping").await.unwrap();
        let chunk = session.read_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, b"ping");

        session.close().await.unwrap();
        assert!(!connector.has_live_session(ADDRESS));
        assert_eq!(platform.reservations_released(), 0);
    }

    #[tokio::test]
    async fn test_radio_disabled_fails_before_reserving() {
        let (platform, connector, device) = setup();
        platform.set_radio_state(RadioState::Disabled);

        let err = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::RadioDisabled));
        assert_eq!(platform.reservations_opened(), 0);
        assert!(!connector.is_connecting(ADDRESS));
    }

    #[tokio::test]
    async fn test_connect_permission_denied() {
        let (platform, connector, device) = setup();
        platform.revoke_permission(PermissionScope::Connect);

        let err = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::PermissionDenied(_)));
        assert_eq!(platform.reservations_opened(), 0);
    }

    #[tokio::test]
    async fn test_rejected_handshake_releases_reservation() {
        let (platform, connector, device) = setup();
        platform.script_handshake(ADDRESS, HandshakeScript::Reject("refused".to_string()));

        let err = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::ConnectFailed(_)));
        assert_eq!(platform.reservations_opened(), 1);
        assert_eq!(platform.reservations_released(), 1);
        assert!(!connector.is_connecting(ADDRESS));

        // 呼び出し側の判断で再試行できる
        let session = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (platform, connector, device) = setup();
        platform.script_handshake(ADDRESS, HandshakeScript::Hang);

        let err = connector
            .connect_and_wait(
                &device,
                ServiceIdentifier::SERIAL_PORT,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::ConnectFailed(_)));
        assert_eq!(platform.reservations_released(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_handshake_completes() {
        let (platform, connector, device) = setup();
        platform.script_handshake(ADDRESS, HandshakeScript::Hang);

        let pending = connector.connect(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), pending.outcome())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SppError::Cancelled));
        assert_eq!(platform.reservations_released(), 1);
        assert!(!connector.is_connecting(ADDRESS));
        assert!(platform.take_peer(ADDRESS).is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_completion_reports_real_outcome() {
        let (platform, connector, device) = setup();

        let pending = connector.connect(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT);
        for _ in 0..50 {
            if connector.has_live_session(ADDRESS) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pending.cancel();

        let session = pending.outcome().await.unwrap();
        assert!(session.is_open());
        assert_eq!(platform.reservations_released(), 0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_connect_same_address() {
        let (platform, connector, device) = setup();
        let gate = platform.gate_handshake(ADDRESS);

        let first = connector.connect(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT);
        let second = connector.connect(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT);

        let err = second.outcome().await.unwrap_err();
        assert!(matches!(err, SppError::AlreadyConnecting(_)));
        assert_eq!(err.error_code(), "ALREADY_CONNECTING");

        gate.send(()).unwrap();
        let session = first.outcome().await.unwrap();
        assert!(session.is_open());
        assert_eq!(platform.reservations_opened(), 1);
        assert_eq!(platform.max_concurrent_handshakes(), 1);

        // 接続中は新たな試行を受け付けない
        let err = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::AlreadyConnected(_)));

        // クローズ後は新しいセッションを作れる
        session.close().await.unwrap();
        let again = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap();
        assert!(again.is_open());
        again.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_transport_exactly_once() {
        let (platform, connector, device) = setup();

        for n in 1..=4 {
            let session = connector
                .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
                .await
                .unwrap();
            let peer = platform.take_peer(ADDRESS).unwrap();

            for _ in 0..n {
                session.close().await.unwrap();
            }
            drop(session);

            assert_eq!(peer.probe.shutdowns(), 1);
            assert_eq!(peer.probe.drops(), 1);
        }
    }

    #[tokio::test]
    async fn test_read_error_fails_session() {
        let (platform, connector, device) = setup();
        let session = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap();
        let mut peer = platform.take_peer(ADDRESS).unwrap();

        peer.probe.fail_reads();
        peer.stream.write_all(b"x").await.unwrap();

        let err = session.read_chunk().await.unwrap_err();
        assert!(matches!(err, SppError::Io(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.read_chunk().await.unwrap(), None);
        assert!(!connector.has_live_session(ADDRESS));

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(peer.probe.drops(), 1);
    }

    #[tokio::test]
    async fn test_write_error_fails_session() {
        let (platform, connector, device) = setup();
        let session = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap();
        let peer = platform.take_peer(ADDRESS).unwrap();

        peer.probe.fail_writes();
        let err = session.write(b"data").await.unwrap_err();
        assert!(matches!(err, SppError::Io(_)));
        assert_eq!(session.state(), SessionState::Failed);

        let err = session.write(b"more").await.unwrap_err();
        assert!(matches!(err, SppError::SessionNotOpen(SessionState::Failed)));

        session.close().await.unwrap();
        assert_eq!(peer.probe.drops(), 1);
    }

    #[tokio::test]
    async fn test_unclaimed_session_is_closed() {
        let (platform, connector, device) = setup();
        platform.script_handshake(ADDRESS, HandshakeScript::AcceptAfter(Duration::from_millis(20)));

        let pending = connector.connect(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT);
        drop(pending);

        let mut peer = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if peer.is_none() {
                peer = platform.take_peer(ADDRESS);
            }
            if let Some(peer) = &peer {
                if peer.probe.drops() == 1 {
                    break;
                }
            }
        }

        let peer = peer.expect("handshake should have completed");
        assert_eq!(peer.probe.drops(), 1);
        assert!(!connector.has_live_session(ADDRESS));
    }

    #[tokio::test]
    async fn test_cancel_right_after_connect() {
        let (platform, connector, device) = setup();

        let pending = connector.connect(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT);
        pending.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), pending.outcome())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SppError::Cancelled));
        assert_eq!(
            platform.reservations_opened(),
            platform.reservations_released()
        );
        assert!(platform.take_peer(ADDRESS).is_none());
        assert!(!connector.is_connecting(ADDRESS));
        assert!(!connector.has_live_session(ADDRESS));

        // 取消後も再接続できる
        let session = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_channel_error_is_connect_failed() {
        use crate::bluetooth::traits::MockBluetoothPlatform;

        let mut platform = MockBluetoothPlatform::new();
        platform
            .expect_radio_state()
            .returning(|| RadioState::Enabled);
        platform.expect_check_permission().returning(|_| Ok(()));
        platform.expect_open_channel().times(1).returning(|_, _| {
            Err(SppError::InvalidParameter("bad address".to_string()))
        });

        let platform: Arc<dyn BluetoothPlatform> = Arc::new(platform);
        let connector = SessionConnector::new(platform.clone(), RadioController::new(platform));
        let device = DeviceDescriptor::new("WM1", ADDRESS, true);

        let err = connector
            .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, SppError::ConnectFailed(_)));
        assert!(!connector.is_connecting(ADDRESS));
    }

    #[tokio::test]
    async fn test_close_during_blocked_write() {
        let (platform, connector, device) = setup();
        let session = Arc::new(
            connector
                .connect_and_wait(&device, ServiceIdentifier::SERIAL_PORT, TIMEOUT)
                .await
                .unwrap(),
        );
        // 対向側は読まないので書き込みは詰まる
        let peer = platform.take_peer(ADDRESS).unwrap();

        let writer = {
            let session = session.clone();
            tokio::spawn(async move { session.write(&vec![0x55u8; 64 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        session.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(SppError::SessionNotOpen(SessionState::Closed))
        ));

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(peer.probe.shutdowns(), 1);
        assert_eq!(peer.probe.drops(), 1);
        assert!(!connector.has_live_session(ADDRESS));
    }
}
