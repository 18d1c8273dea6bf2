//! SPP セッション共通ライブラリ
//!
//! ペアリング済みデバイスへの Bluetooth Serial Port Profile 接続を、
//! プラットフォーム非依存のコードとして提供する

pub mod error;
pub mod protocol;
pub mod bluetooth;
pub mod config;

// バージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

// 主要な型の再エクスポート
pub use error::{Result, SppError};
pub use protocol::ServiceIdentifier;
pub use bluetooth::{
    BluetoothPlatform,
    CancelHandle,
    DeviceDescriptor,
    DeviceRegistry,
    EnableOutcome,
    PendingConnect,
    RadioController,
    RadioState,
    SerialSession,
    SessionConnector,
    SessionState,
};
pub use config::Settings;

/// プラットフォーム情報
pub fn platform_info() -> PlatformInfo {
    PlatformInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::FAMILY.to_string(),
    }
}

/// プラットフォーム情報構造体
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub family: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::loopback::LoopbackPlatform;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert!(!NAME.is_empty());
    }

    #[test]
    fn test_platform_info() {
        let info = platform_info();
        assert!(!info.os.is_empty());
        assert!(!info.arch.is_empty());
    }

    /// 無効な無線の有効化 → 名前解決 → 接続 → 送受信 → 切断
    #[tokio::test]
    async fn test_end_to_end_session() {
        let platform = Arc::new(LoopbackPlatform::new());
        platform.set_radio_state(RadioState::Disabled);
        platform.add_bonded_device(DeviceDescriptor::new("WM1", "98:D3:31:F5:2A:10", true));

        let radio = RadioController::new(platform.clone());
        let registry = DeviceRegistry::new(platform.clone(), radio.clone());
        let connector = SessionConnector::new(platform.clone(), radio.clone());

        let err = registry.find_bonded_by_name("WM1").await.unwrap_err();
        assert!(err.is_radio_unavailable());

        let request = radio.request_enable().await.unwrap();
        assert_eq!(request.outcome().await, EnableOutcome::Enabled);

        let device = registry.find_bonded_by_name("WM1").await.unwrap().unwrap();
        let session = connector
            .connect(&device, ServiceIdentifier::SERIAL_PORT, Duration::from_secs(5))
            .outcome()
            .await
            .unwrap();
        let mut peer = platform.take_peer(&device.address).unwrap();

        session.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        peer.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.stream.write_all(b"world").await.unwrap();
        assert_eq!(session.read_chunk().await.unwrap().unwrap(), b"world");

        let stats = session.statistics();
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.bytes_read, 5);

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(peer.probe.drops(), 1);
    }
}
