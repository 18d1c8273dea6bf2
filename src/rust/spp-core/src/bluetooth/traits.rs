//! Bluetoothプラットフォーム抽象化トレイト

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::protocol::ServiceIdentifier;

/// 無線（アダプタ）状態
///
/// 問い合わせ時点の値であり、キャッシュしない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioState {
    Absent,
    Disabled,
    Enabled,
}

impl RadioState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, RadioState::Enabled)
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RadioState::Absent => "absent",
            RadioState::Disabled => "disabled",
            RadioState::Enabled => "enabled",
        };
        f.write_str(s)
    }
}

/// 有効化要求の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnableOutcome {
    Enabled,
    Denied,
    Cancelled,
}

/// ペアリング済みデバイスのスナップショット
///
/// 同一性はアドレスで判断する（名前は重複しうる）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// 表示名
    pub name: String,

    /// Bluetoothアドレス（プラットフォーム固有表記）
    pub address: String,

    /// ボンディング済みか
    pub bonded: bool,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, bonded: bool) -> Self {
        DeviceDescriptor {
            name: name.into(),
            address: address.into(),
            bonded,
        }
    }

    /// アドレス比較（大文字小文字を区別しない）
    pub fn matches_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address.trim())
    }

    /// 比較用の正規化アドレス
    pub fn address_key(&self) -> String {
        normalize_address(&self.address)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// アドレス表記を正規化（前後空白除去・大文字化）
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// 権限チェックの対象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionScope {
    /// ペアリング済みデバイス一覧の参照
    BondedDevices,
    /// ソケット作成・接続
    Connect,
}

/// 接続済みのバイトストリーム
pub trait SerialTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SerialTransport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// チャネル予約（ハンドシェイク前のリソース）
#[async_trait]
pub trait ChannelReservation: Send {
    /// ブロッキング接続を実行
    ///
    /// 呼び出し側がこの Future を破棄した場合、その後 `release` が呼ばれる。
    async fn handshake(&mut self) -> Result<Box<dyn SerialTransport>>;

    /// ハンドシェイク失敗・取消時に予約を解放
    async fn release(self: Box<Self>);
}

/// プラットフォームBluetoothスタックの抽象化
///
/// 実装はプラットフォームのエラーを `SppError` の各種別へ変換して返す。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BluetoothPlatform: Send + Sync {
    /// 現在の無線状態（失敗しない）
    async fn radio_state(&self) -> RadioState;

    /// プラットフォームの有効化フローを実行
    ///
    /// ユーザー操作待ちなど、完了しない可能性がある。
    async fn request_enable(&self) -> Result<EnableOutcome>;

    /// 権限の事前チェック
    async fn check_permission(&self, _scope: PermissionScope) -> Result<()> {
        Ok(())
    }

    /// ペアリング済みデバイス一覧（列挙順）
    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// サービスに結び付いたチャネルを予約
    async fn open_channel(
        &self,
        device: &DeviceDescriptor,
        service: &ServiceIdentifier,
    ) -> Result<Box<dyn ChannelReservation>>;
}
