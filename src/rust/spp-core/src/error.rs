//! 共通エラー型定義

use thiserror::Error;

use crate::bluetooth::{RadioState, SessionState};

/// SPPセッション共通エラー型
///
/// プラットフォーム層のエラーは各操作の境界でいずれかの種別に変換される。
#[derive(Debug, Error)]
pub enum SppError {
    /// Bluetoothアダプタが存在しない
    #[error("Bluetooth radio is not present")]
    RadioAbsent,

    /// Bluetoothアダプタが無効
    #[error("Bluetooth radio is disabled")]
    RadioDisabled,

    /// 権限不足（ペアリング済み一覧・ソケット作成）
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// デバイスが見つからない
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// ハンドシェイク失敗・タイムアウト
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// 呼び出し側による取消
    #[error("Operation cancelled")]
    Cancelled,

    /// 接続後の読み書きエラー
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 同一デバイスへの接続試行が進行中
    #[error("Connection attempt already in progress: {0}")]
    AlreadyConnecting(String),

    /// 同一デバイスのセッションが既に開いている
    #[error("Session already open: {0}")]
    AlreadyConnected(String),

    /// セッションが Open ではない
    #[error("Session is not open (state: {0})")]
    SessionNotOpen(SessionState),

    /// 無効なパラメータ
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// 設定エラー
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result型のエイリアス
pub type Result<T> = std::result::Result<T, SppError>;

impl SppError {
    /// 無線状態から RadioUnavailable 系のエラーを作る
    ///
    /// `Enabled` を渡された場合も `RadioDisabled` を返す（呼び出し側の検査漏れ扱い）。
    pub fn radio_unavailable(state: RadioState) -> Self {
        match state {
            RadioState::Absent => SppError::RadioAbsent,
            RadioState::Disabled | RadioState::Enabled => SppError::RadioDisabled,
        }
    }

    /// RadioAbsent / RadioDisabled のいずれか
    pub fn is_radio_unavailable(&self) -> bool {
        matches!(self, SppError::RadioAbsent | SppError::RadioDisabled)
    }

    /// エラーコードを返す（ログ・呼び出し側の分類用）
    pub fn error_code(&self) -> &str {
        match self {
            SppError::RadioAbsent => "RADIO_ABSENT",
            SppError::RadioDisabled => "RADIO_DISABLED",
            SppError::PermissionDenied(_) => "PERMISSION_DENIED",
            SppError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            SppError::ConnectFailed(_) => "CONNECT_FAILED",
            SppError::Cancelled => "CANCELLED",
            SppError::Io(_) => "IO_ERROR",
            SppError::AlreadyConnecting(_) => "ALREADY_CONNECTING",
            SppError::AlreadyConnected(_) => "ALREADY_CONNECTED",
            SppError::SessionNotOpen(_) => "SESSION_NOT_OPEN",
            SppError::InvalidParameter(_) => "INVALID_PARAMETER",
            SppError::Config(_) => "CONFIG_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_unavailable_mapping() {
        assert!(matches!(
            SppError::radio_unavailable(RadioState::Absent),
            SppError::RadioAbsent
        ));
        assert!(matches!(
            SppError::radio_unavailable(RadioState::Disabled),
            SppError::RadioDisabled
        ));
        assert!(SppError::RadioAbsent.is_radio_unavailable());
        assert!(!SppError::Cancelled.is_radio_unavailable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SppError::Cancelled.error_code(), "CANCELLED");
        assert_eq!(
            SppError::AlreadyConnecting("AA:BB".to_string()).error_code(),
            "ALREADY_CONNECTING"
        );
        let io = SppError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io.error_code(), "IO_ERROR");
    }
}
