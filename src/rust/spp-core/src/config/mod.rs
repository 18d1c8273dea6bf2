//! 共通設定管理モジュール

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::bluetooth::SessionOptions;
use crate::error::{Result, SppError};
use crate::protocol::{uuid_str, ServiceIdentifier};

/// Bluetooth設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// 接続先デバイスの表示名
    pub target_device_name: String,

    /// 接続先デバイスのアドレス（指定時は名前より優先）
    pub target_address: Option<String>,

    /// サービスUUID
    pub service_uuid: String,

    /// 接続タイムアウト（秒）
    pub connect_timeout_secs: u64,

    /// 読み込みバッファサイズ（バイト）
    pub read_buffer_size: usize,

    /// 受信チャンクのキュー長
    pub read_queue_depth: usize,

    /// 無線が無効なら有効化を要求する
    pub auto_enable_radio: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            target_device_name: "WM1".to_string(),
            target_address: None,
            service_uuid: uuid_str::SERIAL_PORT.to_string(),
            connect_timeout_secs: 15,
            read_buffer_size: 1024,
            read_queue_depth: 32,
            auto_enable_radio: true,
        }
    }
}

impl BluetoothConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// サービスUUIDを解析
    pub fn service(&self) -> Result<ServiceIdentifier> {
        ServiceIdentifier::parse(&self.service_uuid)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_buffer_size: self.read_buffer_size,
            read_queue_depth: self.read_queue_depth,
        }
    }
}

/// ロギング設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// ログレベル
    pub level: String,

    /// ログ出力先（stderr / file）。標準出力は受信データ用
    pub output: String,

    /// ログファイルパス（ファイル出力の場合）
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            output: "stderr".to_string(),
            file_path: None,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Bluetooth設定
    pub bluetooth: BluetoothConfig,

    /// ロギング設定
    pub logging: LoggingConfig,
}

impl Settings {
    /// 設定を読み込む
    ///
    /// 読み込み優先順位：
    /// 1. 環境変数
    /// 2. 設定ファイル（SPP_CONFIG_FILE で指定された場合）
    /// 3. デフォルト値
    pub fn new() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(config_path) = env::var("SPP_CONFIG_FILE") {
            settings = Self::from_file(&config_path)?;
        }

        settings.override_from_env();

        Ok(settings)
    }

    /// 設定ファイルから読み込む
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SppError::Config(format!("Failed to read config file: {}", e)))?;

        // JSON形式
        if path.ends_with(".json") {
            serde_json::from_str(&content)
                .map_err(|e| SppError::Config(format!("Failed to parse JSON config: {}", e)))
        }
        // TOML形式
        else if path.ends_with(".toml") {
            toml::from_str(&content)
                .map_err(|e| SppError::Config(format!("Failed to parse TOML config: {}", e)))
        }
        // YAML形式
        else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .map_err(|e| SppError::Config(format!("Failed to parse YAML config: {}", e)))
        } else {
            Err(SppError::Config(format!("Unsupported config file format: {}", path)))
        }
    }

    /// 環境変数で設定を上書き
    pub fn override_from_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Bluetooth設定
        if let Some(name) = lookup("SPP_DEVICE_NAME") {
            self.bluetooth.target_device_name = name;
        }
        if let Some(address) = lookup("SPP_DEVICE_ADDRESS") {
            self.bluetooth.target_address = Some(address).filter(|a| !a.trim().is_empty());
        }
        if let Some(uuid) = lookup("SPP_SERVICE_UUID") {
            self.bluetooth.service_uuid = uuid;
        }
        if let Some(timeout) = lookup("SPP_CONNECT_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.bluetooth.connect_timeout_secs = timeout;
            }
        }
        if let Some(auto_enable) = lookup("SPP_AUTO_ENABLE") {
            self.bluetooth.auto_enable_radio =
                auto_enable.to_lowercase() == "true" || auto_enable == "1";
        }

        // ロギング設定
        if let Some(log_level) = lookup("LOG_LEVEL") {
            self.logging.level = log_level;
        }
        if let Some(log_output) = lookup("LOG_OUTPUT") {
            self.logging.output = log_output;
        }
        if let Some(log_file) = lookup("LOG_FILE") {
            self.logging.file_path = Some(log_file);
        }
    }

    /// 設定を検証
    pub fn validate(&self) -> Result<()> {
        let bt = &self.bluetooth;

        let has_address = bt
            .target_address
            .as_deref()
            .map(|a| !a.trim().is_empty())
            .unwrap_or(false);
        if bt.target_device_name.trim().is_empty() && !has_address {
            return Err(SppError::Config(
                "Either a target device name or address is required".to_string(),
            ));
        }

        if bt.connect_timeout_secs == 0 {
            return Err(SppError::Config("Connect timeout must be at least 1 second".to_string()));
        }

        if bt.read_buffer_size == 0 || bt.read_queue_depth == 0 {
            return Err(SppError::Config(
                "Read buffer size and queue depth must be positive".to_string(),
            ));
        }

        bt.service()
            .map_err(|e| SppError::Config(format!("Invalid service UUID: {}", e)))?;

        if self.logging.output == "file" && self.logging.file_path.is_none() {
            return Err(SppError::Config("Log file path is required for file output".to_string()));
        }

        Ok(())
    }

    /// 設定をファイルに保存
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = if path.ends_with(".json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| SppError::Config(format!("Failed to serialize to JSON: {}", e)))?
        } else if path.ends_with(".toml") {
            toml::to_string_pretty(self)
                .map_err(|e| SppError::Config(format!("Failed to serialize to TOML: {}", e)))?
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::to_string(self)
                .map_err(|e| SppError::Config(format!("Failed to serialize to YAML: {}", e)))?
        } else {
            return Err(SppError::Config(format!("Unsupported config file format: {}", path)));
        };

        std::fs::write(path, content)
            .map_err(|e| SppError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}
