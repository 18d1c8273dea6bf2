//! Linux固有のプラットフォーム処理

use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use spp_core::{Result, SppError};

/// シャットダウンシグナル受信器
#[derive(Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    #[cfg(test)]
    pub(crate) fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        ShutdownReceiver { rx }
    }

    /// シグナルを待機
    pub async fn wait(mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Linux固有のプラットフォーム処理
pub struct LinuxPlatform;

impl LinuxPlatform {
    /// Ctrl+C / SIGTERM ハンドラーのセットアップ
    pub fn setup_shutdown_handler() -> Result<ShutdownReceiver> {
        let (tx, rx) = watch::channel(false);

        let mut sigterm = unix_signal(SignalKind::terminate())
            .map_err(|e| SppError::Config(format!("Failed to setup SIGTERM handler: {}", e)))?;

        tokio::spawn(async move {
            tokio::select! {
                res = signal::ctrl_c() => match res {
                    Ok(()) => info!("Received Ctrl+C signal"),
                    Err(err) => {
                        warn!("Unable to listen for Ctrl+C: {}", err);
                        sigterm.recv().await;
                        info!("Received SIGTERM signal");
                    }
                },
                _ = sigterm.recv() => info!("Received SIGTERM signal"),
            }
            let _ = tx.send(true);
        });

        Ok(ShutdownReceiver { rx })
    }

    /// Bluetooth サブシステムの有無（/sys/class/bluetooth）
    pub fn bluetooth_subsystem_present() -> bool {
        std::path::Path::new("/sys/class/bluetooth").exists()
    }
}
