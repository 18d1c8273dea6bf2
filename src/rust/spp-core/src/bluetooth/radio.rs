//! 無線コントローラー
//!
//! アダプタの存在・有効状態の参照と、有効化要求の発行を担う。
//! 有効化フローは同時に一つだけ実行し、並行した要求は進行中のフローに合流させる。

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::cancel::CancelHandle;
use super::traits::{BluetoothPlatform, EnableOutcome, RadioState};
use crate::error::{Result, SppError};

type OutcomeReceiver = watch::Receiver<Option<EnableOutcome>>;

/// 有効化要求の相関トークン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnableToken(u64);

impl EnableToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EnableToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enable#{}", self.0)
    }
}

/// 無線コントローラー
#[derive(Clone)]
pub struct RadioController {
    platform: Arc<dyn BluetoothPlatform>,

    /// 進行中の有効化フロー（結果待ち受け用）
    in_flight: Arc<Mutex<Option<OutcomeReceiver>>>,

    next_token: Arc<AtomicU64>,
}

impl RadioController {
    /// 新しいコントローラーを作成
    pub fn new(platform: Arc<dyn BluetoothPlatform>) -> Self {
        RadioController {
            platform,
            in_flight: Arc::new(Mutex::new(None)),
            next_token: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 現在の無線状態を取得
    pub async fn query_state(&self) -> RadioState {
        let state = self.platform.radio_state().await;
        debug!("Radio state: {}", state);
        state
    }

    /// 有効化フローが進行中か
    pub fn enable_in_flight(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// 有効化を要求
    ///
    /// 既に有効なら即座に `Enabled` で解決済みの要求を返す。
    /// アダプタが存在しない場合は `RadioAbsent`。
    /// タイムアウトは設けない（呼び出し側の責務）。
    pub async fn request_enable(&self) -> Result<EnableRequest> {
        let token = EnableToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);

        match self.query_state().await {
            RadioState::Absent => {
                warn!("Enable requested ({}) but no Bluetooth radio is present", token);
                return Err(SppError::RadioAbsent);
            }
            RadioState::Enabled => {
                info!("Bluetooth radio is already enabled ({})", token);
                return Ok(EnableRequest::resolved(token, EnableOutcome::Enabled));
            }
            RadioState::Disabled => {}
        }

        let outcome = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(rx) => {
                    debug!("Joining in-flight enable flow ({})", token);
                    rx.clone()
                }
                None => {
                    info!("Starting radio enable flow ({})", token);
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    self.spawn_enable_flow(tx);
                    rx
                }
            }
        };

        Ok(EnableRequest {
            token,
            outcome,
            cancel: CancelHandle::new(),
        })
    }

    fn spawn_enable_flow(&self, tx: watch::Sender<Option<EnableOutcome>>) {
        let platform = self.platform.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let outcome = match platform.request_enable().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Radio enable flow failed: {}", e);
                    EnableOutcome::Denied
                }
            };
            info!("Radio enable flow resolved: {:?}", outcome);

            // 先にスロットを空ける。以後の要求は新しいフローを開始する
            in_flight.lock().take();
            tx.send_replace(Some(outcome));
        });
    }
}

/// 保留中の有効化要求
///
/// `outcome` は self を消費するため、一つのトークンにつき解決は一度だけ。
#[derive(Debug)]
pub struct EnableRequest {
    token: EnableToken,
    outcome: OutcomeReceiver,
    cancel: CancelHandle,
}

impl EnableRequest {
    fn resolved(token: EnableToken, outcome: EnableOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        EnableRequest {
            token,
            outcome: rx,
            cancel: CancelHandle::new(),
        }
    }

    pub fn token(&self) -> EnableToken {
        self.token
    }

    /// 他のタスクから取り消すためのハンドル
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 既に結果が出ていれば返す
    pub fn try_outcome(&self) -> Option<EnableOutcome> {
        *self.outcome.borrow()
    }

    /// 結果を待つ
    ///
    /// 取消とフロー完了が競合した場合、完了していれば実際の結果を返す。
    pub async fn outcome(self) -> EnableOutcome {
        let EnableRequest {
            token,
            mut outcome,
            cancel,
        } = self;

        let finished = tokio::select! {
            biased;
            resolved = wait_outcome(&mut outcome) => Some(resolved),
            _ = cancel.cancelled() => None,
        };

        let resolved = match finished {
            Some(resolved) => resolved,
            None => (*outcome.borrow()).unwrap_or(EnableOutcome::Cancelled),
        };
        debug!("{} resolved: {:?}", token, resolved);
        resolved
    }
}

async fn wait_outcome(rx: &mut OutcomeReceiver) -> EnableOutcome {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return (*rx.borrow()).unwrap_or(EnableOutcome::Cancelled);
        }
    }
}
