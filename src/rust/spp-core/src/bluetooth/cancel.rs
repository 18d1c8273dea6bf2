//! 取消シグナル

use std::sync::Arc;
use tokio::sync::watch;

/// 保留中の操作を取り消すためのハンドル
///
/// クローンはすべて同じシグナルを共有する。
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx) }
    }

    /// 取消を通知（何度呼んでもよい）
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// 取消されるまで待機
    pub async fn cancelled(&self) {
        wait_until_set(self.tx.subscribe()).await
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// watchチャネルが true になるまで待機
///
/// 送信側が破棄された場合も戻る。
pub(crate) async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    loop {
        let set = *rx.borrow_and_update();
        if set {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
