//! Bluetooth共通モジュール

pub mod traits;
pub mod cancel;
pub mod radio;
pub mod registry;
pub mod connector;
pub mod session;

#[cfg(any(test, feature = "mock"))]
pub mod loopback;

// 再エクスポート
pub use traits::{
    BluetoothPlatform,
    ChannelReservation,
    SerialTransport,
    DeviceDescriptor,
    EnableOutcome,
    PermissionScope,
    RadioState,
    normalize_address,
};

pub use cancel::CancelHandle;
pub use radio::{EnableRequest, EnableToken, RadioController};
pub use registry::DeviceRegistry;
pub use connector::{PendingConnect, SessionConnector};
pub use session::{SerialSession, SessionOptions, SessionState, SessionStatistics};
