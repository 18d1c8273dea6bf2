//! Linux (BlueZ) 向け Bluetooth プラットフォーム実装

use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role, Stream};
use bluer::{Adapter, Address, ErrorKind, Session};
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

use spp_core::bluetooth::{
    BluetoothPlatform, ChannelReservation, DeviceDescriptor, EnableOutcome, RadioState,
    SerialTransport,
};
use spp_core::{Result, ServiceIdentifier, SppError};

/// bluer のエラーを共通エラーへ変換
fn map_bluer_error(err: bluer::Error) -> SppError {
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => {
            SppError::PermissionDenied(err.message)
        }
        ErrorKind::NotReady => SppError::RadioDisabled,
        ErrorKind::DoesNotExist => SppError::DeviceNotFound(err.message),
        _ => SppError::ConnectFailed(err.to_string()),
    }
}

/// BlueZ プラットフォーム
pub struct BluezPlatform {
    session: Session,
}

impl BluezPlatform {
    /// bluetoothd への D-Bus セッションを開く
    pub async fn new() -> Result<Self> {
        let session = Session::new().await.map_err(|e| {
            SppError::PermissionDenied(format!("Unable to reach bluetoothd over D-Bus: {}", e))
        })?;
        Ok(BluezPlatform { session })
    }

    async fn adapter(&self) -> Option<Adapter> {
        match self.session.default_adapter().await {
            Ok(adapter) => Some(adapter),
            Err(e) => {
                debug!("No default adapter: {}", e);
                None
            }
        }
    }

    async fn require_adapter(&self) -> Result<Adapter> {
        self.adapter().await.ok_or(SppError::RadioAbsent)
    }
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .trim()
        .parse()
        .map_err(|e| SppError::InvalidParameter(format!("Invalid device address '{}': {}", address, e)))
}

#[async_trait]
impl BluetoothPlatform for BluezPlatform {
    async fn radio_state(&self) -> RadioState {
        let Some(adapter) = self.adapter().await else {
            return RadioState::Absent;
        };
        match adapter.is_powered().await {
            Ok(true) => RadioState::Enabled,
            Ok(false) => RadioState::Disabled,
            Err(e) => {
                warn!("Failed to read power state of {}: {}", adapter.name(), e);
                RadioState::Disabled
            }
        }
    }

    async fn request_enable(&self) -> Result<EnableOutcome> {
        let adapter = self.require_adapter().await?;
        info!("Powering on adapter {}", adapter.name());

        match adapter.set_powered(true).await {
            Ok(()) => Ok(EnableOutcome::Enabled),
            Err(e) if matches!(e.kind, ErrorKind::NotAuthorized | ErrorKind::NotPermitted) => {
                warn!("Power-on of {} was refused: {}", adapter.name(), e);
                Ok(EnableOutcome::Denied)
            }
            Err(e) => Err(map_bluer_error(e)),
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let adapter = self.require_adapter().await?;
        let addresses = adapter.device_addresses().await.map_err(map_bluer_error)?;

        let mut devices = Vec::with_capacity(addresses.len());
        for address in addresses {
            let device = adapter.device(address).map_err(map_bluer_error)?;
            let bonded = device.is_paired().await.unwrap_or(false);
            let name = match device.name().await {
                Ok(Some(name)) => name,
                _ => device.alias().await.unwrap_or_default(),
            };
            devices.push(DeviceDescriptor::new(name, address.to_string(), bonded));
        }

        Ok(devices)
    }

    async fn open_channel(
        &self,
        device: &DeviceDescriptor,
        service: &ServiceIdentifier,
    ) -> Result<Box<dyn ChannelReservation>> {
        let adapter = self.require_adapter().await?;
        let address = parse_address(&device.address)?;
        let uuid = service.uuid();

        let profile = Profile {
            uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let handle = self
            .session
            .register_profile(profile)
            .await
            .map_err(map_bluer_error)?;
        debug!("Registered RFCOMM client profile {} for {}", service, address);

        Ok(Box::new(BluezReservation {
            adapter,
            address,
            uuid,
            profile: Some(handle),
        }))
    }
}

/// RFCOMM プロファイル登録（ハンドシェイク前）
struct BluezReservation {
    adapter: Adapter,
    address: Address,
    uuid: bluer::Uuid,
    profile: Option<ProfileHandle>,
}

#[async_trait]
impl ChannelReservation for BluezReservation {
    async fn handshake(&mut self) -> Result<Box<dyn SerialTransport>> {
        let device = self.adapter.device(self.address).map_err(map_bluer_error)?;
        let handle = self
            .profile
            .as_mut()
            .ok_or_else(|| SppError::ConnectFailed("Channel reservation already consumed".to_string()))?;

        let connect = device.connect_profile(&self.uuid);
        tokio::pin!(connect);
        let mut connect_done = false;

        // connect_profile は NewConnection の受理まで完了しないため並行して待つ
        let stream: Stream = loop {
            tokio::select! {
                req = handle.next() => {
                    let Some(req) = req else {
                        return Err(SppError::ConnectFailed("Profile registration ended".to_string()));
                    };
                    if req.device() != self.address {
                        debug!("Rejecting RFCOMM request from unexpected device {}", req.device());
                        req.reject(ReqError::Rejected);
                        continue;
                    }
                    break req.accept().map_err(|e| SppError::ConnectFailed(e.to_string()))?;
                }
                res = &mut connect, if !connect_done => {
                    connect_done = true;
                    res.map_err(map_bluer_error)?;
                }
            }
        };

        let profile = self
            .profile
            .take()
            .ok_or_else(|| SppError::ConnectFailed("Channel reservation already consumed".to_string()))?;
        info!("RFCOMM channel to {} established", self.address);

        Ok(Box::new(BluezTransport {
            stream,
            _profile: profile,
        }))
    }

    async fn release(self: Box<Self>) {
        if let Ok(device) = self.adapter.device(self.address) {
            if let Err(e) = device.disconnect_profile(&self.uuid).await {
                debug!("disconnect_profile for {}: {}", self.address, e);
            }
        }
        debug!("Released RFCOMM reservation for {}", self.address);
    }
}

/// 接続済み RFCOMM ストリーム
///
/// プロファイル登録はストリームと同じ寿命で保持する。
struct BluezTransport {
    stream: Stream,
    _profile: ProfileHandle,
}

impl AsyncRead for BluezTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BluezTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let err = bluer::Error {
            kind: ErrorKind::NotAuthorized,
            message: "denied".to_string(),
        };
        assert!(matches!(map_bluer_error(err), SppError::PermissionDenied(_)));

        let err = bluer::Error {
            kind: ErrorKind::NotReady,
            message: "off".to_string(),
        };
        assert!(matches!(map_bluer_error(err), SppError::RadioDisabled));

        let err = bluer::Error {
            kind: ErrorKind::Failed,
            message: "br-connection-page-timeout".to_string(),
        };
        assert!(matches!(map_bluer_error(err), SppError::ConnectFailed(_)));
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address(" 98:D3:31:F5:2A:10 ").is_ok());
        assert!(matches!(
            parse_address("not-an-address"),
            Err(SppError::InvalidParameter(_))
        ));
    }
}
