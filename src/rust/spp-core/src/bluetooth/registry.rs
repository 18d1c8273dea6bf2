//! ペアリング済みデバイスの検索

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::radio::RadioController;
use super::traits::{BluetoothPlatform, DeviceDescriptor, PermissionScope};
use crate::error::{Result, SppError};

/// デバイスレジストリ
///
/// 名前検索で同名デバイスが複数ある場合は、列挙順で最初のものを返す。
#[derive(Clone)]
pub struct DeviceRegistry {
    platform: Arc<dyn BluetoothPlatform>,
    radio: RadioController,
}

impl DeviceRegistry {
    pub fn new(platform: Arc<dyn BluetoothPlatform>, radio: RadioController) -> Self {
        DeviceRegistry { platform, radio }
    }

    /// ペアリング済みデバイスを全件取得（列挙順）
    pub async fn list_bonded(&self) -> Result<Vec<DeviceDescriptor>> {
        let state = self.radio.query_state().await;
        if !state.is_enabled() {
            return Err(SppError::radio_unavailable(state));
        }
        self.platform
            .check_permission(PermissionScope::BondedDevices)
            .await?;

        let devices = self.platform.bonded_devices().await.map_err(|e| match e {
            SppError::PermissionDenied(msg) => SppError::PermissionDenied(msg),
            other => SppError::PermissionDenied(format!("Bonded device enumeration failed: {}", other)),
        })?;

        let bonded: Vec<DeviceDescriptor> = devices.into_iter().filter(|d| d.bonded).collect();
        debug!("Bonded devices: {}", bonded.len());
        Ok(bonded)
    }

    /// 表示名でペアリング済みデバイスを検索
    pub async fn find_bonded_by_name(&self, name: &str) -> Result<Option<DeviceDescriptor>> {
        let devices = self.list_bonded().await?;
        let mut matches = devices.into_iter().filter(|d| d.name == name);

        let Some(first) = matches.next() else {
            info!("No bonded device named '{}'", name);
            return Ok(None);
        };

        let others: Vec<String> = matches.map(|d| d.address).collect();
        if !others.is_empty() {
            warn!(
                "{} bonded devices share the name '{}'; using {} (also: {})",
                others.len() + 1,
                name,
                first.address,
                others.join(", ")
            );
        }

        info!("Resolved '{}' to {}", name, first.address);
        Ok(Some(first))
    }

    /// アドレスでペアリング済みデバイスを検索
    pub async fn find_bonded_by_address(&self, address: &str) -> Result<Option<DeviceDescriptor>> {
        let devices = self.list_bonded().await?;
        let found = devices.into_iter().find(|d| d.matches_address(address));
        match &found {
            Some(device) => info!("Resolved address {} to '{}'", address, device.name),
            None => info!("No bonded device with address {}", address),
        }
        Ok(found)
    }

    /// アドレス優先で検索し、見つからなければ `DeviceNotFound`
    pub async fn resolve(&self, name: Option<&str>, address: Option<&str>) -> Result<DeviceDescriptor> {
        let found = match (address, name) {
            (Some(address), _) => self.find_bonded_by_address(address).await?,
            (None, Some(name)) => self.find_bonded_by_name(name).await?,
            (None, None) => {
                return Err(SppError::InvalidParameter(
                    "Either a device name or an address is required".to_string(),
                ))
            }
        };

        found.ok_or_else(|| {
            SppError::DeviceNotFound(address.or(name).unwrap_or_default().to_string())
        })
    }
}
