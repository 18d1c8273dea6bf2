//! サービス識別子（プロトコル定義）

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SppError};

/// UUID定数
pub mod uuid_str {
    /// Serial Port Profile
    pub const SERIAL_PORT: &str = "00001101-0000-1000-8000-00805F9B34FB";

    /// Bluetooth Base UUID
    pub const BLUETOOTH_BASE: &str = "00000000-0000-1000-8000-00805F9B34FB";
}

const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;
const SHORT_MASK: u128 = 0xFFFF_FFFF << 96;

/// 接続先サービスを表す128ビットUUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceIdentifier(Uuid);

impl ServiceIdentifier {
    /// SPP (`00001101-0000-1000-8000-00805F9B34FB`)
    pub const SERIAL_PORT: ServiceIdentifier =
        ServiceIdentifier(Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB));

    pub const fn new(uuid: Uuid) -> Self {
        ServiceIdentifier(uuid)
    }

    /// 16ビット短縮形から Base UUID 上の識別子を作る
    pub const fn from_short(short: u16) -> Self {
        ServiceIdentifier(Uuid::from_u128(BASE_UUID | ((short as u128) << 96)))
    }

    /// 文字列からパース（"1101" のような16ビット短縮形も受け付ける）
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.len() == 4 {
            if let Ok(short) = u16::from_str_radix(trimmed, 16) {
                return Ok(ServiceIdentifier::from_short(short));
            }
        }
        Uuid::parse_str(trimmed)
            .map(ServiceIdentifier)
            .map_err(|e| SppError::InvalidParameter(format!("Invalid service UUID '{}': {}", s, e)))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Base UUID 上にある場合は16ビット短縮形を返す
    pub fn short_form(&self) -> Option<u16> {
        let value = self.0.as_u128();
        if value & !SHORT_MASK != BASE_UUID {
            return None;
        }
        let short = value >> 96;
        u16::try_from(short).ok()
    }
}

impl Default for ServiceIdentifier {
    fn default() -> Self {
        ServiceIdentifier::SERIAL_PORT
    }
}

impl fmt::Display for ServiceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bluetooth仕様の表記に合わせて大文字
        write!(f, "{}", self.0.hyphenated().to_string().to_uppercase())
    }
}

impl FromStr for ServiceIdentifier {
    type Err = SppError;

    fn from_str(s: &str) -> Result<Self> {
        ServiceIdentifier::parse(s)
    }
}

impl From<Uuid> for ServiceIdentifier {
    fn from(uuid: Uuid) -> Self {
        ServiceIdentifier(uuid)
    }
}
