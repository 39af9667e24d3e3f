use crate::can::cantypes::{CanFdInitConfig, ChannelInitConfig};
use crate::can::error::{CanError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ARBITRATION_BAUD: u32 = 500_000;
pub const DEFAULT_DATA_BAUD: u32 = 2_000_000;

/// CAN-FD 標準：ISO 或 Bosch non-ISO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanFdStandard {
    #[default]
    Iso = 0,
    NonIso = 1,
}

/// 仲裁段與資料段波特率
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    arbitration: u32,
    data: u32,
    standard: CanFdStandard,
}

impl BitTiming {
    pub fn new(arbitration: u32, data: u32) -> Result<Self> {
        if arbitration == 0 || data == 0 {
            return Err(CanError::InvalidBitTiming { arbitration, data });
        }
        Ok(Self {
            arbitration,
            data,
            standard: CanFdStandard::Iso,
        })
    }

    pub fn with_standard(self, standard: CanFdStandard) -> Self {
        Self { standard, ..self }
    }

    pub fn arbitration(&self) -> u32 {
        self.arbitration
    }

    pub fn data(&self) -> u32 {
        self.data
    }

    pub fn standard(&self) -> CanFdStandard {
        self.standard
    }
}

impl Default for BitTiming {
    /// 500 kbit/s 仲裁段，2 Mbit/s 資料段，ISO
    fn default() -> Self {
        Self {
            arbitration: DEFAULT_ARBITRATION_BAUD,
            data: DEFAULT_DATA_BAUD,
            standard: CanFdStandard::Iso,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelMode {
    #[default]
    Normal,
    /// 裝置內部迴環：通道 0 發送的幀會出現在通道 1 的接收佇列
    InternalLoopback,
}

impl ChannelMode {
    pub fn from_flag(loopback: bool) -> Self {
        if loopback {
            ChannelMode::InternalLoopback
        } else {
            ChannelMode::Normal
        }
    }

    pub fn is_loopback(self) -> bool {
        self == ChannelMode::InternalLoopback
    }

    fn mode_byte(self) -> u8 {
        match self {
            ChannelMode::Normal => 0,
            ChannelMode::InternalLoopback => 1,
        }
    }
}

/// 產生 InitCAN 參數區塊
///
/// 波特率已由 SetAbitBaud / SetDbitBaud 設定，區塊中的 timing 欄位保留為 0；
/// 濾波器維持全通。
pub fn build(_timing: &BitTiming, mode: ChannelMode) -> ChannelInitConfig {
    ChannelInitConfig::canfd(CanFdInitConfig {
        mode: mode.mode_byte(),
        ..CanFdInitConfig::default()
    })
}
