use crate::can::cantypes::{encode, FdFlags, TransmitFdData, DEVICE_TYPE_USBCANFD};
use crate::can::channel_config::{
    BitTiming, CanFdStandard, DEFAULT_ARBITRATION_BAUD, DEFAULT_DATA_BAUD,
};
use crate::can::error::CanError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LIBRARY: &str = "./libcontrolcanfd.so";
pub const DEFAULT_SIGNAL: &str = "Vehicle.Cabin.Light.Spotlight.Row1.PassengerSide.IsLightOn";
pub const TEST_FRAME_ID: u32 = 0x58A;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot open config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// 整個 YAML 設定檔結構，未填欄位使用預設測試參數
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// controlcanfd 函式庫路徑
    pub library: String,
    pub device_type: u32,
    pub device_index: u32,
    pub arbitration_baud: u32,
    pub data_baud: u32,
    pub canfd_standard: CanFdStandard,
    /// 每次發送後的等待時間
    pub pacing_ms: u64,
    pub receive_timeout_ms: u64,
    /// 發佈到 databroker 的 VSS 訊號
    pub signal: String,
    pub frames: Vec<FrameEntry>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            library: DEFAULT_LIBRARY.to_string(),
            device_type: DEVICE_TYPE_USBCANFD,
            device_index: 0,
            arbitration_baud: DEFAULT_ARBITRATION_BAUD,
            data_baud: DEFAULT_DATA_BAUD,
            canfd_standard: CanFdStandard::Iso,
            pacing_ms: 500,
            receive_timeout_ms: 100,
            signal: DEFAULT_SIGNAL.to_string(),
            frames: vec![FrameEntry::test_frame(0), FrameEntry::test_frame(2)],
        }
    }
}

impl RunConfig {
    pub fn bit_timing(&self) -> Result<BitTiming, CanError> {
        Ok(BitTiming::new(self.arbitration_baud, self.data_baud)?
            .with_standard(self.canfd_standard))
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// YAML 中 frames 區塊，描述一個待發送的測試幀
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEntry {
    #[serde(deserialize_with = "deserialize_hex_or_decimal")]
    pub id: u32,
    pub len: usize,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default = "default_brs")]
    pub brs: bool,
    #[serde(default)]
    pub extended: bool,
}

fn default_brs() -> bool {
    true
}

impl FrameEntry {
    /// ID 0x58A、長度 8、byte[0] = first，其餘為 0
    pub fn test_frame(first: u8) -> Self {
        Self {
            id: TEST_FRAME_ID,
            len: 8,
            data: vec![first],
            brs: true,
            extended: false,
        }
    }

    pub fn to_transmit(&self) -> Result<TransmitFdData, CanError> {
        let flags = FdFlags {
            extended: self.extended,
            bit_rate_switch: self.brs,
            ..FdFlags::default()
        };
        encode(self.id, self.len, &self.data, flags)
    }

    /// 實際送出的 payload（補零至 len）
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = vec![0u8; self.len];
        let n = self.data.len().min(self.len);
        payload[..n].copy_from_slice(&self.data[..n]);
        payload
    }
}

/// 自訂 Visitor 用以解析 u32，支援十進位與十六進位格式（例如 "0x58A"）
struct HexOrDecimalVisitor;

impl<'de> Visitor<'de> for HexOrDecimalVisitor {
    type Value = u32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a u32 integer in decimal or hex format")
    }

    fn visit_u64<E>(self, value: u64) -> Result<u32, E>
    where
        E: de::Error,
    {
        u32::try_from(value).map_err(E::custom)
    }

    fn visit_str<E>(self, value: &str) -> Result<u32, E>
    where
        E: de::Error,
    {
        match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).map_err(E::custom),
            None => value.parse::<u32>().map_err(E::custom),
        }
    }
}

pub fn deserialize_hex_or_decimal<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_any(HexOrDecimalVisitor)
}

/// 載入 YAML 設定檔
pub fn load_config(file_path: &Path) -> Result<RunConfig, ConfigError> {
    let file = File::open(file_path).map_err(|source| ConfigError::Io {
        path: file_path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let config = serde_yaml::from_reader(reader)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::cantypes::{decode, ReceiveFdData};

    #[test]
    fn defaults_match_test_scenario() {
        let config = RunConfig::default();
        assert_eq!(config.device_type, 41);
        assert_eq!(config.frames.len(), 2);
        assert_eq!(config.frames[0].payload(), vec![0; 8]);
        assert_eq!(config.frames[1].payload(), vec![2, 0, 0, 0, 0, 0, 0, 0]);
        let timing = config.bit_timing().unwrap();
        assert_eq!((timing.arbitration(), timing.data()), (500_000, 2_000_000));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "pacing_ms: 0\ndata_baud: 5000000\n";
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pacing(), Duration::ZERO);
        assert_eq!(config.data_baud, 5_000_000);
        assert_eq!(config.arbitration_baud, 500_000);
        assert_eq!(config.library, DEFAULT_LIBRARY);
        assert_eq!(config.frames.len(), 2);
    }

    #[test]
    fn frame_ids_accept_hex_and_decimal() {
        let yaml = r#"
frames:
  - id: "0x58A"
    len: 8
    data: [1, 2]
  - id: 1418
    len: 12
    extended: true
    brs: false
canfd_standard: noniso
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.frames[0].id, 0x58A);
        assert_eq!(config.frames[1].id, 0x58A);
        assert!(config.frames[0].brs);
        assert!(!config.frames[1].brs);
        assert_eq!(config.canfd_standard, CanFdStandard::NonIso);

        let tx = config.frames[1].to_transmit().unwrap();
        let rx = ReceiveFdData::from_transmit(&tx, 0);
        let decoded = decode(&rx);
        assert!(decoded.flags.extended);
        assert_eq!(decoded.data.len(), 12);
    }

    #[test]
    fn oversized_frame_rejected() {
        let entry = FrameEntry {
            len: 65,
            ..FrameEntry::test_frame(0)
        };
        assert!(matches!(entry.to_transmit(), Err(CanError::InvalidLength(65))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/run.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.yaml"));
    }
}
