use crate::can::error::{CanError, Result};

/// ZCAN 狀態碼：成功
pub const STATUS_OK: u32 = 1;
/// 裝置與通道 handle 共用的無效值
pub const INVALID_HANDLE: RawHandle = 0;
/// 幀類型標籤：CAN-FD
pub const TYPE_CANFD: u8 = 1;
/// USBCANFD 裝置類型
pub const DEVICE_TYPE_USBCANFD: u32 = 41;

pub const CANFD_MAX_LEN: usize = 64;
pub const CAN_ID_MAX: u32 = 0x1FFF_FFFF;
pub const CAN_STD_ID_MAX: u32 = 0x7FF;

const ERR_BIT: u32 = 1 << 29;
const RTR_BIT: u32 = 1 << 30;
const EFF_BIT: u32 = 1 << 31;
const BRS_BIT: u8 = 1 << 0;
const ESI_BIT: u8 = 1 << 1;

/// 驅動回傳的不透明 handle（裝置或通道）
pub type RawHandle = usize;

/// 幀旗標
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdFlags {
    /// 錯誤幀（僅接收）
    pub error: bool,
    pub remote: bool,
    pub extended: bool,
    /// 資料段使用 data-phase 速率
    pub bit_rate_switch: bool,
    /// 發送端處於 error-passive（僅接收）
    pub error_state_indicator: bool,
}

impl FdFlags {
    /// 發送時可設定的旗標，err 與 esi 一律清除
    pub fn for_transmit(self) -> Self {
        Self {
            error: false,
            error_state_indicator: false,
            ..self
        }
    }
}

/// ZCAN_CANFD_FRAME，與驅動記憶體佈局一致
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZCanFdFrame {
    /// bit 0..29 = can_id, bit 29 = err, bit 30 = rtr, bit 31 = eff
    can_id: u32,
    len: u8,
    /// bit 0 = brs, bit 1 = esi
    flags: u8,
    res0: u8,
    res1: u8,
    data: [u8; CANFD_MAX_LEN],
}

impl Default for ZCanFdFrame {
    fn default() -> Self {
        Self {
            can_id: 0,
            len: 0,
            flags: 0,
            res0: 0,
            res1: 0,
            data: [0; CANFD_MAX_LEN],
        }
    }
}

impl ZCanFdFrame {
    pub fn id(&self) -> u32 {
        self.can_id & CAN_ID_MAX
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn flags(&self) -> FdFlags {
        FdFlags {
            error: self.can_id & ERR_BIT != 0,
            remote: self.can_id & RTR_BIT != 0,
            extended: self.can_id & EFF_BIT != 0,
            bit_rate_switch: self.flags & BRS_BIT != 0,
            error_state_indicator: self.flags & ESI_BIT != 0,
        }
    }

    /// 有效資料，長度恰為 len，不超過 64
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len().min(CANFD_MAX_LEN)]
    }

    fn pack(id: u32, len: u8, flags: FdFlags, data: [u8; CANFD_MAX_LEN]) -> Self {
        let mut can_id = id & CAN_ID_MAX;
        if flags.error {
            can_id |= ERR_BIT;
        }
        if flags.remote {
            can_id |= RTR_BIT;
        }
        if flags.extended {
            can_id |= EFF_BIT;
        }
        let mut fd = 0;
        if flags.bit_rate_switch {
            fd |= BRS_BIT;
        }
        if flags.error_state_indicator {
            fd |= ESI_BIT;
        }
        Self {
            can_id,
            len,
            flags: fd,
            res0: 0,
            res1: 0,
            data,
        }
    }
}

/// ZCAN_TransmitFD_Data
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitFdData {
    pub frame: ZCanFdFrame,
    /// 0 = 正常發送
    pub transmit_type: u32,
}

/// ZCAN_ReceiveFD_Data
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveFdData {
    pub frame: ZCanFdFrame,
    /// 裝置時鐘，單位不透明
    pub timestamp: u64,
}

impl ReceiveFdData {
    /// 由驅動端（或模擬器）以已發送的幀建立接收資料
    pub fn from_transmit(tx: &TransmitFdData, timestamp: u64) -> Self {
        Self {
            frame: tx.frame,
            timestamp,
        }
    }
}

/// 解碼後的接收幀
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub id: u32,
    pub flags: FdFlags,
    pub data: &'a [u8],
}

/// 建立發送資料；不足 length 的部分補零，超出 length 的 bytes 不送出
///
/// 標準幀（extended = false）的 ID 不可超過 0x7FF。
pub fn encode(id: u32, length: usize, bytes: &[u8], flags: FdFlags) -> Result<TransmitFdData> {
    if length > CANFD_MAX_LEN {
        return Err(CanError::InvalidLength(length));
    }
    let max_id = if flags.extended { CAN_ID_MAX } else { CAN_STD_ID_MAX };
    if id > max_id {
        return Err(CanError::InvalidIdentifier(id));
    }
    let mut data = [0u8; CANFD_MAX_LEN];
    let n = bytes.len().min(length);
    data[..n].copy_from_slice(&bytes[..n]);
    Ok(TransmitFdData {
        frame: ZCanFdFrame::pack(id, length as u8, flags.for_transmit(), data),
        transmit_type: 0,
    })
}

pub fn decode(rx: &ReceiveFdData) -> DecodedFrame<'_> {
    DecodedFrame {
        id: rx.frame.id(),
        flags: rx.frame.flags(),
        data: rx.frame.data(),
    }
}

/// ZCAN_CHANNEL_CANFD_INIT_CONFIG
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanFdInitConfig {
    pub acc_code: u32,
    pub acc_mask: u32,
    pub abit_timing: u32,
    pub dbit_timing: u32,
    pub brp: u32,
    pub filter: u8,
    /// 0 = normal, 1 = internal loopback
    pub mode: u8,
    pub pad: u16,
    pub reserved: u32,
}

/// ZCAN_CHANNEL_INIT_CONFIG；驅動端為 union，此處只有 CAN-FD 一種變體
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInitConfig {
    pub can_type: u32,
    pub canfd: CanFdInitConfig,
}

impl ChannelInitConfig {
    pub fn canfd(canfd: CanFdInitConfig) -> Self {
        Self {
            can_type: TYPE_CANFD as u32,
            canfd,
        }
    }

    pub fn mode(&self) -> u8 {
        self.canfd.mode
    }
}
