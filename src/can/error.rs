use thiserror::Error;

/// CAN 層所有錯誤，對目前這次測試皆為終止性錯誤
#[derive(Debug, Error)]
pub enum CanError {
    #[error("Open device failed (type {device_type}, index {device_index})")]
    DeviceOpenFailed { device_type: u32, device_index: u32 },

    #[error("Device already opened")]
    AlreadyOpened,

    #[error("Device not opened")]
    NotOpened,

    #[error("Invalid channel index {0}, expected 0 or 1")]
    InvalidChannelIndex(u32),

    #[error("Invalid bit timing: arbitration {arbitration} bit/s, data {data} bit/s")]
    InvalidBitTiming { arbitration: u32, data: u32 },

    #[error("Bit timing not set for CAN Ch {0}")]
    BitTimingNotSet(u32),

    #[error("Adapter rejected {setting} on CAN Ch {channel}, status {status}")]
    BitTimingRejected {
        channel: u32,
        setting: &'static str,
        status: u32,
    },

    #[error("Init CAN{0} failed")]
    ChannelInitFailed(u32),

    #[error("Channel handle not initialized in this run")]
    ChannelNotInitialized,

    #[error("CAN Ch {channel} start failed, status {status}")]
    ChannelStartFailed { channel: u32, status: u32 },

    #[error("CAN Ch {0} not started")]
    ChannelNotStarted(u32),

    #[error("Transmit failed on CAN Ch {channel}: {accepted} of {submitted} frames accepted")]
    TransmitFailed {
        channel: u32,
        accepted: u32,
        submitted: u32,
    },

    #[error("Invalid CAN-FD length {0}, max 64")]
    InvalidLength(usize),

    #[error("Invalid CAN identifier 0x{0:X} (standard max 0x7FF, extended max 0x1FFFFFFF)")]
    InvalidIdentifier(u32),

    #[error("Driver library error: {0}")]
    Library(#[from] libloading::Error),
}

pub type Result<T> = std::result::Result<T, CanError>;
