use crate::can::canbus::CanFdApi;
use crate::can::cantypes::{ChannelInitConfig, RawHandle, INVALID_HANDLE, STATUS_OK};
use crate::can::channel_config::BitTiming;
use crate::can::error::{CanError, Result};
use log::{debug, info, warn};

pub const CHANNEL_COUNT: u32 = 2;

/// 已開啟裝置的 handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(RawHandle);

impl DeviceHandle {
    pub fn raw(&self) -> RawHandle {
        self.0
    }
}

/// 由 [`AdapterHandle::init_channel`] 產生的通道 handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    raw: RawHandle,
    index: u32,
    device: RawHandle,
    /// 驅動會重複使用 handle 值，以世代區分不同次 open / init
    generation: u64,
}

impl ChannelHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }
}

#[derive(Debug, Default)]
struct ChannelSlot {
    timing: Option<BitTiming>,
    handle: Option<ChannelHandle>,
    started: bool,
}

/// 擁有裝置與兩個通道 handle 的生命週期
///
/// 呼叫順序：open → set_bit_timing → init_channel → start。
/// drop 時自動 close，任何離開路徑都會釋放裝置。
pub struct AdapterHandle<A: CanFdApi> {
    api: A,
    device_type: u32,
    device_index: u32,
    device: Option<DeviceHandle>,
    generation: u64,
    channels: [ChannelSlot; CHANNEL_COUNT as usize],
}

impl<A: CanFdApi> AdapterHandle<A> {
    pub fn new(api: A, device_type: u32, device_index: u32) -> Self {
        Self {
            api,
            device_type,
            device_index,
            device: None,
            generation: 0,
            channels: Default::default(),
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn open(&mut self) -> Result<DeviceHandle> {
        if self.device.is_some() {
            return Err(CanError::AlreadyOpened);
        }
        let raw = self
            .api
            .open_device(self.device_type, self.device_index, 0);
        if raw == INVALID_HANDLE {
            return Err(CanError::DeviceOpenFailed {
                device_type: self.device_type,
                device_index: self.device_index,
            });
        }
        let device = DeviceHandle(raw);
        self.generation += 1;
        info!("Device opened: handle 0x{:x}", raw);
        self.device = Some(device);
        Ok(device)
    }

    fn device(&self) -> Result<DeviceHandle> {
        self.device.ok_or(CanError::NotOpened)
    }

    fn check_index(channel: u32) -> Result<usize> {
        if channel < CHANNEL_COUNT {
            Ok(channel as usize)
        } else {
            Err(CanError::InvalidChannelIndex(channel))
        }
    }

    /// 設定仲裁段、資料段波特率與 CAN-FD 標準；init 前最後一次設定生效
    pub fn set_bit_timing(&mut self, channel: u32, timing: BitTiming) -> Result<()> {
        let index = Self::check_index(channel)?;
        let device = self.device()?.raw();
        let check = |setting: &'static str, status: u32| {
            if status == STATUS_OK {
                Ok(())
            } else {
                Err(CanError::BitTimingRejected {
                    channel,
                    setting,
                    status,
                })
            }
        };
        check(
            "arbitration baud",
            self.api
                .set_abit_baud(device, channel, timing.arbitration()),
        )?;
        check(
            "data baud",
            self.api.set_dbit_baud(device, channel, timing.data()),
        )?;
        check(
            "CAN-FD standard",
            self.api
                .set_canfd_standard(device, channel, timing.standard() as u32),
        )?;
        debug!(
            "CAN Ch {} timing: {} / {} bit/s ({:?})",
            channel,
            timing.arbitration(),
            timing.data(),
            timing.standard()
        );
        self.channels[index].timing = Some(timing);
        Ok(())
    }

    pub fn init_channel(&mut self, channel: u32, config: &ChannelInitConfig) -> Result<ChannelHandle> {
        let index = Self::check_index(channel)?;
        let device = self.device()?.raw();
        if self.channels[index].timing.is_none() {
            return Err(CanError::BitTimingNotSet(channel));
        }
        let raw = self.api.init_can(device, channel, config);
        if raw == INVALID_HANDLE {
            return Err(CanError::ChannelInitFailed(channel));
        }
        self.generation += 1;
        let handle = ChannelHandle {
            raw,
            index: channel,
            device,
            generation: self.generation,
        };
        let slot = &mut self.channels[index];
        slot.handle = Some(handle);
        slot.started = false;
        info!("Init CAN{} OK!", channel);
        Ok(handle)
    }

    pub fn start(&mut self, channel: ChannelHandle) -> Result<()> {
        let index = self.owned_slot(channel)?;
        let status = self.api.start_can(channel.raw);
        if status != STATUS_OK {
            return Err(CanError::ChannelStartFailed {
                channel: channel.index,
                status,
            });
        }
        self.channels[index].started = true;
        info!("CAN Ch {} started", channel.index);
        Ok(())
    }

    fn owned_slot(&self, channel: ChannelHandle) -> Result<usize> {
        let index = Self::check_index(channel.index)?;
        let device = self.device.map(|d| d.raw());
        if device != Some(channel.device) || self.channels[index].handle != Some(channel) {
            return Err(CanError::ChannelNotInitialized);
        }
        Ok(index)
    }

    /// 通道已 start 才可收發
    pub fn ensure_started(&self, channel: ChannelHandle) -> Result<()> {
        let index = self.owned_slot(channel)?;
        if self.channels[index].started {
            Ok(())
        } else {
            Err(CanError::ChannelNotStarted(channel.index))
        }
    }

    /// 釋放裝置與所有通道 handle；重複呼叫無作用
    pub fn close(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        self.channels = Default::default();
        let status = self.api.close_device(device.raw());
        if status == STATUS_OK {
            info!("Device closed");
        } else {
            warn!("Device close returned status {}", status);
        }
    }
}

impl<A: CanFdApi> Drop for AdapterHandle<A> {
    fn drop(&mut self) {
        self.close();
    }
}
