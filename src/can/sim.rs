//! 行程內模擬的雙通道 CAN-FD 轉接器
//!
//! 行為與 controlcanfd 驅動一致：handle 以 0 表示無效，通道需 init + start
//! 才能收發；mode = 1 時，一個通道送出的幀依序進入另一個通道的接收佇列。

use crate::can::canbus::CanFdApi;
use crate::can::cantypes::*;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEVICE_HANDLE: RawHandle = 0x1000;
const CHANNEL_HANDLE_BASE: RawHandle = 0x2000;
const CHANNEL_COUNT: usize = 2;

#[derive(Debug, Default)]
struct SimChannel {
    abit_baud: Option<u32>,
    dbit_baud: Option<u32>,
    standard: Option<u32>,
    mode: Option<u8>,
    started: bool,
    rx: VecDeque<ReceiveFdData>,
}

#[derive(Debug, Default)]
struct SimState {
    fail_open: bool,
    fail_init: Option<u32>,
    reject_transmit: bool,
    device_open: bool,
    close_calls: u32,
    calls: Vec<&'static str>,
    channels: [SimChannel; CHANNEL_COUNT],
}

struct Shared {
    state: Mutex<SimState>,
    arrived: Condvar,
    epoch: Instant,
}

/// 可複製的模擬轉接器；所有複本共用同一個裝置狀態
#[derive(Clone)]
pub struct SimulatedAdapter {
    shared: Arc<Shared>,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::default()),
                arrived: Condvar::new(),
                epoch: Instant::now(),
            }),
        }
    }

    /// OpenDevice 回傳無效 handle
    pub fn failing_open(self) -> Self {
        self.state().fail_open = true;
        self
    }

    /// 指定通道 InitCAN 失敗
    pub fn failing_init(self, channel: u32) -> Self {
        self.state().fail_init = Some(channel);
        self
    }

    /// TransmitFD 一律回傳 0
    pub fn rejecting_transmit(self) -> Self {
        self.state().reject_transmit = true;
        self
    }

    pub fn is_open(&self) -> bool {
        self.state().device_open
    }

    pub fn close_calls(&self) -> u32 {
        self.state().close_calls
    }

    /// 依序記錄的驅動呼叫名稱
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn baud(&self, channel: usize) -> (Option<u32>, Option<u32>) {
        let state = self.state();
        (
            state.channels[channel].abit_baud,
            state.channels[channel].dbit_baud,
        )
    }

    pub fn mode(&self, channel: usize) -> Option<u8> {
        self.state().channels[channel].mode
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn timestamp(&self) -> u64 {
        self.shared.epoch.elapsed().as_micros() as u64
    }

    fn channel_index(state: &SimState, handle: RawHandle) -> Option<usize> {
        let index = handle.checked_sub(CHANNEL_HANDLE_BASE)?;
        if index < CHANNEL_COUNT && state.device_open && state.channels[index].mode.is_some() {
            Some(index)
        } else {
            None
        }
    }

    fn set_channel<F>(&self, call: &'static str, device: RawHandle, channel: u32, f: F) -> u32
    where
        F: FnOnce(&mut SimChannel),
    {
        let mut state = self.state();
        state.calls.push(call);
        if device != DEVICE_HANDLE || !state.device_open || channel as usize >= CHANNEL_COUNT {
            return 0;
        }
        f(&mut state.channels[channel as usize]);
        STATUS_OK
    }
}

impl CanFdApi for SimulatedAdapter {
    fn open_device(&self, _device_type: u32, _device_index: u32, _reserved: u32) -> RawHandle {
        let mut state = self.state();
        state.calls.push("open_device");
        if state.fail_open || state.device_open {
            return INVALID_HANDLE;
        }
        state.device_open = true;
        DEVICE_HANDLE
    }

    fn close_device(&self, device: RawHandle) -> u32 {
        let mut state = self.state();
        state.calls.push("close_device");
        state.close_calls += 1;
        if device != DEVICE_HANDLE || !state.device_open {
            return 0;
        }
        state.device_open = false;
        state.channels = Default::default();
        STATUS_OK
    }

    fn set_abit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32 {
        self.set_channel("set_abit_baud", device, channel, |ch| {
            ch.abit_baud = Some(baud)
        })
    }

    fn set_dbit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32 {
        self.set_channel("set_dbit_baud", device, channel, |ch| {
            ch.dbit_baud = Some(baud)
        })
    }

    fn set_canfd_standard(&self, device: RawHandle, channel: u32, standard: u32) -> u32 {
        self.set_channel("set_canfd_standard", device, channel, |ch| {
            ch.standard = Some(standard)
        })
    }

    fn init_can(&self, device: RawHandle, channel: u32, config: &ChannelInitConfig) -> RawHandle {
        let mut state = self.state();
        state.calls.push("init_can");
        let index = channel as usize;
        if device != DEVICE_HANDLE
            || !state.device_open
            || index >= CHANNEL_COUNT
            || state.fail_init == Some(channel)
            || config.can_type != TYPE_CANFD as u32
        {
            return INVALID_HANDLE;
        }
        let ch = &mut state.channels[index];
        ch.mode = Some(config.mode());
        ch.started = false;
        ch.rx.clear();
        CHANNEL_HANDLE_BASE + index
    }

    fn start_can(&self, channel: RawHandle) -> u32 {
        let mut state = self.state();
        state.calls.push("start_can");
        match Self::channel_index(&state, channel) {
            Some(index) => {
                state.channels[index].started = true;
                STATUS_OK
            }
            None => 0,
        }
    }

    fn transmit_fd(&self, channel: RawHandle, frames: &[TransmitFdData]) -> u32 {
        let timestamp = self.timestamp();
        let mut state = self.state();
        state.calls.push("transmit_fd");
        let Some(index) = Self::channel_index(&state, channel) else {
            return 0;
        };
        if !state.channels[index].started || state.reject_transmit {
            return 0;
        }
        if state.channels[index].mode == Some(1) {
            let peer = &mut state.channels[(index + 1) % CHANNEL_COUNT];
            if peer.started {
                peer.rx
                    .extend(frames.iter().map(|f| ReceiveFdData::from_transmit(f, timestamp)));
                self.shared.arrived.notify_all();
            }
        }
        frames.len() as u32
    }

    fn get_receive_num(&self, channel: RawHandle, frame_type: u8) -> u32 {
        let mut state = self.state();
        state.calls.push("get_receive_num");
        match Self::channel_index(&state, channel) {
            Some(index) if frame_type == TYPE_CANFD => state.channels[index].rx.len() as u32,
            _ => 0,
        }
    }

    fn receive_fd(&self, channel: RawHandle, buffer: &mut [ReceiveFdData], wait_ms: i32) -> u32 {
        let mut state = self.state();
        state.calls.push("receive_fd");
        let Some(index) = Self::channel_index(&state, channel) else {
            return 0;
        };
        if state.channels[index].rx.is_empty() && wait_ms > 0 {
            let wait = Duration::from_millis(wait_ms as u64);
            state = self
                .shared
                .arrived
                .wait_timeout_while(state, wait, |s| s.channels[index].rx.is_empty())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let rx = &mut state.channels[index].rx;
        let count = rx.len().min(buffer.len());
        for (slot, frame) in buffer.iter_mut().zip(rx.drain(..count)) {
            *slot = frame;
        }
        count as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_pair(sim: &SimulatedAdapter) -> (RawHandle, RawHandle) {
        let dev = sim.open_device(DEVICE_TYPE_USBCANFD, 0, 0);
        let mut config = ChannelInitConfig::canfd(CanFdInitConfig::default());
        config.canfd.mode = 1;
        let ch0 = sim.init_can(dev, 0, &config);
        let ch1 = sim.init_can(dev, 1, &config);
        assert_eq!(sim.start_can(ch0), STATUS_OK);
        assert_eq!(sim.start_can(ch1), STATUS_OK);
        (ch0, ch1)
    }

    #[test]
    fn second_open_returns_invalid_handle() {
        let sim = SimulatedAdapter::new();
        assert_ne!(sim.open_device(DEVICE_TYPE_USBCANFD, 0, 0), INVALID_HANDLE);
        assert_eq!(sim.open_device(DEVICE_TYPE_USBCANFD, 0, 0), INVALID_HANDLE);
    }

    #[test]
    fn transmit_before_start_is_rejected() {
        let sim = SimulatedAdapter::new();
        let dev = sim.open_device(DEVICE_TYPE_USBCANFD, 0, 0);
        let config = ChannelInitConfig::canfd(CanFdInitConfig::default());
        let ch0 = sim.init_can(dev, 0, &config);
        assert_eq!(sim.transmit_fd(ch0, &[TransmitFdData::default()]), 0);
    }

    #[test]
    fn loopback_routes_to_peer_in_order() {
        let sim = SimulatedAdapter::new();
        let (ch0, ch1) = loopback_pair(&sim);
        let frames: Vec<_> = (0u8..3)
            .map(|b| encode(0x100, 1, &[b], FdFlags::default()).unwrap())
            .collect();
        assert_eq!(sim.transmit_fd(ch0, &frames), 3);
        assert_eq!(sim.get_receive_num(ch1, TYPE_CANFD), 3);
        assert_eq!(sim.get_receive_num(ch0, TYPE_CANFD), 0);

        let mut buffer = [ReceiveFdData::default(); 2];
        assert_eq!(sim.receive_fd(ch1, &mut buffer, 0), 2);
        assert_eq!(decode(&buffer[0]).data, &[0]);
        assert_eq!(decode(&buffer[1]).data, &[1]);
        assert_eq!(sim.get_receive_num(ch1, TYPE_CANFD), 1);
    }

    #[test]
    fn receive_wakes_on_frame_from_other_thread() {
        let sim = SimulatedAdapter::new();
        let (ch0, ch1) = loopback_pair(&sim);
        let sender = sim.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let frame = encode(0x58A, 8, &[], FdFlags::default()).unwrap();
            sender.transmit_fd(ch0, &[frame]);
        });
        let mut buffer = [ReceiveFdData::default(); 1];
        assert_eq!(sim.receive_fd(ch1, &mut buffer, 2000), 1);
        assert_eq!(decode(&buffer[0]).id, 0x58A);
        handle.join().unwrap();
    }

    #[test]
    fn close_resets_channels() {
        let sim = SimulatedAdapter::new();
        let (ch0, _) = loopback_pair(&sim);
        assert_eq!(sim.close_device(DEVICE_HANDLE), STATUS_OK);
        assert!(!sim.is_open());
        assert_eq!(sim.start_can(ch0), 0);
        assert_eq!(sim.close_device(DEVICE_HANDLE), 0);
        assert_eq!(sim.close_calls(), 2);
    }
}
