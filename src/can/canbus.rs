use crate::can::cantypes::*;
use crate::can::error::Result;
use libloading::Library;
use std::ffi::c_void;
use std::sync::Arc;

/// 轉接器驅動介面，對應 controlcanfd 函式庫的匯出函式
///
/// handle 一律以 [`RawHandle`] 傳遞，失敗時回傳 [`INVALID_HANDLE`]；
/// 其餘函式回傳狀態碼或實際處理的幀數。
pub trait CanFdApi {
    fn open_device(&self, device_type: u32, device_index: u32, reserved: u32) -> RawHandle;
    fn close_device(&self, device: RawHandle) -> u32;
    fn set_abit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32;
    fn set_dbit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32;
    fn set_canfd_standard(&self, device: RawHandle, channel: u32, standard: u32) -> u32;
    fn init_can(&self, device: RawHandle, channel: u32, config: &ChannelInitConfig) -> RawHandle;
    fn start_can(&self, channel: RawHandle) -> u32;
    /// 回傳驅動接受的幀數
    fn transmit_fd(&self, channel: RawHandle, frames: &[TransmitFdData]) -> u32;
    fn get_receive_num(&self, channel: RawHandle, frame_type: u8) -> u32;
    /// 最多填入 `buffer.len()` 筆，無資料時最多等待 `wait_ms`
    fn receive_fd(&self, channel: RawHandle, buffer: &mut [ReceiveFdData], wait_ms: i32) -> u32;
}

/// 封裝 controlcanfd 動態函式庫
pub struct ZCanLibrary {
    _lib: Arc<Library>,
    zcan_open_device: unsafe extern "C" fn(u32, u32, u32) -> *mut c_void,
    zcan_close_device: unsafe extern "C" fn(*mut c_void) -> u32,
    zcan_set_abit_baud: unsafe extern "C" fn(*mut c_void, u32, u32) -> u32,
    zcan_set_dbit_baud: unsafe extern "C" fn(*mut c_void, u32, u32) -> u32,
    zcan_set_canfd_standard: unsafe extern "C" fn(*mut c_void, u32, u32) -> u32,
    zcan_init_can:
        unsafe extern "C" fn(*mut c_void, u32, *const ChannelInitConfig) -> *mut c_void,
    zcan_start_can: unsafe extern "C" fn(*mut c_void) -> u32,
    zcan_transmit_fd: unsafe extern "C" fn(*mut c_void, *const TransmitFdData, u32) -> u32,
    zcan_get_receive_num: unsafe extern "C" fn(*mut c_void, u8) -> u32,
    zcan_receive_fd: unsafe extern "C" fn(*mut c_void, *mut ReceiveFdData, u32, i32) -> u32,
}

impl ZCanLibrary {
    pub fn new(lib_path: &str) -> Result<Self> {
        let lib = Arc::new(unsafe { Library::new(lib_path) }?);
        unsafe {
            Ok(Self {
                _lib: lib.clone(),
                zcan_open_device: *lib.get(b"ZCAN_OpenDevice\0")?,
                zcan_close_device: *lib.get(b"ZCAN_CloseDevice\0")?,
                zcan_set_abit_baud: *lib.get(b"ZCAN_SetAbitBaud\0")?,
                zcan_set_dbit_baud: *lib.get(b"ZCAN_SetDbitBaud\0")?,
                zcan_set_canfd_standard: *lib.get(b"ZCAN_SetCANFDStandard\0")?,
                zcan_init_can: *lib.get(b"ZCAN_InitCAN\0")?,
                zcan_start_can: *lib.get(b"ZCAN_StartCAN\0")?,
                zcan_transmit_fd: *lib.get(b"ZCAN_TransmitFD\0")?,
                zcan_get_receive_num: *lib.get(b"ZCAN_GetReceiveNum\0")?,
                zcan_receive_fd: *lib.get(b"ZCAN_ReceiveFD\0")?,
            })
        }
    }
}

fn ptr(handle: RawHandle) -> *mut c_void {
    handle as *mut c_void
}

impl CanFdApi for ZCanLibrary {
    fn open_device(&self, device_type: u32, device_index: u32, reserved: u32) -> RawHandle {
        unsafe { (self.zcan_open_device)(device_type, device_index, reserved) as RawHandle }
    }

    fn close_device(&self, device: RawHandle) -> u32 {
        unsafe { (self.zcan_close_device)(ptr(device)) }
    }

    fn set_abit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32 {
        unsafe { (self.zcan_set_abit_baud)(ptr(device), channel, baud) }
    }

    fn set_dbit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32 {
        unsafe { (self.zcan_set_dbit_baud)(ptr(device), channel, baud) }
    }

    fn set_canfd_standard(&self, device: RawHandle, channel: u32, standard: u32) -> u32 {
        unsafe { (self.zcan_set_canfd_standard)(ptr(device), channel, standard) }
    }

    fn init_can(&self, device: RawHandle, channel: u32, config: &ChannelInitConfig) -> RawHandle {
        unsafe { (self.zcan_init_can)(ptr(device), channel, config) as RawHandle }
    }

    fn start_can(&self, channel: RawHandle) -> u32 {
        unsafe { (self.zcan_start_can)(ptr(channel)) }
    }

    fn transmit_fd(&self, channel: RawHandle, frames: &[TransmitFdData]) -> u32 {
        unsafe { (self.zcan_transmit_fd)(ptr(channel), frames.as_ptr(), frames.len() as u32) }
    }

    fn get_receive_num(&self, channel: RawHandle, frame_type: u8) -> u32 {
        unsafe { (self.zcan_get_receive_num)(ptr(channel), frame_type) }
    }

    fn receive_fd(&self, channel: RawHandle, buffer: &mut [ReceiveFdData], wait_ms: i32) -> u32 {
        // 驅動寫入不超過 buffer.len() 筆
        unsafe {
            (self.zcan_receive_fd)(
                ptr(channel),
                buffer.as_mut_ptr(),
                buffer.len() as u32,
                wait_ms,
            )
        }
    }
}

impl<T: CanFdApi + ?Sized> CanFdApi for Box<T> {
    fn open_device(&self, device_type: u32, device_index: u32, reserved: u32) -> RawHandle {
        (**self).open_device(device_type, device_index, reserved)
    }

    fn close_device(&self, device: RawHandle) -> u32 {
        (**self).close_device(device)
    }

    fn set_abit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32 {
        (**self).set_abit_baud(device, channel, baud)
    }

    fn set_dbit_baud(&self, device: RawHandle, channel: u32, baud: u32) -> u32 {
        (**self).set_dbit_baud(device, channel, baud)
    }

    fn set_canfd_standard(&self, device: RawHandle, channel: u32, standard: u32) -> u32 {
        (**self).set_canfd_standard(device, channel, standard)
    }

    fn init_can(&self, device: RawHandle, channel: u32, config: &ChannelInitConfig) -> RawHandle {
        (**self).init_can(device, channel, config)
    }

    fn start_can(&self, channel: RawHandle) -> u32 {
        (**self).start_can(channel)
    }

    fn transmit_fd(&self, channel: RawHandle, frames: &[TransmitFdData]) -> u32 {
        (**self).transmit_fd(channel, frames)
    }

    fn get_receive_num(&self, channel: RawHandle, frame_type: u8) -> u32 {
        (**self).get_receive_num(channel, frame_type)
    }

    fn receive_fd(&self, channel: RawHandle, buffer: &mut [ReceiveFdData], wait_ms: i32) -> u32 {
        (**self).receive_fd(channel, buffer, wait_ms)
    }
}
