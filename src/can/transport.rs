use crate::can::adapter::{AdapterHandle, ChannelHandle};
use crate::can::canbus::CanFdApi;
use crate::can::cantypes::{ReceiveFdData, TransmitFdData, TYPE_CANFD};
use crate::can::error::{CanError, Result};
use log::debug;
use std::time::Duration;

/// 單次接收配置的緩衝上限，超出的幀留在驅動佇列等下一次接收
pub const RX_BUFFER_MAX: usize = 1000;

/// 一次接收取得的幀，依驅動回報順序排列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveBatch {
    frames: Vec<ReceiveFdData>,
}

impl ReceiveBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ReceiveFdData> {
        self.frames.iter()
    }
}

impl IntoIterator for ReceiveBatch {
    type Item = ReceiveFdData;
    type IntoIter = std::vec::IntoIter<ReceiveFdData>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.into_iter()
    }
}

impl<'a> IntoIterator for &'a ReceiveBatch {
    type Item = &'a ReceiveFdData;
    type IntoIter = std::slice::Iter<'a, ReceiveFdData>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

/// 在已啟動的通道上收發
pub struct ChannelTransport<'a, A: CanFdApi> {
    adapter: &'a AdapterHandle<A>,
}

impl<'a, A: CanFdApi> ChannelTransport<'a, A> {
    pub fn new(adapter: &'a AdapterHandle<A>) -> Self {
        Self { adapter }
    }

    /// 送出單一幀；驅動未接受即回報 TransmitFailed，不重試
    pub fn transmit(&self, channel: ChannelHandle, data: &TransmitFdData) -> Result<()> {
        self.adapter.ensure_started(channel)?;
        let accepted = self
            .adapter
            .api()
            .transmit_fd(channel.raw(), std::slice::from_ref(data));
        if accepted < 1 {
            return Err(CanError::TransmitFailed {
                channel: channel.index(),
                accepted,
                submitted: 1,
            });
        }
        debug!(
            "CAN Ch {} TX ID=0x{:X} len={}",
            channel.index(),
            data.frame.id(),
            data.frame.len()
        );
        Ok(())
    }

    pub fn pending_count(&self, channel: ChannelHandle) -> Result<usize> {
        self.adapter.ensure_started(channel)?;
        Ok(self
            .adapter
            .api()
            .get_receive_num(channel.raw(), TYPE_CANFD) as usize)
    }

    /// 最多取回 `max_count` 筆（上限 [`RX_BUFFER_MAX`]）；無資料時最多阻塞 `timeout`，逾時回傳空批次
    pub fn receive(
        &self,
        channel: ChannelHandle,
        max_count: usize,
        timeout: Duration,
    ) -> Result<ReceiveBatch> {
        self.adapter.ensure_started(channel)?;
        if max_count == 0 {
            return Ok(ReceiveBatch::default());
        }
        let capacity = max_count.min(RX_BUFFER_MAX);
        let mut frames = vec![ReceiveFdData::default(); capacity];
        let wait_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let received = self
            .adapter
            .api()
            .receive_fd(channel.raw(), &mut frames, wait_ms) as usize;
        frames.truncate(received.min(capacity));
        debug!("CAN Ch {} RX {} frame(s)", channel.index(), frames.len());
        Ok(ReceiveBatch { frames })
    }
}
