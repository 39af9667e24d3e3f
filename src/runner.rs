use crate::broker::{PublishOutcome, SignalBroker, SignalValue};
use crate::can::adapter::{AdapterHandle, CHANNEL_COUNT};
use crate::can::canbus::CanFdApi;
use crate::can::cantypes::{decode, TransmitFdData};
use crate::can::channel_config::{build, BitTiming, ChannelMode};
use crate::can::config::{FrameEntry, RunConfig};
use crate::can::error::Result;
use crate::can::transport::ChannelTransport;
use flume::Sender;
use log::info;
use std::fmt;
use std::thread;
use std::time::Duration;

const TX_CHANNEL: usize = 0;
const RX_CHANNEL: usize = 1;

/// 迴環接收到的一幀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxReport {
    pub channel: u32,
    pub id: u32,
    pub data: Vec<u8>,
    pub timestamp: u64,
}

impl fmt::Display for RxReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CH={} ID=0x{:X}, Data={:?}, ts={}",
            self.channel, self.id, self.data, self.timestamp
        )
    }
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub mode: ChannelMode,
    pub timing: BitTiming,
    pub frames: Vec<FrameEntry>,
    /// 每次發送後的等待；測試時設為 0
    pub pacing: Duration,
    pub receive_timeout: Duration,
    pub signal: String,
}

impl RunnerOptions {
    pub fn from_config(config: &RunConfig, mode: ChannelMode) -> Result<Self> {
        Ok(Self {
            mode,
            timing: config.bit_timing()?,
            frames: config.frames.clone(),
            pacing: config.pacing(),
            receive_timeout: config.receive_timeout(),
            signal: config.signal.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: ChannelMode,
    pub transmitted: usize,
    pub received: Vec<RxReport>,
    /// 只有迴環模式才有值：收到的幀與送出的幀順序、內容完全一致
    pub loopback_verified: Option<bool>,
    pub publish: PublishOutcome,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.loopback_verified.unwrap_or(true)
    }
}

struct ScenarioResult {
    transmitted: usize,
    received: Vec<RxReport>,
    loopback_verified: Option<bool>,
}

/// 開啟裝置、初始化兩個通道、於通道 0 發送測試幀，迴環模式下再從通道 1 讀回
pub struct LoopbackTestRunner<A: CanFdApi, B: SignalBroker> {
    adapter: AdapterHandle<A>,
    broker: B,
    options: RunnerOptions,
    data_tx: Sender<RxReport>,
}

impl<A: CanFdApi, B: SignalBroker> LoopbackTestRunner<A, B> {
    pub fn new(
        adapter: AdapterHandle<A>,
        broker: B,
        options: RunnerOptions,
        data_tx: Sender<RxReport>,
    ) -> Self {
        Self {
            adapter,
            broker,
            options,
            data_tx,
        }
    }

    /// 任何 CAN 錯誤都會先關閉裝置再回傳；databroker 發佈失敗只記錄在報告中
    pub fn run(mut self) -> Result<RunReport> {
        let scenario = self.run_scenario();
        self.adapter.close();
        let scenario = scenario?;

        let report = RunReport {
            mode: self.options.mode,
            transmitted: scenario.transmitted,
            received: scenario.received,
            loopback_verified: scenario.loopback_verified,
            publish: PublishOutcome::Published,
        };
        let signal = &self.options.signal;
        let result = self
            .broker
            .publish(signal, SignalValue::Bool(report.passed()));
        Ok(RunReport {
            publish: PublishOutcome::from_result(signal, result),
            ..report
        })
    }

    fn run_scenario(&mut self) -> Result<ScenarioResult> {
        let encoded = self
            .options
            .frames
            .iter()
            .map(FrameEntry::to_transmit)
            .collect::<Result<Vec<TransmitFdData>>>()?;

        self.adapter.open()?;
        let timing = self.options.timing;
        for ch in 0..CHANNEL_COUNT {
            self.adapter.set_bit_timing(ch, timing)?;
        }
        let config = build(&timing, self.options.mode);
        let mut handles = Vec::with_capacity(CHANNEL_COUNT as usize);
        for ch in 0..CHANNEL_COUNT {
            handles.push(self.adapter.init_channel(ch, &config)?);
        }
        for &handle in &handles {
            self.adapter.start(handle)?;
        }
        info!("Both CAN channels started");

        let transport = ChannelTransport::new(&self.adapter);
        let tx = handles[TX_CHANNEL];
        for (entry, data) in self.options.frames.iter().zip(&encoded) {
            info!(
                "Sending ID 0x{:X} with byte[0] = {}",
                entry.id,
                entry.payload().first().copied().unwrap_or(0)
            );
            transport.transmit(tx, data)?;
            if !self.options.pacing.is_zero() {
                thread::sleep(self.options.pacing);
            }
        }

        if !self.options.mode.is_loopback() {
            return Ok(ScenarioResult {
                transmitted: encoded.len(),
                received: Vec::new(),
                loopback_verified: None,
            });
        }

        info!("Loopback enabled, waiting for received frames...");
        let rx = handles[RX_CHANNEL];
        let pending = transport.pending_count(rx)?;
        let mut received = Vec::new();
        if pending > 0 {
            let batch = transport.receive(rx, pending, self.options.receive_timeout)?;
            received.reserve(batch.len());
            for frame in &batch {
                let decoded = decode(frame);
                let report = RxReport {
                    channel: rx.index(),
                    id: decoded.id,
                    data: decoded.data.to_vec(),
                    timestamp: frame.timestamp,
                };
                info!(
                    "Loopback RX ID: 0x{:X}, Data: {:?}",
                    report.id, report.data
                );
                let _ = self.data_tx.send(report.clone());
                received.push(report);
            }
        } else {
            info!("No frames pending on CAN Ch {}", rx.index());
        }

        let verified = received.len() == self.options.frames.len()
            && received
                .iter()
                .zip(&self.options.frames)
                .all(|(got, sent)| got.id == sent.id && got.data == sent.payload());
        Ok(ScenarioResult {
            transmitted: encoded.len(),
            received,
            loopback_verified: Some(verified),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;
    use crate::can::error::CanError;
    use crate::can::cantypes::DEVICE_TYPE_USBCANFD;
    use crate::can::sim::SimulatedAdapter;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingBroker {
        published: Arc<Mutex<Vec<(String, SignalValue)>>>,
        fail: bool,
    }

    impl SignalBroker for RecordingBroker {
        fn publish(&mut self, signal: &str, value: SignalValue) -> std::result::Result<(), BrokerError> {
            if self.fail {
                return Err(BrokerError::MalformedAddress("unreachable".into()));
            }
            self.published
                .lock()
                .unwrap()
                .push((signal.to_string(), value));
            Ok(())
        }
    }

    fn options(mode: ChannelMode) -> RunnerOptions {
        let mut options = RunnerOptions::from_config(&RunConfig::default(), mode).unwrap();
        options.pacing = Duration::ZERO;
        options
    }

    fn runner(
        sim: &SimulatedAdapter,
        broker: &RecordingBroker,
        mode: ChannelMode,
    ) -> (
        LoopbackTestRunner<SimulatedAdapter, RecordingBroker>,
        flume::Receiver<RxReport>,
    ) {
        let (data_tx, data_rx) = flume::unbounded();
        let adapter = AdapterHandle::new(sim.clone(), DEVICE_TYPE_USBCANFD, 0);
        (
            LoopbackTestRunner::new(adapter, broker.clone(), options(mode), data_tx),
            data_rx,
        )
    }

    #[test]
    fn normal_mode_transmits_without_receive() {
        let sim = SimulatedAdapter::new();
        let broker = RecordingBroker::default();
        let (runner, data_rx) = runner(&sim, &broker, ChannelMode::Normal);
        let report = runner.run().unwrap();

        assert_eq!(report.transmitted, 2);
        assert!(report.received.is_empty());
        assert_eq!(report.loopback_verified, None);
        assert!(report.passed());
        let calls = sim.calls();
        assert_eq!(calls.iter().filter(|c| **c == "transmit_fd").count(), 2);
        assert!(!calls.contains(&"get_receive_num"));
        assert!(!calls.contains(&"receive_fd"));
        assert!(!sim.is_open());
        assert!(data_rx.try_recv().is_err());
        assert_eq!(
            broker.published.lock().unwrap().as_slice(),
            &[(
                "Vehicle.Cabin.Light.Spotlight.Row1.PassengerSide.IsLightOn".to_string(),
                SignalValue::Bool(true)
            )]
        );
    }

    #[test]
    fn loopback_mode_reads_back_both_frames_in_order() {
        let sim = SimulatedAdapter::new();
        let broker = RecordingBroker::default();
        let (runner, data_rx) = runner(&sim, &broker, ChannelMode::InternalLoopback);
        let report = runner.run().unwrap();

        assert_eq!(report.loopback_verified, Some(true));
        assert_eq!(report.received.len(), 2);
        assert!(report.received.iter().all(|r| r.id == 0x58A && r.channel == 1));
        assert_eq!(report.received[0].data, vec![0; 8]);
        assert_eq!(report.received[1].data, vec![2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(report.publish, PublishOutcome::Published);

        let streamed: Vec<_> = data_rx.try_iter().collect();
        assert_eq!(streamed, report.received);
        assert!(!sim.is_open());
    }

    #[test]
    fn open_failure_aborts_before_channel_calls() {
        let sim = SimulatedAdapter::new().failing_open();
        let broker = RecordingBroker::default();
        let (runner, _) = runner(&sim, &broker, ChannelMode::InternalLoopback);
        let err = runner.run().unwrap_err();

        assert!(matches!(err, CanError::DeviceOpenFailed { .. }));
        assert!(err.to_string().starts_with("Open device failed"));
        assert_eq!(sim.calls(), vec!["open_device"]);
        assert!(broker.published.lock().unwrap().is_empty());
    }

    #[test]
    fn init_failure_closes_device() {
        let sim = SimulatedAdapter::new().failing_init(1);
        let broker = RecordingBroker::default();
        let (runner, _) = runner(&sim, &broker, ChannelMode::Normal);
        let err = runner.run().unwrap_err();

        assert!(matches!(err, CanError::ChannelInitFailed(1)));
        assert_eq!(sim.close_calls(), 1);
        assert!(!sim.is_open());
        assert!(!sim.calls().contains(&"start_can"));
    }

    #[test]
    fn transmit_failure_aborts_and_closes() {
        let sim = SimulatedAdapter::new().rejecting_transmit();
        let broker = RecordingBroker::default();
        let (runner, _) = runner(&sim, &broker, ChannelMode::InternalLoopback);
        let err = runner.run().unwrap_err();

        assert!(matches!(err, CanError::TransmitFailed { channel: 0, .. }));
        assert_eq!(sim.calls().iter().filter(|c| **c == "transmit_fd").count(), 1);
        assert_eq!(sim.close_calls(), 1);
        assert!(broker.published.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_frame_rejected_before_open() {
        let sim = SimulatedAdapter::new();
        let broker = RecordingBroker::default();
        let (data_tx, _) = flume::unbounded();
        let mut opts = options(ChannelMode::Normal);
        opts.frames.push(FrameEntry {
            id: 0x2000_0000,
            ..FrameEntry::test_frame(0)
        });
        let adapter = AdapterHandle::new(sim.clone(), DEVICE_TYPE_USBCANFD, 0);
        let err = LoopbackTestRunner::new(adapter, broker, opts, data_tx)
            .run()
            .unwrap_err();

        assert!(matches!(err, CanError::InvalidIdentifier(0x2000_0000)));
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn broker_failure_is_not_fatal() {
        let sim = SimulatedAdapter::new();
        let broker = RecordingBroker {
            fail: true,
            ..RecordingBroker::default()
        };
        let (runner, _) = runner(&sim, &broker, ChannelMode::InternalLoopback);
        let report = runner.run().unwrap();

        assert_eq!(report.loopback_verified, Some(true));
        assert!(matches!(report.publish, PublishOutcome::Failed(_)));
    }
}
