//! Databroker 發佈端
//!
//! 只實作測試流程需要的單一操作：將一個 VSS 訊號的目前值送出。
//! [`TcpSignalBroker`] 以一行 JSON `{"path": ..., "value": ...}` 寫到 host:port，
//! 供 databroker 前端的橋接服務轉送；橋接端回覆一行 `{"status": "ok"}`
//! 才算發佈成功，連線關閉或逾時未回覆皆視為失敗。

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:55555";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid databroker format '{0}'. Use IP:PORT (e.g., 127.0.0.1:55555)")]
    MalformedAddress(String),
    #[error("Databroker I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot encode datapoint: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Databroker closed or timed out before acknowledging")]
    NoAcknowledgement,
    #[error("Databroker rejected datapoint: {0}")]
    Rejected(String),
}

/// databroker 位址 `IP:PORT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || BrokerError::MalformedAddress(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(malformed)?;
        if host.is_empty() {
            return Err(malformed());
        }
        let port = port.parse::<u16>().map_err(|_| malformed())?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
}

pub trait SignalBroker {
    fn publish(&mut self, signal: &str, value: SignalValue) -> Result<(), BrokerError>;
}

/// 發佈結果；失敗只記錄，不影響已完成的 CAN 操作
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published,
    Failed(String),
}

impl PublishOutcome {
    pub fn from_result(signal: &str, result: Result<(), BrokerError>) -> Self {
        match result {
            Ok(()) => {
                info!("Published {}", signal);
                PublishOutcome::Published
            }
            Err(e) => {
                warn!("Publish {} failed: {}", signal, e);
                PublishOutcome::Failed(e.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct Datapoint<'a> {
    path: &'a str,
    value: SignalValue,
}

#[derive(Deserialize)]
struct Ack {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct TcpSignalBroker {
    address: BrokerAddress,
    timeout: Duration,
}

impl TcpSignalBroker {
    pub fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    fn connect(&self) -> Result<TcpStream, BrokerError> {
        let mut last_err = None;
        for addr in (self.address.host.as_str(), self.address.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")
            })
            .into())
    }
}

impl SignalBroker for TcpSignalBroker {
    fn publish(&mut self, signal: &str, value: SignalValue) -> Result<(), BrokerError> {
        info!("Connecting to databroker at {}...", self.address);
        let mut stream = self.connect()?;
        stream.set_write_timeout(Some(self.timeout))?;
        let mut line = serde_json::to_vec(&Datapoint {
            path: signal,
            value,
        })?;
        line.push(b'\n');
        stream.write_all(&line)?;
        stream.flush()?;

        stream.set_read_timeout(Some(self.timeout))?;
        let mut reply = String::new();
        match BufReader::new(&stream).read_line(&mut reply) {
            Ok(0) => return Err(BrokerError::NoAcknowledgement),
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(BrokerError::NoAcknowledgement)
            }
            Err(e) => return Err(e.into()),
        }
        let ack: Ack = serde_json::from_str(reply.trim_end())
            .map_err(|_| BrokerError::Rejected(reply.trim_end().to_string()))?;
        if ack.status == "ok" {
            Ok(())
        } else {
            Err(BrokerError::Rejected(ack.error.unwrap_or(ack.status)))
        }
    }
}
