//! Status submission to the Xymon collector.
//!
//! Each report is sent over a freshly opened TCP connection:
//!
//! ```text
//! status<TAB><machine>.<column> <color> <RFC3339 timestamp>\n\n<body>
//! ```
//!
//! The write side is then shut down, since the collector only answers once it
//! sees end-of-input, and a single acknowledgement line is read back.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::status::Status;

/// Reporting error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("collector {addr} did not respond within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("failed to send status: {0}")]
    Send(std::io::Error),
    #[error("failed to read acknowledgement: {0}")]
    Ack(std::io::Error),
}

/// One status message for a machine/column pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub machine: String,
    pub column: String,
    pub status: Status,
    pub timestamp: DateTime<FixedOffset>,
    pub body: String,
}

impl StatusReport {
    /// Build a report stamped with the current local time.
    pub fn new(
        machine: impl Into<String>,
        column: impl Into<String>,
        status: Status,
        body: impl Into<String>,
    ) -> Self {
        Self {
            machine: machine.into(),
            column: column.into(),
            status,
            timestamp: Local::now().fixed_offset(),
            body: body.into(),
        }
    }

    /// Frame the report for the wire. The body is sent unescaped.
    pub fn to_wire(&self) -> String {
        format!(
            "status\t{}.{} {} {}\n\n{}",
            self.machine,
            self.column,
            self.status.as_str(),
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
            self.body
        )
    }
}

/// Destination for status reports.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Deliver one report. Failures are returned to the caller, never retried.
    async fn submit(&self, report: &StatusReport) -> Result<(), ReportError>;
}

/// TCP client for the collector's status port.
#[derive(Debug, Clone)]
pub struct XymonClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl XymonClient {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn exchange(stream: TcpStream, message: &[u8]) -> Result<String, ReportError> {
        let (read_half, mut write_half) = stream.into_split();

        write_half.write_all(message).await.map_err(ReportError::Send)?;
        write_half.shutdown().await.map_err(ReportError::Send)?;

        // A collector that closes without answering yields an empty ack.
        let mut ack = String::new();
        BufReader::new(read_half)
            .read_line(&mut ack)
            .await
            .map_err(ReportError::Ack)?;
        Ok(ack)
    }
}

#[async_trait]
impl StatusReporter for XymonClient {
    async fn submit(&self, report: &StatusReport) -> Result<(), ReportError> {
        let addr = self.addr();

        let stream = match tokio::time::timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ReportError::Connect { addr, source }),
            Err(_) => {
                return Err(ReportError::Timeout {
                    addr,
                    timeout: self.timeout,
                })
            }
        };

        tracing::debug!(
            machine = %report.machine,
            column = %report.column,
            color = %report.status,
            "Sending status to {}",
            addr
        );

        let message = report.to_wire();
        let ack = tokio::time::timeout(self.timeout, Self::exchange(stream, message.as_bytes()))
            .await
            .map_err(|_| ReportError::Timeout {
                addr: addr.clone(),
                timeout: self.timeout,
            })??;

        tracing::debug!("Collector {} acknowledged: {}", addr, ack.trim_end());
        Ok(())
    }
}
