//! SMTP relay probe.
//!
//! Delivers one test message through the monitored relay using a plain SMTP
//! dialogue and reports the round-trip time.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Local;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{format_micros, ProbeContext, ProbeError};
use crate::monitor::{MailConfig, MonitorDefinition};
use crate::report::StatusReport;
use crate::status::Status;

const DEFAULT_SMTP_PORT: u16 = 25;

/// Sends a probe message through a mail relay.
#[async_trait]
pub trait MailProber: Send + Sync {
    /// Deliver the configured message via `address` and return the elapsed time.
    async fn probe(&self, address: &str, config: &MailConfig) -> Result<Duration, ProbeError>;
}

/// Run the mail stage for a monitor and report it to the mail column.
pub async fn run_mail_check(
    monitor: &MonitorDefinition,
    ctx: &ProbeContext,
) -> Result<Duration, ProbeError> {
    tracing::debug!(port = monitor.smtp.port, "Start smtp monitor");

    let result = ctx.mailer.probe(&monitor.ip, &monitor.smtp).await;
    let (status, body) = match &result {
        Ok(latency) => {
            tracing::info!(latency = ?latency, "Smtp");
            (Status::Green, format!("Latency: {}\n", format_micros(*latency)))
        }
        Err(e) => {
            tracing::error!(context = "Send mail", "{}", e);
            (Status::Red, format!("Error: {}\n", e))
        }
    };

    ctx.publish(StatusReport::new(
        &monitor.machine,
        &monitor.smtp.column,
        status,
        body,
    ))
    .await;

    result
}

/// Plain-text SMTP client.
#[derive(Debug, Clone)]
pub struct SmtpProber {
    timeout: Duration,
}

impl SmtpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl MailProber for SmtpProber {
    async fn probe(&self, address: &str, config: &MailConfig) -> Result<Duration, ProbeError> {
        let port = if config.port == 0 {
            DEFAULT_SMTP_PORT
        } else {
            config.port
        };

        let start = Instant::now();
        let session = async {
            let stream = TcpStream::connect((address, port))
                .await
                .map_err(|e| ProbeError::Network(format!("failed to connect to {}:{}: {}", address, port, e)))?;
            deliver(stream, config).await
        };

        tokio::time::timeout(self.timeout, session)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;

        Ok(start.elapsed())
    }
}

async fn deliver<S>(stream: S, config: &MailConfig) -> Result<(), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    expect_reply(&mut reader, &[220]).await?;
    command(&mut writer, &mut reader, &format!("EHLO {}", helo_name(config)), &[250]).await?;
    command(
        &mut writer,
        &mut reader,
        &format!("MAIL FROM:<{}>", config.sender.address),
        &[250],
    )
    .await?;
    command(
        &mut writer,
        &mut reader,
        &format!("RCPT TO:<{}>", config.recipient.address),
        &[250, 251],
    )
    .await?;
    command(&mut writer, &mut reader, "DATA", &[354]).await?;

    writer
        .write_all(format_message(config).as_bytes())
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;
    expect_reply(&mut reader, &[250]).await?;

    command(&mut writer, &mut reader, "QUIT", &[221]).await?;
    Ok(())
}

fn helo_name(config: &MailConfig) -> &str {
    config
        .sender
        .address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost")
}

/// Headers, dot-stuffed body and the terminating `.` line.
fn format_message(config: &MailConfig) -> String {
    let mut out = format!(
        "From: <{}>\r\nTo: <{}>\r\nSubject: {}\r\nDate: {}\r\n\r\n",
        config.sender.address,
        config.recipient.address,
        config.subject,
        Local::now().to_rfc2822()
    );
    for line in config.message.lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

async fn command<W, R>(writer: &mut W, reader: &mut R, line: &str, accept: &[u16]) -> Result<(), ProbeError>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufReadExt + Unpin,
{
    writer
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;
    expect_reply(reader, accept).await.map_err(|e| match e {
        ProbeError::Protocol(reply) => ProbeError::Protocol(format!("{}: {}", verb(line), reply)),
        other => other,
    })?;
    Ok(())
}

fn verb(line: &str) -> &str {
    line.split([' ', ':']).next().unwrap_or(line)
}

/// Read a possibly multi-line reply and check its code.
async fn expect_reply<R>(reader: &mut R, accept: &[u16]) -> Result<u16, ProbeError>
where
    R: AsyncBufReadExt + Unpin,
{
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        if n == 0 {
            return Err(ProbeError::Protocol("connection closed by server".to_string()));
        }

        let line = line.trim_end();
        let code: u16 = line
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| ProbeError::Protocol(format!("malformed reply {:?}", line)))?;

        // "250-" continues, "250 " or a bare code ends the reply
        if line.as_bytes().get(3) == Some(&b'-') {
            continue;
        }

        if accept.contains(&code) {
            return Ok(code);
        }
        return Err(ProbeError::Protocol(line.to_string()));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MailUser;
    use tokio::net::TcpListener;

    fn config(port: u16) -> MailConfig {
        MailConfig {
            enabled: true,
            port,
            sender: MailUser {
                address: "probe@example.com".to_string(),
                ..Default::default()
            },
            recipient: MailUser {
                address: "sink@example.org".to_string(),
                ..Default::default()
            },
            subject: "probe".to_string(),
            message: "hello\n.hidden".to_string(),
            column: "smtp".to_string(),
        }
    }

    /// Scripted relay: answers each client line with the next reply.
    async fn spawn_relay(rcpt_reply: &'static str) -> (u16, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(socket);
            let mut reader = BufReader::new(reader);
            let mut seen = Vec::new();

            writer.write_all(b"220 relay ready\r\n").await.unwrap();
            let mut in_data = false;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                seen.push(line.clone());

                let reply: &[u8] = if in_data {
                    if line != "." {
                        continue;
                    }
                    in_data = false;
                    b"250 queued\r\n"
                } else if line.starts_with("EHLO") {
                    b"250-relay\r\n250 SIZE 1000\r\n"
                } else if line.starts_with("MAIL") {
                    b"250 ok\r\n"
                } else if line.starts_with("RCPT") {
                    rcpt_reply.as_bytes()
                } else if line == "DATA" {
                    in_data = true;
                    b"354 go ahead\r\n"
                } else if line == "QUIT" {
                    writer.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                } else {
                    b"500 what\r\n"
                };
                writer.write_all(reply).await.unwrap();
            }
            seen
        });

        (port, handle)
    }

    #[tokio::test]
    async fn test_smtp_round_trip() {
        let (port, relay) = spawn_relay("250 ok\r\n").await;
        let prober = SmtpProber::new(Duration::from_secs(2));

        let latency = prober.probe("127.0.0.1", &config(port)).await;
        assert!(latency.is_ok(), "{:?}", latency);

        let seen = relay.await.unwrap();
        assert_eq!(seen[0], "EHLO example.com");
        assert_eq!(seen[1], "MAIL FROM:<probe@example.com>");
        assert_eq!(seen[2], "RCPT TO:<sink@example.org>");
        assert!(seen.contains(&"Subject: probe".to_string()));
        assert!(seen.contains(&"..hidden".to_string()));
        assert_eq!(seen.last().unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_smtp_rejected_recipient() {
        let (port, _relay) = spawn_relay("550 no such user\r\n").await;
        let prober = SmtpProber::new(Duration::from_secs(2));

        let err = prober.probe("127.0.0.1", &config(port)).await.unwrap_err();
        match err {
            ProbeError::Protocol(msg) => assert_eq!(msg, "RCPT: 550 no such user"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_helo_name_falls_back() {
        let mut c = config(25);
        assert_eq!(helo_name(&c), "example.com");
        c.sender.address = "nobody".to_string();
        assert_eq!(helo_name(&c), "localhost");
    }
}
