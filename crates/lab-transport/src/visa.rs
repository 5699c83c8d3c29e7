//! Hardware transport for VISA-style resource addresses.
//!
//! Supported resource strings:
//!
//! - `TCPIP0::<host>::<port>::SOCKET` - raw SCPI-over-TCP socket
//! - `ASRL<path>::INSTR` / `ASRL<path>::<baud>::INSTR` - serial port
//!
//! The session opens once, serializes calls (one outstanding per session),
//! frames commands with `\n`, and applies the per-call timeout to every read.
//! Binary responses use the IEEE-488.2 definite-length block convention
//! `#<d><len><bytes>`.

use crate::{Transport, TransportResult};
use async_trait::async_trait;
use lab_core::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Trait alias for the byte streams a VISA session can sit on. Both
/// `tokio::net::TcpStream` and `tokio_serial::SerialStream` qualify, as do
/// in-memory duplex streams in tests.
pub trait TransportIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportIO for T {}

/// Type-erased boxed byte stream.
pub type DynIo = Box<dyn TransportIO>;

/// Parsed VISA-style resource address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud: u32 },
}

impl ResourceAddress {
    /// Parse a VISA resource string.
    pub fn parse(resource: &str) -> Result<Self, TransportError> {
        let parts: Vec<&str> = resource.split("::").collect();
        let head = parts
            .first()
            .copied()
            .unwrap_or_default()
            .to_ascii_uppercase();

        if head.starts_with("TCPIP") {
            // TCPIP0::host::port::SOCKET
            if parts.len() < 3 {
                return Err(TransportError::protocol(format!(
                    "malformed TCPIP resource '{}'",
                    resource
                )));
            }
            let host = parts[1].to_string();
            let port: u16 = parts[2].parse().map_err(|_| {
                TransportError::protocol(format!(
                    "invalid port in resource '{}'",
                    resource
                ))
            })?;
            return Ok(ResourceAddress::Tcp { host, port });
        }

        if let Some(rest) = parts[0].strip_prefix("ASRL") {
            // ASRL/dev/ttyUSB0::INSTR or ASRL/dev/ttyUSB0::115200::INSTR
            let path = rest.to_string();
            if path.is_empty() {
                return Err(TransportError::protocol(format!(
                    "missing serial path in resource '{}'",
                    resource
                )));
            }
            let baud = if parts.len() >= 3 {
                parts[1].parse().map_err(|_| {
                    TransportError::protocol(format!(
                        "invalid baud rate in resource '{}'",
                        resource
                    ))
                })?
            } else {
                9600
            };
            return Ok(ResourceAddress::Serial { path, baud });
        }

        Err(TransportError::protocol(format!(
            "unsupported resource address '{}'",
            resource
        )))
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceAddress::Tcp { host, port } => {
                write!(f, "TCPIP0::{}::{}::SOCKET", host, port)
            }
            ResourceAddress::Serial { path, baud } => {
                write!(f, "ASRL{}::{}::INSTR", path, baud)
            }
        }
    }
}

/// VISA-style hardware transport.
pub struct VisaTransport {
    address: Option<ResourceAddress>,
    link: Mutex<Option<BufReader<DynIo>>>,
    timeout: parking_lot::Mutex<Duration>,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl VisaTransport {
    pub fn new(resource: &str) -> Result<Self, TransportError> {
        Ok(Self {
            address: Some(ResourceAddress::parse(resource)?),
            link: Mutex::new(None),
            timeout: parking_lot::Mutex::new(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(10),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_timeouts(mut self, timeout: Duration, connect_timeout: Duration) -> Self {
        *self.timeout.lock() = timeout;
        self.connect_timeout = connect_timeout;
        self
    }

    /// Build a session on an already-open byte stream. Used by tests (duplex
    /// pipes) and by callers that manage their own connections.
    pub fn from_io(io: DynIo) -> Self {
        Self {
            address: None,
            link: Mutex::new(Some(BufReader::new(io))),
            timeout: parking_lot::Mutex::new(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(10),
            closed: AtomicBool::new(false),
        }
    }

    fn io_timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    async fn send(
        link: &mut BufReader<DynIo>,
        command: &str,
    ) -> Result<(), TransportError> {
        link.get_mut().write_all(command.as_bytes()).await?;
        if !command.ends_with('\n') {
            link.get_mut().write_all(b"\n").await?;
        }
        link.get_mut().flush().await?;
        Ok(())
    }

    async fn read_line(
        link: &mut BufReader<DynIo>,
        timeout: Duration,
        command: &str,
    ) -> Result<String, TransportError> {
        let mut line = String::new();
        let read = tokio::time::timeout(timeout, link.read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) => Err(TransportError::io(format!(
                "connection closed while waiting for reply to '{}'",
                command
            ))),
            Ok(Ok(_)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::timeout(format!(
                "no reply to '{}' within {:?}",
                command, timeout
            ))),
        }
    }

    /// Read an IEEE-488.2 definite-length block (after the `#` marker has
    /// been consumed).
    async fn read_block_body(
        link: &mut BufReader<DynIo>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let digit = Self::read_byte(link, timeout).await?;
        if !digit.is_ascii_digit() {
            return Err(TransportError::protocol(format!(
                "bad block header digit {:#04x}",
                digit
            )));
        }
        let digits = (digit - b'0') as usize;
        if digits == 0 {
            return Err(TransportError::protocol(
                "indefinite-length blocks (#0) are not supported",
            ));
        }
        let mut len_buf = vec![0u8; digits];
        tokio::time::timeout(timeout, link.read_exact(&mut len_buf))
            .await
            .map_err(|_| TransportError::timeout("block length read timed out"))?
            .map_err(TransportError::from)?;
        let len: usize = std::str::from_utf8(&len_buf)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::protocol("unparseable block length"))?;

        let mut data = vec![0u8; len];
        tokio::time::timeout(timeout, link.read_exact(&mut data))
            .await
            .map_err(|_| TransportError::timeout("block payload read timed out"))?
            .map_err(TransportError::from)?;

        // consume the trailing terminator if the instrument sends one
        let _ = tokio::time::timeout(Duration::from_millis(50), async {
            let mut nl = [0u8; 1];
            let _ = link.read_exact(&mut nl).await;
        })
        .await;

        Ok(data)
    }

    async fn read_byte(
        link: &mut BufReader<DynIo>,
        timeout: Duration,
    ) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        tokio::time::timeout(timeout, link.read_exact(&mut byte))
            .await
            .map_err(|_| TransportError::timeout("read timed out"))?
            .map_err(TransportError::from)?;
        Ok(byte[0])
    }

    fn check_not_closed(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed("session is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.check_not_closed()?;
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }
        let Some(address) = &self.address else {
            return Err(TransportError::closed("no resource address to connect").into());
        };
        let io: DynIo = match address {
            ResourceAddress::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| {
                    TransportError::timeout(format!(
                        "connect to {}:{} timed out after {:?}",
                        host, port, self.connect_timeout
                    ))
                })?
                .map_err(TransportError::from)?;
                stream.set_nodelay(true).map_err(TransportError::from)?;
                Box::new(stream)
            }
            ResourceAddress::Serial { path, baud } => {
                use tokio_serial::SerialPortBuilderExt;
                let stream = tokio_serial::new(path, *baud)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .flow_control(tokio_serial::FlowControl::None)
                    .open_native_async()
                    .map_err(|e| {
                        TransportError::io(format!(
                            "failed to open serial port {}: {}",
                            path, e
                        ))
                    })?;
                Box::new(stream)
            }
        };
        tracing::info!(address = %address, "transport connected");
        *link = Some(BufReader::new(io));
        Ok(())
    }

    async fn write(&self, command: &str) -> TransportResult<()> {
        self.check_not_closed()?;
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| TransportError::closed("session is not connected"))?;
        tracing::debug!(command, "write");
        Self::send(link, command).await?;
        Ok(())
    }

    async fn query(&self, command: &str) -> TransportResult<String> {
        self.check_not_closed()?;
        let timeout = self.io_timeout();
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| TransportError::closed("session is not connected"))?;
        Self::send(link, command).await?;
        let response = Self::read_line(link, timeout, command).await?;
        tracing::debug!(command, response, "query");
        Ok(response)
    }

    async fn query_raw(&self, command: &str) -> TransportResult<Vec<u8>> {
        self.check_not_closed()?;
        let timeout = self.io_timeout();
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| TransportError::closed("session is not connected"))?;
        Self::send(link, command).await?;

        let first = Self::read_byte(link, timeout).await?;
        if first == b'#' {
            let data = Self::read_block_body(link, timeout).await?;
            tracing::debug!(command, bytes = data.len(), "query_raw block");
            Ok(data)
        } else {
            let rest = Self::read_line(link, timeout, command).await?;
            let mut data = vec![first];
            data.extend_from_slice(rest.as_bytes());
            Ok(data)
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            let _ = link.get_mut().shutdown().await;
        }
        Ok(())
    }

    async fn set_timeout(&self, timeout: Duration) -> TransportResult<()> {
        *self.timeout.lock() = timeout;
        Ok(())
    }

    async fn timeout(&self) -> Duration {
        self.io_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_resource_parses() {
        let addr = ResourceAddress::parse("TCPIP0::10.0.0.5::5025::SOCKET").unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Tcp {
                host: "10.0.0.5".into(),
                port: 5025
            }
        );
    }

    #[test]
    fn serial_resource_parses_with_and_without_baud() {
        let plain = ResourceAddress::parse("ASRL/dev/ttyUSB0::INSTR").unwrap();
        assert_eq!(
            plain,
            ResourceAddress::Serial {
                path: "/dev/ttyUSB0".into(),
                baud: 9600
            }
        );
        let fast = ResourceAddress::parse("ASRL/dev/ttyUSB0::115200::INSTR").unwrap();
        assert_eq!(
            fast,
            ResourceAddress::Serial {
                path: "/dev/ttyUSB0".into(),
                baud: 115_200
            }
        );
    }

    #[test]
    fn garbage_resources_are_rejected() {
        assert!(ResourceAddress::parse("GPIB0::7::INSTR").is_err());
        assert!(ResourceAddress::parse("TCPIP0::host").is_err());
        assert!(ResourceAddress::parse("ASRL::INSTR").is_err());
    }

    #[tokio::test]
    async fn query_frames_command_and_strips_terminators() {
        let (host, device) = tokio::io::duplex(256);
        let transport = VisaTransport::from_io(Box::new(device));

        let harness = tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut line = String::new();
            host.read_line(&mut line).await.unwrap();
            assert_eq!(line, "*IDN?\n");
            host.get_mut()
                .write_all(b"Keysight,DSOX1204G,X,1.0\r\n")
                .await
                .unwrap();
        });

        let idn = transport.query("*IDN?").await.unwrap();
        assert_eq!(idn, "Keysight,DSOX1204G,X,1.0");
        harness.await.unwrap();
    }

    #[tokio::test]
    async fn query_raw_parses_definite_length_blocks() {
        let (host, device) = tokio::io::duplex(256);
        let transport = VisaTransport::from_io(Box::new(device));

        let harness = tokio::spawn(async move {
            let mut host = BufReader::new(host);
            let mut line = String::new();
            host.read_line(&mut line).await.unwrap();
            assert_eq!(line, ":WAV:DATA?\n");
            host.get_mut().write_all(b"#3016").await.unwrap();
            host.get_mut()
                .write_all(&(0u8..16).collect::<Vec<u8>>())
                .await
                .unwrap();
            host.get_mut().write_all(b"\n").await.unwrap();
        });

        let data = transport.query_raw(":WAV:DATA?").await.unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], 0);
        assert_eq!(data[15], 15);
        harness.await.unwrap();
    }

    #[tokio::test]
    async fn query_times_out_without_a_reply() {
        let (host, device) = tokio::io::duplex(256);
        let transport = VisaTransport::from_io(Box::new(device));
        transport
            .set_timeout(Duration::from_millis(50))
            .await
            .unwrap();

        // keep the host alive but silent
        let _host = host;
        let err = transport.query("*IDN?").await.unwrap_err();
        match err {
            lab_core::LabError::Transport(e) => {
                assert_eq!(e.kind, lab_core::TransportErrorKind::Timeout)
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_io() {
        let (_host, device) = tokio::io::duplex(64);
        let transport = VisaTransport::from_io(Box::new(device));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.write("*RST").await.is_err());
    }
}
