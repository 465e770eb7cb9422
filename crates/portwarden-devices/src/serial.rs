/*!
 * `serialport`-backed transport.
 *
 * The `serialport` crate is blocking, so every call runs on the blocking
 * pool. The reader gets its own cloned handle so a pending read never holds
 * up a write.
 */
use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use crate::error::TransportError;
use crate::options::{DataBits, FlowControl, Parity, PortOptions, StopBits};
use crate::transport::{SerialTransport, TransportResult};

type Handle = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Serial transport over the platform driver
pub struct SerialPortTransport {
    writer: Handle,
    reader: Handle,
    read_timeout: Duration,
}

impl SerialPortTransport {
    /// Create a closed transport whose reads give up after `read_timeout`
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
            reader: Arc::new(Mutex::new(None)),
            read_timeout,
        }
    }
}

impl fmt::Debug for SerialPortTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPortTransport")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for SerialPortTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => TransportError::NotFound(err.to_string()),
            serialport::ErrorKind::InvalidInput => TransportError::Unsupported(err.to_string()),
            serialport::ErrorKind::Io(kind) => std::io::Error::new(kind, err.description).into(),
            serialport::ErrorKind::Unknown => TransportError::Io(err.to_string()),
        }
    }
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

async fn blocking<T, F>(handle: &Handle, op: F) -> TransportResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn SerialPort>) -> TransportResult<T> + Send + 'static,
{
    let handle = handle.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = handle
            .lock()
            .map_err(|_| TransportError::Io("serial handle lock poisoned".to_string()))?;
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;
        op(port)
    })
    .await
    .map_err(|e| TransportError::Io(e.to_string()))?
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn open(&self, path: &str, options: &PortOptions) -> TransportResult<()> {
        let builder = serialport::new(path, options.baud_rate)
            .data_bits(data_bits(options.data_bits))
            .parity(parity(options.parity))
            .stop_bits(stop_bits(options.stop_bits))
            .flow_control(flow_control(options.flow_control))
            .timeout(self.read_timeout);

        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))??;
        let reader = port.try_clone()?;

        *self
            .writer
            .lock()
            .map_err(|_| TransportError::Io("serial handle lock poisoned".to_string()))? = Some(port);
        *self
            .reader
            .lock()
            .map_err(|_| TransportError::Io("serial handle lock poisoned".to_string()))? = Some(reader);
        debug!("Opened serial device {}", path);
        Ok(())
    }

    async fn read(&self, max_len: usize) -> TransportResult<Bytes> {
        blocking(&self.reader, move |port| {
            let mut buf = vec![0u8; max_len];
            match port.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Bytes::new()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn write(&self, data: &[u8]) -> TransportResult<()> {
        let data = data.to_vec();
        blocking(&self.writer, move |port| Ok(port.write_all(&data)?)).await
    }

    async fn drain(&self) -> TransportResult<()> {
        blocking(&self.writer, |port| {
            port.flush()?;
            while port.bytes_to_write()? > 0 {
                std::thread::sleep(Duration::from_micros(100));
            }
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> TransportResult<()> {
        blocking(&self.writer, |port| Ok(port.clear(ClearBuffer::All)?)).await
    }

    async fn reconfigure(&self, options: &PortOptions) -> TransportResult<()> {
        let options = options.clone();
        blocking(&self.writer, move |port| {
            port.set_baud_rate(options.baud_rate)?;
            port.set_data_bits(data_bits(options.data_bits))?;
            port.set_parity(parity(options.parity))?;
            port.set_stop_bits(stop_bits(options.stop_bits))?;
            port.set_flow_control(flow_control(options.flow_control))?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> TransportResult<()> {
        let poisoned = || TransportError::Io("serial handle lock poisoned".to_string());
        self.reader.lock().map_err(|_| poisoned())?.take();
        self.writer.lock().map_err(|_| poisoned())?.take();
        Ok(())
    }
}
