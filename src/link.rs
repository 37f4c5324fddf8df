//! Half-duplex RS-485 transport.
//!
//! [`Transport`] is the blocking request/response primitive the acquisition
//! service builds on. [`RtuLink`] implements it over any byte stream with its
//! own RTU framing and optional transceiver direction control through an
//! [`embedded_hal::digital::OutputPin`].
use crate::codec::{self, ReadRequest};
use crate::gpio::SysfsPin;
use crate::protocol::BaudRate;
use crate::{Error, Result};
use embedded_hal::digital::OutputPin;
use log::*;
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Default per-transaction timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Default delay between sending a frame and switching the transceiver to receive.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(10);
/// Read timeout of the underlying port; the transaction deadline is checked between reads.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Issues one request and waits for its response.
pub trait Transport {
    fn transact(&mut self, request: &ReadRequest) -> Result<Vec<u16>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transact(&mut self, request: &ReadRequest) -> Result<Vec<u16>> {
        (**self).transact(request)
    }
}

/// Byte stream of a serial line whose receive buffer can be flushed.
pub trait SerialLine: Read + Write {
    /// Drops every byte received so far and returns how many were dropped.
    fn discard_input(&mut self) -> io::Result<usize>;
}

#[cfg(feature = "rtu")]
impl SerialLine for Box<dyn tokio_serial::SerialPort> {
    fn discard_input(&mut self) -> io::Result<usize> {
        let pending = self.bytes_to_read()? as usize;
        if pending > 0 {
            self.clear(tokio_serial::ClearBuffer::Input)?;
        }
        Ok(pending)
    }
}

/// Holds the transceiver (DE/RE high) in transmit mode and returns it to
/// receive mode on drop.
struct TransmitGuard<'a, D: OutputPin> {
    pin: Option<&'a mut D>,
}

impl<'a, D: OutputPin> TransmitGuard<'a, D> {
    fn assert(pin: Option<&'a mut D>) -> Result<Self> {
        let mut guard = Self { pin };
        if let Some(pin) = guard.pin.as_mut() {
            pin.set_high().map_err(|err| {
                error!("Cannot switch transceiver to transmit: {err:?}");
                Error::NoResponse
            })?;
        }
        Ok(guard)
    }
}

impl<D: OutputPin> Drop for TransmitGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(pin) = self.pin.as_mut() {
            if let Err(err) = pin.set_low() {
                error!("Cannot switch transceiver to receive: {err:?}");
            }
        }
    }
}

/// Settings of a serial RS-485 link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub device: String,
    pub baud_rate: BaudRate,
    pub timeout: Duration,
    pub settle_delay: Duration,
    /// GPIO driving DE/RE; `None` if the adapter switches direction itself.
    pub direction_pin: Option<u32>,
}

impl LinkSettings {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: BaudRate::default(),
            timeout: DEFAULT_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            direction_pin: None,
        }
    }
}

/// Modbus RTU link over a serial line, with `D` driving the transceiver direction.
pub struct RtuLink<P, D = SysfsPin> {
    port: P,
    direction: Option<D>,
    settle_delay: Duration,
    timeout: Duration,
}

#[cfg(feature = "rtu")]
impl RtuLink<Box<dyn tokio_serial::SerialPort>> {
    /// Opens the serial port and the optional direction pin.
    pub fn open(settings: &LinkSettings) -> Result<Self> {
        let port = crate::tokio_common::serial_port_builder(&settings.device, &settings.baud_rate)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|err| Error::LinkUnavailable(format!("{}: {err}", settings.device)))?;
        info!(
            "Opened {} at {} baud (timeout {:?})",
            settings.device, settings.baud_rate, settings.timeout
        );
        let mut link = Self::new(port, settings.timeout);
        if let Some(number) = settings.direction_pin {
            let pin = SysfsPin::export(number).map_err(|err| {
                Error::LinkUnavailable(format!("direction GPIO {number}: {err}"))
            })?;
            info!("GPIO {number} configured for DE/RE control");
            link = link.with_direction(pin, settings.settle_delay);
        }
        Ok(link)
    }
}

impl<P: SerialLine> RtuLink<P> {
    /// Creates a link whose adapter handles the transceiver direction.
    pub fn new(port: P, timeout: Duration) -> Self {
        Self {
            port,
            direction: None,
            settle_delay: Duration::ZERO,
            timeout,
        }
    }
}

impl<P: SerialLine, D: OutputPin> RtuLink<P, D> {
    /// Drives the transceiver direction explicitly around every request.
    pub fn with_direction<E: OutputPin>(self, pin: E, settle_delay: Duration) -> RtuLink<P, E> {
        RtuLink {
            port: self.port,
            direction: Some(pin),
            settle_delay,
            timeout: self.timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Drops late replies of earlier transactions so they cannot be taken
    /// for the response to the next request.
    fn discard_stale_input(&mut self) -> Result<()> {
        match self.port.discard_input() {
            Ok(0) => Ok(()),
            Ok(n) => {
                debug!("Discarded {n} stale bytes");
                Ok(())
            }
            Err(err) => {
                debug!("Cannot flush receive buffer: {err}");
                Err(Error::from_io(&err))
            }
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let settle = self.direction.is_some();
        let _transmit = TransmitGuard::assert(self.direction.as_mut())?;
        self.port
            .write_all(frame)
            .and_then(|_| self.port.flush())
            .map_err(|err| {
                debug!("Write failed: {err}");
                Error::from_io(&err)
            })?;
        if settle {
            thread::sleep(self.settle_delay);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut frame = Vec::with_capacity(codec::RESPONSE_OVERHEAD);
        let mut buffer = [0u8; codec::RESPONSE_OVERHEAD + u8::MAX as usize];
        loop {
            let wanted = codec::expected_frame_len(&frame).unwrap_or(3);
            if frame.len() >= wanted {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(incomplete(&frame));
            }
            match self.port.read(&mut buffer[..wanted - frame.len()]) {
                Ok(0) => return Err(incomplete(&frame)),
                Ok(n) => frame.extend_from_slice(&buffer[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    debug!("Read failed: {err}");
                    return Err(Error::from_io(&err));
                }
            }
        }
    }
}

fn incomplete(frame: &[u8]) -> Error {
    if frame.is_empty() {
        Error::NoResponse
    } else {
        trace!("Incomplete frame {frame:02X?}");
        Error::Timeout
    }
}

impl<P: SerialLine, D: OutputPin> Transport for RtuLink<P, D> {
    fn transact(&mut self, request: &ReadRequest) -> Result<Vec<u16>> {
        let frame = request.encode();
        self.discard_stale_input()?;
        trace!("TX {frame:02X?}");
        self.send(&frame)?;
        let response = self.receive()?;
        trace!("RX {response:02X?}");
        codec::decode_response(request, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{exception_frame, response_frame};
    use crate::protocol::Address;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    type EventLog = Arc<Mutex<Vec<&'static str>>>;

    /// Serial line whose device answers each written request with the next
    /// queued reply.
    struct FakePort {
        written: Vec<u8>,
        input: VecDeque<u8>,
        replies: VecDeque<Vec<u8>>,
        fail_write: bool,
        log: EventLog,
    }

    impl FakePort {
        fn new(reply: Vec<u8>, log: &EventLog) -> Self {
            Self {
                written: Vec::new(),
                input: VecDeque::new(),
                replies: VecDeque::from([reply]),
                fail_write: false,
                log: log.clone(),
            }
        }

        /// Bytes already waiting in the receive buffer before the first request.
        fn with_pending(mut self, bytes: &[u8]) -> Self {
            self.input.extend(bytes);
            self
        }

        fn then_reply(mut self, reply: Vec<u8>) -> Self {
            self.replies.push_back(reply);
            self
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_write {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            self.log.lock().unwrap().push("write");
            self.written.extend_from_slice(buf);
            if let Some(reply) = self.replies.pop_front() {
                self.input.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLine for FakePort {
        fn discard_input(&mut self) -> io::Result<usize> {
            let pending = self.input.len();
            self.input.clear();
            Ok(pending)
        }
    }

    struct RecordingPin(EventLog);

    impl embedded_hal::digital::ErrorType for RecordingPin {
        type Error = Infallible;
    }

    impl OutputPin for RecordingPin {
        fn set_high(&mut self) -> std::result::Result<(), Infallible> {
            self.0.lock().unwrap().push("tx");
            Ok(())
        }

        fn set_low(&mut self) -> std::result::Result<(), Infallible> {
            self.0.lock().unwrap().push("rx");
            Ok(())
        }
    }

    fn request() -> ReadRequest {
        ReadRequest::holding_registers(Address::try_from(1).unwrap(), 4, 8)
    }

    fn link(port: FakePort, log: &EventLog) -> RtuLink<FakePort, RecordingPin> {
        RtuLink::new(port, Duration::from_millis(100))
            .with_direction(RecordingPin(log.clone()), Duration::ZERO)
    }

    #[test]
    fn transaction_switches_direction() {
        let log = EventLog::default();
        let words = [0, 0, 452, 123, 1876, 652, 135, 2150];
        let mut link = link(FakePort::new(response_frame(1, &words), &log), &log);

        assert_eq!(link.transact(&request()).unwrap(), words);
        assert_eq!(*log.lock().unwrap(), ["tx", "write", "rx"]);
        assert_eq!(link.port.written, request().encode());
    }

    #[test]
    fn failed_write_releases_bus() {
        let log = EventLog::default();
        let mut port = FakePort::new(Vec::new(), &log);
        port.fail_write = true;
        let mut link = link(port, &log);

        assert_matches!(link.transact(&request()), Err(Error::NoResponse));
        assert_eq!(*log.lock().unwrap(), ["tx", "rx"]);
    }

    #[test]
    fn silent_device() {
        let log = EventLog::default();
        let mut link = link(FakePort::new(Vec::new(), &log), &log);
        assert_matches!(link.transact(&request()), Err(Error::NoResponse));
        assert_eq!(*log.lock().unwrap(), ["tx", "write", "rx"]);
    }

    #[test]
    fn truncated_response() {
        let log = EventLog::default();
        let mut frame = response_frame(1, &[1, 2, 3, 4, 5, 6, 7, 8]);
        frame.truncate(10);
        let mut link = link(FakePort::new(frame, &log), &log);
        assert_matches!(link.transact(&request()), Err(Error::Timeout));
    }

    #[test]
    fn exception_response() {
        let log = EventLog::default();
        let mut link = link(FakePort::new(exception_frame(1, 0x04), &log), &log);
        assert_matches!(link.transact(&request()), Err(Error::DeviceFault(0x04)));
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_response() {
        let log = EventLog::default();
        // Reply to an earlier request that timed out, arriving before this one.
        let late = response_frame(1, &[1; 8]);
        let port = FakePort::new(response_frame(1, &[2; 8]), &log)
            .with_pending(&late)
            .then_reply(response_frame(2, &[3; 8]));
        let mut link = link(port, &log);

        assert_eq!(link.transact(&request()).unwrap(), [2; 8]);
        let second = ReadRequest::holding_registers(Address::try_from(2).unwrap(), 4, 8);
        assert_eq!(link.transact(&second).unwrap(), [3; 8]);
    }

    #[test]
    fn without_direction_pin() {
        let log = EventLog::default();
        let mut frame = response_frame(1, &[7; 8]);
        // Trailing bytes are left in the buffer and dropped before the next request.
        frame.extend_from_slice(&[0xAA, 0xBB]);
        let port = FakePort::new(frame, &log).then_reply(response_frame(1, &[8; 8]));
        let mut link = RtuLink::new(port, Duration::from_millis(100));

        assert_eq!(link.transact(&request()).unwrap(), [7; 8]);
        assert_eq!(*log.lock().unwrap(), ["write"]);
        assert_eq!(link.port.input, [0xAA, 0xBB]);

        assert_eq!(link.transact(&request()).unwrap(), [8; 8]);
        assert!(link.port.input.is_empty());
    }
}
