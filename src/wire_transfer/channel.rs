//! The byte transport underneath WireTransfer: either a raw, non-blocking
//! TTY, or a non-blocking TCP client. Both implement the same non-blocking
//! read/write contract so the framing layer above never sees the difference.

use crate::errors::{BridgeError, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{self, BaudRate, SetArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;

const SERIAL_DEVICE: &str = "/dev/ttyUSB0";

/// A non-blocking duplex byte channel. `read` returning `Ok(0)` means "no
/// bytes available right now", mirroring a `WouldBlock` read collapsed to
/// the empty-slice case so callers can loop without matching on `io::Error`.
pub trait ByteChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()>;
}

fn would_block_is_empty(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

pub struct TtyChannel {
    file: File,
}

impl TtyChannel {
    pub fn open() -> Result<TtyChannel> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(SERIAL_DEVICE)
            .map_err(BridgeError::ChannelOpen)?;

        let fd = file.as_raw_fd();
        let mut tio = termios::tcgetattr(fd).map_err(|e| BridgeError::ChannelOpen(io::Error::from(e)))?;
        termios::cfmakeraw(&mut tio);
        tio.control_flags.insert(termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD);
        termios::cfsetspeed(&mut tio, BaudRate::B115200).map_err(|e| BridgeError::ChannelOpen(io::Error::from(e)))?;
        termios::tcsetattr(fd, SetArg::TCSANOW, &tio).map_err(|e| BridgeError::ChannelOpen(io::Error::from(e)))?;

        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(|e| BridgeError::ChannelOpen(io::Error::from(e)))?);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(|e| BridgeError::ChannelOpen(io::Error::from(e)))?;

        Ok(TtyChannel { file })
    }
}

impl ByteChannel for TtyChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        would_block_is_empty(self.file.read(buf))
    }

    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }
}

pub struct SocketChannel {
    stream: TcpStream,
}

impl SocketChannel {
    pub fn connect(port: u16) -> Result<SocketChannel> {
        let stream = TcpStream::connect(("127.0.0.1", port)).map_err(BridgeError::ChannelOpen)?;
        stream.set_nonblocking(true).map_err(BridgeError::ChannelOpen)?;
        stream.set_nodelay(true).ok();
        Ok(SocketChannel { stream })
    }
}

impl ByteChannel for SocketChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        would_block_is_empty(self.stream.read(buf))
    }

    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }
}
