//! Output destinations for the recorded stream.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

#[cfg(test)]
pub(crate) mod memory;

/// Largest write handed to a stream sink in one call.
pub const WRITE_SIZE: usize = 1024 * 1024 * 2;
/// Seven TS packets; fits one Ethernet frame.
pub const UDP_CHUNK_SIZE: usize = 188 * 7;

pub const DEFAULT_UDP_HOST: &str = "localhost";
pub const DEFAULT_UDP_PORT: u16 = 1234;
pub const DEFAULT_HTTP_PORT: u16 = 12345;

const HTTP_HEADER: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: video/mpeg\r\nCache-Control: no-cache\r\n\r\n";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot duplicate stdout: {0}")]
    Stdout(#[source] io::Error),

    #[error("failed to resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("UDP socket error: {0}")]
    Udp(#[source] io::Error),

    #[error("HTTP listener error: {0}")]
    Http(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
    Udp { host: String, port: u16 },
    Http { port: u16 },
}

impl Destination {
    /// `-` is standard output, anything else a file path.
    pub fn from_output(output: &str) -> Self {
        if output == "-" {
            Destination::Stdout
        } else {
            Destination::File(PathBuf::from(output))
        }
    }

    pub fn open(&self) -> Result<Sink, SinkError> {
        match self {
            Destination::Stdout => open_stdout(),
            Destination::File(path) => open_file(path),
            Destination::Udp { host, port } => open_udp(host, *port),
            Destination::Http { port } => {
                let listener = TcpListener::bind(("0.0.0.0", *port)).map_err(SinkError::Http)?;
                info!("[Sink] Listening for HTTP at port {}", port);
                Sink::accept_http(&listener)
            }
        }
    }
}

/// Duplicate of fd 1, written without `io::Stdout`'s line buffering.
fn open_stdout() -> Result<Sink, SinkError> {
    let fd = io::stdout()
        .as_fd()
        .try_clone_to_owned()
        .map_err(SinkError::Stdout)?;
    Ok(Sink::Stdout(File::from(fd)))
}

fn open_file(path: &Path) -> Result<Sink, SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("[Sink] Cannot create {}: {}", parent.display(), e);
        }
    }
    File::create(path)
        .map(Sink::File)
        .map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn open_udp(host: &str, port: u16) -> Result<Sink, SinkError> {
    let addr = (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .ok_or_else(|| SinkError::Resolve {
            host: host.to_string(),
            port,
        })?;
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(SinkError::Udp)?;
    socket.connect(addr).map_err(SinkError::Udp)?;
    info!("[Sink] Sending UDP to {}", addr);
    Ok(Sink::Udp(socket))
}

/// An open writable byte stream.
#[derive(Debug)]
pub enum Sink {
    Stdout(File),
    File(File),
    Udp(UdpSocket),
    Http(TcpStream),
}

impl Sink {
    /// Wait for one client, consume its request line and answer with the
    /// stream header.
    pub fn accept_http(listener: &TcpListener) -> Result<Sink, SinkError> {
        let (mut stream, peer) = listener.accept().map_err(SinkError::Http)?;
        info!("[Sink] Connection from {}", peer);

        let mut request = String::new();
        BufReader::new(&stream)
            .read_line(&mut request)
            .map_err(SinkError::Http)?;
        info!("[Sink] Request: {}", request.trim_end());

        stream.write_all(HTTP_HEADER).map_err(SinkError::Http)?;
        Ok(Sink::Http(stream))
    }

    pub fn max_write_size(&self) -> usize {
        match self {
            Sink::Udp(_) => UDP_CHUNK_SIZE,
            _ => WRITE_SIZE,
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Stdout(out) => out.write(buf),
            Sink::File(file) => file.write(buf),
            Sink::Udp(socket) => socket.send(&buf[..buf.len().min(UDP_CHUNK_SIZE)]),
            Sink::Http(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Stdout(out) => out.flush(),
            Sink::File(file) => file.flush(),
            Sink::Udp(_) => Ok(()),
            Sink::Http(stream) => stream.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    #[test]
    fn test_from_output() {
        assert_eq!(Destination::from_output("-"), Destination::Stdout);
        assert_eq!(
            Destination::from_output("rec/out.ts"),
            Destination::File(PathBuf::from("rec/out.ts"))
        );
    }

    #[test]
    fn test_stdout_sink_is_unbuffered_file() {
        let sink = Destination::Stdout.open().unwrap();
        assert!(matches!(sink, Sink::Stdout(_)));
        assert_eq!(sink.max_write_size(), WRITE_SIZE);
    }

    #[test]
    fn test_file_sink_creates_parent_dirs() {
        let root = std::env::temp_dir().join(format!("recdvb-sink-{}", std::process::id()));
        let path = root.join("a/b/out.ts");

        let mut sink = Destination::File(path.clone()).open().unwrap();
        assert_eq!(sink.max_write_size(), WRITE_SIZE);
        sink.write_all(b"\x47data").unwrap();
        drop(sink);

        assert_eq!(fs::read(&path).unwrap(), b"\x47data");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn test_udp_sink_sends_bounded_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut sink = Destination::Udp {
            host: "127.0.0.1".to_string(),
            port,
        }
        .open()
        .unwrap();
        assert_eq!(sink.max_write_size(), UDP_CHUNK_SIZE);
        assert_eq!(sink.write(&[0x47; 3000]).unwrap(), UDP_CHUNK_SIZE);

        let mut buf = [0u8; 4096];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(n, UDP_CHUNK_SIZE);
    }

    #[test]
    fn test_http_sink_answers_with_header() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET /stream HTTP/1.1\r\n\r\n").unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let mut sink = Sink::accept_http(&listener).unwrap();
        sink.write_all(b"payload").unwrap();
        drop(sink);

        let received = client.join().unwrap();
        assert!(received.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(received.ends_with(b"\r\n\r\npayload"));
    }
}
