//! Byte-stream links.
//!
//! Rank processes talk to the coordinator over a pair of inherited pipes. The
//! launcher passes them as fd 3 (coordinator → rank) and fd 4 (rank →
//! coordinator) and announces them via [`IPC_FD_ENV`]. Without that variable a
//! rank falls back to stdin/stdout.

use super::Link;
use rankmap_ipc::{FrameError, FrameReader, FrameWriter, HubMessage, RankMessage};
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{Read, Write};
use std::marker::PhantomData;

#[cfg(unix)]
use std::os::unix::io::FromRawFd;

/// Environment variable carrying `<read_fd>,<write_fd>` for a rank process.
pub const IPC_FD_ENV: &str = "RANKMAP_IPC_FD";

/// Framed messages over a reader/writer pair.
pub struct StreamLink<R: Read, W: Write, Out, In> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<R: Read, W: Write, Out, In> StreamLink<R, W, Out, In> {
    /// Wrap a reader and a writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            _marker: PhantomData,
        }
    }
}

impl<R, W, Out, In> Link for StreamLink<R, W, Out, In>
where
    R: Read + Send,
    W: Write + Send,
    Out: Serialize<AllocSerializer<256>>,
    In: Archive,
    In::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<In, Infallible>,
{
    type Out = Out;
    type In = In;

    fn send(&mut self, message: &Out) -> Result<(), FrameError> {
        self.writer.write(message)
    }

    fn recv(&mut self) -> Result<In, FrameError> {
        self.reader.read()
    }
}

/// Rank end of a pipe connection.
pub type SpokeStream =
    StreamLink<Box<dyn Read + Send>, Box<dyn Write + Send>, RankMessage, HubMessage>;

/// IPC endpoint: either inherited fd pair or stdin/stdout fallback.
#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    #[cfg(unix)]
    Fds { read_fd: i32, write_fd: i32 },
    Stdio,
}

fn parse_endpoint(value: Option<&str>) -> Endpoint {
    #[cfg(unix)]
    if let Some(val) = value {
        let parts: Vec<&str> = val.split(',').collect();
        if parts.len() == 2 {
            if let (Ok(r), Ok(w)) = (parts[0].trim().parse::<i32>(), parts[1].trim().parse::<i32>())
            {
                if r >= 0 && w >= 0 {
                    return Endpoint::Fds {
                        read_fd: r,
                        write_fd: w,
                    };
                }
            }
        }
        tracing::warn!(
            value = val,
            "invalid {} (expected <read_fd>,<write_fd>), falling back to stdio",
            IPC_FD_ENV
        );
    }
    #[cfg(not(unix))]
    let _ = value;
    Endpoint::Stdio
}

/// Open this rank's link to the coordinator.
pub fn spoke_link_from_env() -> SpokeStream {
    let value = std::env::var(IPC_FD_ENV).ok();
    match parse_endpoint(value.as_deref()) {
        #[cfg(unix)]
        Endpoint::Fds { read_fd, write_fd } => {
            // Inherited from the launcher and owned by nobody else in this process
            let read_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
            let write_file = unsafe { std::fs::File::from_raw_fd(write_fd) };
            StreamLink::new(
                Box::new(read_file) as Box<dyn Read + Send>,
                Box::new(write_file) as Box<dyn Write + Send>,
            )
        }
        Endpoint::Stdio => StreamLink::new(
            Box::new(std::io::stdin()) as Box<dyn Read + Send>,
            Box::new(std::io::stdout()) as Box<dyn Write + Send>,
        ),
    }
}
