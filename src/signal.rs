//! Ctrl-C handling through a self-pipe watched by the event loop.

use anyhow::{Context, Result};
use std::cell::Cell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use x11os_core::{ConnectionManager, Interest};

pub struct Shutdown {
    reader: UnixStream,
    requested: Rc<Cell<bool>>,
}

impl Shutdown {
    /// A shutdown flag raised by anything written to the returned stream.
    pub fn pipe() -> Result<(Self, UnixStream)> {
        let (reader, writer) = UnixStream::pair().context("cannot create shutdown pipe")?;
        reader.set_nonblocking(true)?;
        let shutdown = Self {
            reader,
            requested: Rc::new(Cell::new(false)),
        };
        Ok((shutdown, writer))
    }

    /// Raise the flag on SIGINT and SIGTERM.
    pub fn install() -> Result<Self> {
        let (shutdown, mut writer) = Self::pipe()?;
        ctrlc::set_handler(move || {
            let _ = writer.write_all(&[1]);
        })
        .context("cannot install signal handler")?;
        Ok(shutdown)
    }

    /// Watch the pipe from the event loop so a signal wakes it up.
    pub fn register(&self, os: &mut ConnectionManager) -> Result<()> {
        let mut reader = self.reader.try_clone()?;
        let requested = Rc::clone(&self.requested);
        os.set_notify_fd(
            self.reader.as_raw_fd(),
            Interest::READABLE,
            Box::new(move |_, _| {
                let mut buf = [0u8; 16];
                while let Ok(n) = reader.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                }
                requested.set(true);
            }),
        );
        Ok(())
    }

    pub fn requested(&self) -> bool {
        self.requested.get()
    }
}
