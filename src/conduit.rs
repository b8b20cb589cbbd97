//! Conduits: the language's I/O endpoints.
//!
//! A [`Channel`] is a bounded queue of cells shared between tasks; a
//! [`Stream`] wraps one of the process's standard streams. Reading past the
//! end of either yields the empty list.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};

use crate::Error;
use crate::cell::Cell;

pub trait Conduit: Send + Sync {
    /// Next value, or the empty list once the conduit is exhausted.
    fn read(&self) -> Result<Cell, Error>;
    /// Next value as a line of text, or the empty list at the end.
    fn read_line(&self) -> Result<Cell, Error>;
    fn write(&self, value: Cell) -> Result<(), Error>;
    /// Ends the writing side.
    fn close(&self);
}

pub struct Channel {
    sender: Mutex<Option<SyncSender<Cell>>>,
    receiver: Mutex<Receiver<Cell>>,
}

impl Channel {
    pub fn new(capacity: usize) -> Arc<Channel> {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        Arc::new(Channel {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
        })
    }
}

impl Conduit for Channel {
    fn read(&self) -> Result<Cell, Error> {
        let receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(receiver.recv().unwrap_or_else(|_| Cell::null()))
    }

    fn read_line(&self) -> Result<Cell, Error> {
        let value = self.read()?;
        if value.is_null() {
            return Ok(value);
        }
        Ok(Cell::string(&value.raw()))
    }

    fn write(&self, value: Cell) -> Result<(), Error> {
        // Clone out of the lock so a blocked writer doesn't hold up `close`.
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::Io("write to closed channel".to_string()))?;
        sender
            .send(value)
            .map_err(|_| Error::Io("write to closed channel".to_string()))
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Conduit for Stream {
    fn read(&self) -> Result<Cell, Error> {
        self.read_line()
    }

    fn read_line(&self) -> Result<Cell, Error> {
        if *self != Stream::Stdin {
            return Err(Error::Io(format!("{self:?} is not readable")));
        }
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(Cell::null());
        }
        let trimmed = line.strip_suffix('\n').unwrap_or(&line);
        Ok(Cell::string(trimmed.strip_suffix('\r').unwrap_or(trimmed)))
    }

    fn write(&self, value: Cell) -> Result<(), Error> {
        match self {
            Stream::Stdin => Err(Error::Io("stdin is not writable".to_string())),
            Stream::Stdout => Ok(writeln!(io::stdout().lock(), "{}", value.raw())?),
            Stream::Stderr => Ok(writeln!(io::stderr().lock(), "{}", value.raw())?),
        }
    }

    fn close(&self) {
        if *self == Stream::Stdout {
            let _ = io::stdout().flush();
        }
    }
}
