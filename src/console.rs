use crate::logging::LogSurface;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct ConsoleHandle {
    tx: Sender<String>,
}

impl LogSurface for ConsoleHandle {
    fn post(&self, line: String) {
        // A closed channel means the console already shut down.
        let _ = self.tx.send(line);
    }
}

// The console is owned by the thread that calls `run`; every other thread
// reaches it through a `ConsoleHandle`.
pub struct Console {
    path: PathBuf,
    transcript: File,
    rx: Receiver<String>,
    written: usize,
}

impl Console {
    pub fn open(path: &Path) -> io::Result<(Self, ConsoleHandle)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut transcript = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(
            transcript,
            "--- session {} (pid {}) ---",
            Local::now().to_rfc3339(),
            std::process::id()
        )?;
        let (tx, rx) = mpsc::channel();
        let console = Self {
            path: path.to_path_buf(),
            transcript,
            rx,
            written: 0,
        };
        Ok((console, ConsoleHandle { tx }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_message(&mut self, line: &str) -> io::Result<()> {
        let stamp = Local::now().format("%H:%M:%S");
        writeln!(self.transcript, "[{stamp}] {line}")?;
        self.transcript.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn pump(&mut self) -> io::Result<usize> {
        let mut count = 0;
        loop {
            match self.rx.try_recv() {
                Ok(line) => {
                    self.add_message(&line)?;
                    count += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(count),
            }
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<usize> {
        while !shutdown.load(Ordering::SeqCst) {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => self.add_message(&line)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
            }
        }
        self.pump()?;
        Ok(self.written)
    }
}
