use alloc::{collections::VecDeque, string::String, vec::Vec};
use core::fmt::Write;
use spin::Mutex;

/// Kernel log ring. Populated by [`KernelLogger`] once [`init_logger`] has run.
pub static LOG: Mutex<Option<Log>> = Mutex::new(None);

pub fn init(size: usize) {
    *LOG.lock() = Some(Log::new(size));
}

pub struct Log {
    data: VecDeque<u8>,
    size: usize,
}

impl Log {
    pub fn new(size: usize) -> Log {
        Log {
            data: VecDeque::with_capacity(size),
            size,
        }
    }

    pub fn read(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }

    pub fn write(&mut self, buf: &[u8]) {
        for &b in buf {
            while self.data.len() + 1 >= self.size {
                self.data.pop_front();
            }
            self.data.push_back(b);
        }
    }

    /// Copies the ring into a contiguous string, lossily.
    pub fn contents(&self) -> String {
        let (a, b) = self.read();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

struct KernelLogger;

impl ::log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= ::log::max_level()
    }
    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::new();
        let _ = writeln!(line, "{} {}: {}", record.level(), record.target(), record.args());
        if let Some(ref mut log) = *LOG.lock() {
            log.write(line.as_bytes());
        }
    }
    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the kernel logger. A second call keeps the first logger and only adjusts the level.
pub fn init_logger(level: ::log::LevelFilter) {
    if LOG.lock().is_none() {
        init(64 * 1024);
    }
    ::log::set_max_level(level);
    match ::log::set_logger(&LOGGER) {
        Ok(_) => ::log::info!("Logger initialized."),
        Err(e) => ::log::debug!("Logger already installed: {}", e),
    }
}

pub use log::{debug, error, info, trace, warn};
