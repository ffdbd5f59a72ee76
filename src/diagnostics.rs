//! Operator-triggered stack dumps
//!
//! A dedicated listener thread waits for `SIGUSR2`. Each delivery captures a
//! snapshot of every thread in the process into a page-sized buffer and
//! forwards it to the host logger on the verbose channel. The listener lives
//! until the process exits.
//!
//! Rust cannot unwind another thread's user stack, so the snapshot is what
//! the OS exposes per thread (name, scheduler state, wait channel and, when
//! readable, the kernel stack) followed by the listener's own backtrace.

use crate::logger::{host_logger, LogBridge, LogLevel};
use std::backtrace::Backtrace;
use std::ffi::CStr;
use std::fmt::{self, Write};
use std::io;
use std::sync::{mpsc, Once};
use std::thread;
use tokio::signal::unix::{signal, SignalKind};

const FALLBACK_PAGE_SIZE: usize = 4096;

static INSTALL: Once = Once::new();

/// Start the process-wide listener if it is not running yet
pub fn install() {
    INSTALL.call_once(|| {
        if let Err(e) = Reporter::spawn(host_logger()) {
            log::error!("Unable to start stack dump listener: {e}");
        }
    });
}

/// The `SIGUSR2` listener
pub struct Reporter;

impl Reporter {
    /// Spawn a listener forwarding dumps to `logger`
    ///
    /// Returns once the signal handler is registered, so a `SIGUSR2`
    /// delivered afterwards never takes the default (terminating) action.
    pub fn spawn(logger: &'static LogBridge) -> io::Result<()> {
        let (ready_tx, ready_rx) = mpsc::channel();

        thread::Builder::new()
            .name("stack-dump".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let mut signals = match signal(SignalKind::user_defined2()) {
                        Ok(signals) => signals,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    let mut buffer = SnapshotBuffer::new();
                    while signals.recv().await.is_some() {
                        logger.forward_cstr(LogLevel::Verbose, buffer.capture());
                    }
                });
            })?;

        ready_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stack dump listener exited"))?
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// One page of scratch space, reused for every dump
struct SnapshotBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl SnapshotBuffer {
    fn new() -> Self {
        Self::with_size(page_size())
    }

    fn with_size(size: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(size),
            limit: size.saturating_sub(1),
        }
    }

    /// Capture a fresh snapshot; oversized dumps are cut short
    fn capture(&mut self) -> &CStr {
        self.fill(|out| write_snapshot(out))
    }

    fn fill(&mut self, write: impl FnOnce(&mut PageWriter<'_>) -> fmt::Result) -> &CStr {
        self.bytes.clear();
        let mut writer = PageWriter {
            bytes: &mut self.bytes,
            limit: self.limit,
        };
        // A full page ends the write early; what fit is kept.
        let _ = write(&mut writer);
        self.bytes.push(0);
        CStr::from_bytes_with_nul(&self.bytes).unwrap_or_default()
    }
}

/// `fmt::Write` into a bounded buffer, never splitting a character
struct PageWriter<'a> {
    bytes: &'a mut Vec<u8>,
    limit: usize,
}

impl Write for PageWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.limit - self.bytes.len();
        let mut end = s.len().min(room);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.bytes
            .extend(s.as_bytes()[..end].iter().map(|&b| if b == 0 { b'?' } else { b }));
        if end < s.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}

fn write_snapshot(out: &mut impl Write) -> fmt::Result {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    write_tasks(out)?;

    let current = thread::current();
    writeln!(
        out,
        "listener {}:\n{}",
        current.name().unwrap_or("unnamed"),
        Backtrace::force_capture()
    )
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn write_tasks(out: &mut impl Write) -> fmt::Result {
    use std::fs;

    let tasks = match fs::read_dir("/proc/self/task") {
        Ok(tasks) => tasks,
        Err(e) => return writeln!(out, "threads unavailable: {e}"),
    };

    let mut tids: Vec<u32> = tasks
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();
    writeln!(out, "{} threads", tids.len())?;

    for tid in tids {
        let dir = format!("/proc/self/task/{tid}");
        let read = |file: &str| fs::read_to_string(format!("{dir}/{file}")).unwrap_or_default();

        let comm = read("comm");
        let state = parse_state(&read("stat")).unwrap_or('?');
        write!(out, "thread {tid} [{state}] {}", comm.trim())?;
        let wchan = read("wchan");
        if !wchan.is_empty() && wchan != "0" {
            write!(out, " in {wchan}")?;
        }
        writeln!(out)?;

        for frame in read("stack").lines() {
            writeln!(out, "    {frame}")?;
        }
    }
    Ok(())
}

/// Scheduler state from a `/proc/<pid>/task/<tid>/stat` line
///
/// The command name may itself contain parentheses, so the state is the
/// first field after the last `)`.
fn parse_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}
