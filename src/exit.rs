//! Exit-code sentinels and classification.
//!
//! Subprocess exits keep their native code. A process terminated by
//! signal `n` reports `-n`. Values above the subprocess range are
//! reserved for conditions the library itself produces.

/// Clean exit.
pub const SUCCESS: i32 = 0;

/// Terminated by the library delivering a signal to an in-process
/// script (transformer kill, capture interrupt). `128 + SIGTERM`.
pub const INTERRUPTED: i32 = 143;

/// The subprocess behind the script could not be started.
pub const SPAWN_FAILED: i32 = 256;

/// A non-process exception escaped user code inside the script.
pub const UNHANDLED_ERROR: i32 = 257;

pub fn success(code: i32) -> bool {
    code == SUCCESS
}

/// Human-readable rendering used in diagnostics and `ScriptFailed`
/// messages.
pub fn describe(code: i32) -> String {
    match code {
        SUCCESS => "exit 0".to_owned(),
        SPAWN_FAILED => "failed to start".to_owned(),
        UNHANDLED_ERROR => "unhandled error".to_owned(),
        INTERRUPTED => "interrupted (exit 143)".to_owned(),
        code if code < 0 => format!("signal {}", -code),
        code => format!("exit {}", code),
    }
}

/// Collapse a script exit code into something the OS can represent.
///
/// Signal deaths take the conventional `128 + n` form; the sentinels
/// above the `u8` range map onto sysexits codes.
pub fn to_os_code(code: i32) -> i32 {
    match code {
        code @ 0..=255 => code,
        SPAWN_FAILED => exitcode::OSERR,
        UNHANDLED_ERROR => exitcode::SOFTWARE,
        code if code < 0 => 128 + (-code),
        _ => exitcode::SOFTWARE,
    }
}
