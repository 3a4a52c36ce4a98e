//! Native crash dump parsing
//!
//! The crash log buffer carries the same text debuggerd writes to tombstones,
//! one logcat line per dump line. Parsing is line oriented: a row of
//! `*** *** ***` starts a new crash and the header fields fill it in.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Faults below this address are treated as plain null dereferences.
pub const MIN_SECURITY_FAULT_ADDRESS: u64 = 0x8000;

const CRASH_MARKER: &str = "*** *** *** *** *** *** *** *** *** *** *** *** *** *** *** ***";

/// Abort messages that indicate the allocator or a hardening check caught
/// memory corruption.
const HEAP_CORRUPTION_ABORTS: &str = r"(?i)(heap corruption|double free|invalid (address|pointer) passed to free|pointer being freed was not allocated|scudo error|use.after.free|corrupted (size|double-linked list)|stack corruption detected|buffer overflow detected|fortify)";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NativeCrash {
    pub pid: i32,
    pub tid: i32,
    pub thread_name: String,
    pub process_name: String,
    pub signal_number: Option<i32>,
    pub signal: String,
    pub code: String,
    /// Raw fault address text; `--------` when the kernel did not supply one.
    pub fault_addr: String,
    pub abort_message: String,
    pub backtrace: Vec<String>,
}

struct Patterns {
    logcat_prefix: Regex,
    pid_line: Regex,
    signal_line: Regex,
    frame: Regex,
    heap_abort: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        logcat_prefix: Regex::new(
            r"^\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d+\s+(?:\d+\s+)+[VDIWEFA]\s+[^:]*?:\s?",
        )
        .expect("crash pattern must compile"),
        pid_line: Regex::new(r"pid:\s*(\d+),\s*tid:\s*(\d+),\s*name:\s*(.*?)\s*>>>\s*(.*?)\s*<<<")
            .expect("crash pattern must compile"),
        signal_line: Regex::new(
            r"signal\s+(\d+)\s+\((\w+)\),\s*code\s+(-?\d+)\s+\(([^)]*)\),\s*fault addr\s+(\S+)",
        )
        .expect("crash pattern must compile"),
        frame: Regex::new(r"^#\d+\s+pc\s+[0-9a-fA-F]+\s+").expect("crash pattern must compile"),
        heap_abort: Regex::new(HEAP_CORRUPTION_ABORTS).expect("crash pattern must compile"),
    })
}

fn strip_logcat_prefix<'a>(p: &Patterns, line: &'a str) -> &'a str {
    let content = match p.logcat_prefix.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    };
    content.trim()
}

/// Parse every crash dump in `text`. Unrecognised lines are ignored.
pub fn parse_crash_log(text: &str) -> Vec<NativeCrash> {
    let p = patterns();
    let mut crashes = Vec::new();
    let mut current: Option<NativeCrash> = None;
    let mut in_backtrace = false;

    for raw in text.lines() {
        let line = strip_logcat_prefix(p, raw);
        if line.contains(CRASH_MARKER) {
            crashes.extend(current.take());
            current = Some(NativeCrash::default());
            in_backtrace = false;
            continue;
        }
        let Some(crash) = current.as_mut() else {
            continue;
        };

        if line.starts_with("backtrace:") {
            in_backtrace = true;
            continue;
        }
        if in_backtrace {
            if p.frame.is_match(line) {
                crash.backtrace.push(line.to_string());
                continue;
            }
            if line.is_empty() || line.contains("total frames") {
                continue;
            }
            in_backtrace = false;
        }

        if let Some(caps) = p.pid_line.captures(line) {
            crash.pid = caps[1].parse().unwrap_or_default();
            crash.tid = caps[2].parse().unwrap_or_default();
            crash.thread_name = caps[3].to_string();
            crash.process_name = caps[4].to_string();
        } else if let Some(caps) = p.signal_line.captures(line) {
            crash.signal_number = caps[1].parse().ok();
            crash.signal = caps[2].to_string();
            crash.code = caps[4].to_string();
            crash.fault_addr = caps[5].to_string();
        } else if let Some(message) = line.strip_prefix("Abort message:") {
            crash.abort_message = message.trim().trim_matches('\'').to_string();
        }
    }
    crashes.extend(current);
    crashes
}

impl NativeCrash {
    /// Parsed fault address, `None` when absent or not hexadecimal.
    pub fn fault_address(&self) -> Option<u64> {
        let addr = self.fault_addr.trim();
        let digits = addr.strip_prefix("0x").unwrap_or(addr);
        u64::from_str_radix(digits, 16).ok()
    }

    /// Signals raised from userspace (`kill`, `tgkill`) carry no fault.
    fn is_user_sent(&self) -> bool {
        matches!(self.code.as_str(), "SI_USER" | "SI_TKILL" | "SI_QUEUE")
    }

    /// Whether the crash looks like memory corruption rather than a benign
    /// null dereference or a deliberate exit.
    pub fn is_security_relevant(&self) -> bool {
        match self.signal.as_str() {
            "SIGSEGV" | "SIGBUS" => {
                !self.is_user_sent()
                    && self
                        .fault_address()
                        .map_or(true, |addr| addr >= MIN_SECURITY_FAULT_ADDRESS)
            }
            "SIGABRT" => patterns().heap_abort.is_match(&self.abort_message),
            _ => false,
        }
    }

    /// Match `pattern` against the process name.
    pub fn matches_process(&self, pattern: &str) -> bool {
        !pattern.is_empty() && self.process_name.contains(pattern)
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "pid {} ({}) {} code {} fault addr {}",
            self.pid, self.process_name, self.signal, self.code, self.fault_addr
        );
        if !self.abort_message.is_empty() {
            text.push_str(&format!(", abort: '{}'", self.abort_message));
        }
        if let Some(top) = self.backtrace.first() {
            text.push_str(&format!("\n    {top}"));
        }
        text
    }
}

/// Security-relevant crashes belonging to any of `process_patterns`.
pub fn security_crashes<'a>(crashes: &'a [NativeCrash], process_patterns: &[String]) -> Vec<&'a NativeCrash> {
    crashes
        .iter()
        .filter(|crash| crash.is_security_relevant())
        .filter(|crash| process_patterns.iter().any(|p| crash.matches_process(p)))
        .collect()
}
