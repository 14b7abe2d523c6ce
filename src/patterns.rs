//! Fault and success pattern matching
//!
//! Fault detection uses regular expressions so that dumps with varying
//! addresses and register values still match. Success detection is a plain
//! substring test so that regex metacharacters in a boot banner never cause
//! a false positive.

use crate::error::CaptureError;
use regex::Regex;

/// Built-in fault patterns, checked in this order ahead of caller patterns
pub const BUILTIN_FAULT_PATTERNS: &[&str] = &[
    r"HardFault",
    r"BusFault",
    r"MemManage",
    r"UsageFault",
    r"STACK OVERFLOW",
    r"vApplicationStackOverflowHook", // FreeRTOS stack overflow hook
    r"Guru Meditation Error",         // ESP-IDF panic handler
    r"abort\(\) was called",
    r"assert failed",
    r"\*\*\* Error in",
    r"WDT reset",
    r"Backtrace:", // ESP-IDF panic backtrace
    r"panic_abort",
    r"rtos_int_lock", // FreeRTOS lock assertion
    r"configASSERT",
];

/// A compiled fault pattern that keeps its source text for reporting
#[derive(Debug, Clone)]
pub struct FaultPattern {
    source: String,
    regex: Regex,
    builtin: bool,
}

impl FaultPattern {
    fn compile(source: &str, builtin: bool) -> Result<Self, CaptureError> {
        let regex = Regex::new(source).map_err(|e| CaptureError::InvalidPattern {
            pattern: source.to_string(),
            source: e,
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
            builtin,
        })
    }

    /// The pattern as it was declared
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether this pattern is one of the built-ins
    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Compiled fault patterns plus the success token for one run
#[derive(Debug, Clone)]
pub struct PatternRegistry {
    faults: Vec<FaultPattern>,
    success_token: String,
}

impl PatternRegistry {
    /// Compile the built-in patterns followed by `extra`, in order.
    ///
    /// Any pattern that fails to compile aborts construction; nothing is
    /// silently dropped.
    pub fn new(success_token: &str, extra: &[String]) -> Result<Self, CaptureError> {
        let builtin = BUILTIN_FAULT_PATTERNS
            .iter()
            .map(|p| FaultPattern::compile(p, true));
        let custom = extra.iter().map(|p| FaultPattern::compile(p, false));
        let faults = builtin.chain(custom).collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "compiled {} fault patterns ({} custom)",
            faults.len(),
            extra.len()
        );

        Ok(Self {
            faults,
            success_token: success_token.to_string(),
        })
    }

    /// First pattern, in declaration order, that matches anywhere in `line`
    pub fn match_fault(&self, line: &str) -> Option<&FaultPattern> {
        self.faults.iter().find(|p| p.is_match(line))
    }

    /// Whether `line` contains the success token verbatim
    pub fn match_success(&self, line: &str) -> bool {
        line.contains(&self.success_token)
    }

    /// All patterns in evaluation order
    pub fn fault_patterns(&self) -> &[FaultPattern] {
        &self.faults
    }
}
