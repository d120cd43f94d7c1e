#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cp_core::EnvironmentOverlay;
use serde::Serialize;

/// Serializes overlay lifetimes across the whole process.
static OVERLAY_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Gate,
    Overlay,
    Invocation,
    Comparison,
}

impl EvidenceKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Gate => "gate",
            Self::Overlay => "overlay",
            Self::Invocation => "invocation",
            Self::Comparison => "comparison",
        }
    }
}

/// One observation made while a scenario ran. `seq` keeps increasing across
/// drains, so entries from consecutive scenarios never share a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    pub seq: u64,
    pub ts_unix_ms: u64,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Evidence collected since the last [`EvidenceLedger::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    next_seq: u64,
    pending: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.pending.push(EvidenceEntry {
            seq: self.next_seq,
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
        self.next_seq += 1;
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.pending
    }

    /// Hands over everything recorded so far and starts a fresh window.
    pub fn drain(&mut self) -> Vec<EvidenceEntry> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn kind_counts(&self) -> BTreeMap<EvidenceKind, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.pending {
            *counts.entry(entry.kind).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidOverlay {
    #[error("overlay variable name is empty")]
    EmptyName,
    #[error("overlay variable {name:?} contains '=' or NUL")]
    ReservedCharacter { name: String },
    #[error("overlay value for {name} contains NUL")]
    NulInValue { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedVar {
    pub name: String,
    pub expected: Option<String>,
    pub observed: Option<String>,
}

impl fmt::Display for LeakedVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} expected {} observed {}",
            self.name,
            describe_value(self.expected.as_deref()),
            describe_value(self.observed.as_deref()),
        )
    }
}

/// A released overlay left the environment different from how it found it.
/// This is a harness defect, not an engine failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("environment not restored after overlay release: {}", join_leaks(.leaked))]
pub struct EnvironmentLeak {
    pub leaked: Vec<LeakedVar>,
}

/// Applies overlays for exactly one run at a time and restores the prior
/// environment afterwards.
#[derive(Debug, Default)]
pub struct EnvironmentComposer {
    ledger: EvidenceLedger,
}

impl EnvironmentComposer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other overlay is active, captures prior values of every
    /// variable `overlay` touches, then writes the overlay.
    pub fn apply(&mut self, overlay: &EnvironmentOverlay) -> Result<OverlayGuard, InvalidOverlay> {
        validate_overlay(overlay)?;
        let lock = OVERLAY_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let prior: Vec<(String, Option<OsString>)> = overlay
            .names()
            .map(|name| (name.to_string(), std::env::var_os(name)))
            .collect();
        for (name, value) in overlay.iter() {
            write_var(name, Some(OsStr::new(value)));
        }
        self.ledger.record(
            EvidenceKind::Overlay,
            format!("overlay_applied {}", overlay.describe()),
        );

        Ok(OverlayGuard {
            prior,
            restored: false,
            _lock: lock,
        })
    }

    /// Restores the captured values and checks that every touched variable
    /// reads back exactly as it did before `apply`.
    pub fn release(&mut self, mut guard: OverlayGuard) -> Result<(), EnvironmentLeak> {
        guard.restore();
        let verdict = verify_restored(&guard.prior, |name| std::env::var_os(name));
        let names = guard
            .prior
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        match &verdict {
            Ok(()) => self
                .ledger
                .record(EvidenceKind::Overlay, format!("overlay_released {names}")),
            Err(leak) => self
                .ledger
                .record(EvidenceKind::Overlay, format!("overlay_leaked {leak}")),
        }
        drop(guard);
        verdict
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

}

/// Holds the process overlay lock. Dropping it without
/// [`EnvironmentComposer::release`] still restores the prior values, so panics
/// and early returns cannot leave overlay residue behind.
#[derive(Debug)]
pub struct OverlayGuard {
    prior: Vec<(String, Option<OsString>)>,
    restored: bool,
    _lock: MutexGuard<'static, ()>,
}

impl OverlayGuard {
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.prior.iter().map(|(name, _)| name.as_str())
    }

    fn restore(&mut self) {
        if self.restored {
            return;
        }
        for (name, value) in self.prior.iter().rev() {
            write_var(name, value.as_deref());
        }
        self.restored = true;
    }
}

impl Drop for OverlayGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Full copy of the process environment, for before/after comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<OsString, OsString>,
}

impl EnvironmentSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(name)).map(OsString::as_os_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn validate_overlay(overlay: &EnvironmentOverlay) -> Result<(), InvalidOverlay> {
    for (name, value) in overlay.iter() {
        if name.is_empty() {
            return Err(InvalidOverlay::EmptyName);
        }
        if name.contains(['=', '\0']) {
            return Err(InvalidOverlay::ReservedCharacter {
                name: name.to_string(),
            });
        }
        if value.contains('\0') {
            return Err(InvalidOverlay::NulInValue {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn verify_restored<F>(prior: &[(String, Option<OsString>)], read: F) -> Result<(), EnvironmentLeak>
where
    F: Fn(&str) -> Option<OsString>,
{
    let leaked: Vec<LeakedVar> = prior
        .iter()
        .filter_map(|(name, expected)| {
            let observed = read(name);
            (observed != *expected).then(|| LeakedVar {
                name: name.clone(),
                expected: expected.as_ref().map(|v| v.to_string_lossy().into_owned()),
                observed: observed.map(|v| v.to_string_lossy().into_owned()),
            })
        })
        .collect();

    if leaked.is_empty() {
        Ok(())
    } else {
        Err(EnvironmentLeak { leaked })
    }
}

#[allow(unsafe_code)]
fn write_var(name: &str, value: Option<&OsStr>) {
    // SAFETY: callers hold OVERLAY_LOCK, and names and values were validated
    // by `validate_overlay`, so no two writers race inside this process.
    unsafe {
        match value {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }
}

fn describe_value(value: Option<&str>) -> String {
    value.map_or_else(|| "<unset>".to_string(), |value| format!("{value:?}"))
}

fn join_leaks(leaked: &[LeakedVar]) -> String {
    leaked
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| u64::try_from(elapsed.as_millis()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::ffi::{OsStr, OsString};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cp_core::EnvironmentOverlay;
    use serial_test::serial;

    use super::{
        EnvironmentComposer, EnvironmentSnapshot, EvidenceKind, EvidenceLedger, InvalidOverlay,
        OVERLAY_LOCK, verify_restored, write_var,
    };

    fn preset(name: &str, value: Option<&str>) {
        let _lock = OVERLAY_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        write_var(name, value.map(OsStr::new));
    }

    #[test]
    #[serial]
    fn release_restores_previous_value_and_absence() {
        preset("CP_RT_TEST_SET", Some("before"));
        preset("CP_RT_TEST_UNSET", None);
        let before = EnvironmentSnapshot::capture();

        let overlay = EnvironmentOverlay::new()
            .with_var("CP_RT_TEST_SET", "during")
            .with_var("CP_RT_TEST_UNSET", "during");
        let mut composer = EnvironmentComposer::new();
        let guard = composer.apply(&overlay).expect("valid overlay");
        assert_eq!(std::env::var("CP_RT_TEST_SET").as_deref(), Ok("during"));
        assert_eq!(std::env::var("CP_RT_TEST_UNSET").as_deref(), Ok("during"));

        composer.release(guard).expect("no leak");
        assert_eq!(EnvironmentSnapshot::capture(), before);
        assert_eq!(std::env::var_os("CP_RT_TEST_UNSET"), None);
        assert_eq!(
            std::env::var_os("CP_RT_TEST_SET"),
            Some(OsString::from("before"))
        );

        preset("CP_RT_TEST_SET", None);
    }

    #[test]
    #[serial]
    fn previously_empty_value_is_kept_distinct_from_unset() {
        preset("CP_RT_TEST_EMPTY", Some(""));
        let mut composer = EnvironmentComposer::new();
        let guard = composer
            .apply(&EnvironmentOverlay::new().with_var("CP_RT_TEST_EMPTY", "1"))
            .expect("valid overlay");
        composer.release(guard).expect("no leak");
        assert_eq!(std::env::var_os("CP_RT_TEST_EMPTY"), Some(OsString::new()));
        preset("CP_RT_TEST_EMPTY", None);
    }

    #[test]
    #[serial]
    fn drop_restores_on_panic() {
        let before = EnvironmentSnapshot::capture();
        let outcome = std::panic::catch_unwind(|| {
            let mut composer = EnvironmentComposer::new();
            let _guard = composer
                .apply(&EnvironmentOverlay::new().with_var("CP_RT_TEST_PANIC", "1"))
                .expect("valid overlay");
            panic!("engine blew up mid-run");
        });
        assert!(outcome.is_err());
        assert_eq!(EnvironmentSnapshot::capture(), before);
    }

    #[test]
    #[serial]
    fn overlays_never_overlap_across_threads() {
        let active = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let active = Arc::clone(&active);
                std::thread::spawn(move || {
                    let mut composer = EnvironmentComposer::new();
                    let overlay = EnvironmentOverlay::new()
                        .with_var("CP_RT_TEST_THREAD", worker.to_string());
                    let guard = composer.apply(&overlay).expect("valid overlay");
                    assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    assert_eq!(
                        std::env::var("CP_RT_TEST_THREAD").ok(),
                        Some(worker.to_string())
                    );
                    active.fetch_sub(1, Ordering::SeqCst);
                    composer.release(guard).expect("no leak");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker should not panic");
        }
        assert_eq!(std::env::var_os("CP_RT_TEST_THREAD"), None);
    }

    #[test]
    #[serial]
    fn ledger_records_apply_and_release() {
        let mut composer = EnvironmentComposer::new();
        let guard = composer
            .apply(&EnvironmentOverlay::new().with_var("CP_RT_TEST_LEDGER", "1"))
            .expect("valid overlay");
        assert_eq!(guard.touched().collect::<Vec<_>>(), vec!["CP_RT_TEST_LEDGER"]);
        composer.release(guard).expect("no leak");

        let summaries: Vec<&str> = composer
            .ledger()
            .entries()
            .iter()
            .map(|entry| entry.summary.as_str())
            .collect();
        assert_eq!(
            summaries,
            vec![
                "overlay_applied CP_RT_TEST_LEDGER=1",
                "overlay_released CP_RT_TEST_LEDGER"
            ]
        );
        assert!(
            composer
                .ledger()
                .entries()
                .iter()
                .all(|entry| entry.kind == EvidenceKind::Overlay)
        );
        assert_eq!(composer.ledger_mut().drain().len(), 2);
        assert!(composer.ledger().is_empty());
    }

    #[test]
    fn sequence_numbers_continue_across_drains() {
        let mut ledger = EvidenceLedger::new();
        ledger.record(EvidenceKind::Gate, "gate first");
        ledger.record(EvidenceKind::Invocation, "invoke first");
        ledger.record(EvidenceKind::Invocation, "invoke again");
        assert_eq!(
            ledger.kind_counts(),
            BTreeMap::from([(EvidenceKind::Gate, 1), (EvidenceKind::Invocation, 2)])
        );

        let first: Vec<u64> = ledger.drain().iter().map(|entry| entry.seq).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert!(ledger.is_empty());
        assert!(ledger.kind_counts().is_empty());

        ledger.record(EvidenceKind::Gate, "gate second");
        let second = ledger.drain();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].seq, 3);
        assert_eq!(second[0].summary, "gate second");
    }

    #[test]
    fn invalid_names_are_rejected_before_locking() {
        let mut composer = EnvironmentComposer::new();
        let err = composer
            .apply(&EnvironmentOverlay::new().with_var("BAD=NAME", "1"))
            .expect_err("reserved character");
        assert!(matches!(err, InvalidOverlay::ReservedCharacter { .. }));
        let err = composer
            .apply(&EnvironmentOverlay::new().with_var("", "1"))
            .expect_err("empty name");
        assert_eq!(err, InvalidOverlay::EmptyName);
        assert!(composer.ledger().is_empty());
    }

    #[test]
    fn verification_reports_each_leaked_variable() {
        let prior = vec![
            ("KEPT".to_string(), Some(OsString::from("a"))),
            ("WAS_UNSET".to_string(), None),
        ];
        let leak = verify_restored(&prior, |name| match name {
            "KEPT" => Some(OsString::from("a")),
            _ => Some(OsString::from("residue")),
        })
        .expect_err("residue must be reported");
        assert_eq!(leak.leaked.len(), 1);
        assert_eq!(leak.leaked[0].name, "WAS_UNSET");
        assert_eq!(leak.leaked[0].expected, None);
        assert_eq!(leak.leaked[0].observed.as_deref(), Some("residue"));
        assert!(leak.to_string().contains("<unset>"));
    }
}
