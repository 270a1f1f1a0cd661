//! Aggregation of recoverable failures across a sync sweep.
//!
//! An [`ExceptionBuilder`] collects warnings and failures in order of
//! appearance and assembles them into one [`Composite`]: the highest
//! priority failure becomes the primary cause and everything else is kept as
//! an ordered list of suppressed causes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::address::MountPoint;
use crate::error::FsError;

type Comparator<E> = Box<dyn Fn(&E, &E) -> Ordering + Send + Sync>;

/// A primary cause plus the causes it suppressed.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite<E> {
    /// The highest priority cause.
    pub primary: E,
    /// Remaining causes, by priority and then order of appearance.
    pub suppressed: Vec<E>,
}

impl<E> Composite<E> {
    /// Iterates over the primary cause followed by the suppressed ones.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        std::iter::once(&self.primary).chain(self.suppressed.iter())
    }

    /// Total number of causes.
    pub fn len(&self) -> usize {
        1 + self.suppressed.len()
    }

    /// Always false: a composite has at least its primary cause.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Priority-ordered accumulator of failures.
pub struct ExceptionBuilder<E> {
    priority: Comparator<E>,
    recorded: Vec<E>,
    primary: Option<usize>,
}

impl<E: PartialEq> ExceptionBuilder<E> {
    /// Creates a builder ranking causes with `priority`.
    pub fn new(priority: impl Fn(&E, &E) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            priority: Box::new(priority),
            recorded: Vec::new(),
            primary: None,
        }
    }

    fn position(&self, e: &E) -> Option<usize> {
        self.recorded.iter().position(|r| r == e)
    }

    /// Records a recoverable cause. Recording the same cause again is a no-op.
    pub fn warn(&mut self, e: E) {
        if self.position(&e).is_none() {
            self.recorded.push(e);
        }
    }

    /// Records a failure, making it primary if it outranks the current one.
    pub fn fail(&mut self, e: E) {
        let idx = match self.position(&e) {
            Some(idx) => idx,
            None => {
                self.recorded.push(e);
                self.recorded.len() - 1
            }
        };
        match self.primary {
            None => self.primary = Some(idx),
            Some(current) if current == idx => {}
            Some(current) => {
                if (self.priority)(&self.recorded[idx], &self.recorded[current]) == Ordering::Greater {
                    self.primary = Some(idx);
                }
            }
        }
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    /// Number of recorded causes.
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    /// Assembles the composite, or `Ok(())` if nothing was recorded.
    pub fn check(self) -> Result<(), Composite<E>> {
        let ExceptionBuilder {
            priority,
            mut recorded,
            primary,
        } = self;
        if recorded.is_empty() {
            return Ok(());
        }
        let primary_idx = match primary {
            Some(idx) => idx,
            None => {
                // Only warnings: the first of the highest rank leads.
                let mut best = 0;
                for i in 1..recorded.len() {
                    if priority(&recorded[i], &recorded[best]) == Ordering::Greater {
                        best = i;
                    }
                }
                best
            }
        };
        let primary = recorded.remove(primary_idx);
        // Stable sort keeps appearance order among equal priorities.
        recorded.sort_by(|a, b| priority(b, a));
        Err(Composite {
            primary,
            suppressed: recorded,
        })
    }
}

/// How serious a sync issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The mount point was committed but something needed attention.
    Warning,
    /// The mount point could not be committed.
    Failure,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Failure => f.write_str("failure"),
        }
    }
}

/// One problem encountered while syncing one mount point.
///
/// Issues compare by identity of the wrapped error, so recording a clone of
/// an issue that is already recorded does not duplicate it.
#[derive(Debug, Clone)]
pub struct SyncIssue {
    severity: Severity,
    mount_point: MountPoint,
    error: Arc<FsError>,
}

impl SyncIssue {
    /// A recoverable problem at `mount_point`.
    pub fn warning(mount_point: MountPoint, error: FsError) -> Self {
        Self {
            severity: Severity::Warning,
            mount_point,
            error: Arc::new(error),
        }
    }

    /// An unrecoverable problem at `mount_point`.
    pub fn failure(mount_point: MountPoint, error: FsError) -> Self {
        Self {
            severity: Severity::Failure,
            mount_point,
            error: Arc::new(error),
        }
    }

    /// Warning or failure.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// The mount point the issue belongs to.
    pub fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    /// The underlying error.
    pub fn error(&self) -> &FsError {
        &self.error
    }
}

impl PartialEq for SyncIssue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.error, &other.error)
    }
}

impl fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.mount_point, self.error)
    }
}

/// Composite result of a sync sweep that recorded at least one issue.
pub type SyncError = Composite<SyncIssue>;

/// Builder used by every sync sweep; failures outrank warnings.
pub type SyncExceptionBuilder = ExceptionBuilder<SyncIssue>;

impl ExceptionBuilder<SyncIssue> {
    /// A builder ranking issues by severity.
    pub fn for_sync() -> Self {
        Self::new(|a: &SyncIssue, b: &SyncIssue| a.severity.cmp(&b.severity))
    }

    /// Records `issue` as a warning or failure according to its severity.
    pub fn record(&mut self, issue: SyncIssue) {
        match issue.severity {
            Severity::Warning => self.warn(issue),
            Severity::Failure => self.fail(issue),
        }
    }
}

impl Composite<SyncIssue> {
    /// Returns true if any recorded issue is a failure.
    pub fn has_failures(&self) -> bool {
        self.iter().any(|i| i.severity == Severity::Failure)
    }

    /// Mount points with at least one failure, in report order.
    pub fn failed_mount_points(&self) -> Vec<&MountPoint> {
        let mut out: Vec<&MountPoint> = Vec::new();
        for issue in self.iter().filter(|i| i.severity == Severity::Failure) {
            if !out.contains(&&issue.mount_point) {
                out.push(&issue.mount_point);
            }
        }
        out
    }
}

impl fmt::Display for Composite<SyncIssue> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync {}", self.primary)?;
        for issue in &self.suppressed {
            write!(f, "; suppressed {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for Composite<SyncIssue> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.primary.error.as_ref())
    }
}
