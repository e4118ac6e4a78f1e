//! Verification log files: `db/lastcheck` and `db/issues`.
//!
//! Both are block-framed containers. `lastcheck` records ranges of item
//! names checked at some time; `issues` keeps one history entry per item
//! that ever misbehaved. Both are mutable, rewritten block-locally under a
//! write lock.

pub mod issues;
pub mod lastcheck;
pub mod timestamp;

pub use issues::{
    ChangeEvent, ContentIssue, ContentState, IssueItem, IssuesEditor, IssuesFile, ManifestDetail,
    ManifestEvent, ManifestIssue,
};
pub use lastcheck::{CheckedRange, LastCheckFile, RangeKind};
pub use timestamp::CheckTime;
