//! Text detection and unified diff patches.

use crate::error::{ErrorKind, Result};
use crate::models::VersionId;
use diffy::Patch;
use exn::ResultExt;

/// Strategy name recorded for every delta produced here.
pub const UNIFIED_DIFF: &str = "unified-diff";

/// Whether a MIME type denotes text that is worth diffing.
///
/// Matches `text/*`, the JSON/XML/JavaScript application types, and any
/// `+json` or `+xml` structured suffix. Parameters such as `charset` are
/// ignored.
///
/// ```
/// use cirrus_vault::is_text_mime;
///
/// assert!(is_text_mime("text/plain; charset=utf-8"));
/// assert!(is_text_mime("application/ld+json"));
/// assert!(!is_text_mime("image/png"));
/// ```
pub fn is_text_mime(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    let Some((kind, subtype)) = essence.split_once('/') else {
        return false;
    };
    if subtype.is_empty() {
        return false;
    }
    if kind == "text" || subtype.ends_with("+json") || subtype.ends_with("+xml") {
        return true;
    }
    kind == "application" && matches!(subtype, "json" | "xml" | "javascript" | "x-javascript" | "ecmascript")
}

/// Unified diff turning `base` into `target`.
pub fn create_patch(base: &str, target: &str) -> String {
    diffy::create_patch(base, target).to_string()
}

/// Apply a patch produced by [`create_patch`] to `base`.
///
/// Failure to parse or apply is reported as
/// [`PatchApplyFailed`](ErrorKind::PatchApplyFailed) for `version`.
pub fn apply_patch(base: &str, patch: &str, version: VersionId) -> Result<String> {
    let patch = Patch::from_str(patch).or_raise(|| ErrorKind::PatchApplyFailed(version))?;
    diffy::apply(base, &patch).or_raise(|| ErrorKind::PatchApplyFailed(version))
}
