use std::borrow::Cow;

use super::meta::MirrorFileMeta;

/// Rewrites `\r\n` and lone `\r` to `\n`.
pub fn normalize_line_endings(script: &str) -> Cow<'_, str> {
    if !script.contains('\r') {
        return Cow::Borrowed(script);
    }
    Cow::Owned(script.replace("\r\n", "\n").replace('\r', "\n"))
}

pub fn scripts_differ(local: &str, remote: &str) -> bool {
    normalize_line_endings(local) != normalize_line_endings(remote)
}

/// Compares sidecars with local bookkeeping stripped from both sides.
pub fn meta_differs(local: &MirrorFileMeta, remote: &MirrorFileMeta) -> bool {
    local.sanitized() != remote.sanitized()
}
