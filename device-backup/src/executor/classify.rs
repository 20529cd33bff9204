//! Mapping of backup tool failures onto [`BackupErrorCode`]s.

use crate::utils::BackupErrorCode;

/// Raw diagnostics longer than this are cut before being shown.
pub const MAX_RAW_ERROR_CHARS: usize = 200;

/// Codes the tool reports through its library's error enums.
const EXIT_NO_DEVICE: i32 = -3;
const EXIT_PASSWORD_PROTECTED: i32 = -17;
const EXIT_USER_DENIED_PAIRING: i32 = -18;
const EXIT_PAIRING_PENDING: i32 = -19;
const EXIT_INVALID_HOST_ID: i32 = -21;

/// Undoes unsigned wraparound of negative exit codes.
///
/// Some platforms report `-1` as `4294967295` (32-bit) and shells truncate
/// to 8 bits, turning `-3` into `253`. Values in `129..=255` are read as
/// small negative codes.
pub fn normalize_exit_code(raw: i64) -> i32 {
    let raw = if raw > i64::from(i32::MAX) && raw <= i64::from(u32::MAX) {
        raw - (1i64 << 32)
    } else {
        raw
    };

    let code = i32::try_from(raw).unwrap_or(i32::MIN);
    if (129..=255).contains(&code) {
        code - 256
    } else {
        code
    }
}

/// Classifies a failed run from its (normalised) exit code and diagnostics.
///
/// Diagnostic text is checked first since it is more specific than the
/// exit code. Returns the category and a short human-readable message.
pub fn classify_failure(exit_code: Option<i32>, diagnostics: &str) -> (BackupErrorCode, String) {
    let text = diagnostics.to_lowercase();

    let by_text = if text.contains("password") {
        if ["incorrect", "wrong", "invalid", "bad"]
            .iter()
            .any(|word| text.contains(word))
        {
            Some(BackupErrorCode::IncorrectPassword)
        } else {
            Some(BackupErrorCode::PasswordRequired)
        }
    } else if text.contains("locked") || text.contains("passcode") {
        Some(BackupErrorCode::DeviceLocked)
    } else if text.contains("trust") || text.contains("pair") {
        Some(BackupErrorCode::DeviceNotTrusted)
    } else if text.contains("no device") || text.contains("not found") {
        Some(BackupErrorCode::DeviceNotFound)
    } else if text.contains("disconnected") || text.contains("lost connection") {
        Some(BackupErrorCode::DeviceDisconnected)
    } else if text.contains("space") {
        Some(BackupErrorCode::InsufficientSpace)
    } else {
        None
    };

    let code = by_text.or_else(|| match exit_code {
        Some(EXIT_NO_DEVICE) => Some(BackupErrorCode::DeviceNotFound),
        Some(EXIT_PASSWORD_PROTECTED) => Some(BackupErrorCode::DeviceLocked),
        Some(EXIT_USER_DENIED_PAIRING | EXIT_PAIRING_PENDING | EXIT_INVALID_HOST_ID) => {
            Some(BackupErrorCode::DeviceNotTrusted)
        }
        _ => None,
    });

    match code {
        Some(code) => (code, code.user_message().to_string()),
        None => (BackupErrorCode::UnknownError, unknown_message(exit_code, diagnostics)),
    }
}

fn unknown_message(exit_code: Option<i32>, diagnostics: &str) -> String {
    let detail = truncate_chars(diagnostics.trim(), MAX_RAW_ERROR_CHARS);
    match (exit_code, detail.is_empty()) {
        (Some(code), true) => format!("Backup failed with exit code {}", code),
        (Some(code), false) => format!("Backup failed with exit code {}: {}", code, detail),
        (None, true) => "Backup tool terminated unexpectedly".to_string(),
        (None, false) => format!("Backup tool terminated unexpectedly: {}", detail),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
