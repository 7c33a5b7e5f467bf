use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Truncates a SHA-256 digest to a stable 128-bit hex id — 32 characters,
/// collision-resistant enough for per-user dedupe without the full 64-char
/// digest cluttering paths and filenames.
fn hash128_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update(b"\0");
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// `docId = hash(providerId ∥ subject ∥ date ∥ sender ∥ bodyHead1KB)`.
/// Deterministic across runs and hosts given the same provider state.
pub fn email_doc_id(provider_id: &str, subject: &str, date: DateTime<Utc>, sender: &str, body: &str) -> String {
    let body_head: String = body.chars().take(1024).collect();
    hash128_hex(&[
        provider_id.as_bytes(),
        subject.as_bytes(),
        date.to_rfc3339().as_bytes(),
        sender.as_bytes(),
        body_head.as_bytes(),
    ])
}

/// Mbox messages fold in the `Message-ID` header so that re-parsing the same
/// mbox file (even if byte offsets shift) produces the same id.
pub fn mbox_email_doc_id(
    provider_id: &str,
    subject: &str,
    date: DateTime<Utc>,
    sender: &str,
    body: &str,
    internet_message_id: &str,
) -> String {
    let body_head: String = body.chars().take(1024).collect();
    hash128_hex(&[
        provider_id.as_bytes(),
        subject.as_bytes(),
        date.to_rfc3339().as_bytes(),
        sender.as_bytes(),
        body_head.as_bytes(),
        internet_message_id.as_bytes(),
    ])
}

/// `docId = hash(providerId ∥ name ∥ mtime ∥ mime ∥ first10KB)` for files
/// (Drive/OneDrive items, mbox attachments).
pub fn file_doc_id(provider_id: &str, name: &str, mtime: DateTime<Utc>, mime: &str, content: &[u8]) -> String {
    let head = &content[..content.len().min(10 * 1024)];
    hash128_hex(&[
        provider_id.as_bytes(),
        name.as_bytes(),
        mtime.to_rfc3339().as_bytes(),
        mime.as_bytes(),
        head,
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalSource {
    GoogleEmail,
    MicrosoftEmail,
    GoogleStorage,
    MicrosoftStorage,
    Mbox,
}

impl CanonicalSource {
    fn prefix(&self) -> &'static str {
        match self {
            CanonicalSource::GoogleEmail => "google_email",
            CanonicalSource::MicrosoftEmail => "microsoft_email",
            CanonicalSource::GoogleStorage => "google_storage",
            CanonicalSource::MicrosoftStorage => "microsoft_storage",
            CanonicalSource::Mbox => "mbox",
        }
    }
}

/// `/google_email/<user_id>/<conversation_id>/<doc_id>` and friends (§6).
pub fn canonical_email_path(source: CanonicalSource, user_id: &str, conversation_id: &str, doc_id: &str) -> String {
    format!("/{}/{}/{}/{}", source.prefix(), user_id, conversation_id, doc_id)
}

/// `/google_email/<user_id>/<conversation_id>/attachments/<filename>`.
pub fn canonical_attachment_path(
    source: CanonicalSource,
    user_id: &str,
    conversation_id: &str,
    filename: &str,
) -> String {
    format!("/{}/{}/{}/attachments/{}", source.prefix(), user_id, conversation_id, filename)
}

/// `/google_storage/<user_id>/<file_id>/<filename>` and the OneDrive analog.
pub fn canonical_file_path(source: CanonicalSource, user_id: &str, file_id: &str, filename: &str) -> String {
    format!("/{}/{}/{}/{}", source.prefix(), user_id, file_id, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_doc_id_is_deterministic() {
        let date = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let a = email_doc_id("u1", "hello", date, "a@example.com", "body");
        let b = email_doc_id("u1", "hello", date, "a@example.com", "body");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn email_doc_id_changes_with_any_component() {
        let date = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let a = email_doc_id("u1", "hello", date, "a@example.com", "body");
        let b = email_doc_id("u1", "hello there", date, "a@example.com", "body");
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_paths_match_spec_shape() {
        assert_eq!(
            canonical_email_path(CanonicalSource::GoogleEmail, "u1", "c1", "d1"),
            "/google_email/u1/c1/d1"
        );
        assert_eq!(
            canonical_attachment_path(CanonicalSource::GoogleEmail, "u1", "c1", "invoice.pdf"),
            "/google_email/u1/c1/attachments/invoice.pdf"
        );
        assert_eq!(
            canonical_file_path(CanonicalSource::MicrosoftStorage, "u1", "f1", "report.docx"),
            "/microsoft_storage/u1/f1/report.docx"
        );
    }
}
