use serde::{Deserialize, Deserializer};
use std::fmt;
use zeroize::Zeroizing;

use crate::models::ArchiveError;

/// A passphrase for encrypted archives
///
/// The backing buffer is wiped when the value is dropped. `Debug` never shows
/// the content and the type is not `Serialize`.
#[derive(Clone)]
pub struct Passphrase {
    inner: Zeroizing<String>,
}

impl Passphrase {
    pub fn new<S: Into<String>>(passphrase: S) -> Self {
        Self {
            inner: Zeroizing::new(passphrase.into()),
        }
    }

    /// Borrow the secret for handing to a codec library
    pub fn expose(&self) -> &str {
        &self.inner
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

impl From<&str> for Passphrase {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Passphrase {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Passphrase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Zeroizing::new(String::deserialize(deserializer)?);
        Ok(Self::new(raw.as_str()))
    }
}

/// Holds a passphrase for the duration of one operation
///
/// Acquiring moves the passphrase out of the request, so the request no longer
/// owns a copy. Dropping the scope wipes it on every exit path, including
/// early returns and unwinding.
pub struct CredentialScope {
    passphrase: Option<Passphrase>,
}

impl CredentialScope {
    pub fn acquire(slot: &mut Option<Passphrase>) -> Self {
        Self {
            passphrase: slot.take(),
        }
    }

    pub fn passphrase(&self) -> Option<&Passphrase> {
        self.passphrase.as_ref()
    }
}

impl Drop for CredentialScope {
    fn drop(&mut self) {
        if self.passphrase.take().is_some() {
            log::trace!("Credential scope released");
        }
    }
}

/// Classify a failure to decode an entry
///
/// Codec libraries often cannot tell a wrong key from damaged data; both show
/// up as a decompression or checksum error. An encrypted entry that fails with
/// a passphrase present is reported as a wrong passphrase, without one as a
/// missing passphrase. Plain entries are corrupt.
pub fn classify_decode_failure(
    entry: &str,
    encrypted: bool,
    has_passphrase: bool,
    reason: impl fmt::Display,
) -> ArchiveError {
    match (encrypted, has_passphrase) {
        (true, true) => ArchiveError::WrongPassphrase(entry.to_string()),
        (true, false) => ArchiveError::PassphraseRequired(entry.to_string()),
        (false, _) => ArchiveError::CorruptEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let passphrase = Passphrase::new("hunter2");
        let printed = format!("{:?}", passphrase);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn test_scope_takes_passphrase() {
        let mut slot = Some(Passphrase::from("secret"));
        {
            let scope = CredentialScope::acquire(&mut slot);
            assert!(slot.is_none());
            assert_eq!(scope.passphrase().unwrap().expose(), "secret");
        }
        assert!(slot.is_none());
    }

    #[test]
    fn test_scope_released_on_early_return() {
        fn use_once(slot: &mut Option<Passphrase>) -> Result<(), ArchiveError> {
            let scope = CredentialScope::acquire(slot);
            if scope.passphrase().is_some() {
                return Err(ArchiveError::Cancelled);
            }
            Ok(())
        }
        let mut slot = Some(Passphrase::from("secret"));
        assert!(use_once(&mut slot).is_err());
        assert!(slot.is_none());
    }

    #[test]
    fn test_classify_decode_failure() {
        assert!(matches!(
            classify_decode_failure("a", true, true, "bad"),
            ArchiveError::WrongPassphrase(_)
        ));
        assert!(matches!(
            classify_decode_failure("a", true, false, "bad"),
            ArchiveError::PassphraseRequired(_)
        ));
        assert!(matches!(
            classify_decode_failure("a", false, true, "crc"),
            ArchiveError::CorruptEntry { .. }
        ));
    }

    #[test]
    fn test_deserialize() {
        let p: Passphrase = serde_json::from_str("\"pw\"").unwrap();
        assert_eq!(p.expose(), "pw");
    }
}
