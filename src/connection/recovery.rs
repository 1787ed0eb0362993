//! Resume and recover bookkeeping.
//!
//! Resume state lives only in-process: the connection key from the last
//! `Connected` frame plus the highest server serial observed. The recover
//! key is the one artifact designed to cross process boundaries; it is
//! parsed from the user-supplied option and consumed by the first connect
//! that reaches a terminal outcome.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::Error;

/// In-process resume cursor for the current connection.
#[derive(Debug, Default)]
pub(crate) struct ResumeTracker {
    key: Option<String>,
    serial: Option<i64>,
}

impl ResumeTracker {
    /// Record the server serial carried by an inbound frame.
    pub(crate) fn note_serial(&mut self, serial: i64) {
        self.serial = Some(serial);
    }

    pub(crate) fn set_key(&mut self, key: Option<String>) {
        self.key = key;
    }

    pub(crate) fn clear_serial(&mut self) {
        self.serial = None;
    }

    pub(crate) fn clear(&mut self) {
        self.key = None;
        self.serial = None;
    }

    /// Resume parameters, present only when both halves are known.
    pub(crate) fn resume_params(&self) -> Option<(&str, i64)> {
        match (&self.key, self.serial) {
            (Some(key), Some(serial)) => Some((key.as_str(), serial)),
            _ => None,
        }
    }

    /// Portable recovery key, present only when both halves are known.
    pub(crate) fn recovery_key(&self) -> Option<String> {
        self.resume_params()
            .map(|(key, serial)| format!("{key}:{serial}"))
    }
}

/// Parsed recover option, consumed at most once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecoverInfo {
    pub(crate) key: String,
    pub(crate) serial: i64,
}

impl RecoverInfo {
    /// Parse a user-supplied recovery key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the key does not match the
    /// recovery key format or its serial is not an integer.
    pub(crate) fn parse(raw: &str) -> Result<Self, Error> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^([A-Za-z0-9_-]+):(-?[A-Za-z0-9]+)$")
                .expect("recovery key pattern is valid")
        });
        let captures = pattern.captures(raw).ok_or_else(|| {
            Error::InvalidArgument(format!("malformed recovery key {raw:?}"))
        })?;
        let serial = captures[2].parse::<i64>().map_err(|_| {
            Error::InvalidArgument(format!("recovery key serial {:?} is not an integer", &captures[2]))
        })?;
        Ok(Self {
            key: captures[1].to_string(),
            serial,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn recovery_key_requires_both_halves() {
        let mut resume = ResumeTracker::default();
        assert_eq!(resume.recovery_key(), None);
        resume.set_key(Some("conn-key".into()));
        assert_eq!(resume.recovery_key(), None);
        resume.note_serial(42);
        assert_eq!(resume.recovery_key().as_deref(), Some("conn-key:42"));
        resume.clear();
        assert_eq!(resume.recovery_key(), None);
    }

    #[rstest]
    #[case("abc-def:42", "abc-def", 42)]
    #[case("a_B9:-3", "a_B9", -3)]
    fn valid_keys_parse(#[case] raw: &str, #[case] key: &str, #[case] serial: i64) {
        let info = RecoverInfo::parse(raw).expect("parse");
        assert_eq!(info.key, key);
        assert_eq!(info.serial, serial);
    }

    #[rstest]
    #[case("")]
    #[case("abc-def")]
    #[case("abc def:42")]
    #[case("abc:12:34")]
    #[case("abc-def:4a2")]
    fn invalid_keys_are_rejected(#[case] raw: &str) {
        assert!(matches!(
            RecoverInfo::parse(raw),
            Err(Error::InvalidArgument(_))
        ));
    }
}
