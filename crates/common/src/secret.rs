//! Redacting wrapper for API keys and proxy passwords

use std::fmt;
use zeroize::Zeroize;

/// Value that never appears in Debug/Display output and is zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Raw value, for the `Authorization` header only
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Masked form for debug strings: `...` followed by the last 4 characters.
    ///
    /// Values of 8 characters or fewer are fully masked so that short test
    /// keys never leak in their entirety.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "...".to_string();
        }
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("...{suffix}")
    }
}

const REDACTED: &str = "[REDACTED]";

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new(String::from("gsk_live_0123456789"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.to_string(), "[REDACTED]");

        let keys = vec![secret.clone()];
        assert!(!format!("{keys:?}").contains("gsk_live"));
    }

    #[test]
    fn expose_returns_raw_value() {
        let secret = Secret::new(String::from("gsk_live_0123456789"));
        assert_eq!(secret.expose(), "gsk_live_0123456789");
    }

    #[test]
    fn masked_shows_only_suffix() {
        let secret = Secret::new(String::from("gsk_live_0123456789"));
        assert_eq!(secret.masked(), "...6789");
    }

    #[test]
    fn masked_hides_short_values_entirely() {
        let secret = Secret::new(String::from("short"));
        assert_eq!(secret.masked(), "...");
    }
}
