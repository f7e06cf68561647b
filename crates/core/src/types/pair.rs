//! Instrument keys.
//!
//! The exchange names an instrument either as a two-element symbol array
//! (`["BTC", "USD"]`) or as a canonical `"BTC:USD"` string depending on the
//! message kind. [`Pair`] always holds the canonical form, so every lookup
//! structure is keyed by exactly one spelling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors produced when parsing an instrument key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairError {
    #[error("instrument key {0:?} is missing the ':' separator")]
    MissingSeparator(String),
    #[error("instrument key {0:?} has an empty symbol")]
    EmptySymbol(String),
}

/// Canonical `"BASE:QUOTE"` instrument key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair(String);

impl Pair {
    /// Build a key from its two symbols. Symbols are upper-cased.
    pub fn new(base: &str, quote: &str) -> Result<Self, PairError> {
        let base = base.trim();
        let quote = quote.trim();
        if base.is_empty() || quote.is_empty() || base.contains(':') || quote.contains(':') {
            return Err(PairError::EmptySymbol(format!("{base}:{quote}")));
        }
        Ok(Self(format!(
            "{}:{}",
            base.to_ascii_uppercase(),
            quote.to_ascii_uppercase()
        )))
    }

    /// Parse the canonical `"BASE:QUOTE"` form.
    pub fn parse(s: &str) -> Result<Self, PairError> {
        let (base, quote) = s
            .split_once(':')
            .ok_or_else(|| PairError::MissingSeparator(s.to_string()))?;
        if base.trim().is_empty() || quote.trim().is_empty() || quote.contains(':') {
            return Err(PairError::EmptySymbol(s.to_string()));
        }
        Self::new(base, quote)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        self.0.split_once(':').map(|(b, _)| b).unwrap_or(self.0.as_str())
    }

    pub fn quote(&self) -> &str {
        self.0.split_once(':').map(|(_, q)| q).unwrap_or("")
    }

    /// The two-element symbol form used by outbound requests.
    pub fn symbols(&self) -> [String; 2] {
        [self.base().to_string(), self.quote().to_string()]
    }
}

impl FromStr for Pair {
    type Err = PairError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Pair {
    type Error = PairError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Pair> for String {
    fn from(p: Pair) -> Self {
        p.0
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let p = Pair::parse("BTC:USD").unwrap();
        assert_eq!(p.as_str(), "BTC:USD");
        assert_eq!(p.base(), "BTC");
        assert_eq!(p.quote(), "USD");
    }

    #[test]
    fn test_new_from_symbols_matches_parse() {
        assert_eq!(Pair::new("ETH", "EUR").unwrap(), Pair::parse("ETH:EUR").unwrap());
    }

    #[test]
    fn test_lowercase_is_normalized() {
        assert_eq!(Pair::parse("btc:usd").unwrap().as_str(), "BTC:USD");
    }

    #[test]
    fn test_missing_separator() {
        assert_eq!(
            Pair::parse("BTCUSD"),
            Err(PairError::MissingSeparator("BTCUSD".into()))
        );
    }

    #[test]
    fn test_empty_symbol() {
        assert!(matches!(Pair::parse(":USD"), Err(PairError::EmptySymbol(_))));
        assert!(matches!(Pair::parse("BTC:"), Err(PairError::EmptySymbol(_))));
        assert!(matches!(Pair::parse("A:B:C"), Err(PairError::EmptySymbol(_))));
    }

    #[test]
    fn test_symbols() {
        let p = Pair::parse("BTC:USD").unwrap();
        assert_eq!(p.symbols(), ["BTC".to_string(), "USD".to_string()]);
    }

    #[test]
    fn test_serde_as_string() {
        let p: Pair = serde_json::from_str("\"LTC:BTC\"").unwrap();
        assert_eq!(p.to_string(), "LTC:BTC");
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"LTC:BTC\"");
        assert!(serde_json::from_str::<Pair>("\"LTCBTC\"").is_err());
    }
}
