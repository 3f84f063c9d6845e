/// Trigram extraction: NFKC normalization, full Unicode uppercasing, then
/// contiguous triples of code points.
///
/// Input: "hello" → ["HEL", "ELL", "LLO"]
///
/// Canonicalization is NFKC-then-uppercase over code points (not octets),
/// so identical inputs always produce identical trigram sequences and
/// non-ASCII text canonicalizes correctly. Inputs shorter than three code
/// points yield an empty sequence.
use unicode_normalization::UnicodeNormalization;

/// Canonical code-point sequence for indexing and lookups.
pub fn canonicalize(text: &str) -> Vec<char> {
    text.nfkc().flat_map(char::to_uppercase).collect()
}

/// Extract the trigrams of `text` in order, with duplicates.
pub fn trigrams(text: &str) -> Vec<String> {
    let chars = canonicalize(text);
    if chars.len() < 3 {
        return Vec::new();
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

/// Distinct trigrams of `text`, in first-occurrence order. Lookups and
/// delta bookkeeping never care about repeats.
pub fn distinct_trigrams(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    trigrams(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Canonicalize a single query trigram. Returns `None` unless the input
/// canonicalizes to exactly three code points.
pub fn canonical_query_trigram(trigram: &str) -> Option<String> {
    let chars = canonicalize(trigram);
    if chars.len() != 3 {
        return None;
    }
    Some(chars.iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_trigrams_uppercased() {
        assert_eq!(trigrams("hello"), vec!["HEL", "ELL", "LLO"]);
    }

    #[test]
    fn short_input_is_empty() {
        assert!(trigrams("").is_empty());
        assert!(trigrams("a").is_empty());
        assert!(trigrams("ab").is_empty());
        assert_eq!(trigrams("abc"), vec!["ABC"]);
    }

    #[test]
    fn nfkc_normalization_applies() {
        // Fullwidth letters normalize to ASCII before uppercasing.
        assert_eq!(trigrams("ａｂｃｄ"), vec!["ABC", "BCD"]);
    }

    #[test]
    fn identical_inputs_identical_sequences() {
        let a = trigrams("Hello World");
        let b = trigrams("Hello World");
        assert_eq!(a, b);
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(trigrams("ABCd"), trigrams("abcD"));
    }

    #[test]
    fn non_ascii_code_points() {
        // Trigrams are code-point windows, not byte windows.
        let got = trigrams("тест");
        assert_eq!(got, vec!["ТЕС", "ЕСТ"]);
    }

    #[test]
    fn distinct_preserves_first_occurrence() {
        // "aaaa" -> AAA, AAA -> one distinct trigram.
        assert_eq!(distinct_trigrams("aaaa"), vec!["AAA"]);
        assert_eq!(distinct_trigrams("abcabc"), vec!["ABC", "BCA", "CAB"]);
    }

    #[test]
    fn query_trigram_must_be_three_points() {
        assert_eq!(canonical_query_trigram("the"), Some("THE".into()));
        assert_eq!(canonical_query_trigram("th"), None);
        assert_eq!(canonical_query_trigram("them"), None);
    }
}
