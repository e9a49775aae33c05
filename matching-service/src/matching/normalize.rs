//! Vendor text normalisation shared by scoring and alias learning.

/// Leading tokens card processors prepend to merchant names (`SQ *`, `TST*`, `PAYPAL *`).
const PROCESSOR_PREFIXES: &[&str] = &["sq", "tst", "paypal", "pp", "dnh", "py", "dmi", "sp"];

/// Tokens that carry no merchant identity.
const NOISE_TOKENS: &[&str] = &[
    "store", "inc", "llc", "ltd", "co", "corp", "the", "pos", "purchase", "debit", "card",
    "payment", "www", "com",
];

/// Tokenised, normalised vendor text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVendor {
    tokens: Vec<String>,
}

impl NormalizedVendor {
    pub fn new(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        let spaced: String = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect();

        let mut tokens: Vec<&str> = spaced.split_whitespace().collect();

        while tokens.len() > 1 && PROCESSOR_PREFIXES.contains(&tokens[0]) {
            tokens.remove(0);
        }

        let tokens = tokens
            .into_iter()
            .filter(|t| !NOISE_TOKENS.contains(t))
            .map(strip_leading_zeros)
            .collect();

        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Space-joined canonical form; used as the vendor alias key.
    pub fn text(&self) -> String {
        self.tokens.join(" ")
    }

    /// Whitespace-free form, so "star bucks" and "starbucks" compare equal.
    pub fn compact(&self) -> String {
        self.tokens.concat()
    }

    /// Every token of `self` appears in `other`.
    pub fn is_contained_in(&self, other: &NormalizedVendor) -> bool {
        !self.is_empty() && self.tokens.iter().all(|t| other.tokens.contains(t))
    }

    /// Dice coefficient over tokens, with prefix-tolerant token equality.
    pub fn dice(&self, other: &NormalizedVendor) -> f64 {
        if self.is_empty() || other.is_empty() {
            return 0.0;
        }

        let mut used = vec![false; other.tokens.len()];
        let mut shared = 0usize;
        for token in &self.tokens {
            if let Some(idx) = other
                .tokens
                .iter()
                .enumerate()
                .position(|(i, o)| !used[i] && tokens_equivalent(token, o))
            {
                used[idx] = true;
                shared += 1;
            }
        }

        (2 * shared) as f64 / (self.tokens.len() + other.tokens.len()) as f64
    }
}

/// Normalise raw vendor text into its canonical single-line form.
pub fn normalize_vendor(raw: &str) -> String {
    NormalizedVendor::new(raw).text()
}

fn strip_leading_zeros(token: &str) -> String {
    if token.chars().all(|c| c.is_ascii_digit()) {
        let trimmed = token.trim_start_matches('0');
        if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        token.to_string()
    }
}

/// Equal, or the shorter token (3+ chars) is a prefix of the longer: "starbuck" ~ "starbucks".
fn tokens_equivalent(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= 3 && long.starts_with(short)
}
