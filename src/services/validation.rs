pub const SLUG_MIN_LEN: usize = 3;
pub const SLUG_MAX_LEN: usize = 30;

pub const SLUG_REQUIRED: &str = "siteSlug_obrigatorio";
pub const SLUG_BAD_LENGTH: &str = "siteSlug_tamanho_invalido";
pub const SLUG_BAD_CHARS: &str = "siteSlug_caracteres_invalidos";
pub const SLUG_TAKEN: &str = "siteSlug_ja_usado";
pub const CPF_INVALID: &str = "cpf_invalido";

pub fn normalize_slug(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Format errors for an already-normalized slug. Uniqueness is checked
/// separately because it needs the store.
pub fn slug_format_errors(slug: &str) -> Vec<&'static str> {
    if slug.is_empty() {
        return vec![SLUG_REQUIRED];
    }
    let mut errors = Vec::new();
    let len = slug.chars().count();
    if !(SLUG_MIN_LEN..=SLUG_MAX_LEN).contains(&len) {
        errors.push(SLUG_BAD_LENGTH);
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
    {
        errors.push(SLUG_BAD_CHARS);
    }
    errors
}

/// Brazilian CPF check: 11 digits (punctuation ignored), not all equal,
/// both mod-11 check digits correct.
pub fn is_valid_cpf(raw: &str) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() != 11 || raw.chars().any(|c| c.is_alphabetic()) {
        return false;
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let check = |len: usize| -> u32 {
        let sum: u32 = digits[..len]
            .iter()
            .enumerate()
            .map(|(i, d)| d * (len as u32 + 1 - i as u32))
            .sum();
        (sum * 10) % 11 % 10
    };

    check(9) == digits[9] && check(10) == digits[10]
}

pub fn cpf_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}
