//! Pairing code and token generation.

use rand::Rng;

/// Symbols a pairing code is drawn from. `0`, `O`, `1`, `I` and `L` are
/// left out so a code read aloud or off a screen cannot be mistyped.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

const CODE_SYMBOLS: usize = 8;

/// Generates a fresh `XXXX-XXXX` pairing code.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(CODE_SYMBOLS + 1);
    for i in 0..CODE_SYMBOLS {
        if i == CODE_SYMBOLS / 2 {
            code.push('-');
        }
        let idx = rng.random_range(0..CODE_ALPHABET.len());
        code.push(CODE_ALPHABET[idx] as char);
    }
    code
}

/// Generates a 128-bit random token, hex-encoded.
pub fn generate_token() -> String {
    pairlink_protocol::random_hex(16)
}

/// Uppercases a user-typed code and checks it is shaped like `XXXX-XXXX`.
///
/// Only the shape is checked (ASCII letters and digits), not membership
/// in [`CODE_ALPHABET`], so a mistyped `O` reports not-found rather than
/// a format error.
pub fn normalize_code(input: &str) -> Option<String> {
    let code = input.trim().to_ascii_uppercase();
    let bytes = code.as_bytes();
    if bytes.len() != CODE_SYMBOLS + 1 {
        return None;
    }
    let well_formed = bytes.iter().enumerate().all(|(i, b)| {
        if i == CODE_SYMBOLS / 2 {
            *b == b'-'
        } else {
            b.is_ascii_uppercase() || b.is_ascii_digit()
        }
    });
    well_formed.then_some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_code_shape_and_alphabet() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            for (i, b) in code.bytes().enumerate() {
                if i != 4 {
                    assert!(CODE_ALPHABET.contains(&b), "{code} has {}", b as char);
                }
            }
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_symbols() {
        for b in b"0O1IL" {
            assert!(!CODE_ALPHABET.contains(b));
        }
        assert_eq!(CODE_ALPHABET.len(), 31);
    }

    #[test]
    fn test_normalize_code_uppercases() {
        assert_eq!(normalize_code("abcd-2345").as_deref(), Some("ABCD-2345"));
        assert_eq!(normalize_code(" WXYZ-9876 ").as_deref(), Some("WXYZ-9876"));
    }

    #[test]
    fn test_normalize_code_rejects_bad_shapes() {
        for bad in ["", "ABCD2345", "ABCD-234", "ABCD_2345", "ABC-12345", "ÄBCD-2345", "ABCD-23456"] {
            assert!(normalize_code(bad).is_none(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_generate_token_is_hex_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
