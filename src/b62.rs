//! URL-safe base-62 encoding used to embed arbitrary strings in coordinator
//! path segments (node names under `…/config`).

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encodes raw bytes as base-62 text using the alphabet above.
///
/// This is a big-integer-style base conversion (not a byte-oriented codec
/// like base64): the input is treated as one large number. Two distinct byte
/// strings always encode to distinct base-62 strings, which is all the node
/// naming scheme in §3 requires.
#[must_use]
pub fn encode(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    // Work over the big-endian digits of the input interpreted as a base-256 number.
    let mut digits: Vec<u8> = input.bytes().collect();
    let mut out = Vec::new();

    // Track and re-emit leading zero bytes as leading '0' characters, the way
    // base58/base62 big-integer encodings conventionally do, so that inputs
    // differing only in leading NUL bytes still encode distinctly.
    let leading_zeros = digits.iter().take_while(|&&b| b == 0).count();

    while !digits.is_empty() && !digits.iter().all(|&b| b == 0) {
        let mut remainder = 0u32;
        let mut next_digits = Vec::with_capacity(digits.len());
        for &d in &digits {
            let acc = remainder * 256 + u32::from(d);
            let q = acc / 62;
            remainder = acc % 62;
            if !next_digits.is_empty() || q != 0 {
                next_digits.push(
                    u8::try_from(q).expect("quotient of division by 62 into a byte-sized base fits in u8"),
                );
            }
        }
        out.push(ALPHABET[remainder as usize]);
        digits = next_digits;
    }

    for _ in 0..leading_zeros {
        out.push(ALPHABET[0]);
    }

    out.reverse();
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Derives the coordination-service node name for a registration from its
/// three identifying components, per §3: `B62(prefix)_B62(path)_B62(hostPort)`.
#[must_use]
pub fn node_name(prefix: &str, path: &str, host_port: &str) -> String {
    format!("{}_{}_{}", encode(prefix), encode(path), encode(host_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_distinct_inputs_distinctly() {
        let a = encode("app.example.com/foo");
        let b = encode("app.example.com/bar");
        assert_ne!(a, b);
    }

    #[test]
    fn alphabet_is_url_safe() {
        let encoded = encode("hello world? #fragment");
        assert!(encoded.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn node_name_is_deterministic() {
        let a = node_name("app.example.com/foo", "/bar", "10.0.0.1:8443");
        let b = node_name("app.example.com/foo", "/bar", "10.0.0.1:8443");
        assert_eq!(a, b);
    }

    #[test]
    fn node_name_collision_free_on_distinct_triples() {
        let a = node_name("app.example.com/foo", "/bar", "10.0.0.1:8443");
        let b = node_name("app.example.com/foo", "/baz", "10.0.0.1:8443");
        let c = node_name("app.example.com/foo", "/bar", "10.0.0.2:8443");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn empty_input_encodes_to_empty() {
        assert_eq!(encode(""), "");
    }
}
