use rand::rngs::OsRng;
use rand::Rng;

/// Letters a customer can read back over the phone: A–Z minus the
/// visually ambiguous I and O.
const LETTERS: &[u8; 24] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Generate a booking reference of the form `LLL-NNNN`.
///
/// Codes are customer-facing lookup tokens, so they are drawn from the
/// OS CSPRNG rather than a seedable PRNG. The generator guarantees
/// format only; uniqueness is the engine's code index + retry.
pub fn generate() -> String {
    let mut rng = OsRng;
    let mut out = String::with_capacity(8);
    for _ in 0..3 {
        out.push(LETTERS[rng.gen_range(0..LETTERS.len())] as char);
    }
    out.push('-');
    for _ in 0..4 {
        out.push(char::from_digit(rng.gen_range(0..10), 10).unwrap());
    }
    out
}

/// Format check used when looking a code up from caller input.
pub fn is_well_formed(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 8
        && bytes[..3].iter().all(|b| LETTERS.contains(b))
        && bytes[3] == b'-'
        && bytes[4..].iter().all(u8::is_ascii_digit)
}
