/// Short random hex id used to correlate a session's log lines.
pub fn generate_session_id() -> String {
    let bytes: [u8; 4] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_eight_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_not_constant() {
        let a = generate_session_id();
        let b = generate_session_id();
        let c = generate_session_id();
        assert!(a != b || b != c);
    }
}
