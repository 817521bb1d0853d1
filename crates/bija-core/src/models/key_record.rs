/// The locally custodied identity key.
///
/// `key` is the hex secret key when `encrypted` is false, and a NIP-49
/// `ncryptsec` string when it is true.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key: String,
    pub encrypted: bool,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("key", &"<redacted>")
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_output_hides_key() {
        let record = KeyRecord {
            key: "deadbeef".to_string(),
            encrypted: false,
        };
        let printed = format!("{:?}", record);
        assert!(!printed.contains("deadbeef"));
        assert!(printed.contains("encrypted: false"));
    }
}
