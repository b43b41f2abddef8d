use nanoid::nanoid;

/// Lowercase letters and digits minus look-alikes (`0`/`o`, `1`/`l`/`i`), so
/// generated ids read back unambiguously and never need escaping in a path.
const ID_ALPHABET: [char; 31] = [
    '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'k', 'm', 'n', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];
pub const ID_LENGTH: usize = 16;

/// Value for a `generated` string identity field.
pub fn generate_entity_id() -> String {
    nanoid!(ID_LENGTH, &ID_ALPHABET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_path_safe() {
        let id = generate_entity_id();
        assert_eq!(id.chars().count(), ID_LENGTH);
        assert!(id.chars().all(|c| ID_ALPHABET.contains(&c)));
        assert!(!id.contains('/'));
        assert_ne!(id, generate_entity_id());
    }
}
