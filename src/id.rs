use ulid::Ulid;

/// Sortable random token used to prefix stored blob file names.
pub fn new_ulid_string() -> String {
    Ulid::new().to_string()
}

pub fn is_ulid_string(s: &str) -> bool {
    s.len() == 26 && Ulid::from_string(s).is_ok()
}
