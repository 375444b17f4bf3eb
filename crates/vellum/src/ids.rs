use crate::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;

const MAX_NAME_LEN: usize = 200;
const MAX_ID_LEN: usize = 255;

/// A collection name: non-empty printable ASCII without path separators,
/// and a leading underscore is reserved for the engine.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('_')
        && name
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '/' && c != '\\');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_owned()))
    }
}

/// A record id: non-empty printable text without the reserved `_` prefix.
pub(crate) fn validate_record_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('_')
        && id.chars().all(|c| !c.is_control());
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_owned()))
    }
}

/// A fresh random id. Collision handling is the caller's: re-draw while
/// the id is taken.
pub(crate) fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(validate_name("inventory").is_ok());
        assert!(validate_name("inventory-2024.main").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("_system").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name(&"x".repeat(300)).is_err());
    }

    #[test]
    fn record_id_rules() {
        assert!(validate_record_id("doc-1").is_ok());
        assert!(validate_record_id("idé").is_ok());
        assert!(validate_record_id("").is_err());
        assert!(validate_record_id("_hidden").is_err());
        assert!(validate_record_id("a\nb").is_err());
    }

    #[test]
    fn random_ids_have_requested_length() {
        let id = random_id(32);
        assert_eq!(id.len(), 32);
        assert!(validate_record_id(&id).is_ok());
        assert_ne!(random_id(32), random_id(32));
    }
}
