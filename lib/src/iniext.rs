//! Thin convenience helpers over [`tini::Ini`] for the two INI surfaces
//! this crate reads: the repository `config` file and `prepare-root.conf`.

use crate::error::CoreError;

/// Read a string value, or `None` if the section/key is absent.
pub fn optional_string(ini: &tini::Ini, section: &str, key: &str) -> Option<String> {
    ini.get(section, key)
}

/// Read and parse a boolean using the tristate-adjacent vocabulary
/// prepare-root.conf uses throughout (`yes|true|1` / `no|false|0`), or
/// `None` if absent. Any other value is a format error.
pub fn optional_bool(ini: &tini::Ini, section: &str, key: &str) -> Result<Option<bool>, CoreError> {
    let Some(raw) = optional_string(ini, section, key) else {
        return Ok(None);
    };
    parse_bool(&raw).map(Some)
}

fn parse_bool(s: &str) -> Result<bool, CoreError> {
    match s {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        o => Err(CoreError::invalid_format(format!("not a boolean: {o}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> tini::Ini {
        tini::Ini::from_string(s).unwrap()
    }

    #[test]
    fn missing_key_is_none() {
        let ini = parse("[root]\n");
        assert_eq!(optional_bool(&ini, "root", "transient").unwrap(), None);
        assert_eq!(optional_string(&ini, "root", "transient"), None);
    }

    #[test]
    fn parses_bool_vocabulary() {
        for (raw, expected) in [("yes", true), ("true", true), ("1", true), ("no", false), ("false", false), ("0", false)] {
            let ini = parse(&format!("[root]\ntransient = {raw}\n"));
            assert_eq!(optional_bool(&ini, "root", "transient").unwrap(), Some(expected));
        }
    }

    #[test]
    fn rejects_unknown_bool_value() {
        let ini = parse("[root]\ntransient = maybe\n");
        assert!(optional_bool(&ini, "root", "transient").is_err());
    }
}
