use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::EngineError;

/// Runtime switches toggled by `#mhtvar`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `convumlauts`: replace German umlauts with HTML entities.
    pub convert_umlauts: bool,
    /// `killspace`: trim each emitted line and end it with one space.
    pub kill_space: bool,
    /// `writeoutput`: emit literal content at all.
    pub write_output: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            convert_umlauts: false,
            kill_space: false,
            write_output: true,
        }
    }
}

impl Settings {
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        let slot = match name.to_ascii_lowercase().as_str() {
            "convumlauts" => &mut self.convert_umlauts,
            "killspace" => &mut self.kill_space,
            "writeoutput" => &mut self.write_output,
            _ => return Err(EngineError::UnknownSetting(name.to_string())),
        };
        *slot = match value.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return Err(EngineError::SettingValueUnrecognized(value.to_string())),
        };
        Ok(())
    }

    /// Post-process one line of content before it is written.
    pub fn apply(&self, text: &str) -> String {
        let text = if self.convert_umlauts {
            convert_umlauts(text)
        } else {
            text.to_string()
        };
        if self.kill_space { kill_space(&text) } else { text }
    }
}

/// Bounds on nesting. Exceeding one is an error, never a truncation.
///
/// Includes, block invocations and macro expansion all recurse on the call
/// stack. The defaults keep their combined worst case within a 2 MiB
/// thread stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_conditional_depth: usize,
    pub max_include_depth: usize,
    pub max_arguments: usize,
    pub max_expansion_depth: usize,
    /// Nested `#process`/`#loop` invocations.
    pub max_block_depth: usize,
    pub max_sinks: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_conditional_depth: 128,
            max_include_depth: 16,
            max_arguments: 32,
            max_expansion_depth: 256,
            max_block_depth: 32,
            max_sinks: 64,
        }
    }
}

/// Everything an engine can be configured with up front, typically read
/// from a TOML file:
///
/// ```toml
/// [settings]
/// kill_space = true
///
/// [limits]
/// max_include_depth = 16
///
/// [macros]
/// site = "example.org"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub settings: Settings,
    pub limits: Limits,
    pub macros: BTreeMap<String, String>,
}

pub fn convert_umlauts(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'ä' => result.push_str("&auml;"),
            'ö' => result.push_str("&ouml;"),
            'ü' => result.push_str("&uuml;"),
            'Ä' => result.push_str("&Auml;"),
            'Ö' => result.push_str("&Ouml;"),
            'Ü' => result.push_str("&Uuml;"),
            'ß' => result.push_str("&szlig;"),
            c => result.push(c),
        }
    }
    result
}

/// Trim both ends, line terminator included, and leave one trailing space
/// if anything is left.
pub fn kill_space(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed} ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_by_name() {
        let mut settings = Settings::default();
        settings.set("ConvUmlauts", "1").unwrap();
        settings.set("killspace", "TRUE").unwrap();
        settings.set("writeoutput", "0").unwrap();
        assert!(settings.convert_umlauts);
        assert!(settings.kill_space);
        assert!(!settings.write_output);
    }

    #[test]
    fn set_rejects_unknown() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.set("colour", "1").map_err(|e| e.code()),
            Err(8)
        );
        assert_eq!(
            settings.set("killspace", "yes").map_err(|e| e.code()),
            Err(7)
        );
    }

    #[test]
    fn post_processing() {
        assert_eq!(convert_umlauts("Grüße aus Köln"), "Gr&uuml;&szlig;e aus K&ouml;ln");
        assert_eq!(kill_space("   a  b \n"), "a  b ");
        assert_eq!(kill_space(" \t\n"), "");

        let settings = Settings {
            convert_umlauts: true,
            kill_space: true,
            write_output: true,
        };
        assert_eq!(settings.apply("  Ä\n"), "&Auml; ");
    }

    #[test]
    fn config_from_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [settings]
            kill_space = true

            [limits]
            max_include_depth = 4

            [macros]
            site = "example.org"
            "#,
        )
        .unwrap();
        assert!(config.settings.kill_space);
        assert!(config.settings.write_output);
        assert_eq!(config.limits.max_include_depth, 4);
        assert_eq!(config.limits.max_arguments, 32);
        assert_eq!(config.macros.get("site").map(String::as_str), Some("example.org"));
    }
}
