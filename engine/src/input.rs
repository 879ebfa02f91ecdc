//! Values that enter the macro table from outside a template: the standard
//! macros, environment variables and request input.

use chrono::{Datelike, NaiveDateTime, Timelike};
use tracing::debug;

use crate::executor::Engine;

/// The request variables a web server hands to a CGI program.
pub const CGI_VARIABLES: [&str; 22] = [
    "DOCUMENT_ROOT",
    "HTTP_COOKIE",
    "HTTP_HOST",
    "HTTP_REFERER",
    "HTTP_USER_AGENT",
    "HTTPS",
    "PATH_INFO",
    "PATH_TRANSLATED",
    "QUERY_STRING",
    "REMOTE_ADDR",
    "REMOTE_HOST",
    "REMOTE_PORT",
    "REMOTE_USER",
    "REQUEST_METHOD",
    "REQUEST_URI",
    "SCRIPT_FILENAME",
    "SCRIPT_NAME",
    "SERVER_ADMIN",
    "SERVER_NAME",
    "SERVER_PORT",
    "SERVER_SOFTWARE",
    "SERVER_PROTOCOL",
];

const GERMAN_WEEKDAYS: [&str; 7] = [
    "Montag",
    "Dienstag",
    "Mittwoch",
    "Donnerstag",
    "Freitag",
    "Samstag",
    "Sonntag",
];

const GERMAN_MONTHS: [&str; 12] = [
    "Januar",
    "Februar",
    "März",
    "April",
    "Mai",
    "Juni",
    "Juli",
    "August",
    "September",
    "Oktober",
    "November",
    "Dezember",
];

/// Macros every engine starts with. Dates and times are taken from `now`.
pub fn standard_macros(now: NaiveDateTime) -> Vec<(&'static str, String)> {
    let weekday = now.weekday().num_days_from_monday() as usize;
    let month = now.month0() as usize;
    vec![
        ("short_date", now.format("%m/%d/%Y").to_string()),
        ("kurzes_datum", now.format("%d.%m.%Y").to_string()),
        ("long_date", now.format("%A, %B %-d, %Y").to_string()),
        (
            "langes_datum",
            format!(
                "{}, {}. {} {}",
                GERMAN_WEEKDAYS[weekday],
                now.day(),
                GERMAN_MONTHS[month],
                now.year()
            ),
        ),
        ("time", format!("{}:{:02}", now.hour(), now.minute())),
        ("crlf", "\n".to_string()),
        ("space", " ".to_string()),
        ("tab", "\t".to_string()),
        ("null", String::new()),
        (
            "mht_version_msg",
            format!("MHT macro processor version {}", env!("CARGO_PKG_VERSION")),
        ),
    ]
}

/// Decode an `application/x-www-form-urlencoded` string into ordered pairs.
pub fn decode_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .into_owned()
        .collect()
}

impl Engine {
    /// Define `name` from environment variable `var`. Returns whether the
    /// variable was set.
    pub fn register_env(&mut self, var: &str, name: &str) -> bool {
        match std::env::var(var) {
            Ok(value) => {
                self.define_macro(name, &value);
                true
            }
            Err(_) => false,
        }
    }

    /// Define request input as macros. Empty values are skipped; a name that
    /// is already defined collects its values separated by commas, the way
    /// a group of checkboxes submits.
    pub fn register_input<I, K, V>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in pairs {
            let (name, value) = (name.as_ref(), value.as_ref());
            if value.is_empty() {
                continue;
            }
            let combined = match self.lookup_macro(name) {
                Some(existing) => format!("{existing},{value}"),
                None => value.to_string(),
            };
            debug!(name, "registered input");
            self.define_macro(name, &combined);
        }
    }

    /// Define every CGI request variable that is set in the environment.
    pub fn register_cgi_environment(&mut self) -> usize {
        CGI_VARIABLES
            .iter()
            .filter(|var| self.register_env(var, var))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn lookup<'a>(macros: &'a [(&'static str, String)], name: &str) -> &'a str {
        macros
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn standard_dates() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(9, 7, 0)
            .unwrap();
        let macros = standard_macros(now);
        assert_eq!(lookup(&macros, "short_date"), "03/05/2024");
        assert_eq!(lookup(&macros, "kurzes_datum"), "05.03.2024");
        assert_eq!(lookup(&macros, "long_date"), "Tuesday, March 5, 2024");
        assert_eq!(lookup(&macros, "langes_datum"), "Dienstag, 5. März 2024");
        assert_eq!(lookup(&macros, "time"), "9:07");
        assert_eq!(lookup(&macros, "crlf"), "\n");
        assert_eq!(lookup(&macros, "null"), "");
    }

    #[test]
    fn query_decoding() {
        assert_eq!(
            decode_query("?name=J%C3%BCrgen+M&color=red&color=blue&empty="),
            vec![
                ("name".to_string(), "Jürgen M".to_string()),
                ("color".to_string(), "red".to_string()),
                ("color".to_string(), "blue".to_string()),
                ("empty".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn input_concatenates_duplicates() {
        let mut engine = Engine::new();
        engine.register_input(decode_query("color=red&color=blue&empty=&x=1"));
        assert_eq!(engine.lookup_macro("color"), Some("red,blue"));
        assert_eq!(engine.lookup_macro("empty"), None);
        assert_eq!(engine.lookup_macro("x"), Some("1"));
    }
}
