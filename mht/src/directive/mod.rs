mod keyword;

pub use keyword::Keyword;

/// The character that introduces a directive and prefixes a macro name.
pub const MARKER: char = '#';

/// One physical template line, classified by its leading token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// Content to be macro-expanded and written out. Includes lines that
    /// start with `#` but do not name a known keyword.
    Literal(&'a str),
    /// A keyword prefixed by more than one marker (`##def ...`). The line is
    /// treated as data for one more pass: it is emitted with one marker
    /// removed instead of being executed.
    Delayed(String),
    /// A directive to execute. `rest` is everything after the keyword,
    /// line terminator included.
    Directive { keyword: Keyword, rest: &'a str },
}

impl<'a> Line<'a> {
    pub fn parse(line: &'a str) -> Line<'a> {
        let body = line.trim_start();
        let fence = fence(body);
        if fence == 0 {
            return Line::Literal(line);
        }

        let after_markers = &body[fence..];
        let word_end = after_markers
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(after_markers.len());

        let Some(keyword) = Keyword::lookup(&after_markers[..word_end]) else {
            return Line::Literal(line);
        };

        if fence > 1 {
            let indent = line.len() - body.len();
            let mut delayed = String::with_capacity(line.len());
            delayed.push_str(&line[..indent]);
            delayed.push_str(&body[MARKER.len_utf8()..]);
            return Line::Delayed(delayed);
        }

        Line::Directive {
            keyword,
            rest: &after_markers[word_end..],
        }
    }
}

/// Number of consecutive markers at the start of `text`.
pub fn fence(text: &str) -> usize {
    text.chars().take_while(|&c| c == MARKER).count()
}

/// Strip a trailing `\n`, `\r\n` or `\r`.
pub fn strip_terminator(text: &str) -> &str {
    text.trim_end_matches(['\n', '\r'])
}

/// Split off the first whitespace-delimited word of a directive's arguments.
/// Returns the word and whatever follows it.
pub fn first_word(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some((&rest[..end], &rest[end..]))
}

/// The remainder of a directive line as one argument: leading whitespace
/// skipped, line terminator dropped. `None` when nothing is left.
pub fn remainder(rest: &str) -> Option<&str> {
    let text = strip_terminator(rest.trim_start_matches([' ', '\t']));
    if text.is_empty() { None } else { Some(text) }
}

/// The verbatim text argument of `#echo`/`#write`: only the single separator
/// after the keyword is dropped, further whitespace is kept.
pub fn text_argument(rest: &str) -> Option<&str> {
    let text = rest
        .strip_prefix([' ', '\t'])
        .unwrap_or(rest);
    let text = strip_terminator(text);
    if text.is_empty() { None } else { Some(text) }
}
