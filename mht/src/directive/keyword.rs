use std::fmt;

/// A directive keyword, the word directly after the leading `#`.
///
/// Keywords are matched case-insensitively: `#IF`, `#If` and `#if` are the
/// same directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Begin,
    Def,
    Defex,
    Echo,
    Echoln,
    Elif,
    Else,
    End,
    Endif,
    File,
    If,
    Include,
    Loop,
    Mhtexit,
    Mhtfile,
    Mhtvar,
    Pause,
    Process,
    Undef,
    Undefblock,
    Write,
    Writeln,
}

impl Keyword {
    /// Every keyword, in alphabetical order.
    pub const ALL: [Keyword; 22] = [
        Keyword::Begin,
        Keyword::Def,
        Keyword::Defex,
        Keyword::Echo,
        Keyword::Echoln,
        Keyword::Elif,
        Keyword::Else,
        Keyword::End,
        Keyword::Endif,
        Keyword::File,
        Keyword::If,
        Keyword::Include,
        Keyword::Loop,
        Keyword::Mhtexit,
        Keyword::Mhtfile,
        Keyword::Mhtvar,
        Keyword::Pause,
        Keyword::Process,
        Keyword::Undef,
        Keyword::Undefblock,
        Keyword::Write,
        Keyword::Writeln,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Begin => "begin",
            Keyword::Def => "def",
            Keyword::Defex => "defex",
            Keyword::Echo => "echo",
            Keyword::Echoln => "echoln",
            Keyword::Elif => "elif",
            Keyword::Else => "else",
            Keyword::End => "end",
            Keyword::Endif => "endif",
            Keyword::File => "file",
            Keyword::If => "if",
            Keyword::Include => "include",
            Keyword::Loop => "loop",
            Keyword::Mhtexit => "mhtexit",
            Keyword::Mhtfile => "mhtfile",
            Keyword::Mhtvar => "mhtvar",
            Keyword::Pause => "pause",
            Keyword::Process => "process",
            Keyword::Undef => "undef",
            Keyword::Undefblock => "undefblock",
            Keyword::Write => "write",
            Keyword::Writeln => "writeln",
        }
    }

    /// Look up a keyword by name, ignoring ASCII case.
    pub fn lookup(word: &str) -> Option<Keyword> {
        Keyword::ALL
            .iter()
            .copied()
            .find(|keyword| keyword.as_str().eq_ignore_ascii_case(word))
    }

    /// `#if`, `#elif`, `#else` and `#endif` are evaluated even inside a
    /// false branch so that nesting stays balanced.
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            Keyword::If | Keyword::Elif | Keyword::Else | Keyword::Endif
        )
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.as_str())
    }
}
