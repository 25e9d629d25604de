//! Splitting migration scripts into statements.
//!
//! Drivers execute statements one at a time so a failure can be pinned to
//! a position in the script and nothing after it runs. Splitting on a
//! delimiter is a heuristic that only works if string literals, quoted
//! identifiers and comments are skipped, and which of those exist is a
//! property of the SQL dialect, so each backend picks its own [`Splitter`].

/// A strategy turning a script into executable statements.
pub trait Splitter: Send + Sync {
    fn split(&self, source: &str) -> Result<Vec<Statement>, SplitError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based position within the script.
    pub index: usize,
    /// 1-based line on which the statement's first token appears.
    pub line: usize,
    pub text: String,
}

impl Statement {
    /// Whether the statement opens or ends a transaction itself, or refuses
    /// to run inside one. Scripts containing such a statement are run as
    /// written instead of inside a wrapping transaction.
    pub fn controls_transaction(&self) -> bool {
        let words = leading_keywords(&self.text, 8);
        let first = words.first().map(String::as_str).unwrap_or("");
        match first {
            "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" | "VACUUM" => true,
            "CREATE" | "DROP" | "REINDEX" => {
                words.iter().any(|w| w == "CONCURRENTLY")
                    || words.get(1).map(String::as_str) == Some("DATABASE")
            }
            _ => false,
        }
    }
}

// Upper-cased words at the start of `text`, after any leading comments.
fn leading_keywords(text: &str, n: usize) -> Vec<String> {
    let mut rest = text.trim_start();
    loop {
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map(|(_, r)| r).unwrap_or("");
        } else {
            break;
        }
        rest = rest.trim_start();
    }
    rest.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .take(n)
        .map(str::to_ascii_uppercase)
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("unterminated {quote} quoted literal opened on line {line}")]
    UnterminatedQuote { quote: char, line: usize },

    #[error("unterminated block comment opened on line {line}")]
    UnterminatedComment { line: usize },

    #[error("unterminated dollar quoted string {tag} opened on line {line}")]
    UnterminatedDollarQuote { tag: String, line: usize },

    #[error("script is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },
}

/// Lexical rules of one SQL dialect, enough to find statement boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialect {
    pub name: &'static str,
    /// Statement terminator.
    pub delimiter: char,
    pub backtick_quotes: bool,
    pub backslash_escapes: bool,
    /// `E'...'` literals take backslash escapes even when plain ones don't.
    pub escape_string_prefix: bool,
    pub hash_comments: bool,
    pub nested_block_comments: bool,
    pub dollar_quotes: bool,
    /// Delimiters between `BEGIN`/`CASE` and `END` inside `CREATE TRIGGER`,
    /// `PROCEDURE`, `FUNCTION` or `EVENT` do not end the statement.
    pub compound_blocks: bool,
    /// A `DELIMITER <token>` line switches the terminator until the next
    /// such line, the way the mysql client does.
    pub delimiter_directive: bool,
}

pub static SQLITE: Dialect = Dialect {
    name: "sqlite",
    delimiter: ';',
    backtick_quotes: true,
    backslash_escapes: false,
    escape_string_prefix: false,
    hash_comments: false,
    nested_block_comments: false,
    dollar_quotes: false,
    compound_blocks: true,
    delimiter_directive: false,
};

pub static MYSQL: Dialect = Dialect {
    name: "mysql",
    delimiter: ';',
    backtick_quotes: true,
    backslash_escapes: true,
    escape_string_prefix: false,
    hash_comments: true,
    nested_block_comments: false,
    dollar_quotes: false,
    compound_blocks: true,
    delimiter_directive: true,
};

pub static POSTGRESQL: Dialect = Dialect {
    name: "postgresql",
    delimiter: ';',
    backtick_quotes: false,
    backslash_escapes: false,
    escape_string_prefix: true,
    hash_comments: false,
    nested_block_comments: true,
    dollar_quotes: true,
    compound_blocks: true,
    delimiter_directive: false,
};

impl Splitter for Dialect {
    fn split(&self, source: &str) -> Result<Vec<Statement>, SplitError> {
        let mut scan = Scan {
            dialect: self,
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            start: 0,
            first_token_line: None,
            statements: vec![],
            delimiter: self.delimiter.to_string(),
            words: 0,
            creates: false,
            routine: false,
            depth: 0,
            after_end: false,
        };
        scan.run()?;
        Ok(scan.statements)
    }
}

// Every boundary the scanner cuts at is an ASCII byte, so slicing `source`
// at those offsets always lands on a char boundary.
struct Scan<'a> {
    dialect: &'a Dialect,
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    start: usize,
    first_token_line: Option<usize>,
    statements: Vec<Statement>,
    // The terminator in force, changed by DELIMITER lines.
    delimiter: String,
    // Keyword tracking for the statement being scanned.
    words: usize,
    creates: bool,
    routine: bool,
    depth: usize,
    after_end: bool,
}

impl<'a> Scan<'a> {
    fn run(&mut self) -> Result<(), SplitError> {
        while self.pos < self.bytes.len() {
            if self.at_line_start() && self.delimiter_directive_line() {
                continue;
            }
            if let Some(len) = self.delimiter_here() {
                self.push(self.pos);
                self.pos += len;
                self.start = self.pos;
                continue;
            }
            let b = self.bytes[self.pos];
            match b {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'\'' | b'"' => {
                    self.token();
                    self.skip_quoted(b, self.dialect.backslash_escapes)?;
                }
                b'`' if self.dialect.backtick_quotes => {
                    self.token();
                    self.skip_quoted(b, false)?;
                }
                b'-' if self.peek(1) == Some(b'-') => self.skip_line_comment(),
                b'#' if self.dialect.hash_comments => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment()?,
                b'$' if self.dialect.dollar_quotes => {
                    self.token();
                    self.skip_dollar_quoted()?;
                }
                _ if b.is_ascii_alphabetic() || b == b'_' => {
                    self.token();
                    self.word()?;
                }
                _ if b.is_ascii_whitespace() => self.pos += 1,
                _ => {
                    self.token();
                    self.pos += 1;
                }
            }
        }
        self.push(self.bytes.len());
        Ok(())
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn token(&mut self) {
        if self.first_token_line.is_none() {
            self.first_token_line = Some(self.line);
        }
    }

    // Statements made only of whitespace and comments are dropped.
    fn push(&mut self, end: usize) {
        if let Some(line) = self.first_token_line.take() {
            let text = self.source[self.start..end].trim();
            self.statements.push(Statement {
                index: self.statements.len() + 1,
                line,
                text: text.to_string(),
            });
        }
        self.words = 0;
        self.creates = false;
        self.routine = false;
        self.depth = 0;
        self.after_end = false;
    }

    fn at_line_start(&self) -> bool {
        self.pos == 0 || self.bytes[self.pos - 1] == b'\n'
    }

    // Length of the terminator if one starts at `pos`. A custom terminator
    // set by DELIMITER always splits; the default one not inside a
    // compound block.
    fn delimiter_here(&self) -> Option<usize> {
        let custom = self.delimiter.len() != 1
            || !self.delimiter.starts_with(self.dialect.delimiter);
        if self.depth > 0 && !custom {
            return None;
        }
        if self.bytes[self.pos..].starts_with(self.delimiter.as_bytes()) {
            Some(self.delimiter.len())
        } else {
            None
        }
    }

    // Only recognised between statements, so a column named `delimiter`
    // is left alone.
    fn delimiter_directive_line(&mut self) -> bool {
        if !self.dialect.delimiter_directive || self.first_token_line.is_some() {
            return false;
        }
        let end = self.source[self.pos..]
            .find('\n')
            .map(|n| self.pos + n)
            .unwrap_or(self.bytes.len());
        let source = self.source;
        let line = source[self.pos..end].trim();
        let token = match line.split_once(char::is_whitespace) {
            Some((keyword, token)) if keyword.eq_ignore_ascii_case("delimiter") => token.trim(),
            _ => return false,
        };
        if token.is_empty() {
            return false;
        }
        self.delimiter = token.to_string();
        self.pos = end;
        self.start = end;
        true
    }

    fn word(&mut self) -> Result<(), SplitError> {
        let begin = self.pos;
        while self
            .peek(0)
            .map(|b| b.is_ascii_alphanumeric() || b == b'_')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        let source = self.source;
        let word = &source[begin..self.pos];

        if self.dialect.escape_string_prefix
            && word.eq_ignore_ascii_case("e")
            && self.peek(0) == Some(b'\'')
        {
            return self.skip_quoted(b'\'', true);
        }
        if !self.dialect.compound_blocks {
            return Ok(());
        }

        self.words += 1;
        let after_end = std::mem::take(&mut self.after_end);
        if self.words == 1 {
            self.creates = word.eq_ignore_ascii_case("create");
            return Ok(());
        }
        if !self.creates {
            return Ok(());
        }
        let upper = word.to_ascii_uppercase();
        match upper.as_str() {
            "TRIGGER" | "PROCEDURE" | "FUNCTION" | "EVENT" if self.depth == 0 => {
                self.routine = true
            }
            "BEGIN" | "CASE" if self.routine && !after_end => self.depth += 1,
            // IF, LOOP, WHILE and REPEAT blocks are not counted, so neither
            // is the END closing them.
            "END" if self.depth > 0 => {
                let closes = self.next_word().to_ascii_uppercase();
                if !matches!(closes.as_str(), "IF" | "LOOP" | "WHILE" | "REPEAT") {
                    self.depth -= 1;
                }
                self.after_end = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn next_word(&self) -> &'a str {
        let source = self.source;
        let rest = source[self.pos..].trim_start_matches(|c: char| c.is_ascii_whitespace());
        let len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        &rest[..len]
    }

    fn skip_quoted(&mut self, quote: u8, backslash_escapes: bool) -> Result<(), SplitError> {
        let opened_on = self.line;
        let mut i = self.pos + 1;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\n' => self.line += 1,
                b'\\' if backslash_escapes => {
                    if self.bytes.get(i + 1) == Some(&b'\n') {
                        self.line += 1;
                    }
                    i += 2;
                    continue;
                }
                b if b == quote => {
                    // A doubled quote is an escaped quote.
                    if self.bytes.get(i + 1) == Some(&quote) {
                        i += 2;
                        continue;
                    }
                    self.pos = i + 1;
                    return Ok(());
                }
                _ => {}
            }
            i += 1;
        }
        Err(SplitError::UnterminatedQuote {
            quote: quote as char,
            line: opened_on,
        })
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), SplitError> {
        let opened_on = self.line;
        let mut depth = 0usize;
        let mut i = self.pos;
        while i < self.bytes.len() {
            match (self.bytes[i], self.bytes.get(i + 1).copied()) {
                (b'/', Some(b'*')) if depth == 0 || self.dialect.nested_block_comments => {
                    depth += 1;
                    i += 2;
                }
                (b'*', Some(b'/')) => {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        self.pos = i;
                        return Ok(());
                    }
                }
                (b'\n', _) => {
                    self.line += 1;
                    i += 1;
                }
                _ => i += 1,
            }
        }
        Err(SplitError::UnterminatedComment { line: opened_on })
    }

    // $$ ... $$ or $tag$ ... $tag$. A `$` not opening a tag (e.g. the
    // positional parameter `$1`) is ordinary text.
    fn skip_dollar_quoted(&mut self) -> Result<(), SplitError> {
        let rest = &self.source[self.pos + 1..];
        let tag_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        let starts_like_identifier = rest
            .bytes()
            .next()
            .map(|b| !b.is_ascii_digit())
            .unwrap_or(false);
        if rest.as_bytes().get(tag_len) != Some(&b'$') || (tag_len > 0 && !starts_like_identifier)
        {
            self.pos += 1;
            return Ok(());
        }

        let tag = &self.source[self.pos..self.pos + tag_len + 2];
        let body_start = self.pos + tag.len();
        match self.source[body_start..].find(tag) {
            Some(n) => {
                let end = body_start + n + tag.len();
                self.line += self.source[self.pos..end].matches('\n').count();
                self.pos = end;
                Ok(())
            }
            None => Err(SplitError::UnterminatedDollarQuote {
                tag: tag.to_string(),
                line: self.line,
            }),
        }
    }
}
