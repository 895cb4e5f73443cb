//! Migration file parser: directive handling and statement splitting.
//!
//! A migration file is plain SQL annotated with `-- + nomad <directive>`
//! comment lines that carve it into an up section and a down section. The
//! SQL inside each section is split into individual statements by a
//! single-pass scanner that understands comments, string literals, dollar
//! quoting and `COPY ... FROM STDIN` data blocks, and records the 1-based
//! line and column of every statement for error reporting.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^--\s*\+\s*nomad\s+(.+?)\s*$").unwrap())
}

fn copy_stdin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^COPY\s+.*?\bFROM\s+STDIN\b").unwrap())
}

/// One executable statement and where it starts in the original file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    /// 1-based line of the statement's first meaningful character.
    pub line: u32,
    /// 1-based column of the statement's first meaningful character.
    pub column: u32,
}

/// One direction of a migration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    pub statements: Vec<Statement>,
    pub no_transaction: bool,
}

/// The parsed form of a migration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedMigration {
    pub up: Section,
    pub down: Section,
    /// Lowercase tags attached with `-- + nomad tags: ...`.
    pub tags: BTreeSet<String>,
    /// Legacy whole-file flag: a `notx` directive outside any section.
    /// Coexists with the per-section flags and is not folded into them.
    pub no_transaction_file: bool,
}

impl ParsedMigration {
    /// Effective non-transactional flag for a section, honouring the legacy
    /// whole-file directive.
    pub fn section_no_transaction(&self, section: &Section) -> bool {
        self.no_transaction_file || section.no_transaction
    }

    /// Whether the file matches a tag query: any requested tag intersects,
    /// or `only_tagged` and the file carries at least one tag.
    pub fn matches_tags(&self, tags: Option<&BTreeSet<String>>, only_tagged: bool) -> bool {
        if let Some(wanted) = tags {
            if wanted.iter().any(|t| self.tags.contains(t)) {
                return true;
            }
        }
        only_tagged && !self.tags.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum SectionKind {
    Up,
    Down,
}

/// Parse a migration file. Never fails: unterminated constructs are
/// consumed greedily to end of file and the database reports the problem.
pub fn parse(text: &str) -> ParsedMigration {
    let text = normalize(text);

    let mut parsed = ParsedMigration::default();
    let mut current: Option<SectionKind> = None;
    let mut chunk = String::new();
    let mut chunk_base: u32 = 0;
    let mut block: Option<BlockState> = None;

    for (idx, raw_line) in text.split('\n').enumerate() {
        let line_no = (idx + 1) as u32;

        if let Some(state) = block.as_mut() {
            if state.consume_line(raw_line) {
                if let Some(state) = block.take() {
                    state.finish(current, &mut parsed);
                }
            }
            continue;
        }

        let Some(directive) = directive_re()
            .captures(raw_line)
            .map(|caps| caps[1].to_string())
        else {
            // plain content: buffered when a section is active, ignored otherwise
            if current.is_some() {
                push_line(&mut chunk, &mut chunk_base, line_no, raw_line);
            }
            continue;
        };

        let lower = directive.to_lowercase();
        let word = lower.split_whitespace().next().unwrap_or("");
        match word {
            "up" => {
                flush(&mut chunk, &mut chunk_base, current, &mut parsed);
                current = Some(SectionKind::Up);
            }
            "down" => {
                flush(&mut chunk, &mut chunk_base, current, &mut parsed);
                current = Some(SectionKind::Down);
            }
            _ if lower == "notx" || lower.split_whitespace().eq(["no", "transaction"]) => {
                match current {
                    Some(SectionKind::Up) => parsed.up.no_transaction = true,
                    Some(SectionKind::Down) => parsed.down.no_transaction = true,
                    None => parsed.no_transaction_file = true,
                }
                blank_line(&mut chunk, current);
            }
            "block" => {
                flush(&mut chunk, &mut chunk_base, current, &mut parsed);
                block = Some(BlockState::starting_after(line_no));
            }
            "endblock" => {
                // stray endblock outside a block, nothing to close
                blank_line(&mut chunk, current);
            }
            _ if word.starts_with("tags") => {
                let list = directive
                    .splitn(2, |c: char| c == ':' || c.is_whitespace())
                    .nth(1)
                    .unwrap_or("");
                for tag in list.split(|c: char| c == ',' || c.is_whitespace()) {
                    if !tag.is_empty() {
                        parsed.tags.insert(tag.to_lowercase());
                    }
                }
                blank_line(&mut chunk, current);
            }
            _ => {
                log::warn!("ignoring unknown nomad directive: {}", directive);
                blank_line(&mut chunk, current);
            }
        }
    }

    if let Some(state) = block.take() {
        // unterminated block, consumed greedily to end of file
        state.finish(current, &mut parsed);
    }
    flush(&mut chunk, &mut chunk_base, current, &mut parsed);

    parsed
}

/// Strip a single leading U+FEFF and fold `\r\n` to `\n`. Bare `\r` is left
/// alone here; only the checksum normalizer folds it.
fn normalize(text: &str) -> String {
    text.strip_prefix('\u{FEFF}').unwrap_or(text).replace("\r\n", "\n")
}

fn directive_word(line: &str) -> Option<String> {
    directive_re().captures(line).map(|caps| {
        caps[1]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase()
    })
}

fn push_line(chunk: &mut String, chunk_base: &mut u32, line_no: u32, line: &str) {
    if chunk.is_empty() {
        *chunk_base = line_no;
    }
    chunk.push_str(line);
    chunk.push('\n');
}

// A consumed directive line inside a section leaves a blank line in the
// buffer so later statements keep their original line numbers.
fn blank_line(chunk: &mut String, current: Option<SectionKind>) {
    if current.is_some() && !chunk.is_empty() {
        chunk.push('\n');
    }
}

fn flush(
    chunk: &mut String,
    chunk_base: &mut u32,
    current: Option<SectionKind>,
    parsed: &mut ParsedMigration,
) {
    if chunk.is_empty() {
        return;
    }
    if let Some(kind) = current {
        let statements = split_statements_from(chunk, *chunk_base);
        let section = match kind {
            SectionKind::Up => &mut parsed.up,
            SectionKind::Down => &mut parsed.down,
        };
        section.statements.extend(statements);
    }
    chunk.clear();
    *chunk_base = 0;
}

struct BlockState {
    depth: usize,
    buf: String,
    base: u32,
}

impl BlockState {
    fn starting_after(directive_line: u32) -> Self {
        BlockState {
            depth: 1,
            buf: String::new(),
            base: directive_line + 1,
        }
    }

    fn push(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    /// Feed one line; returns true when the outermost block just closed.
    /// Inner block/endblock directive lines stay literal content.
    fn consume_line(&mut self, line: &str) -> bool {
        match directive_word(line).as_deref() {
            Some("block") => {
                self.depth += 1;
                self.push(line);
                false
            }
            Some("endblock") => {
                self.depth -= 1;
                if self.depth == 0 {
                    true
                } else {
                    self.push(line);
                    false
                }
            }
            _ => {
                self.push(line);
                false
            }
        }
    }

    fn finish(self, current: Option<SectionKind>, parsed: &mut ParsedMigration) {
        let Some(kind) = current else { return };
        let Some((dline, col, _)) = meaningful_position(&self.buf) else {
            return;
        };
        let sql = self.buf.trim().to_string();
        if sql.is_empty() {
            return;
        }
        let section = match kind {
            SectionKind::Up => &mut parsed.up,
            SectionKind::Down => &mut parsed.down,
        };
        section.statements.push(Statement {
            sql,
            line: self.base + dline,
            column: col,
        });
    }
}

/// Split a run of SQL text into statements, positions relative to line 1.
pub fn split_statements(text: &str) -> Vec<Statement> {
    split_statements_from(text, 1)
}

fn split_statements_from(src: &str, base_line: u32) -> Vec<Statement> {
    let mut sc = Scanner::new(src, base_line);
    let mut out = Vec::new();

    loop {
        let start = sc.pos;
        let mut meaningful: Option<(u32, u32)> = None;
        let mut end: Option<usize> = None;

        loop {
            let Some(c) = sc.peek() else { break };

            if sc.starts_with("--") {
                sc.consume_line_comment();
                continue;
            }
            if sc.starts_with("/*") {
                sc.consume_block_comment();
                continue;
            }
            match c {
                '\'' => {
                    sc.mark(&mut meaningful);
                    sc.consume_quoted('\'', false);
                }
                '"' => {
                    sc.mark(&mut meaningful);
                    sc.consume_quoted('"', false);
                }
                'e' | 'E' if sc.peek_at(1) == Some('\'') && !sc.prev_ident => {
                    sc.mark(&mut meaningful);
                    sc.bump();
                    sc.consume_quoted('\'', true);
                }
                'b' | 'B' | 'x' | 'X' if sc.peek_at(1) == Some('\'') && !sc.prev_ident => {
                    sc.mark(&mut meaningful);
                    sc.bump();
                    sc.consume_quoted('\'', false);
                }
                'u' | 'U'
                    if sc.peek_at(1) == Some('&')
                        && sc.peek_at(2) == Some('\'')
                        && !sc.prev_ident =>
                {
                    sc.mark(&mut meaningful);
                    sc.bump();
                    sc.bump();
                    sc.consume_quoted('\'', false);
                }
                '$' => {
                    sc.mark(&mut meaningful);
                    if !sc.try_consume_dollar_quote() {
                        sc.bump();
                    }
                }
                ';' => {
                    if is_copy_from_stdin(&src[start..sc.pos]) {
                        sc.bump();
                        sc.consume_copy_data();
                        end = Some(sc.pos);
                    } else {
                        end = Some(sc.pos);
                        sc.bump();
                    }
                    break;
                }
                _ => {
                    if !c.is_whitespace() {
                        sc.mark(&mut meaningful);
                    }
                    sc.bump();
                }
            }
        }

        let end = end.unwrap_or(sc.pos);
        if let Some((line, column)) = meaningful {
            let sql = src[start..end].trim().to_string();
            if !sql.is_empty() {
                out.push(Statement { sql, line, column });
            }
        }
        if sc.peek().is_none() {
            break;
        }
    }

    out
}

fn is_copy_from_stdin(body: &str) -> bool {
    match meaningful_position(body) {
        Some((_, _, offset)) => copy_stdin_re().is_match(&body[offset..]),
        None => false,
    }
}

/// Locate the first character that is neither whitespace nor part of a
/// comment: `(line offset from start, 1-based column, byte offset)`.
fn meaningful_position(src: &str) -> Option<(u32, u32, usize)> {
    let mut sc = Scanner::new(src, 1);
    loop {
        let c = sc.peek()?;
        if sc.starts_with("--") {
            sc.consume_line_comment();
            continue;
        }
        if sc.starts_with("/*") {
            sc.consume_block_comment();
            continue;
        }
        if c.is_whitespace() {
            sc.bump();
            continue;
        }
        return Some((sc.line - 1, sc.col, sc.pos));
    }
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    col: u32,
    prev_ident: bool,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str, base_line: u32) -> Self {
        Scanner {
            src,
            pos: 0,
            line: base_line,
            col: 1,
            prev_ident: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.src[self.pos..].starts_with(pat)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.prev_ident = c.is_ascii_alphanumeric() || c == '_';
        Some(c)
    }

    fn mark(&self, meaningful: &mut Option<(u32, u32)>) {
        if meaningful.is_none() {
            *meaningful = Some((self.line, self.col));
        }
    }

    // leaves the trailing newline for the caller
    fn consume_line_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn consume_block_comment(&mut self) {
        self.bump();
        self.bump();
        let mut depth = 1usize;
        while depth > 0 {
            if self.starts_with("/*") {
                self.bump();
                self.bump();
                depth += 1;
            } else if self.starts_with("*/") {
                self.bump();
                self.bump();
                depth -= 1;
            } else if self.bump().is_none() {
                break;
            }
        }
    }

    /// Consume a quoted region starting at the opening quote. The quote
    /// character doubled escapes itself; `backslash` additionally treats
    /// `\x` as an escape pair (PostgreSQL `E'...'` literals). Unterminated
    /// regions run to end of input.
    fn consume_quoted(&mut self, quote: char, backslash: bool) {
        self.bump();
        while let Some(c) = self.peek() {
            if c == quote {
                if self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                } else {
                    self.bump();
                    return;
                }
            } else if backslash && c == '\\' {
                self.bump();
                self.bump();
            } else {
                self.bump();
            }
        }
    }

    /// At a `$`: if it opens a `$tag$` quote, consume through the matching
    /// close sentinel and return true. The close must be the exact tag.
    fn try_consume_dollar_quote(&mut self) -> bool {
        let rest = &self.src[self.pos + 1..];
        let tag_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if rest.as_bytes().get(tag_len) != Some(&b'$') {
            return false;
        }
        let sentinel = self.src[self.pos..self.pos + tag_len + 2].to_string();
        for _ in 0..sentinel.chars().count() {
            self.bump();
        }
        loop {
            if self.starts_with(&sentinel) {
                for _ in 0..sentinel.chars().count() {
                    self.bump();
                }
                return true;
            }
            if self.bump().is_none() {
                return true;
            }
        }
    }

    /// Consume a `COPY ... FROM STDIN` data block: everything up to and
    /// including the line consisting solely of `\.`, or end of input.
    fn consume_copy_data(&mut self) {
        loop {
            let line_start = self.pos;
            while let Some(c) = self.peek() {
                if c == '\n' {
                    break;
                }
                self.bump();
            }
            let terminated = &self.src[line_start..self.pos] == "\\.";
            if self.peek().is_some() {
                self.bump();
            } else if !terminated {
                return;
            }
            if terminated {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, split_statements};

    #[test]
    fn splits_on_semicolons() {
        let stmts = split_statements("CREATE TABLE a(id INT);\nCREATE TABLE b(id INT);\n");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].sql, "CREATE TABLE a(id INT)");
        assert_eq!(stmts[1].sql, "CREATE TABLE b(id INT)");
        assert_eq!((stmts[0].line, stmts[0].column), (1, 1));
        assert_eq!((stmts[1].line, stmts[1].column), (2, 1));
    }

    #[test]
    fn trailing_text_without_terminator_is_a_statement() {
        let stmts = split_statements("SELECT 1;\nSELECT 2");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].sql, "SELECT 2");
    }

    #[test]
    fn semicolons_inside_strings_do_not_split() {
        let stmts = split_statements("INSERT INTO t VALUES ('a;b');\nSELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].sql, "INSERT INTO t VALUES ('a;b')");
    }

    #[test]
    fn doubled_quotes_escape() {
        let stmts = split_statements("INSERT INTO t VALUES ('it''s; fine');");
        assert_eq!(stmts.len(), 1);

        let stmts = split_statements("SELECT \"odd\"\"name;\" FROM t;");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn e_strings_honour_backslash_escapes() {
        let stmts = split_statements(r"INSERT INTO t VALUES (E'a\';b');SELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].sql, r"INSERT INTO t VALUES (E'a\';b')");
    }

    #[test]
    fn prefixed_literals_are_quoted_regions() {
        let stmts = split_statements("SELECT B'1010;', X'ff;', U&'d;u' FROM t;SELECT 2;");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn identifier_ending_in_e_is_not_an_e_string() {
        // if the quote after `tabe` were treated as an escape string, the
        // backslash would swallow the closing quote and eat the rest of
        // the input
        let stmts = split_statements(r"SELECT tabe'\';SELECT 1;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].sql, "SELECT 1");
    }

    #[test]
    fn line_comments_do_not_terminate() {
        let stmts = split_statements("SELECT 1 -- trailing; not a terminator\n+ 2;");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].sql, "SELECT 1 -- trailing; not a terminator\n+ 2");
    }

    #[test]
    fn block_comments_nest() {
        let stmts = split_statements("/* outer /* inner; */ still; */ SELECT 1;");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].sql, "/* outer /* inner; */ still; */ SELECT 1");
    }

    #[test]
    fn statement_position_skips_leading_comments() {
        let stmts = split_statements("-- a comment\n/* more */\n  SELECT 1;");
        assert_eq!(stmts.len(), 1);
        assert_eq!((stmts[0].line, stmts[0].column), (3, 3));
    }

    #[test]
    fn dollar_quotes_ignore_semicolons() {
        let stmts = split_statements("CREATE FUNCTION f() AS $$ SELECT 1; SELECT 2; $$;");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn dollar_quotes_nest_by_tag() {
        let sql = "DO $outer$ BEGIN PERFORM $inner$ a; b $inner$; END $outer$;SELECT 1;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.ends_with("END $outer$"));
    }

    #[test]
    fn unterminated_dollar_quote_is_consumed_greedily() {
        let stmts = split_statements("SELECT $fn$ runaway; content");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].sql, "SELECT $fn$ runaway; content");
    }

    #[test]
    fn unterminated_string_is_consumed_greedily() {
        let stmts = split_statements("SELECT 'runaway; SELECT 2;");
        assert_eq!(stmts.len(), 1);
    }

    #[test]
    fn copy_from_stdin_consumes_data_block() {
        let sql = "COPY users (id, name) FROM STDIN;\n1\talice\n2\tbob\n\\.\nSELECT 1;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].sql.contains("2\tbob"));
        assert!(stmts[0].sql.ends_with("\\."));
        assert_eq!(stmts[1].sql, "SELECT 1");
    }

    #[test]
    fn split_round_trips() {
        let sql = "CREATE TABLE a(id INT);\nINSERT INTO a VALUES (1);\nDROP TABLE a;";
        let first: Vec<String> = split_statements(sql).into_iter().map(|s| s.sql).collect();
        let rejoined = first.join(";\n");
        let second: Vec<String> = split_statements(&rejoined)
            .into_iter()
            .map(|s| s.sql)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn parses_up_and_down_sections() {
        let parsed = parse(
            "-- + nomad up\nCREATE TABLE users(id INT);\n-- + nomad down\nDROP TABLE users;\n",
        );
        assert_eq!(parsed.up.statements.len(), 1);
        assert_eq!(parsed.down.statements.len(), 1);
        assert_eq!(parsed.up.statements[0].sql, "CREATE TABLE users(id INT)");
        assert_eq!(parsed.up.statements[0].line, 2);
        assert_eq!(parsed.down.statements[0].sql, "DROP TABLE users");
        assert_eq!(parsed.down.statements[0].line, 4);
    }

    #[test]
    fn directives_are_case_and_whitespace_tolerant() {
        let parsed = parse("--+nomad UP\nSELECT 1;\n--  +  nomad DOWN\nSELECT 2;\n");
        assert_eq!(parsed.up.statements.len(), 1);
        assert_eq!(parsed.down.statements.len(), 1);
    }

    #[test]
    fn content_outside_sections_is_ignored() {
        let parsed = parse("SELECT 'ignored';\n-- + nomad up\nSELECT 1;\n");
        assert_eq!(parsed.up.statements.len(), 1);
        assert_eq!(parsed.up.statements[0].sql, "SELECT 1");
    }

    #[test]
    fn notx_marks_the_active_section() {
        let parsed = parse(
            "-- + nomad up\n-- + nomad notx\nSELECT 1;\n-- + nomad down\nSELECT 2;\n",
        );
        assert!(parsed.up.no_transaction);
        assert!(!parsed.down.no_transaction);
        assert!(!parsed.no_transaction_file);
    }

    #[test]
    fn no_transaction_spelling_is_accepted() {
        let parsed = parse("-- + nomad up\n-- + nomad no transaction\nSELECT 1;\n");
        assert!(parsed.up.no_transaction);
    }

    #[test]
    fn notx_outside_sections_is_the_legacy_whole_file_flag() {
        let parsed = parse("-- + nomad notx\n-- + nomad up\nSELECT 1;\n-- + nomad down\nSELECT 2;\n");
        assert!(parsed.no_transaction_file);
        assert!(!parsed.up.no_transaction);
        assert!(parsed.section_no_transaction(&parsed.up));
        assert!(parsed.section_no_transaction(&parsed.down));
    }

    #[test]
    fn tags_are_lowercased_and_split() {
        let parsed = parse("-- + nomad tags: Seed, USERS demo\n-- + nomad up\nSELECT 1;\n");
        let tags: Vec<&str> = parsed.tags.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["demo", "seed", "users"]);
    }

    #[test]
    fn block_is_a_single_statement() {
        let parsed = parse(
            "-- + nomad up\n-- + nomad block\nINSERT INTO a VALUES (1);\nINSERT INTO a VALUES (2);\n-- + nomad endblock\nSELECT 1;\n",
        );
        assert_eq!(parsed.up.statements.len(), 2);
        assert_eq!(
            parsed.up.statements[0].sql,
            "INSERT INTO a VALUES (1);\nINSERT INTO a VALUES (2);"
        );
        assert_eq!(parsed.up.statements[0].line, 3);
        assert_eq!(parsed.up.statements[1].sql, "SELECT 1");
    }

    #[test]
    fn blocks_nest() {
        let parsed = parse(
            "-- + nomad up\n-- + nomad block\nouter start;\n-- + nomad block\ninner;\n-- + nomad endblock\nouter end;\n-- + nomad endblock\n",
        );
        assert_eq!(parsed.up.statements.len(), 1);
        let sql = &parsed.up.statements[0].sql;
        assert!(sql.contains("-- + nomad block"));
        assert!(sql.contains("inner;"));
        assert!(sql.starts_with("outer start;"));
        assert!(sql.ends_with("outer end;"));
    }

    #[test]
    fn unterminated_block_runs_to_eof() {
        let parsed = parse("-- + nomad up\n-- + nomad block\nSELECT 1;\nSELECT 2;\n");
        assert_eq!(parsed.up.statements.len(), 1);
        assert_eq!(parsed.up.statements[0].sql, "SELECT 1;\nSELECT 2;");
    }

    #[test]
    fn directive_lines_inside_a_section_preserve_line_numbers() {
        let parsed = parse(
            "-- + nomad up\nSELECT 1;\n-- + nomad tags: seed\nSELECT 2;\n",
        );
        assert_eq!(parsed.up.statements.len(), 2);
        assert_eq!(parsed.up.statements[1].line, 4);
    }

    #[test]
    fn repeated_up_directives_append() {
        let parsed = parse("-- + nomad up\nSELECT 1;\n-- + nomad up\nSELECT 2;\n");
        assert_eq!(parsed.up.statements.len(), 2);
    }

    #[test]
    fn bom_and_crlf_are_tolerated() {
        let parsed = parse("\u{FEFF}-- + nomad up\r\nSELECT 1;\r\n");
        assert_eq!(parsed.up.statements.len(), 1);
        assert_eq!(parsed.up.statements[0].sql, "SELECT 1");
    }
}
