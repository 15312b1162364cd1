///! Lexer and parser for RJoy.
///!
///! Joy surface syntax:
///!   literal    ::= integer | float | 'char | "string" | { set } | true | false
///!   quotation  ::= '[' term* ']'
///!   term       ::= literal | quotation | symbol
///!   phrase     ::= term* '.'
///!   defblock   ::= (DEFINE|LIBRA|HIDE|PRIVATE) defs (IN|PUBLIC defs)* (END|'.')
///!   def        ::= symbol '==' term*
///!
///! Quotations parse to the same representation as lists: parsing and data
///! share the value model. Every token carries (line, column) so errors point
///! at the source.

use std::rc::Rc;

use crate::error::{JoyError, Result, SourcePos};
use crate::symbol::{Sym, SymbolTable};
use crate::value::{FileHandle, Value, SETSIZE};

// ── Token ──

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Symbol(String),
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semicolon,
    Period,
    Equals, // ==
    Define, // DEFINE or LIBRA
    Hide,   // HIDE or PRIVATE
    In,     // IN or PUBLIC
    End,
    Module,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub column: u32,
}

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    file: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str, file: &'a str) -> Self {
        Lexer {
            input: input.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            file,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.input.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.input.get(self.pos).copied()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn here(&self) -> SourcePos {
        SourcePos::new(self.file, self.line, self.column)
    }

    fn err(&self, msg: impl Into<String>) -> JoyError {
        JoyError::Parse {
            msg: msg.into(),
            pos: self.here(),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'#') => {
                    // line comment
                    while let Some(b) = self.peek() {
                        self.advance();
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                Some(b'(') if self.peek2() == Some(b'*') => {
                    // block comment
                    let start = self.here();
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            None => {
                                return Err(JoyError::Parse {
                                    msg: "unterminated comment".into(),
                                    pos: start,
                                })
                            }
                            Some(b'*') if self.peek2() == Some(b')') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Characters that end an identifier or numeric run.
    fn is_delimiter(b: u8) -> bool {
        matches!(
            b,
            b'[' | b']'
                | b'{'
                | b'}'
                | b';'
                | b'.'
                | b'"'
                | b'\''
                | b'#'
                | b'('
                | b')'
        ) || b.is_ascii_whitespace()
    }

    /// One escape after a backslash: \n \t \b \r \f \v \' \" \\ or \NNN
    /// with up to three decimal digits.
    fn read_escape(&mut self) -> Result<char> {
        match self.advance() {
            None => Err(self.err("unterminated escape")),
            Some(b'n') => Ok('\n'),
            Some(b't') => Ok('\t'),
            Some(b'b') => Ok('\u{8}'),
            Some(b'r') => Ok('\r'),
            Some(b'f') => Ok('\u{c}'),
            Some(b'v') => Ok('\u{b}'),
            Some(b'\'') => Ok('\''),
            Some(b'"') => Ok('"'),
            Some(b'\\') => Ok('\\'),
            Some(d) if d.is_ascii_digit() => {
                let mut code = (d - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d2) if d2.is_ascii_digit() => {
                            code = code * 10 + (d2 - b'0') as u32;
                            self.advance();
                        }
                        _ => break,
                    }
                }
                if code > 255 {
                    return Err(self.err(format!("character escape \\{code} out of range")));
                }
                Ok(code as u8 as char)
            }
            Some(c) => Err(self.err(format!("unknown escape \\{}", c as char))),
        }
    }

    fn read_string(&mut self) -> Result<String> {
        // opening " already consumed
        let mut s = String::new();
        loop {
            match self.advance() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => return Ok(s),
                Some(b'\\') => s.push(self.read_escape()?),
                Some(b) => s.push(b as char),
            }
        }
    }

    fn read_char(&mut self) -> Result<char> {
        // opening ' already consumed; Joy chars have no closing quote
        match self.advance() {
            None => return Err(self.err("unterminated character literal")),
            Some(b'\\') => self.read_escape(),
            Some(b) => Ok(b as char),
        }
    }

    /// Lex a numeric token. `.` joins the number only when followed by a
    /// digit, so a standalone `.` stays the phrase terminator. `e`/`E`
    /// joins when followed by an (optionally signed) digit.
    fn read_number(&mut self) -> Result<Tok> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.advance();
        }
        let mut is_float = false;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() {
                self.advance();
            } else if b == b'.' && self.peek2().map_or(false, |d| d.is_ascii_digit()) {
                is_float = true;
                self.advance();
            } else if (b == b'e' || b == b'E')
                && match self.peek2() {
                    Some(d) if d.is_ascii_digit() => true,
                    Some(b'+') | Some(b'-') => self
                        .input
                        .get(self.pos + 2)
                        .map_or(false, |d| d.is_ascii_digit()),
                    _ => false,
                }
            {
                is_float = true;
                self.advance(); // e
                self.advance(); // sign or first digit
            } else {
                break;
            }
        }
        // A digit run glued to identifier characters is malformed.
        if self.peek().map_or(false, |b| !Self::is_delimiter(b)) {
            while self.peek().map_or(false, |b| !Self::is_delimiter(b)) {
                self.advance();
            }
            let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap();
            return Err(self.err(format!("malformed numeric literal: {text}")));
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap();
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.err(format!("malformed numeric literal: {text}")))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.err(format!("malformed numeric literal: {text}")))
        }
    }

    fn read_word(&mut self) -> Tok {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if Self::is_delimiter(b) {
                break;
            }
            self.advance();
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .unwrap_or("?")
            .to_string();
        match text.as_str() {
            "==" => Tok::Equals,
            "DEFINE" | "LIBRA" => Tok::Define,
            "HIDE" | "PRIVATE" => Tok::Hide,
            "IN" | "PUBLIC" => Tok::In,
            "END" => Tok::End,
            "MODULE" => Tok::Module,
            _ => Tok::Symbol(text),
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let (line, column) = (self.line, self.column);
            let tok = match self.peek() {
                None => return Ok(tokens),
                Some(b'[') => {
                    self.advance();
                    Tok::LBracket
                }
                Some(b']') => {
                    self.advance();
                    Tok::RBracket
                }
                Some(b'{') => {
                    self.advance();
                    Tok::LBrace
                }
                Some(b'}') => {
                    self.advance();
                    Tok::RBrace
                }
                Some(b';') => {
                    self.advance();
                    Tok::Semicolon
                }
                Some(b'.') => {
                    if self.peek2().map_or(false, |d| d.is_ascii_digit()) {
                        // a float like .5 has no leading digit in Joy; treat
                        // as malformed rather than guessing
                        return Err(self.err("malformed numeric literal: leading '.'"));
                    }
                    self.advance();
                    Tok::Period
                }
                Some(b'"') => {
                    self.advance();
                    Tok::Str(self.read_string()?)
                }
                Some(b'\'') => {
                    self.advance();
                    Tok::Char(self.read_char()?)
                }
                Some(b) if b.is_ascii_digit() => self.read_number()?,
                Some(b'+') | Some(b'-')
                    if self.peek2().map_or(false, |d| d.is_ascii_digit()) =>
                {
                    self.read_number()?
                }
                Some(b'(') | Some(b')') => {
                    return Err(self.err(format!(
                        "illegal character '{}'",
                        self.peek().unwrap() as char
                    )))
                }
                Some(_) => self.read_word(),
            };
            tokens.push(Token { tok, line, column });
        }
    }
}

// ── Parser ──

/// One top-level unit: a set of definitions or a term sequence to evaluate.
#[derive(Debug, Clone)]
pub enum Phrase {
    Defs(Vec<(Sym, Rc<Vec<Value>>)>),
    Terms(Rc<Vec<Value>>),
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    file: &'a str,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], file: &'a str) -> Self {
        Parser {
            tokens,
            pos: 0,
            file,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(t)
    }

    fn pos_of(&self, token: Option<&Token>) -> SourcePos {
        match token {
            Some(t) => SourcePos::new(self.file, t.line, t.column),
            None => {
                let last = self.tokens.last();
                SourcePos::new(
                    self.file,
                    last.map_or(1, |t| t.line),
                    last.map_or(1, |t| t.column),
                )
            }
        }
    }

    fn err_here(&self, msg: impl Into<String>) -> JoyError {
        let pos = self.pos_of(self.tokens.get(self.pos));
        JoyError::Parse {
            msg: msg.into(),
            pos,
        }
    }

    /// Parse one term. Does not accept structural tokens; the caller
    /// dispatches on those.
    fn parse_term(&mut self, syms: &mut SymbolTable) -> Result<Value> {
        let token = self.advance().cloned();
        match token.map(|t| t.tok) {
            None => Err(self.err_here("unexpected end of input")),
            Some(Tok::Int(i)) => Ok(Value::Int(i)),
            Some(Tok::Float(f)) => Ok(Value::Float(f)),
            Some(Tok::Char(c)) => Ok(Value::Char(c)),
            Some(Tok::Str(s)) => Ok(Value::string(s)),
            Some(Tok::Symbol(name)) => Ok(match name.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "stdin" => Value::File(FileHandle::Stdin),
                "stdout" => Value::File(FileHandle::Stdout),
                "stderr" => Value::File(FileHandle::Stderr),
                _ => Value::Symbol(syms.intern(&name)),
            }),
            Some(Tok::LBracket) => self.parse_quotation(syms),
            Some(Tok::LBrace) => self.parse_set(),
            Some(t) => {
                self.pos -= 1;
                Err(self.err_here(format!("unexpected {t:?}")))
            }
        }
    }

    fn parse_quotation(&mut self, syms: &mut SymbolTable) -> Result<Value> {
        // '[' already consumed
        let open = self.pos_of(self.tokens.get(self.pos.saturating_sub(1)));
        let mut terms = Vec::new();
        loop {
            match self.peek().map(|t| &t.tok) {
                None => {
                    return Err(JoyError::Parse {
                        msg: "unterminated list: expected ']'".into(),
                        pos: open,
                    })
                }
                Some(Tok::RBracket) => {
                    self.advance();
                    return Ok(Value::list(terms));
                }
                _ => terms.push(self.parse_term(syms)?),
            }
        }
    }

    fn parse_set(&mut self) -> Result<Value> {
        // '{' already consumed
        let open = self.pos_of(self.tokens.get(self.pos.saturating_sub(1)));
        let mut bits: u64 = 0;
        loop {
            let token = self.peek().cloned();
            match token.map(|t| t.tok) {
                None => {
                    return Err(JoyError::Parse {
                        msg: "unterminated set: expected '}'".into(),
                        pos: open,
                    })
                }
                Some(Tok::RBrace) => {
                    self.advance();
                    return Ok(Value::Set(bits));
                }
                Some(Tok::Int(i)) => {
                    if !(0..SETSIZE).contains(&i) {
                        return Err(
                            self.err_here(format!("set member {i} out of range [0, {}]", SETSIZE - 1))
                        );
                    }
                    bits |= 1u64 << i;
                    self.advance();
                }
                Some(_) => {
                    return Err(self.err_here(format!(
                        "set members must be integers in range [0, {}]",
                        SETSIZE - 1
                    )))
                }
            }
        }
    }

    /// Parse a definition block opened by DEFINE/LIBRA/HIDE/PRIVATE.
    /// IN/PUBLIC are transparent section dividers; END or '.' closes.
    fn parse_defs(&mut self, syms: &mut SymbolTable) -> Result<Vec<(Sym, Rc<Vec<Value>>)>> {
        self.advance(); // opening keyword
        let mut defs = Vec::new();
        loop {
            match self.peek().map(|t| t.tok.clone()) {
                None => return Err(self.err_here("unterminated definition block")),
                Some(Tok::End) | Some(Tok::Period) => {
                    self.advance();
                    return Ok(defs);
                }
                Some(Tok::Semicolon) | Some(Tok::In) => {
                    self.advance();
                }
                Some(Tok::Symbol(name)) => {
                    self.advance();
                    match self.peek().map(|t| &t.tok) {
                        Some(Tok::Equals) => {
                            self.advance();
                        }
                        other => {
                            let other = other.cloned();
                            return Err(self.err_here(format!(
                                "missing '==' in definition of {name}, got {other:?}"
                            )));
                        }
                    }
                    let body = self.parse_body(syms)?;
                    defs.push((syms.intern(&name), Rc::new(body)));
                }
                Some(t) => return Err(self.err_here(format!("unexpected {t:?} in definitions"))),
            }
        }
    }

    /// A definition body: terms up to ';', IN/PUBLIC, END or '.'
    /// (terminator left in place).
    fn parse_body(&mut self, syms: &mut SymbolTable) -> Result<Vec<Value>> {
        let mut terms = Vec::new();
        loop {
            match self.peek().map(|t| &t.tok) {
                None
                | Some(Tok::Semicolon)
                | Some(Tok::In)
                | Some(Tok::End)
                | Some(Tok::Period) => return Ok(terms),
                _ => terms.push(self.parse_term(syms)?),
            }
        }
    }

    /// Parse the whole token stream into phrases.
    pub fn parse_phrases(&mut self, syms: &mut SymbolTable) -> Result<Vec<Phrase>> {
        let mut phrases = Vec::new();
        let mut terms: Vec<Value> = Vec::new();
        loop {
            match self.peek().map(|t| t.tok.clone()) {
                None => {
                    if !terms.is_empty() {
                        return Err(self.err_here("missing '.' at end of phrase"));
                    }
                    return Ok(phrases);
                }
                Some(Tok::Period) => {
                    self.advance();
                    phrases.push(Phrase::Terms(Rc::new(std::mem::take(&mut terms))));
                }
                Some(Tok::Module) => {
                    // MODULE and its name are transparent
                    self.advance();
                    if matches!(self.peek().map(|t| &t.tok), Some(Tok::Symbol(_))) {
                        self.advance();
                    }
                }
                Some(Tok::Define) | Some(Tok::Hide) => {
                    if !terms.is_empty() {
                        return Err(self.err_here("missing '.' at end of phrase"));
                    }
                    phrases.push(Phrase::Defs(self.parse_defs(syms)?));
                }
                _ => terms.push(self.parse_term(syms)?),
            }
        }
    }
}

/// Parse Joy source into a sequence of top-level phrases.
pub fn parse(source: &str, file: &str, syms: &mut SymbolTable) -> Result<Vec<Phrase>> {
    let tokens = Lexer::new(source, file).tokenize()?;
    Parser::new(&tokens, file).parse_phrases(syms)
}

/// Parse a bare term sequence (no phrase framing; '.' and ';' are skipped).
/// Used by `get` and by the test helpers.
pub fn parse_factors(source: &str, file: &str, syms: &mut SymbolTable) -> Result<Vec<Value>> {
    let tokens = Lexer::new(source, file).tokenize()?;
    let mut parser = Parser::new(&tokens, file);
    let mut terms = Vec::new();
    loop {
        match parser.peek().map(|t| &t.tok) {
            None => return Ok(terms),
            Some(Tok::Period) | Some(Tok::Semicolon) => {
                parser.advance();
            }
            _ => terms.push(parser.parse_term(syms)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrases(src: &str) -> Result<Vec<Phrase>> {
        let mut syms = SymbolTable::new();
        parse(src, "test", &mut syms)
    }

    fn factors(src: &str) -> Vec<Value> {
        let mut syms = SymbolTable::new();
        parse_factors(src, "test", &mut syms).unwrap()
    }

    #[test]
    fn literals() {
        let t = factors("42 -7 3.5 1e3 'A '\\n \"hi\\tthere\" true false");
        assert_eq!(t[0], Value::Int(42));
        assert_eq!(t[1], Value::Int(-7));
        assert_eq!(t[2], Value::Float(3.5));
        assert_eq!(t[3], Value::Float(1000.0));
        assert_eq!(t[4], Value::Char('A'));
        assert_eq!(t[5], Value::Char('\n'));
        assert_eq!(t[6], Value::string("hi\tthere"));
        assert_eq!(t[7], Value::Bool(true));
        assert_eq!(t[8], Value::Bool(false));
    }

    #[test]
    fn decimal_escape() {
        let t = factors("'\\065 \"\\065\\010\"");
        assert_eq!(t[0], Value::Char('A'));
        assert_eq!(t[1], Value::string("A\n"));
    }

    #[test]
    fn nested_quotations() {
        let t = factors("[1 [2 3] dup]");
        let outer = t[0].as_list().unwrap();
        assert_eq!(outer.len(), 3);
        assert_eq!(outer[0], Value::Int(1));
        assert_eq!(
            outer[1],
            Value::list(vec![Value::Int(2), Value::Int(3)])
        );
        assert!(matches!(outer[2], Value::Symbol(_)));
    }

    #[test]
    fn set_literals() {
        let t = factors("{} {1 3 5}");
        assert_eq!(t[0], Value::Set(0));
        assert_eq!(t[1], Value::Set((1 << 1) | (1 << 3) | (1 << 5)));
    }

    #[test]
    fn set_member_out_of_range() {
        assert!(matches!(
            phrases("{64} ."),
            Err(JoyError::Parse { .. })
        ));
        assert!(matches!(
            phrases("{-1} ."),
            Err(JoyError::Parse { .. })
        ));
    }

    #[test]
    fn comments() {
        let t = factors("1 # a comment\n2 (* block\n comment *) 3");
        assert_eq!(t, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn period_is_not_a_float() {
        let ps = phrases("2 3 + .").unwrap();
        assert_eq!(ps.len(), 1);
        match &ps[0] {
            Phrase::Terms(terms) => assert_eq!(terms.len(), 3),
            _ => panic!("expected terms"),
        }
    }

    #[test]
    fn definitions() {
        let ps = phrases("DEFINE sq == dup * ; cube == dup dup * * .").unwrap();
        match &ps[0] {
            Phrase::Defs(defs) => {
                assert_eq!(defs.len(), 2);
                assert_eq!(defs[0].1.len(), 2);
                assert_eq!(defs[1].1.len(), 4);
            }
            _ => panic!("expected defs"),
        }
    }

    #[test]
    fn hide_in_end() {
        let ps = phrases("HIDE helper == dup IN pub1 == helper * END pub1 .").unwrap();
        match &ps[0] {
            Phrase::Defs(defs) => assert_eq!(defs.len(), 2),
            _ => panic!("expected defs"),
        }
        assert!(matches!(&ps[1], Phrase::Terms(_)));
    }

    #[test]
    fn module_markers_are_transparent() {
        let ps = phrases("MODULE m DEFINE f == 1 . f .").unwrap();
        assert_eq!(ps.len(), 2);
    }

    #[test]
    fn stdio_literals() {
        let t = factors("stdin stdout stderr");
        assert!(matches!(t[0], Value::File(FileHandle::Stdin)));
        assert!(matches!(t[1], Value::File(FileHandle::Stdout)));
        assert!(matches!(t[2], Value::File(FileHandle::Stderr)));
    }

    #[test]
    fn errors_carry_positions() {
        match phrases("1 2\n\"oops .") {
            Err(JoyError::Parse { pos, msg }) => {
                assert_eq!(pos.line, 2);
                assert!(msg.contains("unterminated string"));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_number() {
        assert!(matches!(phrases("12abc ."), Err(JoyError::Parse { .. })));
    }

    #[test]
    fn unterminated_list() {
        assert!(matches!(phrases("[1 2 ."), Err(JoyError::Parse { .. })));
    }

    #[test]
    fn missing_definition_separator() {
        match phrases("DEFINE f 1 .") {
            Err(JoyError::Parse { msg, .. }) => assert!(msg.contains("==")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn missing_period() {
        assert!(matches!(phrases("2 3 +"), Err(JoyError::Parse { .. })));
    }

    #[test]
    fn negative_numbers_vs_symbols() {
        let t = factors("- -3 + +4");
        assert!(matches!(t[0], Value::Symbol(_)));
        assert_eq!(t[1], Value::Int(-3));
        assert!(matches!(t[2], Value::Symbol(_)));
        assert_eq!(t[3], Value::Int(4));
    }
}
