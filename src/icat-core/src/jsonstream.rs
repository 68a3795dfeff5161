//! Single-pass streaming JSON token extraction.
//!
//! ICAT responses that this layer must decode are small documents with a
//! known shape: an object with one field of interest, or a flat array of
//! ids. Rather than materialising a full value tree, [`JsonTokens`] lexes
//! the document into a lazy, non-restartable event stream and the
//! combinators below pull the first matching value out of it, failing fast
//! on malformed input.

use crate::error::{IcatError, Result};

/// One lexical event from a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ObjectStart,
    ObjectEnd,
    ArrayStart,
    ArrayEnd,
    /// An object member name.
    Key(String),
    Str(String),
    /// A number, kept in its textual representation.
    Num(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Container {
    Object,
    Array,
}

/// Lazy tokenizer over a JSON document. Yields `Err` once on the first
/// lexical problem and then terminates.
pub struct JsonTokens<'a> {
    src: &'a str,
    pos: usize,
    stack: Vec<Container>,
    /// A value just completed in the current container (or at top level).
    after_value: bool,
    /// A key was emitted and the member's value is expected next.
    pending_value: bool,
    done: bool,
    failed: bool,
}

impl<'a> JsonTokens<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            stack: Vec::new(),
            after_value: false,
            pending_value: false,
            done: false,
            failed: false,
        }
    }

    fn fail(&mut self, message: impl Into<String>) -> IcatError {
        self.failed = true;
        IcatError::internal(message)
    }

    fn skip_ws(&mut self) {
        let rest = &self.src[self.pos..];
        let trimmed = rest.trim_start_matches([' ', '\t', '\r', '\n']);
        self.pos += rest.len() - trimmed.len();
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self, c: char) {
        self.pos += c.len_utf8();
    }

    /// Parse a double-quoted JSON string starting at the opening quote.
    fn parse_string(&mut self) -> Result<String> {
        self.bump('"');
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.fail("Unterminated string in JSON document"));
            };
            self.bump(c);
            match c {
                '"' => return Ok(out),
                '\\' => {
                    let Some(esc) = self.peek() else {
                        return Err(self.fail("Unterminated escape in JSON document"));
                    };
                    self.bump(esc);
                    match esc {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        '/' => out.push('/'),
                        'b' => out.push('\u{0008}'),
                        'f' => out.push('\u{000C}'),
                        'n' => out.push('\n'),
                        'r' => out.push('\r'),
                        't' => out.push('\t'),
                        'u' => {
                            let hex = self.src.get(self.pos..self.pos + 4);
                            let code = hex.and_then(|h| u32::from_str_radix(h, 16).ok());
                            match code.and_then(char::from_u32) {
                                Some(ch) => {
                                    self.pos += 4;
                                    out.push(ch);
                                }
                                None => {
                                    return Err(self.fail("Bad unicode escape in JSON document"))
                                }
                            }
                        }
                        other => {
                            return Err(
                                self.fail(format!("Bad escape \\{other} in JSON document"))
                            )
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn parse_number(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                self.bump(c);
            } else {
                break;
            }
        }
        let text = &self.src[start..self.pos];
        // The character class above also admits junk like "-" or "1.2.3"
        if text.parse::<f64>().is_err() {
            return Err(self.fail(format!("Bad number {text} in JSON document")));
        }
        Ok(text.to_string())
    }

    fn parse_keyword(&mut self, word: &str, event: Event) -> Result<Event> {
        if self.src[self.pos..].starts_with(word) {
            self.pos += word.len();
            Ok(event)
        } else {
            Err(self.fail("Unexpected token in JSON document"))
        }
    }

    /// A value has been completed in the current context.
    fn value_done(&mut self) {
        if self.stack.is_empty() {
            self.done = true;
        } else {
            self.after_value = true;
            self.pending_value = false;
        }
    }

    fn parse_value(&mut self, c: char) -> Result<Event> {
        match c {
            '{' => {
                self.bump(c);
                self.stack.push(Container::Object);
                self.after_value = false;
                self.pending_value = false;
                Ok(Event::ObjectStart)
            }
            '[' => {
                self.bump(c);
                self.stack.push(Container::Array);
                self.after_value = false;
                self.pending_value = false;
                Ok(Event::ArrayStart)
            }
            '"' => {
                let s = self.parse_string()?;
                self.value_done();
                Ok(Event::Str(s))
            }
            't' => {
                let ev = self.parse_keyword("true", Event::Bool(true))?;
                self.value_done();
                Ok(ev)
            }
            'f' => {
                let ev = self.parse_keyword("false", Event::Bool(false))?;
                self.value_done();
                Ok(ev)
            }
            'n' => {
                let ev = self.parse_keyword("null", Event::Null)?;
                self.value_done();
                Ok(ev)
            }
            '-' | '0'..='9' => {
                let n = self.parse_number()?;
                self.value_done();
                Ok(Event::Num(n))
            }
            other => Err(self.fail(format!("Unexpected character {other:?} in JSON document"))),
        }
    }

    fn close(&mut self, container: Container) -> Result<Event> {
        let c = if container == Container::Object { '}' } else { ']' };
        self.bump(c);
        match self.stack.pop() {
            Some(top) if top == container => {
                self.value_done();
                Ok(if container == Container::Object {
                    Event::ObjectEnd
                } else {
                    Event::ArrayEnd
                })
            }
            _ => Err(self.fail(format!("Unbalanced {c:?} in JSON document"))),
        }
    }

    fn next_event(&mut self) -> Option<Result<Event>> {
        if self.failed {
            return None;
        }
        loop {
            self.skip_ws();
            let Some(c) = self.peek() else {
                if self.done && self.stack.is_empty() {
                    return None;
                }
                return Some(Err(self.fail("Unexpected end of JSON document")));
            };
            if self.stack.is_empty() {
                if self.done {
                    return Some(Err(self.fail("Trailing characters in JSON document")));
                }
                return Some(self.parse_value(c));
            }
            if self.after_value {
                match c {
                    ',' => {
                        self.bump(c);
                        self.after_value = false;
                        continue;
                    }
                    '}' => return Some(self.close(Container::Object)),
                    ']' => return Some(self.close(Container::Array)),
                    other => {
                        return Some(Err(self.fail(format!(
                            "Expected ',' or a closing bracket, found {other:?}"
                        ))))
                    }
                }
            }
            match self.stack.last().copied() {
                Some(Container::Object) if !self.pending_value => match c {
                    '}' => return Some(self.close(Container::Object)),
                    '"' => {
                        let key = match self.parse_string() {
                            Ok(k) => k,
                            Err(e) => return Some(Err(e)),
                        };
                        self.skip_ws();
                        if self.peek() != Some(':') {
                            return Some(Err(self.fail("Expected ':' after object key")));
                        }
                        self.bump(':');
                        self.pending_value = true;
                        return Some(Ok(Event::Key(key)));
                    }
                    _ => return Some(Err(self.fail("Expected an object key"))),
                },
                Some(Container::Array) if c == ']' => {
                    return Some(self.close(Container::Array));
                }
                _ => return Some(self.parse_value(c)),
            }
        }
    }
}

impl Iterator for JsonTokens<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}

/// Return the first string or numeric value whose member name is `key`.
/// Numbers come back in their textual representation.
pub fn string_value(doc: &str, key: &str) -> Result<String> {
    let mut current = String::new();
    for event in JsonTokens::new(doc) {
        match event? {
            Event::Key(k) => current = k,
            Event::Str(s) if current == key => return Ok(s),
            Event::Num(n) if current == key => return Ok(n),
            _ => {}
        }
    }
    Err(IcatError::internal(format!("No {key} in {doc}")))
}

/// Return the first numeric value whose member name is `key` as an i64.
pub fn long_value(doc: &str, key: &str) -> Result<i64> {
    let mut current = String::new();
    for event in JsonTokens::new(doc) {
        match event? {
            Event::Key(k) => current = k,
            Event::Num(n) if current == key => {
                return n
                    .parse()
                    .map_err(|_| IcatError::internal(format!("{n} is not a long in {doc}")));
            }
            _ => {}
        }
    }
    Err(IcatError::internal(format!("No {key} in {doc}")))
}

/// Return the first boolean value whose member name is `key`.
pub fn boolean_value(doc: &str, key: &str) -> Result<bool> {
    let mut current = String::new();
    for event in JsonTokens::new(doc) {
        match event? {
            Event::Key(k) => current = k,
            Event::Bool(b) if current == key => return Ok(b),
            _ => {}
        }
    }
    Err(IcatError::internal(format!("No {key} in {doc}")))
}

/// Parse a document that must be a flat JSON array of longs.
pub fn long_array(doc: &str) -> Result<Vec<i64>> {
    let mut tokens = JsonTokens::new(doc);
    match tokens.next() {
        Some(Ok(Event::ArrayStart)) => {}
        Some(Err(e)) => return Err(e),
        _ => return Err(IcatError::internal("Not a valid JSON array of longs")),
    }
    let mut out = Vec::new();
    for event in tokens {
        match event? {
            Event::Num(n) => out.push(
                n.parse()
                    .map_err(|_| IcatError::internal(format!("{n} is not a long")))?,
            ),
            Event::ArrayEnd => return Ok(out),
            _ => {}
        }
    }
    Err(IcatError::internal("Not a valid JSON array of longs"))
}

/// Parse a document that must be a flat JSON array of strings.
pub fn string_array(doc: &str) -> Result<Vec<String>> {
    let mut tokens = JsonTokens::new(doc);
    match tokens.next() {
        Some(Ok(Event::ArrayStart)) => {}
        Some(Err(e)) => return Err(e),
        _ => return Err(IcatError::internal("Not a valid JSON array of strings")),
    }
    let mut out = Vec::new();
    for event in tokens {
        match event? {
            Event::Str(s) => out.push(s),
            Event::ArrayEnd => return Ok(out),
            _ => {}
        }
    }
    Err(IcatError::internal("Not a valid JSON array of strings"))
}
