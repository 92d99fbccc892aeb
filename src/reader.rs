use log::warn;

use crate::env;
use crate::error::{LispError, LispResult};
use crate::heap::Heap;
use crate::value::ObjRef;

/// Parses source text into heap forms.
///
/// Reading never triggers a collection; the caller must root the forms
/// before evaluating any of them.
pub struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
    heap: &'a mut Heap,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a str, heap: &'a mut Heap) -> Self {
        Reader {
            input: input.as_bytes(),
            pos: 0,
            heap,
        }
    }

    /// Read one expression. Returns None at EOF.
    pub fn read(&mut self) -> LispResult<Option<ObjRef>> {
        self.skip_whitespace_and_comments();
        if self.pos >= self.input.len() {
            return Ok(None);
        }
        self.read_expr().map(Some)
    }

    /// Read all expressions from input.
    pub fn read_all(&mut self) -> LispResult<Vec<ObjRef>> {
        let mut results = Vec::new();
        while let Some(form) = self.read()? {
            results.push(form);
        }
        Ok(results)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// One-based line and column of the current position.
    pub fn line_and_column(&self) -> (usize, usize) {
        let consumed = &self.input[..self.pos.min(self.input.len())];
        let line = consumed.iter().filter(|&&c| c == b'\n').count() + 1;
        let column = match consumed.iter().rposition(|&c| c == b'\n') {
            Some(newline) => consumed.len() - newline,
            None => consumed.len() + 1,
        };
        (line, column)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.pos += 1;
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.peek() {
            match ch {
                b' ' | b'\t' | b'\n' | b'\r' | b',' => self.pos += 1,
                b';' => {
                    while self.peek().map_or(false, |c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn read_expr(&mut self) -> LispResult<ObjRef> {
        self.skip_whitespace_and_comments();
        let ch = self
            .peek()
            .ok_or_else(|| LispError::Read("unexpected end of input".into()))?;

        match ch {
            b'(' => self.read_list(b')'),
            b'[' => self.read_list(b']'),
            b'{' => self.read_dict(),
            b')' | b']' | b'}' => Err(LispError::Read("Too many parenthesis at the end.".into())),
            b'&' => {
                self.advance();
                Ok(self.heap.symbol("&"))
            }
            b'\'' => {
                self.advance();
                let quoted = self.read_expr()?;
                let quote = self.heap.symbol("quote");
                Ok(self.heap.list(&[quote, quoted]))
            }
            b'"' => self.read_string(),
            b':' => {
                self.advance();
                let name = self.read_token();
                if name.is_empty() {
                    return Err(LispError::Read("empty keyword".into()));
                }
                Ok(self.heap.keyword(&name))
            }
            b'0'..=b'9' => self.read_number(),
            b'-' if self.input.get(self.pos + 1).map_or(false, u8::is_ascii_digit) => {
                self.read_number()
            }
            c if is_symbol_char(c) => {
                let name = self.read_token();
                Ok(self.heap.symbol(&name))
            }
            c => Err(LispError::Read(format!("Can't read '{}'", c as char))),
        }
    }

    fn read_list(&mut self, close: u8) -> LispResult<ObjRef> {
        self.advance();
        let elements = self.read_until(close)?;
        Ok(self.heap.list(&elements))
    }

    fn read_until(&mut self, close: u8) -> LispResult<Vec<ObjRef>> {
        let mut elements = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            match self.peek() {
                None => return Err(LispError::Read("Missing parenthesis at the end.".into())),
                Some(c) if c == close => {
                    self.advance();
                    return Ok(elements);
                }
                Some(_) => elements.push(self.read_expr()?),
            }
        }
    }

    /// `{k v ...}` reads as an environment with no parent.
    fn read_dict(&mut self) -> LispResult<ObjRef> {
        self.advance();
        let elements = self.read_until(b'}')?;
        if elements.len() % 2 != 0 {
            return Err(LispError::Read("Uneven number of forms in dictionary.".into()));
        }
        let dict = self.heap.environment(None);
        for kv in elements.chunks(2) {
            env::extend(self.heap, dict, kv[0], kv[1]);
        }
        Ok(dict)
    }

    fn read_string(&mut self) -> LispResult<ObjRef> {
        self.advance();
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None => return Err(LispError::Read("unterminated string".into())),
                Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => bytes.push(b'\n'),
                    Some(b'"') => bytes.push(b'"'),
                    Some(b'\\') => bytes.push(b'\\'),
                    Some(c) => {
                        return Err(LispError::Read(format!("Unknown escape '\\{}'", c as char)))
                    }
                    None => return Err(LispError::Read("unterminated string".into())),
                },
                Some(c) => bytes.push(c),
            }
        }
        let text = String::from_utf8_lossy(&bytes);
        Ok(self.heap.string(&text))
    }

    /// Digits with an optional fraction; a `.` or a trailing `f` makes a float.
    fn read_number(&mut self) -> LispResult<ObjRef> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => self.pos += 1,
                b'.' if !is_float => {
                    is_float = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        if self.peek() == Some(b'f') {
            self.pos += 1;
            is_float = true;
        }
        if is_float {
            let x: f64 = text
                .parse()
                .map_err(|_| LispError::Read(format!("bad float '{}'", text)))?;
            Ok(self.heap.float(x))
        } else {
            let i: i64 = text
                .parse()
                .map_err(|_| LispError::Read(format!("bad integer '{}'", text)))?;
            Ok(self.heap.int(i))
        }
    }

    fn read_token(&mut self) -> String {
        let start = self.pos;
        while self.peek().map_or(false, is_symbol_char) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }
}

fn is_symbol_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!?<>=%+*/-_.".contains(&c)
}

/// Read every form in `text`. On malformed input the forms read before it
/// are returned together with a diagnostic naming where reading stopped.
pub fn read_forms(heap: &mut Heap, text: &str) -> (Vec<ObjRef>, Option<LispError>) {
    let mut reader = Reader::new(text, heap);
    let mut forms = Vec::new();
    loop {
        match reader.read() {
            Ok(Some(form)) => forms.push(form),
            Ok(None) => return (forms, None),
            Err(e) => {
                let message = match e {
                    LispError::Read(m) => m,
                    other => other.to_string(),
                };
                let (line, column) = reader.line_and_column();
                let diagnostic = LispError::Read(format!(
                    "{} (byte {}, line {}, column {})",
                    message,
                    reader.position(),
                    line,
                    column
                ));
                warn!("{}", diagnostic);
                return (forms, Some(diagnostic));
            }
        }
    }
}
