//! A parser for the subset of YAML found in real `.tbd` files: block
//! mappings, block and flow sequences, single- and double-quoted
//! strings, comments and `---`/`...` document separators.
//!
//! Full YAML is enormous (it embeds all of JSON, for a start); text
//! dylibs use so little of it that a purpose-built parser is smaller
//! than any general one.

#[derive(Debug, Clone, PartialEq)]
pub enum YamlNode {
    Str(String),
    List(Vec<YamlNode>),
    Map(Vec<(String, YamlNode)>),
}

impl YamlNode {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            YamlNode::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[YamlNode]> {
        match self {
            YamlNode::List(v) => Some(v),
            _ => None,
        }
    }

    /// Looks a key up in a mapping node.
    pub fn get(&self, key: &str) -> Option<&YamlNode> {
        match self {
            YamlNode::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct YamlError {
    pub msg: &'static str,
    /// byte position in the input, for line-number reporting
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Str(String),
    Indent,
    Dedent,
    End,
    Dash,
    Colon,
    LBracket,
    RBracket,
    Comma,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    tokens: Vec<(Tok, usize)>,
    indents: Vec<usize>,
}

const BARE_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-/.";

impl<'a> Lexer<'a> {
    fn new(input: &'a [u8]) -> Lexer<'a> {
        Lexer {
            input,
            pos: 0,
            tokens: Vec::new(),
            indents: vec![0],
        }
    }

    fn rest(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push((tok, self.pos));
    }

    fn skip_line(&mut self) {
        match self.rest().iter().position(|&b| b == b'\n') {
            Some(n) => self.pos += n + 1,
            None => self.pos = self.input.len(),
        }
    }

    fn dedent_all(&mut self) {
        while self.indents.len() > 1 {
            self.push(Tok::Dedent);
            self.indents.pop();
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Tok, usize)>, YamlError> {
        while self.pos < self.input.len() {
            self.tokenize_line()?;
        }
        self.dedent_all();
        self.push(Tok::End);
        Ok(self.tokens)
    }

    fn tokenize_line(&mut self) -> Result<(), YamlError> {
        let line_start = self.pos;

        if self.rest().starts_with(b"---") {
            self.dedent_all();
            self.push(Tok::End);
            self.skip_line();
            return Ok(());
        }
        if self.rest().starts_with(b"...") {
            self.dedent_all();
            self.push(Tok::End);
            self.pos = self.input.len();
            return Ok(());
        }

        let indent = match self.rest().iter().position(|&b| b != b' ' && b != b'\t') {
            Some(n) => n,
            None => {
                self.pos = self.input.len();
                return Ok(());
            }
        };
        let first = self.input[self.pos + indent];
        if first == b'#' || first == b'\n' {
            self.skip_line();
            return Ok(());
        }

        if *self.indents.last().unwrap() != indent {
            if *self.indents.last().unwrap() < indent {
                self.push(Tok::Indent);
                self.indents.push(indent);
            } else {
                while *self.indents.last().unwrap() != indent {
                    if indent < *self.indents.last().unwrap() {
                        self.push(Tok::Dedent);
                        self.indents.pop();
                    } else {
                        return Err(YamlError {
                            msg: "bad indentation",
                            pos: line_start,
                        });
                    }
                }
            }
        }
        self.pos += indent;

        while self.pos < self.input.len() {
            let rest = self.rest();
            match rest[0] {
                b'\n' => {
                    self.pos += 1;
                    return Ok(());
                }
                b'-' if rest.len() > 1 && rest[1] == b' ' => {
                    self.push(Tok::Dash);
                    let after = match rest[1..].iter().position(|&b| b != b' ' && b != b'\t') {
                        Some(n) => n + 1,
                        None => {
                            self.pos = self.input.len();
                            return Ok(());
                        }
                    };
                    if rest[after] == b'\n' {
                        self.pos += after + 1;
                        return Ok(());
                    }
                    self.pos += after;
                    self.push(Tok::Indent);
                    self.indents.push(self.pos - line_start);
                }
                b'[' => return self.tokenize_flow_list(),
                b'\'' => self.tokenize_quoted(b'\'')?,
                b'"' => self.tokenize_quoted(b'"')?,
                b'#' => {
                    self.skip_line();
                    return Ok(());
                }
                b':' => {
                    self.push(Tok::Colon);
                    let after = match rest[1..].iter().position(|&b| b != b' ' && b != b'\t') {
                        Some(n) => n + 1,
                        None => {
                            self.pos = self.input.len();
                            return Ok(());
                        }
                    };
                    if rest[after] == b'\n' {
                        self.pos += after + 1;
                        return Ok(());
                    }
                    self.pos += after;
                }
                _ => self.tokenize_bare(),
            }
        }
        Ok(())
    }

    fn tokenize_flow_list(&mut self) -> Result<(), YamlError> {
        let start = self.pos;
        self.push(Tok::LBracket);
        self.pos += 1;

        loop {
            let rest = self.rest();
            match rest.first() {
                None => {
                    return Err(YamlError {
                        msg: "unclosed list",
                        pos: start,
                    })
                }
                Some(b']') => break,
                Some(b' ') | Some(b'\t') | Some(b'\n') => self.pos += 1,
                Some(b'\'') => self.tokenize_quoted(b'\'')?,
                Some(b'"') => self.tokenize_quoted(b'"')?,
                Some(b',') => {
                    self.push(Tok::Comma);
                    self.pos += 1;
                }
                Some(_) => self.tokenize_bare(),
            }
        }

        let bracket = self.pos;
        self.push(Tok::RBracket);
        self.pos += 1;
        while matches!(self.rest().first(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
        match self.rest().first() {
            Some(b'\n') => {
                self.pos += 1;
                Ok(())
            }
            None => Ok(()),
            Some(_) => Err(YamlError {
                msg: "no newline after ']'",
                pos: bracket,
            }),
        }
    }

    fn tokenize_quoted(&mut self, quote: u8) -> Result<(), YamlError> {
        let start = self.pos;
        match self.rest()[1..].iter().position(|&b| b == quote) {
            Some(n) => {
                let s = &self.input[self.pos + 1..self.pos + 1 + n];
                self.tokens.push((
                    Tok::Str(String::from_utf8_lossy(s).into_owned()),
                    self.pos,
                ));
                self.pos += n + 2;
                Ok(())
            }
            None => Err(YamlError {
                msg: "unterminated string literal",
                pos: start,
            }),
        }
    }

    fn tokenize_bare(&mut self) {
        let rest = self.rest();
        let len = rest
            .iter()
            .position(|b| !BARE_CHARS.contains(b))
            .unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..len.max(1)]).into_owned();
        self.tokens.push((Tok::Str(s), self.pos));
        self.pos += len.max(1);
    }
}

struct Parser<'a> {
    tokens: &'a [(Tok, usize)],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|(t, _)| t)
            .unwrap_or(&Tok::End)
    }

    fn here(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, p)| *p)
            .unwrap_or_default()
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        self.pos += 1;
        tok
    }

    fn parse_element(&mut self) -> Result<YamlNode, YamlError> {
        if *self.peek() == Tok::Indent {
            self.bump();
            let elem = self.parse_element()?;
            if *self.peek() != Tok::Dedent {
                return Err(YamlError {
                    msg: "missing dedent",
                    pos: self.here(),
                });
            }
            self.bump();
            return Ok(elem);
        }
        if *self.peek() == Tok::Dash {
            return self.parse_list();
        }
        if matches!(self.peek(), Tok::Str(_))
            && matches!(self.tokens.get(self.pos + 1).map(|(t, _)| t), Some(Tok::Colon))
        {
            return self.parse_map();
        }
        self.parse_flow_element()
    }

    fn parse_list(&mut self) -> Result<YamlNode, YamlError> {
        let mut vec = Vec::new();
        while *self.peek() != Tok::End && *self.peek() != Tok::Dedent {
            if *self.peek() != Tok::Dash {
                return Err(YamlError {
                    msg: "list element expected",
                    pos: self.here(),
                });
            }
            self.bump();
            vec.push(self.parse_element()?);
        }
        Ok(YamlNode::List(vec))
    }

    fn parse_map(&mut self) -> Result<YamlNode, YamlError> {
        let mut map = Vec::new();
        while *self.peek() != Tok::End && *self.peek() != Tok::Dedent {
            let key = match self.bump() {
                Tok::Str(key) => key,
                _ => {
                    return Err(YamlError {
                        msg: "map key expected",
                        pos: self.here(),
                    })
                }
            };
            if self.bump() != Tok::Colon {
                return Err(YamlError {
                    msg: "map key expected",
                    pos: self.here(),
                });
            }
            let val = self.parse_element()?;
            map.push((key, val));
        }
        Ok(YamlNode::Map(map))
    }

    fn parse_flow_element(&mut self) -> Result<YamlNode, YamlError> {
        match self.bump() {
            Tok::LBracket => self.parse_flow_list(),
            Tok::Str(s) => Ok(YamlNode::Str(s)),
            _ => Err(YamlError {
                msg: "scalar expected",
                pos: self.here(),
            }),
        }
    }

    fn parse_flow_list(&mut self) -> Result<YamlNode, YamlError> {
        let start = self.here();
        let mut vec = Vec::new();
        while *self.peek() != Tok::RBracket {
            if *self.peek() == Tok::End {
                return Err(YamlError {
                    msg: "unterminated flow list",
                    pos: start,
                });
            }
            vec.push(self.parse_flow_element()?);
            if *self.peek() == Tok::RBracket {
                break;
            }
            if self.bump() != Tok::Comma {
                return Err(YamlError {
                    msg: "comma expected",
                    pos: start,
                });
            }
        }
        self.bump();
        Ok(YamlNode::List(vec))
    }
}

/// Parses a stream of YAML documents.
pub fn parse_yaml(input: &str) -> Result<Vec<YamlNode>, YamlError> {
    let tokens = Lexer::new(input.as_bytes()).tokenize()?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let mut docs = Vec::new();
    while parser.pos < parser.tokens.len() {
        if *parser.peek() == Tok::End {
            parser.bump();
            continue;
        }
        docs.push(parser.parse_element()?);
        if *parser.peek() != Tok::End {
            return Err(YamlError {
                msg: "stray token",
                pos: parser.here(),
            });
        }
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_map_with_flow_list() {
        let docs = parse_yaml(
            "--- !tapi-tbd\n\
             tbd-version: 4\n\
             targets: [ x86_64-macos, arm64-macos ]\n\
             install-name: '/usr/lib/libSystem.B.dylib'\n\
             ...\n",
        )
        .unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.get("tbd-version").unwrap().as_str(), Some("4"));
        let targets = doc.get("targets").unwrap().as_list().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].as_str(), Some("x86_64-macos"));
        assert_eq!(
            doc.get("install-name").unwrap().as_str(),
            Some("/usr/lib/libSystem.B.dylib")
        );
    }

    #[test]
    fn nested_block_lists() {
        let docs = parse_yaml(
            "exports:\n\
             \x20\x20- targets: [ arm64-macos ]\n\
             \x20\x20\x20\x20symbols: [ _a, _b ]\n\
             \x20\x20- targets: [ x86_64-macos ]\n\
             \x20\x20\x20\x20symbols: [ _c ]\n",
        )
        .unwrap();
        let exports = docs[0].get("exports").unwrap().as_list().unwrap();
        assert_eq!(exports.len(), 2);
        let syms = exports[0].get("symbols").unwrap().as_list().unwrap();
        assert_eq!(syms[1].as_str(), Some("_b"));
    }

    #[test]
    fn comments_and_empty_lines() {
        let docs = parse_yaml("# header\n\na: b\n# trailing\n").unwrap();
        assert_eq!(docs[0].get("a").unwrap().as_str(), Some("b"));
    }

    #[test]
    fn multiple_documents() {
        let docs = parse_yaml("a: 1\n---\nb: 2\n...\n").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].get("b").unwrap().as_str(), Some("2"));
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse_yaml("a: [1, 2\n").unwrap_err();
        assert_eq!(err.msg, "unclosed list");
        let err = parse_yaml("a: 'oops\n").unwrap_err();
        assert_eq!(err.msg, "unterminated string literal");
    }
}
