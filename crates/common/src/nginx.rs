//! nginx configuration model
//!
//! A small structured representation of nginx configuration text. The
//! synthesizer builds a tree of [`Node`]s and renders it; the repair pass
//! parses existing text back into the same tree with byte spans so it can cut
//! individual directives out of the original text without reformatting
//! anything else.

use crate::{Error, Result};
use std::fmt::Write as _;
use std::ops::Range;

const INDENT: &str = "    ";

/// One element of an nginx config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directive(Directive),
    Block(Block),
    Comment(Comment),
}

/// `name arg arg;`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    /// Arguments exactly as written, quotes included
    pub args: Vec<String>,
    /// Byte range from the first character of the name through the `;`
    pub span: Range<usize>,
    /// 1-based line of the directive name
    pub line: usize,
}

/// `name arg { ... }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub args: Vec<String>,
    pub children: Vec<Node>,
    /// Byte range from the first character of the name through the `}`
    pub span: Range<usize>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    /// Comment text without the leading `#`
    pub text: String,
    pub span: Range<usize>,
    pub line: usize,
}

impl Directive {
    pub fn new<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            span: 0..0,
            line: 0,
        }
    }

    /// Name plus arguments, used to detect verbatim repeats
    pub fn signature(&self) -> String {
        let mut sig = self.name.clone();
        for arg in &self.args {
            sig.push(' ');
            sig.push_str(arg);
        }
        sig
    }
}

impl Block {
    pub fn new<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            children: Vec::new(),
            span: 0..0,
            line: 0,
        }
    }

    /// Builder: append a directive
    pub fn directive<I, S>(mut self, name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children.push(Node::Directive(Directive::new(name, args)));
        self
    }

    /// Builder: append a nested block
    pub fn block(mut self, block: Block) -> Self {
        self.children.push(Node::Block(block));
        self
    }

    /// Builder: append a comment line
    pub fn comment(mut self, text: &str) -> Self {
        self.children.push(Node::Comment(Comment {
            text: format!(" {}", text),
            span: 0..0,
            line: 0,
        }));
        self
    }

    /// Header as written, e.g. `location /alice/app/`
    pub fn header(&self) -> String {
        let mut header = self.name.clone();
        for arg in &self.args {
            header.push(' ');
            header.push_str(arg);
        }
        header
    }

    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.children.iter().filter_map(|n| match n {
            Node::Directive(d) => Some(d),
            _ => None,
        })
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.children.iter().filter_map(|n| match n {
            Node::Block(b) => Some(b),
            _ => None,
        })
    }
}

/// Wrap a value in double quotes, escaping embedded quotes and backslashes.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Escape a literal for use inside a PCRE pattern argument.
pub fn regex_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\.+*?()|[]{}^$/".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Rendering
// ============================================================================

/// Render a list of top-level nodes. Output is a pure function of the tree.
pub fn render(nodes: &[Node]) -> String {
    let mut out = String::new();
    render_nodes(&mut out, nodes, 0);
    out
}

fn render_nodes(out: &mut String, nodes: &[Node], depth: usize) {
    for (idx, node) in nodes.iter().enumerate() {
        if idx > 0 && matches!(node, Node::Block(_)) {
            out.push('\n');
        }
        let indent = INDENT.repeat(depth);
        match node {
            Node::Directive(d) => {
                let _ = writeln!(out, "{}{};", indent, d.signature());
            }
            Node::Comment(c) => {
                let _ = writeln!(out, "{}#{}", indent, c.text);
            }
            Node::Block(b) => {
                let _ = writeln!(out, "{}{} {{", indent, b.header());
                render_nodes(out, &b.children, depth + 1);
                let _ = writeln!(out, "{}}}", indent);
            }
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug)]
enum Token {
    Word { text: String, start: usize, line: usize },
    Semicolon { end: usize },
    Open,
    Close { end: usize, line: usize },
    Comment { text: String, start: usize, end: usize, line: usize },
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\n' => {
                line += 1;
                i += 1;
            }
            b' ' | b'\t' | b'\r' => i += 1,
            b'#' => {
                let start = i;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                tokens.push(Token::Comment {
                    text: src[start + 1..i].to_string(),
                    start,
                    end: i,
                    line,
                });
            }
            b';' => {
                i += 1;
                tokens.push(Token::Semicolon { end: i });
            }
            b'{' => {
                i += 1;
                tokens.push(Token::Open);
            }
            b'}' => {
                i += 1;
                tokens.push(Token::Close { end: i, line });
            }
            b'"' | b'\'' => {
                let start = i;
                let start_line = line;
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return Err(Error::ConfigParse {
                            line: start_line,
                            message: "unterminated quoted string".to_string(),
                        });
                    }
                    match bytes[i] {
                        b'\\' => i += 2,
                        b'\n' => {
                            line += 1;
                            i += 1;
                        }
                        q if q == c => {
                            i += 1;
                            break;
                        }
                        _ => i += 1,
                    }
                }
                tokens.push(Token::Word {
                    text: src[start..i.min(bytes.len())].to_string(),
                    start,
                    line: start_line,
                });
            }
            _ => {
                let start = i;
                while i < bytes.len() {
                    match bytes[i] {
                        b' ' | b'\t' | b'\r' | b'\n' | b';' | b'{' | b'}' => break,
                        b'$' if bytes.get(i + 1) == Some(&b'{') => {
                            // ${var} keeps its braces inside the word
                            while i < bytes.len() && bytes[i] != b'}' {
                                i += 1;
                            }
                            i += 1;
                        }
                        b'\\' => i += 2,
                        _ => i += 1,
                    }
                }
                let end = i.min(bytes.len());
                tokens.push(Token::Word {
                    text: src[start..end].to_string(),
                    start,
                    line,
                });
            }
        }
    }

    Ok(tokens)
}

/// Parse nginx configuration text into a node tree with byte spans.
///
/// Nesting is tracked by brace depth; an unmatched `}` or a missing one is a
/// parse error.
pub fn parse(src: &str) -> Result<Vec<Node>> {
    let tokens = tokenize(src)?;

    let mut top: Vec<Node> = Vec::new();
    // Blocks opened but not yet closed, innermost last
    let mut open: Vec<Block> = Vec::new();
    let mut words: Vec<(String, usize, usize)> = Vec::new();

    fn children<'a>(top: &'a mut Vec<Node>, open: &'a mut [Block]) -> &'a mut Vec<Node> {
        match open.last_mut() {
            Some(block) => &mut block.children,
            None => top,
        }
    }

    for token in tokens {
        match token {
            Token::Word { text, start, line } => words.push((text, start, line)),
            Token::Comment { text, start, end, line } => {
                children(&mut top, &mut open).push(Node::Comment(Comment {
                    text,
                    span: start..end,
                    line,
                }));
            }
            Token::Semicolon { end } => {
                let mut iter = words.drain(..);
                let (name, start, line) = iter.next().ok_or_else(|| Error::ConfigParse {
                    line: line_of(src, end),
                    message: "unexpected ';'".to_string(),
                })?;
                let args = iter.map(|(w, _, _)| w).collect();
                children(&mut top, &mut open).push(Node::Directive(Directive {
                    name,
                    args,
                    span: start..end,
                    line,
                }));
            }
            Token::Open => {
                let mut iter = words.drain(..);
                let (name, start, line) = iter.next().ok_or_else(|| Error::ConfigParse {
                    line: open.last().map(|b| b.line).unwrap_or(1),
                    message: "block without a name".to_string(),
                })?;
                let mut block = Block::new(&name, iter.map(|(w, _, _)| w));
                block.span = start..start;
                block.line = line;
                open.push(block);
            }
            Token::Close { end, line } => {
                if !words.is_empty() {
                    return Err(Error::ConfigParse {
                        line,
                        message: "directive is missing its terminating ';'".to_string(),
                    });
                }
                let Some(mut block) = open.pop() else {
                    return Err(Error::ConfigParse {
                        line,
                        message: "unexpected '}'".to_string(),
                    });
                };
                block.span = block.span.start..end;
                children(&mut top, &mut open).push(Node::Block(block));
            }
        }
    }

    if let Some((_, _, line)) = words.first() {
        return Err(Error::ConfigParse {
            line: *line,
            message: "unexpected end of file, expecting ';'".to_string(),
        });
    }
    if let Some(unclosed) = open.last() {
        return Err(Error::ConfigParse {
            line: unclosed.line,
            message: format!("block '{}' is never closed", unclosed.header()),
        });
    }

    Ok(top)
}

fn line_of(src: &str, offset: usize) -> usize {
    src[..offset.min(src.len())].matches('\n').count() + 1
}

/// Widen a directive span to whole lines when the directive sits alone on
/// its line, so removing it leaves no blank line behind.
pub fn removal_range(src: &str, span: &Range<usize>) -> Range<usize> {
    let bytes = src.as_bytes();

    let line_start = src[..span.start].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let leading_blank = bytes[line_start..span.start]
        .iter()
        .all(|b| *b == b' ' || *b == b'\t');

    let line_end = src[span.end..]
        .find('\n')
        .map(|p| span.end + p + 1)
        .unwrap_or(src.len());
    let trailing_blank = bytes[span.end..line_end]
        .iter()
        .all(|b| b.is_ascii_whitespace());

    if leading_blank && trailing_blank {
        line_start..line_end
    } else {
        span.clone()
    }
}

/// Walk every block (depth first, including nested ones).
pub fn walk_blocks<'a>(nodes: &'a [Node], visit: &mut dyn FnMut(&'a Block)) {
    for node in nodes {
        if let Node::Block(b) = node {
            visit(b);
            walk_blocks(&b.children, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# generated
server {
    listen 80;
    server_name example.org;

    location /alice/app/ {
        proxy_pass http://127.0.0.1:9001;
        proxy_set_header Upgrade $http_upgrade;
        sub_filter '<title>App</title>' "<title>My {site}</title>";
    }
}
"#;

    #[test]
    fn test_parse_structure() {
        let nodes = parse(SAMPLE).unwrap();
        assert_eq!(nodes.len(), 2);
        let server = match &nodes[1] {
            Node::Block(b) => b,
            other => panic!("expected block, got {other:?}"),
        };
        assert_eq!(server.name, "server");
        assert_eq!(server.directives().count(), 2);

        let location = server.blocks().next().unwrap();
        assert_eq!(location.header(), "location /alice/app/");
        let sub = location.directives().find(|d| d.name == "sub_filter").unwrap();
        assert_eq!(sub.args[0], "'<title>App</title>'");
        assert_eq!(sub.args[1], "\"<title>My {site}</title>\"");
        assert_eq!(&SAMPLE[sub.span.clone()], "sub_filter '<title>App</title>' \"<title>My {site}</title>\";");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("server {"), Err(Error::ConfigParse { .. })));
        assert!(matches!(parse("}"), Err(Error::ConfigParse { .. })));
        assert!(matches!(parse("listen 80"), Err(Error::ConfigParse { .. })));
        assert!(matches!(parse("a \"open;"), Err(Error::ConfigParse { .. })));
        match parse("server {\n  listen 80\n}\n") {
            Err(Error::ConfigParse { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_render_is_reparseable() {
        let tree = vec![Node::Block(
            Block::new("server", Vec::<String>::new())
                .directive("listen", ["80"])
                .comment("tenants")
                .block(Block::new("location", ["/"]).directive("return", ["403"])),
        )];
        let text = render(&tree);
        assert_eq!(
            text,
            "server {\n    listen 80;\n    # tenants\n\n    location / {\n        return 403;\n    }\n}\n"
        );

        let reparsed = parse(&text).unwrap();
        assert_eq!(render(&reparsed), text);
    }

    #[test]
    fn test_removal_range_whole_line() {
        let src = "a {\n    x 1;\n    y 2;\n}\n";
        let nodes = parse(src).unwrap();
        let block = match &nodes[0] {
            Node::Block(b) => b,
            _ => unreachable!(),
        };
        let x = block.directives().next().unwrap();
        let range = removal_range(src, &x.span);
        let mut out = src.to_string();
        out.replace_range(range, "");
        assert_eq!(out, "a {\n    y 2;\n}\n");
    }

    #[test]
    fn test_quote_and_escape() {
        assert_eq!(quote(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(regex_escape("a.b"), "a\\.b");
    }
}
