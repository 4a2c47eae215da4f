//! Canvas markup grammars.
//!
//! The markup an LLM writes is a prompting convention, not a fixed format, so
//! grammars are pluggable and carry a version string. [`CodeBlockGrammar`]
//! reads the `canvas-code/1` convention: a fenced python block that builds the
//! canvas through method calls with keyword arguments.
//!
//! ```text
//! canvas = Canvas()
//! canvas.set_global_description(description='...', detailed_descriptions=[...],
//!     tags='...', HTML_web_color_name='...')
//! canvas.add_local_description(location='...', offset='...', area='...',
//!     distance_to_viewer=5.0, description='...', ...)
//! ```
//!
//! Only the call syntax is recognized; the block is never executed.

use std::collections::HashMap;

use super::vocab::{self, AREAS, COLORS, LOCATIONS, OFFSETS};
use super::{Canvas, GridRect, ParseOutcome, Rgb};
use crate::Result;

/// A versioned reader of canvas markup.
pub trait CanvasGrammar {
    fn version(&self) -> &'static str;
    fn parse(&self, raw: &str) -> ParseOutcome;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CodeBlockGrammar;

impl CodeBlockGrammar {
    pub const VERSION: &'static str = "canvas-code/1";
}

impl CanvasGrammar for CodeBlockGrammar {
    fn version(&self) -> &'static str {
        Self::VERSION
    }

    fn parse(&self, raw: &str) -> ParseOutcome {
        let Some(code) = code_block(raw) else {
            return ParseOutcome::NoCanvas;
        };
        match interpret(code) {
            Ok(canvas) => ParseOutcome::Valid(canvas),
            Err(crate::Error::MalformedCanvas(reason)) => ParseOutcome::Malformed(reason),
            Err(e) => ParseOutcome::Malformed(e.to_string()),
        }
    }
}

fn code_block(raw: &str) -> Option<&str> {
    const FENCE: &str = "```python";
    let start = raw.find(FENCE)? + FENCE.len();
    let body = &raw[start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn malformed(reason: impl Into<String>) -> crate::Error {
    crate::Error::MalformedCanvas(reason.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Punct(char),
}

fn lex(code: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '\'' | '"' => {
                let (text, next) = lex_string(&chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| malformed(format!("bad number literal `{text}`")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '(' | ')' | '[' | ']' | ',' | '=' | '.' | '-' => {
                tokens.push(Token::Punct(c));
                i += 1;
            }
            other => return Err(malformed(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

/// Lexes a single- or triple-quoted string starting at `start`.
fn lex_string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let mut i = start + if triple { 3 } else { 1 };
    let mut out = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            let escaped = chars.get(i + 1).copied().unwrap_or('\\');
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            i += 2;
            continue;
        }
        if c == quote {
            if !triple {
                return Ok((out, i + 1));
            }
            if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                return Ok((out, i + 3));
            }
        }
        if c == '\n' && !triple {
            break;
        }
        out.push(c);
        i += 1;
    }
    Err(malformed("unterminated string literal"))
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    List(Vec<Value>),
    Ident(String),
}

struct Call {
    method: String,
    positional: Vec<Value>,
    keywords: HashMap<String, Value>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, punct: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(c)) if c == punct => Ok(()),
            other => Err(malformed(format!("expected `{punct}`, found {other:?}"))),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(malformed(format!("expected a name, found {other:?}"))),
        }
    }

    fn value(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Str(mut text)) => {
                // Adjacent literals concatenate.
                while let Some(Token::Str(more)) = self.peek() {
                    text.push_str(more);
                    self.pos += 1;
                }
                Ok(Value::Str(text))
            }
            Some(Token::Num(n)) => Ok(Value::Num(n)),
            Some(Token::Punct('-')) => match self.next() {
                Some(Token::Num(n)) => Ok(Value::Num(-n)),
                other => Err(malformed(format!("expected a number after `-`, found {other:?}"))),
            },
            Some(Token::Punct('[')) => {
                let mut items = Vec::new();
                loop {
                    if self.peek() == Some(&Token::Punct(']')) {
                        self.pos += 1;
                        break;
                    }
                    items.push(self.value()?);
                    match self.next() {
                        Some(Token::Punct(',')) => {}
                        Some(Token::Punct(']')) => break,
                        other => return Err(malformed(format!("expected `,` or `]`, found {other:?}"))),
                    }
                }
                Ok(Value::List(items))
            }
            Some(Token::Ident(name)) => Ok(Value::Ident(name)),
            other => Err(malformed(format!("expected a value, found {other:?}"))),
        }
    }

    fn arguments(&mut self, method: String) -> Result<Call> {
        self.expect('(')?;
        let mut call = Call {
            method,
            positional: Vec::new(),
            keywords: HashMap::new(),
        };
        loop {
            if self.peek() == Some(&Token::Punct(')')) {
                self.pos += 1;
                return Ok(call);
            }
            let keyword = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(name)), Some(Token::Punct('='))) => {
                    let name = name.clone();
                    self.pos += 2;
                    Some(name)
                }
                _ => None,
            };
            let value = self.value()?;
            match keyword {
                Some(name) => {
                    call.keywords.insert(name, value);
                }
                None if call.keywords.is_empty() => call.positional.push(value),
                None => return Err(malformed("positional argument after keyword argument")),
            }
            match self.next() {
                Some(Token::Punct(',')) => {}
                Some(Token::Punct(')')) => return Ok(call),
                other => return Err(malformed(format!("expected `,` or `)`, found {other:?}"))),
            }
        }
    }
}

/// Reads the statements of a code block into canvas method calls.
fn statements(code: &str) -> Result<Vec<Call>> {
    let mut parser = Parser {
        tokens: lex(code)?,
        pos: 0,
    };
    let mut canvas_var: Option<String> = None;
    let mut calls = Vec::new();
    while parser.peek().is_some() {
        let name = parser.ident()?;
        match parser.next() {
            Some(Token::Punct('=')) => {
                let class = parser.ident()?;
                if class != "Canvas" {
                    return Err(malformed(format!("`{name}` is assigned `{class}`, not a Canvas")));
                }
                parser.expect('(')?;
                parser.expect(')')?;
                canvas_var = Some(name);
            }
            Some(Token::Punct('.')) => {
                if canvas_var.as_deref() != Some(name.as_str()) {
                    return Err(malformed(format!("`{name}` is not a canvas")));
                }
                let method = parser.ident()?;
                calls.push(parser.arguments(method)?);
            }
            other => return Err(malformed(format!("unexpected {other:?} after `{name}`"))),
        }
    }
    if canvas_var.is_none() {
        return Err(malformed("code block never creates a Canvas"));
    }
    Ok(calls)
}

/// Named access to a call's arguments, positional ones mapped by parameter order.
struct Args<'a> {
    method: &'a str,
    values: HashMap<&'a str, &'a Value>,
}

impl<'a> Args<'a> {
    fn bind(call: &'a Call, params: &[&'a str]) -> Result<Self> {
        if call.positional.len() > params.len() {
            return Err(malformed(format!("too many arguments to `{}`", call.method)));
        }
        let mut values: HashMap<&'a str, &'a Value> =
            params.iter().copied().zip(call.positional.iter()).collect();
        for (name, value) in &call.keywords {
            let Some(param) = params.iter().find(|p| **p == name) else {
                return Err(malformed(format!("`{}` has no argument `{name}`", call.method)));
            };
            values.insert(*param, value);
        }
        Ok(Self {
            method: &call.method,
            values,
        })
    }

    fn str(&self, name: &str) -> Result<&'a str> {
        match self.values.get(name).copied() {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(malformed(format!("`{}`: `{name}` must be a string, got {other:?}", self.method))),
            None => Err(malformed(format!("`{}`: missing `{name}`", self.method))),
        }
    }

    fn opt_str(&self, name: &str) -> Result<Option<&'a str>> {
        match self.values.get(name).copied() {
            None | Some(Value::Ident(_)) => Ok(None),
            Some(_) => self.str(name).map(Some),
        }
    }

    fn str_list(&self, name: &str) -> Result<Vec<&'a str>> {
        match self.values.get(name).copied() {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Str(s) => Ok(s.as_str()),
                    other => Err(malformed(format!("`{}`: `{name}` holds {other:?}", self.method))),
                })
                .collect(),
            Some(other) => Err(malformed(format!("`{}`: `{name}` must be a list, got {other:?}", self.method))),
        }
    }

    fn num(&self, name: &str) -> Result<f64> {
        match self.values.get(name).copied() {
            Some(Value::Num(n)) => Ok(*n),
            Some(other) => Err(malformed(format!("`{}`: `{name}` must be a number, got {other:?}", self.method))),
            None => Err(malformed(format!("`{}`: missing `{name}`", self.method))),
        }
    }
}

/// Normalizes one sentence: trims separators and ends it with a period.
pub fn sentence(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}.", collapsed.trim_matches(|c| c == ',' || c == '.' || c == ' '))
}

fn lookup<T: Copy>(table: &[(&str, T)], what: &str, value: &str) -> Result<T> {
    vocab::closest(value, table)
        .map(|(_, v)| v)
        .ok_or_else(|| malformed(format!("unknown {what} `{value}`")))
}

fn color(args: &Args<'_>) -> Result<Option<Rgb>> {
    args.opt_str("HTML_web_color_name")?
        .map(|name| lookup(COLORS, "color", name))
        .transpose()
}

const GLOBAL_PARAMS: &[&str] = &[
    "description",
    "detailed_descriptions",
    "tags",
    "HTML_web_color_name",
];

const LOCAL_PARAMS: &[&str] = &[
    "location",
    "offset",
    "area",
    "distance_to_viewer",
    "description",
    "detailed_descriptions",
    "tags",
    "atmosphere",
    "style",
    "quality_meta",
    "HTML_web_color_name",
];

struct Local {
    bounds: GridRect,
    description: String,
    suffixes: Vec<String>,
    color: Option<Rgb>,
    distance: f32,
}

fn interpret(code: &str) -> Result<Canvas> {
    let mut global: Option<(String, Vec<String>, Option<Rgb>)> = None;
    let mut locals = Vec::new();

    for call in statements(code)? {
        match call.method.as_str() {
            "set_global_description" => {
                let args = Args::bind(&call, GLOBAL_PARAMS)?;
                let mut suffixes: Vec<String> =
                    args.str_list("detailed_descriptions")?.into_iter().map(sentence).collect();
                if let Some(tags) = args.opt_str("tags")? {
                    suffixes.push(sentence(tags));
                }
                global = Some((sentence(args.str("description")?), suffixes, color(&args)?));
            }
            "add_local_description" => {
                let args = Args::bind(&call, LOCAL_PARAMS)?;
                let (cx, cy) = lookup(LOCATIONS, "location", args.str("location")?)?;
                let (dx, dy) = lookup(OFFSETS, "offset", args.str("offset")?)?;
                let (w, h) = lookup(AREAS, "area", args.str("area")?)?;
                let distance = args.num("distance_to_viewer")?;
                if !(distance.is_finite() && distance > 0.0) {
                    return Err(malformed(format!("distance_to_viewer must be positive, got {distance}")));
                }
                let mut suffixes: Vec<String> =
                    args.str_list("detailed_descriptions")?.into_iter().map(sentence).collect();
                for key in ["tags", "atmosphere", "style", "quality_meta"] {
                    if let Some(text) = args.opt_str(key)? {
                        suffixes.push(sentence(text));
                    }
                }
                locals.push(Local {
                    bounds: GridRect::centred(cx + dx, cy + dy, w, h)?,
                    description: sentence(args.str("description")?),
                    suffixes,
                    color: color(&args)?,
                    distance: distance as f32,
                });
            }
            other => return Err(malformed(format!("unknown canvas method `{other}`"))),
        }
    }

    if global.is_none() && locals.is_empty() {
        return Err(malformed("canvas declares no regions"));
    }

    // Far regions first so nearer ones paint over them.
    locals.sort_by(|a, b| b.distance.total_cmp(&a.distance));

    let mut builder = Canvas::builder();
    let mut global_prefix = String::new();
    if let Some((description, suffixes, color)) = global {
        builder = builder.background(join(&description, &suffixes), color);
        global_prefix = description;
    }
    for local in locals {
        let prefix = if global_prefix.is_empty() {
            local.description
        } else {
            format!("{global_prefix} {}", local.description)
        };
        builder = builder.region_at_distance(
            local.bounds,
            join(&prefix, &local.suffixes),
            local.color,
            local.distance,
        );
    }
    builder.build()
}

fn join(prefix: &str, suffixes: &[String]) -> String {
    std::iter::once(prefix)
        .chain(suffixes.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
