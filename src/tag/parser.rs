//! Parsers for tag lists and tag queries.
//!
//! Tag lists are comma/bracket separated (`football,team[chicago]`). Tag
//! queries add a boolean algebra with precedence `|` < `^` < `&` < `!` and
//! the `~` has-descendant marker. Syntax errors carry a caret-annotated
//! snippet of the input.

use crate::error::{FilemassError, Result};
use crate::tag::Tag;
use crate::tag::query::TagQuery;

/// Characters that terminate a tag-list name.
const LIST_DELIMITERS: &[u8] = b"[],";

/// Characters that terminate a query tag name.
const QUERY_DELIMITERS: &[u8] = b"[],&|^!~()";

fn syntax_error(input: &str, pos1: usize, pos2: Option<usize>, msg: &str) -> FilemassError {
    let (pos1, pos2) = match pos2 {
        Some(p2) if p2 != pos1 => (pos1.min(p2), Some(pos1.max(p2))),
        _ => (pos1, None),
    };
    let mut out = String::new();
    out.push('\n');
    out.push_str(input);
    out.push('\n');
    for _ in 0..pos1 {
        out.push(' ');
    }
    out.push('^');
    if let Some(p2) = pos2 {
        for _ in 0..p2.saturating_sub(pos1 + 1) {
            out.push(' ');
        }
        out.push('^');
    }
    out.push('\n');
    out.push_str(msg);
    FilemassError::Syntax(out)
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Cursor<'a> {
        Cursor { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.bump();
        }
    }

    fn error(&self, pos1: usize, pos2: Option<usize>, msg: &str) -> FilemassError {
        syntax_error(self.input, pos1, pos2, msg)
    }
}

/// Parse a comma-separated tag list: `TAG ("," TAG)*` where
/// `TAG := NAME ("[" TAG_LIST "]")?`.
pub fn parse_tag_list(input: &str) -> Result<Vec<Tag>> {
    let mut cursor = Cursor::new(input);
    let tags = parse_list(&mut cursor)?;
    if !cursor.at_end() {
        return Err(cursor.error(
            cursor.pos,
            None,
            "syntax error in tag list: unexpected character",
        ));
    }
    Ok(tags)
}

fn parse_list(cursor: &mut Cursor) -> Result<Vec<Tag>> {
    let mut tags = vec![parse_one_tag(cursor)?];
    while cursor.peek() == Some(b',') {
        cursor.bump();
        tags.push(parse_one_tag(cursor)?);
    }
    Ok(tags)
}

fn parse_one_tag(cursor: &mut Cursor) -> Result<Tag> {
    let start = cursor.pos;
    while let Some(c) = cursor.peek() {
        if LIST_DELIMITERS.contains(&c) {
            break;
        }
        cursor.bump();
    }
    if cursor.pos == start {
        return Err(cursor.error(start, None, "syntax error in tag list: expected tag name"));
    }
    let mut tag = Tag::new(&cursor.input[start..cursor.pos]);

    if cursor.peek() == Some(b'[') {
        let opening = cursor.pos;
        cursor.bump();
        tag.subtags = parse_list(cursor)?;
        if cursor.peek() != Some(b']') {
            return Err(cursor.error(
                opening,
                Some(cursor.pos),
                "syntax error in tag list: [ not closed with ]",
            ));
        }
        cursor.bump();
    }
    Ok(tag)
}

/// Parse a tag query. Precedence low to high: `|`, `^`, `&`, unary `!`;
/// primaries are `( QUERY )` and `["~"] NAME ("[" QUERY "]")?`.
pub fn parse_tag_query(input: &str) -> Result<TagQuery> {
    let mut cursor = Cursor::new(input);
    let query = parse_or(&mut cursor)?;
    cursor.skip_whitespace();
    if !cursor.at_end() {
        return Err(cursor.error(
            cursor.pos,
            None,
            "syntax error in tag query: unexpected character",
        ));
    }
    Ok(query)
}

fn parse_or(cursor: &mut Cursor) -> Result<TagQuery> {
    let mut operands = vec![parse_xor(cursor)?];
    cursor.skip_whitespace();
    while cursor.peek() == Some(b'|') {
        cursor.bump();
        operands.push(parse_xor(cursor)?);
        cursor.skip_whitespace();
    }
    Ok(collapse(operands, TagQuery::Or))
}

fn parse_xor(cursor: &mut Cursor) -> Result<TagQuery> {
    let mut operands = vec![parse_and(cursor)?];
    cursor.skip_whitespace();
    while cursor.peek() == Some(b'^') {
        cursor.bump();
        operands.push(parse_and(cursor)?);
        cursor.skip_whitespace();
    }
    Ok(collapse(operands, TagQuery::Xor))
}

fn parse_and(cursor: &mut Cursor) -> Result<TagQuery> {
    let mut operands = vec![parse_not(cursor)?];
    cursor.skip_whitespace();
    while cursor.peek() == Some(b'&') {
        cursor.bump();
        operands.push(parse_not(cursor)?);
        cursor.skip_whitespace();
    }
    Ok(collapse(operands, TagQuery::And))
}

fn collapse(mut operands: Vec<TagQuery>, combine: fn(Vec<TagQuery>) -> TagQuery) -> TagQuery {
    if operands.len() == 1 {
        operands.remove(0)
    } else {
        combine(operands)
    }
}

fn parse_not(cursor: &mut Cursor) -> Result<TagQuery> {
    cursor.skip_whitespace();
    if cursor.peek() == Some(b'!') {
        cursor.bump();
        let sub = parse_not(cursor)?;
        return Ok(TagQuery::Not(Box::new(sub)));
    }
    parse_primary(cursor)
}

fn parse_primary(cursor: &mut Cursor) -> Result<TagQuery> {
    cursor.skip_whitespace();

    if cursor.peek() == Some(b'(') {
        let opening = cursor.pos;
        cursor.bump();
        let query = parse_or(cursor)?;
        cursor.skip_whitespace();
        if cursor.peek() != Some(b')') {
            return Err(cursor.error(
                opening,
                Some(cursor.pos),
                "syntax error in tag query: ( not closed with )",
            ));
        }
        cursor.bump();
        return Ok(query);
    }

    let descendant = cursor.peek() == Some(b'~');
    if descendant {
        cursor.bump();
        cursor.skip_whitespace();
    }

    let name = read_tag_name(cursor)?;
    cursor.skip_whitespace();

    if cursor.peek() == Some(b'[') {
        let opening = cursor.pos;
        cursor.bump();
        let query = parse_or(cursor)?;
        cursor.skip_whitespace();
        if cursor.peek() != Some(b']') {
            return Err(cursor.error(
                opening,
                Some(cursor.pos),
                "syntax error in tag query: [ not closed with ]",
            ));
        }
        cursor.bump();
        return Ok(if descendant {
            TagQuery::has_descendant_with_query(&name, query)
        } else {
            TagQuery::has_child_with_query(&name, query)
        });
    }

    Ok(if descendant {
        TagQuery::has_descendant(&name)
    } else {
        TagQuery::has_child(&name)
    })
}

/// Read a tag name up to the next query delimiter; surrounding whitespace is
/// insignificant, interior whitespace belongs to the name.
fn read_tag_name(cursor: &mut Cursor) -> Result<String> {
    cursor.skip_whitespace();
    let start = cursor.pos;
    let mut last_non_whitespace = None;
    while let Some(c) = cursor.peek() {
        if QUERY_DELIMITERS.contains(&c) {
            break;
        }
        if !matches!(c, b' ' | b'\t' | b'\r' | b'\n') {
            last_non_whitespace = Some(cursor.pos);
        }
        cursor.bump();
    }
    match last_non_whitespace {
        Some(end) => Ok(cursor.input[start..=end].to_owned()),
        None => Err(cursor.error(start, None, "syntax error in tag query: expected tag name")),
    }
}
