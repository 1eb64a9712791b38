//! Line-oriented text codec for casbin policy rules.
//!
//! # Format
//! One rule per line, `ptype,field1,field2,...`, lines joined by `\n`, no
//! header and no trailing newline. This is the casbin CSV policy format.
//!
//! # Quoting
//! A field is written raw unless it is empty, contains `,`, `"`, `\r` or `\n`,
//! starts with `#`, or has leading/trailing whitespace; such fields are wrapped
//! in double quotes with inner quotes doubled, so an empty field is `""`.
//! Plain rules therefore encode to exactly `ptype,a,b,c`, and any field text
//! survives a round trip.
//!
//! # Decoding
//! - Blank lines and `#` comments decode to nothing.
//! - Unquoted fields are trimmed, so hand-written `p, alice, data1, read`
//!   reads the same as `p,alice,data1,read`.
//! - Newlines inside quoted fields do not end a record.
use crate::errors::CodecError;
use casbin::Model;

/// Sections of a casbin model that hold policy rules, in persisted order.
pub const POLICY_SECTIONS: [&str; 2] = ["p", "g"];

/// One persisted rule: the section type tag plus its fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyLine {
    pub ptype: String,
    pub fields: Vec<String>,
}

impl PolicyLine {
    pub fn new<S>(ptype: impl Into<String>, fields: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        Self {
            ptype: ptype.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The model section a ptype lives in: its first character (`p2` -> `p`).
    pub fn section(&self) -> Option<&str> {
        let end = self.ptype.chars().next()?.len_utf8();
        Some(&self.ptype[..end])
    }
}

fn needs_quoting(field: &str) -> bool {
    field.is_empty()
        || field.contains([',', '"', '\r', '\n'])
        || field.starts_with('#')
        || field.trim() != field
}

fn push_field(out: &mut String, field: &str) {
    if needs_quoting(field) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

pub fn encode_line(line: &PolicyLine) -> String {
    let mut out = String::new();
    push_field(&mut out, &line.ptype);
    for field in &line.fields {
        out.push(',');
        push_field(&mut out, field);
    }
    out
}

pub fn encode_blob(lines: &[PolicyLine]) -> String {
    lines.iter().map(encode_line).collect::<Vec<_>>().join("\n")
}

fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }
}

fn split_tokens(line: &str) -> Result<Vec<String>, CodecError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        skip_whitespace(&mut chars);
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    None => return Err(CodecError::UnterminatedQuote),
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        token.push('"');
                    }
                    Some('"') => break,
                    Some(c) => token.push(c),
                }
            }
            tokens.push(token);
            skip_whitespace(&mut chars);
            match chars.next() {
                None => return Ok(tokens),
                Some(',') => {}
                Some(c) => return Err(CodecError::UnexpectedCharacter(c)),
            }
        } else {
            let mut token = String::new();
            loop {
                match chars.next() {
                    None => {
                        tokens.push(token.trim().to_string());
                        return Ok(tokens);
                    }
                    Some(',') => break,
                    Some(c) => token.push(c),
                }
            }
            tokens.push(token.trim().to_string());
        }
    }
}

/// Decode one record. Blank and comment lines yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<PolicyLine>, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let mut tokens = split_tokens(line)?.into_iter();
    let ptype = match tokens.next() {
        Some(ptype) if !ptype.is_empty() => ptype,
        _ => return Err(CodecError::MissingSectionType),
    };
    Ok(Some(PolicyLine {
        ptype,
        fields: tokens.collect(),
    }))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    LineStart,
    Comment,
    FieldStart,
    Unquoted,
    Quoted,
    AfterQuote,
}

/// Split a blob into records on newlines that are outside quoted fields.
/// Yields `(line_number, record)` with 1-based line numbers of each record start.
fn split_records(blob: &str) -> Vec<(usize, &str)> {
    let mut records = Vec::new();
    let mut state = Scan::LineStart;
    let mut start = 0;
    let mut line_no = 1;
    let mut record_line = 1;
    for (idx, c) in blob.char_indices() {
        if c == '\n' {
            line_no += 1;
        }
        state = match (state, c) {
            (Scan::Quoted, '"') => Scan::AfterQuote,
            (Scan::Quoted, _) => Scan::Quoted,
            (Scan::AfterQuote, '"') => Scan::Quoted,
            (_, '\n') => {
                records.push((record_line, &blob[start..idx]));
                start = idx + 1;
                record_line = line_no;
                Scan::LineStart
            }
            (Scan::Comment, _) => Scan::Comment,
            (Scan::LineStart, '#') => Scan::Comment,
            (_, ',') => Scan::FieldStart,
            (Scan::LineStart | Scan::FieldStart, '"') => Scan::Quoted,
            (s @ (Scan::LineStart | Scan::FieldStart), c) if c.is_whitespace() => s,
            _ => Scan::Unquoted,
        };
    }
    records.push((record_line, &blob[start..]));
    records
}

/// Strict decode: the first malformed record fails the whole blob.
pub fn try_decode_blob(blob: &str) -> Result<Vec<PolicyLine>, CodecError> {
    let mut lines = Vec::new();
    for (line, record) in split_records(blob) {
        match decode_line(record) {
            Ok(Some(decoded)) => lines.push(decoded),
            Ok(None) => {}
            Err(source) => {
                return Err(CodecError::AtLine {
                    line,
                    source: Box::new(source),
                });
            }
        }
    }
    Ok(lines)
}

/// Lenient decode: malformed records are logged and skipped.
pub fn decode_blob(blob: &str) -> Vec<PolicyLine> {
    split_records(blob)
        .into_iter()
        .filter_map(|(line, record)| match decode_line(record) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(line, error = %err, "skipping malformed policy line");
                None
            }
        })
        .collect()
}

/// Snapshot the model's rules: `p` before `g`, ptypes lexically, insertion order within a ptype.
pub fn model_lines(model: &dyn Model) -> Vec<PolicyLine> {
    let mut lines = Vec::new();
    for sec in POLICY_SECTIONS {
        let Some(assertions) = model.get_model().get(sec) else {
            continue;
        };
        let mut ptypes: Vec<&String> = assertions.keys().collect();
        ptypes.sort();
        for ptype in ptypes {
            for rule in model.get_policy(sec, ptype) {
                lines.push(PolicyLine {
                    ptype: ptype.clone(),
                    fields: rule,
                });
            }
        }
    }
    lines
}

pub fn encode_model(model: &dyn Model) -> String {
    encode_blob(&model_lines(model))
}

/// Feed rules into the model in order. Returns how many the model accepted.
///
/// Rules whose ptype the model does not declare are skipped; the model itself
/// drops exact duplicates.
pub fn load_lines_into_model(
    lines: impl IntoIterator<Item = PolicyLine>,
    model: &mut dyn Model,
) -> usize {
    let mut loaded = 0;
    for line in lines {
        let Some(sec) = line.section().map(str::to_string) else {
            continue;
        };
        let declared = model
            .get_model()
            .get(&sec)
            .is_some_and(|assertions| assertions.contains_key(&line.ptype));
        if !declared {
            tracing::warn!(ptype = %line.ptype, "skipping rule for undeclared policy type");
            continue;
        }
        if model.add_policy(&sec, &line.ptype, line.fields) {
            loaded += 1;
        }
    }
    loaded
}

pub fn load_blob_into_model(blob: &str, model: &mut dyn Model) -> usize {
    load_lines_into_model(decode_blob(blob), model)
}
