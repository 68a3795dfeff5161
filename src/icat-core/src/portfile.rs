//! The ICAT bulk-metadata ("port file") format.
//!
//! A port file is a line-oriented, entity-grouped text document used by the
//! metadata export and import operations. Lines starting with `#` are
//! comments. The first non-comment line carries the format version as
//! `MAJOR.MINOR`. The body is a sequence of blocks separated by blank
//! lines; each block has a one-line entity descriptor followed by one data
//! row per entity:
//!
//! ```text
//! # Version of file format
//! 1.0
//!
//! Facility ( name:0, daysUntilRelease:1)
//! "Test port facility", 90
//!
//! InvestigationType (facility(name:0), name:1)
//! "Test port facility", "atype"
//!
//! DataCollection(?:0)
//! "a"
//!
//! DataCollectionDatafile(datafile(dataset(investigation(facility(name:0), name:1, visitId:2), name:3), name:4), dataCollection(?:5))
//! "Test port facility", "expt1", "one", "ds1", "df1", "a"
//! ```
//!
//! A field descriptor is either `name:N` (a scalar at column offset N),
//! `related(keySpec, ...)` (a foreign key identified by the related
//! entity's own key fields, recursively), or `?:N` (an anonymous per-row
//! identifier used to back-reference entities with no natural key, such as
//! DataCollection above). Back-references only ever point at strictly
//! earlier blocks; the format forbids forward references, so resolution is
//! a single top-to-bottom pass over one mutable symbol table.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{IcatError, Result};

/// Which attributes take part in an import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeScope {
    /// Include server-assigned audit fields (createId, createTime, modId,
    /// modTime). On import these are only honoured for a root user; for
    /// anyone else the server substitutes the caller and the current time.
    All,
    /// Only attributes a user may normally set. Audit fields are not
    /// admissible in headers at all.
    User,
}

impl AttributeScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::User => "user",
        }
    }
}

/// Behaviour when an imported entity already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateAction {
    /// Check that the new data matches the old.
    Check,
    /// Skip to the next row.
    Ignore,
    /// Replace old data with new.
    Overwrite,
    /// Raise an error.
    Throw,
}

impl DuplicateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Ignore => "ignore",
            Self::Overwrite => "overwrite",
            Self::Throw => "throw",
        }
    }
}

const AUDIT_FIELDS: [&str; 4] = ["createId", "createTime", "modId", "modTime"];

/// A single data value in a port file row.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    /// An ISO-8601 timestamp. A literal without a zone offset is
    /// interpreted as local time; the stored value is always UTC.
    Time(DateTime<Utc>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        '\n' => f.write_str("\\n")?,
                        '\u{000C}' => f.write_str("\\f")?,
                        '\u{0008}' => f.write_str("\\b")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            Literal::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Null => f.write_str("null"),
            Literal::Time(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl Literal {
    /// Classify an unquoted token: boolean and null literals are case
    /// insensitive, then decimal numbers, then ISO-8601 timestamps.
    fn from_bare(token: &str, line: usize) -> Result<Self> {
        if token.eq_ignore_ascii_case("true") {
            return Ok(Literal::Bool(true));
        }
        if token.eq_ignore_ascii_case("false") {
            return Ok(Literal::Bool(false));
        }
        if token.eq_ignore_ascii_case("null") {
            return Ok(Literal::Null);
        }
        if let Ok(n) = token.parse::<f64>() {
            return Ok(Literal::Num(n));
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(token) {
            return Ok(Literal::Time(t.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%.f") {
            // No zone offset: interpret as local time
            return match Local.from_local_datetime(&naive) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                    Ok(Literal::Time(t.with_timezone(&Utc)))
                }
                LocalResult::None => Err(IcatError::bad_parameter(format!(
                    "line {line}: {token} does not exist in the local time zone"
                ))),
            };
        }
        Err(IcatError::bad_parameter(format!(
            "line {line}: unrecognised literal {token}"
        )))
    }
}

/// One entry of an entity descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    /// `name:N` - a scalar field at column offset N.
    Scalar { name: String, col: usize },
    /// `name(keySpec, ...)` - a reference to a related entity identified
    /// by its own key fields, which may themselves recurse.
    Related { name: String, keys: Vec<FieldSpec> },
    /// `?:N` - an anonymous per-row identifier for back-referencing.
    Anon { col: usize },
}

impl FieldSpec {
    fn max_col(&self) -> usize {
        match self {
            FieldSpec::Scalar { col, .. } | FieldSpec::Anon { col } => *col,
            FieldSpec::Related { keys, .. } => {
                keys.iter().map(FieldSpec::max_col).max().unwrap_or(0)
            }
        }
    }

    fn write(&self, out: &mut String) {
        match self {
            FieldSpec::Scalar { name, col } => {
                out.push_str(name);
                out.push(':');
                out.push_str(&col.to_string());
            }
            FieldSpec::Anon { col } => {
                out.push_str("?:");
                out.push_str(&col.to_string());
            }
            FieldSpec::Related { name, keys } => {
                out.push_str(name);
                out.push('(');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.write(out);
                }
                out.push(')');
            }
        }
    }
}

/// One entity block: a descriptor and its data rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub entity_type: String,
    pub fields: Vec<FieldSpec>,
    pub rows: Vec<Vec<Literal>>,
}

impl Block {
    /// Number of columns each data row must supply.
    pub fn width(&self) -> usize {
        self.fields.iter().map(FieldSpec::max_col).max().map_or(0, |m| m + 1)
    }
}

/// A parsed port file.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub major: u32,
    pub minor: u32,
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            major: 1,
            minor: 0,
            blocks: Vec::new(),
        }
    }

    /// Parse a complete port file. Grammar violations fail with
    /// `BadParameter` naming the offending line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .filter(|(_, l)| !l.trim_start().starts_with('#'));

        let (major, minor) = loop {
            match lines.next() {
                Some((_, l)) if l.trim().is_empty() => continue,
                Some((n, l)) => break parse_version(l.trim(), n)?,
                None => return Err(IcatError::bad_parameter("Missing version line")),
            }
        };

        let mut blocks: Vec<Block> = Vec::new();
        let mut current: Option<Block> = None;
        for (n, line) in lines {
            let line = line.trim();
            if line.is_empty() {
                if let Some(block) = current.take() {
                    blocks.push(finish_block(block)?);
                }
                continue;
            }
            match current.as_mut() {
                None => current = Some(parse_header(line, n)?),
                Some(block) => {
                    let row = parse_row(line, n)?;
                    if row.len() != block.width() {
                        return Err(IcatError::bad_parameter(format!(
                            "line {n}: expected {} fields but found {}",
                            block.width(),
                            row.len()
                        )));
                    }
                    block.rows.push(row);
                }
            }
        }
        if let Some(block) = current.take() {
            blocks.push(finish_block(block)?);
        }

        tracing::debug!("Parsed port file with {} entity blocks", blocks.len());
        Ok(Self {
            major,
            minor,
            blocks,
        })
    }

    /// Render the document in port file syntax. Write is the syntactic
    /// inverse of parse; shared key values are repeated verbatim on every
    /// row, there is no run-length compression.
    pub fn write(&self, out: &mut String) {
        out.push_str("# Version of file format\n");
        out.push_str(&format!("{}.{}\n", self.major, self.minor));
        for block in &self.blocks {
            out.push('\n');
            out.push_str(&block.entity_type);
            out.push('(');
            for (i, field) in block.fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                field.write(out);
            }
            out.push_str(")\n");
            for row in &block.rows {
                for (i, value) in row.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&value.to_string());
                }
                out.push('\n');
            }
        }
    }

    /// Verify that every header is admissible under the given attribute
    /// scope: `User` forbids the server-assigned audit fields.
    pub fn check_attributes(&self, scope: AttributeScope) -> Result<()> {
        if scope == AttributeScope::All {
            return Ok(());
        }
        for block in &self.blocks {
            for field in &block.fields {
                if let FieldSpec::Scalar { name, .. } = field {
                    if AUDIT_FIELDS.contains(&name.as_str()) {
                        return Err(IcatError::bad_parameter(format!(
                            "{} may not be set for {} when importing user attributes",
                            name, block.entity_type
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the document into the entities and relations it describes.
    ///
    /// This is a single top-to-bottom pass: related field specs resolve
    /// depth-first against entities created by strictly earlier rows, and
    /// `?`-keyed rows register their value in a symbol table scoped to
    /// this call. A reference to a `?` value that no earlier block
    /// registered is a lookup miss, never a fresh entity. Forward
    /// references are impossible by construction; files that need them
    /// are malformed input, not a case to relax here.
    pub fn resolve(&self) -> Result<Vec<Entity>> {
        let mut state = Resolver::default();
        for block in &self.blocks {
            for row in &block.rows {
                state.apply_row(block, row)?;
            }
        }
        tracing::debug!("Resolved {} entities from port file", state.entities.len());
        Ok(state.entities)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write(&mut out);
        f.write_str(&out)
    }
}

/// An entity produced by [`Document::resolve`], with an id assigned in
/// document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: u64,
    pub entity_type: String,
    pub fields: BTreeMap<String, Literal>,
    /// Related field name to the id of the referenced entity.
    pub relations: BTreeMap<String, u64>,
}

#[derive(Default)]
struct Resolver {
    entities: Vec<Entity>,
    /// `?` symbol table: row literal to assigned entity id.
    anon: BTreeMap<String, u64>,
}

impl Resolver {
    fn apply_row(&mut self, block: &Block, row: &[Literal]) -> Result<()> {
        let mut fields = BTreeMap::new();
        let mut relations = BTreeMap::new();
        let mut anon_value = None;
        for spec in &block.fields {
            match spec {
                FieldSpec::Scalar { name, col } => {
                    fields.insert(name.clone(), column(row, *col)?.clone());
                }
                FieldSpec::Related { name, keys } => {
                    let target = self.resolve_related(name, keys, row)?;
                    relations.insert(name.clone(), target);
                }
                FieldSpec::Anon { col } => anon_value = Some(column(row, *col)?),
            }
        }
        let id = self.entities.len() as u64 + 1;
        if let Some(value) = anon_value {
            let key = value.to_string();
            if self.anon.insert(key.clone(), id).is_some() {
                return Err(IcatError::bad_parameter(format!(
                    "Anonymous key {key} defined more than once"
                )));
            }
        }
        self.entities.push(Entity {
            id,
            entity_type: block.entity_type.clone(),
            fields,
            relations,
        });
        Ok(())
    }

    /// Depth-first resolution of a related field spec against entities
    /// created by earlier rows.
    fn resolve_related(&self, name: &str, keys: &[FieldSpec], row: &[Literal]) -> Result<u64> {
        // A bare `?` key is a direct back-reference through the symbol table
        if let [FieldSpec::Anon { col }] = keys {
            let key = column(row, *col)?.to_string();
            return self.anon.get(&key).copied().ok_or_else(|| {
                IcatError::bad_parameter(format!(
                    "Anonymous key {key} referenced by {name} was never defined"
                ))
            });
        }

        let mut wanted_fields: Vec<(&str, &Literal)> = Vec::new();
        let mut wanted_relations: Vec<(&str, u64)> = Vec::new();
        for key in keys {
            match key {
                FieldSpec::Scalar { name, col } => wanted_fields.push((name, column(row, *col)?)),
                FieldSpec::Related { name, keys } => {
                    wanted_relations.push((name, self.resolve_related(name, keys, row)?));
                }
                FieldSpec::Anon { .. } => {
                    return Err(IcatError::bad_parameter(format!(
                        "A ? key of {name} cannot be combined with other key fields"
                    )));
                }
            }
        }

        // Earlier entities are scanned in creation order; the key fields
        // named by the spec must all match.
        for entity in &self.entities {
            let fields_match = wanted_fields
                .iter()
                .all(|(k, v)| entity.fields.get(*k) == Some(*v));
            let relations_match = wanted_relations
                .iter()
                .all(|(k, id)| entity.relations.get(*k) == Some(id));
            if fields_match && relations_match {
                return Ok(entity.id);
            }
        }
        Err(IcatError::bad_parameter(format!(
            "No entity matches the key fields given for {name}"
        )))
    }
}

fn column(row: &[Literal], col: usize) -> Result<&Literal> {
    row.get(col).ok_or_else(|| {
        IcatError::bad_parameter(format!("Column offset {col} is outside the data row"))
    })
}

fn parse_version(line: &str, n: usize) -> Result<(u32, u32)> {
    let bad = || {
        IcatError::bad_parameter(format!(
            "line {n}: expected a version of the form MAJOR.MINOR, found {line}"
        ))
    };
    let (major, minor) = line.split_once('.').ok_or_else(bad)?;
    Ok((
        major.trim().parse().map_err(|_| bad())?,
        minor.trim().parse().map_err(|_| bad())?,
    ))
}

fn finish_block(block: Block) -> Result<Block> {
    if block.rows.is_empty() {
        return Err(IcatError::bad_parameter(format!(
            "Entity block {} has no data rows",
            block.entity_type
        )));
    }
    Ok(block)
}

/// Parse an entity descriptor line: `EntityType ( fieldSpec, ... )`.
fn parse_header(line: &str, n: usize) -> Result<Block> {
    let mut p = Cursor { line, pos: 0, n };
    let entity_type = p.ident()?;
    p.expect('(')?;
    let fields = p.spec_list()?;
    p.expect(')')?;
    p.skip_ws();
    if p.pos != line.len() {
        return Err(p.error("trailing characters after entity descriptor"));
    }
    if fields.is_empty() {
        return Err(p.error("entity descriptor has no fields"));
    }
    Ok(Block {
        entity_type,
        fields,
        rows: Vec::new(),
    })
}

struct Cursor<'a> {
    line: &'a str,
    pos: usize,
    n: usize,
}

impl Cursor<'_> {
    fn error(&self, message: &str) -> IcatError {
        IcatError::bad_parameter(format!("line {}: {}", self.n, message))
    }

    fn skip_ws(&mut self) {
        while self.line[self.pos..].starts_with(' ') || self.line[self.pos..].starts_with('\t') {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.line[self.pos..].chars().next()
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.error(&format!("expected {c:?}")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.line[self.pos..].chars().next() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected a field or entity name"));
        }
        Ok(self.line[start..self.pos].to_string())
    }

    fn offset(&mut self) -> Result<usize> {
        self.skip_ws();
        let start = self.pos;
        while self.line[self.pos..].starts_with(|c: char| c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.line[start..self.pos]
            .parse()
            .map_err(|_| self.error("expected a column offset"))
    }

    fn spec_list(&mut self) -> Result<Vec<FieldSpec>> {
        let mut specs = vec![self.spec()?];
        while self.peek() == Some(',') {
            self.pos += 1;
            specs.push(self.spec()?);
        }
        Ok(specs)
    }

    fn spec(&mut self) -> Result<FieldSpec> {
        if self.peek() == Some('?') {
            self.pos += 1;
            self.expect(':')?;
            return Ok(FieldSpec::Anon { col: self.offset()? });
        }
        let name = self.ident()?;
        match self.peek() {
            Some(':') => {
                self.pos += 1;
                Ok(FieldSpec::Scalar {
                    name,
                    col: self.offset()?,
                })
            }
            Some('(') => {
                self.pos += 1;
                let keys = self.spec_list()?;
                self.expect(')')?;
                Ok(FieldSpec::Related { name, keys })
            }
            _ => Err(self.error("expected ':' or '(' after field name")),
        }
    }
}

/// Parse one data row of comma-separated literals.
fn parse_row(line: &str, n: usize) -> Result<Vec<Literal>> {
    let mut values = Vec::new();
    let mut rest = line;
    loop {
        rest = rest.trim_start();
        if let Some(after_quote) = rest.strip_prefix('"') {
            let (s, remaining) = parse_quoted(after_quote, n)?;
            values.push(Literal::Str(s));
            rest = remaining.trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let token = rest[..end].trim();
            if token.is_empty() {
                return Err(IcatError::bad_parameter(format!(
                    "line {n}: empty field in data row"
                )));
            }
            values.push(Literal::from_bare(token, n)?);
            rest = &rest[end..];
        }
        if rest.is_empty() {
            return Ok(values);
        }
        rest = rest
            .strip_prefix(',')
            .ok_or_else(|| IcatError::bad_parameter(format!("line {n}: expected ',' in data row")))?;
    }
}

/// Consume a quoted string body (opening quote already stripped),
/// returning the unescaped text and the remainder of the line.
fn parse_quoted(src: &str, n: usize) -> Result<(String, &str)> {
    let mut out = String::new();
    let mut chars = src.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((out, &src[i + 1..])),
            '\\' => {
                let Some((_, esc)) = chars.next() else { break };
                match esc {
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'f' => out.push('\u{000C}'),
                    'b' => out.push('\u{0008}'),
                    'n' => out.push('\n'),
                    '"' => out.push('"'),
                    '\'' => out.push('\''),
                    '\\' => out.push('\\'),
                    other => {
                        return Err(IcatError::bad_parameter(format!(
                            "line {n}: unrecognised escape \\{other}"
                        )))
                    }
                }
            }
            other => out.push(other),
        }
    }
    Err(IcatError::bad_parameter(format!(
        "line {n}: unterminated string"
    )))
}
