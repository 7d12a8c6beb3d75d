//! gridtool: a pipeline-style CSV data processor with non-standard syntax.
//!
//! The executor tool takes a full script per call: commands run top to
//! bottom over an in-memory table, `SHOW` renders CSV output. The DSL is
//! deliberately not SQL: operators are words (`eq`, `gt`, ...), aggregation
//! uses `TALLY group_col -> alias=func(col)`, and function names are
//! lowercase. Error messages name the violated rule so failure fingerprints
//! carry usable structure.

use super::{DomainDoc, ToolAdapter, ToolOutcome, ToolSpec};

use schemars::JsonSchema;
use serde::Deserialize;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) const VALID_OPS: &[&str] = &["eq", "neq", "gt", "lt", "gte", "lte"];
const SYMBOL_OPS: &[&str] = &["=", "!=", ">", "<", ">=", "<=", "==", "<>"];
const AGG_FUNCS: &[&str] = &["sum", "count", "avg", "min", "max"];

/// Common SQL habits mapped to the gridtool command they meant.
const SQL_MISTAKES: &[(&str, &str)] = &[
    ("SELECT", "PICK"),
    ("ORDER", "RANK"),
    ("SORT", "RANK"),
    ("GROUP", "TALLY"),
    ("OUTPUT", "SHOW"),
    ("PRINT", "SHOW"),
    ("FILTER", "KEEP"),
    ("WHERE", "KEEP"),
    ("JOIN", "MERGE"),
    ("DROP", "TOSS"),
    ("EXCLUDE", "TOSS"),
    ("COMPUTE", "DERIVE"),
    ("CALCULATE", "DERIVE"),
    ("IMPORT", "LOAD"),
    ("READ", "LOAD"),
    ("OPEN", "LOAD"),
];

const COMMANDS: &[&str] = &[
    "LOAD", "KEEP", "TOSS", "TALLY", "RANK", "PICK", "DERIVE", "MERGE", "SHOW",
];

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// In-memory table with stable column order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    fn available(&self) -> String {
        if self.columns.is_empty() {
            "(no data loaded)".into()
        } else {
            self.columns.join(", ")
        }
    }
}

fn fail(lineno: usize, message: impl Into<String>) -> String {
    format!("ERROR at line {lineno}: {}", message.into())
}

fn try_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn compare(row_value: &str, op: &str, target: &str) -> bool {
    let ordering = match (try_number(row_value), try_number(target)) {
        (Some(left), Some(right)) => left.partial_cmp(&right),
        _ => Some(row_value.cmp(target)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        "eq" => ordering == std::cmp::Ordering::Equal,
        "neq" => ordering != std::cmp::Ordering::Equal,
        "gt" => ordering == std::cmp::Ordering::Greater,
        "lt" => ordering == std::cmp::Ordering::Less,
        "gte" => ordering != std::cmp::Ordering::Less,
        "lte" => ordering != std::cmp::Ordering::Greater,
        _ => false,
    }
}

/// Extract a leading double-quoted string, returning (value, rest).
fn parse_quoted(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((rest[..end].to_owned(), rest[end + 1..].trim().to_owned()))
}

fn read_csv(path: &Path) -> Result<Table, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|error| format!("failed reading {}: {error}", path.display()))?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Ok(Table::default());
    };
    let columns: Vec<String> = header.split(',').map(|cell| cell.trim().to_owned()).collect();
    let rows = lines
        .map(|line| {
            let mut cells: Vec<String> =
                line.split(',').map(|cell| cell.trim().to_owned()).collect();
            cells.resize(columns.len(), String::new());
            cells
        })
        .collect();
    Ok(Table { columns, rows })
}

/// Script interpreter over a working directory. Returns accumulated SHOW
/// output on success, or an `ERROR at line N: ...` string.
pub(crate) fn run_script(script: &str, work_dir: &Path) -> Result<String, String> {
    let mut table = Table::default();
    let mut output = String::new();

    for (index, raw_line) in script.lines().enumerate() {
        let lineno = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (command_raw, args) = match line.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (line, ""),
        };
        let command = command_raw.to_uppercase();

        if !COMMANDS.contains(&command.as_str()) {
            if let Some((_, suggestion)) =
                SQL_MISTAKES.iter().find(|(mistake, _)| *mistake == command)
            {
                return Err(fail(
                    lineno,
                    format!("Unknown command '{command}'. Did you mean '{suggestion}'?"),
                ));
            }
            return Err(fail(
                lineno,
                format!("Unknown command '{command}'. Valid commands: {}", COMMANDS.join(", ")),
            ));
        }

        match command.as_str() {
            "LOAD" => table = cmd_load(args, work_dir, lineno)?,
            "KEEP" => table = cmd_filter(args, table, lineno, "KEEP", true)?,
            "TOSS" => table = cmd_filter(args, table, lineno, "TOSS", false)?,
            "TALLY" => table = cmd_tally(args, table, lineno)?,
            "RANK" => table = cmd_rank(args, table, lineno)?,
            "PICK" => table = cmd_pick(args, table, lineno)?,
            "DERIVE" => table = cmd_derive(args, table, lineno)?,
            "MERGE" => table = cmd_merge(args, table, work_dir, lineno)?,
            "SHOW" => cmd_show(args, &table, lineno, &mut output)?,
            _ => unreachable!("command validated above"),
        }
    }

    Ok(output)
}

fn require_data(table: &Table, lineno: usize, command: &str) -> Result<(), String> {
    if table.columns.is_empty() {
        return Err(fail(lineno, format!("{command} requires data. Use LOAD first.")));
    }
    Ok(())
}

fn check_column(column: &str, table: &Table, lineno: usize) -> Result<usize, String> {
    table.column_index(column).ok_or_else(|| {
        fail(
            lineno,
            format!("Column '{column}' not found. Available: {}", table.available()),
        )
    })
}

fn cmd_load(args: &str, work_dir: &Path, lineno: usize) -> Result<Table, String> {
    let Some((path, _)) = parse_quoted(args) else {
        return Err(fail(lineno, r#"LOAD path must be quoted. Use: LOAD "filename.csv""#));
    };
    let resolved = work_dir.join(&path);
    if !resolved.is_file() {
        return Err(fail(
            lineno,
            format!("File not found: \"{path}\" (resolved to {})", resolved.display()),
        ));
    }
    read_csv(&resolved).map_err(|error| fail(lineno, error))
}

/// Split filter args handling a quoted value: `col op "some value"`.
fn tokenize_filter(args: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut rest = args.trim();
    for _ in 0..2 {
        match rest.split_once(char::is_whitespace) {
            Some((token, remainder)) => {
                parts.push(token.to_owned());
                rest = remainder.trim();
            }
            None => {
                if !rest.is_empty() {
                    parts.push(rest.to_owned());
                }
                return parts;
            }
        }
    }
    if let Some((quoted, _)) = parse_quoted(rest) {
        parts.push(quoted);
    } else if !rest.is_empty() {
        parts.push(rest.to_owned());
    }
    parts
}

fn cmd_filter(
    args: &str,
    table: Table,
    lineno: usize,
    command: &str,
    keep: bool,
) -> Result<Table, String> {
    require_data(&table, lineno, command)?;
    let parts = tokenize_filter(args);
    if parts.len() < 3 {
        return Err(fail(lineno, format!("{command} syntax: {command} column op value")));
    }
    let (column, op, value) = (&parts[0], &parts[1], &parts[2]);
    let column_index = check_column(column, &table, lineno)?;
    if SYMBOL_OPS.contains(&op.as_str()) {
        return Err(fail(
            lineno,
            format!("{command} requires word operator (eq/neq/gt/lt/gte/lte), got '{op}'"),
        ));
    }
    if !VALID_OPS.contains(&op.as_str()) {
        return Err(fail(
            lineno,
            format!("{command} unknown operator '{op}'. Valid: eq, neq, gt, lt, gte, lte"),
        ));
    }
    let rows = table
        .rows
        .iter()
        .filter(|row| compare(&row[column_index], op, value) == keep)
        .cloned()
        .collect();
    Ok(Table {
        columns: table.columns,
        rows,
    })
}

fn cmd_tally(args: &str, table: Table, lineno: usize) -> Result<Table, String> {
    require_data(&table, lineno, "TALLY")?;
    let Some((group_col, agg_str)) = args.split_once("->") else {
        return Err(fail(
            lineno,
            "TALLY syntax: TALLY group_col -> alias=func(agg_col). Got invalid format.",
        ));
    };
    let group_col = group_col.trim();
    let group_index = check_column(group_col, &table, lineno)?;

    let mut specs: Vec<(String, String, usize)> = Vec::new();
    for part in agg_str.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((alias, call)) = part.split_once('=') else {
            return Err(fail(
                lineno,
                "TALLY syntax: TALLY group_col -> alias=func(agg_col). Got invalid format.",
            ));
        };
        let alias = alias.trim();
        let call = call.trim();
        let Some((func, rest)) = call.split_once('(') else {
            return Err(fail(
                lineno,
                "TALLY syntax: TALLY group_col -> alias=func(agg_col). Got invalid format.",
            ));
        };
        let Some(agg_col) = rest.strip_suffix(')') else {
            return Err(fail(
                lineno,
                format!(
                    "TALLY: unexpected text after '{alias}={call}'. Separate multiple \
                     aggregations with commas, e.g.: TALLY {group_col} -> a=sum(x), b=count(y)"
                ),
            ));
        };
        let func = func.trim();
        let agg_col = agg_col.trim();
        if func != func.to_lowercase() {
            return Err(fail(
                lineno,
                format!("Unknown function '{func}'. Use lowercase: {}", func.to_lowercase()),
            ));
        }
        if !AGG_FUNCS.contains(&func) {
            return Err(fail(
                lineno,
                format!("Unknown function '{func}'. Available: sum, count, avg, min, max"),
            ));
        }
        let agg_index = check_column(agg_col, &table, lineno)?;
        specs.push((alias.to_owned(), func.to_owned(), agg_index));
    }

    // Group in first-seen key order so output is deterministic.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Vec<String>>> = HashMap::new();
    for row in &table.rows {
        let key = row[group_index].clone();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }

    let mut columns = vec![group_col.to_owned()];
    columns.extend(specs.iter().map(|(alias, _, _)| alias.clone()));

    let mut rows = Vec::with_capacity(order.len());
    for key in order {
        let group_rows = &groups[&key];
        let mut out = vec![key.clone()];
        for (_, func, agg_index) in &specs {
            let numeric: Vec<f64> = group_rows
                .iter()
                .filter_map(|row| try_number(&row[*agg_index]))
                .collect();
            let value = match func.as_str() {
                "count" => format_number(group_rows.len() as f64),
                "sum" => format_number(numeric.iter().sum()),
                "avg" => {
                    if numeric.is_empty() {
                        "0".into()
                    } else {
                        format_number(numeric.iter().sum::<f64>() / numeric.len() as f64)
                    }
                }
                "min" => numeric
                    .iter()
                    .copied()
                    .fold(None::<f64>, |best, v| Some(best.map_or(v, |b| b.min(v))))
                    .map(format_number)
                    .unwrap_or_default(),
                "max" => numeric
                    .iter()
                    .copied()
                    .fold(None::<f64>, |best, v| Some(best.map_or(v, |b| b.max(v))))
                    .map(format_number)
                    .unwrap_or_default(),
                _ => unreachable!("func validated above"),
            };
            out.push(value);
        }
        rows.push(out);
    }

    Ok(Table { columns, rows })
}

fn cmd_rank(args: &str, table: Table, lineno: usize) -> Result<Table, String> {
    require_data(&table, lineno, "RANK")?;
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(fail(lineno, "RANK syntax: RANK column asc|desc"));
    }
    let column_index = check_column(parts[0], &table, lineno)?;
    let direction = parts[1].to_lowercase();
    if direction != "asc" && direction != "desc" {
        return Err(fail(
            lineno,
            format!("RANK direction must be 'asc' or 'desc', got '{}'", parts[1]),
        ));
    }
    let mut rows = table.rows;
    rows.sort_by(|a, b| {
        let left = &a[column_index];
        let right = &b[column_index];
        match (try_number(left), try_number(right)) {
            (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
            _ => left.cmp(right),
        }
    });
    if direction == "desc" {
        rows.reverse();
    }
    Ok(Table {
        columns: table.columns,
        rows,
    })
}

fn cmd_pick(args: &str, table: Table, lineno: usize) -> Result<Table, String> {
    require_data(&table, lineno, "PICK")?;
    let mut indexes = Vec::new();
    let mut columns = Vec::new();
    for column in args.split(',') {
        let column = column.trim();
        indexes.push(check_column(column, &table, lineno)?);
        columns.push(column.to_owned());
    }
    let rows = table
        .rows
        .iter()
        .map(|row| indexes.iter().map(|index| row[*index].clone()).collect())
        .collect();
    Ok(Table { columns, rows })
}

fn cmd_derive(args: &str, table: Table, lineno: usize) -> Result<Table, String> {
    require_data(&table, lineno, "DERIVE")?;
    let Some((new_col, expr)) = args.split_once('=') else {
        return Err(fail(lineno, "DERIVE syntax: DERIVE new_col = expression"));
    };
    let new_col = new_col.trim().to_owned();
    let tokens = expr_tokens(expr.trim());
    if tokens.is_empty() {
        return Err(fail(lineno, "DERIVE expression is empty."));
    }

    let mut columns = table.columns.clone();
    columns.push(new_col);
    let mut rows = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let mut resolved: Vec<ExprToken> = Vec::with_capacity(tokens.len());
        for token in &tokens {
            match token {
                ExprToken::Op(op) => resolved.push(ExprToken::Op(*op)),
                ExprToken::Ident(name) => {
                    if let Some(index) = table.column_index(name) {
                        let value = try_number(&row[index]).unwrap_or(0.0);
                        resolved.push(ExprToken::Number(value));
                    } else if let Some(value) = try_number(name) {
                        resolved.push(ExprToken::Number(value));
                    } else {
                        return Err(fail(
                            lineno,
                            format!("Column '{name}' not found. Available: {}", table.available()),
                        ));
                    }
                }
                ExprToken::Number(value) => resolved.push(ExprToken::Number(*value)),
            }
        }
        let value = eval_expr(&resolved)
            .map_err(|error| fail(lineno, format!("DERIVE evaluation error: {error}")))?;
        let mut out = row.clone();
        out.push(format_number(value));
        rows.push(out);
    }
    Ok(Table { columns, rows })
}

#[derive(Debug, Clone)]
enum ExprToken {
    Ident(String),
    Number(f64),
    Op(char),
}

fn expr_tokens(expr: &str) -> Vec<ExprToken> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for character in expr.chars() {
        match character {
            '+' | '-' | '*' | '/' => {
                if !current.is_empty() {
                    tokens.push(ExprToken::Ident(std::mem::take(&mut current)));
                }
                tokens.push(ExprToken::Op(character));
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(ExprToken::Ident(std::mem::take(&mut current)));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(ExprToken::Ident(current));
    }
    tokens
}

/// Two-level precedence evaluation (* / bind tighter than + -).
/// Division by zero yields 0, matching the reference tool.
fn eval_expr(tokens: &[ExprToken]) -> Result<f64, String> {
    let mut values: Vec<f64> = Vec::new();
    let mut pending_add: Vec<char> = Vec::new();
    let mut current: Option<f64> = None;
    let mut pending_mul: Option<char> = None;

    let flush = |values: &mut Vec<f64>, current: Option<f64>| -> Result<(), String> {
        match current {
            Some(value) => {
                values.push(value);
                Ok(())
            }
            None => Err("dangling operator".into()),
        }
    };

    for token in tokens {
        match token {
            ExprToken::Number(value) => {
                let value = match pending_mul.take() {
                    Some('*') => current.ok_or("dangling operator")? * value,
                    Some('/') => {
                        let left = current.ok_or("dangling operator")?;
                        if *value == 0.0 {
                            0.0
                        } else {
                            left / value
                        }
                    }
                    _ => {
                        if current.is_some() {
                            return Err("missing operator between values".into());
                        }
                        *value
                    }
                };
                current = Some(value);
            }
            ExprToken::Op(op @ ('*' | '/')) => {
                if pending_mul.is_some() || current.is_none() {
                    return Err("misplaced operator".into());
                }
                pending_mul = Some(*op);
            }
            ExprToken::Op(op) => {
                if pending_mul.is_some() {
                    return Err("misplaced operator".into());
                }
                flush(&mut values, current.take())?;
                pending_add.push(*op);
            }
            ExprToken::Ident(name) => return Err(format!("unresolved token '{name}'")),
        }
    }
    flush(&mut values, current.take())?;

    let mut total = values[0];
    for (op, value) in pending_add.iter().zip(values.iter().skip(1)) {
        match op {
            '+' => total += value,
            '-' => total -= value,
            _ => unreachable!(),
        }
    }
    Ok(total)
}

fn cmd_merge(args: &str, table: Table, work_dir: &Path, lineno: usize) -> Result<Table, String> {
    require_data(&table, lineno, "MERGE")?;
    let Some((path, rest)) = parse_quoted(args) else {
        return Err(fail(lineno, r#"MERGE path must be quoted. Use: MERGE "file.csv" ON column"#));
    };
    if !rest.to_uppercase().starts_with("ON ") {
        return Err(fail(lineno, r#"MERGE syntax: MERGE "file.csv" ON column"#));
    }
    let join_col = rest[3..].trim().to_owned();
    let join_index = check_column(&join_col, &table, lineno)?;

    let resolved = work_dir.join(&path);
    if !resolved.is_file() {
        return Err(fail(
            lineno,
            format!("File not found: \"{path}\" (resolved to {})", resolved.display()),
        ));
    }
    let right = read_csv(&resolved).map_err(|error| fail(lineno, error))?;
    let Some(right_join) = right.column_index(&join_col) else {
        return Err(fail(
            lineno,
            format!("Column '{join_col}' not found in '{path}'. Available: {}", right.available()),
        ));
    };

    let mut columns = table.columns.clone();
    let extra: Vec<(usize, String)> = right
        .columns
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != right_join)
        .map(|(index, name)| (index, name.clone()))
        .collect();
    columns.extend(extra.iter().map(|(_, name)| name.clone()));

    let mut index: HashMap<&str, Vec<&Vec<String>>> = HashMap::new();
    for row in &right.rows {
        index.entry(row[right_join].as_str()).or_default().push(row);
    }

    let mut rows = Vec::new();
    for left_row in &table.rows {
        if let Some(matches) = index.get(left_row[join_index].as_str()) {
            for right_row in matches {
                let mut merged = left_row.clone();
                merged.extend(extra.iter().map(|(index, _)| right_row[*index].clone()));
                rows.push(merged);
            }
        }
    }
    Ok(Table { columns, rows })
}

fn cmd_show(args: &str, table: &Table, lineno: usize, output: &mut String) -> Result<(), String> {
    if table.columns.is_empty() {
        output.push_str("(empty)\n");
        return Ok(());
    }
    let limit = match args.trim() {
        "" => None,
        raw => Some(raw.parse::<usize>().map_err(|_| {
            fail(lineno, format!("SHOW takes an optional integer (row count), got '{raw}'"))
        })?),
    };
    output.push_str(&table.columns.join(","));
    output.push('\n');
    let rows = match limit {
        Some(limit) => &table.rows[..limit.min(table.rows.len())],
        None => &table.rows[..],
    };
    for row in rows {
        output.push_str(&row.join(","));
        output.push('\n');
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Executor tool input shape.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GridtoolArgs {
    /// Full gridtool script; commands run top to bottom, SHOW prints output.
    pub script: String,
}

const FIXTURE_CSV: &str = "\
region,amount,category
north,120,widget
south,80,widget
north,200,gadget
east,50,widget
south,160,gadget
";

const REFERENCE_DOC: &str = "\
# gridtool reference

gridtool is a pipeline CSV processor. It is not SQL.

Commands: LOAD, KEEP, TOSS, TALLY, RANK, PICK, DERIVE, MERGE, SHOW.

Filtering uses word operators only: eq, neq, gt, lt, gte, lte.
Symbol operators like > or != are rejected.

Aggregation: TALLY group_col -> alias=func(agg_col).
Functions are lowercase: sum, count, avg, min, max.
Separate multiple aggregations with commas.

RANK column asc|desc sorts rows. LOAD and MERGE paths must be double-quoted.
";

/// Demo adapter wrapping the gridtool engine behind the Adapter SPI.
#[derive(Debug, Default)]
pub struct GridtoolAdapter {
    work_dir: Option<PathBuf>,
    last_output: Option<String>,
}

impl GridtoolAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolAdapter for GridtoolAdapter {
    fn domain_key(&self) -> String {
        "cli:gridtool".into()
    }

    fn tool_family(&self) -> String {
        "gridtool".into()
    }

    fn tool_spec(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "run_gridtool".into(),
            description: "Run a gridtool script against the task workspace. \
                          Commands execute top to bottom; use SHOW to print results."
                .into(),
            input_schema: serde_json::to_value(schemars::schema_for!(GridtoolArgs))
                .expect("schema serializes"),
        }]
    }

    fn system_prompt_fragment(&self) -> String {
        "You operate gridtool, a pipeline CSV processor with its own command \
         language. It is not SQL. Read error messages carefully: they state \
         the expected syntax. Fixture data lives in sales.csv.\n"
            .into()
    }

    fn bootstrap(&mut self, work_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(work_dir)?;
        std::fs::write(work_dir.join("sales.csv"), FIXTURE_CSV)?;
        let docs_dir = work_dir.join("docs");
        std::fs::create_dir_all(&docs_dir)?;
        std::fs::write(docs_dir.join("gridtool-reference.md"), REFERENCE_DOC)?;
        self.work_dir = Some(work_dir.to_owned());
        Ok(())
    }

    fn execute(&mut self, tool_name: &str, payload: &serde_json::Value) -> ToolOutcome {
        if tool_name != "run_gridtool" {
            return ToolOutcome::error(format!("Unknown tool requested: {tool_name:?}"));
        }
        let Some(work_dir) = self.work_dir.clone() else {
            return ToolOutcome::error("workspace not bootstrapped");
        };
        let script = payload
            .get("script")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        match run_script(script, &work_dir) {
            Ok(output) => {
                let rendered = if output.is_empty() { "(ok)".to_owned() } else { output };
                self.last_output = Some(rendered.clone());
                ToolOutcome::ok(rendered)
            }
            Err(error) => ToolOutcome::error(error),
        }
    }

    fn capture_final_state(&self) -> String {
        match &self.last_output {
            Some(output) => format!("last successful output:\n{output}"),
            None => "no successful tool output captured".into(),
        }
    }

    fn docs_manifest(&self) -> Vec<DomainDoc> {
        let Some(work_dir) = &self.work_dir else {
            return Vec::new();
        };
        vec![DomainDoc {
            doc_id: "gridtool-reference".into(),
            title: "gridtool reference".into(),
            path: work_dir.join("docs").join("gridtool-reference.md"),
            tags: vec!["gridtool".into(), "syntax".into(), "operators".into()],
        }]
    }
}
