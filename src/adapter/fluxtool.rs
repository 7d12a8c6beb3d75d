//! fluxtool: a holdout DSL with remapped command and operator language.
//!
//! fluxtool intentionally renames gridtool syntax so cross-domain transfer
//! can be validated honestly: commands translate to the grid engine, run
//! there, and error/output vocabulary maps back to fluxtool terms. A lesson
//! about gridtool's literal syntax must not help here; a generic lesson
//! (lowercase aggregation functions, word operators) should.

use super::gridtool::run_script;
use super::{DomainDoc, ToolAdapter, ToolOutcome, ToolSpec};

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const COMMAND_TO_GRID: &[(&str, &str)] = &[
    ("IMPORT", "LOAD"),
    ("FILTER", "KEEP"),
    ("EXCLUDE", "TOSS"),
    ("GROUP", "TALLY"),
    ("SORT", "RANK"),
    ("COLUMNS", "PICK"),
    ("COMPUTE", "DERIVE"),
    ("ATTACH", "MERGE"),
    ("DISPLAY", "SHOW"),
];

const OP_TO_GRID: &[(&str, &str)] = &[
    ("is", "eq"),
    ("isnt", "neq"),
    ("above", "gt"),
    ("below", "lt"),
    ("atleast", "gte"),
    ("atmost", "lte"),
];

fn grid_command(flux: &str) -> Option<&'static str> {
    COMMAND_TO_GRID
        .iter()
        .find(|(from, _)| *from == flux)
        .map(|(_, to)| *to)
}

fn flux_error(lineno: usize, message: impl Into<String>) -> String {
    format!("ERROR at line {lineno}: {}", message.into())
}

fn translate_filter(command: &str, args: &str, lineno: usize) -> Result<String, String> {
    let parts: Vec<&str> = args.splitn(3, char::is_whitespace).collect();
    if parts.len() < 3 {
        return Err(flux_error(lineno, format!("{command} syntax: {command} column op value")));
    }
    let (column, op_raw, value) = (parts[0], parts[1], parts[2]);
    let Some((_, grid_op)) = OP_TO_GRID
        .iter()
        .find(|(flux_op, _)| *flux_op == op_raw.to_lowercase())
    else {
        let valid: Vec<&str> = OP_TO_GRID.iter().map(|(flux_op, _)| *flux_op).collect();
        return Err(flux_error(
            lineno,
            format!("{command} unknown operator '{op_raw}'. Valid: {}", valid.join(", ")),
        ));
    };
    let grid = grid_command(command).expect("filter commands are mapped");
    Ok(format!("{grid} {column} {grid_op} {value}"))
}

/// Translate one fluxtool line into the grid dialect.
fn translate_line(line: &str, lineno: usize) -> Result<String, String> {
    let (command_raw, args) = match line.split_once(char::is_whitespace) {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    };
    let command = command_raw.to_uppercase();
    if grid_command(&command).is_none() {
        let known: Vec<&str> = COMMAND_TO_GRID.iter().map(|(from, _)| *from).collect();
        return Err(flux_error(
            lineno,
            format!("Unknown command '{command}'. Valid commands: {}", known.join(", ")),
        ));
    }

    match command.as_str() {
        "IMPORT" => Ok(format!("LOAD {args}")),
        "FILTER" | "EXCLUDE" => translate_filter(&command, args, lineno),
        "GROUP" => {
            // Holdout syntax remaps the arrow token (`=>`) while keeping
            // aggregation semantics equivalent to gridtool TALLY.
            let Some((group_col, aggs)) = args.split_once("=>") else {
                return Err(flux_error(
                    lineno,
                    "GROUP syntax: GROUP group_col => alias=func(col)",
                ));
            };
            Ok(format!("TALLY {} -> {}", group_col.trim(), aggs.trim()))
        }
        "SORT" => {
            let parts: Vec<&str> = args.split_whitespace().collect();
            if parts.len() < 2 {
                return Err(flux_error(lineno, "SORT syntax: SORT column up|down"));
            }
            let direction = match parts[1].to_lowercase().as_str() {
                "up" => "asc",
                "down" => "desc",
                other => {
                    return Err(flux_error(
                        lineno,
                        format!("SORT direction must be 'up' or 'down', got '{other}'"),
                    ))
                }
            };
            Ok(format!("RANK {} {direction}", parts[0]))
        }
        "COLUMNS" => Ok(format!("PICK {args}")),
        "COMPUTE" => {
            let Some((new_col, expr)) = args.split_once(":=") else {
                return Err(flux_error(
                    lineno,
                    "COMPUTE syntax: COMPUTE new_col := expression",
                ));
            };
            Ok(format!("DERIVE {} = {}", new_col.trim(), expr.trim()))
        }
        "ATTACH" => {
            let upper = args.to_uppercase();
            let Some(by_index) = upper.rfind(" BY ") else {
                return Err(flux_error(lineno, r#"ATTACH syntax: ATTACH "file.csv" BY column"#));
            };
            let path_part = args[..by_index].trim();
            let column = args[by_index + 4..].trim();
            Ok(format!("MERGE {path_part} ON {column}"))
        }
        "DISPLAY" => Ok(format!("SHOW {args}").trim().to_owned()),
        _ => unreachable!("command mapped above"),
    }
}

// Whole-word patterns only: a stray substring hit (RELOAD, "reload.csv")
// must never be rewritten, since mapped text feeds straight back into the
// model context and fingerprinting.
static MAP_BACK_COMMANDS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    COMMAND_TO_GRID
        .iter()
        .map(|(flux, grid)| {
            (Regex::new(&format!(r"\b{grid}\b")).expect("hardcoded regex"), *flux)
        })
        .collect()
});

static MAP_BACK_OPS: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    OP_TO_GRID
        .iter()
        .map(|(flux_op, grid_op)| {
            (
                Regex::new(&format!(r"'\b{grid_op}\b'")).expect("hardcoded regex"),
                format!("'{flux_op}'"),
            )
        })
        .collect()
});

/// Map grid vocabulary in engine output/errors back into fluxtool terms.
fn map_back(text: &str) -> String {
    let mut mapped = text.replace("->", "=>");
    for (pattern, flux) in MAP_BACK_COMMANDS.iter() {
        mapped = pattern.replace_all(&mapped, *flux).into_owned();
    }
    for (pattern, replacement) in MAP_BACK_OPS.iter() {
        mapped = pattern.replace_all(&mapped, replacement.as_str()).into_owned();
    }
    mapped
        .replace("(eq/neq/gt/lt/gte/lte)", "(is/isnt/above/below/atleast/atmost)")
        .replace("eq, neq, gt, lt, gte, lte", "is, isnt, above, below, atleast, atmost")
}

fn run_flux_script(script: &str, work_dir: &Path) -> Result<String, String> {
    let mut translated = String::new();
    for (index, raw_line) in script.lines().enumerate() {
        let lineno = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            translated.push('\n');
            continue;
        }
        translated.push_str(&translate_line(line, lineno)?);
        translated.push('\n');
    }
    run_script(&translated, work_dir)
        .map(|output| map_back(&output))
        .map_err(|error| map_back(&error))
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Executor tool input shape.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FluxtoolArgs {
    /// Full fluxtool script; commands run top to bottom, DISPLAY prints output.
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
# fluxtool reference

fluxtool is a pipeline CSV processor. It is not SQL.

Commands: IMPORT, FILTER, EXCLUDE, GROUP, SORT, COLUMNS, COMPUTE, ATTACH, DISPLAY.

Filtering uses word operators only: is, isnt, above, below, atleast, atmost.
Symbol operators like > or != are rejected.

Aggregation: GROUP group_col => alias=func(agg_col).
Functions are lowercase: sum, count, avg, min, max.
Separate multiple aggregations with commas.

COMPUTE new_col := expression derives columns. SORT column up|down sorts
rows. IMPORT and ATTACH paths must be double-quoted.
";

/// Demo adapter for the holdout DSL.
#[derive(Debug, Default)]
pub struct FluxtoolAdapter {
    work_dir: Option<PathBuf>,
    last_output: Option<String>,
}

impl FluxtoolAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolAdapter for FluxtoolAdapter {
    fn domain_key(&self) -> String {
        "cli:fluxtool".into()
    }

    fn tool_family(&self) -> String {
        "fluxtool".into()
    }

    fn tool_spec(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "run_fluxtool".into(),
            description: "Run a fluxtool script against the task workspace. \
                          Commands execute top to bottom; use DISPLAY to print results."
                .into(),
            input_schema: serde_json::to_value(schemars::schema_for!(FluxtoolArgs))
                .expect("schema serializes"),
        }]
    }

    fn system_prompt_fragment(&self) -> String {
        "You operate fluxtool, a pipeline CSV processor with its own command \
         language. It is not SQL and it is not gridtool. Read error messages \
         carefully: they state the expected syntax. Fixture data lives in \
         sales.csv.\n"
            .into()
    }

    fn bootstrap(&mut self, work_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(work_dir)?;
        std::fs::write(work_dir.join("sales.csv"), FIXTURE_CSV)?;
        let docs_dir = work_dir.join("docs");
        std::fs::create_dir_all(&docs_dir)?;
        std::fs::write(docs_dir.join("fluxtool-reference.md"), REFERENCE_DOC)?;
        self.work_dir = Some(work_dir.to_owned());
        Ok(())
    }

    fn execute(&mut self, tool_name: &str, payload: &serde_json::Value) -> ToolOutcome {
        if tool_name != "run_fluxtool" {
            return ToolOutcome::error(format!("Unknown tool requested: {tool_name:?}"));
        }
        let Some(work_dir) = self.work_dir.clone() else {
            return ToolOutcome::error("workspace not bootstrapped");
        };
        let script = payload
            .get("script")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        match run_flux_script(script, &work_dir) {
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
            doc_id: "fluxtool-reference".into(),
            title: "fluxtool reference".into(),
            path: work_dir.join("docs").join("fluxtool-reference.md"),
            tags: vec!["fluxtool".into(), "syntax".into(), "operators".into()],
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lorebot_test_flux_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("sales.csv"), FIXTURE_CSV).unwrap();
        dir
    }

    #[test]
    fn test_import_filter_display() {
        let dir = workspace();
        let output = run_flux_script(
            "IMPORT \"sales.csv\"\nFILTER amount above 100\nDISPLAY",
            &dir,
        )
        .unwrap();
        assert!(output.contains("north,120,widget"));
        assert!(!output.contains("east,50,widget"));
    }

    #[test]
    fn test_group_uses_fat_arrow() {
        let dir = workspace();
        let output = run_flux_script(
            "IMPORT \"sales.csv\"\nGROUP region => total=sum(amount)\nDISPLAY",
            &dir,
        )
        .unwrap();
        assert!(output.contains("north,320"));

        let error = run_flux_script(
            "IMPORT \"sales.csv\"\nGROUP region -> total=sum(amount)",
            &dir,
        )
        .unwrap_err();
        assert!(error.contains("GROUP syntax"), "{error}");
        assert!(error.contains("=>"), "{error}");
    }

    #[test]
    fn test_uppercase_function_error_survives_mapping() {
        let dir = workspace();
        let error = run_flux_script(
            "IMPORT \"sales.csv\"\nGROUP region => total=SUM(amount)",
            &dir,
        )
        .unwrap_err();
        assert!(error.contains("Unknown function 'SUM'"), "{error}");
        assert!(error.contains("lowercase"), "{error}");
    }

    #[test]
    fn test_gridtool_operator_rejected_with_flux_vocabulary() {
        let dir = workspace();
        let error = run_flux_script(
            "IMPORT \"sales.csv\"\nFILTER amount gt 100",
            &dir,
        )
        .unwrap_err();
        assert!(error.contains("unknown operator 'gt'"), "{error}");
        assert!(error.contains("above"), "{error}");
    }

    #[test]
    fn test_sort_direction_words() {
        let dir = workspace();
        let output = run_flux_script(
            "IMPORT \"sales.csv\"\nSORT amount down\nDISPLAY 1",
            &dir,
        )
        .unwrap();
        assert!(output.contains("north,200,gadget"));

        let error = run_flux_script("IMPORT \"sales.csv\"\nSORT amount desc", &dir).unwrap_err();
        assert!(error.contains("'up' or 'down'"), "{error}");
    }

    #[test]
    fn test_unknown_command_lists_flux_commands() {
        let dir = workspace();
        let error = run_flux_script("TALLY region => a=sum(amount)", &dir).unwrap_err();
        assert!(error.contains("Unknown command 'TALLY'"), "{error}");
        assert!(error.contains("GROUP"), "{error}");
    }

    #[test]
    fn test_map_back_leaves_substring_tokens_alone() {
        let mapped = map_back("Column 'RELOAD' not found. Use SHOW after LOAD.");
        assert!(mapped.contains("'RELOAD'"), "{mapped}");
        assert!(mapped.contains("DISPLAY after IMPORT"), "{mapped}");

        let mapped = map_back(r#"File not found: "reload.csv""#);
        assert!(mapped.contains(r#""reload.csv""#), "{mapped}");
    }

    #[test]
    fn test_docs_manifest_available_after_bootstrap() {
        let dir = workspace();
        let mut adapter = FluxtoolAdapter::new();
        assert!(adapter.docs_manifest().is_empty());
        adapter.bootstrap(&dir).unwrap();

        let docs = adapter.docs_manifest();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_id, "fluxtool-reference");
        let text = std::fs::read_to_string(&docs[0].path).unwrap();
        assert!(text.contains("GROUP group_col => alias=func(agg_col)"));
        assert!(text.contains("is, isnt, above, below, atleast, atmost"));
    }

    #[test]
    fn test_compute_and_attach_translate() {
        let dir = workspace();
        std::fs::write(dir.join("labels.csv"), "region,label\nnorth,N\nsouth,S\n").unwrap();
        let output = run_flux_script(
            "IMPORT \"sales.csv\"\nCOMPUTE boosted := amount + 10\nATTACH \"labels.csv\" BY region\nCOLUMNS region, boosted, label\nDISPLAY",
            &dir,
        )
        .unwrap();
        assert!(output.contains("north,130,N"), "{output}");
    }
}
