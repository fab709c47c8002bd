//! Command-line interface of the `tableflow` runner.

use clap::{Arg, ArgAction, Command};
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use tableflow_plugins::SortDirection;

/// `COL[:asc|desc]`, where `COL` is a header or a column index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub direction: SortDirection,
}

impl FromStr for SortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((column, suffix)) = s.rsplit_once(':') {
            if let Ok(direction) = suffix.parse::<SortDirection>() {
                if column.is_empty() {
                    return Err(format!("missing column in sort: {}", s));
                }
                return Ok(Self {
                    column: column.to_string(),
                    direction,
                });
            }
        }
        if s.is_empty() {
            return Err("missing column in sort".to_string());
        }
        Ok(Self {
            column: s.to_string(),
            direction: SortDirection::Asc,
        })
    }
}

/// `ROW:COL=VALUE`: writes `VALUE` into data row `ROW` of column `COL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellEdit {
    pub row: usize,
    pub column: String,
    pub value: String,
}

impl FromStr for CellEdit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ROW:COL=VALUE, got {}", s))?;
        let (row, column) = target
            .split_once(':')
            .ok_or_else(|| format!("expected ROW:COL=VALUE, got {}", s))?;
        let row = row
            .trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid row {:?}: {}", row, e))?;
        if column.is_empty() {
            return Err(format!("missing column in {}", s));
        }
        Ok(Self {
            row,
            column: column.to_string(),
            value: value.to_string(),
        })
    }
}

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// JSON file holding the table (`id`, `headers`, `rows`)
    pub table_path: PathBuf,
    /// Path to the settings file
    pub config_path: PathBuf,
    pub sort: Option<SortSpec>,
    pub filter: Option<String>,
    /// Columns to hide, by header or index
    pub hide: Vec<String>,
    /// Edits applied through the edit plugin, in order
    pub edits: Vec<CellEdit>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Print the metrics report to stderr when done
    pub report: bool,
}

impl CliArgs {
    fn command() -> Command {
        Command::new("tableflow")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Applies TableFlow plugins to a JSON table and prints the visible rows")
            .arg(
                Arg::new("table")
                    .short('t')
                    .long("table")
                    .value_name("FILE")
                    .help("Table JSON file")
                    .required(true),
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Settings file path")
                    .default_value("tableflow.toml"),
            )
            .arg(
                Arg::new("sort")
                    .short('s')
                    .long("sort")
                    .value_name("COL[:desc]")
                    .help("Sort by a column")
                    .value_parser(|s: &str| s.parse::<SortSpec>()),
            )
            .arg(
                Arg::new("filter")
                    .short('f')
                    .long("filter")
                    .value_name("QUERY")
                    .help("Keep rows containing QUERY"),
            )
            .arg(
                Arg::new("hide")
                    .long("hide")
                    .value_name("COL")
                    .help("Hide a column (repeatable)")
                    .action(ArgAction::Append),
            )
            .arg(
                Arg::new("set")
                    .long("set")
                    .value_name("ROW:COL=VALUE")
                    .help("Edit a cell before filtering and sorting (repeatable)")
                    .action(ArgAction::Append)
                    .value_parser(|s: &str| s.parse::<CellEdit>()),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("report")
                    .long("report")
                    .help("Print the metrics report to stderr")
                    .action(ArgAction::SetTrue),
            )
    }

    /// Parses the process arguments.
    pub fn try_parse() -> Result<Self, clap::Error> {
        Self::parse_from(std::env::args_os())
    }

    pub fn parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;

        Ok(Self {
            table_path: matches
                .get_one::<String>("table")
                .map(PathBuf::from)
                .unwrap_or_default(),
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tableflow.toml")),
            sort: matches.get_one::<SortSpec>("sort").cloned(),
            filter: matches.get_one::<String>("filter").cloned(),
            hide: matches
                .get_many::<String>("hide")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            edits: matches
                .get_many::<CellEdit>("set")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            report: matches.get_flag("report"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_spec_parsing() {
        assert_eq!(
            "age:desc".parse::<SortSpec>().unwrap(),
            SortSpec {
                column: "age".into(),
                direction: SortDirection::Desc
            }
        );
        assert_eq!("age".parse::<SortSpec>().unwrap().direction, SortDirection::Asc);
        // A colon that is not a direction belongs to the header
        assert_eq!("time:zone".parse::<SortSpec>().unwrap().column, "time:zone");
        assert!(":desc".parse::<SortSpec>().is_err());
    }

    #[test]
    fn test_cell_edit_parsing() {
        assert_eq!(
            "2:email=ada@example.com".parse::<CellEdit>().unwrap(),
            CellEdit {
                row: 2,
                column: "email".into(),
                value: "ada@example.com".into()
            }
        );
        assert_eq!("0:1=".parse::<CellEdit>().unwrap().value, "");
        assert!("x:email=1".parse::<CellEdit>().is_err());
        assert!("2:email".parse::<CellEdit>().is_err());
    }

    #[test]
    fn test_parse_arguments() {
        let args = CliArgs::parse_from([
            "tableflow",
            "--table",
            "people.json",
            "--sort",
            "name:desc",
            "--hide",
            "email",
            "--hide",
            "2",
            "--set",
            "0:age=37",
            "--json-logs",
        ])
        .unwrap();

        assert_eq!(args.table_path, PathBuf::from("people.json"));
        assert_eq!(args.config_path, PathBuf::from("tableflow.toml"));
        assert_eq!(args.sort.unwrap().direction, SortDirection::Desc);
        assert_eq!(args.hide, vec!["email", "2"]);
        assert_eq!(args.edits.len(), 1);
        assert!(args.json_logs);
        assert!(!args.report);
        assert!(args.filter.is_none());
    }

    #[test]
    fn test_table_is_required() {
        assert!(CliArgs::parse_from(["tableflow"]).is_err());
        assert!(CliArgs::parse_from(["tableflow", "--table", "t.json", "--set", "bad"]).is_err());
    }
}
