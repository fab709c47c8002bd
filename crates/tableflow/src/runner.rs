//! Drives one table through the plugins selected on the command line.

use crate::cli::CliArgs;
use anyhow::{anyhow, bail, Context};
use std::path::Path;
use std::sync::Arc;
use tableflow_core::{CellRef, HostTable, MemoryTable, RuntimeSettings, TableData, TableInstance};
use tableflow_plugins::{
    install_from_settings, EditPlugin, FilterPlugin, HidePlugin, OperationOutcome, SortPlugin,
};
use tracing::{debug, info, warn};

/// Table contents after every requested operation ran.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Metrics report of the run
    pub report: String,
}

impl RunOutput {
    /// Header line followed by one line per visible row, tab separated.
    pub fn to_tsv(&self) -> String {
        let mut out = self.headers.join("\t");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        out
    }
}

pub async fn load_table(path: &Path) -> anyhow::Result<TableData> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read table {}", path.display()))?;
    let data: TableData = serde_json::from_str(&content)
        .with_context(|| format!("invalid table file {}", path.display()))?;
    if data.headers.is_empty() {
        bail!("table {} has no headers", path.display());
    }
    Ok(data)
}

/// Header name or column index.
fn resolve_column(table: &dyn HostTable, column: &str) -> anyhow::Result<usize> {
    table
        .column_index(column)
        .or_else(|| {
            column
                .parse::<usize>()
                .ok()
                .filter(|&index| index < table.column_count())
        })
        .ok_or_else(|| anyhow!("unknown column: {}", column))
}

fn require<T>(plugin: Option<T>, name: &str, flag: &str) -> anyhow::Result<T> {
    plugin.ok_or_else(|| anyhow!("{} requires the {} plugin to be enabled", flag, name))
}

fn check_outcome(outcome: OperationOutcome, operation: &str) -> anyhow::Result<()> {
    match outcome {
        OperationOutcome::Applied => Ok(()),
        OperationOutcome::Skipped => {
            debug!("{} had no effect", operation);
            Ok(())
        }
        OperationOutcome::Vetoed(reason) => Err(anyhow!(
            "{} rejected: {}",
            operation,
            reason.unwrap_or_else(|| "vetoed by a hook".to_string())
        )),
    }
}

/// Applies edits, hidden columns, the filter and the sort, in that order.
///
/// Once the plugins are initialized the instance is destroyed before
/// returning, whether or not an operation failed.
pub async fn run(
    args: &CliArgs,
    settings: RuntimeSettings,
    data: TableData,
) -> anyhow::Result<RunOutput> {
    let table = Arc::new(MemoryTable::from_data(data));
    let instance = TableInstance::builder(table.clone())
        .settings(settings.clone())
        .build();

    install_from_settings(&instance, &settings)?;
    instance.init().await?;
    info!(
        "Running table {} with plugins {:?}",
        table.id(),
        instance.plugin_names()
    );

    let result = apply(args, &instance, table.as_ref()).await;
    let report = instance.context().metrics().performance_report();
    instance.destroy().await;
    result?;

    Ok(RunOutput {
        headers: table.visible_headers(),
        rows: table.visible_rows(),
        report,
    })
}

async fn apply(args: &CliArgs, instance: &TableInstance, table: &dyn HostTable) -> anyhow::Result<()> {
    if !args.edits.is_empty() {
        let edit = require(instance.plugin::<EditPlugin>("edit"), "edit", "--set")?;
        for change in &args.edits {
            let column = resolve_column(table, &change.column)?;
            let cell = CellRef::new(change.row, column);
            let outcome = edit.save(cell, &change.value).await?;
            check_outcome(outcome, &format!("edit of {}", cell))?;
        }
    }

    if !args.hide.is_empty() {
        let hide = require(instance.plugin::<HidePlugin>("hide"), "hide", "--hide")?;
        for column in &args.hide {
            let index = resolve_column(table, column)?;
            let outcome = hide.hide_column(index).await?;
            check_outcome(outcome, &format!("hiding {}", column))?;
        }
    }

    if let Some(query) = &args.filter {
        let filter = require(instance.plugin::<FilterPlugin>("filter"), "filter", "--filter")?;
        check_outcome(filter.apply(query).await?, "filter")?;
    }

    if let Some(spec) = &args.sort {
        let sort = require(instance.plugin::<SortPlugin>("sort"), "sort", "--sort")?;
        let column = resolve_column(table, &spec.column)?;
        check_outcome(sort.sort_by(column, spec.direction).await?, "sort")?;
    }

    if args.edits.is_empty() && args.hide.is_empty() && args.filter.is_none() && args.sort.is_none() {
        warn!("No operations requested; printing the table unchanged");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tableflow_core::ValidationRule;

    fn data() -> TableData {
        TableData {
            id: "people".into(),
            headers: vec!["name".into(), "age".into(), "email".into()],
            rows: vec![
                vec!["Grace".into(), "85".into(), "grace@example.com".into()],
                vec!["Ada".into(), "36".into(), "ada@example.com".into()],
                vec!["Alan".into(), "41".into(), "alan@example.com".into()],
            ],
        }
    }

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["tableflow", "--table", "people.json"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn test_run_sort_filter_hide() {
        let output = run(
            &args(&["--sort", "age:desc", "--filter", "a", "--hide", "email"]),
            RuntimeSettings::default(),
            data(),
        )
        .await
        .unwrap();

        assert_eq!(output.headers, vec!["name", "age"]);
        assert_eq!(
            output.rows,
            vec![
                vec!["Grace".to_string(), "85".to_string()],
                vec!["Alan".to_string(), "41".to_string()],
                vec!["Ada".to_string(), "36".to_string()],
            ]
        );
        assert_eq!(output.to_tsv(), "name\tage\nGrace\t85\nAlan\t41\nAda\t36\n");
        assert!(output.report.contains("sort.applied"));
    }

    #[tokio::test]
    async fn test_run_applies_edits_before_sorting() {
        let output = run(
            &args(&["--set", "1:age=99", "--sort", "1"]),
            RuntimeSettings::default(),
            data(),
        )
        .await
        .unwrap();

        let names: Vec<&str> = output.rows.iter().map(|row| row[0].as_str()).collect();
        assert_eq!(names, vec!["Alan", "Grace", "Ada"]);
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_edit() {
        let mut settings = RuntimeSettings::default();
        settings.plugins.validation_rules.insert(
            "age".into(),
            ValidationRule {
                rule_type: "integer".into(),
                required: true,
            },
        );

        let err = run(&args(&["--set", "0:age=old"]), settings, data())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn test_run_requires_enabled_plugin() {
        let mut settings = RuntimeSettings::default();
        settings.plugins.enabled = vec!["filter".into()];

        let err = run(&args(&["--sort", "name"]), settings, data())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sort plugin"));
    }

    #[tokio::test]
    async fn test_run_unknown_column() {
        let err = run(&args(&["--hide", "salary"]), RuntimeSettings::default(), data())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown column"));
    }

    #[tokio::test]
    async fn test_load_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"id":"t","headers":["a","b"],"rows":[["1"],["2","3","4"]]}}"#
        )
        .unwrap();

        let data = load_table(file.path()).await.unwrap();
        assert_eq!(data.headers, vec!["a", "b"]);
        assert_eq!(data.rows.len(), 2);

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        write!(empty, r#"{{"id":"t","headers":[]}}"#).unwrap();
        assert!(load_table(empty.path()).await.is_err());
        assert!(load_table(Path::new("/nonexistent/table.json")).await.is_err());
    }
}
