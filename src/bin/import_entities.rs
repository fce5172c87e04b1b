use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use bismuth_import::store::{PgDocStore, PgDocWriter, run_migrations};
use bismuth_import::{
    CounterLog, DocMap, EntityImporter, ExternalRecord, ImportConfig, RecordSource, StoreError,
};

#[derive(Parser, Debug)]
#[command(
    name = "import_entities",
    about = "Import a JSON-lines entity dump into the document store"
)]
struct Args {
    /// Path to a JSON-lines file, one external record per line.
    #[arg(long)]
    input: PathBuf,

    /// Field holding the external identifier.
    #[arg(long, default_value = "id")]
    id_field: String,

    /// Optional field holding the record version (integer).
    #[arg(long)]
    version_field: Option<String>,
}

struct JsonLinesSource {
    lines: Lines<BufReader<File>>,
    id_field: String,
    version_field: Option<String>,
    line_no: usize,
}

impl RecordSource for JsonLinesSource {
    async fn next_record(&mut self) -> Result<Option<ExternalRecord>, StoreError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|err| StoreError::backend(format!("read failed: {err}")))?;
            let Some(line) = line else { return Ok(None) };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let fields: serde_json::Value = serde_json::from_str(&line).map_err(|err| {
                StoreError::backend(format!("line {}: invalid JSON: {}", self.line_no, err))
            })?;

            let external_id = match &fields[self.id_field.as_str()] {
                serde_json::Value::String(value) => value.clone(),
                serde_json::Value::Number(value) => value.to_string(),
                _ => {
                    return Err(StoreError::backend(format!(
                        "line {}: missing '{}' field",
                        self.line_no, self.id_field
                    )));
                }
            };
            let version = self
                .version_field
                .as_deref()
                .and_then(|field| fields[field].as_i64());

            return Ok(Some(ExternalRecord {
                external_id,
                version,
                fields,
            }));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bismuth_import::init_logger();
    let args = Args::parse();
    let cfg = ImportConfig::from_env();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections((cfg.concurrency_limit + 2) as u32)
        .connect(&database_url)
        .await?;

    run_migrations(&pool).await?;

    let counters = CounterLog::with_log_sink();
    let doc_map = Arc::new(DocMap::new(PgDocStore::new(pool.clone()), counters.clone()));
    let writer = PgDocWriter::new(pool);

    let (importer, mut flush_errors) = EntityImporter::new(cfg, doc_map, writer, counters);
    tokio::spawn(async move {
        while let Some(err) = flush_errors.recv().await {
            log::error!("{}", err);
        }
    });

    let file = File::open(&args.input).await?;
    let source = JsonLinesSource {
        lines: BufReader::new(file).lines(),
        id_field: args.id_field,
        version_field: args.version_field,
        line_no: 0,
    };

    let result = importer.run(source).await;
    importer.shutdown();

    match result {
        Ok(report) => {
            println!(
                "imported {} of {} records ({} stale-skipped, {} failed transforms, {} dropped){}",
                report.imported,
                report.records_read,
                report.skipped_stale,
                report.transform_failed,
                report.dropped,
                if report.drained { "" } else { " [drain timed out]" }
            );
            Ok(())
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}
